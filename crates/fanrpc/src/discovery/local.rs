//! In-process endpoint registry.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::Endpoint;
use crate::EndpointKind;
use crate::ServiceName;

/// Endpoints living in this process, by name. Registration overwrites.
#[derive(Default)]
pub struct LocalDiscovery {
    endpoints: DashMap<ServiceName, Arc<Endpoint>>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: Arc<Endpoint>) {
        debug!(name = %endpoint.name(), kind = endpoint.kind_name(), "registered locally");
        self.endpoints.insert(endpoint.name().clone(), endpoint);
    }

    pub fn find_endpoint(&self, name: &ServiceName) -> Option<Arc<Endpoint>> {
        self.endpoints.get(name).map(|e| e.value().clone())
    }

    pub fn deregister(&self, name: &ServiceName) -> Option<Arc<Endpoint>> {
        self.endpoints.remove(name).map(|(_, e)| e)
    }

    /// Removes `name` only if it still maps to exactly `endpoint`.
    pub fn deregister_if(&self, name: &ServiceName, endpoint: &Endpoint) -> bool {
        self.endpoints
            .remove_if(name, |_, cached| std::ptr::eq(Arc::as_ptr(cached), endpoint))
            .is_some()
    }

    /// Removes `name` only if it maps to a proxy.
    pub fn deregister_proxy(&self, name: &ServiceName) -> bool {
        self.endpoints
            .remove_if(name, |_, cached| matches!(cached.kind(), EndpointKind::Proxy { .. }))
            .is_some()
    }

    pub fn contains(&self, name: &ServiceName) -> bool {
        self.endpoints.contains_key(name)
    }

    pub fn names(&self) -> Vec<ServiceName> {
        self.endpoints.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
