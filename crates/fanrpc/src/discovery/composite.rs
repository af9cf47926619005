//! # Composite Discovery
//!
//! Local first, then remote. A remote hit is materialized into a proxy
//! endpoint, cached, and watched: any change to the service's registry
//! entries evicts the cached proxies so the next call resolves again.
//!
//! A proxy resolved without a version filter is the latest version and lives
//! in the local registry. A proxy resolved under a filter is cached under that
//! filter only, so it never answers an unfiltered lookup. A local hit serves a
//! filtered lookup only when its version matches the filter.
//!
//! Concurrent first lookups of the same name may both materialize a proxy; the
//! last one cached wins and both are usable.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use tracing::info;

use crate::Endpoint;
use crate::EndpointKind;
use crate::ServiceName;
use crate::discovery::LocalDiscovery;
use crate::discovery::RegistryEntry;
use crate::discovery::RemoteDiscovery;
use crate::discovery::VersionFilter;
use crate::discovery::WatchCallback;
use crate::discovery::WatchId;
use crate::discovery::store::NodeEvent;

/// Turns registry parameters into a started proxy endpoint.
#[async_trait]
pub trait ProxyFactory: Send + Sync {
    async fn materialize(&self, name: &ServiceName, entry: &RegistryEntry) -> crate::Result<Arc<Endpoint>>;
}

pub struct CompositeDiscovery {
    local: Arc<LocalDiscovery>,
    remote: Arc<dyn RemoteDiscovery>,
    pinned: Arc<DashMap<(ServiceName, VersionFilter), Arc<Endpoint>>>,
    evictions: Arc<DashMap<ServiceName, WatchId>>,
}

impl CompositeDiscovery {
    pub fn new(remote: Arc<dyn RemoteDiscovery>) -> Self {
        Self {
            local: Arc::new(LocalDiscovery::new()),
            remote,
            pinned: Arc::new(DashMap::new()),
            evictions: Arc::new(DashMap::new()),
        }
    }

    pub fn local(&self) -> &LocalDiscovery {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteDiscovery> {
        &self.remote
    }

    pub async fn start(&self) -> crate::Result<()> {
        self.remote.on_start().await?;
        Ok(())
    }

    /// Drops every eviction watch and disconnects the remote registry.
    pub async fn stop(&self) -> crate::Result<()> {
        let ids: Vec<WatchId> = self.evictions.iter().map(|e| *e.value()).collect();
        self.evictions.clear();
        self.pinned.clear();
        for id in ids {
            self.remote.unwatch(id);
        }
        self.remote.on_stop().await?;
        Ok(())
    }

    pub async fn find_endpoint(
        &self,
        factory: &dyn ProxyFactory,
        name: &ServiceName,
        filter: &VersionFilter,
    ) -> crate::Result<Option<Arc<Endpoint>>> {
        if let Some(endpoint) = self.local.find_endpoint(name) {
            if filter.matches(endpoint.version()) {
                return Ok(Some(endpoint));
            }
            debug!(service = %name, version = endpoint.version(), ?filter, "local endpoint does not match filter");
        }
        let key = (name.clone(), filter.clone());
        if let Some(proxy) = self.pinned.get(&key) {
            return Ok(Some(proxy.value().clone()));
        }

        let Some(entry) = self.remote.find_remote_endpoint(name, filter).await? else {
            debug!(service = %name, ?filter, "not found in any registry");
            return Ok(None);
        };

        let proxy = factory.materialize(name, &entry).await?;
        if *filter == VersionFilter::Any {
            self.local.register(proxy.clone());
        } else {
            self.pinned.insert(key, proxy.clone());
        }
        self.watch_for_eviction(name);
        info!(service = %name, version = %entry.version, sequence = entry.sequence, ?filter, "cached proxy");
        Ok(Some(proxy))
    }

    /// Registers locally, and in the remote registry when the endpoint serves
    /// a service over a transport.
    pub async fn register(&self, endpoint: &Arc<Endpoint>) -> crate::Result<Option<RegistryEntry>> {
        self.local.register(endpoint.clone());
        if let EndpointKind::Remote { service, transport } = endpoint.kind() {
            let entry = self.remote.register(endpoint.name(), service.version(), transport.params()).await?;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    pub async fn deregister(&self, endpoint: &Endpoint, entry: Option<&RegistryEntry>) -> crate::Result<()> {
        self.local.deregister_if(endpoint.name(), endpoint);
        if let Some(entry) = entry {
            self.remote.deregister(entry).await?;
        }
        Ok(())
    }

    /// Name of services with a cached proxy under watch.
    pub fn watched(&self) -> Vec<ServiceName> {
        self.evictions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of proxies cached under a version filter.
    pub fn pinned_len(&self) -> usize {
        self.pinned.len()
    }

    fn watch_for_eviction(&self, name: &ServiceName) {
        if self.evictions.contains_key(name) {
            return;
        }
        let local = Arc::downgrade(&self.local);
        let pinned = Arc::downgrade(&self.pinned);
        let evictions = Arc::downgrade(&self.evictions);
        let remote = Arc::downgrade(&self.remote);
        let key = name.clone();

        let callback: WatchCallback = Arc::new(move |event: &NodeEvent| {
            if let (Some(evictions), Some(remote)) = (evictions.upgrade(), remote.upgrade()) {
                if let Some((_, id)) = evictions.remove(&key) {
                    remote.unwatch(id);
                }
            }
            if let Some(pinned) = pinned.upgrade() {
                pinned.retain(|(service, _), _| *service != key);
            }
            if let Some(local) = local.upgrade() {
                if local.deregister_proxy(&key) {
                    info!(service = %key, path = event.path(), "registry changed, evicted cached proxy");
                }
            }
        });

        let id = self.remote.watch(name, callback);
        if let Some(previous) = self.evictions.insert(name.clone(), id) {
            self.remote.unwatch(previous);
        }
    }
}
