//! Registry backed by a fixed configuration map, for deployments without a
//! coordination store.
//!
//! ```json
//! {"proxy_endpoints": [
//!     {"endpoint": "billing", "transport": "http", "params": {"host": "billing", "port": 80}}
//! ]}
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::ServiceName;
use crate::discovery::Error;
use crate::discovery::RegistryEntry;
use crate::discovery::RemoteDiscovery;
use crate::discovery::Result;
use crate::discovery::VersionFilter;
use crate::discovery::VersionOrder;
use crate::discovery::WatchCallback;
use crate::discovery::WatchId;
use crate::discovery::is_valid_version;
use crate::service::DEFAULT_VERSION;
use crate::transport::ConnectionParams;

#[derive(Debug, Deserialize)]
struct ProxyRecord {
    endpoint: String,
    transport: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

#[derive(Debug, Default, Deserialize)]
struct StaticConfig {
    #[serde(default)]
    proxy_endpoints: Vec<ProxyRecord>,
}

/// A remote registry held in memory. Watches are accepted and never fire.
#[derive(Default)]
pub struct StaticDiscovery {
    entries: DashMap<ServiceName, Vec<RegistryEntry>>,
    order: VersionOrder,
    next_sequence: AtomicU64,
    next_watch: AtomicU64,
}

impl StaticDiscovery {
    pub fn new(order: VersionOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Loads `{"proxy_endpoints": [{endpoint, transport, params, version?}]}`.
    pub fn from_json(config: &Value, order: VersionOrder) -> Result<Self> {
        let config: StaticConfig =
            serde_json::from_value(config.clone()).map_err(|e| Error::Config(e.to_string()))?;
        let discovery = Self::new(order);
        for record in config.proxy_endpoints {
            let name = ServiceName::parse(&record.endpoint).map_err(|e| Error::Config(e.to_string()))?;
            let mut params = ConnectionParams::new(record.transport);
            for (key, value) in record.params {
                params.insert(key, value);
            }
            discovery.insert(&name, &record.version, &params)?;
        }
        Ok(discovery)
    }

    fn insert(&self, name: &ServiceName, version: &str, params: &ConnectionParams) -> Result<RegistryEntry> {
        if !is_valid_version(version) {
            return Err(Error::InvalidVersion(version.to_string()));
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let entry = RegistryEntry {
            path: format!("/endpoints/{}/{}/config_{:010}", name.as_path(), version, sequence),
            version: version.to_string(),
            sequence,
            params: params.clone(),
        };
        self.entries.entry(name.clone()).or_default().push(entry.clone());
        Ok(entry)
    }
}

#[async_trait::async_trait]
impl RemoteDiscovery for StaticDiscovery {
    async fn register(&self, name: &ServiceName, version: &str, params: &ConnectionParams) -> Result<RegistryEntry> {
        let entry = self.insert(name, version, params)?;
        debug!(service = %name, version, "registered in static registry");
        Ok(entry)
    }

    async fn deregister(&self, entry: &RegistryEntry) -> Result<()> {
        for mut entries in self.entries.iter_mut() {
            entries.retain(|e| e.path != entry.path);
        }
        Ok(())
    }

    async fn find_remote_endpoint(&self, name: &ServiceName, filter: &VersionFilter) -> Result<Option<RegistryEntry>> {
        let Some(entries) = self.entries.get(name) else {
            return Ok(None);
        };
        let Some(version) = self.order.latest(entries.iter().map(|e| e.version.as_str()), filter) else {
            return Ok(None);
        };
        Ok(entries
            .iter()
            .filter(|e| e.version == version)
            .max_by_key(|e| e.sequence)
            .cloned())
    }

    fn watch(&self, _name: &ServiceName, _callback: WatchCallback) -> WatchId {
        WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed))
    }

    fn unwatch(&self, _id: WatchId) -> bool {
        true
    }
}
