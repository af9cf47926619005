//! # Service Discovery
//!
//! Resolves a service name to an endpoint.
//!
//! - `LocalDiscovery`: endpoints living in this process, by name.
//! - `RemoteDiscovery`: connection parameters of services elsewhere, persisted
//!   outside the process and versioned. Implemented by `StoreDiscovery` (a
//!   hierarchical coordination store) and `StaticDiscovery` (a fixed map).
//! - `CompositeDiscovery`: local first, then remote; remote hits are turned
//!   into proxies and cached locally until the registry changes.

use std::sync::Arc;

use crate::ServiceName;
use crate::transport::ConnectionParams;

pub mod composite;
pub mod local;
pub mod memory_store;
pub mod static_map;
pub mod store;
pub mod version;

pub use composite::CompositeDiscovery;
pub use composite::ProxyFactory;
pub use local::LocalDiscovery;
pub use memory_store::MemoryStore;
pub use static_map::StaticDiscovery;
pub use store::CoordinationStore;
pub use store::CreateMode;
pub use store::NodeEvent;
pub use store::StoreDiscovery;
pub use version::VersionFilter;
pub use version::VersionOrder;
pub use version::is_valid_version;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The coordination store failed.
    Store(String),
    NodeExists(String),
    NoNode(String),
    /// The store session is not connected.
    NotConnected,
    Decode(String),
    Encode(String),
    InvalidVersion(String),
    Config(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(msg) => write!(f, "Store failure: {}", msg),
            Self::NodeExists(path) => write!(f, "Node already exists: {}", path),
            Self::NoNode(path) => write!(f, "No such node: {}", path),
            Self::NotConnected => write!(f, "Store session is not connected"),
            Self::Decode(msg) => write!(f, "Failed to decode registry entry: {}", msg),
            Self::Encode(msg) => write!(f, "Failed to encode registry entry: {}", msg),
            Self::InvalidVersion(v) => write!(f, "Invalid version {:?}", v),
            Self::Config(msg) => write!(f, "Invalid discovery configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One registration of a service in a remote registry.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryEntry {
    /// Where the entry lives, e.g. `/endpoints/a/b/1.0.0/config_0000000003`.
    pub path: String,
    pub version: String,
    pub sequence: u64,
    pub params: ConnectionParams,
}

/// Handle of a registered watch.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct WatchId(pub u64);

pub type WatchCallback = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// Registry of services living outside this process.
#[async_trait::async_trait]
pub trait RemoteDiscovery: Send + Sync + 'static {
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Releases every watch and ends the registry session.
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Publishes `params` for (`name`, `version`).
    async fn register(&self, name: &ServiceName, version: &str, params: &ConnectionParams) -> Result<RegistryEntry>;

    async fn deregister(&self, entry: &RegistryEntry) -> Result<()>;

    /// The most recent entry of the greatest matching version, if any.
    async fn find_remote_endpoint(&self, name: &ServiceName, filter: &VersionFilter) -> Result<Option<RegistryEntry>>;

    /// Calls `callback` whenever the registry below `name` changes.
    fn watch(&self, name: &ServiceName, callback: WatchCallback) -> WatchId;

    fn unwatch(&self, id: WatchId) -> bool;
}
