//! # Store-Backed Registry
//!
//! `StoreDiscovery` keeps the remote registry in a hierarchical coordination
//! store (ZooKeeper style):
//!
//! ```text
//! <root>/<service>/<...>/<version>/config_<seq>   ephemeral, sequenced
//! <root>/<service>/<...>/<version>/barrier        registration barrier
//! ```
//!
//! Entries are ephemeral, so a registrant that loses its session disappears
//! from the registry. Readers pick the greatest version, then the greatest
//! sequence number under it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::RegistryConfig;
use crate::ServiceName;
use crate::discovery::Error;
use crate::discovery::RegistryEntry;
use crate::discovery::RemoteDiscovery;
use crate::discovery::Result;
use crate::discovery::VersionFilter;
use crate::discovery::WatchCallback;
use crate::discovery::WatchId;
use crate::discovery::is_valid_version;
use crate::transport::ConnectionParams;

pub const CONFIG_PREFIX: &str = "config_";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral, with a 10-digit sequence number appended to the name.
    EphemeralSequential,
}

/// A change below some path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Created(String),
    DataChanged(String),
    Deleted(String),
}

impl NodeEvent {
    pub fn path(&self) -> &str {
        match self {
            Self::Created(p) | Self::DataChanged(p) | Self::Deleted(p) => p,
        }
    }
}

/// Held while a barrier is passed; dropping it lets the next holder through.
pub type BarrierGuard = Box<dyn Send + Sync>;

/// A hierarchical coordination store session.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    /// Ends the session; its ephemeral nodes are removed.
    async fn close(&self) -> Result<()>;

    /// Creates a node and returns its actual path.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// `None` if the node does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Names of the direct children, or `None` if the node does not exist.
    async fn children(&self, path: &str) -> Result<Option<Vec<String>>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Waits until no one else holds the barrier at `path`.
    async fn barrier(&self, path: &str) -> Result<BarrierGuard>;

    /// Change notifications for the whole tree.
    fn events(&self) -> broadcast::Receiver<NodeEvent>;

    /// Creates `path` and its ancestors as persistent containers, tolerating
    /// nodes that already exist.
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Vec::new(), CreateMode::Persistent).await {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub(crate) struct Watch {
    pub(crate) path: String,
    pub(crate) callback: WatchCallback,
}

/// Remote registry persisted in a `CoordinationStore`.
pub struct StoreDiscovery<S: CoordinationStore> {
    store: Arc<S>,
    config: RegistryConfig,
    watches: Arc<DashMap<WatchId, Watch>>,
    next_watch: AtomicU64,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CoordinationStore> StoreDiscovery<S> {
    pub fn new(store: Arc<S>, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            watches: Arc::new(DashMap::new()),
            next_watch: AtomicU64::new(1),
            events_task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    fn service_path(&self, name: &ServiceName) -> String {
        format!("{}/{}", self.config.root.trim_end_matches('/'), name.as_path())
    }

    fn stop_events(&self) {
        if let Some(task) = self.events_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

/// Fans store events out to the watches below their paths. Missed events
/// fire every watch, since any of them may have been affected.
pub(crate) async fn dispatch_events(mut events: broadcast::Receiver<NodeEvent>, watches: Arc<DashMap<WatchId, Watch>>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, watches = watches.len(), "registry watcher fell behind, firing every watch");
                let fired: Vec<(String, WatchCallback)> =
                    watches.iter().map(|w| (w.path.clone(), w.callback.clone())).collect();
                for (path, callback) in fired {
                    callback(&NodeEvent::DataChanged(path));
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        // Collect first so callbacks may watch or unwatch.
        let callbacks: Vec<WatchCallback> = watches
            .iter()
            .filter(|w| is_under(event.path(), &w.path))
            .map(|w| w.callback.clone())
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }
}

fn is_under(path: &str, root: &str) -> bool {
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

fn parse_sequence(node: &str) -> Option<u64> {
    node.strip_prefix(CONFIG_PREFIX)?.parse().ok()
}

#[async_trait::async_trait]
impl<S: CoordinationStore> RemoteDiscovery for StoreDiscovery<S> {
    async fn on_start(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.ensure_path(&self.config.root).await?;

        let events = self.store.events();
        let task = tokio::spawn(dispatch_events(events, self.watches.clone()));
        if let Some(old) = self.events_task.lock().unwrap_or_else(|p| p.into_inner()).replace(task) {
            old.abort();
        }
        info!(root = %self.config.root, "registry connected");
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        self.stop_events();
        let released = self.watches.len();
        self.watches.clear();
        self.store.close().await?;
        info!(root = %self.config.root, released, "registry disconnected");
        Ok(())
    }

    async fn register(&self, name: &ServiceName, version: &str, params: &ConnectionParams) -> Result<RegistryEntry> {
        if !is_valid_version(version) {
            return Err(Error::InvalidVersion(version.to_string()));
        }
        let version_path = format!("{}/{}", self.service_path(name), version);
        self.store.ensure_path(&version_path).await?;

        let _barrier = if self.config.use_barrier {
            Some(self.store.barrier(&format!("{}/barrier", version_path)).await?)
        } else {
            None
        };

        let data = params.to_bytes().map_err(|e| Error::Encode(e.to_string()))?;
        let path = self
            .store
            .create(&format!("{}/{}", version_path, CONFIG_PREFIX), data, CreateMode::EphemeralSequential)
            .await?;
        let sequence = path
            .rsplit('/')
            .next()
            .and_then(parse_sequence)
            .ok_or_else(|| Error::Store(format!("store returned unsequenced path '{}'", path)))?;

        info!(service = %name, version, path = %path, "registered");
        Ok(RegistryEntry {
            path,
            version: version.to_string(),
            sequence,
            params: params.clone(),
        })
    }

    async fn deregister(&self, entry: &RegistryEntry) -> Result<()> {
        match self.store.delete(&entry.path).await {
            Ok(()) | Err(Error::NoNode(_)) => {
                debug!(path = %entry.path, "deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find_remote_endpoint(&self, name: &ServiceName, filter: &VersionFilter) -> Result<Option<RegistryEntry>> {
        let service_path = self.service_path(name);
        let Some(versions) = self.store.children(&service_path).await? else {
            return Ok(None);
        };
        let Some(version) = self.config.version_order.latest(versions.iter().map(String::as_str), filter) else {
            return Ok(None);
        };

        let version_path = format!("{}/{}", service_path, version);
        let Some(nodes) = self.store.children(&version_path).await? else {
            return Ok(None);
        };
        let Some((sequence, node)) = nodes
            .iter()
            .filter_map(|n| parse_sequence(n).map(|seq| (seq, n)))
            .max_by_key(|(seq, _)| *seq)
        else {
            return Ok(None);
        };

        let path = format!("{}/{}", version_path, node);
        let Some(data) = self.store.get(&path).await? else {
            return Ok(None);
        };
        let params = ConnectionParams::from_bytes(&data).map_err(|e| Error::Decode(e.to_string()))?;
        debug!(service = %name, version, sequence, "resolved remote endpoint");
        Ok(Some(RegistryEntry {
            path,
            version: version.to_string(),
            sequence,
            params,
        }))
    }

    fn watch(&self, name: &ServiceName, callback: WatchCallback) -> WatchId {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.watches.insert(id, Watch {
            path: self.service_path(name),
            callback,
        });
        id
    }

    fn unwatch(&self, id: WatchId) -> bool {
        self.watches.remove(&id).is_some()
    }
}

impl<S: CoordinationStore> Drop for StoreDiscovery<S> {
    fn drop(&mut self) {
        self.stop_events();
    }
}
