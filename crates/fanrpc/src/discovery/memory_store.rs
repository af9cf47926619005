//! In-process coordination store.
//!
//! A tree of nodes shared by any number of sessions. Ephemeral nodes belong to
//! the session that created them and vanish when it closes. Sequential nodes
//! get a 10-digit counter kept per parent, so names sort in creation order.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::discovery::Error;
use crate::discovery::Result;
use crate::discovery::store::BarrierGuard;
use crate::discovery::store::CoordinationStore;
use crate::discovery::store::CreateMode;
use crate::discovery::store::NodeEvent;

const EVENT_CAPACITY: usize = 1024;

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

struct Tree {
    nodes: Mutex<BTreeMap<String, Node>>,
    connected: Mutex<HashSet<u64>>,
    barriers: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<NodeEvent>,
    next_session: AtomicU64,
}

/// One session on a shared in-memory tree. `session()` opens another session
/// on the same tree, as a second process would.
pub struct MemoryStore {
    tree: Arc<Tree>,
    session: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        let tree = Arc::new(Tree {
            nodes: Mutex::new(nodes),
            connected: Mutex::new(HashSet::new()),
            barriers: DashMap::new(),
            events,
            next_session: AtomicU64::new(2),
        });
        Self { tree, session: 1 }
    }

    /// A new, unconnected session on the same tree.
    pub fn session(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            session: self.tree.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.tree.connected).contains(&self.session)
    }

    pub fn exists(&self, path: &str) -> bool {
        lock(&self.tree.nodes).contains_key(path)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() { Ok(()) } else { Err(Error::NotConnected) }
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine.
        let _ = self.tree.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn parent_of(path: &str) -> Result<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Ok("/"),
        Some(i) if i > 0 && i + 1 < path.len() => Ok(&path[..i]),
        _ => Err(Error::Store(format!("invalid path '{}'", path))),
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" { "/".to_string() } else { format!("{}/", path) }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(&self) -> Result<()> {
        lock(&self.tree.connected).insert(self.session);
        debug!(session = self.session, "store session connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.tree.connected).remove(&self.session);
        let removed: Vec<String> = {
            let mut nodes = lock(&self.tree.nodes);
            let owned: Vec<String> = nodes
                .iter()
                .filter(|(_, n)| n.owner == Some(self.session))
                .map(|(p, _)| p.clone())
                .collect();
            for path in &owned {
                nodes.remove(path);
            }
            owned
        };
        debug!(session = self.session, removed = removed.len(), "store session closed");
        for path in removed {
            self.emit(NodeEvent::Deleted(path));
        }
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.ensure_connected()?;
        let parent = parent_of(path)?;
        let created = {
            let mut nodes = lock(&self.tree.nodes);
            let parent_node = nodes
                .get_mut(parent)
                .ok_or_else(|| Error::NoNode(parent.to_string()))?;
            if parent_node.owner.is_some() {
                return Err(Error::Store(format!("ephemeral node '{}' cannot have children", parent)));
            }

            let (created, owner) = match mode {
                CreateMode::Persistent => (path.to_string(), None),
                CreateMode::Ephemeral => (path.to_string(), Some(self.session)),
                CreateMode::EphemeralSequential => {
                    let sequence = parent_node.next_sequence;
                    parent_node.next_sequence += 1;
                    (format!("{}{:010}", path, sequence), Some(self.session))
                }
            };
            if nodes.contains_key(&created) {
                return Err(Error::NodeExists(created));
            }
            nodes.insert(created.clone(), Node::new(data, owner));
            created
        };
        self.emit(NodeEvent::Created(created.clone()));
        Ok(created)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        Ok(lock(&self.tree.nodes).get(path).map(|n| n.data.clone()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        {
            let mut nodes = lock(&self.tree.nodes);
            let node = nodes.get_mut(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
            node.data = data;
        }
        self.emit(NodeEvent::DataChanged(path.to_string()));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Option<Vec<String>>> {
        self.ensure_connected()?;
        let nodes = lock(&self.tree.nodes);
        if !nodes.contains_key(path) {
            return Ok(None);
        }
        let prefix = child_prefix(path);
        let children = nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(Some(children))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        {
            let mut nodes = lock(&self.tree.nodes);
            if !nodes.contains_key(path) || path == "/" {
                return Err(Error::NoNode(path.to_string()));
            }
            let prefix = child_prefix(path);
            if nodes.range(prefix.clone()..).next().is_some_and(|(p, _)| p.starts_with(&prefix)) {
                return Err(Error::Store(format!("node '{}' has children", path)));
            }
            nodes.remove(path);
        }
        self.emit(NodeEvent::Deleted(path.to_string()));
        Ok(())
    }

    async fn barrier(&self, path: &str) -> Result<BarrierGuard> {
        self.ensure_connected()?;
        let gate = self
            .tree
            .barriers
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.lock_owned().await;
        Ok(Box::new(guard))
    }

    fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.tree.events.subscribe()
    }
}
