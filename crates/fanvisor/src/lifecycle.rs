//! # Lifecycle State Machine
//!
//! Every managed object embeds a `Lifecycle` and implements `Managed`.
//! `ManagedExt` provides the driving operations (`start`, `terminate`) for any
//! managed object, including trait objects.
//!
//! ## Invariants
//!
//! - State only moves forward: a terminated instance is never rewound.
//! - `terminate` is idempotent; only the first call past RUNNING does any work.
//! - Links and watches are weak and keyed by a stable handle. Dead entries are
//!   swept on every pass and both sets are emptied at teardown.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Lifecycle states, in the only order they may be visited.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
}

/// Stable identity of a lifecycle, unique within the process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LifecycleId(pub u64);

impl std::fmt::Display for LifecycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lifecycle-{}", self.0)
    }
}

/// Handle returned when registering a watcher, used to unregister it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct WatchHandle(pub u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why an object is being terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    /// Orderly shutdown requested by the owner.
    Shutdown,
    /// The owning supervisor is tearing down its children.
    SupervisorStop,
    /// A child exhausted its restart budget.
    RestartBudgetExceeded,
    /// Something failed; the message describes what.
    Failed(String),
}

impl Reason {
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::SupervisorStop => write!(f, "supervisor stop"),
            Self::RestartBudgetExceeded => write!(f, "restart budget exceeded"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// An object driven by a `Lifecycle`.
#[async_trait::async_trait]
pub trait Managed: Send + Sync + 'static {
    /// The embedded lifecycle.
    fn lifecycle(&self) -> &Lifecycle;

    /// Start hook, run while STARTING.
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Terminate hook, run while TERMINATING. Failures are logged, not propagated.
    async fn on_terminate(&self, _reason: &Reason) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An observer told when a watched lifecycle terminates.
#[async_trait::async_trait]
pub trait Watcher: Send + Sync + 'static {
    async fn notify(&self, reason: Reason, id: LifecycleId) -> anyhow::Result<()>;
}

/// Per-object lifecycle bookkeeping.
pub struct Lifecycle {
    id: LifecycleId,
    name: String,
    state: Mutex<State>,
    links: Mutex<HashMap<LifecycleId, Weak<dyn Managed>>>,
    watches: Mutex<HashMap<WatchHandle, Weak<dyn Watcher>>>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: LifecycleId(next_id()),
            name: name.into(),
            state: Mutex::new(State::Initialized),
            links: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> LifecycleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    /// Links `target` to this lifecycle: when this one terminates, so does `target`.
    ///
    /// Fails once this lifecycle has left RUNNING.
    pub fn link(&self, target_id: LifecycleId, target: Weak<dyn Managed>) -> Result<()> {
        self.ensure_live()?;
        lock(&self.links).insert(target_id, target);
        Ok(())
    }

    /// Removes a link previously added with `link`.
    pub fn unlink(&self, target_id: LifecycleId) -> bool {
        lock(&self.links).remove(&target_id).is_some()
    }

    /// Registers a watcher to be notified when this lifecycle terminates.
    pub fn watch(&self, watcher: Weak<dyn Watcher>) -> Result<WatchHandle> {
        self.ensure_live()?;
        let handle = WatchHandle(next_id());
        let mut watches = lock(&self.watches);
        watches.retain(|_, w| w.strong_count() > 0);
        watches.insert(handle, watcher);
        Ok(handle)
    }

    /// Unregisters a watcher. Returns false if it was already gone.
    pub fn unwatch(&self, handle: WatchHandle) -> bool {
        lock(&self.watches).remove(&handle).is_some()
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        lock(&self.watches).values().filter(|w| w.strong_count() > 0).count()
    }

    fn ensure_live(&self) -> Result<()> {
        let state = self.state();
        if state > State::Running {
            return Err(Error::InvalidState { expected: State::Running, found: state });
        }
        Ok(())
    }

    /// Moves from `from` to `to`, failing if the current state is not `from`.
    fn transition(&self, from: State, to: State) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(Error::InvalidState { expected: from, found: *state });
        }
        *state = to;
        Ok(())
    }

    /// Moves forward to `to`; never moves backwards.
    fn advance(&self, to: State) -> State {
        let mut state = lock(&self.state);
        if *state < to {
            *state = to;
        }
        *state
    }

    /// Claims the right to terminate. Only the first caller past RUNNING wins.
    fn begin_stopping(&self) -> bool {
        let mut state = lock(&self.state);
        if *state >= State::Stopping {
            return false;
        }
        *state = State::Stopping;
        true
    }

    fn take_links(&self) -> Vec<Weak<dyn Managed>> {
        lock(&self.links).drain().map(|(_, link)| link).collect()
    }

    fn take_watches(&self) -> Vec<Weak<dyn Watcher>> {
        lock(&self.watches).drain().map(|(_, watch)| watch).collect()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// Lifecycle bookkeeping never panics while holding a guard, so a poisoned lock
// still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Driving operations for every managed object.
#[async_trait::async_trait]
pub trait ManagedExt: Managed {
    /// Runs INITIALIZED → STARTING → RUNNING.
    ///
    /// If the start hook fails, the instance is terminated before the error is
    /// returned, so no half-started instance survives.
    async fn start(&self) -> Result<()> {
        let lifecycle = self.lifecycle();
        lifecycle.transition(State::Initialized, State::Starting)?;
        debug!(lifecycle = %lifecycle.name(), id = %lifecycle.id(), "starting");

        if let Err(e) = self.on_start().await {
            debug!(lifecycle = %lifecycle.name(), error = %format!("{:#}", e), "start hook failed");
            self.terminate(Reason::failed(format!("{:#}", e))).await;
            return Err(Error::Startup(e));
        }

        let state = lifecycle.advance(State::Running);
        if state != State::Running {
            return Err(Error::Startup(anyhow::anyhow!(
                "'{}' was terminated while starting", lifecycle.name()
            )));
        }
        info!(lifecycle = %lifecycle.name(), id = %lifecycle.id(), "running");
        Ok(())
    }

    /// Tears the object down. Returns false if it was already stopping.
    ///
    /// Linked objects are terminated and watchers notified on a best-effort
    /// basis: a failing watcher is logged and the rest still run.
    async fn terminate(&self, reason: Reason) -> bool {
        let lifecycle = self.lifecycle();
        if !lifecycle.begin_stopping() {
            return false;
        }
        info!(lifecycle = %lifecycle.name(), id = %lifecycle.id(), %reason, "terminating");

        for link in lifecycle.take_links() {
            if let Some(linked) = link.upgrade() {
                linked.terminate(reason.clone()).await;
            }
        }

        let id = lifecycle.id();
        for watch in lifecycle.take_watches() {
            let Some(watcher) = watch.upgrade() else { continue };
            if let Err(e) = watcher.notify(reason.clone(), id).await {
                warn!(lifecycle = %lifecycle.name(), error = %format!("{:#}", e), "watcher failed during notify");
            }
        }
        lifecycle.advance(State::Stopped);

        lifecycle.advance(State::Terminating);
        if let Err(e) = self.on_terminate(&reason).await {
            warn!(lifecycle = %lifecycle.name(), error = %format!("{:#}", e), "terminate hook failed");
        }
        lifecycle.advance(State::Terminated);
        debug!(lifecycle = %lifecycle.name(), id = %id, "terminated");
        true
    }
}

impl<T: Managed + ?Sized> ManagedExt for T {}
