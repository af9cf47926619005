//! # Supervisor
//!
//! Starts one child per spec and keeps them alive one-for-one: when a child
//! terminates, exactly its spec is asked for a replacement. A spec that runs
//! out of restart budget takes the supervisor down with it, which in turn
//! notifies whoever supervises the supervisor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Error;
use crate::Result;
use crate::lifecycle::Lifecycle;
use crate::lifecycle::LifecycleId;
use crate::lifecycle::Managed;
use crate::lifecycle::ManagedExt;
use crate::lifecycle::Reason;
use crate::lifecycle::State;
use crate::lifecycle::Watcher;
use crate::spec::Spec;

struct Child {
    obj: Arc<dyn Managed>,
    spec: Spec,
}

/// One-for-one supervisor over a list of specs.
pub struct Supervisor {
    lifecycle: Lifecycle,
    specs: Mutex<Vec<Spec>>,
    // Keyed by lifecycle id, which increases monotonically, so iteration
    // order is start order.
    instances: Mutex<BTreeMap<LifecycleId, Child>>,
    me: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, specs: Vec<Spec>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            lifecycle: Lifecycle::new(name),
            specs: Mutex::new(specs),
            instances: Mutex::new(BTreeMap::new()),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Live children in start order.
    pub fn children(&self) -> Vec<Arc<dyn Managed>> {
        lock(&self.instances).values().map(|c| c.obj.clone()).collect()
    }

    /// Number of live children.
    pub fn len(&self) -> usize {
        lock(&self.instances).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a spec to a running supervisor and starts its child.
    pub async fn add_child(&self, spec: Spec) -> Result<Arc<dyn Managed>> {
        let state = self.state();
        if state != State::Running {
            return Err(Error::NotRunning(state));
        }
        lock(&self.specs).push(spec.clone());
        self.start_child(&spec).await
    }

    /// Starts a child from `spec`, retrying until it runs or the budget is spent.
    ///
    /// On budget exhaustion the supervisor terminates itself before returning
    /// the error.
    async fn start_child(&self, spec: &Spec) -> Result<Arc<dyn Managed>> {
        match self.start_child_inner(spec).await {
            Ok(child) => Ok(child),
            Err(e) => {
                debug!(supervisor = %self.lifecycle.name(), spec = %spec.name(), error = %e, "giving up on child");
                self.terminate(Reason::RestartBudgetExceeded).await;
                Err(e)
            }
        }
    }

    async fn start_child_inner(&self, spec: &Spec) -> Result<Arc<dyn Managed>> {
        loop {
            let child = match spec.get_obj() {
                Ok(child) => child,
                Err(e) if e.is_budget_exceeded() => return Err(e),
                Err(e) => {
                    info!(supervisor = %self.lifecycle.name(), spec = %spec.name(), error = %e, "restarting worker");
                    continue;
                }
            };

            if let Err(e) = spec.run(&child).await {
                if e.is_budget_exceeded() {
                    return Err(e);
                }
                info!(supervisor = %self.lifecycle.name(), spec = %spec.name(), error = %e, "restarting worker");
                continue;
            }

            let me: Weak<dyn Watcher> = self.me.clone();
            let lifecycle = child.lifecycle();
            if lifecycle.watch(me).is_err() {
                // Died between start and watch; nobody would tell us, so retry now.
                info!(supervisor = %self.lifecycle.name(), spec = %spec.name(), "worker died before it was watched");
                continue;
            }

            lock(&self.instances).insert(lifecycle.id(), Child {
                obj: child.clone(),
                spec: spec.clone(),
            });
            debug!(supervisor = %self.lifecycle.name(), spec = %spec.name(), child = %lifecycle.id(), "child running");
            return Ok(child);
        }
    }
}

#[async_trait::async_trait]
impl Managed for Supervisor {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        debug!(supervisor = %self.lifecycle.name(), "starting supervisor");
        let specs = lock(&self.specs).clone();
        for spec in specs {
            self.start_child(&spec).await?;
        }
        Ok(())
    }

    async fn on_terminate(&self, reason: &Reason) -> anyhow::Result<()> {
        info!(supervisor = %self.lifecycle.name(), %reason, "supervisor terminating children");
        let children = std::mem::take(&mut *lock(&self.instances));
        for (_, child) in children.into_iter().rev() {
            child.obj.terminate(Reason::SupervisorStop).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Watcher for Supervisor {
    async fn notify(&self, reason: Reason, id: LifecycleId) -> anyhow::Result<()> {
        if self.state() > State::Running {
            return Ok(());
        }

        let Some(child) = lock(&self.instances).remove(&id) else {
            warn!(supervisor = %self.lifecycle.name(), child = %id, "notified by a child it does not own");
            return Ok(());
        };

        if reason == Reason::Shutdown {
            info!(supervisor = %self.lifecycle.name(), spec = %child.spec.name(), "child shut down, not restarting");
            return Ok(());
        }

        info!(supervisor = %self.lifecycle.name(), spec = %child.spec.name(), %reason, "child terminated, restarting");
        self.start_child(&child.spec).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("lifecycle", &self.lifecycle)
            .field("children", &self.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
