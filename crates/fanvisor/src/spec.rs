//! # Child Specs
//!
//! A `Spec` is a restart-aware factory. Every call to `get_obj` is checked
//! against a restart budget: creations closer together than the strategy's
//! window count against `max_restarts`, and a creation outside the window
//! resets the count. This bounds crash loops.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::Error;
use crate::ManagedExt;
use crate::Result;
use crate::lifecycle::Managed;

/// Restart policy for a spec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RestartStrategy {
    /// Creations allowed inside one window before the budget is exhausted.
    pub max_restarts: u32,
    /// Two creations closer than this count as a restart.
    pub window: Duration,
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            window: Duration::from_secs(1),
        }
    }
}

type Factory = dyn Fn() -> anyhow::Result<Arc<dyn Managed>> + Send + Sync;

#[derive(Default)]
struct Budget {
    last_create: Option<Instant>,
    restarts: u32,
}

struct SpecInner {
    name: String,
    factory: Box<Factory>,
    strategy: RestartStrategy,
    budget: Mutex<Budget>,
}

/// A restart-aware factory for a supervised child.
///
/// Clones share the same budget.
#[derive(Clone)]
pub struct Spec {
    inner: Arc<SpecInner>,
}

impl Spec {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn Managed>> + Send + Sync + 'static,
    {
        Self::with_strategy(name, RestartStrategy::default(), factory)
    }

    pub fn with_strategy<F>(name: impl Into<String>, strategy: RestartStrategy, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn Managed>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SpecInner {
                name: name.into(),
                factory: Box::new(factory),
                strategy,
                budget: Mutex::new(Budget::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn strategy(&self) -> RestartStrategy {
        self.inner.strategy
    }

    /// Restarts counted in the current window.
    pub fn restarts(&self) -> u32 {
        self.budget().restarts
    }

    /// Produces a fresh instance, charging it against the restart budget.
    pub fn get_obj(&self) -> Result<Arc<dyn Managed>> {
        self.charge(Instant::now())?;
        (self.inner.factory)().map_err(Error::Construct)
    }

    /// Starts an instance produced by this spec.
    pub async fn run(&self, obj: &Arc<dyn Managed>) -> Result<()> {
        obj.start().await
    }

    fn charge(&self, now: Instant) -> Result<()> {
        let strategy = self.inner.strategy;
        let mut budget = self.budget();
        let inside_window = budget
            .last_create
            .is_some_and(|last| now.duration_since(last) < strategy.window);

        if inside_window {
            budget.restarts += 1;
            if budget.restarts >= strategy.max_restarts {
                return Err(Error::RestartBudgetExceeded {
                    spec: self.inner.name.clone(),
                    restarts: budget.restarts,
                });
            }
        } else {
            budget.restarts = 0;
        }

        budget.last_create = Some(now);
        Ok(())
    }

    fn budget(&self) -> std::sync::MutexGuard<'_, Budget> {
        self.inner.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spec")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}
