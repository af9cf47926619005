//! # fanvisor
//!
//! A small fault-recovery engine for long-lived runtime objects.
//!
//! ## Architecture
//!
//! - **Lifecycle**: a forward-only state machine embedded in every managed object,
//!   with weak links (objects terminated alongside) and weak watches (observers notified).
//! - **Spec**: a restart-aware factory producing fresh instances under a restart budget.
//! - **Supervisor**: starts children from specs, restarts a child when it terminates
//!   (one-for-one), and terminates itself once a child exhausts its budget.

pub mod lifecycle;
pub mod spec;
pub mod supervisor;

pub use lifecycle::Lifecycle;
pub use lifecycle::LifecycleId;
pub use lifecycle::Managed;
pub use lifecycle::ManagedExt;
pub use lifecycle::Reason;
pub use lifecycle::State;
pub use lifecycle::WatchHandle;
pub use lifecycle::Watcher;
pub use spec::RestartStrategy;
pub use spec::Spec;
pub use supervisor::Supervisor;


/// Supervision failures.
#[derive(Debug)]
pub enum Error {
    /// A spec was asked for a new instance too many times inside its window.
    RestartBudgetExceeded { spec: String, restarts: u32 },
    /// The `on_start` hook failed; the instance has already been terminated.
    Startup(anyhow::Error),
    /// The spec's constructor failed.
    Construct(anyhow::Error),
    /// A transition was requested from the wrong state.
    InvalidState { expected: State, found: State },
    /// The supervisor is not running and cannot accept children.
    NotRunning(State),
}

impl Error {
    /// Returns true if this error, or the startup failure it wraps, is a
    /// restart budget exhaustion somewhere down the supervision tree.
    pub fn is_budget_exceeded(&self) -> bool {
        match self {
            Self::RestartBudgetExceeded { .. } => true,
            Self::Startup(cause) | Self::Construct(cause) => cause
                .chain()
                .filter_map(|e| e.downcast_ref::<Error>())
                .any(|e| e.is_budget_exceeded()),
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartBudgetExceeded { spec, restarts } => {
                write!(f, "Restart budget exceeded for '{}' after {} restarts", spec, restarts)
            }
            Self::Startup(e) => write!(f, "Startup failure: {:#}", e),
            Self::Construct(e) => write!(f, "Construction failure: {:#}", e),
            Self::InvalidState { expected, found } => {
                write!(f, "Invalid lifecycle state: expected {:?}, found {:?}", expected, found)
            }
            Self::NotRunning(state) => write!(f, "Supervisor is not running (state {:?})", state),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
