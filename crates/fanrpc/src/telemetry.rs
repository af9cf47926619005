//! Log subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_logging() -> bool {
    init_logging_with("info")
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, or by `default` when
/// it is unset or invalid. Returns false if a global subscriber was already
/// installed.
pub fn init_logging_with(default: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}
