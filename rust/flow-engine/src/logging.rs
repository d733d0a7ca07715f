//! Structured logging initialization.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing with an env-filter.
///
/// Respects `RUST_LOG` when set, otherwise falls back to `default_filter`
/// (e.g. `"flow_engine=info"`). Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
