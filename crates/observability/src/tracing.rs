//! Tracing subscriber initialization.
//!
//! Logs are JSON lines with timestamps; verbosity comes from `RUST_LOG`, e.g.
//! `RUST_LOG=allocation_infra=debug` to see every flushed statement.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";

/// Initialize tracing with the `info` fallback filter.
pub fn init() {
    init_with_default(DEFAULT_DIRECTIVES);
}

/// Initialize tracing, falling back to `directives` when `RUST_LOG` is unset or invalid.
pub fn init_with_default(directives: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(true)
        .try_init();
}
