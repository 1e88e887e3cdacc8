//! Subscriber setup for binaries, tests and benchmarks.
//!
//! Each initializer installs a global `tracing` subscriber. A second call is
//! a no-op, so test helpers may call these freely.

use tracing_subscriber::EnvFilter;

fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging for development (human-readable format)
pub fn init_dev_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter_or("debug"))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

/// Initialize logging for production (JSON format)
pub fn init_prod_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter_or("info"))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .json()
        .try_init();
}

/// Initialize logging with custom filter
pub fn init_logging_with_filter(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

/// Quiet subscriber for test binaries; honours `RUST_LOG` when set
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter_or("warn"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialization_is_harmless() {
        init_test_logging();
        init_logging_with_filter("debug");
        init_dev_logging();
        tracing::info!("still logging");
    }
}
