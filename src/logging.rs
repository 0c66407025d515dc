//! Tracing setup helper

use tracing_subscriber::EnvFilter;

/// Initialize the fmt subscriber with an env-filter.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Safe to
/// call more than once (later calls are no-ops), which keeps it usable
/// from tests.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
