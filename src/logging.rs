//! Process-wide logging setup. Called exactly once, from `main`, before any
//! pipeline is built.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Installs a `tracing_subscriber::fmt` subscriber. `default_level` seeds
/// the filter when `RUST_LOG` is unset.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}
