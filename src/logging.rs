//! # Logging Setup
//!
//! The library itself only emits `tracing` events and never installs a
//! subscriber. Applications that have no tracing setup of their own (and
//! the integration tests) can call [`init`] to get a sensible default:
//! compact fmt output filtered by `RUST_LOG`, falling back to the given
//! default directive.

use tracing_subscriber::EnvFilter;

/// Install the default subscriber with an `info` fallback filter.
/// Idempotent: later calls (or an already-installed subscriber) win.
pub fn init() {
    init_with_default("info");
}

/// Install the default subscriber, falling back to `default_filter` when
/// `RUST_LOG` is unset or unparsable.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}
