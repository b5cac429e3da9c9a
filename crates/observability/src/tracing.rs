//! Tracing/logging initialization.
//!
//! JSON output with an env-driven filter. Gating outcomes from the
//! synchronizer (`Awaited`, `Obsoleted`) are logged at `debug`, degraded
//! paths (snapshots, handler retries) at `warn`, and exhausted/fatal paths
//! at `error`; raise `RUST_LOG` accordingly when diagnosing ordering
//! issues.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
