//! # Tracing Setup
//!
//! Library code only emits `tracing` events; binaries and test harnesses
//! call [`init_tracing`] once to print them. The filter is read from the
//! `HBP_LOG` environment variable (same syntax as `RUST_LOG`) and defaults
//! to `info`.

use tracing_subscriber::EnvFilter;

use crate::CoreError;

/// Environment variable holding the tracing filter directives.
pub const LOG_ENV: &str = "HBP_LOG";

/// Install a global fmt subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), CoreError> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| CoreError::TracingInit(e.to_string()))
}

/// Install a subscriber writing through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
