//! Tracing subscriber wiring.
//!
//! The engine logs structured events through `tracing`; every span below
//! the scheduler carries the owning job id as a correlation field. Log
//! records never include submission source content — only paths, sizes,
//! and outcome labels.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{EngineConfig, ENV_LOG_LEVEL};

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops (first writer wins, matching test harness behavior).
pub fn init(config: &EngineConfig) {
    let directive = config
        .log_level
        .clone()
        .or_else(|| std::env::var(ENV_LOG_LEVEL).ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
