//! Engine configuration.
//!
//! One explicit struct, loaded from the `REQ2RUN_*` environment variables
//! (all optional) or assembled through the builder. There is no dynamic
//! key discovery: an unparseable value is a configuration error surfaced
//! before anything is scheduled.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::sandbox::SandboxVariant;

pub const ENV_MAX_CONCURRENCY: &str = "REQ2RUN_MAX_CONCURRENCY";
pub const ENV_EVIDENCE_ROOT: &str = "REQ2RUN_EVIDENCE_ROOT";
pub const ENV_SANDBOX_VARIANT: &str = "REQ2RUN_SANDBOX_VARIANT";
pub const ENV_DEFAULT_SEED: &str = "REQ2RUN_DEFAULT_SEED";
pub const ENV_LOG_LEVEL: &str = "REQ2RUN_ENGINE_LOG_LEVEL";

/// Seed used when neither the environment nor the caller provides one.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    #[diagnostic(
        code(req2run::config::invalid_value),
        help("Unset the variable to fall back to the built-in default.")
    )]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Host capacity the scheduler must never exceed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostCapacity {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    /// Hard ceiling on simultaneously live sandboxes.
    pub sandboxes: usize,
}

impl Default for HostCapacity {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_cores: cores as f64,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            sandboxes: cores * 2,
        }
    }
}

/// Full engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum concurrently running orchestrators.
    pub max_concurrency: usize,
    pub evidence_root: PathBuf,
    pub sandbox_variant: SandboxVariant,
    pub default_seed: u64,
    /// Filter directive for the tracing subscriber, e.g. `info` or
    /// `req2run_engine=debug`.
    pub log_level: Option<String>,
    /// Queue length beyond which `submit` returns `QueueFull`.
    pub queue_high_water: usize,
    pub host_capacity: HostCapacity,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_concurrency: cores,
            evidence_root: PathBuf::from("./runs"),
            sandbox_variant: SandboxVariant::default(),
            default_seed: DEFAULT_SEED,
            log_level: None,
            queue_high_water: 256,
            host_capacity: HostCapacity::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_MAX_CONCURRENCY) {
            let parsed: usize = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_MAX_CONCURRENCY,
                value: raw.clone(),
                reason: "expected a positive integer".to_string(),
            })?;
            if parsed == 0 {
                return Err(ConfigError::InvalidValue {
                    var: ENV_MAX_CONCURRENCY,
                    value: raw,
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_concurrency = parsed;
        }
        if let Ok(raw) = std::env::var(ENV_EVIDENCE_ROOT) {
            config.evidence_root = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var(ENV_SANDBOX_VARIANT) {
            config.sandbox_variant =
                raw.parse()
                    .map_err(|reason: String| ConfigError::InvalidValue {
                        var: ENV_SANDBOX_VARIANT,
                        value: raw.clone(),
                        reason,
                    })?;
        }
        if let Ok(raw) = std::env::var(ENV_DEFAULT_SEED) {
            config.default_seed = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_DEFAULT_SEED,
                value: raw.clone(),
                reason: "expected an unsigned integer".to_string(),
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_LOG_LEVEL) {
            config.log_level = Some(raw);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_evidence_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.evidence_root = root.into();
        self
    }

    #[must_use]
    pub fn with_sandbox_variant(mut self, variant: SandboxVariant) -> Self {
        self.sandbox_variant = variant;
        self
    }

    #[must_use]
    pub fn with_default_seed(mut self, seed: u64) -> Self {
        self.default_seed = seed;
        self
    }

    #[must_use]
    pub fn with_queue_high_water(mut self, limit: usize) -> Self {
        self.queue_high_water = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_host_capacity(mut self, capacity: HostCapacity) -> Self {
        self.host_capacity = capacity;
        self
    }
}
