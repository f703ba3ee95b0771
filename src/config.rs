//! Configuration management for Floodgate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::RateLimitPolicy;

/// Prefix for environment overrides, e.g. `FLOODGATE__POLICY__GLOBAL_BURST=20`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the admission core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Limits enforced per request
    #[serde(default)]
    pub policy: RateLimitPolicy,

    /// Limiter registry sizing
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Burst abuse detection
    #[serde(default)]
    pub pattern: PatternConfig,

    /// Background sweep
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Identity buckets kept before eviction runs inline
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Idle time after which a bucket or pattern record may be evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_max_entries() -> usize {
    10_000
}

fn default_idle_timeout() -> u64 {
    600
}

/// Burst abuse detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Whether the pattern tracker runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per window; one more triggers a block
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,

    /// Counting window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// How long a block lasts
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Pattern records kept before eviction runs inline
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            burst_threshold: default_burst_threshold(),
            window_ms: default_window_ms(),
            block_duration_secs: default_block_duration(),
            max_entries: default_max_entries(),
        }
    }
}

impl PatternConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_burst_threshold() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    1000
}

fn default_block_duration() -> u64 {
    300
}

/// Background reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Whether the service starts a reaper
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_reaper_interval(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_reaper_interval() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the optional file, then apply `FLOODGATE__*` environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&contents).map_err(|e| {
                    FloodgateError::Config(format!("Failed to parse configuration: {}", e))
                })?
            }
            None => FloodgateConfig::default(),
        };
        config.apply_env_overrides(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay scalar settings from environment variables.
    ///
    /// The file is parsed on its own so endpoint paths keep their case; the
    /// environment can only replace individual values and the whitelist.
    /// `source` substitutes for the process environment in tests.
    pub fn apply_env_overrides(&mut self, source: Option<config::Map<String, String>>) -> Result<()> {
        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("policy.whitelist")
                    .source(source),
            )
            .build()?;

        let policy = &mut self.policy;
        override_value(&env, "policy.global_requests_per_minute", &mut policy.global_requests_per_minute)?;
        override_value(&env, "policy.global_burst", &mut policy.global_burst)?;
        override_value(
            &env,
            "policy.per_identity_requests_per_minute",
            &mut policy.per_identity_requests_per_minute,
        )?;
        override_value(&env, "policy.per_identity_burst", &mut policy.per_identity_burst)?;
        override_value(&env, "policy.include_headers", &mut policy.include_headers)?;

        let mut whitelist: Vec<String> = Vec::new();
        if override_value(&env, "policy.whitelist", &mut whitelist)? {
            policy.whitelist = whitelist.into_iter().map(|id| id.trim().to_string()).collect();
        }

        override_value(&env, "registry.max_entries", &mut self.registry.max_entries)?;
        override_value(&env, "registry.idle_timeout_secs", &mut self.registry.idle_timeout_secs)?;
        override_value(&env, "pattern.enabled", &mut self.pattern.enabled)?;
        override_value(&env, "pattern.burst_threshold", &mut self.pattern.burst_threshold)?;
        override_value(&env, "pattern.window_ms", &mut self.pattern.window_ms)?;
        override_value(&env, "pattern.block_duration_secs", &mut self.pattern.block_duration_secs)?;
        override_value(&env, "pattern.max_entries", &mut self.pattern.max_entries)?;
        override_value(&env, "reaper.enabled", &mut self.reaper.enabled)?;
        override_value(&env, "reaper.interval_secs", &mut self.reaper.interval_secs)?;
        override_value(&env, "logging.level", &mut self.logging.level)?;
        override_value(&env, "logging.json", &mut self.logging.json)?;

        Ok(())
    }

    /// Reject values that would let the core start in a broken state.
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        let positive = [
            ("registry.max_entries", self.registry.max_entries as u64),
            ("registry.idle_timeout_secs", self.registry.idle_timeout_secs),
            ("pattern.burst_threshold", u64::from(self.pattern.burst_threshold)),
            ("pattern.window_ms", self.pattern.window_ms),
            ("pattern.block_duration_secs", self.pattern.block_duration_secs),
            ("pattern.max_entries", self.pattern.max_entries as u64),
            ("reaper.interval_secs", self.reaper.interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(FloodgateError::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }
}

/// Replace `slot` when `key` is present. Returns whether it was.
fn override_value<T: DeserializeOwned>(env: &config::Config, key: &str, slot: &mut T) -> Result<bool> {
    match env.get::<T>(key) {
        Ok(value) => {
            *slot = value;
            Ok(true)
        }
        Err(config::ConfigError::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
