//! Engine configuration
//!
//! One serde tree with a section per component. Every section defaults, so
//! a partial JSON document only needs the values it changes:
//!
//! ```json
//! { "candles": { "emit_empty": false }, "workers": { "shards": 8 } }
//! ```
//!
//! Durations are millisecond integers. `validate()` rejects configurations
//! the engine cannot run with; these are the only fatal errors it raises.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candles::BuilderConfig;
use crate::features::FeatureConfig;
use crate::metrics::AlertThresholds;
use crate::router::RouterConfig;
use crate::sink::persist::PersistConfig;
use crate::sink::serve::ServeConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Indicator {indicator} needs {lookback} candles but history capacity is {capacity}")]
    LookbackExceedsCapacity {
        indicator: String,
        lookback: usize,
        capacity: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of shard workers; instruments are hashed onto shards.
    pub shards: usize,
    pub ingress_capacity: usize,
    pub shard_capacity: usize,
    /// Wall-clock timer period for force-closing idle windows.
    pub timer_interval_ms: u64,
}

impl WorkerConfig {
    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            ingress_capacity: 65_536,
            shard_capacity: 8_192,
            timer_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub candles: BuilderConfig,
    pub features: FeatureConfig,
    pub serve: ServeConfig,
    pub persist: PersistConfig,
    pub workers: WorkerConfig,
    /// Limits checked on every worker timer tick.
    pub alerts: AlertThresholds,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.features.validate()?;
        self.serve.validate()?;
        self.persist.validate()?;

        if self.workers.shards == 0 {
            return Err(ConfigError::Invalid("workers.shards must be at least 1".into()));
        }
        if self.workers.ingress_capacity == 0 || self.workers.shard_capacity == 0 {
            return Err(ConfigError::Invalid("worker channel capacities must be non-zero".into()));
        }
        if self.workers.timer_interval_ms == 0 {
            return Err(ConfigError::Invalid("workers.timer_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}
