//! Configuration for the cache and the runner.
//!
//! Every field has a default, so a partial JSON document is enough:
//! ```ignore
//! let config = CourierConfig::from_json_str(r#"{"runner": {"task_timeout_ms": 2000}}"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::runner::FailurePolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub cache: CacheConfig,
    pub runner: RunnerConfig,
}

impl CourierConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CourierError> {
        let config: Self = serde_json::from_str(json).map_err(CourierError::Config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        self.cache.validate()?;
        self.runner.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used by `KeyedCache::set_default`.
    pub default_ttl_ms: u64,

    /// Period of the background eviction sweep.
    pub eviction_interval_ms: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    fn validate(&self) -> Result<(), CourierError> {
        if self.eviction_interval_ms == 0 {
            return Err(CourierError::InvalidArgument(
                "cache.eviction_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,      // 5 minutes
            eviction_interval_ms: 30_000, // 30 seconds
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Used by `ConcurrentTaskRunner::run_default`.
    pub default_max_concurrency: usize,

    /// Deadline applied to every executor call, if any.
    pub task_timeout_ms: Option<u64>,

    pub failure_policy: FailurePolicy,
}

impl RunnerConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), CourierError> {
        if self.default_max_concurrency == 0 {
            return Err(CourierError::InvalidArgument(
                "runner.default_max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: 4,
            task_timeout_ms: None,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}
