//! Configuration for the execution engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tollgate_abstraction::EndpointFamily;

/// Which in-flight calls block a sequential-mode dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequentialScope {
    /// A sequential dispatch waits until no call for *any* identity is in flight.
    #[default]
    Global,
    /// A sequential dispatch only waits for calls to its own identity.
    PerEndpoint,
}

/// Configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Root directory of the response caches; each family uses `<cache_dir>/<family>_cache`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Maximum estimated spend in USD that proceeds without confirmation.
    /// `None` always asks.
    #[serde(default = "default_auto_approve")]
    pub auto_approve: Option<f64>,

    /// Maximum concurrent calls per endpoint identity in parallel mode (default: 20).
    #[serde(default = "default_parallel_ceiling")]
    pub parallel_ceiling: usize,

    /// Maximum concurrent token-counting calls (default: 20).
    #[serde(default = "default_token_count_concurrency")]
    pub token_count_concurrency: usize,

    /// How often a failed token-counting call is retried before giving up (default: 5).
    #[serde(default = "default_token_count_retries")]
    pub token_count_retries: u32,

    /// Shortest wait between dispatch scans in milliseconds (default: 50).
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,

    /// Longest wait between dispatch scans in milliseconds (default: 1000).
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// Scope of the sequential-mode exclusive slot.
    #[serde(default)]
    pub sequential_scope: SequentialScope,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data")
}

#[allow(clippy::unnecessary_wraps)]
fn default_auto_approve() -> Option<f64> {
    Some(0.01)
}

fn default_parallel_ceiling() -> usize {
    20
}

fn default_token_count_concurrency() -> usize {
    20
}

fn default_token_count_retries() -> u32 {
    5
}

fn default_min_poll_interval_ms() -> u64 {
    50
}

fn default_max_poll_interval_ms() -> u64 {
    1000
}

/// Errors that can occur during engine configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid parallel ceiling (must be > 0).
    #[error("Invalid parallel ceiling: must be greater than 0")]
    InvalidParallelCeiling,

    /// Invalid token-count concurrency (must be > 0).
    #[error("Invalid token count concurrency: must be greater than 0")]
    InvalidTokenCountConcurrency,

    /// Invalid poll intervals (min must be > 0 and <= max).
    #[error("Invalid poll interval: min ({min}ms) must be greater than 0 and at most max ({max}ms)")]
    InvalidPollInterval {
        /// Configured minimum.
        min: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Invalid auto-approve ceiling (must be finite and >= 0).
    #[error("Invalid auto-approve ceiling: {0}")]
    InvalidAutoApprove(f64),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            auto_approve: default_auto_approve(),
            parallel_ceiling: default_parallel_ceiling(),
            token_count_concurrency: default_token_count_concurrency(),
            token_count_retries: default_token_count_retries(),
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            sequential_scope: SequentialScope::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the engine configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_ceiling == 0 {
            return Err(ConfigError::InvalidParallelCeiling);
        }

        if self.token_count_concurrency == 0 {
            return Err(ConfigError::InvalidTokenCountConcurrency);
        }

        if self.min_poll_interval_ms == 0 || self.min_poll_interval_ms > self.max_poll_interval_ms {
            return Err(ConfigError::InvalidPollInterval {
                min: self.min_poll_interval_ms,
                max: self.max_poll_interval_ms,
            });
        }

        if let Some(ceiling) = self.auto_approve {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(ConfigError::InvalidAutoApprove(ceiling));
            }
        }

        Ok(())
    }

    /// Cache directory for one endpoint family.
    #[must_use]
    pub fn family_cache_dir(&self, family: EndpointFamily) -> PathBuf {
        family_cache_dir(&self.cache_dir, family)
    }

    /// Get the minimum poll interval as a Duration.
    #[must_use]
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    /// Get the maximum poll interval as a Duration.
    #[must_use]
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}

fn family_cache_dir(root: &Path, family: EndpointFamily) -> PathBuf {
    root.join(format!("{}_cache", family.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("data"));
        assert_eq!(config.auto_approve, Some(0.01));
        assert_eq!(config.parallel_ceiling, 20);
        assert_eq!(config.token_count_concurrency, 20);
        assert_eq!(config.sequential_scope, SequentialScope::Global);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_validation_invalid_ceiling() {
        let config = EngineConfig { parallel_ceiling: 0, ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidParallelCeiling)));
    }

    #[test]
    fn test_engine_config_validation_invalid_poll_interval() {
        let config = EngineConfig {
            min_poll_interval_ms: 2000,
            max_poll_interval_ms: 1000,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPollInterval { min: 2000, max: 1000 })
        ));
    }

    #[test]
    fn test_engine_config_validation_negative_auto_approve() {
        let config = EngineConfig { auto_approve: Some(-1.0), ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAutoApprove(_))));
    }

    #[test]
    fn test_engine_config_partial_document_uses_defaults() {
        let config: EngineConfig =
            from_json(r#"{"parallel_ceiling": 4, "sequential_scope": "per_endpoint"}"#);
        assert_eq!(config.parallel_ceiling, 4);
        assert_eq!(config.sequential_scope, SequentialScope::PerEndpoint);
        assert_eq!(config.max_poll_interval_ms, 1000);
    }

    #[test]
    fn test_family_cache_dir() {
        let config = EngineConfig { cache_dir: PathBuf::from("/tmp/x"), ..EngineConfig::default() };
        assert_eq!(
            config.family_cache_dir(EndpointFamily::Anthropic),
            PathBuf::from("/tmp/x/anthropic_cache")
        );
    }

    fn from_json(s: &str) -> EngineConfig {
        serde_json::from_str(s).unwrap()
    }
}
