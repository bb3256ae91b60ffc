//! CLI configuration loading and merging.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Environment variables (`TOLLGATE_CACHE_DIR`, `TOLLGATE_AUTO_APPROVE`)
//! 3. Local config file (./.tollgaterc)
//! 4. Global config file (~/.tollgate/config.toml)
//! 5. Defaults

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tollgate_engine::{EngineConfig, ModelParameters, PriceTable, SequentialScope};

/// Engine settings as they appear in a config file; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Root directory of the response caches.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Auto-approve ceiling in USD.
    #[serde(default)]
    pub auto_approve: Option<f64>,
    /// Parallel calls per endpoint identity.
    #[serde(default)]
    pub parallel_ceiling: Option<usize>,
    /// Concurrent token-counting calls.
    #[serde(default)]
    pub token_count_concurrency: Option<usize>,
    /// Token-counting retries.
    #[serde(default)]
    pub token_count_retries: Option<u32>,
    /// Shortest wait between dispatch scans.
    #[serde(default)]
    pub min_poll_interval_ms: Option<u64>,
    /// Longest wait between dispatch scans.
    #[serde(default)]
    pub max_poll_interval_ms: Option<u64>,
    /// Scope of the sequential slot.
    #[serde(default)]
    pub sequential_scope: Option<SequentialScope>,
}

/// CLI configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSection,

    /// Extra or overriding price table entries.
    #[serde(default)]
    pub models: Vec<ModelParameters>,
}

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    /// Get default global configuration file path.
    #[allow(clippy::disallowed_methods)]
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".tollgate")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".tollgaterc")
    }

    /// Loads the global config, then the local one on top. Missing files are skipped.
    pub fn discover_and_load() -> Result<Self> {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            if path.exists() {
                config.merge(Self::load_from_file(&path)?);
            }
        }
        Ok(config)
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some; model entries are
    /// appended, so later entries win in the price table.
    pub fn merge(&mut self, other: Self) {
        let (mine, theirs) = (&mut self.engine, other.engine);
        if theirs.cache_dir.is_some() {
            mine.cache_dir = theirs.cache_dir;
        }
        if theirs.auto_approve.is_some() {
            mine.auto_approve = theirs.auto_approve;
        }
        if theirs.parallel_ceiling.is_some() {
            mine.parallel_ceiling = theirs.parallel_ceiling;
        }
        if theirs.token_count_concurrency.is_some() {
            mine.token_count_concurrency = theirs.token_count_concurrency;
        }
        if theirs.token_count_retries.is_some() {
            mine.token_count_retries = theirs.token_count_retries;
        }
        if theirs.min_poll_interval_ms.is_some() {
            mine.min_poll_interval_ms = theirs.min_poll_interval_ms;
        }
        if theirs.max_poll_interval_ms.is_some() {
            mine.max_poll_interval_ms = theirs.max_poll_interval_ms;
        }
        if theirs.sequential_scope.is_some() {
            mine.sequential_scope = theirs.sequential_scope;
        }
        self.models.extend(other.models);
    }

    /// The built-in price table with this configuration's entries applied.
    pub fn price_table(&self) -> PriceTable {
        PriceTable::builtin().with_models(self.models.iter().cloned())
    }

    /// Engine configuration from the file settings and the environment.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        self.engine_config_with(|name| std::env::var(name).ok())
    }

    fn engine_config_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<EngineConfig> {
        let section = &self.engine;
        let defaults = EngineConfig::default();
        let mut config = EngineConfig {
            cache_dir: section.cache_dir.clone().unwrap_or(defaults.cache_dir),
            auto_approve: section.auto_approve.or(defaults.auto_approve),
            parallel_ceiling: section.parallel_ceiling.unwrap_or(defaults.parallel_ceiling),
            token_count_concurrency: section
                .token_count_concurrency
                .unwrap_or(defaults.token_count_concurrency),
            token_count_retries: section.token_count_retries.unwrap_or(defaults.token_count_retries),
            min_poll_interval_ms: section.min_poll_interval_ms.unwrap_or(defaults.min_poll_interval_ms),
            max_poll_interval_ms: section.max_poll_interval_ms.unwrap_or(defaults.max_poll_interval_ms),
            sequential_scope: section.sequential_scope.unwrap_or(defaults.sequential_scope),
        };

        if let Some(dir) = env("TOLLGATE_CACHE_DIR").filter(|v| !v.is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = env("TOLLGATE_AUTO_APPROVE") {
            config.auto_approve = parse_auto_approve(&value)?;
        }
        Ok(config)
    }
}

/// Parses an auto-approve ceiling; `none` (or an empty value) means "always ask".
fn parse_auto_approve(value: &str) -> Result<Option<f64>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(ceiling) if ceiling.is_finite() && ceiling >= 0.0 => Ok(Some(ceiling)),
        _ => bail!("Invalid TOLLGATE_AUTO_APPROVE value `{value}`: expected a non-negative amount or `none`"),
    }
}

/// Load and merge CLI configuration.
pub fn load_config() -> Result<CliConfig> {
    CliConfig::discover_and_load()
}
