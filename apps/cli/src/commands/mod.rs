//! Command implementations for the Tollgate CLI.

pub mod estimate;
pub mod execute;
pub mod models;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tollgate_abstraction::{Endpoint, EndpointFamily, Payload};
use tollgate_engine::{EndpointFactory, Engine, EngineConfig, PriceTable};

use crate::config::CliConfig;

/// Reads one JSON object per non-empty line.
pub fn read_payloads(path: &Path) -> Result<Vec<Payload>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file {}", path.display()))?;
    parse_payloads(&content).with_context(|| format!("Invalid input file {}", path.display()))
}

fn parse_payloads(content: &str) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("line {}: not valid JSON", number + 1))?;
        let Value::Object(payload) = value else {
            bail!("line {}: expected a JSON object", number + 1);
        };
        payloads.push(payload);
    }
    Ok(payloads)
}

/// Builds an engine for `family` from the configuration, with `cache_dir` taking precedence.
pub fn build_engine(
    family: EndpointFamily,
    cache_dir: Option<&Path>,
    cli_config: &CliConfig,
    tweak: impl FnOnce(&mut EngineConfig),
) -> Result<Engine> {
    let prices = Arc::new(cli_config.price_table());
    let mut config = cli_config.engine_config()?;
    if let Some(dir) = cache_dir {
        config.cache_dir = dir.to_path_buf();
    }
    tweak(&mut config);

    let endpoint: Arc<dyn Endpoint> = EndpointFactory::from_env(family, Arc::clone(&prices));
    let engine = Engine::new(endpoint, config).context("Invalid engine configuration")?;
    Ok(engine.with_prices(prices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payloads_skips_blank_lines() {
        let payloads = parse_payloads("{\"model\": \"a\"}\n\n  \n{\"model\": \"b\"}\n").unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1]["model"], "b");
    }

    #[test]
    fn test_parse_payloads_reports_line() {
        let err = parse_payloads("{}\n[1, 2]\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let err = parse_payloads("{}\n{}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }
}
