//! Estimate command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tollgate_abstraction::EndpointFamily;

use super::{build_engine, read_payloads};
use crate::config::CliConfig;

/// Execute the estimate command.
pub async fn execute(
    family: EndpointFamily,
    input: &Path,
    cache_dir: Option<PathBuf>,
    json_output: bool,
    cli_config: &CliConfig,
) -> Result<()> {
    let payloads = read_payloads(input)?;
    let engine = build_engine(family, cache_dir.as_deref(), cli_config, |_| {})?;
    let estimate = engine.estimate(payloads).await.context("Estimation failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Batch estimate ({family})").bold().cyan());
    println!();
    println!("  {:<20} {}", "Requests:", estimate.total);
    println!("  {:<20} {}", "Cached:", estimate.cached.to_string().green());
    println!("  {:<20} {}", "To send:", estimate.uncached);
    println!("  {:<20} {}", "Max input tokens:", estimate.max_input_tokens);
    println!("  {:<20} {}", "Max output tokens:", estimate.max_output_tokens);
    println!("  {:<20} {}", "Max cost:", format!("${:.4}", estimate.max_cost).yellow());
    println!();
    Ok(())
}
