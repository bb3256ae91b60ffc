//! Models command implementation.

use anyhow::Result;
use colored::Colorize;

use crate::config::CliConfig;

/// Execute the models command.
pub fn execute(json_output: bool, cli_config: &CliConfig) -> Result<()> {
    let prices = cli_config.price_table();
    let entries = prices.entries();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Known Models ({})", entries.len()).bold().cyan());
    println!();
    println!(
        "{:<30} {:<10} {:>12} {:>12} {:>9} {:>10}",
        "Model", "Family", "In $/1k", "Out $/1k", "Context", "Max out"
    );
    println!("{}", "─".repeat(88));

    for params in entries {
        println!(
            "{:<30} {:<10} {:>12} {:>12} {:>9} {:>10}",
            params.model.cyan(),
            params.family.to_string().dimmed(),
            format!("{:.5}", params.cost_per_1k_input_tokens),
            format!("{:.5}", params.cost_per_1k_output_tokens),
            params.max_context,
            params.max_output_tokens
        );
    }
    println!();
    Ok(())
}
