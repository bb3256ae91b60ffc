//! Tollgate CLI - batch execution of generation requests under budget control.
//!
//! This CLI provides a `tollgate` command that reads request payloads from a JSON-lines file,
//! runs them through the execution engine and writes one response per line, in input order.

mod commands;
mod config;
mod progress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tollgate_abstraction::EndpointFamily;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Tollgate CLI - cached, budget-aware execution of LLM request batches
#[derive(Parser, Debug)]
#[command(
    name = "tollgate",
    author,
    version,
    about = "Tollgate - cached, budget-aware execution of LLM request batches",
    long_about = "Tollgate executes batches of generation requests against Anthropic, OpenAI or Ollama.\nResponses are cached by request fingerprint, spend is estimated and confirmed before anything is sent,\nand dispatch adapts to the quota each endpoint reports."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a batch of requests
    ///
    /// Reads one JSON request payload per line and writes one response payload per line,
    /// in input order. Failed requests produce `null` or the vendor's error body.
    Execute {
        /// Endpoint family (anthropic, openai, ollama)
        #[arg(short, long)]
        family: EndpointFamily,

        /// JSON-lines file with one request payload per line
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Largest estimated spend in USD that proceeds without confirmation
        #[arg(long)]
        auto_approve: Option<f64>,

        /// Root directory of the response caches
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Proceed without asking, whatever the estimated spend
        #[arg(short, long)]
        yes: bool,

        /// Write the generated text of each response instead of the full payload
        #[arg(long)]
        text: bool,
    },

    /// Estimate the spend of a batch without sending anything
    Estimate {
        /// Endpoint family (anthropic, openai, ollama)
        #[arg(short, long)]
        family: EndpointFamily,

        /// JSON-lines file with one request payload per line
        #[arg(short, long)]
        input: PathBuf,

        /// Root directory of the response caches
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the known models with their prices and limits
    Models {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration
    let cli_config = config::load_config()?;

    match args.command {
        Command::Execute { family, input, output, auto_approve, cache_dir, yes, text } => {
            let options = commands::execute::ExecuteOptions {
                family,
                input,
                output,
                auto_approve,
                cache_dir,
                yes,
                text,
            };
            commands::execute::execute(options, &cli_config).await
        }
        Command::Estimate { family, input, cache_dir, json } => {
            commands::estimate::execute(family, &input, cache_dir, json, &cli_config).await
        }
        Command::Models { json } => commands::models::execute(json, &cli_config),
    }
}
