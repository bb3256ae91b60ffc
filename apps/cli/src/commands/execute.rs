//! Execute command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tollgate_abstraction::EndpointFamily;
use tollgate_engine::{Approver, AutoApprover, Response, StdinApprover, extract_text};
use tracing::warn;

use super::{build_engine, read_payloads};
use crate::config::CliConfig;
use crate::progress::BarObserver;

/// Options of the execute command.
#[derive(Debug)]
pub struct ExecuteOptions {
    pub family: EndpointFamily,
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub auto_approve: Option<f64>,
    pub cache_dir: Option<PathBuf>,
    pub yes: bool,
    pub text: bool,
}

/// Execute the execute command.
pub async fn execute(options: ExecuteOptions, cli_config: &CliConfig) -> Result<()> {
    let payloads = read_payloads(&options.input)?;
    let total = payloads.len();

    let engine = build_engine(options.family, options.cache_dir.as_deref(), cli_config, |config| {
        if options.auto_approve.is_some() {
            config.auto_approve = options.auto_approve;
        }
    })?;

    let bar = Arc::new(BarObserver::new(total));
    let approver: Arc<dyn Approver> = if options.yes { Arc::new(AutoApprover) } else { Arc::new(StdinApprover) };
    let engine = engine
        .with_approver(Arc::new(bar.suspending(approver)))
        .with_observer(bar.clone());

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });

    let result = engine.execute(payloads).await;
    bar.finish();
    let responses = result.context("Execution failed")?;

    let failed = responses.iter().filter(|r| !r.was_successful()).count();
    write_responses(&responses, options.output.as_ref(), options.text)?;

    let summary = format!("{} responses, {failed} failed", responses.len());
    if failed == 0 {
        eprintln!("{} {}", "✓".green(), summary);
    } else {
        eprintln!("{} {}", "!".yellow(), summary.yellow());
    }
    Ok(())
}

fn output_line(response: &Response, text: bool) -> Value {
    if text {
        extract_text(response.payload()).map_or(Value::Null, |t| Value::String(t.to_string()))
    } else {
        response.payload().clone()
    }
}

fn write_responses(responses: &[Response], output: Option<&PathBuf>, text: bool) -> Result<()> {
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);
    for response in responses {
        serde_json::to_writer(&mut writer, &output_line(response, text))?;
        writer.write_all(b"\n")?;
    }
    writer.flush().context("Failed to write responses")?;
    Ok(())
}
