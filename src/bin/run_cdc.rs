//! CDC operator binary: runs one CDC pass over the configured tables.
//!
//! Individual table failures are reported in the logs but do not fail
//! the process; only a configuration or startup failure exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cdc_rs::cdc::{CdcService, TableOutcome};
use cdc_rs::config::{Config, CONFIG_PATH_ENV};

#[derive(Parser, Debug)]
#[command(name = "run_cdc", about = "Run CDC operations on configured tables")]
struct Args {
    /// Specific table names to process. If not provided, all configured
    /// tables will be processed.
    #[arg(long, num_args = 0..)]
    tables: Vec<String>,
    /// Path to the configuration file (overrides CDC_CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
        .with_context(|| {
            format!(
                "no configuration path provided; set {} or use --config",
                CONFIG_PATH_ENV
            )
        })?;
    let config =
        Arc::new(Config::from_path(&config_path).context("failed to load configuration")?);
    let service =
        CdcService::new(Arc::clone(&config)).context("failed to initialize CDC service")?;

    // An unreachable bucket fails every table below; surface it early
    // but let the run produce its per-table report.
    if let Err(err) = service.states().ensure_available().await {
        tracing::error!(error = %err, "object store probe failed");
    }

    let tables = (!args.tables.is_empty()).then_some(args.tables.as_slice());
    let report = service.run(tables).await;

    for (table, outcome) in &report.results {
        match outcome {
            TableOutcome::Success { method, changes, .. } => {
                tracing::info!(
                    table = %table,
                    method = %method,
                    added = changes.added,
                    modified = changes.modified,
                    deleted = changes.deleted,
                    "table processed successfully"
                );
            }
            TableOutcome::Error { message } => {
                tracing::error!(table = %table, message = %message, "failed to process table");
            }
        }
    }

    service.close().await;
    tracing::info!("CDC operations completed");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{:#}", err).as_str(), "run aborted");
            ExitCode::FAILURE
        }
    }
}
