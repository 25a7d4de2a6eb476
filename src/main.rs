//! Monthly table archiver
//!
//! Exports one month of a Postgres table day by day, converts every day to
//! Parquet and uploads it to Cloud Object Storage under `{year}/{month}/`.

// tablearchiver/src/main.rs
mod backup;
mod config;
mod errors;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use config::AppConfig;
use errors::BackupError;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Back up one month of a table to object storage as daily Parquet files.
#[derive(Parser, Debug)]
#[command(name = "tablearchiver", version)]
struct CliArgs {
    /// Path to the JSON configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let app_config = match AppConfig::load_from_json(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_logging(&app_config.job.log_file) {
        eprintln!("❌ Error: {:?}", e);
        return ExitCode::FAILURE;
    }

    match run_app(&app_config).await {
        Ok(()) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "==== Processing Failed ====");
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args() -> std::result::Result<CliArgs, BackupError> {
    match CliArgs::try_parse() {
        Ok(args) => Ok(args),
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => Err(BackupError::Configuration {
            message: "Illegal number of arguments. Usage: tablearchiver <config.json>".to_string(),
            source: Some(Box::new(e)),
        }),
    }
}

async fn run_app(app_config: &AppConfig) -> Result<()> {
    info!("==== Processing Started ====");
    info!(
        endpoint = %app_config.storage.endpoint_url,
        bucket = %app_config.storage.bucket_name,
        table = %app_config.database.table,
        month = %app_config.job.month,
        year = app_config.job.year,
        "Loaded configuration"
    );

    let summary = backup::run_backup_flow(app_config)
        .await
        .context("Backup process failed")?;

    info!(
        days = summary.days_processed,
        bytes_exported = summary.bytes_exported,
        rows = summary.rows_converted,
        bytes_uploaded = summary.bytes_uploaded,
        "==== Processing Ended ===="
    );
    println!(
        "Uploaded {} daily files ({} rows, {} bytes) to bucket {}",
        summary.days_processed,
        summary.rows_converted,
        summary.bytes_uploaded,
        app_config.storage.bucket_name
    );
    Ok(())
}

/// Logs to stdout and appends to `log_file`. `RUST_LOG` overrides the
/// default filter.
fn setup_logging(log_file: &Path) -> Result<()> {
    if let Some(directory) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tablearchiver=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}
