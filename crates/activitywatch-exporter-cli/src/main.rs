// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use activitywatch_exporter::config::{Config, DEFAULT_CONFIG_PATH};

const LOG_LEVEL_ENV: &str = "AW_EXPORTER_LOG_LEVEL";

/// Exports ActivityWatch events to InfluxDB.
#[derive(Debug, Parser)]
#[command(name = "activitywatch-exporter", version, about)]
struct Cli {
    /// Number of days in the past to fetch
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    days: u32,

    /// Path of the JSON configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("could not set up logging: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match activitywatch_exporter::run(&config, cli.days).await {
        Ok(report) => {
            info!(
                "Exported {} records from {} buckets ({} bytes compressed)",
                report.records, report.sources, report.compressed_bytes
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
