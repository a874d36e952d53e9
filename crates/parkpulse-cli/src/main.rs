use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use is_terminal::IsTerminal;
use parkpulse_sync::{build_scheduler, migrate, Pipelines, SyncConfig, DEFAULT_SYNC_DAYS};
use parkpulse_web::AppState;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parkpulse")]
#[command(about = "Theme-park crowd, live-status and weather sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import crowd-calendar predictions for one year.
    ImportCrowds {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Sync live park status, attraction waits and operating hours.
    SyncParks {
        #[arg(long, default_value_t = DEFAULT_SYNC_DAYS)]
        days: u32,
    },
    /// Fetch and aggregate the weather forecast.
    FetchWeather,
    /// Create the store schema.
    Migrate,
    /// Serve the HTTP triggers, plus the scheduler when enabled.
    Serve,
}

/// `RUST_LOG` wins; otherwise `PARKPULSE_LOG_LEVEL` (default `info`).
/// Colour follows the terminal unless `FORCE_COLOR` says otherwise.
fn init_tracing() {
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("PARKPULSE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

fn print_summary<T: Serialize>(summary: &T, success: bool) -> Result<ExitCode> {
    println!(
        "{}",
        serde_json::to_string_pretty(summary).context("encoding run summary")?
    );
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(cli: Cli, config: SyncConfig) -> Result<ExitCode> {
    match cli.command {
        Commands::ImportCrowds { year } => {
            let pipelines = Pipelines::from_config(&config).await?;
            let year = year.unwrap_or_else(|| Utc::now().year());
            let summary = pipelines.crowd_import.run(year).await?;
            print_summary(&summary, summary.success)
        }
        Commands::SyncParks { days } => {
            let pipelines = Pipelines::from_config(&config).await?;
            let summary = pipelines.park_sync.run(days, Utc::now()).await?;
            print_summary(&summary, summary.run.success)
        }
        Commands::FetchWeather => {
            let pipelines = Pipelines::from_config(&config).await?;
            let summary = pipelines.weather.run(Utc::now()).await?;
            print_summary(&summary, summary.success)
        }
        Commands::Migrate => {
            migrate(&config).await?;
            info!("schema ready");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            let pipelines = Pipelines::from_config(&config).await?;
            let scheduler = build_scheduler(&config, &pipelines).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            } else {
                info!("scheduler disabled");
            }
            parkpulse_web::serve(AppState::new(pipelines), config.web_port).await?;
            if let Some(mut sched) = scheduler {
                if let Err(err) = sched.shutdown().await {
                    warn!(error = %err, "scheduler shutdown failed");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    config.log_config();

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}
