//! # Plantlink
//!
//! Command line entry point of the gateway.
//!
//! - `run` starts the configured programs and supervises them until SIGINT
//!   or SIGTERM.
//! - `once <program>` runs a single cycle of one program and prints its report.
//! - `migrate` applies the database schema.
//! - `check-config` validates the configuration and prints it with secrets
//!   redacted.
//!
//! Settings come from the TOML file given with `--config` (or
//! `PLANTLINK_CONFIG`) and the environment, see [`plantlink::config`].

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateway_actors::tracing::{setup_tracing_with, TracingOptions};
use plantlink::aggregator::HttpAggregator;
use plantlink::config::{AppConfig, LogFormat};
use plantlink::context::Deps;
use plantlink::db::{self, PgStore};
use plantlink::lifecycle::{run_once, GatewaySystem, Program};
use plantlink::modbus::TcpConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "plantlink")]
#[command(version)]
#[command(about = "Solar plant and battery gateway for aggregator control", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PLANTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run programs until interrupted
    Run {
        /// Program to run; repeat for several. Defaults to `supervisor.programs`.
        #[arg(short, long = "program", value_enum)]
        programs: Vec<Program>,
    },

    /// Run one cycle of a program and print the report
    Once {
        #[arg(value_enum)]
        program: Program,
    },

    /// Apply database migrations
    Migrate,

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Commands::CheckConfig = cli.command {
        return check_config(&config);
    }

    let options = TracingOptions {
        default_directive: if cli.verbose { "debug" } else { "info" }.to_string(),
        log_file: config.logging.log_file(),
        compact: config.logging.format == LogFormat::Compact,
    };
    setup_tracing_with(&options).context("failed to open log file")?;

    config.validate()?;

    match cli.command {
        Commands::Run { programs } => {
            let programs = if programs.is_empty() {
                config.supervisor.programs.clone()
            } else {
                programs
            };
            run(programs, config).await
        }
        Commands::Once { program } => {
            let deps = connect(&config).await?;
            let report = run_once(program, &config, &deps).await?;
            println!("{report}");
            Ok(())
        }
        Commands::Migrate => {
            let pool = db::postgres::connect(&config.database).await?;
            db::postgres::migrate(&pool).await?;
            info!("Migrations applied");
            Ok(())
        }
        Commands::CheckConfig => Ok(()),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let rendered = toml::to_string_pretty(&config.redact_secrets())?;
    println!("{rendered}");
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<Deps> {
    let pool = db::postgres::connect(&config.database)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = PgStore::new(pool, config.control.notify_channel.clone());
    let aggregator = HttpAggregator::new(&config.aggregator)?;
    Ok(Deps::new(
        Arc::new(store),
        Arc::new(TcpConnector),
        Arc::new(aggregator),
    ))
}

async fn run(programs: Vec<Program>, config: AppConfig) -> Result<()> {
    info!(programs = ?programs, "Starting plantlink");
    let deps = connect(&config).await?;
    let system = GatewaySystem::start(&programs, &config, deps);

    let mut status_timer = tokio::time::interval(config.supervisor.status_interval());
    status_timer.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                break;
            }
            _ = status_timer.tick() => system.log_status().await,
        }
    }

    system.shutdown().await.map_err(anyhow::Error::msg)
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
