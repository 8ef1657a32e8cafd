//! Runflow Daemon - process host for the orchestration core
//!
//! The daemon wires together:
//! - The in-process event bus
//! - The rule engine, listening to record mutations
//! - The orchestration engine and its event triggers
//! - The durable scheduling queue and its workers

use anyhow::Context;
use clap::Parser;
use runflow_engine::{init_tracing, LogFormat, RunflowConfig};

mod error;
mod seed;
mod server;

use error::{DaemonError, DaemonResult};
use server::Server;

/// Runflow Daemon CLI
#[derive(Parser)]
#[command(name = "runflowd")]
#[command(about = "Runflow Daemon - rules, orchestration and durable scheduling", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RUNFLOW_CONFIG")]
    config: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "RUNFLOW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, env = "RUNFLOW_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Directory of run definition JSON files
    #[arg(long, env = "RUNFLOW_DEFINITIONS_DIR")]
    definitions: Option<std::path::PathBuf>,

    /// Directory of business rule JSON files
    #[arg(long, env = "RUNFLOW_RULES_DIR")]
    rules: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RunflowConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))
        .context("loading configuration")?;
    apply_overrides(&mut config, cli);

    init_tracing(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        deployment_id = %config.engine.deployment_id,
        "Runflow daemon starting"
    );

    run(config).await.context("runflow daemon failed")?;
    Ok(())
}

async fn run(config: RunflowConfig) -> DaemonResult<()> {
    let server = Server::new(config).await?;
    server.run().await
}

fn apply_overrides(config: &mut RunflowConfig, cli: Cli) {
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if cli.definitions.is_some() {
        config.daemon.definitions_dir = cli.definitions;
    }
    if cli.rules.is_some() {
        config.daemon.rules_dir = cli.rules;
    }
}
