// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Canopy CLI
//!
//! The `canopy` binary runs the coordinator and drives it over HTTP.
//!
//! ## Commands
//!
//! - `canopy serve` - Run the coordinator (API, timeout reaper, event handler)
//! - `canopy instance create|list|get|start|stop|pause|resume|terminate|hierarchy`
//! - `canopy task create|get|dispatch|delegate|accept|chain|complete`
//! - `canopy config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::debug;

use canopy_cli::commands::{self, ConfigCommand, InstanceCommand, TaskCommand};
use canopy_cli::daemon::{self, CoordinatorClient, CoordinatorStatus};
use canopy_core::domain::config::CoordinatorConfigManifest;

/// Canopy - hierarchical task routing coordinator
#[derive(Parser)]
#[command(name = "canopy")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "CANOPY_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Coordinator API port (serve: overrides config)
    #[arg(long, global = true, env = "CANOPY_PORT")]
    port: Option<u16>,

    /// Coordinator API host
    #[arg(long, global = true, env = "CANOPY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CANOPY_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    #[command(name = "serve")]
    Serve,

    /// Instance lifecycle and hierarchy
    #[command(name = "instance")]
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },

    /// Task routing and delegation
    #[command(name = "task")]
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

const DEFAULT_PORT: u16 = 8700;

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve) => {
            let mut config = CoordinatorConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            if let Some(port) = cli.port {
                config.spec.server.port = port;
            }
            let level = cli
                .log_level
                .unwrap_or_else(|| config.spec.observability.log_level.clone());
            init_logging(&level, &config.spec.observability.log_format)?;
            daemon::serve(config).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Instance { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            let client = connect(&cli.host, cli.port.unwrap_or(DEFAULT_PORT)).await?;
            commands::instance::handle_command(command, client).await
        }
        Some(Commands::Task { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            let client = connect(&cli.host, cli.port.unwrap_or(DEFAULT_PORT)).await?;
            commands::task::handle_command(command, client).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

async fn connect(host: &str, port: u16) -> Result<CoordinatorClient> {
    match daemon::check_coordinator_running(host, port).await {
        CoordinatorStatus::Running { uptime } => {
            debug!("Coordinator at {}:{} up for {:?}s", host, port, uptime);
            CoordinatorClient::new(host, port)
        }
        CoordinatorStatus::Unreachable { error } => anyhow::bail!(
            "Coordinator not reachable at {}: {}. Start it with `canopy serve`.",
            daemon::base_url(host, port),
            error
        ),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
