//! Mizar daemon binary
//!
//! `mizard run` starts the supervisor with its two services (the Postgres
//! controller and the keeper node-active loop). The other subcommands are
//! thin operator tools that locate the running instance through its pidfile.

#![allow(unused_crate_dependencies)]

use clap::{Parser, Subcommand};
use daemon::{bootstrap, postgres_service};
use mizar_core::config::KeeperConfig;
use mizar_core::defaults::{EXIT_CODE_BAD_CONFIG, EXIT_CODE_INTERNAL_ERROR, EXIT_CODE_QUIT};
use mizar_core::keeper::state::load_or_init_state;
use mizar_core::supervisor::signal_supervisor;
use mizar_core::{pidfile, CoreError, Result};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mizard")]
#[command(about = "Mizar: a high-availability agent for PostgreSQL nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and its services
    Run {
        /// Path to the keeper configuration file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Stop the running instance (SIGTERM, or SIGINT with --fast)
    Stop {
        /// Path to the keeper configuration file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Fast shutdown instead of smart shutdown
        #[arg(long)]
        fast: bool,
    },
    /// Ask the running instance to reload its configuration
    Reload {
        /// Path to the keeper configuration file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Show the running services and the keeper state
    Status {
        /// Path to the keeper configuration file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Internal entry points used by the supervisor
    #[command(subcommand, hide = true)]
    Do(DoCommand),
}

#[derive(Subcommand)]
enum DoCommand {
    /// Run one of the supervised services in the foreground
    #[command(subcommand)]
    Service(ServiceCommand),
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// The keeper node-active loop
    NodeActive {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// The Postgres controller
    Postgres {
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &CoreError) -> i32 {
    match err {
        CoreError::ConfigurationError(_) => EXIT_CODE_BAD_CONFIG,
        _ => EXIT_CODE_INTERNAL_ERROR,
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run { config } => bootstrap::run_supervisor(KeeperConfig::load(config)?).await,
        Commands::Stop { config, fast } => {
            let config = KeeperConfig::load(config)?;
            let sig = if fast {
                Signal::SIGINT
            } else {
                Signal::SIGTERM
            };
            let pid = signal_supervisor(&config.pidfile_path(), sig)?;
            info!("Sent {} to the mizar supervisor with pid {}", sig, pid);
            Ok(EXIT_CODE_QUIT)
        }
        Commands::Reload { config } => {
            let config = KeeperConfig::load(config)?;
            let pid = signal_supervisor(&config.pidfile_path(), Signal::SIGHUP)?;
            info!(
                "Asked the mizar supervisor with pid {} to reload its configuration",
                pid
            );
            Ok(EXIT_CODE_QUIT)
        }
        Commands::Status { config, json } => status(KeeperConfig::load(config)?, json),
        Commands::Do(DoCommand::Service(service)) => match service {
            ServiceCommand::NodeActive { config } => {
                bootstrap::run_node_active(KeeperConfig::load(config)?).await
            }
            ServiceCommand::Postgres { config } => {
                postgres_service::run_postgres_service(KeeperConfig::load(config)?).await
            }
        },
    }
}

fn status(config: KeeperConfig, json: bool) -> Result<i32> {
    let mut js = pidfile::pidfile_as_json(&config.pidfile_path(), true)?;
    let state = load_or_init_state(config.state_file_path())?;

    if json {
        js["state"] = serde_json::to_value(&state)?;
        println!("{}", serde_json::to_string_pretty(&js)?);
        return Ok(EXIT_CODE_QUIT);
    }

    println!(
        "mizar pid {} ({}), version {}",
        js["pid"],
        js["status"].as_str().unwrap_or("unknown"),
        js["version"].as_str().unwrap_or("unknown"),
    );
    println!("pgdata: {}", js["pgdata"].as_str().unwrap_or("unknown"));

    if let Some(services) = js["services"].as_array() {
        for service in services {
            println!(
                "service {}: pid {} ({})",
                service["name"].as_str().unwrap_or("unknown"),
                service["pid"],
                service["status"].as_str().unwrap_or("unknown"),
            );
        }
    }

    println!(
        "current role: {}, assigned role: {}",
        state.current_role, state.assigned_role
    );
    if state.last_monitor_contact > 0 {
        let ts = UNIX_EPOCH + Duration::from_secs(state.last_monitor_contact);
        println!(
            "last monitor contact: {}",
            humantime::format_rfc3339_seconds(ts)
        );
    }
    if state.last_secondary_contact > 0 {
        let ts = UNIX_EPOCH + Duration::from_secs(state.last_secondary_contact);
        println!(
            "last standby contact: {}",
            humantime::format_rfc3339_seconds(ts)
        );
    }

    Ok(EXIT_CODE_QUIT)
}
