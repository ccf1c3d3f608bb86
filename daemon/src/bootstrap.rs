//! Supervisor and keeper wiring
//!
//! The supervisor runs two services, both re-executions of our own binary
//! with an internal subcommand: the Postgres controller and the keeper
//! node-active loop. Re-execution gives each service its own process, so
//! the supervisor's restart discipline applies to real child processes.

use mizar_core::config::KeeperConfig;
use mizar_core::defaults::{SERVICE_NAME_KEEPER, SERVICE_NAME_POSTGRES};
use mizar_core::fsm::LocalFsm;
use mizar_core::keeper::Keeper;
use mizar_core::monitor::{FileStateSource, MonitorClient};
use mizar_core::pg::{PgCtl, PgDataProbe};
use mizar_core::pidfile::PidfileHeader;
use mizar_core::signals::SignalState;
use mizar_core::supervisor::{ExecCommand, Service, Supervisor};
use mizar_core::{CoreError, Result};
use nix::unistd::getppid;
use schema::RestartPolicy;
use std::path::Path;
use tracing::info;

/// Pidfile header lines for this node
fn pidfile_header(config: &KeeperConfig) -> PidfileHeader {
    PidfileHeader {
        data_directory: config.pgdata.display().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        state_file: config.state_file_path().display().to_string(),
    }
}

/// A service that re-executes our own binary with an internal subcommand
fn self_exec_service(name: &str, policy: RestartPolicy, config_path: &Path) -> Result<Service> {
    let exe = std::env::current_exe().map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to locate our own binary: {}", e))
    })?;
    let command = ExecCommand::new(
        exe.display().to_string(),
        vec![
            "do".to_string(),
            "service".to_string(),
            name.to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
        ],
    );
    Ok(Service::new(name, policy, Box::new(command)))
}

/// The ordered service list the supervisor runs: Postgres first, then the
/// keeper that talks to the monitor about it
pub fn build_services(config: &KeeperConfig) -> Result<Vec<Service>> {
    Ok(vec![
        self_exec_service(
            SERVICE_NAME_POSTGRES,
            RestartPolicy::Permanent,
            &config.config_path,
        )?,
        self_exec_service(
            SERVICE_NAME_KEEPER,
            RestartPolicy::Permanent,
            &config.config_path,
        )?,
    ])
}

/// `mizard run`: start the supervisor and supervise until termination
pub async fn run_supervisor(config: KeeperConfig) -> Result<i32> {
    let signals = SignalState::new();
    signals.install(false)?;

    let services = build_services(&config)?;
    let mut supervisor = Supervisor::new(
        services,
        config.pidfile_path(),
        pidfile_header(&config),
        signals,
    );

    let outcome = supervisor.start().await?;
    Ok(outcome.exit_code())
}

/// Build the monitor client for this configuration.
///
/// The SQL client speaking the monitor's wire protocol is a collaborator
/// provided by the deployment; this build ships the file-backed source used
/// with `monitor.disabled = true`.
fn build_monitor(config: &KeeperConfig) -> Result<Box<dyn MonitorClient>> {
    if config.monitor_disabled {
        Ok(Box::new(FileStateSource::new(
            config.state_file_path(),
            config.nodes_file_path(),
        )))
    } else {
        Err(CoreError::ConfigurationError(
            "monitor.uri requires a monitor protocol client; this build \
             supports monitor.disabled = true deployments"
                .to_string(),
        ))
    }
}

/// `mizard do service node-active`: the keeper loop child process
pub async fn run_node_active(config: KeeperConfig) -> Result<i32> {
    let signals = SignalState::new();
    // service processes exit on the spot when told to quit
    signals.install(true)?;

    let monitor = build_monitor(&config)?;
    let fsm = LocalFsm::new(Box::new(PgCtl::new(config.pgdata.clone())));
    let probe = PgDataProbe::new(config.pgdata.clone());

    // the supervisor is our parent, and its pid anchors the fencing check
    let supervisor_pid = getppid().as_raw();

    let mut keeper = Keeper::new(
        config,
        monitor,
        Box::new(fsm),
        Box::new(probe),
        signals,
        supervisor_pid,
    );

    let exit = match keeper.run().await {
        Ok(exit) => exit,
        Err(e @ CoreError::FencingLost(_)) => {
            // this process tree has been superseded, get out of the way
            tracing::error!("{}; quitting", e);
            return Ok(mizar_core::defaults::EXIT_CODE_QUIT);
        }
        Err(e) => return Err(e),
    };
    info!("node-active service is done");
    Ok(exit.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> KeeperConfig {
        KeeperConfig {
            config_path: PathBuf::from("/etc/mizar.toml"),
            node_name: "node_1".to_string(),
            node_host: "localhost".to_string(),
            node_port: 5432,
            pgdata: PathBuf::from("/var/lib/postgres/data"),
            replication_user: "repl".to_string(),
            monitor_uri: None,
            monitor_disabled: true,
            network_partition_timeout: 20,
        }
    }

    #[test]
    fn services_are_ordered_postgres_then_keeper() {
        let services = build_services(&config()).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, SERVICE_NAME_POSTGRES);
        assert_eq!(services[1].name, SERVICE_NAME_KEEPER);
        assert_eq!(services[0].policy, RestartPolicy::Permanent);
        assert_eq!(services[1].policy, RestartPolicy::Permanent);
    }

    #[test]
    fn monitor_uri_without_a_client_is_a_config_error() {
        let mut cfg = config();
        cfg.monitor_disabled = false;
        cfg.monitor_uri = Some("postgres://monitor/ha".to_string());
        assert!(matches!(
            build_monitor(&cfg),
            Err(CoreError::ConfigurationError(_))
        ));
    }

    #[test]
    fn disabled_monitor_uses_the_file_state_source() {
        let monitor = build_monitor(&config()).unwrap();
        assert!(!monitor.is_enabled());
    }
}
