//! The Postgres controller service
//!
//! A small child process with one job: keep the local Postgres instance in
//! the run-state the keeper's current role calls for. It watches the
//! persisted keeper state and reconciles the postmaster against it every
//! tick, so a Postgres crash is repaired without waiting for the next
//! keeper cycle, and a demoted node's Postgres stays down even if something
//! restarts it.

use mizar_core::config::KeeperConfig;
use mizar_core::defaults::{EXIT_CODE_QUIT, SUPERVISOR_TICK};
use mizar_core::keeper::state::load_or_init_state;
use mizar_core::pg::{PgCtl, PostgresController};
use mizar_core::pidfile;
use mizar_core::signals::SignalState;
use mizar_core::Result;
use nix::unistd::getppid;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// `mizard do service postgres`: reconcile the postmaster with the keeper
/// state until asked to stop
pub async fn run_postgres_service(config: KeeperConfig) -> Result<i32> {
    let signals = SignalState::new();
    signals.install(true)?;

    let supervisor_pid = getppid().as_raw();
    let pidfile_path = config.pidfile_path();
    let state_file = config.state_file_path();
    let mut controller = PgCtl::new(config.pgdata.clone());

    info!(
        "mizar postgres controller is starting for \"{}\"",
        config.pgdata.display()
    );

    let mut interval = tokio::time::interval(SUPERVISOR_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        if signals.shutdown_requested() {
            break;
        }

        // same fencing rule as everyone else: when the supervisor lost the
        // pidfile, this whole process tree has been superseded
        if let Err(e) = pidfile::check_pidfile(&pidfile_path, supervisor_pid) {
            error!("{}; quitting", e);
            return Ok(EXIT_CODE_QUIT);
        }

        let state = match load_or_init_state(&state_file) {
            Ok(state) => state,
            Err(e) => {
                debug!("Failed to read keeper state file, retrying: {}", e);
                continue;
            }
        };

        let expected = state.current_role.expects_postgres_running();
        let running = controller.is_running().await;

        if expected && !running {
            info!(
                "Postgres should be running in state \"{}\", starting it",
                state.current_role
            );
            if let Err(e) = controller.start_postgres().await {
                warn!("Failed to start Postgres: {}", e);
            }
        } else if !expected && running {
            warn!(
                "Postgres is running while in state \"{}\", stopping Postgres",
                state.current_role
            );
            if let Err(e) = controller.stop_postgres().await {
                warn!("Failed to stop Postgres: {}", e);
            }
        }
    }

    // a graceful stop of the whole agent takes Postgres down with it
    info!("mizar postgres controller is stopping");
    if let Err(e) = controller.stop_postgres().await {
        warn!("Failed to stop Postgres during shutdown: {}", e);
    }

    Ok(EXIT_CODE_QUIT)
}
