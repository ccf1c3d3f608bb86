//! Local Postgres probe and controller
//!
//! Two narrow interfaces onto the local Postgres instance: the probe answers
//! "what is Postgres actually doing right now", the controller starts and
//! stops it. The implementations shipped here work from the data directory
//! and `pg_ctl`; a deployment that can speak SQL to the instance plugs in a
//! richer probe behind the same traits.

use crate::pidfile::pid_is_live;
use crate::{CoreError, Result};
use async_trait::async_trait;
use schema::PgStatus;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Read-only view of the local Postgres instance
#[async_trait]
pub trait PostgresProbe: Send {
    /// Whether the postmaster is running
    async fn is_running(&mut self) -> bool;

    /// Whether the instance currently accepts writes (not in recovery)
    async fn is_primary(&mut self) -> Result<bool>;

    /// Whether a standby is connected for replication as `user`. Probed
    /// locally, independent of the monitor: a primary that still has a
    /// replica attached is not isolated.
    async fn has_replica_connected(&mut self, user: &str) -> Result<bool>;

    /// Full status snapshot used for monitor reports
    async fn status(&mut self) -> Result<PgStatus>;
}

/// Start/stop control over the local Postgres instance
#[async_trait]
pub trait PostgresController: Send {
    /// Whether the postmaster is running
    async fn is_running(&mut self) -> bool;

    /// Start Postgres and wait until it accepts connections
    async fn start_postgres(&mut self) -> Result<()>;

    /// Stop Postgres, waiting for shutdown to complete. Idempotent.
    async fn stop_postgres(&mut self) -> Result<()>;
}

/// Pid of the running postmaster in `pgdata`, if any
pub fn postmaster_pid(pgdata: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(pgdata.join("postmaster.pid")).ok()?;
    let pid: i32 = contents.lines().next()?.trim().parse().ok()?;
    (pid > 0 && pid_is_live(pid)).then_some(pid)
}

/// Probe working from the data directory alone.
///
/// Running and recovery status come from `postmaster.pid` and
/// `standby.signal`; replica detection needs `pg_stat_replication` and is
/// therefore answered by a SQL-capable probe, not this one.
pub struct PgDataProbe {
    pgdata: PathBuf,
}

impl PgDataProbe {
    pub fn new(pgdata: PathBuf) -> Self {
        Self { pgdata }
    }

    fn in_recovery(&self) -> bool {
        self.pgdata.join("standby.signal").exists()
    }
}

#[async_trait]
impl PostgresProbe for PgDataProbe {
    async fn is_running(&mut self) -> bool {
        postmaster_pid(&self.pgdata).is_some()
    }

    async fn is_primary(&mut self) -> Result<bool> {
        Ok(self.is_running().await && !self.in_recovery())
    }

    async fn has_replica_connected(&mut self, user: &str) -> Result<bool> {
        debug!(
            "Data-directory probe cannot see replication connections for \"{}\"",
            user
        );
        Ok(false)
    }

    async fn status(&mut self) -> Result<PgStatus> {
        Ok(PgStatus {
            is_running: self.is_running().await,
            is_in_recovery: self.in_recovery(),
            sync_state: None,
            current_lsn: None,
        })
    }
}

/// Controller shelling out to `pg_ctl`
pub struct PgCtl {
    pgdata: PathBuf,
    pg_ctl: String,
}

impl PgCtl {
    pub fn new(pgdata: PathBuf) -> Self {
        Self {
            pgdata,
            pg_ctl: "pg_ctl".to_string(),
        }
    }

    /// Use a specific pg_ctl binary instead of the one on PATH
    pub fn with_pg_ctl(mut self, pg_ctl: impl Into<String>) -> Self {
        self.pg_ctl = pg_ctl.into();
        self
    }

    async fn run_pg_ctl(&self, args: &[&str]) -> Result<()> {
        debug!("{} {:?}", self.pg_ctl, args);
        let output = Command::new(&self.pg_ctl)
            .arg("-D")
            .arg(&self.pgdata)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                CoreError::ProcessSpawn(format!("Failed to run {}: {}", self.pg_ctl, e))
            })?;

        if !output.status.success() {
            return Err(CoreError::ServiceError(format!(
                "{} {:?} failed with status {:?}: {}",
                self.pg_ctl,
                args,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PostgresController for PgCtl {
    async fn is_running(&mut self) -> bool {
        postmaster_pid(&self.pgdata).is_some()
    }

    async fn start_postgres(&mut self) -> Result<()> {
        info!("Starting Postgres in \"{}\"", self.pgdata.display());
        self.run_pg_ctl(&["start", "--wait"]).await
    }

    async fn stop_postgres(&mut self) -> Result<()> {
        if !self.is_running().await {
            return Ok(());
        }
        info!("Stopping Postgres in \"{}\"", self.pgdata.display());
        self.run_pg_ctl(&["stop", "--mode", "fast", "--wait"]).await
    }
}

/// Settable probe and controller stand-ins for tests
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Shared {
        running: bool,
        in_recovery: bool,
        has_replica: bool,
        probe_fails: bool,
        starts: u32,
        stops: u32,
    }

    /// Handle controlling a [`MockProbe`]/[`MockController`] pair's world
    #[derive(Debug, Clone, Default)]
    pub struct PgHandle {
        shared: Arc<Mutex<Shared>>,
    }

    impl PgHandle {
        pub fn set_running(&self, running: bool) {
            self.shared.lock().unwrap().running = running;
        }

        pub fn set_in_recovery(&self, in_recovery: bool) {
            self.shared.lock().unwrap().in_recovery = in_recovery;
        }

        pub fn set_has_replica(&self, has_replica: bool) {
            self.shared.lock().unwrap().has_replica = has_replica;
        }

        /// Make status probes fail until cleared
        pub fn set_probe_fails(&self, fails: bool) {
            self.shared.lock().unwrap().probe_fails = fails;
        }

        pub fn running(&self) -> bool {
            self.shared.lock().unwrap().running
        }

        pub fn starts(&self) -> u32 {
            self.shared.lock().unwrap().starts
        }

        pub fn stops(&self) -> u32 {
            self.shared.lock().unwrap().stops
        }
    }

    /// A [`PostgresProbe`] answering from settable flags
    pub struct MockProbe {
        handle: PgHandle,
    }

    impl MockProbe {
        pub fn new() -> (Self, PgHandle) {
            let handle = PgHandle::default();
            (
                Self {
                    handle: handle.clone(),
                },
                handle,
            )
        }

        /// A probe sharing the world of an existing handle
        pub fn with_handle(handle: PgHandle) -> Self {
            Self { handle }
        }
    }

    #[async_trait]
    impl PostgresProbe for MockProbe {
        async fn is_running(&mut self) -> bool {
            self.handle.shared.lock().unwrap().running
        }

        async fn is_primary(&mut self) -> Result<bool> {
            let shared = self.handle.shared.lock().unwrap();
            Ok(shared.running && !shared.in_recovery)
        }

        async fn has_replica_connected(&mut self, _user: &str) -> Result<bool> {
            Ok(self.handle.shared.lock().unwrap().has_replica)
        }

        async fn status(&mut self) -> Result<PgStatus> {
            let shared = self.handle.shared.lock().unwrap();
            if shared.probe_fails {
                return Err(CoreError::ServiceError(
                    "scripted probe failure".to_string(),
                ));
            }
            Ok(PgStatus {
                is_running: shared.running,
                is_in_recovery: shared.in_recovery,
                sync_state: None,
                current_lsn: None,
            })
        }
    }

    /// A [`PostgresController`] mutating the same settable flags
    pub struct MockController {
        handle: PgHandle,
    }

    impl MockController {
        pub fn new() -> (Self, PgHandle) {
            let handle = PgHandle::default();
            (
                Self {
                    handle: handle.clone(),
                },
                handle,
            )
        }

        /// A controller sharing the world of an existing handle
        pub fn with_handle(handle: PgHandle) -> Self {
            Self { handle }
        }
    }

    #[async_trait]
    impl PostgresController for MockController {
        async fn is_running(&mut self) -> bool {
            self.handle.shared.lock().unwrap().running
        }

        async fn start_postgres(&mut self) -> Result<()> {
            let mut shared = self.handle.shared.lock().unwrap();
            shared.starts += 1;
            shared.running = true;
            Ok(())
        }

        async fn stop_postgres(&mut self) -> Result<()> {
            let mut shared = self.handle.shared.lock().unwrap();
            shared.stops += 1;
            shared.running = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn probe_reports_not_running_without_postmaster_pid() {
        let dir = tempdir().unwrap();
        let mut probe = PgDataProbe::new(dir.path().to_path_buf());
        assert!(!probe.is_running().await);
        assert!(!probe.is_primary().await.unwrap());
    }

    #[tokio::test]
    async fn probe_recognizes_a_live_postmaster_pid() {
        let dir = tempdir().unwrap();
        // our own pid stands in for a live postmaster
        std::fs::write(
            dir.path().join("postmaster.pid"),
            format!("{}\n{}\n", std::process::id(), dir.path().display()),
        )
        .unwrap();

        let mut probe = PgDataProbe::new(dir.path().to_path_buf());
        assert!(probe.is_running().await);
        assert!(probe.is_primary().await.unwrap());

        let status = probe.status().await.unwrap();
        assert!(status.is_running);
        assert!(!status.is_in_recovery);
    }

    #[tokio::test]
    async fn standby_signal_means_in_recovery() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("postmaster.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        std::fs::write(dir.path().join("standby.signal"), "").unwrap();

        let mut probe = PgDataProbe::new(dir.path().to_path_buf());
        assert!(probe.is_running().await);
        assert!(!probe.is_primary().await.unwrap());
    }

    #[tokio::test]
    async fn stale_postmaster_pid_is_not_running() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("postmaster.pid"), "999999999\n").unwrap();

        let mut probe = PgDataProbe::new(dir.path().to_path_buf());
        assert!(!probe.is_running().await);
    }
}
