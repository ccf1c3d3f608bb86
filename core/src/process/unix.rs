//! Unix process spawning and signaling
//!
//! Spawned children inherit the supervisor's process group on purpose, so a
//! `killpg` on our own group reaches every service (and whatever they left
//! behind) during shutdown escalation. Signaling a pid that is already gone
//! is treated as success, which makes stop operations idempotent.

use crate::{CoreError, Result};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgrp, Pid};
use schema::ServiceExit;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// A child process spawned into our own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// Process id of the child
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking check for termination.
    ///
    /// Returns `Ok(None)` while the child is still running, and the exit
    /// record once it has terminated. A child may only be reaped once.
    pub fn try_wait(&mut self) -> Result<Option<ServiceExit>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(exit_from_status(self.pid(), status))),
            Ok(None) => Ok(None),
            Err(e) => Err(CoreError::ProcessWait(format!(
                "Failed to try_wait for process {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Wait for the child to terminate
    pub async fn wait(&mut self) -> Result<ServiceExit> {
        let status = self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })?;
        Ok(exit_from_status(self.pid(), status))
    }

    /// Send a signal to the child process.
    ///
    /// ESRCH (no such process) and EPERM are treated as success: the child
    /// already exited, which is exactly what stop wants.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal_pid(self.pid.as_raw(), sig)
    }
}

fn exit_from_status(pid: u32, status: std::process::ExitStatus) -> ServiceExit {
    let (exit_code, signal) = if let Some(code) = status.code() {
        (Some(code), None)
    } else {
        use std::os::unix::process::ExitStatusExt;
        (None, status.signal())
    };
    ServiceExit {
        pid,
        exit_code,
        signal,
    }
}

/// Spawn a child process running `cmd` with `args` and extra environment.
///
/// The child pid is captured before success is reported, so the caller
/// always knows which process it is now responsible for. Stdio is inherited:
/// services log through the supervisor's streams.
pub fn spawn(cmd: &str, args: &[String], env: &[(String, String)]) -> Result<ChildProcess> {
    debug!("Spawning process: {} {:?}", cmd, args);

    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    for (key, value) in env {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", cmd, e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", cmd, e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a pid".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Successfully spawned process {}", pid);

    Ok(ChildProcess { pid, child })
}

/// Send a signal to an arbitrary pid, tolerating processes that are gone
pub fn signal_pid(pid: i32, sig: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
            debug!("Process {} already exited, not signaling", pid);
            Ok(())
        }
        Err(e) => Err(CoreError::ProcessSignal(format!(
            "Failed to send {} to process {}: {}",
            sig, pid, e
        ))),
    }
}

/// Signal our own process group.
///
/// Used during shutdown escalation when services are still running long
/// after they were asked to stop: perhaps only the leader was signaled
/// rather than the whole group.
pub fn signal_own_process_group(sig: Signal) -> Result<()> {
    let pgrp = getpgrp();
    killpg(pgrp, sig).map_err(|e| {
        CoreError::ProcessSignal(format!(
            "Failed to send {} to our process group {}: {}",
            sig, pgrp, e
        ))
    })
}
