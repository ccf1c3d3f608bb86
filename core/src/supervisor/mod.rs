//! Process supervision
//!
//! The supervisor owns an ordered list of [`Service`]s, starts them as child
//! processes, and then sits in a polling loop applying the restart
//! discipline until it is asked to stop. Everything happens in one task:
//! non-blocking child reaping plus a fixed wake-up period
//! ([`SUPERVISOR_TICK`]) bound the latency of signal handling without
//! busy-spinning or signal-safe wake primitives.
//!
//! ## Guarantees
//!
//! - At most one supervisor per pidfile: startup fails while a live process
//!   owns the file, and every loop iteration re-validates ownership
//!   (fencing) so a usurped supervisor aborts instead of fighting.
//! - No partial service set: if a service fails to start, the ones already
//!   started are signaled in reverse order and startup fails as a whole.
//! - Bounded restarts: the MaxR/MaxT budget stops a crash-looping service
//!   from consuming resources forever.
//! - Bounded shutdown: services that ignore their stop signal are
//!   re-signaled as a process group, with escalation to stronger signals.
//!
//! ## State machine
//!
//! ```text
//! STARTING → RUNNING → STOPPING          → STOPPED (clean)
//!                    → ERROR_STOPPING    → STOPPED (error)
//!                    → FATAL_STOPPING    → STOPPED (fatal)
//! ```
//!
//! Entry into any stopping state is one-way: `shutdown_in_progress` never
//! resets and the exit mode only ever gets more severe.

use crate::defaults::{
    EXIT_CODE_DROPPED, EXIT_CODE_FATAL, EXIT_CODE_INTERNAL_ERROR, EXIT_CODE_QUIT,
    SHUTDOWN_ESCALATE_TICKS, SHUTDOWN_RESIGNAL_TICKS, SUPERVISOR_SERVICE_MAX_RETRY,
    SUPERVISOR_SERVICE_MAX_TIME, SUPERVISOR_TICK,
};
use crate::pidfile::{self, PidfileHeader};
use crate::process;
use crate::signals::SignalState;
use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use schema::{RestartPolicy, ServiceExit, ServicePidEntry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub mod restart;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use restart::*;
pub use service::*;

/// How the supervisor terminated, in increasing severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitMode {
    /// All services stopped as requested
    Clean,
    /// A service exhausted its restart budget
    Error,
    /// An invariant was violated or a restart could not be performed
    Fatal,
}

/// Final outcome of a supervisor run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub mode: ExitMode,
    /// The node was administratively dropped; the distinguished exit code
    /// tells wrapping init systems not to restart us
    pub dropped: bool,
}

impl ExitOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        if self.dropped {
            return EXIT_CODE_DROPPED;
        }
        match self.mode {
            ExitMode::Clean => EXIT_CODE_QUIT,
            ExitMode::Error => EXIT_CODE_INTERNAL_ERROR,
            ExitMode::Fatal => EXIT_CODE_FATAL,
        }
    }
}

/// What the shutdown sequence does at a given stopping-loop count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationStep {
    /// First stopping iteration: tell the user we are waiting
    AnnounceWait,
    /// Re-signal the whole process group with the current shutdown signal
    Resignal,
    /// Escalate to a strictly stronger signal and re-signal the group
    Escalate,
}

/// Pure escalation schedule, counted in supervision ticks since the
/// shutdown began
fn escalation_step(counter: u64) -> Option<EscalationStep> {
    if counter == 1 {
        Some(EscalationStep::AnnounceWait)
    } else if counter == SHUTDOWN_RESIGNAL_TICKS {
        Some(EscalationStep::Resignal)
    } else if counter > SHUTDOWN_RESIGNAL_TICKS
        && (counter - SHUTDOWN_RESIGNAL_TICKS) % SHUTDOWN_ESCALATE_TICKS == 0
    {
        Some(EscalationStep::Escalate)
    } else {
        None
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// The supervisor: an ordered set of services plus the restart discipline
pub struct Supervisor {
    services: Vec<Service>,
    pidfile: PathBuf,
    header: PidfileHeader,
    signals: Arc<SignalState>,
    pid: i32,
    exit_mode: ExitMode,
    dropped: bool,
    shutdown_in_progress: bool,
    stopping_loop_counter: u64,
    tick: Duration,
    max_retries: u32,
    max_time: u64,
}

impl Supervisor {
    pub fn new(
        services: Vec<Service>,
        pidfile: PathBuf,
        header: PidfileHeader,
        signals: Arc<SignalState>,
    ) -> Self {
        Self {
            services,
            pidfile,
            header,
            signals,
            pid: 0,
            exit_mode: ExitMode::Clean,
            dropped: false,
            shutdown_in_progress: false,
            stopping_loop_counter: 0,
            tick: SUPERVISOR_TICK,
            max_retries: SUPERVISOR_SERVICE_MAX_RETRY,
            max_time: SUPERVISOR_SERVICE_MAX_TIME,
        }
    }

    /// Override the wake-up period (tests use a much shorter one)
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Override the MaxR/MaxT restart budget. The restart rings are sized
    /// to MaxR, so they are recreated here (services have not started yet).
    pub fn with_restart_budget(mut self, max_retries: u32, max_time: u64) -> Self {
        self.max_retries = max_retries;
        self.max_time = max_time;
        for service in &mut self.services {
            service.counters = RestartCounters::new(max_retries.max(1) as usize);
        }
        self
    }

    /// Acquire the pidfile, start every service in order, and supervise
    /// until termination.
    ///
    /// On return the pidfile has been removed, unless ownership was lost to
    /// another process (in which case the file is theirs now).
    pub async fn start(&mut self) -> Result<ExitOutcome> {
        self.pid = std::process::id() as i32;

        pidfile::acquire_pidfile(&self.pidfile, self.pid, &self.header)?;

        for index in 0..self.services.len() {
            debug!("Starting service \"{}\"", self.services[index].name);
            match self.services[index].start().await {
                Ok(pid) => {
                    info!(
                        "Started service \"{}\" with pid {}",
                        self.services[index].name, pid
                    );
                }
                Err(e) => {
                    error!(
                        "Failed to start service \"{}\", \
                         stopping already started services: {}",
                        self.services[index].name, e
                    );
                    for started in (0..index).rev() {
                        if let Err(stop_err) = self.services[started].stop(Signal::SIGQUIT) {
                            error!(
                                "Failed to send SIGQUIT to service \"{}\": {}",
                                self.services[started].name, stop_err
                            );
                        }
                    }
                    let _ = pidfile::remove_pidfile(&self.pidfile);
                    return Err(e);
                }
            }
        }

        // external tooling discovers service pids through the pidfile
        self.rewrite_pidfile()?;

        let still_own_pidfile = self.supervise().await;

        if still_own_pidfile {
            if let Err(e) = pidfile::remove_pidfile(&self.pidfile) {
                error!("Failed to remove pidfile: {}", e);
            }
        }

        info!("Stop mizar supervisor");
        Ok(ExitOutcome {
            mode: self.exit_mode,
            dropped: self.dropped,
        })
    }

    /// The supervision loop. Returns whether we still own the pidfile.
    async fn supervise(&mut self) -> bool {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            // fencing: another process may have removed or overwritten our
            // pidfile, in which case surrendering is the only safe move
            if let Err(e) = pidfile::check_pidfile(&self.pidfile, self.pid) {
                error!("{}; quitting", e);
                self.raise_exit_mode(ExitMode::Fatal);
                return false;
            }

            if self.signals.take_reload() {
                self.reload_services();
            }

            let mut reaped: Vec<(usize, ServiceExit)> = Vec::new();
            for index in 0..self.services.len() {
                match self.services[index].try_reap() {
                    Ok(Some(exit)) => reaped.push((index, exit)),
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            "Failed to check on service \"{}\": {}",
                            self.services[index].name, e
                        );
                        self.raise_exit_mode(ExitMode::Fatal);
                        self.begin_shutdown();
                    }
                }
            }

            let child_died = !reaped.is_empty();
            for (index, exit) in reaped {
                self.handle_service_exit(index, exit).await;
            }

            if !self.services.iter().any(|s| s.is_running()) {
                if self.shutdown_in_progress || self.signals.shutdown_requested() {
                    info!("Internal subprocesses are done, stopping");
                } else {
                    // services don't all vanish on their own; this is a bug
                    error!("All services are gone while no shutdown was requested");
                    self.raise_exit_mode(ExitMode::Fatal);
                }
                return true;
            }

            if !child_died {
                if self.signals.shutdown_requested() && !self.shutdown_in_progress {
                    self.begin_shutdown();
                }
                if self.shutdown_in_progress {
                    self.drive_shutdown_sequence();
                }
            }
        }
    }

    /// Forward SIGHUP to every running service
    fn reload_services(&self) {
        for service in &self.services {
            if let Some(pid) = service.pid() {
                info!(
                    "Reloading service \"{}\" by signaling pid {} with SIGHUP",
                    service.name, pid
                );
            }
            service.reload();
        }
    }

    /// Exit modes only ever get more severe
    fn raise_exit_mode(&mut self, mode: ExitMode) {
        self.exit_mode = self.exit_mode.max(mode);
    }

    /// Enter the shutdown sequence: one-way, and signals every running
    /// service with the current shutdown signal
    fn begin_shutdown(&mut self) {
        if self.shutdown_in_progress {
            return;
        }
        self.shutdown_in_progress = true;

        let sig = self.signals.shutdown_signal();
        for service in &self.services {
            if !service.is_running() {
                continue;
            }
            if let Err(e) = service.stop(sig) {
                error!(
                    "Failed to send {} to service \"{}\": {}",
                    sig, service.name, e
                );
            }
        }
    }

    /// One idle iteration of the shutdown sequence: insist towards services
    /// that failed to stop timely, escalating the signal over time
    fn drive_shutdown_sequence(&mut self) {
        self.stopping_loop_counter += 1;

        match escalation_step(self.stopping_loop_counter) {
            Some(EscalationStep::AnnounceWait) => {
                info!("Waiting for subprocesses to terminate");
            }
            Some(EscalationStep::Resignal) => {
                let sig = self.signals.shutdown_signal();
                info!(
                    "Services are still running, signaling the process group with {}",
                    sig
                );
                if let Err(e) = process::signal_own_process_group(sig) {
                    warn!("Still waiting for subprocesses to terminate: {}", e);
                }
            }
            Some(EscalationStep::Escalate) => {
                let sig = self.signals.escalate();
                info!("Services are still running, escalating to {}", sig);
                if let Err(e) = process::signal_own_process_group(sig) {
                    warn!("Still waiting for subprocesses to terminate: {}", e);
                }
            }
            None => {}
        }
    }

    /// Apply the restart policy to a dead service
    async fn handle_service_exit(&mut self, index: usize, exit: ServiceExit) {
        let now = now_secs();
        let class = classify_exit(&exit);
        let policy = self.services[index].policy;
        let name = self.services[index].name.clone();
        let verb = if exit.exit_code.is_some() {
            "exited"
        } else {
            "failed"
        };

        if self.shutdown_in_progress {
            debug!("Service \"{}\" {} during shutdown", name, verb);
            return;
        }

        // expected terminations don't deserve an error-level line
        if policy == RestartPolicy::Temporary || class == ExitClass::CleanQuit {
            info!(
                "Service \"{}\" {} with status {:?}",
                name, verb, exit.exit_code
            );
        } else {
            error!(
                "Service \"{}\" {} with status {:?} (signal {:?})",
                name, verb, exit.exit_code, exit.signal
            );
        }

        match class {
            ExitClass::Dropped => {
                info!(
                    "Service \"{}\" reports this node has been dropped, \
                     stopping all services",
                    name
                );
                self.dropped = true;
                self.begin_shutdown();
                return;
            }
            ExitClass::Fatal => {
                error!(
                    "Service \"{}\" hit an unrecoverable error, stopping all services",
                    name
                );
                self.raise_exit_mode(ExitMode::Fatal);
                self.begin_shutdown();
                return;
            }
            ExitClass::CleanQuit | ExitClass::Failure => {}
        }

        // a temporary service is never restarted, and its death is not a
        // reason to stop anything else
        if policy == RestartPolicy::Temporary {
            return;
        }

        // a transient service that quit happily is a one-shot run to
        // completion: the whole supervisor shuts down cleanly
        if policy == RestartPolicy::Transient && class == ExitClass::CleanQuit {
            info!("Service \"{}\" has finished, stopping mizar", name);
            self.begin_shutdown();
            return;
        }

        // permanent service, or transient that failed: consult the budget
        if !self
            .services[index]
            .counters
            .may_restart(now, self.max_retries, self.max_time)
        {
            let counters = &self.services[index].counters;
            error!(
                "Service \"{}\" has already been restarted {} times, with the \
                 oldest tracked restart {}s ago (limit: {} restarts per {}s), \
                 stopping now",
                name,
                counters.count(),
                counters.oldest().map(|t| now.saturating_sub(t)).unwrap_or(0),
                self.max_retries,
                self.max_time
            );
            self.raise_exit_mode(ExitMode::Error);
            self.begin_shutdown();
            return;
        }

        match self.services[index].start().await {
            Ok(pid) => {
                self.services[index].counters.record_restart(now);
                info!("Restarted service \"{}\" with pid {}", name, pid);

                // the pidfile must reflect the new pid or signal-by-name
                // tooling silently breaks
                if let Err(e) = self.rewrite_pidfile() {
                    error!(
                        "Failed to update the pidfile after restarting \"{}\": {}",
                        name, e
                    );
                    self.raise_exit_mode(ExitMode::Fatal);
                    self.begin_shutdown();
                }
            }
            Err(e) => {
                error!("Failed to restart service \"{}\": {}", name, e);
                self.raise_exit_mode(ExitMode::Fatal);
                self.begin_shutdown();
            }
        }
    }

    /// Rewrite the pidfile with the current pid of every running service
    fn rewrite_pidfile(&self) -> Result<()> {
        let entries: Vec<ServicePidEntry> = self
            .services
            .iter()
            .filter_map(|s| {
                s.pid().map(|pid| ServicePidEntry {
                    name: s.name.clone(),
                    pid,
                })
            })
            .collect();
        pidfile::create_pidfile(&self.pidfile, self.pid, &self.header, &entries)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pidfile", &self.pidfile)
            .field("pid", &self.pid)
            .field("exit_mode", &self.exit_mode)
            .field("shutdown_in_progress", &self.shutdown_in_progress)
            .field("services", &self.services.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Convenience: signal the supervisor named in a pidfile. Used by the
/// `mizard stop` and `mizard reload` operator commands.
pub fn signal_supervisor(pidfile_path: &std::path::Path, sig: Signal) -> Result<i32> {
    let pid = pidfile::read_pidfile(pidfile_path)?.ok_or_else(|| {
        CoreError::PidfileError(format!(
            "No mizar instance is running (pidfile \"{}\")",
            pidfile_path.display()
        ))
    })?;
    process::signal_pid(pid, sig)?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_schedule_announces_then_resignals_then_escalates() {
        assert_eq!(escalation_step(1), Some(EscalationStep::AnnounceWait));
        assert_eq!(escalation_step(2), None);
        assert_eq!(escalation_step(49), None);
        assert_eq!(escalation_step(50), Some(EscalationStep::Resignal));
        assert_eq!(escalation_step(51), None);
        assert_eq!(escalation_step(100), None);
        assert_eq!(escalation_step(150), Some(EscalationStep::Escalate));
        assert_eq!(escalation_step(250), Some(EscalationStep::Escalate));
    }

    #[test]
    fn exit_codes_match_the_operator_contract() {
        let outcome = |mode, dropped| ExitOutcome { mode, dropped };
        assert_eq!(outcome(ExitMode::Clean, false).exit_code(), 0);
        assert_eq!(outcome(ExitMode::Error, false).exit_code(), 12);
        assert_eq!(outcome(ExitMode::Fatal, false).exit_code(), 122);
        assert_eq!(outcome(ExitMode::Clean, true).exit_code(), 121);
    }

    #[test]
    fn exit_mode_ordering_is_by_severity() {
        assert!(ExitMode::Clean < ExitMode::Error);
        assert!(ExitMode::Error < ExitMode::Fatal);
    }
}
