//! The unit of supervision
//!
//! A [`Service`] is a named child process with a restart policy. What the
//! process actually runs is delegated to a [`ServiceCommand`]; the returned
//! [`ManagedChild`] handle is what the supervisor polls and signals. Mock
//! implementations of both traits live here as well so supervision logic can
//! be tested without real processes.

use crate::defaults::SUPERVISOR_SERVICE_MAX_RETRY;
use crate::process::ChildProcess;
use crate::supervisor::restart::RestartCounters;
use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::{RestartPolicy, ServiceExit};
use tracing::{debug, warn};

/// How to start one service
#[async_trait]
pub trait ServiceCommand: Send + Sync {
    /// Start the service, returning a handle to the running child.
    ///
    /// The child pid must be tracked by the returned handle before this
    /// returns: the caller records it in the pidfile right away.
    async fn start(&self) -> Result<Box<dyn ManagedChild>>;
}

/// A running child the supervisor polls and signals
pub trait ManagedChild: Send {
    /// Pid of the running child
    fn pid(&self) -> u32;

    /// Non-blocking termination check; `Some` exactly once, when the child
    /// has died
    fn try_wait(&mut self) -> Result<Option<ServiceExit>>;

    /// Send a signal to the child; a child that is already gone is success
    fn signal(&self, sig: Signal) -> Result<()>;
}

impl ManagedChild for ChildProcess {
    fn pid(&self) -> u32 {
        ChildProcess::pid(self)
    }

    fn try_wait(&mut self) -> Result<Option<ServiceExit>> {
        ChildProcess::try_wait(self)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        ChildProcess::signal(self, sig)
    }
}

/// Start a service by executing a program
pub struct ExecCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ExecCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ServiceCommand for ExecCommand {
    async fn start(&self) -> Result<Box<dyn ManagedChild>> {
        let child = crate::process::spawn(&self.program, &self.args, &self.env)?;
        Ok(Box::new(child))
    }
}

/// A named, supervised unit of work
pub struct Service {
    /// Stable name, unique within the supervisor; keyed on in the pidfile
    pub name: String,
    /// Restart policy applied when the child dies
    pub policy: RestartPolicy,
    command: Box<dyn ServiceCommand>,
    child: Option<Box<dyn ManagedChild>>,
    /// MaxR/MaxT restart budget bookkeeping
    pub counters: RestartCounters,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        policy: RestartPolicy,
        command: Box<dyn ServiceCommand>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            command,
            child: None,
            counters: RestartCounters::new(SUPERVISOR_SERVICE_MAX_RETRY as usize),
        }
    }

    /// Start (or restart) the service, returning the new pid
    pub async fn start(&mut self) -> Result<u32> {
        let child = self.command.start().await?;
        let pid = child.pid();
        self.child = Some(child);
        Ok(pid)
    }

    /// Pid of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.pid())
    }

    /// Whether a child is currently running (from our point of view)
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Non-blocking reap: when the child has died, forget the handle and
    /// return the exit record
    pub fn try_reap(&mut self) -> Result<Option<ServiceExit>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(exit) => {
                self.child = None;
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    /// Ask the service to stop with the given signal. Idempotent: a service
    /// that is not running (or already gone) is success.
    pub fn stop(&self, sig: Signal) -> Result<()> {
        match &self.child {
            Some(child) => child.signal(sig),
            None => Ok(()),
        }
    }

    /// Forward a reload request (SIGHUP). Best-effort: failures are logged
    /// and swallowed.
    pub fn reload(&self) {
        let Some(child) = &self.child else {
            debug!("Service \"{}\" is not running, skipping reload", self.name);
            return;
        };
        if let Err(e) = child.signal(Signal::SIGHUP) {
            warn!(
                "Failed to send SIGHUP to service \"{}\" with pid {}: {}",
                self.name,
                child.pid(),
                e
            );
        }
    }
}

/// Scripted behaviors for a [`MockCommand`] child, one per start
#[derive(Debug, Clone)]
pub enum MockRun {
    /// start() itself fails
    FailToStart,
    /// The child runs until scripted to exit via [`MockHandle::finish`] or
    /// until signaled
    Run,
    /// The child exits on its own with the given code, visible to the next
    /// try_wait
    Exit(i32),
}

#[derive(Debug, Default)]
struct MockShared {
    /// Behaviors consumed by successive start() calls
    plan: Vec<MockRun>,
    starts: u32,
    /// Pending exit for the currently running child
    pending_exit: Option<ServiceExit>,
    signals: Vec<Signal>,
    next_pid: u32,
}

/// Shared handle scripting and observing a [`MockCommand`]
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    shared: std::sync::Arc<std::sync::Mutex<MockShared>>,
}

impl MockHandle {
    /// Script the behaviors of successive starts, first to last
    pub fn plan(&self, runs: Vec<MockRun>) {
        let mut shared = self.shared.lock().unwrap();
        shared.plan = runs;
        shared.plan.reverse(); // consumed by pop()
    }

    /// Make the currently running child exit with `code`
    pub fn finish(&self, code: i32) {
        let mut shared = self.shared.lock().unwrap();
        let pid = shared.next_pid;
        shared.pending_exit = Some(ServiceExit {
            pid,
            exit_code: Some(code),
            signal: None,
        });
    }

    /// How many times start() was called
    pub fn starts(&self) -> u32 {
        self.shared.lock().unwrap().starts
    }

    /// Every signal delivered to mock children, in order
    pub fn signals(&self) -> Vec<Signal> {
        self.shared.lock().unwrap().signals.clone()
    }
}

/// A [`ServiceCommand`] producing scripted in-memory children
pub struct MockCommand {
    handle: MockHandle,
}

impl MockCommand {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl ServiceCommand for MockCommand {
    async fn start(&self) -> Result<Box<dyn ManagedChild>> {
        let mut shared = self.handle.shared.lock().unwrap();
        shared.starts += 1;
        let pid = 1000 + shared.starts;
        shared.next_pid = pid;

        let run = shared.plan.pop().unwrap_or(MockRun::Run);
        match run {
            MockRun::FailToStart => Err(CoreError::ProcessSpawn(
                "mock service refused to start".to_string(),
            )),
            MockRun::Run => {
                shared.pending_exit = None;
                Ok(Box::new(MockChild {
                    pid,
                    shared: self.handle.shared.clone(),
                }))
            }
            MockRun::Exit(code) => {
                shared.pending_exit = Some(ServiceExit {
                    pid,
                    exit_code: Some(code),
                    signal: None,
                });
                Ok(Box::new(MockChild {
                    pid,
                    shared: self.handle.shared.clone(),
                }))
            }
        }
    }
}

struct MockChild {
    pid: u32,
    shared: std::sync::Arc<std::sync::Mutex<MockShared>>,
}

impl ManagedChild for MockChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<ServiceExit>> {
        let mut shared = self.shared.lock().unwrap();
        Ok(shared.pending_exit.take().map(|mut exit| {
            exit.pid = self.pid;
            exit
        }))
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.signals.push(sig);
        // stop signals make the mock child die with that signal
        if matches!(sig, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT) {
            shared.pending_exit = Some(ServiceExit {
                pid: self.pid,
                exit_code: None,
                signal: Some(sig as i32),
            });
        }
        Ok(())
    }
}
