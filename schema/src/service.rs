//! Service supervision types
//!
//! A service is a named unit of work run as a child process by the
//! supervisor. These types describe how a service terminates and under what
//! policy it is restarted.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Restart policy determining when a dead service should be restarted
///
/// The policies follow the Erlang supervisor vocabulary:
/// - `Permanent`: always restarted
/// - `Transient`: restarted only after an abnormal exit; a clean exit ends
///   the whole supervisor (one-shot services that run to completion)
/// - `Temporary`: never restarted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RestartPolicy {
    /// Always restart the service when it exits
    Permanent,
    /// Restart only on failure exit; a clean exit shuts the supervisor down
    Transient,
    /// Never restart the service
    Temporary,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Permanent
    }
}

/// How a supervised child process terminated
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExit {
    /// Pid the child had while running
    pub pid: u32,
    /// Exit code when the child exited on its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal number when the child was killed by a signal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ServiceExit {
    /// A termination is a failure unless the child exited with status zero
    pub fn is_failure(&self) -> bool {
        !matches!(self.exit_code, Some(0))
    }
}

/// One `"<pid> <name>"` line of the supervisor pidfile
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePidEntry {
    /// Service name, unique within the supervisor
    pub name: String,
    /// Pid of the running service process
    pub pid: u32,
}
