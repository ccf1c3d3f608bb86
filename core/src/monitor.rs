//! Monitor client interface
//!
//! The keeper talks to the monitor through this narrow trait: report local
//! status, receive the assigned goal state, wait for change notifications.
//! The actual wire protocol is a collaborator concern and lives outside this
//! crate; what ships here is the file-backed source used when the monitor is
//! disabled, and a scripted mock for tests.
//!
//! Every implementation must stay callable after a failed call: the keeper
//! retries on the next cycle and a single network error must not poison the
//! client.

use crate::config::KeeperConfig;
use crate::{CoreError, Result};
use async_trait::async_trait;
use schema::{AssignedState, KeeperState, NodePeer, NodeReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// The keeper's view of the monitor authority (or its stand-in)
#[async_trait]
pub trait MonitorClient: Send {
    /// Report the local state and receive the assigned goal state.
    ///
    /// The returned `peers_version` is an opaque marker: when it changes the
    /// keeper refreshes its peer cache via [`MonitorClient::get_peers`].
    async fn node_active(&mut self, report: &NodeReport) -> Result<AssignedState>;

    /// Block until the monitor notifies a state change for our group, up to
    /// `timeout`. Returns whether a change was notified; timing out without
    /// a notification is not an error.
    async fn wait_for_state_change(&mut self, timeout: Duration) -> Result<bool>;

    /// Fetch the current list of peer nodes in our group
    async fn get_peers(&mut self) -> Result<Vec<NodePeer>>;

    /// Whether this node has already been dropped from the monitor. Checked
    /// once before entering the keeper loop, so a restarted dropped node
    /// refuses to come back up.
    async fn node_has_been_dropped(&mut self) -> Result<bool>;

    /// Apply a configuration reload. Implementations re-establish their
    /// connection when settings affecting it changed.
    async fn reconfigure(&mut self, _config: &KeeperConfig) -> Result<()> {
        Ok(())
    }

    /// False for stand-ins that do not represent a live monitor
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether notifications arrived since the last node-active call;
    /// the keeper skips its sleep when they did
    fn has_received_notifications(&self) -> bool {
        false
    }
}

/// Monitor-disabled stand-in: the goal state comes from the state file
/// (edited by an external process) and the peer list from a nodes file
/// maintained alongside it.
pub struct FileStateSource {
    state_file: PathBuf,
    nodes_file: PathBuf,
}

impl FileStateSource {
    pub fn new(state_file: PathBuf, nodes_file: PathBuf) -> Self {
        Self {
            state_file,
            nodes_file,
        }
    }

    fn nodes_file_version(&self) -> String {
        // mtime + size stand in for a content hash; good enough to detect
        // edits of a hand-maintained file
        match std::fs::metadata(&self.nodes_file) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                format!("{}:{}", mtime, meta.len())
            }
            Err(_) => "missing".to_string(),
        }
    }
}

#[async_trait]
impl MonitorClient for FileStateSource {
    async fn node_active(&mut self, _report: &NodeReport) -> Result<AssignedState> {
        let state: KeeperState = crate::keeper::state::load_state(&self.state_file)?;
        Ok(AssignedState {
            role: state.assigned_role,
            node_id: state.node_id,
            group_id: state.group_id,
            peers_version: self.nodes_file_version(),
        })
    }

    async fn wait_for_state_change(&mut self, timeout: Duration) -> Result<bool> {
        // no notification channel without a monitor; plain bounded sleep
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn get_peers(&mut self) -> Result<Vec<NodePeer>> {
        let data = std::fs::read_to_string(&self.nodes_file).map_err(|e| {
            CoreError::MonitorError(format!(
                "Failed to read nodes file \"{}\": {}",
                self.nodes_file.display(),
                e
            ))
        })?;
        let peers: Vec<NodePeer> = serde_json::from_str(&data)?;
        debug!(
            "Read {} peer nodes from \"{}\"",
            peers.len(),
            self.nodes_file.display()
        );
        Ok(peers)
    }

    async fn node_has_been_dropped(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Scripted monitor for tests
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted node-active outcome
    #[derive(Debug, Clone)]
    pub enum MonitorRound {
        /// The monitor answers with this assigned state
        Assign(AssignedState),
        /// The monitor is unreachable this round
        Unreachable,
    }

    #[derive(Debug, Default)]
    struct Shared {
        rounds: VecDeque<MonitorRound>,
        reports: Vec<NodeReport>,
        peers: Vec<NodePeer>,
        peer_fetches: u32,
        dropped: bool,
        notifications: bool,
    }

    /// Scripting and observation handle for a [`MockMonitor`]
    #[derive(Debug, Clone, Default)]
    pub struct MonitorHandle {
        shared: Arc<Mutex<Shared>>,
    }

    impl MonitorHandle {
        /// Queue node-active outcomes, first to last. The last one repeats
        /// once the queue is drained.
        pub fn script(&self, rounds: Vec<MonitorRound>) {
            self.shared.lock().unwrap().rounds = rounds.into();
        }

        pub fn set_peers(&self, peers: Vec<NodePeer>) {
            self.shared.lock().unwrap().peers = peers;
        }

        pub fn set_dropped(&self, dropped: bool) {
            self.shared.lock().unwrap().dropped = dropped;
        }

        /// Reports received so far
        pub fn reports(&self) -> Vec<NodeReport> {
            self.shared.lock().unwrap().reports.clone()
        }

        pub fn peer_fetches(&self) -> u32 {
            self.shared.lock().unwrap().peer_fetches
        }
    }

    /// A [`MonitorClient`] with scripted responses
    pub struct MockMonitor {
        handle: MonitorHandle,
    }

    impl MockMonitor {
        pub fn new() -> (Self, MonitorHandle) {
            let handle = MonitorHandle::default();
            (
                Self {
                    handle: handle.clone(),
                },
                handle,
            )
        }
    }

    #[async_trait]
    impl MonitorClient for MockMonitor {
        async fn node_active(&mut self, report: &NodeReport) -> Result<AssignedState> {
            let mut shared = self.handle.shared.lock().unwrap();
            shared.reports.push(report.clone());

            let round = if shared.rounds.len() > 1 {
                shared.rounds.pop_front()
            } else {
                shared.rounds.front().cloned()
            };
            match round {
                Some(MonitorRound::Assign(assigned)) => Ok(assigned),
                Some(MonitorRound::Unreachable) | None => Err(CoreError::MonitorError(
                    "connection to monitor failed".to_string(),
                )),
            }
        }

        async fn wait_for_state_change(&mut self, _timeout: Duration) -> Result<bool> {
            let notified = {
                let mut shared = self.handle.shared.lock().unwrap();
                std::mem::take(&mut shared.notifications)
            };
            // yield so the scripted loop makes progress without real sleeps
            tokio::task::yield_now().await;
            Ok(notified)
        }

        async fn get_peers(&mut self) -> Result<Vec<NodePeer>> {
            let mut shared = self.handle.shared.lock().unwrap();
            shared.peer_fetches += 1;
            Ok(shared.peers.clone())
        }

        async fn node_has_been_dropped(&mut self) -> Result<bool> {
            Ok(self.handle.shared.lock().unwrap().dropped)
        }
    }
}
