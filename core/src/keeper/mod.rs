//! The keeper reconciliation loop
//!
//! The keeper is the service that keeps this node's role converged with the
//! goal state assigned by the monitor. Each cycle it re-reads its persisted
//! state, probes the local Postgres instance, reports to the monitor, and
//! drives the FSM executor toward the assigned role. When the monitor is
//! unreachable it falls back to the network partition detector: a primary
//! that lost both the monitor and its standby demotes itself rather than
//! risk a split brain. That is the one decision this loop takes without
//! external authority.
//!
//! State is re-read from disk every cycle on purpose: if writing the state
//! file after a transition fails, the transition is reported as failed and
//! retried, so the state on disk never runs ahead of what the monitor was
//! told.

pub mod partition;
pub mod state;

use crate::config::KeeperConfig;
use crate::defaults::{EXIT_CODE_DROPPED, EXIT_CODE_FATAL, EXIT_CODE_QUIT, KEEPER_SLEEP_TIME};
use crate::fsm::{should_ensure_current_state_before_transition, FsmExecutor};
use crate::monitor::MonitorClient;
use crate::pg::PostgresProbe;
use crate::pidfile;
use crate::signals::SignalState;
use crate::Result;
use schema::{KeeperState, NodePeer, NodeReport, NodeRole, PgStatus};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// How the keeper loop terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperExit {
    /// Asked to stop by a signal
    Clean,
    /// The node reached the dropped role and reported it; the whole process
    /// tree must stop and not be restarted
    Dropped,
    /// The node had already been dropped before the loop even started; an
    /// operator must finish the cleanup
    AlreadyDropped,
}

impl KeeperExit {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            KeeperExit::Clean => EXIT_CODE_QUIT,
            KeeperExit::Dropped => EXIT_CODE_DROPPED,
            KeeperExit::AlreadyDropped => EXIT_CODE_FATAL,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// The keeper: one node's reconciliation loop
pub struct Keeper {
    config: KeeperConfig,
    state: KeeperState,
    monitor: Box<dyn MonitorClient>,
    fsm: Box<dyn FsmExecutor>,
    probe: Box<dyn PostgresProbe>,
    signals: Arc<SignalState>,
    /// Pid of the supervisor owning the pidfile; our fencing reference
    supervisor_pid: i32,
    peers: Vec<NodePeer>,
    peers_version: Option<String>,
    pg_status: PgStatus,
    sleep_time: Duration,
}

impl Keeper {
    pub fn new(
        config: KeeperConfig,
        monitor: Box<dyn MonitorClient>,
        fsm: Box<dyn FsmExecutor>,
        probe: Box<dyn PostgresProbe>,
        signals: Arc<SignalState>,
        supervisor_pid: i32,
    ) -> Self {
        Self {
            config,
            state: KeeperState::new(),
            monitor,
            fsm,
            probe,
            signals,
            supervisor_pid,
            peers: Vec::new(),
            peers_version: None,
            pg_status: PgStatus::default(),
            sleep_time: KEEPER_SLEEP_TIME,
        }
    }

    /// Override the cycle sleep (tests use a much shorter one)
    pub fn with_sleep(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = sleep_time;
        self
    }

    /// Current cached peer nodes
    pub fn peers(&self) -> &[NodePeer] {
        &self.peers
    }

    /// Run the reconciliation loop until asked to stop or the node is
    /// dropped.
    pub async fn run(&mut self) -> Result<KeeperExit> {
        debug!("mizar keeper service is starting");

        // A dropped node that gets restarted (by an init system, an
        // interactive user, or another way) must realise the situation and
        // refrain from entering the loop.
        if self.monitor.is_enabled() && self.monitor.node_has_been_dropped().await? {
            error!(
                "This node has been dropped from the monitor; remove the \
                 data directory and configuration to finish the cleanup"
            );
            return Ok(KeeperExit::AlreadyDropped);
        }

        let mut do_sleep = false;
        let mut could_contact = false;
        let mut first_loop = true;
        let mut do_init = true;
        let mut warned_on_previous_iteration = false;
        let mut dropped_reported = false;

        loop {
            // In a stable state we can sleep for a while; the monitor
            // notifies every state change, so the sleep is interrupted as
            // soon as we get the hint.
            if do_sleep {
                if self.monitor.is_enabled() {
                    let _ = self.monitor.wait_for_state_change(self.sleep_time).await;
                } else {
                    tokio::time::sleep(self.sleep_time).await;
                }
            }
            do_sleep = true;

            let mut warned_on_current_iteration = false;

            if self.signals.take_reload() || first_loop {
                self.apply_reload().await;
            }

            // a stop request always finishes after the current cycle, so the
            // flags are only checked at cycle boundaries
            if self.signals.shutdown_requested() {
                break;
            }

            // fencing: if the supervisor lost the pidfile, so did we
            pidfile::check_pidfile(&self.config.pidfile_path(), self.supervisor_pid)?;

            // Re-read the state file instead of trusting memory; see the
            // module comment for why.
            match state::load_or_init_state(self.config.state_file_path()) {
                Ok(loaded) => self.state = loaded,
                Err(e) => {
                    error!("Failed to read keeper state file, retrying: {}", e);
                    continue;
                }
            }

            if first_loop {
                info!(
                    "mizar keeper is running, current state is \"{}\"",
                    self.state.current_role
                );
            }

            // check for changes in the local Postgres instance
            match self.probe.status().await {
                Ok(status) => {
                    if warned_on_previous_iteration {
                        info!(
                            "Updated the keeper's state from the local Postgres \
                             instance, which is {}",
                            if status.is_running {
                                "running"
                            } else {
                                "not running"
                            }
                        );
                    }
                    self.pg_status = status;
                }
                Err(e) => {
                    warned_on_current_iteration = true;
                    warn!(
                        "Failed to update the keeper's state from the local \
                         Postgres instance: {}",
                        e
                    );
                }
            }

            let mut contacted_this_round = false;

            if !self.monitor.is_enabled() {
                // without a monitor, the goal state comes from the state
                // file and the peer list from the nodes file, re-read every
                // cycle
                let force = self.state.current_role == NodeRole::WaitStandby;
                if let Err(e) = self.file_source_round(force).await {
                    warn!("Failed to update our list of other nodes: {}", e);
                    continue;
                }
            } else {
                contacted_this_round = self.monitor_round().await;

                if !could_contact && contacted_this_round && !first_loop {
                    info!("Successfully got the goal state from the monitor");
                }
                could_contact = contacted_this_round;
            }

            let need_transition = self.state.assigned_role != self.state.current_role;
            if need_transition {
                if could_contact {
                    info!(
                        "Monitor assigned new state \"{}\"",
                        self.state.assigned_role
                    );
                } else {
                    // without monitor contact we might have self-assigned it
                    info!("Reaching new state \"{}\"", self.state.assigned_role);
                }
            }

            let mut transition_failed = false;

            if need_transition {
                // A transition function may assume its preconditions hold,
                // so first make the current declared state physically true.
                if should_ensure_current_state_before_transition(
                    self.state.current_role,
                    self.state.assigned_role,
                ) {
                    if let Err(e) = self.fsm.ensure_current_state(self.state.current_role).await {
                        warn!(
                            "Failed to ensure current state \"{}\" before \
                             transition: {}",
                            self.state.current_role, e
                        );
                    }
                }

                match self
                    .fsm
                    .transition(self.state.current_role, self.state.assigned_role)
                    .await
                {
                    Ok(()) => {
                        self.state.current_role = self.state.assigned_role;
                    }
                    Err(e) => {
                        error!(
                            "Failed to transition to state \"{}\", retrying: {}",
                            self.state.assigned_role, e
                        );
                        transition_failed = true;
                    }
                }
            } else if could_contact || !self.monitor.is_enabled() {
                // no transition required: still re-assert the current state
                // (idempotent enforcement)
                match self.fsm.ensure_current_state(self.state.current_role).await {
                    Ok(()) => {
                        if warned_on_previous_iteration {
                            info!(
                                "mizar managed to ensure current state \"{}\"",
                                self.state.current_role
                            );
                        }
                    }
                    Err(e) => {
                        warned_on_current_iteration = true;
                        warn!(
                            "Failed to ensure current state \"{}\": Postgres {} \
                             running: {}",
                            self.state.current_role,
                            if self.pg_status.is_running {
                                "is"
                            } else {
                                "is not"
                            },
                            e
                        );
                    }
                }
            }

            // When using a monitor, the state is written even after a failed
            // transition: the persisted timestamps feed the partition
            // detector. Without a monitor, only persist completed changes,
            // since the file doubles as the (externally edited) goal state.
            if self.monitor.is_enabled() || (need_transition && !transition_failed) {
                if let Err(e) = state::store_state(self.config.state_file_path(), &self.state) {
                    error!("Failed to write the keeper state file: {}", e);
                    transition_failed = true;
                }
            }

            // A dropped node exits the whole process tree, after one extra
            // cycle so the monitor hears that the assigned state was
            // reached.
            if (could_contact || !self.monitor.is_enabled())
                && self.state.current_role == NodeRole::Dropped
                && self.state.assigned_role == NodeRole::Dropped
            {
                if dropped_reported {
                    info!("This node has been dropped from the monitor, stopping");
                    return Ok(KeeperExit::Dropped);
                }
                dropped_reported = true;
            }

            // cycle faster when a transition just happened or notifications
            // queued up behind this cycle
            if (need_transition
                || (self.monitor.is_enabled() && self.monitor.has_received_notifications()))
                && !transition_failed
            {
                do_sleep = false;
            }

            if self.signals.shutdown_requested() {
                break;
            }

            // the init steps must be re-tried until the monitor was reached
            if do_init && contacted_this_round {
                do_init = false;
                // contacting the monitor may have changed our identity
                // (node id, group); apply reload-time actions once more
                self.apply_reload().await;
            }

            if first_loop {
                first_loop = false;
            }

            warned_on_previous_iteration = warned_on_current_iteration;
        }

        info!("mizar keeper service is stopping");
        Ok(KeeperExit::Clean)
    }

    /// One node-active round-trip against the monitor. Returns whether the
    /// monitor could be contacted; on failure the network partition check
    /// may self-assign the demote-timeout role.
    async fn monitor_round(&mut self) -> bool {
        let now = now_secs();
        let report = self.build_report();

        let assigned = match self.monitor.node_active(&report).await {
            Ok(assigned) => assigned,
            Err(e) => {
                error!("Failed to get the goal state from the monitor: {}", e);
                self.check_for_network_partition(now).await;
                return false;
            }
        };

        self.state.last_monitor_contact = now;
        self.state.assigned_role = assigned.role;
        self.state.node_id = assigned.node_id;
        self.state.group_id = assigned.group_id;

        if self.state.assigned_role != self.state.current_role {
            debug!(
                "node_active: {} -> {}",
                self.state.current_role, self.state.assigned_role
            );
        }

        // a node on its way out has no use for a peer cache
        if self.state.current_role == NodeRole::Dropped
            && self.state.assigned_role == NodeRole::Dropped
        {
            return true;
        }

        // refresh the peer cache when the monitor reports a change
        if self.peers_version.as_deref() != Some(assigned.peers_version.as_str()) {
            match self.monitor.get_peers().await {
                Ok(peers) => {
                    debug!("Refreshed {} peer nodes from the monitor", peers.len());
                    self.peers = peers;
                    self.peers_version = Some(assigned.peers_version);
                }
                Err(e) => {
                    // the monitor might be restarting; try again next round
                    error!("Failed to update our list of other nodes: {}", e);
                    return false;
                }
            }
        }

        true
    }

    /// Monitor-disabled round: take the goal state from the state file and
    /// re-read the externally maintained nodes file
    async fn file_source_round(&mut self, force_cache_invalidation: bool) -> Result<()> {
        let report = self.build_report();
        let assigned = self.monitor.node_active(&report).await?;

        self.state.assigned_role = assigned.role;

        if force_cache_invalidation
            || self.peers_version.as_deref() != Some(assigned.peers_version.as_str())
        {
            self.peers = self.monitor.get_peers().await.unwrap_or_else(|e| {
                debug!("No peer nodes available: {}", e);
                Vec::new()
            });
            self.peers_version = Some(assigned.peers_version);
        }

        Ok(())
    }

    /// Decide whether we are on the wrong side of a network partition, and
    /// if so self-assign the demote-timeout role. Only a primary can cause
    /// split-brain, so any other role skips the check entirely.
    async fn check_for_network_partition(&mut self, now: u64) {
        if !self.state.current_role.is_primary() {
            return;
        }

        warn!("Checking for network partitions...");

        // a replica that is still attached proves we are not isolated, even
        // without the monitor
        match self
            .probe
            .has_replica_connected(&self.config.replication_user)
            .await
        {
            Ok(true) => {
                self.state.last_secondary_contact = now;
                warn!(
                    "We lost the monitor, but still have a standby: \
                     we're not in a network partition, continuing"
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to probe for connected standbys: {}", e);
            }
        }

        if !partition::in_network_partition(
            &self.state,
            now,
            self.config.network_partition_timeout,
        ) {
            info!("Network is healthy");
            return;
        }

        info!(
            "Failed to contact the monitor or a standby for {}s \
             (network partition timeout {}s), demoting ourselves to \
             prevent a split brain",
            now.saturating_sub(self.state.last_monitor_contact),
            self.config.network_partition_timeout
        );
        self.state.assigned_role = NodeRole::DemoteTimeout;
    }

    fn build_report(&self) -> NodeReport {
        NodeReport {
            node_id: self.state.node_id,
            group_id: self.state.group_id,
            current_role: self.state.current_role,
            pg_is_running: self.pg_status.is_running,
            current_lsn: self.pg_status.current_lsn.clone(),
            sync_state: self.pg_status.sync_state.clone(),
        }
    }

    /// Re-read the configuration file and push the changes to whoever they
    /// concern. Configuration errors keep the previous settings.
    async fn apply_reload(&mut self) {
        match self.config.reload() {
            Ok(new_config) => {
                if new_config != self.config {
                    info!("Reloaded configuration from \"{}\"",
                        self.config.config_path.display());
                }
                if let Err(e) = self.monitor.reconfigure(&new_config).await {
                    warn!("Failed to apply monitor configuration change: {}", e);
                }
                self.config = new_config;
            }
            Err(e) => {
                warn!(
                    "Failed to reload configuration, keeping current settings: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::mock::MockFsm;
    use crate::monitor::mock::{MockMonitor, MonitorRound};
    use crate::monitor::FileStateSource;
    use crate::pg::mock::MockProbe;
    use crate::pidfile::PidfileHeader;
    use schema::AssignedState;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn assigned(role: NodeRole) -> MonitorRound {
        MonitorRound::Assign(AssignedState {
            role,
            node_id: 1,
            group_id: 0,
            peers_version: "v1".to_string(),
        })
    }

    struct Fixture {
        // keeps the tempdir alive for the duration of the test
        _dir: TempDir,
        config: KeeperConfig,
        signals: Arc<SignalState>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let config = KeeperConfig {
                config_path: dir.path().join("mizar.toml"),
                node_name: "node_1".to_string(),
                node_host: "localhost".to_string(),
                node_port: 5432,
                pgdata: dir.path().to_path_buf(),
                replication_user: "repl".to_string(),
                monitor_uri: Some("postgres://monitor/ha".to_string()),
                monitor_disabled: false,
                network_partition_timeout: 20,
            };

            // configuration file for reloads, and the supervisor pidfile the
            // keeper fences against (we play the supervisor)
            std::fs::write(
                &config.config_path,
                format!(
                    "[node]\nname = \"node_1\"\nhost = \"localhost\"\n\n\
                     [postgres]\npgdata = \"{}\"\nreplicationUser = \"repl\"\n\n\
                     [monitor]\nuri = \"postgres://monitor/ha\"\n",
                    dir.path().display()
                ),
            )
            .unwrap();
            crate::pidfile::create_pidfile(
                &config.pidfile_path(),
                std::process::id() as i32,
                &PidfileHeader {
                    data_directory: dir.path().display().to_string(),
                    version: "test".to_string(),
                    state_file: config.state_file_path().display().to_string(),
                },
                &[],
            )
            .unwrap();

            Self {
                _dir: dir,
                config,
                signals: SignalState::new(),
            }
        }

        fn write_state(&self, state: &KeeperState) {
            state::store_state(self.config.state_file_path(), state).unwrap();
        }

        fn read_state(&self) -> KeeperState {
            state::load_state(self.config.state_file_path()).unwrap()
        }

        fn keeper(
            &self,
            monitor: Box<dyn MonitorClient>,
            fsm: Box<dyn FsmExecutor>,
            probe: Box<dyn PostgresProbe>,
        ) -> Keeper {
            Keeper::new(
                self.config.clone(),
                monitor,
                fsm,
                probe,
                self.signals.clone(),
                std::process::id() as i32,
            )
            .with_sleep(Duration::from_millis(1))
        }
    }

    async fn run_cycles_then_stop(fixture: &Fixture, mut keeper: Keeper) -> KeeperExit {
        let signals = fixture.signals.clone();
        let task = tokio::spawn(async move { keeper.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        signals.record_stop(nix::sys::signal::Signal::SIGTERM);
        timeout(WAIT, task).await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn monitor_assignment_drives_a_transition() {
        let fixture = Fixture::new();
        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![assigned(NodeRole::Single)]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        let exit = run_cycles_then_stop(&fixture, keeper).await;

        assert_eq!(exit, KeeperExit::Clean);
        assert!(fsm_handle
            .transitions()
            .contains(&(NodeRole::Init, NodeRole::Single)));

        let persisted = fixture.read_state();
        assert_eq!(persisted.current_role, NodeRole::Single);
        assert!(persisted.last_monitor_contact > 0);
        assert!(!monitor_handle.reports().is_empty());
    }

    #[tokio::test]
    async fn stable_state_still_reasserts_itself() {
        let fixture = Fixture::new();
        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Single;
        initial.assigned_role = NodeRole::Single;
        fixture.write_state(&initial);

        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![assigned(NodeRole::Single)]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        // no transition, but the current state was re-asserted every cycle
        assert!(fsm_handle.transitions().is_empty());
        assert!(!fsm_handle.ensures().is_empty());
        assert!(fsm_handle
            .ensures()
            .iter()
            .all(|role| *role == NodeRole::Single));
    }

    #[tokio::test]
    async fn partitioned_primary_demotes_itself() {
        let fixture = Fixture::new();
        let now = now_secs();
        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Primary;
        initial.assigned_role = NodeRole::Primary;
        // both channels last heard from 25s ago, timeout is 20s
        initial.last_monitor_contact = now - 25;
        initial.last_secondary_contact = now - 25;
        fixture.write_state(&initial);

        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![MonitorRound::Unreachable]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, pg) = MockProbe::new();
        pg.set_running(true);
        pg.set_has_replica(false);

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        assert!(fsm_handle
            .transitions()
            .contains(&(NodeRole::Primary, NodeRole::DemoteTimeout)));
        assert_eq!(fixture.read_state().current_role, NodeRole::DemoteTimeout);
    }

    #[tokio::test]
    async fn connected_replica_prevents_self_demotion() {
        let fixture = Fixture::new();
        let now = now_secs();
        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Primary;
        initial.assigned_role = NodeRole::Primary;
        initial.last_monitor_contact = now - 25;
        initial.last_secondary_contact = now - 25;
        fixture.write_state(&initial);

        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![MonitorRound::Unreachable]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, pg) = MockProbe::new();
        pg.set_running(true);
        pg.set_has_replica(true);

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        assert!(fsm_handle.transitions().is_empty());
        let persisted = fixture.read_state();
        assert_eq!(persisted.current_role, NodeRole::Primary);
        // the replica contact was refreshed while the monitor was away
        assert!(persisted.last_secondary_contact > now - 5);
    }

    #[tokio::test]
    async fn non_primary_does_not_self_demote() {
        let fixture = Fixture::new();
        let now = now_secs();
        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Secondary;
        initial.assigned_role = NodeRole::Secondary;
        initial.last_monitor_contact = now - 100;
        initial.last_secondary_contact = now - 100;
        fixture.write_state(&initial);

        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![MonitorRound::Unreachable]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        assert!(fsm_handle.transitions().is_empty());
        assert_eq!(fixture.read_state().current_role, NodeRole::Secondary);
    }

    #[tokio::test]
    async fn dropped_node_reports_once_more_then_exits() {
        let fixture = Fixture::new();
        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Secondary;
        initial.assigned_role = NodeRole::Secondary;
        fixture.write_state(&initial);

        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![assigned(NodeRole::Dropped)]);
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let mut keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        let exit = timeout(WAIT, keeper.run()).await.unwrap().unwrap();

        assert_eq!(exit, KeeperExit::Dropped);
        assert_eq!(exit.exit_code(), 121);
        assert!(fsm_handle
            .transitions()
            .contains(&(NodeRole::Secondary, NodeRole::Dropped)));
        // the dropped state was reported to the monitor at least once more
        // after reaching it
        assert!(monitor_handle.reports().len() >= 2);
    }

    #[tokio::test]
    async fn already_dropped_node_refuses_to_start() {
        let fixture = Fixture::new();
        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.set_dropped(true);
        let (fsm, _fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let mut keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        let exit = timeout(WAIT, keeper.run()).await.unwrap().unwrap();

        assert_eq!(exit, KeeperExit::AlreadyDropped);
        assert_eq!(exit.exit_code(), 122);
        assert!(monitor_handle.reports().is_empty());
    }

    #[tokio::test]
    async fn failed_transition_is_retried_next_cycle() {
        let fixture = Fixture::new();
        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![assigned(NodeRole::Single)]);
        let (fsm, fsm_handle) = MockFsm::new();
        fsm_handle.fail_next_transitions(1);
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        // the scripted failure was retried and eventually succeeded
        assert!(fsm_handle
            .transitions()
            .contains(&(NodeRole::Init, NodeRole::Single)));
        assert_eq!(fixture.read_state().current_role, NodeRole::Single);
    }

    #[tokio::test]
    async fn peer_cache_refreshes_only_on_version_change() {
        let fixture = Fixture::new();
        let (monitor, monitor_handle) = MockMonitor::new();
        monitor_handle.script(vec![assigned(NodeRole::Single)]);
        monitor_handle.set_peers(vec![NodePeer {
            node_id: 2,
            name: "node_2".to_string(),
            host: "db2".to_string(),
            port: 5432,
            role: NodeRole::Secondary,
        }]);
        let (fsm, _fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(monitor), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        // many cycles ran, but the version marker never changed after the
        // first fetch
        assert_eq!(monitor_handle.peer_fetches(), 1);
    }

    #[tokio::test]
    async fn disabled_monitor_takes_goal_state_from_the_state_file() {
        let mut fixture = Fixture::new();
        fixture.config.monitor_disabled = true;
        fixture.config.monitor_uri = None;

        let mut initial = KeeperState::new();
        initial.current_role = NodeRole::Init;
        initial.assigned_role = NodeRole::Single; // externally edited goal
        fixture.write_state(&initial);

        let source = FileStateSource::new(
            fixture.config.state_file_path(),
            fixture.config.nodes_file_path(),
        );
        let (fsm, fsm_handle) = MockFsm::new();
        let (probe, _pg) = MockProbe::new();

        let keeper = fixture.keeper(Box::new(source), Box::new(fsm), Box::new(probe));
        run_cycles_then_stop(&fixture, keeper).await;

        assert!(fsm_handle
            .transitions()
            .contains(&(NodeRole::Init, NodeRole::Single)));
        assert_eq!(fixture.read_state().current_role, NodeRole::Single);
    }
}
