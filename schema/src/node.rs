//! Node roles and keeper state
//!
//! A Mizar node always holds two roles at once: the role it believes it
//! currently implements, and the role the monitor wants it to reach. The
//! keeper loop converges the former toward the latter. Both roles, together
//! with the contact timestamps that feed the network partition detector, are
//! persisted to disk after every reconciliation cycle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of the on-disk keeper state format
pub const KEEPER_STATE_VERSION: u32 = 1;

/// Role of a Postgres node in its replication group
///
/// The string forms (`"primary"`, `"demote_timeout"`, ...) are stable: they
/// appear in the persisted state file, in log lines, and in the monitor
/// protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Node is being initialized, nothing is known yet
    Init,
    /// Only node in the group, accepting writes without replication
    Single,
    /// Primary waiting for a standby to join
    WaitPrimary,
    /// Primary with at least one standby attached
    Primary,
    /// Standby being prepared (base backup in progress)
    WaitStandby,
    /// Standby replaying WAL to catch up with the primary
    Catchingup,
    /// Standby fully caught up and streaming
    Secondary,
    /// Standby preparing to be promoted
    PrepPromotion,
    /// Standby cutting replication before promotion
    StopReplication,
    /// Primary being drained before demotion
    Draining,
    /// Primary that demoted itself after losing both monitor and standby
    DemoteTimeout,
    /// Former primary, Postgres stopped
    Demoted,
    /// Standby reporting its last received LSN during a failover election
    ReportLsn,
    /// Node taken out of the group for maintenance
    Maintenance,
    /// Node removed from the monitor, terminal
    Dropped,
}

impl NodeRole {
    /// Whether Postgres is expected to be running while the node holds this
    /// role. Demoted-family roles and terminal roles keep Postgres down to
    /// avoid serving writes from a node the rest of the group has moved away
    /// from.
    pub fn expects_postgres_running(&self) -> bool {
        !matches!(
            self,
            NodeRole::Init
                | NodeRole::Draining
                | NodeRole::DemoteTimeout
                | NodeRole::Demoted
                | NodeRole::Dropped
        )
    }

    /// Whether this role may cause split-brain by staying up without
    /// coordination. Only a primary qualifies.
    pub fn is_primary(&self) -> bool {
        matches!(self, NodeRole::Primary)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Init => "init",
            NodeRole::Single => "single",
            NodeRole::WaitPrimary => "wait_primary",
            NodeRole::Primary => "primary",
            NodeRole::WaitStandby => "wait_standby",
            NodeRole::Catchingup => "catchingup",
            NodeRole::Secondary => "secondary",
            NodeRole::PrepPromotion => "prep_promotion",
            NodeRole::StopReplication => "stop_replication",
            NodeRole::Draining => "draining",
            NodeRole::DemoteTimeout => "demote_timeout",
            NodeRole::Demoted => "demoted",
            NodeRole::ReportLsn => "report_lsn",
            NodeRole::Maintenance => "maintenance",
            NodeRole::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(NodeRole::Init),
            "single" => Ok(NodeRole::Single),
            "wait_primary" => Ok(NodeRole::WaitPrimary),
            "primary" => Ok(NodeRole::Primary),
            "wait_standby" => Ok(NodeRole::WaitStandby),
            "catchingup" => Ok(NodeRole::Catchingup),
            "secondary" => Ok(NodeRole::Secondary),
            "prep_promotion" => Ok(NodeRole::PrepPromotion),
            "stop_replication" => Ok(NodeRole::StopReplication),
            "draining" => Ok(NodeRole::Draining),
            "demote_timeout" => Ok(NodeRole::DemoteTimeout),
            "demoted" => Ok(NodeRole::Demoted),
            "report_lsn" => Ok(NodeRole::ReportLsn),
            "maintenance" => Ok(NodeRole::Maintenance),
            "dropped" => Ok(NodeRole::Dropped),
            other => Err(format!("unknown node role \"{}\"", other)),
        }
    }
}

/// Persisted keeper state
///
/// Re-read from disk at the top of every reconciliation cycle and written
/// back (atomically) at the end. The contact timestamps are epoch seconds;
/// zero means "never", which the partition detector treats as "still
/// starting up, not yet partitioned".
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeeperState {
    /// Format version
    pub version: u32,
    /// Node id assigned by the monitor (0 before registration)
    pub node_id: i64,
    /// Replication group id assigned by the monitor
    pub group_id: i32,
    /// Role the node currently implements
    pub current_role: NodeRole,
    /// Role the monitor wants the node to reach
    pub assigned_role: NodeRole,
    /// Epoch seconds of the last successful monitor round-trip
    pub last_monitor_contact: u64,
    /// Epoch seconds of the last confirmed standby connection
    pub last_secondary_contact: u64,
}

impl KeeperState {
    /// Fresh state for a node that has not registered yet
    pub fn new() -> Self {
        Self {
            version: KEEPER_STATE_VERSION,
            node_id: 0,
            group_id: 0,
            current_role: NodeRole::Init,
            assigned_role: NodeRole::Init,
            last_monitor_contact: 0,
            last_secondary_contact: 0,
        }
    }
}

impl Default for KeeperState {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of the local Postgres instance as seen by the probe
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgStatus {
    /// Whether the postmaster is running
    pub is_running: bool,
    /// Whether the instance is in recovery (standby mode)
    pub is_in_recovery: bool,
    /// Replication sync state reported for our standby, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<String>,
    /// Current WAL insert/replay location, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_lsn: Option<String>,
}

/// Status report sent to the monitor on every node-active round-trip
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    /// Node id assigned by the monitor (0 before registration)
    pub node_id: i64,
    /// Replication group id
    pub group_id: i32,
    /// Role the node currently implements
    pub current_role: NodeRole,
    /// Whether we report Postgres as running
    pub pg_is_running: bool,
    /// Current WAL location, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_lsn: Option<String>,
    /// Replication sync state, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<String>,
}

/// Goal state returned by the monitor from a node-active round-trip
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignedState {
    /// Role the monitor wants the node to reach
    pub role: NodeRole,
    /// Node id, authoritative
    pub node_id: i64,
    /// Group id, authoritative
    pub group_id: i32,
    /// Opaque version marker for the peer list; when it changes the keeper
    /// must refresh its cached peers
    pub peers_version: String,
}

/// A peer node in the same replication group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePeer {
    /// Node id on the monitor
    pub node_id: i64,
    /// Node name for logs
    pub name: String,
    /// Hostname the peer listens on
    pub host: String,
    /// Port the peer listens on
    pub port: u16,
    /// Role the peer currently reports
    pub role: NodeRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_string_forms_roundtrip() {
        let roles = [
            NodeRole::Init,
            NodeRole::Single,
            NodeRole::WaitPrimary,
            NodeRole::Primary,
            NodeRole::WaitStandby,
            NodeRole::Catchingup,
            NodeRole::Secondary,
            NodeRole::PrepPromotion,
            NodeRole::StopReplication,
            NodeRole::Draining,
            NodeRole::DemoteTimeout,
            NodeRole::Demoted,
            NodeRole::ReportLsn,
            NodeRole::Maintenance,
            NodeRole::Dropped,
        ];
        for role in roles {
            let parsed: NodeRole = role.to_string().parse().expect("parse back");
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn unknown_role_string_is_rejected() {
        assert!("standby-ish".parse::<NodeRole>().is_err());
    }

    #[test]
    fn demoted_family_keeps_postgres_down() {
        assert!(!NodeRole::Demoted.expects_postgres_running());
        assert!(!NodeRole::DemoteTimeout.expects_postgres_running());
        assert!(!NodeRole::Draining.expects_postgres_running());
        assert!(!NodeRole::Dropped.expects_postgres_running());
        assert!(NodeRole::Primary.expects_postgres_running());
        assert!(NodeRole::Secondary.expects_postgres_running());
    }

    #[test]
    fn keeper_state_serde_roundtrip() {
        let state = KeeperState {
            version: KEEPER_STATE_VERSION,
            node_id: 3,
            group_id: 0,
            current_role: NodeRole::Primary,
            assigned_role: NodeRole::Demoted,
            last_monitor_contact: 1_700_000_000,
            last_secondary_contact: 1_700_000_100,
        };
        let json = serde_json::to_string(&state).expect("serialize");
        let back: KeeperState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
