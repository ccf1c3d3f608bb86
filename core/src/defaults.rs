//! Process-wide constants: service names, exit codes, loop timing

use std::time::Duration;

/// Service name for the Postgres controller child process
pub const SERVICE_NAME_POSTGRES: &str = "postgres";

/// Service name for the keeper node-active child process
pub const SERVICE_NAME_KEEPER: &str = "node-active";

/// Exit code used when asked politely to quit
pub const EXIT_CODE_QUIT: i32 = 0;

/// Exit code for command-line usage errors
pub const EXIT_CODE_BAD_ARGS: i32 = 1;

/// Exit code for configuration errors
pub const EXIT_CODE_BAD_CONFIG: i32 = 2;

/// Exit code for invariant violations
pub const EXIT_CODE_INTERNAL_ERROR: i32 = 12;

/// Exit code when the node has been dropped from the monitor.
/// The whole process tree stops and must not be restarted.
pub const EXIT_CODE_DROPPED: i32 = 121;

/// Exit code for unrecoverable errors. No restart, an operator must
/// intervene.
pub const EXIT_CODE_FATAL: i32 = 122;

/// Supervision loop wake-up period. Bounds the latency of signal handling
/// without busy-spinning; the shutdown escalation thresholds below are
/// counted in ticks of this period.
pub const SUPERVISOR_TICK: Duration = Duration::from_millis(100);

/// Number of stopping-loop ticks (~5s) after which the whole process group
/// is re-signaled with the current shutdown signal
pub const SHUTDOWN_RESIGNAL_TICKS: u64 = 50;

/// Every further multiple of this many stopping-loop ticks, the shutdown
/// signal escalates to a strictly stronger one
pub const SHUTDOWN_ESCALATE_TICKS: u64 = 100;

/// MaxR: how many restarts a service is granted before the MaxT window is
/// consulted
pub const SUPERVISOR_SERVICE_MAX_RETRY: u32 = 5;

/// MaxT: a restart beyond MaxR is only allowed once the oldest tracked
/// restart is older than this many seconds
pub const SUPERVISOR_SERVICE_MAX_TIME: u64 = 300;

/// How long the keeper sleeps between reconciliation cycles, also the bound
/// on the monitor notification wait
pub const KEEPER_SLEEP_TIME: Duration = Duration::from_secs(5);

/// Default network partition timeout in seconds
pub const NETWORK_PARTITION_TIMEOUT: u64 = 20;

/// Postgres replication user probed for attached standbys
pub const REPLICA_USERNAME: &str = "pgha_replicator";
