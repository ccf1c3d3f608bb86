//! Network partition detection
//!
//! A primary that can reach neither the monitor nor any standby for longer
//! than the configured timeout must assume it is on the wrong side of a
//! partition: on the other side, the monitor and the standby will proceed
//! with a failover once the same timeout has passed, and a primary that
//! keeps serving writes would produce a split brain.
//!
//! The decision is a pure function of timestamps. Losing only one of the two
//! channels is not sufficient evidence of isolation, so both lags must
//! exceed the timeout; and a node that never had contact on a channel is
//! still starting up, not partitioned.

use schema::KeeperState;

/// Whether the node must consider itself partitioned at `now` (epoch
/// seconds).
///
/// True only when all of the following hold:
/// - the node is currently a primary (no other role can cause split-brain
///   by staying up)
/// - both the monitor and a standby have been reached at least once
/// - both `now - last_monitor_contact` and `now - last_secondary_contact`
///   exceed `timeout`
pub fn in_network_partition(state: &KeeperState, now: u64, timeout: u64) -> bool {
    let monitor_lag = now.saturating_sub(state.last_monitor_contact);
    let secondary_lag = now.saturating_sub(state.last_secondary_contact);

    state.current_role.is_primary()
        && state.last_monitor_contact > 0
        && state.last_secondary_contact > 0
        && monitor_lag > timeout
        && secondary_lag > timeout
}
