//! FSM executor interface
//!
//! The keeper loop decides *that* a transition is needed; *how* each
//! (current, assigned) pair is implemented lives behind this trait. The full
//! transition table is a collaborator concern; what ships here is the
//! precondition logic shared by every executor, and a local executor that
//! enforces the one invariant common to all roles: Postgres runs exactly
//! when the role requires it.

use crate::pg::PostgresController;
use crate::Result;
use async_trait::async_trait;
use schema::NodeRole;
use tracing::{debug, info, warn};

/// Drives the node from one role to another
#[async_trait]
pub trait FsmExecutor: Send {
    /// Move the node from `current` to `assigned`.
    ///
    /// A transition function may assume its preconditions hold: the caller
    /// asserts the current state first (see
    /// [`should_ensure_current_state_before_transition`]).
    async fn transition(&mut self, current: NodeRole, assigned: NodeRole) -> Result<()>;

    /// Idempotently enforce the current role: if Postgres should be running
    /// and is not, start it; if it should not be running and is, stop it.
    /// Calling this twice with no intervening change has no further effect.
    async fn ensure_current_state(&mut self, current: NodeRole) -> Result<()>;
}

/// Whether the current state should be asserted before transitioning.
///
/// Not asserting is the exception: when either side of the transition is one
/// of the demoted-family roles, enforcing the current state first would
/// fight the transition itself (starting Postgres on the way from PRIMARY to
/// DEMOTED is a split-brain hazard), and a secondary leaving its role may
/// have no upstream to reconnect to.
pub fn should_ensure_current_state_before_transition(
    current: NodeRole,
    assigned: NodeRole,
) -> bool {
    if current == assigned {
        debug!(
            "BUG: should_ensure_current_state_before_transition called \
             with assigned role == current role == {}",
            current
        );
        return false;
    }

    let demoted_family = |role: NodeRole| {
        matches!(
            role,
            NodeRole::Draining | NodeRole::DemoteTimeout | NodeRole::Demoted
        )
    };

    if demoted_family(assigned) || demoted_family(current) {
        return false;
    }

    if current == NodeRole::Secondary && assigned != NodeRole::Secondary {
        return false;
    }

    true
}

/// FSM executor backed by the local Postgres controller.
///
/// Transitions are implemented as "make the target role's Postgres
/// expectation true"; per-pair refinements (base backups, promotion,
/// replication setup) belong to the wrapping deployment and are layered on
/// top of this executor.
pub struct LocalFsm {
    controller: Box<dyn PostgresController>,
}

impl LocalFsm {
    pub fn new(controller: Box<dyn PostgresController>) -> Self {
        Self { controller }
    }

    async fn enforce_role(&mut self, role: NodeRole) -> Result<()> {
        let running = self.controller.is_running().await;
        if role.expects_postgres_running() && !running {
            info!("Postgres should be running in state \"{}\", starting it", role);
            self.controller.start_postgres().await?;
        } else if !role.expects_postgres_running() && running {
            warn!(
                "Postgres is running while in state \"{}\", stopping Postgres",
                role
            );
            self.controller.stop_postgres().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FsmExecutor for LocalFsm {
    async fn transition(&mut self, current: NodeRole, assigned: NodeRole) -> Result<()> {
        debug!("Transition: {} -> {}", current, assigned);
        self.enforce_role(assigned).await
    }

    async fn ensure_current_state(&mut self, current: NodeRole) -> Result<()> {
        debug!("Ensuring current state: {}", current);
        self.enforce_role(current).await
    }
}

/// Scripted FSM for tests
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Shared {
        transitions: Vec<(NodeRole, NodeRole)>,
        ensures: Vec<NodeRole>,
        fail_transitions: u32,
    }

    /// Scripting and observation handle for a [`MockFsm`]
    #[derive(Debug, Clone, Default)]
    pub struct FsmHandle {
        shared: Arc<Mutex<Shared>>,
    }

    impl FsmHandle {
        /// Make the next `n` transition calls fail
        pub fn fail_next_transitions(&self, n: u32) {
            self.shared.lock().unwrap().fail_transitions = n;
        }

        /// Transitions performed so far, in order
        pub fn transitions(&self) -> Vec<(NodeRole, NodeRole)> {
            self.shared.lock().unwrap().transitions.clone()
        }

        /// Roles passed to ensure_current_state, in order
        pub fn ensures(&self) -> Vec<NodeRole> {
            self.shared.lock().unwrap().ensures.clone()
        }
    }

    /// An [`FsmExecutor`] that records calls and can be told to fail
    pub struct MockFsm {
        handle: FsmHandle,
    }

    impl MockFsm {
        pub fn new() -> (Self, FsmHandle) {
            let handle = FsmHandle::default();
            (
                Self {
                    handle: handle.clone(),
                },
                handle,
            )
        }
    }

    #[async_trait]
    impl FsmExecutor for MockFsm {
        async fn transition(&mut self, current: NodeRole, assigned: NodeRole) -> Result<()> {
            let mut shared = self.handle.shared.lock().unwrap();
            if shared.fail_transitions > 0 {
                shared.fail_transitions -= 1;
                return Err(crate::CoreError::TransitionError(format!(
                    "scripted failure transitioning {} -> {}",
                    current, assigned
                )));
            }
            shared.transitions.push((current, assigned));
            Ok(())
        }

        async fn ensure_current_state(&mut self, current: NodeRole) -> Result<()> {
            self.handle.shared.lock().unwrap().ensures.push(current);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::mock::MockController;

    #[test]
    fn demoted_family_skips_the_current_state_assertion() {
        use schema::NodeRole::*;
        assert!(!should_ensure_current_state_before_transition(
            Primary, Draining
        ));
        assert!(!should_ensure_current_state_before_transition(
            Primary,
            DemoteTimeout
        ));
        assert!(!should_ensure_current_state_before_transition(
            Demoted, Single
        ));
        assert!(!should_ensure_current_state_before_transition(
            Secondary, ReportLsn
        ));

        assert!(should_ensure_current_state_before_transition(
            Single, WaitPrimary
        ));
        assert!(should_ensure_current_state_before_transition(
            Catchingup, Secondary
        ));
    }

    #[tokio::test]
    async fn ensure_current_state_is_idempotent() {
        let (controller, handle) = MockController::new();
        let mut fsm = LocalFsm::new(Box::new(controller));

        // role expects Postgres running, it is not: exactly one start
        fsm.ensure_current_state(NodeRole::Primary).await.unwrap();
        assert_eq!(handle.starts(), 1);
        assert!(handle.running());

        // a second call with no intervening change does not start again
        fsm.ensure_current_state(NodeRole::Primary).await.unwrap();
        assert_eq!(handle.starts(), 1);
    }

    #[tokio::test]
    async fn demoted_role_stops_a_running_postgres() {
        let (controller, handle) = MockController::new();
        handle.set_running(true);
        let mut fsm = LocalFsm::new(Box::new(controller));

        fsm.ensure_current_state(NodeRole::Demoted).await.unwrap();
        assert!(!handle.running());
        assert_eq!(handle.stops(), 1);

        fsm.ensure_current_state(NodeRole::Demoted).await.unwrap();
        assert_eq!(handle.stops(), 1);
    }

    #[tokio::test]
    async fn transition_enforces_the_target_role() {
        let (controller, handle) = MockController::new();
        handle.set_running(true);
        let mut fsm = LocalFsm::new(Box::new(controller));

        fsm.transition(NodeRole::Primary, NodeRole::Demoted)
            .await
            .unwrap();
        assert!(!handle.running());
    }
}
