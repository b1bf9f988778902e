//! State machines for microVMs, executions, plans, and agents.
//!
//! Every state transition in the system is decided here, in pure functions,
//! so the control plane and the agent cannot drift apart. The provider on
//! the agent validates transitions before touching the hypervisor; the
//! control plane applies the same table when a terminal execution drives a
//! VM row forward.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Pending,
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    Deleting,
    Deleted,
}

impl VmState {
    /// Whether the VM still exists from the provider's point of view.
    #[must_use]
    pub fn is_present(self) -> bool {
        !matches!(self, Self::Deleted)
    }

    /// The wire string for this state (`RUNNING`, `STOPPED`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Creating => "CREATING",
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Paused => "PAUSED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of operation a plan action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Delete,
    Pause,
    Resume,
    Snapshot,
    Execute,
}

impl OperationKind {
    /// The wire string for this operation (`CREATE`, `START`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Delete => "DELETE",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Snapshot => "SNAPSHOT",
            Self::Execute => "EXECUTE",
        }
    }

    /// The VM state a successful execution of this operation settles into.
    ///
    /// `None` means the operation does not move the VM's lifecycle state
    /// (SNAPSHOT and EXECUTE observe the VM, they do not transition it).
    #[must_use]
    pub fn state_after_success(self) -> Option<VmState> {
        match self {
            Self::Create | Self::Stop => Some(VmState::Stopped),
            Self::Start | Self::Resume => Some(VmState::Running),
            Self::Pause => Some(VmState::Paused),
            Self::Delete => Some(VmState::Deleted),
            Self::Snapshot | Self::Execute => None,
        }
    }

    /// Validate this operation against the VM's current state.
    ///
    /// `current` is `None` when the provider has never seen the VM.
    /// DELETE is valid from every present state and, per the idempotency
    /// contract, also from DELETED/absent (the provider reports success
    /// with a "not present" note).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the operation is not legal from
    /// `current`.
    pub fn check_transition(self, current: Option<VmState>) -> Result<(), InvalidTransition> {
        let ok = match self {
            Self::Create => current.is_none() || current == Some(VmState::Deleted),
            Self::Start => current == Some(VmState::Stopped),
            Self::Stop => current == Some(VmState::Running),
            Self::Pause => current == Some(VmState::Running),
            Self::Resume => current == Some(VmState::Paused),
            Self::Delete => true,
            Self::Snapshot => matches!(
                current,
                Some(VmState::Running | VmState::Stopped | VmState::Paused)
            ),
            Self::Execute => current == Some(VmState::Running),
        };
        if ok {
            Ok(())
        } else {
            Err(InvalidTransition {
                operation: self,
                current,
            })
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation was attempted from a VM state that does not permit it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation {operation} invalid from state {}", .current.map_or("<absent>", VmState::as_str))]
pub struct InvalidTransition {
    pub operation: OperationKind,
    pub current: Option<VmState>,
}

/// Lifecycle state of one execution (one action's control-plane record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl ExecutionState {
    /// Terminal states are immutable — later updates are discarded.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Status of a plan, derived from its executions at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

/// Derive a plan's status from the states of its executions.
///
/// A plan is FAILED only once every execution is terminal and at least one
/// failed; SUCCEEDED when all succeeded; PENDING while nothing has started;
/// IN_PROGRESS otherwise. There is no push-on-first-failure — status is
/// recomputed from the rows on every read.
#[must_use]
pub fn derive_plan_status(executions: &[ExecutionState]) -> PlanStatus {
    if executions.iter().all(|s| *s == ExecutionState::Pending) {
        return PlanStatus::Pending;
    }
    if executions.iter().all(|s| s.is_terminal()) {
        if executions.iter().any(|s| *s == ExecutionState::Failed) {
            return PlanStatus::Failed;
        }
        return PlanStatus::Succeeded;
    }
    PlanStatus::InProgress
}

/// Reported lifecycle state of an enrolled agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Online,
    Offline,
    Unenrolled,
}

/// Connectivity of a site, aggregated from its agents' heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    Online,
    Offline,
    Unknown,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn create_start_stop_delete_walks_the_lifecycle() {
        assert!(OperationKind::Create.check_transition(None).is_ok());
        assert_eq!(
            OperationKind::Create.state_after_success(),
            Some(VmState::Stopped)
        );
        assert!(
            OperationKind::Start
                .check_transition(Some(VmState::Stopped))
                .is_ok()
        );
        assert_eq!(
            OperationKind::Start.state_after_success(),
            Some(VmState::Running)
        );
        assert!(
            OperationKind::Stop
                .check_transition(Some(VmState::Running))
                .is_ok()
        );
        assert!(
            OperationKind::Delete
                .check_transition(Some(VmState::Stopped))
                .is_ok()
        );
        assert_eq!(
            OperationKind::Delete.state_after_success(),
            Some(VmState::Deleted)
        );
    }

    #[test]
    fn pause_resume_only_from_running_and_paused() {
        assert!(
            OperationKind::Pause
                .check_transition(Some(VmState::Running))
                .is_ok()
        );
        assert!(
            OperationKind::Resume
                .check_transition(Some(VmState::Paused))
                .is_ok()
        );
        assert!(
            OperationKind::Pause
                .check_transition(Some(VmState::Stopped))
                .is_err()
        );
        assert!(
            OperationKind::Resume
                .check_transition(Some(VmState::Running))
                .is_err()
        );
    }

    #[test]
    fn start_from_running_is_invalid() {
        let err = OperationKind::Start
            .check_transition(Some(VmState::Running))
            .unwrap_err();
        assert_eq!(err.operation, OperationKind::Start);
        assert_eq!(err.current, Some(VmState::Running));
    }

    #[test]
    fn delete_is_valid_from_everywhere() {
        for state in [
            None,
            Some(VmState::Stopped),
            Some(VmState::Running),
            Some(VmState::Paused),
            Some(VmState::Deleted),
        ] {
            assert!(OperationKind::Delete.check_transition(state).is_ok());
        }
    }

    #[test]
    fn execute_requires_running() {
        assert!(
            OperationKind::Execute
                .check_transition(Some(VmState::Running))
                .is_ok()
        );
        assert!(
            OperationKind::Execute
                .check_transition(Some(VmState::Stopped))
                .is_err()
        );
        assert!(OperationKind::Execute.check_transition(None).is_err());
    }

    #[test]
    fn snapshot_and_execute_leave_vm_state_alone() {
        assert_eq!(OperationKind::Snapshot.state_after_success(), None);
        assert_eq!(OperationKind::Execute.state_after_success(), None);
    }

    #[test]
    fn plan_status_pending_until_first_dispatch() {
        use ExecutionState::{Failed, InProgress, Pending, Succeeded};
        assert_eq!(derive_plan_status(&[Pending, Pending]), PlanStatus::Pending);
        assert_eq!(
            derive_plan_status(&[InProgress, Pending]),
            PlanStatus::InProgress
        );
        assert_eq!(
            derive_plan_status(&[Succeeded, Succeeded]),
            PlanStatus::Succeeded
        );
        assert_eq!(
            derive_plan_status(&[Succeeded, Failed]),
            PlanStatus::Failed
        );
        // One failure does not fail the plan while work is still in flight.
        assert_eq!(
            derive_plan_status(&[Failed, InProgress]),
            PlanStatus::InProgress
        );
    }

    #[test]
    fn states_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&VmState::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionState::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&AgentState::Unenrolled).unwrap(),
            "\"UNENROLLED\""
        );
    }
}
