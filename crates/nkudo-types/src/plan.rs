//! Plan submission types — the tenant-facing half of the dispatch contract.
//!
//! A plan is an immutable, idempotently-submitted set of actions targeting
//! one site. The wire format carries `{operation, ...}` with
//! operation-specific parameters, modeled as an internally-tagged enum so an
//! unknown operation fails deserialization (rendered as `INVALID_REQUEST`)
//! instead of being silently ignored.

use serde::{Deserialize, Serialize};

use crate::state::OperationKind;

/// Request body for `POST /sites/{id}/plans`.
///
/// Tenant-facing: unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyPlanRequest {
    /// Client-chosen deduplication key, unique per `(tenant, site)`.
    pub idempotency_key: String,
    /// Optional client correlation id, echoed back verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
    /// The actions to execute, in order.
    pub actions: Vec<PlanAction>,
}

/// One action within a plan.
///
/// Serde cannot combine `deny_unknown_fields` with the flattened operation
/// tag, so stray fields on an action are tolerated; an unknown `operation`
/// value still fails hard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAction {
    /// Unique within the plan; duplicates fail with `DUPLICATE_OPERATION`.
    pub operation_id: String,
    /// Client-chosen VM key, scoped to the site.
    pub vm_id: String,
    /// Per-action provider budget in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// The operation and its parameters.
    #[serde(flatten)]
    pub spec: ActionSpec,
}

impl PlanAction {
    /// The operation kind this action performs.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.spec.kind()
    }
}

/// Operation-specific parameters, tagged by `operation` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionSpec {
    /// Provision a new microVM. Settles in `STOPPED`.
    Create {
        vcpu_count: u32,
        memory_mib: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kernel_image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rootfs_image: Option<String>,
    },
    /// Boot a stopped microVM.
    Start {},
    /// Stop a running microVM.
    Stop {},
    /// Tear the microVM down. Idempotent — valid from any state.
    Delete {},
    /// Pause a running microVM in place.
    Pause {},
    /// Resume a paused microVM.
    Resume {},
    /// Snapshot the microVM's disk and memory to a destination path.
    Snapshot { destination: String },
    /// Run a command inside the guest and capture its exit code.
    Execute {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ActionSpec {
    /// The operation kind of this spec.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Start {} => OperationKind::Start,
            Self::Stop {} => OperationKind::Stop,
            Self::Delete {} => OperationKind::Delete,
            Self::Pause {} => OperationKind::Pause,
            Self::Resume {} => OperationKind::Resume,
            Self::Snapshot { .. } => OperationKind::Snapshot,
            Self::Execute { .. } => OperationKind::Execute,
        }
    }
}
