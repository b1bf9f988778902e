//! Agent-facing wire types — enrollment, heartbeats, dispatch, results.
//!
//! Ingest types deliberately tolerate unknown top-level fields so newer
//! agents can talk to older control planes (serde's default). The
//! tenant/admin surface is the opposite — those request types live beside
//! their handlers and reject unknown fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::ActionSpec;
use crate::state::{ExecutionState, VmState};

/// Request body for `POST /v1/enroll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Single-use bearer token issued by the tenant.
    pub enrollment_token: String,
    pub hostname: String,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    /// PEM-encoded PKCS#10 certificate signing request.
    pub csr_pem: String,
    /// Caller-generated nonce, echoed into the audit trail.
    pub bootstrap_nonce: String,
}

/// Response body for a successful enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub agent_id: Uuid,
    /// The signed client certificate, PEM.
    pub client_certificate_pem: String,
    /// The CA certificate to pin, PEM.
    pub ca_certificate_pem: String,
    /// Plaintext refresh token — returned exactly once.
    pub refresh_token: String,
    pub heartbeat_endpoint: String,
    pub heartbeat_interval_sec: u64,
}

/// Request body for `POST /v1/renew` (mTLS + bearer refresh token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub refresh_token: String,
    /// Fresh CSR generated with the agent's existing private key.
    pub csr_pem: String,
}

/// Response body for a successful certificate renewal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    pub client_certificate_pem: String,
    pub ca_certificate_pem: String,
    /// Hex serial of the newly issued certificate.
    pub cert_serial: String,
}

/// Host facts reported on every heartbeat, flattened into the heartbeat body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: String,
    pub cpu_cores_total: u32,
    pub memory_bytes_total: u64,
    pub storage_bytes_total: u64,
    pub kvm_available: bool,
    pub cloud_hypervisor_available: bool,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
}

/// One microVM as the agent currently sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedVm {
    /// The site-scoped VM key (the `vm_id` from the originating plan).
    pub vm_id: String,
    pub state: VmState,
}

/// A terminal outcome for one execution, reported by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    /// Must be terminal (`SUCCEEDED` or `FAILED`); anything else is rejected.
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Request body for `POST /v1/heartbeat`.
///
/// `heartbeat_seq` is informational — duplicates and reordering are
/// accepted. Unknown top-level fields are tolerated by design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: Uuid,
    pub heartbeat_seq: u64,
    #[serde(flatten)]
    pub facts: HostFacts,
    #[serde(default)]
    pub microvms: Vec<ReportedVm>,
    #[serde(default)]
    pub execution_updates: Vec<ExecutionUpdate>,
}

/// One action handed to the agent under a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedAction {
    pub execution_id: Uuid,
    /// Stable idempotency key for the agent's action cache. Identical
    /// across lease-expiry re-dispatch and plan resubmission.
    pub action_id: String,
    pub operation_id: String,
    pub vm_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub spec: ActionSpec,
}

/// A plan's leased actions, grouped for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedPlan {
    pub plan_id: Uuid,
    pub actions: Vec<DispatchedAction>,
}

/// Response body for `POST /v1/heartbeat` and `GET /v1/plans/next`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub next_heartbeat_seconds: u64,
    #[serde(default)]
    pub pending_plans: Vec<DispatchedPlan>,
}

/// Request body for `POST /v1/executions/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResultRequest {
    pub updates: Vec<ExecutionUpdate>,
}

/// Severity of one execution log frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log frame emitted during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    pub execution_id: Uuid,
    /// Monotonic per-execution sequence; `(execution_id, sequence)` is unique.
    pub sequence: u32,
    pub severity: LogSeverity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

/// Request body for `POST /v1/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub frames: Vec<LogFrame>,
}

/// The JSON error body every endpoint returns on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub request_id: Uuid,
}
