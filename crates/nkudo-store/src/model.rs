//! Persisted entities.
//!
//! Ownership runs tenant → site → {host, agent, microvm, plan} →
//! execution → log line. Deleting a tenant cascades. VM state is driven by
//! execution outcomes and heartbeat reconciliation, never written directly
//! by an operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_types::plan::ActionSpec;
use nkudo_types::state::{
    AgentState, ConnectivityState, ExecutionState, OperationKind, VmState,
};
use nkudo_types::wire::LogSeverity;

/// A tenant — the isolation boundary for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// URL-safe, unique across the deployment.
    pub slug: String,
    pub name: String,
    pub primary_region: String,
    pub data_retention_days: u32,
    pub created_at: DateTime<Utc>,
}

/// A tenant-scoped API key. Only the salted fingerprint persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// `<salt_hex>$<digest_hex>` fingerprint of the plaintext key.
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A site — a group of hosts under one tenant. `tenant_id` is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub external_key: String,
    pub location_country_code: String,
    pub connectivity_state: ConnectivityState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A single-use enrollment token. `consumed` flips false→true exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_agent_id: Option<Uuid>,
}

/// A managed host; one row per enrolled agent, keyed by `(site, hostname)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub hostname: String,
    pub cpu_cores_total: u32,
    pub memory_bytes_total: u64,
    pub storage_bytes_total: u64,
    pub kvm_available: bool,
    pub cloud_hypervisor_available: bool,
    pub last_facts_at: Option<DateTime<Utc>>,
    pub agent_state: AgentState,
}

/// An enrolled agent. `cert_serial` maps 1:1 to its currently valid cert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    /// Hex serial of the currently valid client certificate.
    pub cert_serial: String,
    pub refresh_token_hash: String,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub state: AgentState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A microVM tracked by the control plane.
///
/// `name` is the client-chosen VM key from plan actions, unique per site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroVm {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Option<Uuid>,
    pub name: String,
    pub state: VmState,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub updated_at: DateTime<Utc>,
}

/// An idempotently-submitted plan. Status is derived from its executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub client_request_id: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

/// One action's control-plane lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub plan_id: Uuid,
    /// Zero-based position within the plan; actions execute in this order.
    pub position: u32,
    /// Unique within the plan.
    pub operation_id: String,
    pub operation_type: OperationKind,
    /// The site-scoped VM key the action targets.
    pub vm_id: String,
    /// The full action payload, re-dispatched verbatim under a lease.
    pub spec: ActionSpec,
    pub timeout_seconds: Option<u64>,
    pub state: ExecutionState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// The host this execution is pinned to once first leased.
    pub assigned_host_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One log line for an execution. Unique by `(execution_id, sequence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogLine {
    pub execution_id: Uuid,
    pub sequence: u32,
    pub severity: LogSeverity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

/// One revoked certificate serial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
    pub agent_id: Uuid,
}
