//! Store abstraction for nkudo.
//!
//! This crate defines the [`Store`] trait — the transactional repository
//! both control-plane processes write through. Each trait method is one
//! atomic unit: callers never compose multi-step invariants out of separate
//! calls, so the backends can guarantee them with a single SQL transaction
//! ([`PostgresStore`], feature `postgres-backend`) or a single write lock
//! ([`MemoryStore`], always available, used by every test suite).
//!
//! The operations that carry the system's hard invariants are:
//!
//! - [`Store::enroll_agent`] — token validation + consumption + host upsert
//!   + agent insert, all or nothing.
//! - [`Store::apply_plan`] — `(tenant, site, idempotency_key)` dedup that
//!   either returns the original plan byte-identically or inserts the plan
//!   and all of its executions.
//! - [`Store::lease_executions`] — FIFO lease grant pinned to one host.
//! - [`Store::apply_execution_update`] — terminal-state transition plus the
//!   VM-state effect it drives, with terminal immutability.
//! - [`Store::append_audit`] — hash-chain linkage under the chain head.

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres-backend")]
mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::{
    Agent, ApiKey, CrlEntry, EnrollmentToken, Execution, ExecutionLogLine, Host, MicroVm, Plan,
    Site, Tenant,
};
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use nkudo_types::audit::{ActorType, AuditEvent};
use nkudo_types::plan::PlanAction;
use nkudo_types::state::{AgentState, ExecutionState, VmState};
use nkudo_types::wire::{ExecutionUpdate, HostFacts, LogFrame, ReportedVm};

/// Parameters for creating a tenant.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub slug: String,
    pub name: String,
    pub primary_region: String,
    pub data_retention_days: u32,
}

/// Parameters for creating an API key. The fingerprint is precomputed by
/// the caller; the plaintext never reaches the store.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a site.
#[derive(Debug, Clone)]
pub struct NewSite {
    pub tenant_id: Uuid,
    pub name: String,
    pub external_key: String,
    pub location_country_code: String,
}

/// Parameters for issuing an enrollment token.
#[derive(Debug, Clone)]
pub struct NewEnrollmentToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything [`Store::enroll_agent`] needs to redeem a token and create
/// the agent identity in one transaction.
#[derive(Debug, Clone)]
pub struct EnrollAgent {
    /// Token id parsed out of the presented bearer token.
    pub token_id: Uuid,
    /// The full plaintext token, verified against the stored fingerprint
    /// inside the transaction.
    pub token_plaintext: String,
    /// Server-chosen id for the new agent (already encoded in the cert).
    pub agent_id: Uuid,
    pub cert_serial: String,
    pub refresh_token_hash: String,
    pub facts: HostFacts,
    pub now: DateTime<Utc>,
}

/// Result of a successful enrollment transaction.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host: Host,
    pub agent: Agent,
}

/// A validated plan submission. `operation_id` uniqueness has already been
/// checked by the caller; the store enforces idempotency-key dedup.
#[derive(Debug, Clone)]
pub struct PlanSubmission {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub client_request_id: Option<String>,
    pub actions: Vec<PlanAction>,
    pub now: DateTime<Utc>,
}

/// Result of [`Store::apply_plan`].
#[derive(Debug, Clone)]
pub struct PlanApplyOutcome {
    pub plan: Plan,
    pub executions: Vec<Execution>,
    /// True when an existing plan was returned instead of a new insert.
    pub deduplicated: bool,
}

/// Result of applying one execution update.
#[derive(Debug, Clone)]
pub struct ExecutionUpdateOutcome {
    /// False when the execution was already terminal and the update was
    /// discarded.
    pub applied: bool,
    pub execution: Execution,
    /// The VM state the update drove, when the operation has one.
    pub vm_state: Option<VmState>,
}

/// Result of one heartbeat ingest transaction.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub host: Host,
    /// True when the agent was OFFLINE and this heartbeat restored it.
    pub agent_restored: bool,
    /// True when the site transitioned to ONLINE.
    pub site_restored: bool,
}

/// Result of one offline sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub agents_marked: Vec<Uuid>,
    pub sites_marked: Vec<Uuid>,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Restrict to these states; `None` means all.
    pub states: Option<Vec<ExecutionState>>,
    pub limit: Option<usize>,
}

/// An audit event before chain linkage. The store assigns `prev_hash` and
/// `entry_hash` under the chain head.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub tenant_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_id: Uuid,
    pub source_ip: Option<String>,
    pub metadata: serde_json::Value,
}

/// The transactional repository both backends implement.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Tenants ──────────────────────────────────────────────────────

    /// Create a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the slug is taken.
    async fn create_tenant(&self, new: NewTenant) -> Result<Tenant, StoreError>;

    /// Fetch a tenant by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, StoreError>;

    // ── API keys ─────────────────────────────────────────────────────

    /// Persist a new API key fingerprint.
    async fn create_api_key(&self, new: NewApiKey) -> Result<ApiKey, StoreError>;

    /// List a tenant's API keys.
    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError>;

    /// Fetch an API key by id, if present. Absence is a normal outcome
    /// during authentication, not an error.
    async fn find_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>, StoreError>;

    /// Hard-delete an API key (revocation).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not belong to the
    /// tenant or does not exist.
    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError>;

    /// Advance a key's `last_used_at`.
    async fn touch_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Sites ────────────────────────────────────────────────────────

    /// Create a site under a tenant.
    async fn create_site(&self, new: NewSite) -> Result<Site, StoreError>;

    /// List a tenant's sites.
    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError>;

    /// Fetch a site by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    async fn get_site(&self, site_id: Uuid) -> Result<Site, StoreError>;

    // ── Enrollment tokens ────────────────────────────────────────────

    /// Persist a new enrollment token fingerprint.
    async fn create_enrollment_token(
        &self,
        new: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, StoreError>;

    /// Token issuance history for a tenant.
    async fn list_enrollment_tokens(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<EnrollmentToken>, StoreError>;

    /// Redeem a token and create the agent identity, atomically.
    ///
    /// Validates the token (fingerprint, expiry, consumed flag), marks it
    /// consumed, upserts the `Host` row by `(site_id, hostname)`, and
    /// inserts the `Agent` row. Any failure rolls the whole thing back —
    /// a consumed token with no agent row cannot be observed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TokenInvalid`] — unknown id or fingerprint mismatch.
    /// - [`StoreError::TokenExpired`] — `now >= expires_at`.
    /// - [`StoreError::TokenAlreadyUsed`] — consumed flag already set.
    async fn enroll_agent(&self, enroll: EnrollAgent) -> Result<EnrollOutcome, StoreError>;

    // ── Hosts ────────────────────────────────────────────────────────

    /// Inventory of a site's hosts.
    async fn list_hosts(&self, site_id: Uuid) -> Result<Vec<Host>, StoreError>;

    // ── Agents ───────────────────────────────────────────────────────

    /// Fetch an agent by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError>;

    /// Set an agent's lifecycle state (used by unenrollment).
    async fn set_agent_state(&self, agent_id: Uuid, state: AgentState) -> Result<(), StoreError>;

    /// Record a rotated certificate serial for an agent.
    async fn update_agent_cert(&self, agent_id: Uuid, serial: &str) -> Result<(), StoreError>;

    // ── MicroVMs ─────────────────────────────────────────────────────

    /// VM inventory for a site.
    async fn list_vms(&self, site_id: Uuid) -> Result<Vec<MicroVm>, StoreError>;

    /// Fetch a VM by its site-scoped key, if tracked.
    async fn find_vm(&self, site_id: Uuid, name: &str) -> Result<Option<MicroVm>, StoreError>;

    // ── Plans & executions ───────────────────────────────────────────

    /// Create a plan with one execution per action, or return the existing
    /// plan for the same `(tenant, site, idempotency_key)`.
    async fn apply_plan(&self, submission: PlanSubmission) -> Result<PlanApplyOutcome, StoreError>;

    /// Fetch a plan.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, StoreError>;

    /// A plan's executions in creation order.
    async fn get_plan_executions(&self, plan_id: Uuid) -> Result<Vec<Execution>, StoreError>;

    /// Executions for a site, filtered and newest-last.
    async fn list_executions(
        &self,
        site_id: Uuid,
        filter: ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Fetch an execution by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError>;

    /// Lease up to `limit` dispatchable executions to a host.
    ///
    /// Selects executions in the site that are `PENDING`, or `IN_PROGRESS`
    /// with an expired lease and already pinned to this host, FIFO by
    /// `created_at` (ties by execution id). Each selected execution is
    /// transitioned to `IN_PROGRESS`, pinned to the host, and stamped with
    /// `lease_expires_at = now + lease_ttl`.
    async fn lease_executions(
        &self,
        site_id: Uuid,
        host_id: Uuid,
        limit: usize,
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Apply one terminal execution update reported by an agent.
    ///
    /// Validates the execution belongs to `site_id`, discards updates for
    /// already-terminal executions (`applied = false`), and on a SUCCEEDED
    /// outcome drives the targeted VM row to the operation's settled state
    /// in the same transaction. A DELETE settling on an untracked VM is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] — unknown execution or wrong site.
    /// - [`StoreError::Invalid`] — non-terminal update state.
    async fn apply_execution_update(
        &self,
        site_id: Uuid,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<ExecutionUpdateOutcome, StoreError>;

    /// Append log frames, ignoring `(execution_id, sequence)` duplicates.
    /// Returns how many frames were newly appended.
    async fn append_log_frames(&self, frames: Vec<LogFrame>) -> Result<usize, StoreError>;

    /// An execution's log lines ordered by sequence.
    async fn list_log_frames(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogLine>, StoreError>;

    // ── Heartbeats & offline detection ───────────────────────────────

    /// Ingest one heartbeat: upsert host facts, reconcile reported VM
    /// states (RUNNING/STOPPED/PAUSED are trusted; untracked VMs are not
    /// adopted; tracked-but-unreported VMs are not deleted), advance
    /// `last_heartbeat_at` on agent and site, and restore OFFLINE → ONLINE.
    async fn record_heartbeat(
        &self,
        agent_id: Uuid,
        facts: HostFacts,
        reported: Vec<ReportedVm>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, StoreError>;

    /// Mark agents and sites whose `last_heartbeat_at` is older than
    /// `stale_before` as OFFLINE. Returns what was transitioned.
    async fn sweep_offline(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome, StoreError>;

    // ── Audit chain ──────────────────────────────────────────────────

    /// Append an audit event, linking and hashing it under the chain head.
    async fn append_audit(&self, new: NewAuditEvent) -> Result<AuditEvent, StoreError>;

    /// The audit chain in append order, optionally truncated.
    async fn list_audit(&self, limit: Option<usize>) -> Result<Vec<AuditEvent>, StoreError>;

    // ── CRL ──────────────────────────────────────────────────────────

    /// Persist a revocation. Idempotent on serial.
    async fn add_crl_entry(&self, entry: CrlEntry) -> Result<(), StoreError>;

    /// All persisted revocations.
    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, StoreError>;
}
