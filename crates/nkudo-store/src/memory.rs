//! In-memory store backend.
//!
//! All state lives in `BTreeMap`s behind one `RwLock`; every mutating
//! operation takes the write lock for its whole body, which is what makes
//! each repository call atomic. Not persistent — this backend exists for
//! tests and for single-process development, exactly like the durable
//! backend but without the round trip.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use nkudo_types::audit::{self, AuditEvent};
use nkudo_types::fingerprint;
use nkudo_types::state::{AgentState, ConnectivityState, ExecutionState, OperationKind, VmState};
use nkudo_types::wire::{ExecutionUpdate, HostFacts, LogFrame, ReportedVm};

use crate::error::StoreError;
use crate::model::{
    Agent, ApiKey, CrlEntry, EnrollmentToken, Execution, ExecutionLogLine, Host, MicroVm, Plan,
    Site, Tenant,
};
use crate::{
    EnrollAgent, EnrollOutcome, ExecutionFilter, ExecutionUpdateOutcome, HeartbeatOutcome,
    NewApiKey, NewAuditEvent, NewEnrollmentToken, NewSite, NewTenant, PlanApplyOutcome,
    PlanSubmission, Store, SweepOutcome,
};

#[derive(Default)]
struct Inner {
    tenants: BTreeMap<Uuid, Tenant>,
    api_keys: BTreeMap<Uuid, ApiKey>,
    sites: BTreeMap<Uuid, Site>,
    tokens: BTreeMap<Uuid, EnrollmentToken>,
    hosts: BTreeMap<Uuid, Host>,
    agents: BTreeMap<Uuid, Agent>,
    vms: BTreeMap<Uuid, MicroVm>,
    plans: BTreeMap<Uuid, Plan>,
    executions: BTreeMap<Uuid, Execution>,
    logs: BTreeMap<(Uuid, u32), ExecutionLogLine>,
    audit: Vec<AuditEvent>,
    crl: BTreeMap<String, CrlEntry>,
}

/// The in-memory [`Store`] implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

/// Sort key for dispatch ordering: FIFO by creation, then in-plan position,
/// then execution id as the final tie-break.
fn dispatch_key(e: &Execution) -> (DateTime<Utc>, u32, Uuid) {
    (e.created_at, e.position, e.id)
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_tenant(&self, new: NewTenant) -> Result<Tenant, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tenants.values().any(|t| t.slug == new.slug) {
            return Err(StoreError::Conflict {
                reason: format!("tenant slug '{}' already exists", new.slug),
            });
        }
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: new.slug,
            name: new.name,
            primary_region: new.primary_region,
            data_retention_days: new.data_retention_days,
            created_at: Utc::now(),
        };
        inner.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, StoreError> {
        let inner = self.inner.read().await;
        inner
            .tenants
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tenant"))
    }

    async fn create_api_key(&self, new: NewApiKey) -> Result<ApiKey, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tenants.contains_key(&new.tenant_id) {
            return Err(StoreError::not_found("tenant"));
        }
        let key = ApiKey {
            id: new.id,
            tenant_id: new.tenant_id,
            name: new.name,
            key_hash: new.key_hash,
            created_at: Utc::now(),
            expires_at: new.expires_at,
            last_used_at: None,
        };
        inner.api_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .api_keys
            .values()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.api_keys.get(&key_id).cloned())
    }

    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.api_keys.get(&key_id) {
            Some(key) if key.tenant_id == tenant_id => {
                inner.api_keys.remove(&key_id);
                Ok(())
            }
            _ => Err(StoreError::not_found("api key")),
        }
    }

    async fn touch_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.api_keys.get_mut(&key_id) {
            key.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn create_site(&self, new: NewSite) -> Result<Site, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tenants.contains_key(&new.tenant_id) {
            return Err(StoreError::not_found("tenant"));
        }
        let site = Site {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            name: new.name,
            external_key: new.external_key,
            location_country_code: new.location_country_code,
            connectivity_state: ConnectivityState::Unknown,
            last_heartbeat_at: None,
        };
        inner.sites.insert(site.id, site.clone());
        Ok(site)
    }

    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sites
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn get_site(&self, site_id: Uuid) -> Result<Site, StoreError> {
        let inner = self.inner.read().await;
        inner
            .sites
            .get(&site_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("site"))
    }

    async fn create_enrollment_token(
        &self,
        new: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(site) = inner.sites.get(&new.site_id) else {
            return Err(StoreError::not_found("site"));
        };
        if site.tenant_id != new.tenant_id {
            return Err(StoreError::not_found("site"));
        }
        let token = EnrollmentToken {
            id: new.id,
            tenant_id: new.tenant_id,
            site_id: new.site_id,
            token_hash: new.token_hash,
            expires_at: new.expires_at,
            consumed: false,
            consumed_at: None,
            consumed_by_agent_id: None,
        };
        inner.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn list_enrollment_tokens(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<EnrollmentToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn enroll_agent(&self, enroll: EnrollAgent) -> Result<EnrollOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        let Some(token) = inner.tokens.get(&enroll.token_id) else {
            return Err(StoreError::TokenInvalid);
        };
        if !fingerprint::verify_secret(&enroll.token_plaintext, &token.token_hash) {
            return Err(StoreError::TokenInvalid);
        }
        if token.consumed {
            return Err(StoreError::TokenAlreadyUsed);
        }
        if enroll.now >= token.expires_at {
            return Err(StoreError::TokenExpired);
        }
        let (tenant_id, site_id, token_id) = (token.tenant_id, token.site_id, token.id);

        // Host upsert keyed by (site, hostname).
        let existing_host_id = inner
            .hosts
            .values()
            .find(|h| h.site_id == site_id && h.hostname == enroll.facts.hostname)
            .map(|h| h.id);
        let host_id = existing_host_id.unwrap_or_else(Uuid::new_v4);
        let host = Host {
            id: host_id,
            tenant_id,
            site_id,
            hostname: enroll.facts.hostname.clone(),
            cpu_cores_total: enroll.facts.cpu_cores_total,
            memory_bytes_total: enroll.facts.memory_bytes_total,
            storage_bytes_total: enroll.facts.storage_bytes_total,
            kvm_available: enroll.facts.kvm_available,
            cloud_hypervisor_available: enroll.facts.cloud_hypervisor_available,
            last_facts_at: Some(enroll.now),
            agent_state: AgentState::Online,
        };
        inner.hosts.insert(host_id, host.clone());

        let agent = Agent {
            id: enroll.agent_id,
            tenant_id,
            site_id,
            host_id,
            cert_serial: enroll.cert_serial,
            refresh_token_hash: enroll.refresh_token_hash,
            agent_version: enroll.facts.agent_version,
            os: enroll.facts.os,
            arch: enroll.facts.arch,
            kernel_version: enroll.facts.kernel_version,
            state: AgentState::Online,
            last_heartbeat_at: None,
        };
        inner.agents.insert(agent.id, agent.clone());

        if let Some(token) = inner.tokens.get_mut(&token_id) {
            token.consumed = true;
            token.consumed_at = Some(enroll.now);
            token.consumed_by_agent_id = Some(agent.id);
        }

        Ok(EnrollOutcome {
            tenant_id,
            site_id,
            host,
            agent,
        })
    }

    async fn list_hosts(&self, site_id: Uuid) -> Result<Vec<Host>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .hosts
            .values()
            .filter(|h| h.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("agent"))
    }

    async fn set_agent_state(&self, agent_id: Uuid, state: AgentState) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let host_id = {
            let Some(agent) = inner.agents.get_mut(&agent_id) else {
                return Err(StoreError::not_found("agent"));
            };
            agent.state = state;
            agent.host_id
        };
        if let Some(host) = inner.hosts.get_mut(&host_id) {
            host.agent_state = state;
        }
        Ok(())
    }

    async fn update_agent_cert(&self, agent_id: Uuid, serial: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Some(agent) = inner.agents.get_mut(&agent_id) else {
            return Err(StoreError::not_found("agent"));
        };
        agent.cert_serial = serial.to_owned();
        Ok(())
    }

    async fn list_vms(&self, site_id: Uuid) -> Result<Vec<MicroVm>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .vms
            .values()
            .filter(|v| v.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn find_vm(&self, site_id: Uuid, name: &str) -> Result<Option<MicroVm>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .vms
            .values()
            .find(|v| v.site_id == site_id && v.name == name)
            .cloned())
    }

    async fn apply_plan(&self, submission: PlanSubmission) -> Result<PlanApplyOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .plans
            .values()
            .find(|p| {
                p.tenant_id == submission.tenant_id
                    && p.site_id == submission.site_id
                    && p.idempotency_key == submission.idempotency_key
            })
            .cloned()
        {
            let mut executions: Vec<Execution> = inner
                .executions
                .values()
                .filter(|e| e.plan_id == existing.id)
                .cloned()
                .collect();
            executions.sort_by_key(|e| e.position);
            return Ok(PlanApplyOutcome {
                plan: existing,
                executions,
                deduplicated: true,
            });
        }

        let plan = Plan {
            id: Uuid::new_v4(),
            tenant_id: submission.tenant_id,
            site_id: submission.site_id,
            idempotency_key: submission.idempotency_key,
            client_request_id: submission.client_request_id,
            version: 1,
            created_at: submission.now,
        };
        let mut executions = Vec::with_capacity(submission.actions.len());
        for (position, action) in submission.actions.into_iter().enumerate() {
            let position = u32::try_from(position).map_err(|_| StoreError::Invalid {
                reason: "too many actions in plan".to_owned(),
            })?;
            let execution = Execution {
                id: Uuid::new_v4(),
                plan_id: plan.id,
                position,
                operation_id: action.operation_id,
                operation_type: action.spec.kind(),
                vm_id: action.vm_id,
                spec: action.spec,
                timeout_seconds: action.timeout_seconds,
                state: ExecutionState::Pending,
                error_code: None,
                error_message: None,
                assigned_host_id: None,
                lease_expires_at: None,
                created_at: submission.now,
                updated_at: submission.now,
            };
            inner.executions.insert(execution.id, execution.clone());
            executions.push(execution);
        }
        inner.plans.insert(plan.id, plan.clone());

        Ok(PlanApplyOutcome {
            plan,
            executions,
            deduplicated: false,
        })
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, StoreError> {
        let inner = self.inner.read().await;
        inner
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("plan"))
    }

    async fn get_plan_executions(&self, plan_id: Uuid) -> Result<Vec<Execution>, StoreError> {
        let inner = self.inner.read().await;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.position);
        Ok(executions)
    }

    async fn list_executions(
        &self,
        site_id: Uuid,
        filter: ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError> {
        let inner = self.inner.read().await;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| {
                inner
                    .plans
                    .get(&e.plan_id)
                    .is_some_and(|p| p.site_id == site_id)
            })
            .filter(|e| {
                filter
                    .states
                    .as_ref()
                    .is_none_or(|states| states.contains(&e.state))
            })
            .cloned()
            .collect();
        executions.sort_by_key(dispatch_key);
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        let inner = self.inner.read().await;
        inner
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("execution"))
    }

    async fn lease_executions(
        &self,
        site_id: Uuid,
        host_id: Uuid,
        limit: usize,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut inner = self.inner.write().await;

        let mut candidates: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| {
                inner
                    .plans
                    .get(&e.plan_id)
                    .is_some_and(|p| p.site_id == site_id)
            })
            .filter(|e| match e.state {
                ExecutionState::Pending => {
                    e.assigned_host_id.is_none() || e.assigned_host_id == Some(host_id)
                }
                ExecutionState::InProgress => {
                    // Expired leases re-dispatch to the same host only.
                    e.assigned_host_id == Some(host_id)
                        && e.lease_expires_at.is_some_and(|exp| exp <= now)
                }
                ExecutionState::Succeeded | ExecutionState::Failed => false,
            })
            .map(|e| e.id)
            .collect();

        candidates.sort_by_key(|id| {
            inner
                .executions
                .get(id)
                .map_or((now, 0, *id), dispatch_key)
        });
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(execution) = inner.executions.get_mut(&id) {
                execution.state = ExecutionState::InProgress;
                execution.assigned_host_id = Some(host_id);
                execution.lease_expires_at = Some(now + lease_ttl);
                execution.updated_at = now;
                leased.push(execution.clone());
            }
        }
        Ok(leased)
    }

    async fn apply_execution_update(
        &self,
        site_id: Uuid,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<ExecutionUpdateOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        let Some(execution) = inner.executions.get(&update.execution_id).cloned() else {
            return Err(StoreError::not_found("execution"));
        };
        let Some(plan) = inner.plans.get(&execution.plan_id).cloned() else {
            return Err(StoreError::not_found("plan"));
        };
        if plan.site_id != site_id {
            // Cross-site reporting: indistinguishable from absence.
            return Err(StoreError::not_found("execution"));
        }
        if !update.state.is_terminal() {
            return Err(StoreError::Invalid {
                reason: format!("execution update state must be terminal, got {:?}", update.state),
            });
        }
        if execution.state.is_terminal() {
            return Ok(ExecutionUpdateOutcome {
                applied: false,
                execution,
                vm_state: None,
            });
        }

        let mut vm_state = None;
        if update.state == ExecutionState::Succeeded {
            if let Some(settled) = execution.operation_type.state_after_success() {
                let existing = inner
                    .vms
                    .values()
                    .find(|v| v.site_id == site_id && v.name == execution.vm_id)
                    .map(|v| v.id);
                match (execution.operation_type, existing) {
                    (OperationKind::Create, None) => {
                        let (vcpu_count, memory_mib) = match &execution.spec {
                            nkudo_types::plan::ActionSpec::Create {
                                vcpu_count,
                                memory_mib,
                                ..
                            } => (*vcpu_count, *memory_mib),
                            _ => (0, 0),
                        };
                        let vm = MicroVm {
                            id: Uuid::new_v4(),
                            tenant_id: plan.tenant_id,
                            site_id,
                            host_id: execution.assigned_host_id,
                            name: execution.vm_id.clone(),
                            state: settled,
                            vcpu_count,
                            memory_mib,
                            updated_at: now,
                        };
                        inner.vms.insert(vm.id, vm);
                        vm_state = Some(settled);
                    }
                    (_, Some(vm_id)) => {
                        if let Some(vm) = inner.vms.get_mut(&vm_id) {
                            vm.state = settled;
                            vm.updated_at = now;
                            vm_state = Some(settled);
                        }
                    }
                    // DELETE (or any lifecycle op) on an untracked VM: no-op.
                    (_, None) => {}
                }
            }
        }

        let Some(execution) = inner.executions.get_mut(&update.execution_id) else {
            return Err(StoreError::not_found("execution"));
        };
        execution.state = update.state;
        execution.error_code = update.error_code;
        execution.error_message = update.error_message;
        execution.lease_expires_at = None;
        execution.updated_at = now;
        let execution = execution.clone();

        Ok(ExecutionUpdateOutcome {
            applied: true,
            execution,
            vm_state,
        })
    }

    async fn append_log_frames(&self, frames: Vec<LogFrame>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut appended = 0;
        for frame in frames {
            let key = (frame.execution_id, frame.sequence);
            if inner.logs.contains_key(&key) {
                continue;
            }
            inner.logs.insert(
                key,
                ExecutionLogLine {
                    execution_id: frame.execution_id,
                    sequence: frame.sequence,
                    severity: frame.severity,
                    message: frame.message,
                    emitted_at: frame.emitted_at,
                },
            );
            appended += 1;
        }
        Ok(appended)
    }

    async fn list_log_frames(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogLine>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .logs
            .range((execution_id, 0)..=(execution_id, u32::MAX))
            .map(|(_, line)| line.clone())
            .collect())
    }

    async fn record_heartbeat(
        &self,
        agent_id: Uuid,
        facts: HostFacts,
        reported: Vec<ReportedVm>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        let Some(agent) = inner.agents.get(&agent_id).cloned() else {
            return Err(StoreError::not_found("agent"));
        };
        if agent.state == AgentState::Unenrolled {
            return Err(StoreError::Invalid {
                reason: "agent is unenrolled".to_owned(),
            });
        }
        let agent_restored = agent.state == AgentState::Offline;

        if let Some(a) = inner.agents.get_mut(&agent_id) {
            a.state = AgentState::Online;
            a.last_heartbeat_at = Some(now);
            a.agent_version = facts.agent_version.clone();
            a.kernel_version = facts.kernel_version.clone();
        }

        let Some(host) = inner.hosts.get_mut(&agent.host_id) else {
            return Err(StoreError::not_found("host"));
        };
        host.cpu_cores_total = facts.cpu_cores_total;
        host.memory_bytes_total = facts.memory_bytes_total;
        host.storage_bytes_total = facts.storage_bytes_total;
        host.kvm_available = facts.kvm_available;
        host.cloud_hypervisor_available = facts.cloud_hypervisor_available;
        host.last_facts_at = Some(now);
        host.agent_state = AgentState::Online;
        let host = host.clone();

        // Trust the agent for steady states; transitional and terminal
        // states stay execution-driven. Untracked VMs are not adopted.
        for report in reported {
            if !matches!(
                report.state,
                VmState::Running | VmState::Stopped | VmState::Paused
            ) {
                continue;
            }
            let vm_id = inner
                .vms
                .values()
                .find(|v| v.site_id == agent.site_id && v.name == report.vm_id)
                .map(|v| v.id);
            if let Some(vm_id) = vm_id {
                if let Some(vm) = inner.vms.get_mut(&vm_id) {
                    if vm.state != report.state {
                        vm.state = report.state;
                        vm.updated_at = now;
                    }
                }
            }
        }

        let mut site_restored = false;
        if let Some(site) = inner.sites.get_mut(&agent.site_id) {
            site_restored = site.connectivity_state != ConnectivityState::Online;
            site.connectivity_state = ConnectivityState::Online;
            site.last_heartbeat_at = Some(now);
        }

        Ok(HeartbeatOutcome {
            host,
            agent_restored,
            site_restored,
        })
    }

    async fn sweep_offline(
        &self,
        stale_before: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<SweepOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let mut outcome = SweepOutcome::default();

        let stale_agents: Vec<(Uuid, Uuid)> = inner
            .agents
            .values()
            .filter(|a| {
                a.state == AgentState::Online
                    && a.last_heartbeat_at.is_none_or(|at| at < stale_before)
            })
            .map(|a| (a.id, a.host_id))
            .collect();
        for (agent_id, host_id) in stale_agents {
            if let Some(agent) = inner.agents.get_mut(&agent_id) {
                agent.state = AgentState::Offline;
            }
            if let Some(host) = inner.hosts.get_mut(&host_id) {
                host.agent_state = AgentState::Offline;
            }
            outcome.agents_marked.push(agent_id);
        }

        let stale_sites: Vec<Uuid> = inner
            .sites
            .values()
            .filter(|s| {
                s.connectivity_state == ConnectivityState::Online
                    && s.last_heartbeat_at.is_none_or(|at| at < stale_before)
            })
            .map(|s| s.id)
            .collect();
        for site_id in stale_sites {
            if let Some(site) = inner.sites.get_mut(&site_id) {
                site.connectivity_state = ConnectivityState::Offline;
            }
            outcome.sites_marked.push(site_id);
        }

        Ok(outcome)
    }

    async fn append_audit(&self, new: NewAuditEvent) -> Result<AuditEvent, StoreError> {
        let mut inner = self.inner.write().await;
        let prev_hash = inner
            .audit
            .last()
            .map_or_else(|| audit::CHAIN_GENESIS.to_owned(), |e| e.entry_hash.clone());
        let mut event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            tenant_id: new.tenant_id,
            site_id: new.site_id,
            actor_type: new.actor_type,
            actor_id: new.actor_id,
            action: new.action,
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            request_id: new.request_id,
            source_ip: new.source_ip,
            metadata: new.metadata,
            prev_hash,
            entry_hash: String::new(),
        };
        event.entry_hash = audit::compute_entry_hash(&event);
        inner.audit.push(event.clone());
        Ok(event)
    }

    async fn list_audit(&self, limit: Option<usize>) -> Result<Vec<AuditEvent>, StoreError> {
        let inner = self.inner.read().await;
        let events = match limit {
            Some(limit) => inner.audit.iter().take(limit).cloned().collect(),
            None => inner.audit.clone(),
        };
        Ok(events)
    }

    async fn add_crl_entry(&self, entry: CrlEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.crl.entry(entry.serial.clone()).or_insert(entry);
        Ok(())
    }

    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.crl.values().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nkudo_types::plan::{ActionSpec, PlanAction};

    fn facts(hostname: &str) -> HostFacts {
        HostFacts {
            hostname: hostname.to_owned(),
            cpu_cores_total: 8,
            memory_bytes_total: 16 << 30,
            storage_bytes_total: 500 << 30,
            kvm_available: true,
            cloud_hypervisor_available: true,
            agent_version: "0.3.0".to_owned(),
            os: "linux".to_owned(),
            arch: "x86_64".to_owned(),
            kernel_version: "6.8.0".to_owned(),
        }
    }

    async fn fixture(store: &MemoryStore) -> (Tenant, Site) {
        let tenant = store
            .create_tenant(NewTenant {
                slug: "acme".to_owned(),
                name: "Acme".to_owned(),
                primary_region: "eu-central".to_owned(),
                data_retention_days: 90,
            })
            .await
            .unwrap();
        let site = store
            .create_site(NewSite {
                tenant_id: tenant.id,
                name: "berlin".to_owned(),
                external_key: "ber-1".to_owned(),
                location_country_code: "DE".to_owned(),
            })
            .await
            .unwrap();
        (tenant, site)
    }

    async fn enrolled_agent(store: &MemoryStore, tenant: &Tenant, site: &Site) -> EnrollOutcome {
        let plaintext = fingerprint::generate_secret("nket_");
        let token = store
            .create_enrollment_token(NewEnrollmentToken {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                site_id: site.id,
                token_hash: fingerprint::hash_secret(&plaintext),
                expires_at: Utc::now() + Duration::seconds(900),
            })
            .await
            .unwrap();
        store
            .enroll_agent(EnrollAgent {
                token_id: token.id,
                token_plaintext: plaintext,
                agent_id: Uuid::new_v4(),
                cert_serial: "aa01".to_owned(),
                refresh_token_hash: fingerprint::hash_secret("nkrt_x"),
                facts: facts("edge-01"),
                now: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn create_action(operation_id: &str, vm_id: &str) -> PlanAction {
        PlanAction {
            operation_id: operation_id.to_owned(),
            vm_id: vm_id.to_owned(),
            timeout_seconds: None,
            spec: ActionSpec::Create {
                vcpu_count: 2,
                memory_mib: 512,
                kernel_image: None,
                rootfs_image: None,
            },
        }
    }

    fn start_action(operation_id: &str, vm_id: &str) -> PlanAction {
        PlanAction {
            operation_id: operation_id.to_owned(),
            vm_id: vm_id.to_owned(),
            timeout_seconds: None,
            spec: ActionSpec::Start {},
        }
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let store = MemoryStore::new();
        let _ = fixture(&store).await;
        let err = store
            .create_tenant(NewTenant {
                slug: "acme".to_owned(),
                name: "Other".to_owned(),
                primary_region: "us-east".to_owned(),
                data_retention_days: 30,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn enrollment_consumes_token_once() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let plaintext = fingerprint::generate_secret("nket_");
        let token = store
            .create_enrollment_token(NewEnrollmentToken {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                site_id: site.id,
                token_hash: fingerprint::hash_secret(&plaintext),
                expires_at: Utc::now() + Duration::seconds(900),
            })
            .await
            .unwrap();

        let enroll = |agent_id| EnrollAgent {
            token_id: token.id,
            token_plaintext: plaintext.clone(),
            agent_id,
            cert_serial: "aa01".to_owned(),
            refresh_token_hash: fingerprint::hash_secret("nkrt_x"),
            facts: facts("edge-01"),
            now: Utc::now(),
        };

        let outcome = store.enroll_agent(enroll(Uuid::new_v4())).await.unwrap();
        assert_eq!(outcome.site_id, site.id);

        let err = store.enroll_agent(enroll(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, StoreError::TokenAlreadyUsed));
    }

    #[tokio::test]
    async fn expired_token_rejected_and_not_consumed() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let plaintext = fingerprint::generate_secret("nket_");
        let token = store
            .create_enrollment_token(NewEnrollmentToken {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                site_id: site.id,
                token_hash: fingerprint::hash_secret(&plaintext),
                expires_at: Utc::now() - Duration::seconds(1),
            })
            .await
            .unwrap();

        let err = store
            .enroll_agent(EnrollAgent {
                token_id: token.id,
                token_plaintext: plaintext,
                agent_id: Uuid::new_v4(),
                cert_serial: "aa01".to_owned(),
                refresh_token_hash: fingerprint::hash_secret("nkrt_x"),
                facts: facts("edge-01"),
                now: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TokenExpired));

        let tokens = store.list_enrollment_tokens(tenant.id).await.unwrap();
        assert!(!tokens[0].consumed, "failed redemption must not consume");
        assert!(store.list_hosts(site.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_token_secret_is_invalid() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let token = store
            .create_enrollment_token(NewEnrollmentToken {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                site_id: site.id,
                token_hash: fingerprint::hash_secret("nket_right"),
                expires_at: Utc::now() + Duration::seconds(900),
            })
            .await
            .unwrap();
        let err = store
            .enroll_agent(EnrollAgent {
                token_id: token.id,
                token_plaintext: "nket_wrong".to_owned(),
                agent_id: Uuid::new_v4(),
                cert_serial: "aa01".to_owned(),
                refresh_token_hash: fingerprint::hash_secret("nkrt_x"),
                facts: facts("edge-01"),
                now: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TokenInvalid));
    }

    #[tokio::test]
    async fn re_enrollment_reuses_host_row() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let first = enrolled_agent(&store, &tenant, &site).await;
        let second = enrolled_agent(&store, &tenant, &site).await;
        assert_eq!(first.host.id, second.host.id);
        assert_eq!(store.list_hosts(site.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plan_idempotency_returns_original() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let submit = || PlanSubmission {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "plan-1".to_owned(),
            client_request_id: None,
            actions: vec![create_action("a", "vm1"), start_action("b", "vm1")],
            now: Utc::now(),
        };

        let first = store.apply_plan(submit()).await.unwrap();
        assert!(!first.deduplicated);
        assert_eq!(first.executions.len(), 2);

        let second = store.apply_plan(submit()).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.plan.id, first.plan.id);
        let first_ids: Vec<Uuid> = first.executions.iter().map(|e| e.id).collect();
        let second_ids: Vec<Uuid> = second.executions.iter().map(|e| e.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn lease_is_fifo_and_in_plan_order() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        let outcome = store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1"), start_action("b", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();

        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].operation_id, "a");
        assert_eq!(leased[1].operation_id, "b");
        assert!(leased.iter().all(|e| e.state == ExecutionState::InProgress));
        assert!(leased.iter().all(|e| e.lease_expires_at.is_some()));
        let _ = outcome;

        // Second lease call: nothing dispatchable while leases are live.
        let again = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_redispatches_to_same_host_only() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();

        let t0 = Utc::now();
        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(10), t0)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let after_expiry = t0 + Duration::seconds(30);
        let other_host = Uuid::new_v4();
        let stolen = store
            .lease_executions(site.id, other_host, 10, Duration::seconds(10), after_expiry)
            .await
            .unwrap();
        assert!(stolen.is_empty(), "expired lease must not move hosts");

        let renewed = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(10), after_expiry)
            .await
            .unwrap();
        assert_eq!(renewed.len(), 1);
        assert_eq!(renewed[0].id, leased[0].id);
    }

    #[tokio::test]
    async fn succeeded_create_then_start_drives_vm_state() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        let outcome = store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1"), start_action("b", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();
        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();

        for execution in &leased {
            let applied = store
                .apply_execution_update(
                    site.id,
                    ExecutionUpdate {
                        execution_id: execution.id,
                        state: ExecutionState::Succeeded,
                        error_code: None,
                        error_message: None,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
            assert!(applied.applied);
        }

        let vm = store.find_vm(site.id, "vm1").await.unwrap().unwrap();
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.vcpu_count, 2);
        let _ = outcome;
    }

    #[tokio::test]
    async fn terminal_execution_discards_later_updates() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();
        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();
        let execution_id = leased[0].id;

        let first = store
            .apply_execution_update(
                site.id,
                ExecutionUpdate {
                    execution_id,
                    state: ExecutionState::Failed,
                    error_code: Some("PROVIDER_ERROR".to_owned()),
                    error_message: Some("boom".to_owned()),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(first.applied);

        let second = store
            .apply_execution_update(
                site.id,
                ExecutionUpdate {
                    execution_id,
                    state: ExecutionState::Succeeded,
                    error_code: None,
                    error_message: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!second.applied, "terminal states are immutable");
        assert_eq!(second.execution.state, ExecutionState::Failed);
    }

    #[tokio::test]
    async fn cross_site_update_is_not_found() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;
        store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();
        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();

        let err = store
            .apply_execution_update(
                Uuid::new_v4(),
                ExecutionUpdate {
                    execution_id: leased[0].id,
                    state: ExecutionState::Succeeded,
                    error_code: None,
                    error_message: None,
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn heartbeat_restores_offline_agent_and_site() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        // Age the agent out.
        let swept = store
            .sweep_offline(Utc::now() + Duration::seconds(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(swept.agents_marked, vec![enrolled.agent.id]);

        let outcome = store
            .record_heartbeat(enrolled.agent.id, facts("edge-01"), vec![], Utc::now())
            .await
            .unwrap();
        assert!(outcome.agent_restored);
        assert!(outcome.site_restored);

        let agent = store.get_agent(enrolled.agent.id).await.unwrap();
        assert_eq!(agent.state, AgentState::Online);
        let site = store.get_site(site.id).await.unwrap();
        assert_eq!(site.connectivity_state, ConnectivityState::Online);
    }

    #[tokio::test]
    async fn sweep_skips_fresh_agents() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;
        store
            .record_heartbeat(enrolled.agent.id, facts("edge-01"), vec![], Utc::now())
            .await
            .unwrap();

        let swept = store
            .sweep_offline(Utc::now() - Duration::seconds(120), Utc::now())
            .await
            .unwrap();
        assert!(swept.agents_marked.is_empty());
        assert!(swept.sites_marked.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_reconciles_only_trusted_states() {
        let store = MemoryStore::new();
        let (tenant, site) = fixture(&store).await;
        let enrolled = enrolled_agent(&store, &tenant, &site).await;

        store
            .apply_plan(PlanSubmission {
                tenant_id: tenant.id,
                site_id: site.id,
                idempotency_key: "plan-1".to_owned(),
                client_request_id: None,
                actions: vec![create_action("a", "vm1")],
                now: Utc::now(),
            })
            .await
            .unwrap();
        let leased = store
            .lease_executions(site.id, enrolled.host.id, 10, Duration::seconds(300), Utc::now())
            .await
            .unwrap();
        store
            .apply_execution_update(
                site.id,
                ExecutionUpdate {
                    execution_id: leased[0].id,
                    state: ExecutionState::Succeeded,
                    error_code: None,
                    error_message: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        store
            .record_heartbeat(
                enrolled.agent.id,
                facts("edge-01"),
                vec![
                    ReportedVm {
                        vm_id: "vm1".to_owned(),
                        state: VmState::Running,
                    },
                    ReportedVm {
                        vm_id: "vm1".to_owned(),
                        state: VmState::Deleting,
                    },
                    ReportedVm {
                        vm_id: "ghost".to_owned(),
                        state: VmState::Running,
                    },
                ],
                Utc::now(),
            )
            .await
            .unwrap();

        let vm = store.find_vm(site.id, "vm1").await.unwrap().unwrap();
        assert_eq!(vm.state, VmState::Running, "DELETING report is ignored");
        assert!(
            store.find_vm(site.id, "ghost").await.unwrap().is_none(),
            "untracked VMs are not adopted"
        );
    }

    #[tokio::test]
    async fn audit_chain_links_and_verifies() {
        let store = MemoryStore::new();
        for i in 0..4 {
            store
                .append_audit(NewAuditEvent {
                    tenant_id: None,
                    site_id: None,
                    actor_type: nkudo_types::audit::ActorType::System,
                    actor_id: "system".to_owned(),
                    action: format!("test.{i}"),
                    resource_type: "test".to_owned(),
                    resource_id: i.to_string(),
                    request_id: Uuid::new_v4(),
                    source_ip: None,
                    metadata: serde_json::Value::Null,
                })
                .await
                .unwrap();
        }
        let events = store.list_audit(None).await.unwrap();
        assert_eq!(events.len(), 4);
        assert!(audit::verify_chain(&events).is_ok());
    }

    #[tokio::test]
    async fn log_frames_deduplicate_by_sequence() {
        let store = MemoryStore::new();
        let execution_id = Uuid::new_v4();
        let frame = |sequence| LogFrame {
            execution_id,
            sequence,
            severity: nkudo_types::wire::LogSeverity::Info,
            message: format!("line {sequence}"),
            emitted_at: Utc::now(),
        };
        let appended = store
            .append_log_frames(vec![frame(0), frame(1), frame(0)])
            .await
            .unwrap();
        assert_eq!(appended, 2);
        let lines = store.list_log_frames(execution_id).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].sequence, 0);
        assert_eq!(lines[1].sequence, 1);
    }

    #[tokio::test]
    async fn crl_entries_are_idempotent_on_serial() {
        let store = MemoryStore::new();
        let entry = CrlEntry {
            serial: "aa01".to_owned(),
            revoked_at: Utc::now(),
            reason: "unenrolled".to_owned(),
            agent_id: Uuid::new_v4(),
        };
        store.add_crl_entry(entry.clone()).await.unwrap();
        store.add_crl_entry(entry).await.unwrap();
        assert_eq!(store.list_crl_entries().await.unwrap().len(), 1);
    }
}
