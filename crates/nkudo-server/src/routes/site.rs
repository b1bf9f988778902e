//! Site-scoped tenant surface: plans, inventory, executions, logs.
//!
//! Site resolution deliberately renders cross-tenant access as 404 — a
//! probing tenant cannot distinguish "not yours" from "does not exist".

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_store::{Execution, ExecutionFilter, Site};
use nkudo_types::plan::ApplyPlanRequest;
use nkudo_types::state::{AgentState, ExecutionState, OperationKind, PlanStatus, VmState};
use nkudo_types::wire::LogSeverity;

use crate::error::{ApiError, ApiResult};
use crate::middleware::{Caller, RequestId, source_ip};
use crate::routes::parse_body;
use crate::services::dispatch;
use crate::state::AppState;

/// Resolve a site and enforce the caller's tenant scope (404 on
/// cross-tenant access).
async fn resolve_site(state: &AppState, caller: &Caller, site_id: Uuid) -> ApiResult<Site> {
    let site = state.store.get_site(site_id).await?;
    match caller {
        Caller::Admin => Ok(site),
        Caller::Tenant { tenant_id, .. } if *tenant_id == site.tenant_id => Ok(site),
        Caller::Tenant { .. } => Err(ApiError::from(nkudo_store::StoreError::not_found("site"))),
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionView {
    pub execution_id: Uuid,
    pub operation_id: String,
    pub operation: OperationKind,
    pub vm_id: String,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Execution> for ExecutionView {
    fn from(e: &Execution) -> Self {
        Self {
            execution_id: e.id,
            operation_id: e.operation_id.clone(),
            operation: e.operation_type,
            vm_id: e.vm_id.clone(),
            state: e.state,
            error_code: e.error_code.clone(),
            error_message: e.error_message.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub deduplicated: bool,
    pub executions: Vec<ExecutionView>,
}

/// `POST /sites/{id}/plans`
pub async fn apply_plan(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(site_id): Path<Uuid>,
    request: axum::extract::Request,
) -> ApiResult<(StatusCode, Json<PlanResponse>)> {
    let site = resolve_site(&state, &caller, site_id).await?;
    let ip = source_ip(&request);
    let body = axum::body::to_bytes(request.into_body(), 1 << 20)
        .await
        .map_err(|e| ApiError::invalid(format!("unreadable body: {e}")))?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(format!("invalid JSON: {e}")))?;
    let plan_request: ApplyPlanRequest = parse_body(value)?;

    let outcome = dispatch::apply_plan(
        &state,
        &caller,
        site.tenant_id,
        site.id,
        plan_request,
        request_id,
        ip,
    )
    .await?;

    let status = dispatch::plan_status(&outcome.executions);
    let response = PlanResponse {
        plan_id: outcome.plan.id,
        status,
        deduplicated: outcome.deduplicated,
        executions: outcome.executions.iter().map(ExecutionView::from).collect(),
    };
    let code = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: Uuid,
    pub hostname: String,
    pub cpu_cores_total: u32,
    pub memory_bytes_total: u64,
    pub storage_bytes_total: u64,
    pub kvm_available: bool,
    pub cloud_hypervisor_available: bool,
    pub agent_state: AgentState,
    pub last_facts_at: Option<DateTime<Utc>>,
}

/// `GET /sites/{id}/hosts`
pub async fn list_hosts(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(site_id): Path<Uuid>,
) -> ApiResult<Json<Vec<HostView>>> {
    let site = resolve_site(&state, &caller, site_id).await?;
    let hosts = state.store.list_hosts(site.id).await?;
    Ok(Json(
        hosts
            .into_iter()
            .map(|h| HostView {
                id: h.id,
                hostname: h.hostname,
                cpu_cores_total: h.cpu_cores_total,
                memory_bytes_total: h.memory_bytes_total,
                storage_bytes_total: h.storage_bytes_total,
                kvm_available: h.kvm_available,
                cloud_hypervisor_available: h.cloud_hypervisor_available,
                agent_state: h.agent_state,
                last_facts_at: h.last_facts_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct VmView {
    pub id: Uuid,
    pub vm_id: String,
    pub state: VmState,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub updated_at: DateTime<Utc>,
}

/// `GET /sites/{id}/vms`
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(site_id): Path<Uuid>,
) -> ApiResult<Json<Vec<VmView>>> {
    let site = resolve_site(&state, &caller, site_id).await?;
    let vms = state.store.list_vms(site.id).await?;
    Ok(Json(
        vms.into_iter()
            .map(|v| VmView {
                id: v.id,
                vm_id: v.name,
                state: v.state,
                vcpu_count: v.vcpu_count,
                memory_mib: v.memory_mib,
                updated_at: v.updated_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    /// Comma-separated execution states.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn parse_states(csv: &str) -> ApiResult<Vec<ExecutionState>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.to_owned()))
                .map_err(|_| ApiError::invalid(format!("unknown execution status '{s}'")))
        })
        .collect()
}

/// `GET /sites/{id}/executions`
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(site_id): Path<Uuid>,
    Query(query): Query<ExecutionsQuery>,
) -> ApiResult<Json<Vec<ExecutionView>>> {
    let site = resolve_site(&state, &caller, site_id).await?;
    let states = query.status.as_deref().map(parse_states).transpose()?;
    let executions = state
        .store
        .list_executions(
            site.id,
            ExecutionFilter {
                states,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(executions.iter().map(ExecutionView::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct LogLineView {
    pub sequence: u32,
    pub severity: LogSeverity,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

/// `GET /executions/{id}/logs`
pub async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogLineView>>> {
    let execution = state.store.get_execution(execution_id).await?;
    let plan = state.store.get_plan(execution.plan_id).await?;
    // Same 404-on-cross-tenant policy as site resolution.
    resolve_site(&state, &caller, plan.site_id)
        .await
        .map_err(|_| ApiError::from(nkudo_store::StoreError::not_found("execution")))?;

    let lines = state.store.list_log_frames(execution_id).await?;
    Ok(Json(
        lines
            .into_iter()
            .map(|l| LogLineView {
                sequence: l.sequence,
                severity: l.severity,
                message: l.message,
                emitted_at: l.emitted_at,
            })
            .collect(),
    ))
}
