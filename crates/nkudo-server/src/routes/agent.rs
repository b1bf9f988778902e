//! Agent surface: enrollment, renewal, heartbeats, dispatch, results, logs.
//!
//! Enrollment is authenticated by the single-use token in the body;
//! everything else sits behind the client-certificate middleware.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use nkudo_types::wire::{
    EnrollRequest, EnrollResponse, ExecutionResultRequest, Heartbeat, HeartbeatResponse, LogBatch,
    RenewRequest, RenewResponse,
};

use crate::error::{ApiError, ApiResult};
use crate::middleware::{AgentIdentity, RequestId, source_ip};
use crate::routes::parse_body;
use crate::services::{dispatch, enrollment, heartbeat};
use crate::state::AppState;

/// `POST /enroll` and `POST /v1/enroll`
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    request: axum::extract::Request,
) -> ApiResult<Json<EnrollResponse>> {
    let ip = source_ip(&request);
    let limiter_key = ip.clone().unwrap_or_else(|| "unknown".to_owned());
    if let Err(wait) = state.enroll_limiter.check(&limiter_key) {
        return Err(ApiError::rate_limited(wait).with_request_id(request_id));
    }

    let body = axum::body::to_bytes(request.into_body(), 1 << 20)
        .await
        .map_err(|e| ApiError::invalid(format!("unreadable body: {e}")))?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid(format!("invalid JSON: {e}")))?;
    let enroll_request: EnrollRequest = parse_body(value)?;

    let response = enrollment::enroll(&state, enroll_request, request_id, ip).await?;
    Ok(Json(response))
}

/// `POST /v1/renew`
pub async fn renew(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<RenewResponse>> {
    let request: RenewRequest = parse_body(body)?;
    let response = enrollment::renew(&state, &identity, request, request_id).await?;
    Ok(Json(response))
}

/// `POST /v1/unenroll`
pub async fn unenroll(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> ApiResult<StatusCode> {
    enrollment::unenroll(&state, &identity, request_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agents/heartbeat` and `POST /v1/heartbeat`
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let heartbeat: Heartbeat = parse_body(body)?;
    let response = heartbeat::ingest(&state, &identity, heartbeat, request_id).await?;
    Ok(Json(response))
}

/// `GET /v1/plans/next`
pub async fn next_plans(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let pending_plans = dispatch::lease_for_agent(&state, &identity).await?;
    Ok(Json(HeartbeatResponse {
        next_heartbeat_seconds: state.config.heartbeat_interval.as_secs(),
        pending_plans,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub applied: usize,
}

/// `POST /v1/executions/result`
pub async fn report_results(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<ResultsResponse>> {
    let request: ExecutionResultRequest = parse_body(body)?;
    let applied = dispatch::apply_updates(&state, &identity, request.updates).await?;
    Ok(Json(ResultsResponse { applied }))
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub appended: usize,
}

/// `POST /agents/logs` and `POST /v1/logs`
///
/// Frames for executions outside the reporting agent's site are dropped,
/// not errored — one bad frame must not fail the batch.
pub async fn ingest_logs(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AgentIdentity>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<LogsResponse>> {
    let batch: LogBatch = parse_body(body)?;

    let mut accepted = Vec::with_capacity(batch.frames.len());
    let mut checked: std::collections::HashMap<Uuid, bool> = std::collections::HashMap::new();
    for frame in batch.frames {
        let ok = match checked.get(&frame.execution_id) {
            Some(ok) => *ok,
            None => {
                let ok = execution_in_site(&state, frame.execution_id, identity.site_id).await;
                checked.insert(frame.execution_id, ok);
                ok
            }
        };
        if ok {
            accepted.push(frame);
        } else {
            tracing::warn!(
                execution_id = %frame.execution_id,
                agent_id = %identity.agent_id,
                "dropping log frame for foreign execution"
            );
        }
    }

    let appended = state.store.append_log_frames(accepted).await?;
    Ok(Json(LogsResponse { appended }))
}

async fn execution_in_site(state: &AppState, execution_id: Uuid, site_id: Uuid) -> bool {
    let Ok(execution) = state.store.get_execution(execution_id).await else {
        return false;
    };
    state
        .store
        .get_plan(execution.plan_id)
        .await
        .is_ok_and(|plan| plan.site_id == site_id)
}
