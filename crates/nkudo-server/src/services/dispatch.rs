//! Plan validation, lease-based dispatch, and result ingestion.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use nkudo_store::{Execution, NewAuditEvent, PlanApplyOutcome, PlanSubmission};
use nkudo_types::ErrorCode;
use nkudo_types::plan::ApplyPlanRequest;
use nkudo_types::state::{ExecutionState, PlanStatus, derive_plan_status};
use nkudo_types::wire::{DispatchedAction, DispatchedPlan, ExecutionUpdate};

use crate::error::{ApiError, ApiResult};
use crate::middleware::{AgentIdentity, Caller};
use crate::state::AppState;

/// The agent-side idempotency key for one execution: stable across
/// lease-expiry re-dispatch and across plan resubmission.
#[must_use]
pub fn action_id(plan_id: Uuid, operation_id: &str) -> String {
    format!("{plan_id}:{operation_id}")
}

/// Validate a plan submission body.
///
/// # Errors
///
/// - `INVALID_REQUEST` for an empty action list.
/// - `DUPLICATE_OPERATION` when an `operation_id` repeats within the plan.
pub fn validate_plan(request: &ApplyPlanRequest) -> Result<(), ApiError> {
    if request.actions.is_empty() {
        return Err(ApiError::invalid("plan must contain at least one action"));
    }
    let mut seen = std::collections::HashSet::with_capacity(request.actions.len());
    for action in &request.actions {
        if !seen.insert(action.operation_id.as_str()) {
            return Err(ApiError::new(
                ErrorCode::DuplicateOperation,
                format!("operation_id '{}' appears more than once", action.operation_id),
            ));
        }
    }
    Ok(())
}

/// Apply a plan idempotently and audit first-time submissions.
///
/// # Errors
///
/// Propagates validation failures and store errors.
pub async fn apply_plan(
    state: &Arc<AppState>,
    caller: &Caller,
    tenant_id: Uuid,
    site_id: Uuid,
    request: ApplyPlanRequest,
    request_id: Uuid,
    source_ip: Option<String>,
) -> ApiResult<PlanApplyOutcome> {
    validate_plan(&request)?;

    let outcome = state
        .store
        .apply_plan(PlanSubmission {
            tenant_id,
            site_id,
            idempotency_key: request.idempotency_key,
            client_request_id: request.client_request_id,
            actions: request.actions,
            now: Utc::now(),
        })
        .await?;

    if !outcome.deduplicated {
        let (actor_type, actor_id) = caller.actor();
        state
            .audit(NewAuditEvent {
                tenant_id: Some(tenant_id),
                site_id: Some(site_id),
                actor_type,
                actor_id,
                action: "plan.apply".to_owned(),
                resource_type: "plan".to_owned(),
                resource_id: outcome.plan.id.to_string(),
                request_id,
                source_ip,
                metadata: serde_json::json!({
                    "idempotency_key": outcome.plan.idempotency_key,
                    "actions": outcome.executions.len(),
                }),
            })
            .await;
    }

    Ok(outcome)
}

/// Derive a plan's status from its executions.
#[must_use]
pub fn plan_status(executions: &[Execution]) -> PlanStatus {
    let states: Vec<ExecutionState> = executions.iter().map(|e| e.state).collect();
    derive_plan_status(&states)
}

/// Lease dispatchable executions to the calling agent's host and group
/// them by plan, preserving dispatch order.
///
/// # Errors
///
/// Propagates store errors.
pub async fn lease_for_agent(
    state: &Arc<AppState>,
    identity: &AgentIdentity,
) -> ApiResult<Vec<DispatchedPlan>> {
    let lease_ttl = Duration::from_std(state.config.plan_lease_ttl)
        .unwrap_or_else(|_| Duration::seconds(300));
    let leased = state
        .store
        .lease_executions(
            identity.site_id,
            identity.host_id,
            state.config.max_pending_plans,
            lease_ttl,
            Utc::now(),
        )
        .await?;

    let mut plans: Vec<DispatchedPlan> = Vec::new();
    for execution in leased {
        let action = DispatchedAction {
            execution_id: execution.id,
            action_id: action_id(execution.plan_id, &execution.operation_id),
            operation_id: execution.operation_id,
            vm_id: execution.vm_id,
            timeout_seconds: execution.timeout_seconds,
            spec: execution.spec,
        };
        match plans.iter_mut().find(|p| p.plan_id == execution.plan_id) {
            Some(plan) => plan.actions.push(action),
            None => plans.push(DispatchedPlan {
                plan_id: execution.plan_id,
                actions: vec![action],
            }),
        }
    }
    Ok(plans)
}

/// Apply a batch of execution updates from an agent.
///
/// Malformed updates (non-terminal state, FAILED without an error) are a
/// 400; updates for already-terminal executions are discarded with one log
/// line; updates for unknown or cross-site executions are dropped with a
/// warning rather than failing the whole batch.
///
/// # Errors
///
/// Returns `INVALID_REQUEST` for malformed updates.
pub async fn apply_updates(
    state: &Arc<AppState>,
    identity: &AgentIdentity,
    updates: Vec<ExecutionUpdate>,
) -> ApiResult<usize> {
    let mut applied = 0;
    for update in updates {
        if !update.state.is_terminal() {
            return Err(ApiError::invalid(format!(
                "execution update for {} must be terminal",
                update.execution_id
            )));
        }
        if update.state == ExecutionState::Failed
            && (update.error_code.as_deref().unwrap_or("").is_empty()
                || update.error_message.as_deref().unwrap_or("").is_empty())
        {
            return Err(ApiError::invalid(format!(
                "failed execution {} must carry error_code and error_message",
                update.execution_id
            )));
        }

        let execution_id = update.execution_id;
        match state
            .store
            .apply_execution_update(identity.site_id, update, Utc::now())
            .await
        {
            Ok(outcome) if outcome.applied => {
                applied += 1;
                tracing::debug!(
                    execution_id = %execution_id,
                    state = ?outcome.execution.state,
                    vm_state = ?outcome.vm_state,
                    "execution update applied"
                );
            }
            Ok(_) => {
                tracing::info!(
                    execution_id = %execution_id,
                    "discarding update for already-terminal execution"
                );
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    agent_id = %identity.agent_id,
                    error = %e,
                    "dropping execution update"
                );
            }
        }
    }
    Ok(applied)
}
