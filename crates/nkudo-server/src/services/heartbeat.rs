//! Heartbeat ingestion and the background workers.
//!
//! The offline sweeper and the audit-chain verifier follow the same shape:
//! a `tokio::time::interval` ticker racing a `watch` shutdown channel, no
//! shared mutable state beyond the repository.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use nkudo_store::{NewAuditEvent, StoreError};
use nkudo_types::audit::{self, ActorType};
use nkudo_types::wire::{Heartbeat, HeartbeatResponse};

use crate::error::{ApiError, ApiResult};
use crate::middleware::AgentIdentity;
use crate::services::dispatch;
use crate::state::AppState;

/// Ingest one heartbeat: facts upsert, VM reconciliation, execution
/// updates, liveness restoration, and dispatch of pending work.
///
/// # Errors
///
/// - `UNAUTHENTICATED` (401) when the body's `agent_id` does not match the
///   certificate identity.
/// - Propagates store errors.
pub async fn ingest(
    state: &Arc<AppState>,
    identity: &AgentIdentity,
    heartbeat: Heartbeat,
    request_id: Uuid,
) -> ApiResult<HeartbeatResponse> {
    if heartbeat.agent_id != identity.agent_id {
        return Err(ApiError::unauthenticated().with_request_id(request_id));
    }

    let outcome = state
        .store
        .record_heartbeat(
            identity.agent_id,
            heartbeat.facts,
            heartbeat.microvms,
            Utc::now(),
        )
        .await
        .map_err(|e| match e {
            StoreError::Invalid { .. } => ApiError::unauthenticated(),
            other => ApiError::from(other),
        })?;

    if outcome.agent_restored {
        state
            .audit(NewAuditEvent {
                tenant_id: Some(identity.tenant_id),
                site_id: Some(identity.site_id),
                actor_type: ActorType::Agent,
                actor_id: identity.agent_id.to_string(),
                action: "agent.online".to_owned(),
                resource_type: "agent".to_owned(),
                resource_id: identity.agent_id.to_string(),
                request_id,
                source_ip: None,
                metadata: serde_json::Value::Null,
            })
            .await;
        info!(agent_id = %identity.agent_id, "offline agent restored by heartbeat");
    }

    dispatch::apply_updates(state, identity, heartbeat.execution_updates).await?;
    let pending_plans = dispatch::lease_for_agent(state, identity).await?;

    Ok(HeartbeatResponse {
        next_heartbeat_seconds: state.config.heartbeat_interval.as_secs(),
        pending_plans,
    })
}

/// Background task aging silent agents and sites to OFFLINE.
///
/// Also sweeps stale rate-limiter buckets on the same cadence — both are
/// periodic hygiene over in-process state.
pub async fn offline_sweeper(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.offline_sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        interval_secs = state.config.offline_sweep_interval.as_secs(),
        offline_after_secs = state.config.heartbeat_offline_after.as_secs(),
        "offline sweeper started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let offline_after = Duration::from_std(state.config.heartbeat_offline_after)
                    .unwrap_or_else(|_| Duration::seconds(120));
                let stale_before = Utc::now() - offline_after;
                match state.store.sweep_offline(stale_before, Utc::now()).await {
                    Ok(outcome) => {
                        for agent_id in &outcome.agents_marked {
                            warn!(agent_id = %agent_id, "agent marked offline");
                            state
                                .audit(AppState::system_audit(
                                    "agent.offline",
                                    "agent",
                                    agent_id.to_string(),
                                ))
                                .await;
                        }
                        for site_id in &outcome.sites_marked {
                            warn!(site_id = %site_id, "site marked offline");
                            state
                                .audit(AppState::system_audit(
                                    "site.offline",
                                    "site",
                                    site_id.to_string(),
                                ))
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "offline sweep failed, will retry next tick");
                    }
                }
                state.enroll_limiter.sweep_stale();
                state.default_limiter.sweep_stale();
            }
            _ = shutdown.changed() => {
                info!("offline sweeper shutting down");
                return;
            }
        }
    }
}

/// Background task re-verifying the audit hash chain.
///
/// A broken chain is an operator-level alarm: it is logged at error level
/// and NOT audited, since appending to a broken chain would only bury the
/// evidence.
pub async fn audit_verifier(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.audit_verify_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        interval_secs = state.config.audit_verify_interval.as_secs(),
        "audit chain verifier started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match state.store.list_audit(None).await {
                    Ok(events) => match audit::verify_chain(&events) {
                        Ok(()) => {
                            tracing::debug!(entries = events.len(), "audit chain verified");
                        }
                        Err(violation) => {
                            error!(%violation, "AUDIT CHAIN BROKEN");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "audit chain read failed, will retry next tick");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("audit verifier shutting down");
                return;
            }
        }
    }
}
