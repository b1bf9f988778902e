//! The agent's heartbeat loop.
//!
//! Every tick: collect facts and the provider's VM inventory, flush any
//! updates that failed to reach the control plane earlier, post the
//! heartbeat, and execute whatever plans came back. Results are reported
//! immediately via `/v1/executions/result`; if that call fails they ride
//! along on the next heartbeat's `execution_updates`, and the action cache
//! guarantees the retried report never re-executes anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use nkudo_types::wire::{
    ExecutionResultRequest, ExecutionUpdate, Heartbeat, HeartbeatResponse, LogBatch,
};

use crate::client::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::error::StateError;
use crate::executor::Executor;
use crate::facts;
use crate::statefile::StateStore;

/// Run the heartbeat loop until shutdown.
///
/// # Errors
///
/// Returns early only when the agent has no enrolled identity.
pub async fn run(
    config: AgentConfig,
    client: Arc<ControlPlaneClient>,
    executor: Arc<Executor>,
    state: Arc<Mutex<StateStore>>,
    provider: Arc<dyn crate::provider::Provider>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StateError> {
    let (agent_id, mut interval_secs) = {
        let guard = state.lock().map_err(|_| StateError::NotEnrolled)?;
        let identity = guard.identity()?;
        (identity.agent_id, identity.heartbeat_interval_sec)
    };
    if let Some(override_secs) = config.heartbeat_interval_secs {
        interval_secs = override_secs;
    }

    info!(agent_id = %agent_id, interval_secs, "heartbeat loop started");
    let mut pending_updates: Vec<ExecutionUpdate> = Vec::new();

    loop {
        let heartbeat = build_heartbeat(&config, &state, &provider, agent_id, &mut pending_updates)
            .await?;

        match client.heartbeat(&heartbeat).await {
            Ok(response) => {
                if response.next_heartbeat_seconds > 0
                    && config.heartbeat_interval_secs.is_none()
                {
                    interval_secs = response.next_heartbeat_seconds;
                }
                execute_plans(&client, &executor, response, &mut pending_updates).await;
            }
            Err(e) => {
                // Updates that were drained into this heartbeat are not
                // lost — requeue them for the next attempt.
                pending_updates.extend(heartbeat.execution_updates);
                warn!(error = %e, "heartbeat failed, will retry");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(interval_secs.max(1))) => {}
            _ = shutdown.changed() => {
                info!("heartbeat loop shutting down");
                return Ok(());
            }
        }
    }
}

async fn build_heartbeat(
    config: &AgentConfig,
    state: &Arc<Mutex<StateStore>>,
    provider: &Arc<dyn crate::provider::Provider>,
    agent_id: uuid::Uuid,
    pending_updates: &mut Vec<ExecutionUpdate>,
) -> Result<Heartbeat, StateError> {
    let heartbeat_seq = {
        let mut guard = state.lock().map_err(|_| StateError::NotEnrolled)?;
        guard.next_heartbeat_seq()?
    };

    let microvms = match provider.inventory().await {
        Ok(vms) => vms
            .into_iter()
            .map(|(vm_id, state)| nkudo_types::wire::ReportedVm { vm_id, state })
            .collect(),
        Err(e) => {
            warn!(error = %e, "provider inventory failed, reporting none");
            Vec::new()
        }
    };

    Ok(Heartbeat {
        agent_id,
        heartbeat_seq,
        facts: facts::collect(config),
        microvms,
        execution_updates: std::mem::take(pending_updates),
    })
}

async fn execute_plans(
    client: &Arc<ControlPlaneClient>,
    executor: &Arc<Executor>,
    response: HeartbeatResponse,
    pending_updates: &mut Vec<ExecutionUpdate>,
) {
    for plan in &response.pending_plans {
        debug!(plan_id = %plan.plan_id, actions = plan.actions.len(), "executing plan");
        let results = executor.run_plan(plan).await;

        let frames: Vec<_> = results.iter().flat_map(|r| r.frames.clone()).collect();
        if !frames.is_empty() {
            if let Err(e) = client.send_logs(&LogBatch { frames }).await {
                debug!(error = %e, "log shipping failed (non-fatal)");
            }
        }

        let updates: Vec<ExecutionUpdate> = results.into_iter().map(|r| r.update).collect();
        match client
            .report_results(&ExecutionResultRequest {
                updates: updates.clone(),
            })
            .await
        {
            Ok(()) => {
                debug!(plan_id = %plan.plan_id, "results reported");
            }
            Err(e) => {
                warn!(plan_id = %plan.plan_id, error = %e, "result report failed, queuing for next heartbeat");
                pending_updates.extend(updates);
            }
        }
    }
}
