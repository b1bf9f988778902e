//! The plan executor.
//!
//! Actions run sequentially in plan order. Before every provider call the
//! action cache is consulted by `action_id`; a hit short-circuits to the
//! recorded outcome (success *or* failure — the executor never retries,
//! retries require a new plan with a new action id). Outcomes are written
//! to the cache only after the provider settles, and the cache write
//! happens before the result is reported, so a crash between the two can
//! only cause a re-report, never a re-execution.
//!
//! A failing action does not abort the rest of the plan — each action is
//! reported independently so the control plane can see partial success. A
//! panicking provider is contained the same way a failing one is.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use nkudo_types::plan::ActionSpec;
use nkudo_types::state::ExecutionState;
use nkudo_types::wire::{DispatchedAction, DispatchedPlan, ExecutionUpdate, LogFrame, LogSeverity};

use crate::error::ProviderError;
use crate::provider::{CreateSpec, Provider};
use crate::statefile::{CachedOutcome, StateStore};

/// The terminal result of one action, ready to report.
#[derive(Debug)]
pub struct ActionResult {
    pub update: ExecutionUpdate,
    pub frames: Vec<LogFrame>,
}

/// Executes dispatched plans against a provider, with the persistent
/// action cache as the idempotency barrier.
pub struct Executor {
    provider: Arc<dyn Provider>,
    state: Arc<Mutex<StateStore>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

/// What one provider invocation settled to.
enum Settled {
    Ok(String),
    Fail { code: String, message: String },
}

impl Executor {
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        state: Arc<Mutex<StateStore>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            state,
            default_timeout,
        }
    }

    /// Run every action of a plan in order, returning one result per
    /// action.
    pub async fn run_plan(&self, plan: &DispatchedPlan) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            results.push(self.run_action(action).await);
        }
        results
    }

    async fn run_action(&self, action: &DispatchedAction) -> ActionResult {
        let mut frames = FrameBuilder::new(action.execution_id);

        // Cache first: a settled action id never re-invokes the provider.
        let cached = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.cached_outcome(&action.action_id).cloned());
        if let Some(cached) = cached {
            info!(
                action_id = %action.action_id,
                ok = cached.ok,
                "returning cached outcome without re-invoking provider"
            );
            frames.push(
                LogSeverity::Info,
                format!("cached outcome replayed: {}", cached.message),
            );
            return ActionResult {
                update: update_from_cache(action, &cached),
                frames: frames.finish(),
            };
        }

        let started_at = Utc::now();
        frames.push(
            LogSeverity::Info,
            format!("{} '{}' starting", action.spec.kind(), action.vm_id),
        );

        let timeout = action
            .timeout_seconds
            .map_or(self.default_timeout, Duration::from_secs);
        let settled = self.invoke_contained(action, timeout).await;

        let finished_at = Utc::now();
        let (ok, message, error_code) = match &settled {
            Settled::Ok(message) => {
                frames.push(LogSeverity::Info, message.clone());
                (true, message.clone(), None)
            }
            Settled::Fail { code, message } => {
                frames.push(LogSeverity::Error, format!("{code}: {message}"));
                (false, message.clone(), Some(code.clone()))
            }
        };

        // Record before reporting — the cache is the authoritative record.
        let outcome = CachedOutcome {
            action_id: action.action_id.clone(),
            ok,
            message,
            error_code,
            started_at,
            finished_at,
        };
        if let Ok(mut state) = self.state.lock() {
            if let Err(e) = state.record_outcome(outcome.clone()) {
                warn!(action_id = %action.action_id, error = %e, "action cache write failed");
            }
        }

        ActionResult {
            update: update_from_cache(action, &outcome),
            frames: frames.finish(),
        }
    }

    /// Invoke the provider on its own task so a panic is contained to
    /// this action, under the action's timeout budget.
    async fn invoke_contained(&self, action: &DispatchedAction, timeout: Duration) -> Settled {
        let provider = Arc::clone(&self.provider);
        let owned = action.clone();
        let invocation =
            tokio::spawn(async move { invoke(provider.as_ref(), &owned).await });

        match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(Ok(message))) => Settled::Ok(message),
            Ok(Ok(Err(e))) => Settled::Fail {
                code: e.code().to_owned(),
                message: e.to_string(),
            },
            Ok(Err(join_err)) => Settled::Fail {
                code: "ACTION_FAILED".to_owned(),
                message: if join_err.is_panic() {
                    "action panicked".to_owned()
                } else {
                    "action cancelled".to_owned()
                },
            },
            Err(_) => Settled::Fail {
                code: "TIMEOUT".to_owned(),
                message: format!("action exceeded its {}s budget", timeout.as_secs()),
            },
        }
    }
}

async fn invoke(
    provider: &dyn Provider,
    action: &DispatchedAction,
) -> Result<String, ProviderError> {
    match &action.spec {
        ActionSpec::Create {
            vcpu_count,
            memory_mib,
            kernel_image,
            rootfs_image,
        } => {
            provider
                .create(
                    &action.vm_id,
                    &CreateSpec {
                        vcpu_count: *vcpu_count,
                        memory_mib: *memory_mib,
                        kernel_image: kernel_image.clone(),
                        rootfs_image: rootfs_image.clone(),
                    },
                )
                .await
        }
        ActionSpec::Start {} => provider.start(&action.vm_id).await,
        ActionSpec::Stop {} => provider.stop(&action.vm_id).await,
        ActionSpec::Delete {} => provider.delete(&action.vm_id).await,
        ActionSpec::Pause {} => provider.pause(&action.vm_id).await,
        ActionSpec::Resume {} => provider.resume(&action.vm_id).await,
        ActionSpec::Snapshot { destination } => {
            provider.snapshot(&action.vm_id, destination).await
        }
        ActionSpec::Execute { command, args } => {
            provider.execute(&action.vm_id, command, args).await
        }
    }
}

fn update_from_cache(action: &DispatchedAction, cached: &CachedOutcome) -> ExecutionUpdate {
    if cached.ok {
        ExecutionUpdate {
            execution_id: action.execution_id,
            state: ExecutionState::Succeeded,
            error_code: None,
            error_message: None,
        }
    } else {
        ExecutionUpdate {
            execution_id: action.execution_id,
            state: ExecutionState::Failed,
            error_code: Some(
                cached
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "ACTION_FAILED".to_owned()),
            ),
            error_message: Some(cached.message.clone()),
        }
    }
}

struct FrameBuilder {
    execution_id: uuid::Uuid,
    sequence: u32,
    frames: Vec<LogFrame>,
}

impl FrameBuilder {
    fn new(execution_id: uuid::Uuid) -> Self {
        Self {
            execution_id,
            sequence: 0,
            frames: Vec::new(),
        }
    }

    fn push(&mut self, severity: LogSeverity, message: String) {
        self.frames.push(LogFrame {
            execution_id: self.execution_id,
            sequence: self.sequence,
            severity,
            message,
            emitted_at: Utc::now(),
        });
        self.sequence += 1;
    }

    fn finish(self) -> Vec<LogFrame> {
        self.frames
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use uuid::Uuid;

    fn executor_with(provider: Arc<dyn Provider>) -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(Mutex::new(
            StateStore::open_with_key(dir.path(), None).unwrap(),
        ));
        (
            Executor::new(provider, state, Duration::from_secs(5)),
            dir,
        )
    }

    fn action(action_id: &str, vm_id: &str, spec: ActionSpec) -> DispatchedAction {
        DispatchedAction {
            execution_id: Uuid::new_v4(),
            action_id: action_id.to_owned(),
            operation_id: action_id.to_owned(),
            vm_id: vm_id.to_owned(),
            timeout_seconds: None,
            spec,
        }
    }

    fn create_spec() -> ActionSpec {
        ActionSpec::Create {
            vcpu_count: 1,
            memory_mib: 256,
            kernel_image: None,
            rootfs_image: None,
        }
    }

    fn plan(actions: Vec<DispatchedAction>) -> DispatchedPlan {
        DispatchedPlan {
            plan_id: Uuid::new_v4(),
            actions,
        }
    }

    #[tokio::test]
    async fn actions_run_in_order_and_report_individually() {
        let provider = Arc::new(MockProvider::new());
        let (executor, _dir) = executor_with(Arc::clone(&provider) as Arc<dyn Provider>);

        let results = executor
            .run_plan(&plan(vec![
                action("p:a", "vm1", create_spec()),
                action("p:b", "vm1", ActionSpec::Start {}),
            ]))
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.update.state == ExecutionState::Succeeded));
        assert_eq!(provider.invocations("vm1"), 2);
    }

    #[tokio::test]
    async fn cache_prevents_second_invocation() {
        let provider = Arc::new(MockProvider::new());
        let (executor, _dir) = executor_with(Arc::clone(&provider) as Arc<dyn Provider>);

        let the_plan = plan(vec![action("p:a", "vm1", create_spec())]);
        let first = executor.run_plan(&the_plan).await;
        let second = executor.run_plan(&the_plan).await;

        assert_eq!(first[0].update.state, ExecutionState::Succeeded);
        assert_eq!(second[0].update.state, ExecutionState::Succeeded);
        assert_eq!(provider.invocations("vm1"), 1, "provider invoked at most once");
    }

    #[tokio::test]
    async fn failed_outcomes_are_cached_too() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_vm("vm1");
        let (executor, _dir) = executor_with(Arc::clone(&provider) as Arc<dyn Provider>);

        let the_plan = plan(vec![action("p:a", "vm1", create_spec())]);
        let first = executor.run_plan(&the_plan).await;
        assert_eq!(first[0].update.state, ExecutionState::Failed);
        assert_eq!(first[0].update.error_code.as_deref(), Some("PROVIDER_ERROR"));

        // Replaying the same action id returns the failure from cache.
        let second = executor.run_plan(&the_plan).await;
        assert_eq!(second[0].update.state, ExecutionState::Failed);
        assert_eq!(provider.invocations("vm1"), 1);
    }

    #[tokio::test]
    async fn failure_does_not_abort_subsequent_actions() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_vm("bad");
        let (executor, _dir) = executor_with(Arc::clone(&provider) as Arc<dyn Provider>);

        let results = executor
            .run_plan(&plan(vec![
                action("p:a", "bad", create_spec()),
                action("p:b", "good", create_spec()),
            ]))
            .await;

        assert_eq!(results[0].update.state, ExecutionState::Failed);
        assert_eq!(results[1].update.state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn invalid_transition_reports_invalid_state() {
        let provider = Arc::new(MockProvider::new());
        let (executor, _dir) = executor_with(provider as Arc<dyn Provider>);

        let results = executor
            .run_plan(&plan(vec![action("p:a", "vm1", ActionSpec::Start {})]))
            .await;
        assert_eq!(results[0].update.state, ExecutionState::Failed);
        assert_eq!(results[0].update.error_code.as_deref(), Some("INVALID_STATE"));
    }

    #[tokio::test]
    async fn timeout_is_reported_never_success() {
        struct StallingProvider(MockProvider);

        #[async_trait::async_trait]
        impl Provider for StallingProvider {
            async fn current_state(
                &self,
                vm_id: &str,
            ) -> Result<Option<nkudo_types::state::VmState>, ProviderError> {
                self.0.current_state(vm_id).await
            }
            async fn create(
                &self,
                _vm_id: &str,
                _spec: &CreateSpec,
            ) -> Result<String, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("unreachable".to_owned())
            }
            async fn start(&self, vm_id: &str) -> Result<String, ProviderError> {
                self.0.start(vm_id).await
            }
            async fn stop(&self, vm_id: &str) -> Result<String, ProviderError> {
                self.0.stop(vm_id).await
            }
            async fn pause(&self, vm_id: &str) -> Result<String, ProviderError> {
                self.0.pause(vm_id).await
            }
            async fn resume(&self, vm_id: &str) -> Result<String, ProviderError> {
                self.0.resume(vm_id).await
            }
            async fn delete(&self, vm_id: &str) -> Result<String, ProviderError> {
                self.0.delete(vm_id).await
            }
            async fn snapshot(
                &self,
                vm_id: &str,
                destination: &str,
            ) -> Result<String, ProviderError> {
                self.0.snapshot(vm_id, destination).await
            }
            async fn execute(
                &self,
                vm_id: &str,
                command: &str,
                args: &[String],
            ) -> Result<String, ProviderError> {
                self.0.execute(vm_id, command, args).await
            }
            async fn process_id(&self, vm_id: &str) -> Result<Option<u32>, ProviderError> {
                self.0.process_id(vm_id).await
            }
            async fn inventory(
                &self,
            ) -> Result<Vec<(String, nkudo_types::state::VmState)>, ProviderError> {
                self.0.inventory().await
            }
        }

        let provider = Arc::new(StallingProvider(MockProvider::new()));
        let (executor, _dir) = executor_with(provider as Arc<dyn Provider>);

        let mut stalled = action("p:a", "vm1", create_spec());
        stalled.timeout_seconds = Some(1);
        let results = executor.run_plan(&plan(vec![stalled])).await;

        assert_eq!(results[0].update.state, ExecutionState::Failed);
        assert_eq!(results[0].update.error_code.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn log_frames_carry_ordered_sequences() {
        let provider = Arc::new(MockProvider::new());
        let (executor, _dir) = executor_with(provider as Arc<dyn Provider>);

        let results = executor
            .run_plan(&plan(vec![action("p:a", "vm1", create_spec())]))
            .await;
        let frames = &results[0].frames;
        assert!(frames.len() >= 2);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence as usize, i);
        }
    }
}
