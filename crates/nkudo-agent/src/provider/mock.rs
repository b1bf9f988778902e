//! In-memory provider for executor tests.
//!
//! Counts every invocation per VM so tests can assert the at-most-once
//! property of the action cache, and can be primed to fail specific VMs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use nkudo_types::state::{OperationKind, VmState};

use crate::error::ProviderError;
use crate::provider::{CreateSpec, Provider, ProviderMessage};

#[derive(Debug, Default)]
struct MockInner {
    states: HashMap<String, VmState>,
    invocations: HashMap<String, u32>,
    failing: HashSet<String>,
}

/// A provider that tracks state in memory and counts invocations.
#[derive(Debug, Default)]
pub struct MockProvider {
    inner: Mutex<MockInner>,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation against `vm_id` fail with a provider error.
    pub fn fail_vm(&self, vm_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failing.insert(vm_id.to_owned());
        }
    }

    /// Total provider invocations for a VM across its lifetime.
    #[must_use]
    pub fn invocations(&self, vm_id: &str) -> u32 {
        self.inner
            .lock()
            .map(|inner| inner.invocations.get(vm_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn invoke(
        &self,
        vm_id: &str,
        op: OperationKind,
        next: Option<VmState>,
    ) -> Result<ProviderMessage, ProviderError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(ProviderError::Runtime {
                vm_id: vm_id.to_owned(),
                reason: "mock lock poisoned".to_owned(),
            });
        };
        *inner.invocations.entry(vm_id.to_owned()).or_insert(0) += 1;
        if inner.failing.contains(vm_id) {
            return Err(ProviderError::Hypervisor {
                vm_id: vm_id.to_owned(),
                reason: "mock failure".to_owned(),
            });
        }
        let current = inner.states.get(vm_id).copied();
        op.check_transition(current)?;
        if let Some(next) = next {
            inner.states.insert(vm_id.to_owned(), next);
        }
        Ok(format!("{op} on '{vm_id}' ok"))
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn current_state(&self, vm_id: &str) -> Result<Option<VmState>, ProviderError> {
        Ok(self
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.states.get(vm_id).copied()))
    }

    async fn create(
        &self,
        vm_id: &str,
        _spec: &CreateSpec,
    ) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Create, Some(VmState::Stopped))
    }

    async fn start(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Start, Some(VmState::Running))
    }

    async fn stop(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Stop, Some(VmState::Stopped))
    }

    async fn pause(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Pause, Some(VmState::Paused))
    }

    async fn resume(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Resume, Some(VmState::Running))
    }

    async fn delete(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Delete, Some(VmState::Deleted))
    }

    async fn snapshot(
        &self,
        vm_id: &str,
        _destination: &str,
    ) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Snapshot, None)
    }

    async fn execute(
        &self,
        vm_id: &str,
        _command: &str,
        _args: &[String],
    ) -> Result<ProviderMessage, ProviderError> {
        self.invoke(vm_id, OperationKind::Execute, None)
    }

    async fn process_id(&self, _vm_id: &str) -> Result<Option<u32>, ProviderError> {
        Ok(None)
    }

    async fn inventory(&self) -> Result<Vec<(String, VmState)>, ProviderError> {
        let mut vms: Vec<(String, VmState)> = self
            .inner
            .lock()
            .map(|inner| {
                inner
                    .states
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect()
            })
            .unwrap_or_default();
        vms.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vms)
    }
}
