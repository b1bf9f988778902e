//! The microVM provider abstraction.
//!
//! The executor drives a [`Provider`]; the production implementation
//! manages cloud-hypervisor microVMs through per-VM runtime directories,
//! and tests substitute [`mock::MockProvider`] to count invocations.
//!
//! All transition legality is decided by
//! [`OperationKind::check_transition`] before any side effect, so every
//! implementation refuses the same invalid operations.

pub mod local;
pub mod mock;

use async_trait::async_trait;

use nkudo_types::state::VmState;

use crate::error::ProviderError;

/// Parameters for creating a microVM.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub kernel_image: Option<String>,
    pub rootfs_image: Option<String>,
}

/// The outcome message of a successful provider operation.
pub type ProviderMessage = String;

/// Operations a hypervisor backend must support.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider's view of a VM, `None` if it has never existed here.
    async fn current_state(&self, vm_id: &str) -> Result<Option<VmState>, ProviderError>;

    /// Provision a VM. Settles in `STOPPED`.
    async fn create(&self, vm_id: &str, spec: &CreateSpec) -> Result<ProviderMessage, ProviderError>;

    /// Boot a stopped VM.
    async fn start(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError>;

    /// Stop a running VM.
    async fn stop(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError>;

    /// Pause a running VM in place.
    async fn pause(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError>;

    /// Resume a paused VM.
    async fn resume(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError>;

    /// Tear a VM down. Valid from any state; deleting an absent or
    /// already-deleted VM succeeds with a "not present" note.
    async fn delete(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError>;

    /// Snapshot a VM's disk and memory to `destination`.
    async fn snapshot(
        &self,
        vm_id: &str,
        destination: &str,
    ) -> Result<ProviderMessage, ProviderError>;

    /// Run a command inside the guest.
    async fn execute(
        &self,
        vm_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProviderMessage, ProviderError>;

    /// The hypervisor PID backing a VM, if one is running.
    async fn process_id(&self, vm_id: &str) -> Result<Option<u32>, ProviderError>;

    /// Every VM this provider knows about, for heartbeat reporting.
    async fn inventory(&self) -> Result<Vec<(String, VmState)>, ProviderError>;
}
