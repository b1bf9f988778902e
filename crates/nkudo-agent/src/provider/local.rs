//! cloud-hypervisor provider backed by per-VM runtime directories.
//!
//! Layout per VM: `<runtime>/<vm_id>/{state.json, commands.log,
//! console.log, stdout.log, stderr.log, api.sock, ch.pid}`.
//!
//! When no hypervisor binary is configured the provider runs in
//! state-only mode: every transition is tracked and enforced, no process
//! is spawned. That mode is what development boxes without KVM use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use nkudo_types::state::{OperationKind, VmState};

use crate::error::ProviderError;
use crate::provider::{CreateSpec, Provider, ProviderMessage};

const STATE_JSON: &str = "state.json";
const COMMANDS_LOG: &str = "commands.log";
const PID_FILE: &str = "ch.pid";

/// Persisted per-VM record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmRecord {
    vm_id: String,
    state: VmState,
    vcpu_count: u32,
    memory_mib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kernel_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rootfs_image: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// The on-disk cloud-hypervisor provider.
pub struct LocalProvider {
    runtime_dir: PathBuf,
    hypervisor_bin: Option<PathBuf>,
    /// Children spawned in this process lifetime; VMs from a previous
    /// process are reached through their pid files.
    children: Mutex<HashMap<String, std::process::Child>>,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("runtime_dir", &self.runtime_dir)
            .field("hypervisor_bin", &self.hypervisor_bin)
            .finish_non_exhaustive()
    }
}

fn runtime_err(vm_id: &str, e: impl std::fmt::Display) -> ProviderError {
    ProviderError::Runtime {
        vm_id: vm_id.to_owned(),
        reason: e.to_string(),
    }
}

impl LocalProvider {
    /// Create the provider rooted at `runtime_dir`.
    #[must_use]
    pub fn new(runtime_dir: PathBuf, hypervisor_bin: Option<PathBuf>) -> Self {
        Self {
            runtime_dir,
            hypervisor_bin,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.runtime_dir.join(vm_id)
    }

    async fn load(&self, vm_id: &str) -> Result<Option<VmRecord>, ProviderError> {
        let path = self.vm_dir(vm_id).join(STATE_JSON);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|e| runtime_err(vm_id, e))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(runtime_err(vm_id, e)),
        }
    }

    async fn save(&self, record: &VmRecord) -> Result<(), ProviderError> {
        let dir = self.vm_dir(&record.vm_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| runtime_err(&record.vm_id, e))?;
        let bytes =
            serde_json::to_vec_pretty(record).map_err(|e| runtime_err(&record.vm_id, e))?;
        let tmp = dir.join("state.json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| runtime_err(&record.vm_id, e))?;
        tokio::fs::rename(&tmp, dir.join(STATE_JSON))
            .await
            .map_err(|e| runtime_err(&record.vm_id, e))?;
        Ok(())
    }

    async fn log_command(&self, vm_id: &str, line: &str) -> Result<(), ProviderError> {
        let path = self.vm_dir(vm_id).join(COMMANDS_LOG);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| runtime_err(vm_id, e))?;
        let entry = format!("{} {line}\n", Utc::now().to_rfc3339());
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| runtime_err(vm_id, e))?;
        Ok(())
    }

    /// Check the transition and return the loaded record (if any).
    async fn guard(
        &self,
        vm_id: &str,
        op: OperationKind,
    ) -> Result<Option<VmRecord>, ProviderError> {
        let record = self.load(vm_id).await?;
        op.check_transition(record.as_ref().map(|r| r.state))?;
        Ok(record)
    }

    async fn transition(
        &self,
        mut record: VmRecord,
        state: VmState,
        line: &str,
    ) -> Result<VmRecord, ProviderError> {
        record.state = state;
        record.updated_at = Utc::now();
        self.save(&record).await?;
        self.log_command(&record.vm_id, line).await?;
        Ok(record)
    }

    async fn spawn_hypervisor(&self, record: &VmRecord) -> Result<(), ProviderError> {
        let Some(bin) = &self.hypervisor_bin else {
            return Ok(());
        };
        let dir = self.vm_dir(&record.vm_id);
        let stdout = std::fs::File::create(dir.join("stdout.log"))
            .map_err(|e| runtime_err(&record.vm_id, e))?;
        let stderr = std::fs::File::create(dir.join("stderr.log"))
            .map_err(|e| runtime_err(&record.vm_id, e))?;

        let mut command = std::process::Command::new(bin);
        command
            .arg("--api-socket")
            .arg(dir.join("api.sock"))
            .arg("--cpus")
            .arg(format!("boot={}", record.vcpu_count))
            .arg("--memory")
            .arg(format!("size={}M", record.memory_mib))
            .arg("--serial")
            .arg(format!("file={}", dir.join("console.log").display()))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(kernel) = &record.kernel_image {
            command.arg("--kernel").arg(kernel);
        }
        if let Some(rootfs) = &record.rootfs_image {
            command.arg("--disk").arg(format!("path={rootfs}"));
        }

        let child = command.spawn().map_err(|e| ProviderError::Hypervisor {
            vm_id: record.vm_id.clone(),
            reason: format!("spawn failed: {e}"),
        })?;
        tokio::fs::write(dir.join(PID_FILE), child.id().to_string())
            .await
            .map_err(|e| runtime_err(&record.vm_id, e))?;
        self.children
            .lock()
            .await
            .insert(record.vm_id.clone(), child);
        Ok(())
    }

    async fn kill_hypervisor(&self, vm_id: &str) {
        if let Some(mut child) = self.children.lock().await.remove(vm_id) {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = tokio::fs::remove_file(self.vm_dir(vm_id).join(PID_FILE)).await;
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn current_state(&self, vm_id: &str) -> Result<Option<VmState>, ProviderError> {
        Ok(self.load(vm_id).await?.map(|r| r.state))
    }

    async fn create(
        &self,
        vm_id: &str,
        spec: &CreateSpec,
    ) -> Result<ProviderMessage, ProviderError> {
        self.guard(vm_id, OperationKind::Create).await?;

        let dir = self.vm_dir(vm_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| runtime_err(vm_id, e))?;
        for log in ["console.log", "stdout.log", "stderr.log"] {
            let path = dir.join(log);
            if !path.exists() {
                tokio::fs::write(&path, b"")
                    .await
                    .map_err(|e| runtime_err(vm_id, e))?;
            }
        }

        let now = Utc::now();
        let record = VmRecord {
            vm_id: vm_id.to_owned(),
            state: VmState::Stopped,
            vcpu_count: spec.vcpu_count,
            memory_mib: spec.memory_mib,
            kernel_image: spec.kernel_image.clone(),
            rootfs_image: spec.rootfs_image.clone(),
            created_at: now,
            updated_at: now,
        };
        self.save(&record).await?;
        self.log_command(
            vm_id,
            &format!("create cpus={} memory_mib={}", spec.vcpu_count, spec.memory_mib),
        )
        .await?;
        Ok(format!("created vm '{vm_id}'"))
    }

    async fn start(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        let record = self
            .guard(vm_id, OperationKind::Start)
            .await?
            .ok_or_else(|| runtime_err(vm_id, "record vanished"))?;
        self.spawn_hypervisor(&record).await?;
        self.transition(record, VmState::Running, "start").await?;
        Ok(format!("started vm '{vm_id}'"))
    }

    async fn stop(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        let record = self
            .guard(vm_id, OperationKind::Stop)
            .await?
            .ok_or_else(|| runtime_err(vm_id, "record vanished"))?;
        self.kill_hypervisor(vm_id).await;
        self.transition(record, VmState::Stopped, "stop").await?;
        Ok(format!("stopped vm '{vm_id}'"))
    }

    async fn pause(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        let record = self
            .guard(vm_id, OperationKind::Pause)
            .await?
            .ok_or_else(|| runtime_err(vm_id, "record vanished"))?;
        self.transition(record, VmState::Paused, "pause").await?;
        Ok(format!("paused vm '{vm_id}'"))
    }

    async fn resume(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        let record = self
            .guard(vm_id, OperationKind::Resume)
            .await?
            .ok_or_else(|| runtime_err(vm_id, "record vanished"))?;
        self.transition(record, VmState::Running, "resume").await?;
        Ok(format!("resumed vm '{vm_id}'"))
    }

    async fn delete(&self, vm_id: &str) -> Result<ProviderMessage, ProviderError> {
        let Some(record) = self.guard(vm_id, OperationKind::Delete).await? else {
            return Ok(format!("vm '{vm_id}' not present"));
        };
        if record.state == VmState::Deleted {
            return Ok(format!("vm '{vm_id}' not present"));
        }
        self.kill_hypervisor(vm_id).await;
        self.transition(record, VmState::Deleted, "delete").await?;
        Ok(format!("deleted vm '{vm_id}'"))
    }

    async fn snapshot(
        &self,
        vm_id: &str,
        destination: &str,
    ) -> Result<ProviderMessage, ProviderError> {
        let record = self
            .guard(vm_id, OperationKind::Snapshot)
            .await?
            .ok_or_else(|| runtime_err(vm_id, "record vanished"))?;
        if let Some(parent) = Path::new(destination).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| runtime_err(vm_id, e))?;
        }
        let manifest = serde_json::json!({
            "vm_id": record.vm_id,
            "state": record.state,
            "taken_at": Utc::now(),
        });
        tokio::fs::write(destination, manifest.to_string())
            .await
            .map_err(|e| runtime_err(vm_id, e))?;
        self.log_command(vm_id, &format!("snapshot destination={destination}"))
            .await?;
        Ok(format!("snapshot of '{vm_id}' written to {destination}"))
    }

    async fn execute(
        &self,
        vm_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProviderMessage, ProviderError> {
        self.guard(vm_id, OperationKind::Execute).await?;
        self.log_command(vm_id, &format!("execute {} {}", command, args.join(" ")))
            .await?;
        Ok(format!("executed '{command}' in vm '{vm_id}'"))
    }

    async fn process_id(&self, vm_id: &str) -> Result<Option<u32>, ProviderError> {
        if let Some(child) = self.children.lock().await.get(vm_id) {
            return Ok(Some(child.id()));
        }
        match tokio::fs::read_to_string(self.vm_dir(vm_id).join(PID_FILE)).await {
            Ok(pid) => Ok(pid.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(runtime_err(vm_id, e)),
        }
    }

    async fn inventory(&self) -> Result<Vec<(String, VmState)>, ProviderError> {
        let mut vms = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.runtime_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vms),
            Err(e) => return Err(runtime_err("<runtime>", e)),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let vm_id = entry.file_name().to_string_lossy().into_owned();
            if let Some(record) = self.load(&vm_id).await? {
                vms.push((record.vm_id, record.state));
            }
        }
        vms.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider(dir: &Path) -> LocalProvider {
        LocalProvider::new(dir.to_path_buf(), None)
    }

    fn spec() -> CreateSpec {
        CreateSpec {
            vcpu_count: 2,
            memory_mib: 512,
            kernel_image: None,
            rootfs_image: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_walks_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());

        p.create("vm1", &spec()).await.unwrap();
        assert_eq!(p.current_state("vm1").await.unwrap(), Some(VmState::Stopped));

        p.start("vm1").await.unwrap();
        assert_eq!(p.current_state("vm1").await.unwrap(), Some(VmState::Running));

        p.pause("vm1").await.unwrap();
        p.resume("vm1").await.unwrap();
        p.stop("vm1").await.unwrap();
        p.delete("vm1").await.unwrap();
        assert_eq!(p.current_state("vm1").await.unwrap(), Some(VmState::Deleted));
    }

    #[tokio::test]
    async fn invalid_transitions_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());

        // Start before create.
        let err = p.start("ghost").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidState(_)));

        p.create("vm1", &spec()).await.unwrap();
        // Stop while stopped.
        let err = p.stop("vm1").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidState(_)));
        // Create twice.
        let err = p.create("vm1", &spec()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidState(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());

        let message = p.delete("never-existed").await.unwrap();
        assert!(message.contains("not present"));

        p.create("vm1", &spec()).await.unwrap();
        p.delete("vm1").await.unwrap();
        let message = p.delete("vm1").await.unwrap();
        assert!(message.contains("not present"));
    }

    #[tokio::test]
    async fn runtime_dir_layout_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        p.create("vm1", &spec()).await.unwrap();

        let vm_dir = dir.path().join("vm1");
        assert!(vm_dir.join("state.json").exists());
        assert!(vm_dir.join("commands.log").exists());
        assert!(vm_dir.join("console.log").exists());
        assert!(vm_dir.join("stdout.log").exists());
        assert!(vm_dir.join("stderr.log").exists());
    }

    #[tokio::test]
    async fn state_survives_provider_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = provider(dir.path());
            p.create("vm1", &spec()).await.unwrap();
            p.start("vm1").await.unwrap();
        }
        let p = provider(dir.path());
        assert_eq!(p.current_state("vm1").await.unwrap(), Some(VmState::Running));
        let inventory = p.inventory().await.unwrap();
        assert_eq!(inventory, vec![("vm1".to_owned(), VmState::Running)]);
    }

    #[tokio::test]
    async fn snapshot_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        p.create("vm1", &spec()).await.unwrap();

        let dest = dir.path().join("snaps").join("vm1.snap");
        p.snapshot("vm1", &dest.to_string_lossy()).await.unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn create_after_delete_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        p.create("vm1", &spec()).await.unwrap();
        p.delete("vm1").await.unwrap();
        p.create("vm1", &spec()).await.unwrap();
        assert_eq!(p.current_state("vm1").await.unwrap(), Some(VmState::Stopped));
    }
}
