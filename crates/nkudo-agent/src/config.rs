//! Agent configuration.
//!
//! Everything is settable via CLI flags with environment fallbacks (clap's
//! `env` feature), so the same binary works interactively and under
//! systemd.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct AgentConfig {
    /// Control-plane base URL.
    #[arg(long, env = "NKUDO_CONTROL_PLANE_URL", default_value = "https://127.0.0.1:8440")]
    pub control_plane_url: String,

    /// Directory for persisted agent state (`edge-state.json`).
    #[arg(long, env = "NKUDO_AGENT_STATE_DIR", default_value = "/var/lib/nkudo")]
    pub state_dir: PathBuf,

    /// Directory for the client key, certificate, and pinned CA.
    #[arg(long, env = "NKUDO_AGENT_PKI_DIR", default_value = "/var/lib/nkudo/pki")]
    pub pki_dir: PathBuf,

    /// Directory for per-VM runtime state.
    #[arg(long, env = "NKUDO_AGENT_RUNTIME_DIR", default_value = "/var/lib/nkudo/runtime")]
    pub runtime_dir: PathBuf,

    /// Path to the cloud-hypervisor binary; when unset, the provider runs
    /// in state-only mode (no real VMs are spawned).
    #[arg(long, env = "NKUDO_HYPERVISOR_BIN")]
    pub hypervisor_bin: Option<PathBuf>,

    /// Override the heartbeat interval the control plane returns.
    #[arg(long, env = "NKUDO_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Default per-action provider budget when the plan does not set one.
    #[arg(long, env = "NKUDO_ACTION_TIMEOUT", default_value = "120")]
    pub action_timeout_secs: u64,

    /// Skip TLS verification of the control plane (development only).
    #[arg(long, env = "NKUDO_INSECURE_TLS", default_value = "false")]
    pub insecure_tls: bool,
}

impl AgentConfig {
    /// The default per-action timeout as a `Duration`.
    #[must_use]
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs.max(1))
    }
}

/// Operation-level deadlines for control-plane calls.
pub mod deadlines {
    use std::time::Duration;

    pub const HEARTBEAT: Duration = Duration::from_secs(15);
    pub const DISPATCH: Duration = Duration::from_secs(30);
    pub const RENEWAL: Duration = Duration::from_secs(10);
    pub const ENROLL: Duration = Duration::from_secs(30);
}
