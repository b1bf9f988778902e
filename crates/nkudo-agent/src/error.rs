//! Error types for the edge agent.

/// Errors from the agent's local state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Filesystem failure reading or writing state.
    #[error("state I/O failed at '{path}': {reason}")]
    Io { path: String, reason: String },

    /// State (de)serialization failed.
    #[error("state serialization failed: {reason}")]
    Serialization { reason: String },

    /// The configured state key is not 32 bytes (raw or base64).
    #[error("invalid state encryption key: {reason}")]
    InvalidKey { reason: String },

    /// The encrypted state blob is malformed or fails authentication.
    #[error("state decryption failed: {reason}")]
    Decryption { reason: String },

    /// The agent has no persisted identity yet.
    #[error("agent is not enrolled — run `nkudo-agent enroll` first")]
    NotEnrolled,
}

/// Errors from the microVM provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The requested transition is not legal from the VM's current state.
    #[error("{0}")]
    InvalidState(#[from] nkudo_types::state::InvalidTransition),

    /// The per-VM runtime directory could not be read or written.
    #[error("runtime I/O failed for vm '{vm_id}': {reason}")]
    Runtime { vm_id: String, reason: String },

    /// The hypervisor process failed to start or respond.
    #[error("hypervisor failure for vm '{vm_id}': {reason}")]
    Hypervisor { vm_id: String, reason: String },
}

impl ProviderError {
    /// The wire error code recorded on the execution for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Runtime { .. } | Self::Hypervisor { .. } => "PROVIDER_ERROR",
        }
    }
}

/// Errors from talking to the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (DNS, TLS, timeout, connection).
    #[error("control plane unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane returned an error body.
    #[error("control plane rejected request: {code} ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// A response body failed to deserialize.
    #[error("malformed control-plane response: {reason}")]
    MalformedResponse { reason: String },

    /// Local TLS identity could not be constructed.
    #[error("client identity unavailable: {reason}")]
    Identity { reason: String },
}
