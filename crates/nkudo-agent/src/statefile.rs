//! Persisted agent state.
//!
//! One JSON document holds the agent's identity and the action cache. It
//! lives at `<state_dir>/edge-state.json`, or
//! `<state_dir>/edge-state-encrypted.json` when `NKUDO_STATE_KEY` is set.
//! The encrypted form is `version(1) || nonce(12) || ciphertext || tag(16)`
//! under AES-256-GCM; the key is 32 raw bytes or their base64 encoding.
//!
//! Writes go through a temp file and an atomic rename, and every mutation
//! persists before the caller observes it — a crash can lose an in-flight
//! action but never corrupt the file or un-record a settled outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;

/// Plaintext state file name.
pub const STATE_FILE: &str = "edge-state.json";
/// Encrypted state file name (when `NKUDO_STATE_KEY` is set).
pub const STATE_FILE_ENCRYPTED: &str = "edge-state-encrypted.json";

/// Env var holding the state encryption key.
pub const STATE_KEY_ENV: &str = "NKUDO_STATE_KEY";

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The outcome of one settled action, cached forever by `action_id`.
///
/// Failed outcomes are cached too: replaying a failed `action_id` returns
/// the recorded failure instead of re-invoking the provider. Retrying
/// requires a new plan with a new action id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedOutcome {
    pub action_id: String,
    /// `true` for ok, `false` for fail.
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The enrolled identity returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub refresh_token: String,
    pub cert_serial: String,
    pub heartbeat_endpoint: String,
    pub heartbeat_interval_sec: u64,
}

/// Everything the agent persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Monotonic heartbeat counter (informational on the wire).
    #[serde(default)]
    pub heartbeat_seq: u64,
    /// Terminal outcomes by `action_id`.
    #[serde(default)]
    pub action_cache: BTreeMap<String, CachedOutcome>,
}

/// Handle over the on-disk state: loads once, persists on every mutation.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    key: Option<[u8; 32]>,
    state: AgentState,
}

fn parse_state_key(raw: &str) -> Result<[u8; 32], StateError> {
    let bytes = if raw.len() == 32 {
        raw.as_bytes().to_vec()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| StateError::InvalidKey {
                reason: format!("not 32 raw bytes and base64 decode failed: {e}"),
            })?
    };
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| StateError::InvalidKey {
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

fn io_err(path: &Path, e: &std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

impl StateStore {
    /// Open (or initialize) the state store under `state_dir`, using the
    /// encrypted form when `NKUDO_STATE_KEY` is present in the
    /// environment.
    ///
    /// # Errors
    ///
    /// Propagates key parsing, I/O, and decryption failures.
    pub fn open(state_dir: &Path) -> Result<Self, StateError> {
        let key = match std::env::var(STATE_KEY_ENV) {
            Ok(raw) if !raw.is_empty() => Some(parse_state_key(&raw)?),
            _ => None,
        };
        Self::open_with_key(state_dir, key)
    }

    /// Open with an explicit key (tests inject keys directly).
    ///
    /// # Errors
    ///
    /// Propagates I/O and decryption failures.
    pub fn open_with_key(state_dir: &Path, key: Option<[u8; 32]>) -> Result<Self, StateError> {
        std::fs::create_dir_all(state_dir).map_err(|e| io_err(state_dir, &e))?;
        let file = if key.is_some() {
            STATE_FILE_ENCRYPTED
        } else {
            STATE_FILE
        };
        let path = state_dir.join(file);

        let state = if path.exists() {
            let raw = std::fs::read(&path).map_err(|e| io_err(&path, &e))?;
            let plaintext = match key {
                Some(key) => decrypt_state(&key, &raw)?,
                None => raw,
            };
            serde_json::from_slice(&plaintext).map_err(|e| StateError::Serialization {
                reason: e.to_string(),
            })?
        } else {
            AgentState::default()
        };

        Ok(Self { path, key, state })
    }

    /// The current state (read-only view).
    #[must_use]
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// The enrolled identity.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotEnrolled`] when no identity is persisted.
    pub fn identity(&self) -> Result<&Identity, StateError> {
        self.state.identity.as_ref().ok_or(StateError::NotEnrolled)
    }

    /// Record the enrolled identity.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn set_identity(&mut self, identity: Identity) -> Result<(), StateError> {
        self.state.identity = Some(identity);
        self.persist()
    }

    /// Record a rotated certificate serial.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn set_cert_serial(&mut self, serial: &str) -> Result<(), StateError> {
        if let Some(identity) = self.state.identity.as_mut() {
            identity.cert_serial = serial.to_owned();
        }
        self.persist()
    }

    /// Drop the identity (unenrollment). The action cache survives — a
    /// re-enrolled host must still refuse to replay old action ids.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn clear_identity(&mut self) -> Result<(), StateError> {
        self.state.identity = None;
        self.persist()
    }

    /// Next heartbeat sequence number (persisted so restarts keep
    /// increasing it).
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn next_heartbeat_seq(&mut self) -> Result<u64, StateError> {
        self.state.heartbeat_seq = self.state.heartbeat_seq.wrapping_add(1);
        self.persist()?;
        Ok(self.state.heartbeat_seq)
    }

    /// Look up a cached action outcome.
    #[must_use]
    pub fn cached_outcome(&self, action_id: &str) -> Option<&CachedOutcome> {
        self.state.action_cache.get(action_id)
    }

    /// Record a settled action outcome. First write wins — the cache is
    /// authoritative and terminal outcomes never change.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn record_outcome(&mut self, outcome: CachedOutcome) -> Result<(), StateError> {
        if self.state.action_cache.contains_key(&outcome.action_id) {
            return Ok(());
        }
        self.state
            .action_cache
            .insert(outcome.action_id.clone(), outcome);
        self.persist()
    }

    /// Write the state to disk: temp file, then atomic rename.
    fn persist(&self) -> Result<(), StateError> {
        let plaintext =
            serde_json::to_vec_pretty(&self.state).map_err(|e| StateError::Serialization {
                reason: e.to_string(),
            })?;
        let bytes = match self.key {
            Some(key) => encrypt_state(&key, &plaintext)?,
            None => plaintext,
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, &e))?;
        set_owner_only(&tmp)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, &e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), StateError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, &e))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), StateError> {
    Ok(())
}

fn encrypt_state(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StateError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| StateError::Serialization {
            reason: format!("encryption failed: {e}"),
        })?;

    // version || nonce || ciphertext (tag appended by aes-gcm)
    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_state(key: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, StateError> {
    if blob.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(StateError::Decryption {
            reason: format!("blob too short: {} bytes", blob.len()),
        });
    }
    if blob[0] != FORMAT_VERSION {
        return Err(StateError::Decryption {
            reason: format!("unsupported format version {}", blob[0]),
        });
    }
    let (nonce_bytes, ciphertext) = blob[1..].split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| StateError::Decryption {
            reason: format!("authentication failed: {e}"),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            agent_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            refresh_token: "nkrt_x".to_owned(),
            cert_serial: "aa01".to_owned(),
            heartbeat_endpoint: "https://cp/v1/heartbeat".to_owned(),
            heartbeat_interval_sec: 30,
        }
    }

    fn outcome(action_id: &str, ok: bool) -> CachedOutcome {
        CachedOutcome {
            action_id: action_id.to_owned(),
            ok,
            message: "done".to_owned(),
            error_code: if ok { None } else { Some("PROVIDER_ERROR".to_owned()) },
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open_with_key(dir.path(), None).unwrap();
        store.set_identity(identity()).unwrap();
        store.record_outcome(outcome("p1:a", true)).unwrap();

        let reopened = StateStore::open_with_key(dir.path(), None).unwrap();
        assert!(reopened.identity().is_ok());
        assert!(reopened.cached_outcome("p1:a").unwrap().ok);
    }

    #[test]
    fn encrypted_state_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let key = [7u8; 32];
        let mut store = StateStore::open_with_key(dir.path(), Some(key)).unwrap();
        store.set_identity(identity()).unwrap();

        // On-disk bytes are not plaintext JSON.
        let raw = std::fs::read(dir.path().join(STATE_FILE_ENCRYPTED)).unwrap();
        assert_eq!(raw[0], FORMAT_VERSION);
        assert!(!raw.windows(8).any(|w| w == &b"agent_id"[..]));

        let reopened = StateStore::open_with_key(dir.path(), Some(key)).unwrap();
        assert!(reopened.identity().is_ok());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open_with_key(dir.path(), Some([1u8; 32])).unwrap();
        store.set_identity(identity()).unwrap();

        let result = StateStore::open_with_key(dir.path(), Some([2u8; 32]));
        assert!(matches!(result, Err(StateError::Decryption { .. })));
    }

    #[test]
    fn failed_outcomes_are_cached_and_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open_with_key(dir.path(), None).unwrap();
        store.record_outcome(outcome("p1:a", false)).unwrap();

        // A later, contradictory write does not replace the record.
        store.record_outcome(outcome("p1:a", true)).unwrap();
        let cached = store.cached_outcome("p1:a").unwrap();
        assert!(!cached.ok);
        assert_eq!(cached.error_code.as_deref(), Some("PROVIDER_ERROR"));
    }

    #[test]
    fn cache_survives_unenrollment() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open_with_key(dir.path(), None).unwrap();
        store.set_identity(identity()).unwrap();
        store.record_outcome(outcome("p1:a", true)).unwrap();
        store.clear_identity().unwrap();

        assert!(matches!(store.identity(), Err(StateError::NotEnrolled)));
        assert!(store.cached_outcome("p1:a").is_some());
    }

    #[test]
    fn state_key_parses_raw_and_base64() {
        assert!(parse_state_key("0123456789abcdef0123456789abcdef").is_ok());
        let b64 = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        assert_eq!(parse_state_key(&b64).unwrap(), [9u8; 32]);
        assert!(parse_state_key("short").is_err());
    }

    #[test]
    fn heartbeat_seq_increases_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open_with_key(dir.path(), None).unwrap();
        let a = store.next_heartbeat_seq().unwrap();
        let b = store.next_heartbeat_seq().unwrap();
        assert!(b > a);

        let mut reopened = StateStore::open_with_key(dir.path(), None).unwrap();
        assert!(reopened.next_heartbeat_seq().unwrap() > b);
    }
}
