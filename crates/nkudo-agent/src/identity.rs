//! The agent's PKI material and certificate rotation.
//!
//! The PKI directory holds `client.key`, `client.crt`, and `ca.crt`, all
//! mode 0600. Rotation keeps the existing private key: a fresh CSR is
//! signed by the control plane, the new certificate lands on a side path,
//! a probe request proves the new material authenticates, and only then is
//! it renamed into place. A failed probe leaves the old certificate
//! untouched and the next tick retries.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use nkudo_types::wire::RenewRequest;

use crate::client::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::error::StateError;
use crate::statefile::StateStore;

pub const KEY_FILE: &str = "client.key";
pub const CERT_FILE: &str = "client.crt";
pub const CA_FILE: &str = "ca.crt";
const CERT_SIDE_FILE: &str = "client.crt.next";

/// Cadence of the rotation check.
const ROTATION_TICK: Duration = Duration::from_secs(15 * 60);
/// Floor of the renewal threshold.
const MIN_RENEW_LEAD: chrono::Duration = chrono::Duration::hours(6);

/// Generate a fresh keypair and a CSR for it.
///
/// # Errors
///
/// Returns [`StateError::Serialization`] if key or CSR generation fails.
pub fn generate_keypair_and_csr() -> Result<(String, String), StateError> {
    let key = rcgen::KeyPair::generate().map_err(|e| StateError::Serialization {
        reason: format!("key generation failed: {e}"),
    })?;
    let csr = csr_for_key(&key)?;
    Ok((key.serialize_pem(), csr))
}

/// Build a CSR for an existing private key (rotation path).
///
/// # Errors
///
/// Returns [`StateError::Serialization`] on CSR construction failure.
pub fn csr_for_existing_key(key_pem: &str) -> Result<String, StateError> {
    let key = rcgen::KeyPair::from_pem(key_pem).map_err(|e| StateError::Serialization {
        reason: format!("key parse failed: {e}"),
    })?;
    csr_for_key(&key)
}

fn csr_for_key(key: &rcgen::KeyPair) -> Result<String, StateError> {
    let params =
        rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| StateError::Serialization {
            reason: format!("CSR params failed: {e}"),
        })?;
    let csr = params
        .serialize_request(key)
        .map_err(|e| StateError::Serialization {
            reason: format!("CSR serialization failed: {e}"),
        })?;
    csr.pem().map_err(|e| StateError::Serialization {
        reason: format!("CSR encoding failed: {e}"),
    })
}

/// Write a PKI file with owner-only permissions.
///
/// # Errors
///
/// Propagates I/O failures.
pub fn write_pki_file(dir: &Path, name: &str, contents: &str) -> Result<PathBuf, StateError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, &e))?;
    let path = dir.join(name);
    std::fs::write(&path, contents).map_err(|e| io_err(&path, &e))?;
    set_owner_only(&path)?;
    Ok(path)
}

/// Read a PKI file.
///
/// # Errors
///
/// Propagates I/O failures.
pub fn read_pki_file(dir: &Path, name: &str) -> Result<String, StateError> {
    let path = dir.join(name);
    std::fs::read_to_string(&path).map_err(|e| io_err(&path, &e))
}

fn io_err(path: &Path, e: &std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
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

/// The validity window of a PEM certificate.
///
/// # Errors
///
/// Returns [`StateError::Serialization`] on parse failure.
pub fn cert_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), StateError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
        StateError::Serialization {
            reason: format!("PEM parse failed: {e}"),
        }
    })?;
    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|e| StateError::Serialization {
            reason: format!("DER parse failed: {e}"),
        })?;
    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .unwrap_or_else(Utc::now);
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .unwrap_or_else(Utc::now);
    Ok((not_before, not_after))
}

/// The hex serial of a PEM certificate.
///
/// # Errors
///
/// Returns [`StateError::Serialization`] on parse failure.
pub fn cert_serial(cert_pem: &str) -> Result<String, StateError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| {
        StateError::Serialization {
            reason: format!("PEM parse failed: {e}"),
        }
    })?;
    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|e| StateError::Serialization {
            reason: format!("DER parse failed: {e}"),
        })?;
    Ok(hex::encode(cert.raw_serial()))
}

/// Whether a certificate is due for renewal: remaining lifetime below
/// `max(6h, 20% of total TTL)`.
#[must_use]
pub fn needs_renewal(not_before: DateTime<Utc>, not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let total = not_after - not_before;
    let threshold = std::cmp::max(MIN_RENEW_LEAD, total / 5);
    not_after - now < threshold
}

/// Background certificate rotator.
pub async fn rotation_loop(
    config: AgentConfig,
    state: Arc<Mutex<StateStore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(ROTATION_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("certificate rotator started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = rotation_tick(&config, &state).await {
                    warn!(error = %e, "certificate rotation attempt failed, will retry next tick");
                }
            }
            _ = shutdown.changed() => {
                info!("certificate rotator shutting down");
                return;
            }
        }
    }
}

/// One rotation check. Public so tests can drive it without the ticker.
///
/// # Errors
///
/// Propagates state, client, and I/O failures; any failure leaves the
/// current certificate in place.
pub async fn rotation_tick(
    config: &AgentConfig,
    state: &Arc<Mutex<StateStore>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cert_pem = read_pki_file(&config.pki_dir, CERT_FILE)?;
    let (not_before, not_after) = cert_validity(&cert_pem)?;
    if !needs_renewal(not_before, not_after, Utc::now()) {
        return Ok(());
    }
    info!(expires_at = %not_after, "certificate approaching expiry, renewing");

    let key_pem = read_pki_file(&config.pki_dir, KEY_FILE)?;
    let ca_pem = read_pki_file(&config.pki_dir, CA_FILE)?;
    let refresh_token = {
        let guard = state.lock().map_err(|_| "state lock poisoned")?;
        guard.identity()?.refresh_token.clone()
    };

    let csr_pem = csr_for_existing_key(&key_pem)?;
    let client = ControlPlaneClient::with_identity(
        &config.control_plane_url,
        &key_pem,
        &cert_pem,
        &ca_pem,
        config.insecure_tls,
    )?;
    let renewed = client
        .renew(&RenewRequest {
            refresh_token,
            csr_pem,
        })
        .await?;

    // Stage the new certificate, probe with it, then swap atomically.
    let side_path = write_pki_file(&config.pki_dir, CERT_SIDE_FILE, &renewed.client_certificate_pem)?;
    let probe_client = ControlPlaneClient::with_identity(
        &config.control_plane_url,
        &key_pem,
        &renewed.client_certificate_pem,
        &ca_pem,
        config.insecure_tls,
    )?;
    if let Err(e) = probe_client.probe().await {
        let _ = std::fs::remove_file(&side_path);
        return Err(format!("probe with renewed certificate failed: {e}").into());
    }

    std::fs::rename(&side_path, config.pki_dir.join(CERT_FILE))
        .map_err(|e| io_err(&config.pki_dir.join(CERT_FILE), &e))?;
    {
        let mut guard = state.lock().map_err(|_| "state lock poisoned")?;
        guard.set_cert_serial(&renewed.cert_serial)?;
    }
    info!(serial = %renewed.cert_serial, "certificate rotated");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn keypair_and_csr_generate() {
        let (key_pem, csr_pem) = generate_keypair_and_csr().unwrap();
        assert!(key_pem.contains("PRIVATE KEY"));
        assert!(csr_pem.contains("CERTIFICATE REQUEST"));
        // The same key produces further CSRs (rotation path).
        let again = csr_for_existing_key(&key_pem).unwrap();
        assert!(again.contains("CERTIFICATE REQUEST"));
    }

    #[test]
    fn renewal_threshold_is_max_of_floor_and_fraction() {
        let now = Utc::now();

        // 30-day cert, freshly issued: 20% = 6 days, far from expiry.
        let issued = now - chrono::Duration::hours(1);
        let expires = now + chrono::Duration::days(30);
        assert!(!needs_renewal(issued, expires, now));

        // 30-day cert with 5 days left: under the 6-day (20%) threshold.
        let issued = now - chrono::Duration::days(25);
        let expires = now + chrono::Duration::days(5);
        assert!(needs_renewal(issued, expires, now));

        // Short 12-hour cert with 5 hours left: the 6-hour floor wins
        // over the 20% fraction (2.4 hours).
        let issued = now - chrono::Duration::hours(7);
        let expires = now + chrono::Duration::hours(5);
        assert!(needs_renewal(issued, expires, now));
    }

    #[test]
    fn pki_files_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pki_file(dir.path(), KEY_FILE, "secret").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert_eq!(read_pki_file(dir.path(), KEY_FILE).unwrap(), "secret");
    }
}
