//! Internal certificate authority and revocation list.
//!
//! The control plane signs every agent's client certificate. Pure-Rust
//! certificate handling via `rcgen` — no OpenSSL. The issued subject encodes
//! the agent identity (`O=tenant_id, OU=site_id, CN=agent_id`) so the mTLS
//! boundary can resolve a verified leaf back to an agent row without a
//! lookup table.
//!
//! In development, a fresh ephemeral CA is generated at startup. Production
//! must supply persistent material; startup fails when
//! `REQUIRE_PERSISTENT_PKI` is set and none is configured.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, CrlDistributionPoint, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, RevocationReason, RevokedCertParams,
    SerialNumber,
};
use uuid::Uuid;
use x509_parser::prelude::{FromDer, X509Certificate};

use nkudo_store::CrlEntry;

/// Errors from PKI operations.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// Persistent material was required but not configured or unreadable.
    #[error("persistent PKI material unavailable: {reason}")]
    MaterialUnavailable { reason: String },

    /// The presented CSR could not be parsed or its signature is invalid.
    #[error("CSR rejected: {reason}")]
    CsrRejected { reason: String },

    /// Certificate or CRL generation failed.
    #[error("certificate generation failed: {reason}")]
    CertGeneration { reason: String },

    /// A presented client certificate failed verification.
    #[error("client certificate rejected: {reason}")]
    Verification { reason: String },

    /// The leaf's subject does not encode a valid agent identity.
    #[error("certificate subject invalid: {reason}")]
    SubjectInvalid { reason: String },
}

/// The identity a client certificate's subject encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSubject {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub agent_id: Uuid,
}

/// A freshly issued certificate.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    /// Lowercase hex serial, matching what the leaf carries on the wire.
    pub serial: String,
    pub expires_at: DateTime<Utc>,
}

/// A successfully verified client certificate.
#[derive(Debug, Clone)]
pub struct VerifiedClient {
    pub subject: AgentSubject,
    pub serial: String,
}

/// The internal CA.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    cert_ttl: Duration,
    crl_url: String,
    ephemeral: bool,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ephemeral", &self.ephemeral)
            .finish_non_exhaustive()
    }
}

/// Generate a DER-safe random serial: 16 bytes of CSPRNG with the first
/// byte forced positive and nonzero so the INTEGER encoding is exactly the
/// bytes we recorded. Returns the raw bytes and their hex form.
#[must_use]
pub fn random_serial() -> (Vec<u8>, String) {
    let mut bytes = Uuid::new_v4().as_bytes().to_vec();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    let hex = hex::encode(&bytes);
    (bytes, hex)
}

fn ttl_to_time(ttl: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

impl CertificateAuthority {
    /// Load the persistent CA, or generate an ephemeral one.
    ///
    /// # Errors
    ///
    /// - [`PkiError::MaterialUnavailable`] when `require_persistent` is set
    ///   and no (or unreadable) material is configured.
    /// - [`PkiError::CertGeneration`] on key/cert construction failure.
    pub fn load_or_generate(
        ca_cert_file: Option<&str>,
        ca_key_file: Option<&str>,
        require_persistent: bool,
        cert_ttl: Duration,
        crl_url: String,
    ) -> Result<Self, PkiError> {
        match (ca_cert_file, ca_key_file) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
                    PkiError::MaterialUnavailable {
                        reason: format!("reading {cert_path}: {e}"),
                    }
                })?;
                let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
                    PkiError::MaterialUnavailable {
                        reason: format!("reading {key_path}: {e}"),
                    }
                })?;
                Self::from_pem(&cert_pem, &key_pem, cert_ttl, crl_url)
            }
            _ if require_persistent => Err(PkiError::MaterialUnavailable {
                reason: "REQUIRE_PERSISTENT_PKI is set but NKUDO_CA_CERT_FILE / NKUDO_CA_KEY_FILE are not configured".to_owned(),
            }),
            _ => {
                tracing::warn!("no persistent CA configured — generating ephemeral development CA");
                Self::generate_ephemeral(cert_ttl, crl_url)
            }
        }
    }

    /// Generate a fresh self-signed CA valid for ten years.
    fn generate_ephemeral(cert_ttl: Duration, crl_url: String) -> Result<Self, PkiError> {
        let ca_key = KeyPair::generate().map_err(|e| PkiError::CertGeneration {
            reason: format!("CA key generation failed: {e}"),
        })?;
        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| PkiError::CertGeneration {
                reason: format!("CA params failed: {e}"),
            })?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "nkudo internal ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(3650);
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CA self-signing failed: {e}"),
            })?;
        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = ca_cert.der().as_ref().to_vec();
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            ca_cert_der,
            cert_ttl,
            crl_url,
            ephemeral: true,
        })
    }

    /// Reconstruct the CA from persisted PEM material.
    fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        cert_ttl: Duration,
        crl_url: String,
    ) -> Result<Self, PkiError> {
        let ca_key = KeyPair::from_pem(key_pem).map_err(|e| PkiError::MaterialUnavailable {
            reason: format!("CA key parse failed: {e}"),
        })?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| {
            PkiError::MaterialUnavailable {
                reason: format!("CA certificate parse failed: {e}"),
            }
        })?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CA reconstruction failed: {e}"),
            })?;
        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = ca_cert.der().as_ref().to_vec();
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            ca_cert_der,
            cert_ttl,
            crl_url,
            ephemeral: false,
        })
    }

    /// The CA certificate in PEM form (pinned by agents at enrollment).
    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Whether this CA was generated ephemerally at startup.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Syntactic pre-validation of a CSR, used to reject bad requests
    /// before any state is touched.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CsrRejected`] if the CSR fails to parse.
    pub fn validate_csr(csr_pem: &str) -> Result<(), PkiError> {
        CertificateSigningRequestParams::from_pem(csr_pem)
            .map(|_| ())
            .map_err(|e| PkiError::CsrRejected {
                reason: format!("CSR parse failed: {e}"),
            })
    }

    /// Sign a CSR into a client certificate for the given agent identity.
    ///
    /// The CSR's subject is replaced wholesale — the caller-supplied CSR
    /// only contributes the public key. The serial is chosen by the caller
    /// (via [`random_serial`]) so it can be recorded in the same
    /// transaction that creates the agent row. The issued certificate
    /// carries the CRL distribution point and a client-auth EKU.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CsrRejected`] if the CSR fails to parse or verify.
    /// - [`PkiError::CertGeneration`] on signing failure.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        subject: &AgentSubject,
        serial_bytes: Vec<u8>,
    ) -> Result<IssuedCert, PkiError> {
        let mut csr =
            CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
                PkiError::CsrRejected {
                    reason: format!("CSR parse failed: {e}"),
                }
            })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, subject.tenant_id.to_string());
        dn.push(DnType::OrganizationalUnitName, subject.site_id.to_string());
        dn.push(DnType::CommonName, subject.agent_id.to_string());
        csr.params.distinguished_name = dn;

        let serial = hex::encode(&serial_bytes);
        csr.params.serial_number = Some(SerialNumber::from(serial_bytes));

        let now = time::OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::minutes(5);
        csr.params.not_after = now + ttl_to_time(self.cert_ttl);
        csr.params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        csr.params.crl_distribution_points = vec![CrlDistributionPoint {
            uris: vec![format!("{}/v1/crl", self.crl_url)],
        }];

        let cert = csr
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("leaf signing failed: {e}"),
            })?;

        let expires_at = Utc::now()
            + chrono::Duration::seconds(i64::try_from(self.cert_ttl.as_secs()).unwrap_or(i64::MAX));
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            serial,
            expires_at,
        })
    }

    /// Verify a forwarded client-certificate PEM against this CA.
    ///
    /// Checks the signature chain, the validity window, and decodes the
    /// subject-encoded agent identity. Revocation is the caller's check —
    /// this function has no CRL knowledge.
    ///
    /// # Errors
    ///
    /// - [`PkiError::Verification`] on parse, expiry, or signature failure.
    /// - [`PkiError::SubjectInvalid`] when the subject fields are missing
    ///   or are not UUIDs.
    pub fn verify_client_cert(&self, leaf_pem: &str) -> Result<VerifiedClient, PkiError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes()).map_err(|e| {
            PkiError::Verification {
                reason: format!("PEM parse failed: {e}"),
            }
        })?;
        let (_, leaf) =
            X509Certificate::from_der(&pem.contents).map_err(|e| PkiError::Verification {
                reason: format!("DER parse failed: {e}"),
            })?;

        if !leaf.validity().is_valid() {
            return Err(PkiError::Verification {
                reason: "certificate outside its validity window".to_owned(),
            });
        }

        let (_, ca) =
            X509Certificate::from_der(&self.ca_cert_der).map_err(|e| PkiError::Verification {
                reason: format!("CA DER parse failed: {e}"),
            })?;
        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| PkiError::Verification {
                reason: format!("signature verification failed: {e}"),
            })?;

        let subject = leaf.subject();
        let parse_uuid = |value: Option<&str>, field: &str| {
            value
                .and_then(|v| Uuid::parse_str(v).ok())
                .ok_or_else(|| PkiError::SubjectInvalid {
                    reason: format!("missing or malformed {field}"),
                })
        };
        let tenant_id = parse_uuid(
            subject
                .iter_organization()
                .next()
                .and_then(|a| a.as_str().ok()),
            "O (tenant id)",
        )?;
        let site_id = parse_uuid(
            subject
                .iter_organizational_unit()
                .next()
                .and_then(|a| a.as_str().ok()),
            "OU (site id)",
        )?;
        let agent_id = parse_uuid(
            subject
                .iter_common_name()
                .next()
                .and_then(|a| a.as_str().ok()),
            "CN (agent id)",
        )?;

        Ok(VerifiedClient {
            subject: AgentSubject {
                tenant_id,
                site_id,
                agent_id,
            },
            serial: hex::encode(leaf.raw_serial()),
        })
    }

    /// Sign a revocation list over the given entries.
    ///
    /// `NextUpdate` is 24 hours out; the CRL number must increase on every
    /// regeneration.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] on signing failure.
    pub fn sign_crl(
        &self,
        entries: &[CrlEntry],
        crl_number: u64,
    ) -> Result<SignedCrl, PkiError> {
        let now = time::OffsetDateTime::now_utc();
        let revoked_certs = entries
            .iter()
            .map(|entry| {
                let serial_bytes = hex::decode(&entry.serial).unwrap_or_default();
                RevokedCertParams {
                    serial_number: SerialNumber::from(serial_bytes),
                    revocation_time: time::OffsetDateTime::from_unix_timestamp(
                        entry.revoked_at.timestamp(),
                    )
                    .unwrap_or(now),
                    reason_code: Some(match entry.reason.as_str() {
                        "superseded" => RevocationReason::Superseded,
                        _ => RevocationReason::CessationOfOperation,
                    }),
                    invalidity_date: None,
                }
            })
            .collect();

        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + time::Duration::hours(24),
            crl_number: SerialNumber::from(crl_number.to_be_bytes().to_vec()),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params
            .signed_by(&self.ca_cert, &self.ca_key)
            .map_err(|e| PkiError::CertGeneration {
                reason: format!("CRL signing failed: {e}"),
            })?;
        let pem = crl.pem().map_err(|e| PkiError::CertGeneration {
            reason: format!("CRL PEM encoding failed: {e}"),
        })?;
        let der = crl.der().as_ref().to_vec();
        Ok(SignedCrl { der, pem })
    }
}

/// A signed CRL in both served encodings.
#[derive(Debug, Clone)]
pub struct SignedCrl {
    pub der: Vec<u8>,
    pub pem: String,
}

/// The in-memory revocation set plus the currently served signed CRL.
///
/// Read-mostly: every agent-scoped request checks membership; writes only
/// happen on revocation, which also re-signs the served CRL.
pub struct CrlService {
    revoked: RwLock<HashMap<String, CrlEntry>>,
    signed: RwLock<SignedCrl>,
    crl_number: AtomicU64,
}

impl std::fmt::Debug for CrlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrlService").finish_non_exhaustive()
    }
}

impl CrlService {
    /// Build the service from persisted entries and sign the initial CRL.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if the initial signing fails.
    pub fn new(ca: &CertificateAuthority, entries: Vec<CrlEntry>) -> Result<Self, PkiError> {
        let signed = ca.sign_crl(&entries, 1)?;
        let revoked = entries
            .into_iter()
            .map(|e| (e.serial.clone(), e))
            .collect();
        Ok(Self {
            revoked: RwLock::new(revoked),
            signed: RwLock::new(signed),
            crl_number: AtomicU64::new(1),
        })
    }

    /// Whether a serial is revoked.
    #[must_use]
    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked
            .read()
            .map(|set| set.contains_key(serial))
            .unwrap_or(true)
    }

    /// Record a revocation and re-sign the served CRL.
    ///
    /// Idempotent on serial. The caller persists the entry to the store.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertGeneration`] if re-signing fails; the
    /// in-memory set is still updated so enforcement is never lost.
    pub fn revoke(&self, ca: &CertificateAuthority, entry: CrlEntry) -> Result<(), PkiError> {
        let entries: Vec<CrlEntry> = {
            let Ok(mut set) = self.revoked.write() else {
                return Err(PkiError::CertGeneration {
                    reason: "revocation set lock poisoned".to_owned(),
                });
            };
            set.entry(entry.serial.clone()).or_insert(entry);
            set.values().cloned().collect()
        };
        let number = self.crl_number.fetch_add(1, Ordering::SeqCst) + 1;
        let signed = ca.sign_crl(&entries, number)?;
        if let Ok(mut current) = self.signed.write() {
            *current = signed;
        }
        Ok(())
    }

    /// The served CRL, DER-encoded.
    #[must_use]
    pub fn der(&self) -> Vec<u8> {
        self.signed.read().map(|s| s.der.clone()).unwrap_or_default()
    }

    /// The served CRL, PEM-encoded.
    #[must_use]
    pub fn pem(&self) -> String {
        self.signed.read().map(|s| s.pem.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::load_or_generate(
            None,
            None,
            false,
            Duration::from_secs(3600),
            "https://cp.example".to_owned(),
        )
        .unwrap()
    }

    fn test_csr() -> (KeyPair, String) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let csr = params.serialize_request(&key).unwrap();
        (key, csr.pem().unwrap())
    }

    fn subject() -> AgentSubject {
        AgentSubject {
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn require_persistent_without_material_fails() {
        let result = CertificateAuthority::load_or_generate(
            None,
            None,
            true,
            Duration::from_secs(3600),
            "https://cp.example".to_owned(),
        );
        assert!(matches!(
            result,
            Err(PkiError::MaterialUnavailable { .. })
        ));
    }

    #[test]
    fn signed_cert_verifies_and_roundtrips_subject() {
        let ca = test_ca();
        let (_, csr_pem) = test_csr();
        let wanted = subject();

        let issued = ca.sign_csr(&csr_pem, &wanted, random_serial().0).unwrap();
        let verified = ca.verify_client_cert(&issued.cert_pem).unwrap();
        assert_eq!(verified.subject, wanted);
        assert_eq!(verified.serial, issued.serial);
    }

    #[test]
    fn cert_from_foreign_ca_is_rejected() {
        let ca = test_ca();
        let foreign = test_ca();
        let (_, csr_pem) = test_csr();

        let issued = foreign.sign_csr(&csr_pem, &subject(), random_serial().0).unwrap();
        let result = ca.verify_client_cert(&issued.cert_pem);
        assert!(matches!(result, Err(PkiError::Verification { .. })));
    }

    #[test]
    fn garbage_csr_is_rejected() {
        let ca = test_ca();
        let result = ca.sign_csr("not a csr", &subject(), random_serial().0);
        assert!(matches!(result, Err(PkiError::CsrRejected { .. })));
    }

    #[test]
    fn garbage_client_cert_is_rejected() {
        let ca = test_ca();
        let result = ca.verify_client_cert("-----BEGIN CERTIFICATE-----\nzzzz\n-----END CERTIFICATE-----\n");
        assert!(result.is_err());
    }

    #[test]
    fn serials_are_unique_and_stable() {
        let ca = test_ca();
        let (_, csr_pem) = test_csr();
        let a = ca.sign_csr(&csr_pem, &subject(), random_serial().0).unwrap();
        let b = ca.sign_csr(&csr_pem, &subject(), random_serial().0).unwrap();
        assert_ne!(a.serial, b.serial);
        assert_eq!(a.serial.len(), 32);
    }

    #[test]
    fn crl_tracks_revocations() {
        let ca = test_ca();
        let crl = CrlService::new(&ca, vec![]).unwrap();
        assert!(!crl.is_revoked("aa01"));

        crl.revoke(
            &ca,
            CrlEntry {
                serial: "aa01".to_owned(),
                revoked_at: Utc::now(),
                reason: "unenrolled".to_owned(),
                agent_id: Uuid::new_v4(),
            },
        )
        .unwrap();
        assert!(crl.is_revoked("aa01"));
        assert!(!crl.der().is_empty());
        assert!(crl.pem().contains("BEGIN X509 CRL"));
    }

    #[test]
    fn crl_revocation_is_idempotent() {
        let ca = test_ca();
        let crl = CrlService::new(&ca, vec![]).unwrap();
        let entry = CrlEntry {
            serial: "bb02".to_owned(),
            revoked_at: Utc::now(),
            reason: "superseded".to_owned(),
            agent_id: Uuid::new_v4(),
        };
        crl.revoke(&ca, entry.clone()).unwrap();
        crl.revoke(&ca, entry).unwrap();
        assert!(crl.is_revoked("bb02"));
    }

    #[test]
    fn issued_cert_carries_crl_distribution_point() {
        let ca = test_ca();
        let (_, csr_pem) = test_csr();
        let issued = ca.sign_csr(&csr_pem, &subject(), random_serial().0).unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        let has_cdp = cert
            .extensions()
            .iter()
            .any(|ext| ext.oid == x509_parser::oid_registry::OID_X509_EXT_CRL_DISTRIBUTION_POINTS);
        assert!(has_cdp);
    }
}
