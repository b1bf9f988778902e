//! Enrollment, certificate renewal, and unenrollment.
//!
//! Token redemption and agent creation happen inside one store transaction
//! ([`nkudo_store::Store::enroll_agent`]); this module orders the
//! surrounding steps so no failure can leave a consumed token without an
//! agent row: the CSR is validated and rejected *before* the transaction,
//! and the certificate is signed with a pre-chosen serial *after* it.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use nkudo_store::{CrlEntry, EnrollAgent, NewAuditEvent};
use nkudo_types::ErrorCode;
use nkudo_types::audit::ActorType;
use nkudo_types::fingerprint;
use nkudo_types::state::AgentState;
use nkudo_types::wire::{EnrollRequest, EnrollResponse, HostFacts, RenewRequest, RenewResponse};

use crate::error::{ApiError, ApiResult};
use crate::middleware::AgentIdentity;
use crate::pki::{self, AgentSubject};
use crate::state::AppState;

/// Parse the token id embedded in a bearer enrollment token
/// (`nket_<32 hex id><64 hex secret>`).
fn parse_token_id(token: &str) -> Result<Uuid, ApiError> {
    let body = token
        .strip_prefix("nket_")
        .ok_or_else(|| ApiError::new(ErrorCode::TokenInvalid, "enrollment token invalid"))?;
    if body.len() < 33 {
        return Err(ApiError::new(
            ErrorCode::TokenInvalid,
            "enrollment token invalid",
        ));
    }
    Uuid::try_parse(&body[..32])
        .map_err(|_| ApiError::new(ErrorCode::TokenInvalid, "enrollment token invalid"))
}

/// Mint a new enrollment token for a site. Returns the plaintext (shown
/// once) and its id; the caller persists the fingerprint.
#[must_use]
pub fn mint_enrollment_token() -> (Uuid, String) {
    let id = Uuid::new_v4();
    let secret = Uuid::new_v4();
    let plaintext = format!("nket_{}{}{}", id.as_simple(), secret.as_simple(), Uuid::new_v4().as_simple());
    (id, plaintext)
}

/// Mint a new API key (`nkak_<id><secret>`). Returns plaintext and id.
#[must_use]
pub fn mint_api_key() -> (Uuid, String) {
    let id = Uuid::new_v4();
    let plaintext = format!(
        "nkak_{}{}{}",
        id.as_simple(),
        Uuid::new_v4().as_simple(),
        Uuid::new_v4().as_simple()
    );
    (id, plaintext)
}

/// Redeem an enrollment token into a full agent identity.
///
/// # Errors
///
/// - `TOKEN_INVALID` / `TOKEN_EXPIRED` / `TOKEN_ALREADY_USED` (all 401).
/// - `INVALID_REQUEST` (400) for a malformed CSR.
pub async fn enroll(
    state: &Arc<AppState>,
    request: EnrollRequest,
    request_id: Uuid,
    source_ip: Option<String>,
) -> ApiResult<EnrollResponse> {
    let token_id = parse_token_id(&request.enrollment_token)?;

    // Reject bad CSRs before any state is touched.
    pki::CertificateAuthority::validate_csr(&request.csr_pem)
        .map_err(|e| ApiError::invalid(e.to_string()))?;

    let agent_id = Uuid::new_v4();
    let (serial_bytes, serial_hex) = pki::random_serial();
    let refresh_token = fingerprint::generate_secret("nkrt_");

    let facts = HostFacts {
        hostname: request.hostname,
        agent_version: request.agent_version,
        os: request.os,
        arch: request.arch,
        kernel_version: request.kernel_version,
        ..HostFacts::default()
    };

    let outcome = state
        .store
        .enroll_agent(EnrollAgent {
            token_id,
            token_plaintext: request.enrollment_token,
            agent_id,
            cert_serial: serial_hex.clone(),
            refresh_token_hash: fingerprint::hash_secret(&refresh_token),
            facts,
            now: Utc::now(),
        })
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    let subject = AgentSubject {
        tenant_id: outcome.tenant_id,
        site_id: outcome.site_id,
        agent_id,
    };
    let issued = state
        .ca
        .sign_csr(&request.csr_pem, &subject, serial_bytes)
        .map_err(|e| ApiError::internal(e).with_request_id(request_id))?;

    state
        .audit(NewAuditEvent {
            tenant_id: Some(outcome.tenant_id),
            site_id: Some(outcome.site_id),
            actor_type: ActorType::Agent,
            actor_id: agent_id.to_string(),
            action: "agent.enroll".to_owned(),
            resource_type: "agent".to_owned(),
            resource_id: agent_id.to_string(),
            request_id,
            source_ip,
            metadata: serde_json::json!({
                "hostname": outcome.host.hostname,
                "bootstrap_nonce": request.bootstrap_nonce,
                "cert_serial": serial_hex,
            }),
        })
        .await;

    tracing::info!(
        agent_id = %agent_id,
        site_id = %outcome.site_id,
        hostname = %outcome.host.hostname,
        "agent enrolled"
    );

    Ok(EnrollResponse {
        tenant_id: outcome.tenant_id,
        site_id: outcome.site_id,
        host_id: outcome.host.id,
        agent_id,
        client_certificate_pem: issued.cert_pem,
        ca_certificate_pem: state.ca.ca_pem().to_owned(),
        refresh_token,
        heartbeat_endpoint: format!("{}/v1/heartbeat", state.config.public_url),
        heartbeat_interval_sec: state.config.heartbeat_interval.as_secs(),
    })
}

/// Rotate an agent's certificate.
///
/// Authenticated by the current client certificate (middleware) *and* the
/// bearer refresh token. The previous serial is revoked after the
/// configured grace window so in-flight requests are not cut off.
///
/// # Errors
///
/// - `UNAUTHENTICATED` (401) on a refresh-token mismatch.
/// - `INVALID_REQUEST` (400) for a malformed CSR.
pub async fn renew(
    state: &Arc<AppState>,
    identity: &AgentIdentity,
    request: RenewRequest,
    request_id: Uuid,
) -> ApiResult<RenewResponse> {
    let agent = state
        .store
        .get_agent(identity.agent_id)
        .await
        .map_err(|_| ApiError::unauthenticated())?;
    if !fingerprint::verify_secret(&request.refresh_token, &agent.refresh_token_hash) {
        return Err(ApiError::unauthenticated().with_request_id(request_id));
    }

    pki::CertificateAuthority::validate_csr(&request.csr_pem)
        .map_err(|e| ApiError::invalid(e.to_string()))?;

    let (serial_bytes, serial_hex) = pki::random_serial();
    let subject = AgentSubject {
        tenant_id: identity.tenant_id,
        site_id: identity.site_id,
        agent_id: identity.agent_id,
    };
    let issued = state
        .ca
        .sign_csr(&request.csr_pem, &subject, serial_bytes)
        .map_err(|e| ApiError::internal(e).with_request_id(request_id))?;

    state
        .store
        .update_agent_cert(identity.agent_id, &serial_hex)
        .await?;

    // Revoke the replaced serial once the grace window passes.
    let old_serial = agent.cert_serial.clone();
    if old_serial != serial_hex {
        let state = Arc::clone(state);
        let agent_id = identity.agent_id;
        let grace = state.config.revocation_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            revoke_serial(&state, &old_serial, agent_id, "superseded").await;
        });
    }

    state
        .audit(NewAuditEvent {
            tenant_id: Some(identity.tenant_id),
            site_id: Some(identity.site_id),
            actor_type: ActorType::Agent,
            actor_id: identity.agent_id.to_string(),
            action: "agent.renew".to_owned(),
            resource_type: "certificate".to_owned(),
            resource_id: serial_hex.clone(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "replaced_serial": agent.cert_serial }),
        })
        .await;

    Ok(RenewResponse {
        client_certificate_pem: issued.cert_pem,
        ca_certificate_pem: state.ca.ca_pem().to_owned(),
        cert_serial: serial_hex,
    })
}

/// Revoke the agent's certificate and detach it. Idempotent.
pub async fn unenroll(
    state: &Arc<AppState>,
    identity: &AgentIdentity,
    request_id: Uuid,
) -> ApiResult<()> {
    revoke_serial(state, &identity.cert_serial, identity.agent_id, "unenrolled").await;

    state
        .store
        .set_agent_state(identity.agent_id, AgentState::Unenrolled)
        .await?;

    state
        .audit(NewAuditEvent {
            tenant_id: Some(identity.tenant_id),
            site_id: Some(identity.site_id),
            actor_type: ActorType::Agent,
            actor_id: identity.agent_id.to_string(),
            action: "agent.unenroll".to_owned(),
            resource_type: "agent".to_owned(),
            resource_id: identity.agent_id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "revoked_serial": identity.cert_serial }),
        })
        .await;

    tracing::info!(agent_id = %identity.agent_id, "agent unenrolled");
    Ok(())
}

/// Add a serial to the CRL (memory + store). Failures are logged, not
/// propagated — enforcement lives in the in-memory set, which is updated
/// even when re-signing or persistence fails.
async fn revoke_serial(state: &Arc<AppState>, serial: &str, agent_id: Uuid, reason: &str) {
    let entry = CrlEntry {
        serial: serial.to_owned(),
        revoked_at: Utc::now(),
        reason: reason.to_owned(),
        agent_id,
    };
    if let Err(e) = state.crl.revoke(&state.ca, entry.clone()) {
        tracing::warn!(serial, error = %e, "CRL re-signing failed");
    }
    if let Err(e) = state.store.add_crl_entry(entry).await {
        tracing::warn!(serial, error = %e, "CRL persistence failed");
    }
}
