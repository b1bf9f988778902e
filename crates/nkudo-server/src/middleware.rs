//! Authentication middleware for the three caller classes.
//!
//! - **Admin**: `x-admin-key` header, constant-time compared against the
//!   bootstrap credential.
//! - **Tenant**: `Authorization: Bearer nkak_<key id><secret>` — the key id
//!   is embedded in the token so lookup is by id and verification is
//!   against the salted fingerprint.
//! - **Agent**: the TLS-terminating edge forwards the verified leaf in
//!   `x-client-cert` (URL-encoded PEM); the control plane re-verifies it
//!   against the CA, checks the CRL, and resolves the subject-encoded
//!   agent id to a non-unenrolled agent row.
//!
//! All auth failures render as generic 401/403 bodies — the message never
//! says which check failed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use nkudo_types::ErrorCode;
use nkudo_types::audit::ActorType;
use nkudo_types::fingerprint;
use nkudo_types::state::AgentState;

use crate::error::ApiError;
use crate::state::AppState;

/// Correlation id assigned to every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// The authenticated tenant-surface caller.
#[derive(Debug, Clone)]
pub enum Caller {
    Admin,
    Tenant { tenant_id: Uuid, key_id: Uuid },
}

impl Caller {
    /// Admins may act on any tenant; tenant keys only on their own.
    ///
    /// # Errors
    ///
    /// Returns a 403 [`ApiError`] on a cross-tenant attempt.
    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), ApiError> {
        match self {
            Self::Admin => Ok(()),
            Self::Tenant {
                tenant_id: own, ..
            } if *own == tenant_id => Ok(()),
            Self::Tenant { .. } => Err(ApiError::forbidden()),
        }
    }

    /// Whether this caller is the admin credential.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Actor fields for audit events.
    #[must_use]
    pub fn actor(&self) -> (ActorType, String) {
        match self {
            Self::Admin => (ActorType::Admin, "admin".to_owned()),
            Self::Tenant { key_id, .. } => (ActorType::Tenant, key_id.to_string()),
        }
    }
}

/// The authenticated agent, resolved from its client certificate.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub host_id: Uuid,
    pub cert_serial: String,
}

/// Best-effort source address for audit events and rate-limit keys.
#[must_use]
pub fn source_ip(req: &Request) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

/// Assign a request id and echo it in the `x-request-id` response header.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut response = next.run(req).await;
    if let Ok(value) = axum::http::HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn request_id_of(req: &Request) -> Uuid {
    req.extensions()
        .get::<RequestId>()
        .map_or_else(Uuid::new_v4, |r| r.0)
}

fn admin_key_matches(state: &AppState, headers: &HeaderMap) -> bool {
    if state.config.admin_key.is_empty() {
        return false;
    }
    headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| {
            presented
                .as_bytes()
                .ct_eq(state.config.admin_key.as_bytes())
                .into()
        })
}

/// Admin-only surface (`POST /tenants`, `/admin/*`).
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&req);
    if !admin_key_matches(&state, req.headers()) {
        return Err(ApiError::unauthenticated().with_request_id(request_id));
    }
    if let Err(wait) = state.default_limiter.check("admin") {
        return Err(ApiError::rate_limited(wait).with_request_id(request_id));
    }
    req.extensions_mut().insert(Caller::Admin);
    Ok(next.run(req).await)
}

/// Tenant surface: admin key or tenant API key.
pub async fn caller_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&req);

    if admin_key_matches(&state, req.headers()) {
        if let Err(wait) = state.default_limiter.check("admin") {
            return Err(ApiError::rate_limited(wait).with_request_id(request_id));
        }
        req.extensions_mut().insert(Caller::Admin);
        return Ok(next.run(req).await);
    }

    let caller = authenticate_api_key(&state, req.headers())
        .await
        .map_err(|e| e.with_request_id(request_id))?;
    let Caller::Tenant { key_id, .. } = &caller else {
        return Err(ApiError::unauthenticated().with_request_id(request_id));
    };
    if let Err(wait) = state.default_limiter.check(&key_id.to_string()) {
        return Err(ApiError::rate_limited(wait).with_request_id(request_id));
    }
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

async fn authenticate_api_key(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthenticated)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::unauthenticated)?;

    // Key format: nkak_<32 hex key id><64 hex secret>. The embedded id
    // makes lookup O(1); the salted fingerprint still gates acceptance.
    let body = token
        .strip_prefix("nkak_")
        .ok_or_else(ApiError::unauthenticated)?;
    if body.len() < 33 {
        return Err(ApiError::unauthenticated());
    }
    let key_id = Uuid::try_parse(&body[..32]).map_err(|_| ApiError::unauthenticated())?;

    let key = state
        .store
        .find_api_key(key_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(ApiError::unauthenticated)?;

    if let Some(expires_at) = key.expires_at {
        if Utc::now() >= expires_at {
            return Err(ApiError::unauthenticated());
        }
    }
    if !fingerprint::verify_secret(token, &key.key_hash) {
        return Err(ApiError::unauthenticated());
    }

    if let Err(e) = state.store.touch_api_key(key.id, Utc::now()).await {
        tracing::debug!(error = %e, "failed to touch api key");
    }

    Ok(Caller::Tenant {
        tenant_id: key.tenant_id,
        key_id: key.id,
    })
}

/// Agent surface: verify the forwarded client certificate.
pub async fn agent_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request_id_of(&req);
    let identity = authenticate_agent(&state, req.headers())
        .await
        .map_err(|e| e.with_request_id(request_id))?;
    if let Err(wait) = state
        .default_limiter
        .check(&identity.agent_id.to_string())
    {
        return Err(ApiError::rate_limited(wait).with_request_id(request_id));
    }
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

async fn authenticate_agent(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AgentIdentity, ApiError> {
    let encoded = headers
        .get("x-client-cert")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthenticated)?;
    let pem = urlencoding::decode(encoded).map_err(|_| ApiError::unauthenticated())?;

    let verified = state.ca.verify_client_cert(&pem).map_err(|e| {
        tracing::debug!(error = %e, "client certificate verification failed");
        ApiError::unauthenticated()
    })?;

    if state.crl.is_revoked(&verified.serial) {
        return Err(ApiError::new(
            ErrorCode::CertificateRevoked,
            "certificate revoked",
        ));
    }

    let agent = state
        .store
        .get_agent(verified.subject.agent_id)
        .await
        .map_err(|_| ApiError::unauthenticated())?;
    if agent.state == AgentState::Unenrolled {
        return Err(ApiError::unauthenticated());
    }
    if agent.tenant_id != verified.subject.tenant_id || agent.site_id != verified.subject.site_id {
        return Err(ApiError::unauthenticated());
    }

    Ok(AgentIdentity {
        agent_id: agent.id,
        tenant_id: agent.tenant_id,
        site_id: agent.site_id,
        host_id: agent.host_id,
        cert_serial: verified.serial,
    })
}
