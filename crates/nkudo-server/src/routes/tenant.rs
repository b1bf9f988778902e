//! Tenant surface: API keys, sites, and enrollment tokens.
//!
//! Every handler resolves the path tenant and enforces the caller's scope
//! first — a tenant key used against another tenant's path is a 403 before
//! anything is read.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_store::{NewApiKey, NewAuditEvent, NewEnrollmentToken, NewSite};
use nkudo_types::fingerprint;
use nkudo_types::state::ConnectivityState;

use crate::error::ApiResult;
use crate::middleware::{Caller, RequestId};
use crate::routes::parse_body;
use crate::services::enrollment;
use crate::state::AppState;

// ── API keys ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    /// The plaintext key — returned exactly once.
    pub key: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyView {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// `POST /tenants/{id}/api-keys`
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    caller.require_tenant(tenant_id)?;
    let request: CreateApiKeyRequest = parse_body(body)?;
    state.store.get_tenant(tenant_id).await?;

    let (key_id, plaintext) = enrollment::mint_api_key();
    let key = state
        .store
        .create_api_key(NewApiKey {
            id: key_id,
            tenant_id,
            name: request.name,
            key_hash: fingerprint::hash_secret(&plaintext),
            expires_at: request.expires_at,
        })
        .await?;

    let (actor_type, actor_id) = caller.actor();
    state
        .audit(NewAuditEvent {
            tenant_id: Some(tenant_id),
            site_id: None,
            actor_type,
            actor_id,
            action: "apikey.create".to_owned(),
            resource_type: "api_key".to_owned(),
            resource_id: key.id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "name": key.name }),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: key.id,
            name: key.name,
            key: plaintext,
            created_at: key.created_at,
            expires_at: key.expires_at,
        }),
    ))
}

/// `GET /tenants/{id}/api-keys`
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ApiKeyView>>> {
    caller.require_tenant(tenant_id)?;
    state.store.get_tenant(tenant_id).await?;
    let keys = state.store.list_api_keys(tenant_id).await?;
    Ok(Json(
        keys.into_iter()
            .map(|k| ApiKeyView {
                id: k.id,
                name: k.name,
                created_at: k.created_at,
                expires_at: k.expires_at,
                last_used_at: k.last_used_at,
            })
            .collect(),
    ))
}

/// `DELETE /tenants/{id}/api-keys/{key_id}`
pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path((tenant_id, key_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    caller.require_tenant(tenant_id)?;
    state.store.delete_api_key(tenant_id, key_id).await?;

    let (actor_type, actor_id) = caller.actor();
    state
        .audit(NewAuditEvent {
            tenant_id: Some(tenant_id),
            site_id: None,
            actor_type,
            actor_id,
            action: "apikey.revoke".to_owned(),
            resource_type: "api_key".to_owned(),
            resource_id: key_id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::Value::Null,
        })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

// ── Sites ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSiteRequest {
    pub name: String,
    pub external_key: String,
    pub location_country_code: String,
}

#[derive(Debug, Serialize)]
pub struct SiteView {
    pub id: Uuid,
    pub name: String,
    pub external_key: String,
    pub location_country_code: String,
    pub connectivity_state: ConnectivityState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// `POST /tenants/{id}/sites`
pub async fn create_site(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<SiteView>)> {
    caller.require_tenant(tenant_id)?;
    let request: CreateSiteRequest = parse_body(body)?;
    state.store.get_tenant(tenant_id).await?;

    let site = state
        .store
        .create_site(NewSite {
            tenant_id,
            name: request.name,
            external_key: request.external_key,
            location_country_code: request.location_country_code,
        })
        .await?;

    let (actor_type, actor_id) = caller.actor();
    state
        .audit(NewAuditEvent {
            tenant_id: Some(tenant_id),
            site_id: Some(site.id),
            actor_type,
            actor_id,
            action: "site.create".to_owned(),
            resource_type: "site".to_owned(),
            resource_id: site.id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "name": site.name }),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(SiteView {
            id: site.id,
            name: site.name,
            external_key: site.external_key,
            location_country_code: site.location_country_code,
            connectivity_state: site.connectivity_state,
            last_heartbeat_at: site.last_heartbeat_at,
        }),
    ))
}

/// `GET /tenants/{id}/sites`
pub async fn list_sites(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SiteView>>> {
    caller.require_tenant(tenant_id)?;
    state.store.get_tenant(tenant_id).await?;
    let sites = state.store.list_sites(tenant_id).await?;
    Ok(Json(
        sites
            .into_iter()
            .map(|s| SiteView {
                id: s.id,
                name: s.name,
                external_key: s.external_key,
                location_country_code: s.location_country_code,
                connectivity_state: s.connectivity_state,
                last_heartbeat_at: s.last_heartbeat_at,
            })
            .collect(),
    ))
}

// ── Enrollment tokens ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEnrollmentTokenRequest {
    pub site_id: Uuid,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateEnrollmentTokenResponse {
    pub token_id: Uuid,
    pub site_id: Uuid,
    /// The plaintext token — returned exactly once.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct EnrollmentTokenView {
    pub token_id: Uuid,
    pub site_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_agent_id: Option<Uuid>,
}

/// `POST /tenants/{id}/enrollment-tokens`
pub async fn create_enrollment_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<CreateEnrollmentTokenResponse>)> {
    caller.require_tenant(tenant_id)?;
    let request: CreateEnrollmentTokenRequest = parse_body(body)?;

    let ttl = request
        .ttl_seconds
        .map_or(state.config.default_enrollment_ttl, std::time::Duration::from_secs);
    let expires_at =
        Utc::now() + Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(900));

    let (token_id, plaintext) = enrollment::mint_enrollment_token();
    let token = state
        .store
        .create_enrollment_token(NewEnrollmentToken {
            id: token_id,
            tenant_id,
            site_id: request.site_id,
            token_hash: fingerprint::hash_secret(&plaintext),
            expires_at,
        })
        .await?;

    let (actor_type, actor_id) = caller.actor();
    state
        .audit(NewAuditEvent {
            tenant_id: Some(tenant_id),
            site_id: Some(token.site_id),
            actor_type,
            actor_id,
            action: "enrollment_token.create".to_owned(),
            resource_type: "enrollment_token".to_owned(),
            resource_id: token.id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "expires_at": token.expires_at }),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateEnrollmentTokenResponse {
            token_id: token.id,
            site_id: token.site_id,
            token: plaintext,
            expires_at: token.expires_at,
        }),
    ))
}

/// `GET /tenants/{id}/enrollment-tokens`
pub async fn list_enrollment_tokens(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<EnrollmentTokenView>>> {
    caller.require_tenant(tenant_id)?;
    state.store.get_tenant(tenant_id).await?;
    let tokens = state.store.list_enrollment_tokens(tenant_id).await?;
    Ok(Json(
        tokens
            .into_iter()
            .map(|t| EnrollmentTokenView {
                token_id: t.id,
                site_id: t.site_id,
                expires_at: t.expires_at,
                consumed: t.consumed,
                consumed_at: t.consumed_at,
                consumed_by_agent_id: t.consumed_by_agent_id,
            })
            .collect(),
    ))
}
