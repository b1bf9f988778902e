//! Admin surface: tenant creation and audit chain inspection.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use nkudo_store::{NewAuditEvent, NewTenant};
use nkudo_types::audit::{self, ActorType, AuditEvent};

use crate::error::ApiResult;
use crate::middleware::RequestId;
use crate::routes::parse_body;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTenantRequest {
    pub slug: String,
    pub name: String,
    pub primary_region: String,
    #[serde(default)]
    pub data_retention_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TenantResponse {
    pub id: uuid::Uuid,
    pub slug: String,
    pub name: String,
    pub primary_region: String,
    pub data_retention_days: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /tenants`
pub async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<TenantResponse>)> {
    let request: CreateTenantRequest = parse_body(body)?;
    let tenant = state
        .store
        .create_tenant(NewTenant {
            slug: request.slug,
            name: request.name,
            primary_region: request.primary_region,
            data_retention_days: request.data_retention_days.unwrap_or(90),
        })
        .await?;

    state
        .audit(NewAuditEvent {
            tenant_id: Some(tenant.id),
            site_id: None,
            actor_type: ActorType::Admin,
            actor_id: "admin".to_owned(),
            action: "tenant.create".to_owned(),
            resource_type: "tenant".to_owned(),
            resource_id: tenant.id.to_string(),
            request_id,
            source_ip: None,
            metadata: serde_json::json!({ "slug": tenant.slug }),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(TenantResponse {
            id: tenant.id,
            slug: tenant.slug,
            name: tenant.name,
            primary_region: tenant.primary_region,
            data_retention_days: tenant.data_retention_days,
            created_at: tenant.created_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /admin/audit/events`
pub async fn audit_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let events = state.store.list_audit(query.limit).await?;
    Ok(Json(events))
}

#[derive(Debug, Serialize)]
pub struct AuditVerifyResponse {
    pub valid: bool,
    pub entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
}

/// `POST /admin/audit/verify`
pub async fn audit_verify(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<AuditVerifyResponse>> {
    let events = state.store.list_audit(None).await?;
    let response = match audit::verify_chain(&events) {
        Ok(()) => AuditVerifyResponse {
            valid: true,
            entries: events.len(),
            violation: None,
        },
        Err(violation) => AuditVerifyResponse {
            valid: false,
            entries: events.len(),
            violation: Some(violation.to_string()),
        },
    };
    Ok(Json(response))
}
