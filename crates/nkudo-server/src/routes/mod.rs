//! HTTP route assembly.
//!
//! Four surfaces, each with its own auth layer:
//!
//! - public: liveness and CRL distribution points
//! - admin: tenant creation, audit chain inspection
//! - tenant: API keys, sites, enrollment tokens, plans, inventory
//! - agent: enrollment (token-authed), everything else mTLS

pub mod admin;
pub mod agent;
pub mod public;
pub mod site;
pub mod tenant;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::routing::{delete, get, post};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ApiResult};
use crate::middleware;
use crate::state::AppState;

/// Parse a JSON body into `T`, rendering failures as `INVALID_REQUEST`
/// with the standard error body instead of axum's default rejection.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> ApiResult<T> {
    serde_json::from_value(value).map_err(|e| ApiError::invalid(format!("invalid request body: {e}")))
}

/// Build the full router over the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route("/tenants", post(admin::create_tenant))
        .route("/admin/audit/events", get(admin::audit_events))
        .route("/admin/audit/verify", post(admin::audit_verify))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            middleware::admin_auth,
        ));

    let tenant_routes = Router::new()
        .route(
            "/tenants/{tenant_id}/api-keys",
            post(tenant::create_api_key).get(tenant::list_api_keys),
        )
        .route(
            "/tenants/{tenant_id}/api-keys/{key_id}",
            delete(tenant::revoke_api_key),
        )
        .route(
            "/tenants/{tenant_id}/sites",
            get(tenant::list_sites).post(tenant::create_site),
        )
        .route(
            "/tenants/{tenant_id}/enrollment-tokens",
            get(tenant::list_enrollment_tokens).post(tenant::create_enrollment_token),
        )
        .route("/sites/{site_id}/plans", post(site::apply_plan))
        .route("/sites/{site_id}/hosts", get(site::list_hosts))
        .route("/sites/{site_id}/vms", get(site::list_vms))
        .route("/sites/{site_id}/executions", get(site::list_executions))
        .route("/executions/{execution_id}/logs", get(site::execution_logs))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            middleware::caller_auth,
        ));

    let agent_routes = Router::new()
        .route("/v1/renew", post(agent::renew))
        .route("/v1/unenroll", post(agent::unenroll))
        .route("/agents/heartbeat", post(agent::heartbeat))
        .route("/v1/heartbeat", post(agent::heartbeat))
        .route("/agents/logs", post(agent::ingest_logs))
        .route("/v1/logs", post(agent::ingest_logs))
        .route("/v1/plans/next", get(agent::next_plans))
        .route("/v1/executions/result", post(agent::report_results))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            middleware::agent_auth,
        ));

    Router::new()
        .route("/healthz", get(public::healthz))
        .route("/v1/crl", get(public::crl_der))
        .route("/v1/crl.pem", get(public::crl_pem))
        .route("/enroll", post(agent::enroll))
        .route("/v1/enroll", post(agent::enroll))
        .merge(admin_routes)
        .merge(tenant_routes)
        .merge(agent_routes)
        .layer(axum_mw::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
