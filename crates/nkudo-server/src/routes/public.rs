//! Unauthenticated endpoints: liveness and CRL distribution points.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// `GET /healthz`
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ephemeral_pki": state.ca.is_ephemeral(),
    }))
}

/// `GET /v1/crl` — DER encoding.
pub async fn crl_der(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/pkix-crl")],
        state.crl.der(),
    )
        .into_response()
}

/// `GET /v1/crl.pem` — PEM encoding.
pub async fn crl_pem(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.crl.pem(),
    )
        .into_response()
}
