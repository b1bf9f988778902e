//! API error type.
//!
//! Every handler failure renders as the standard JSON body
//! `{error, message, request_id}` with the HTTP status the taxonomy
//! assigns to the code. Internal errors never leak details — the message is
//! logged, the response says `internal error`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use nkudo_store::StoreError;
use nkudo_types::ErrorCode;
use nkudo_types::wire::ErrorBody;

/// An API-surface error: a taxonomy code plus a human message.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Correlation id; assigned at render time when the failure happened
    /// before request-id middleware ran.
    pub request_id: Option<Uuid>,
    /// Seconds until the caller may retry (rate limiting only).
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Build an error from a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            retry_after_secs: None,
        }
    }

    /// A 429 carrying a `Retry-After` hint.
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut err = Self::new(ErrorCode::RateLimited, "rate limit exceeded");
        err.retry_after_secs = Some(retry_after_secs.max(1));
        err
    }

    /// Attach the request's correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// A generic 401 with a deliberately uninformative message.
    #[must_use]
    pub fn unauthenticated() -> Self {
        Self::new(ErrorCode::Unauthenticated, "authentication required")
    }

    /// A 403 for cross-tenant or privilege failures.
    #[must_use]
    pub fn forbidden() -> Self {
        Self::new(ErrorCode::Forbidden, "access denied")
    }

    /// A 400 validation failure.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// A 500 whose detail is logged but not returned.
    #[must_use]
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        tracing::error!(error = %detail, "internal error");
        Self::new(ErrorCode::Internal, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.code.as_str().to_owned(),
            message: self.message,
            request_id: self.request_id.unwrap_or_else(Uuid::new_v4),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after_secs {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { ref what } => {
                let code = match what.as_str() {
                    "tenant" => ErrorCode::TenantNotFound,
                    "site" => ErrorCode::SiteNotFound,
                    "execution" => ErrorCode::ExecutionNotFound,
                    "vm" => ErrorCode::VmNotFound,
                    _ => ErrorCode::ExecutionNotFound,
                };
                Self::new(code, err.to_string())
            }
            StoreError::Conflict { reason } => Self::new(ErrorCode::InvalidRequest, reason),
            StoreError::TokenInvalid => {
                Self::new(ErrorCode::TokenInvalid, "enrollment token invalid")
            }
            StoreError::TokenExpired => {
                Self::new(ErrorCode::TokenExpired, "enrollment token expired")
            }
            StoreError::TokenAlreadyUsed => {
                Self::new(ErrorCode::TokenAlreadyUsed, "enrollment token already used")
            }
            StoreError::Invalid { reason } => Self::new(ErrorCode::InvalidRequest, reason),
            StoreError::Serialization { .. } | StoreError::Backend { .. } => Self::internal(err),
        }
    }
}

/// Shorthand result type for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
