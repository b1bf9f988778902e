//! The error taxonomy shared across the HTTP surface and execution records.
//!
//! Codes are stable wire strings (`TOKEN_ALREADY_USED`, `INVALID_STATE`,
//! ...). HTTP-facing codes map to a status; execution-level codes
//! (`ACTION_FAILED`, `TIMEOUT`, `PROVIDER_ERROR`) are recorded on execution
//! rows and never returned as an HTTP failure.

use serde::{Deserialize, Serialize};

/// Every error code the system emits, HTTP-facing or execution-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication / authorization.
    Unauthenticated,
    Forbidden,
    TokenInvalid,
    TokenExpired,
    TokenAlreadyUsed,
    CertificateRevoked,
    // Not found.
    TenantNotFound,
    SiteNotFound,
    VmNotFound,
    ExecutionNotFound,
    // Validation.
    InvalidRequest,
    DuplicateOperation,
    InvalidState,
    // Rate limiting.
    RateLimited,
    // Execution-level (recorded on executions, not returned over HTTP).
    ActionFailed,
    Timeout,
    ProviderError,
    // Internal.
    Internal,
}

impl ErrorCode {
    /// The stable wire string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            Self::CertificateRevoked => "CERTIFICATE_REVOKED",
            Self::TenantNotFound => "TENANT_NOT_FOUND",
            Self::SiteNotFound => "SITE_NOT_FOUND",
            Self::VmNotFound => "VM_NOT_FOUND",
            Self::ExecutionNotFound => "EXECUTION_NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::DuplicateOperation => "DUPLICATE_OPERATION",
            Self::InvalidState => "INVALID_STATE",
            Self::RateLimited => "RATE_LIMITED",
            Self::ActionFailed => "ACTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status this code renders as at a request boundary.
    ///
    /// Token redemption failures deliberately render as 401 so that a
    /// probing caller cannot distinguish unknown from expired from consumed
    /// by status alone. Execution-level codes never reach HTTP but map to
    /// 500 if they somehow do.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Unauthenticated
            | Self::TokenInvalid
            | Self::TokenExpired
            | Self::TokenAlreadyUsed
            | Self::CertificateRevoked => 401,
            Self::Forbidden => 403,
            Self::TenantNotFound
            | Self::SiteNotFound
            | Self::VmNotFound
            | Self::ExecutionNotFound => 404,
            Self::InvalidRequest => 400,
            Self::DuplicateOperation | Self::InvalidState => 409,
            Self::RateLimited => 429,
            Self::ActionFailed | Self::Timeout | Self::ProviderError | Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn token_failures_all_render_as_401() {
        for code in [
            ErrorCode::TokenInvalid,
            ErrorCode::TokenExpired,
            ErrorCode::TokenAlreadyUsed,
        ] {
            assert_eq!(code.http_status(), 401);
        }
    }

    #[test]
    fn wire_string_matches_serde_representation() {
        let json = serde_json::to_string(&ErrorCode::TokenAlreadyUsed).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCode::TokenAlreadyUsed.as_str()));
    }

    #[test]
    fn validation_codes_split_400_409() {
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::DuplicateOperation.http_status(), 409);
        assert_eq!(ErrorCode::InvalidState.http_status(), 409);
    }

    #[test]
    fn rate_limited_is_429() {
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }
}
