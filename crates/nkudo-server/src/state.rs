//! Shared application state.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. It holds the repository, the CA, the CRL
//! service, the rate limiters, and the effective configuration. Everything
//! here is initializable from mocks — the test suites build an `AppState`
//! over a [`nkudo_store::MemoryStore`] and an ephemeral CA.

use std::sync::Arc;

use uuid::Uuid;

use nkudo_store::{NewAuditEvent, Store};
use nkudo_types::audit::ActorType;

use crate::config::ServerConfig;
use crate::pki::{CertificateAuthority, CrlService};
use crate::ratelimit::RateLimiter;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub ca: Arc<CertificateAuthority>,
    pub crl: Arc<CrlService>,
    /// Limiter for enrollment (keyed by source address).
    pub enroll_limiter: RateLimiter,
    /// Limiter for everything else (keyed by caller identity).
    pub default_limiter: RateLimiter,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble state from its parts.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        ca: Arc<CertificateAuthority>,
        crl: Arc<CrlService>,
    ) -> Self {
        let enroll_limiter = RateLimiter::per_minute(config.rate_limit_enroll_per_min);
        let default_limiter = RateLimiter::per_minute(config.rate_limit_default_per_min);
        Self {
            config,
            store,
            ca,
            crl,
            enroll_limiter,
            default_limiter,
        }
    }

    /// Append an audit event, logging (not failing) on store errors — an
    /// audit outage must not take the API down.
    pub async fn audit(&self, event: NewAuditEvent) {
        if let Err(e) = self.store.append_audit(event).await {
            tracing::warn!(error = %e, "audit append failed");
        }
    }

    /// Convenience constructor for system-actor audit events.
    #[must_use]
    pub fn system_audit(
        action: &str,
        resource_type: &str,
        resource_id: impl Into<String>,
    ) -> NewAuditEvent {
        NewAuditEvent {
            tenant_id: None,
            site_id: None,
            actor_type: ActorType::System,
            actor_id: "system".to_owned(),
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.into(),
            request_id: Uuid::new_v4(),
            source_ip: None,
            metadata: serde_json::Value::Null,
        }
    }
}
