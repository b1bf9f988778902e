//! Control-plane configuration.
//!
//! Loads configuration from environment variables with development-friendly
//! defaults. Production deployments set `DATABASE_URL`, `ADMIN_KEY`, the
//! persistent CA material, and `REQUIRE_PERSISTENT_PKI=true`.

use std::net::SocketAddr;
use std::time::Duration;

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development and tests, data lost on restart).
    Memory,
    /// PostgreSQL, selected when `DATABASE_URL` is set.
    Postgres { url: String },
}

/// Where bootstrap secrets (the admin key) come from.
///
/// Only `env` is implemented; `vault` and `aws` are recognized so existing
/// deployment manifests parse, and fall back to `env` with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStoreType {
    Env,
    Vault,
    Aws,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to (`CONTROL_PLANE_ADDR`).
    pub bind_addr: SocketAddr,
    pub storage_backend: StorageBackendType,
    /// Log level filter (`NKUDO_LOG_LEVEL`).
    pub log_level: String,
    /// Bootstrap admin credential (`ADMIN_KEY`).
    pub admin_key: String,
    /// Default enrollment-token lifetime (`DEFAULT_ENROLLMENT_TTL`).
    pub default_enrollment_ttl: Duration,
    /// Issued client-certificate lifetime (`AGENT_CERT_TTL`).
    pub agent_cert_ttl: Duration,
    /// Heartbeat interval returned to agents (`HEARTBEAT_INTERVAL`).
    pub heartbeat_interval: Duration,
    /// Execution lease duration (`PLAN_LEASE_TTL`).
    pub plan_lease_ttl: Duration,
    /// Dispatch batch cap per heartbeat (`MAX_PENDING_PLANS`).
    pub max_pending_plans: usize,
    /// Offline threshold (`HEARTBEAT_OFFLINE_AFTER`).
    pub heartbeat_offline_after: Duration,
    /// Sweeper cadence (`OFFLINE_SWEEP_INTERVAL`).
    pub offline_sweep_interval: Duration,
    /// Forbid the ephemeral development CA (`REQUIRE_PERSISTENT_PKI`).
    pub require_persistent_pki: bool,
    /// Persistent CA certificate path (`NKUDO_CA_CERT_FILE`).
    pub ca_cert_file: Option<String>,
    /// Persistent CA key path (`NKUDO_CA_KEY_FILE`).
    pub ca_key_file: Option<String>,
    /// Grace window before a replaced serial is revoked
    /// (`NKUDO_REVOCATION_GRACE`).
    pub revocation_grace: Duration,
    /// Enrollment requests per minute per source (`RATE_LIMIT_ENROLL`).
    pub rate_limit_enroll_per_min: u32,
    /// All other requests per minute per caller (`RATE_LIMIT_DEFAULT`).
    pub rate_limit_default_per_min: u32,
    /// Background audit-chain verification cadence (`AUDIT_VERIFY_INTERVAL`).
    pub audit_verify_interval: Duration,
    /// Bootstrap secret source (`SECRET_STORE_TYPE`).
    pub secret_store: SecretStoreType,
    /// Externally reachable base URL, used in CRL distribution points and
    /// the heartbeat endpoint returned at enrollment (`NKUDO_PUBLIC_URL`).
    pub public_url: String,
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("CONTROL_PLANE_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8440)));

        let storage_backend = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => StorageBackendType::Postgres { url },
            _ => StorageBackendType::Memory,
        };

        let secret_store = match std::env::var("SECRET_STORE_TYPE")
            .unwrap_or_else(|_| "env".to_owned())
            .to_lowercase()
            .as_str()
        {
            "vault" => SecretStoreType::Vault,
            "aws" => SecretStoreType::Aws,
            _ => SecretStoreType::Env,
        };

        Self {
            bind_addr,
            storage_backend,
            log_level: std::env::var("NKUDO_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            admin_key: std::env::var("ADMIN_KEY").unwrap_or_default(),
            default_enrollment_ttl: env_duration_secs("DEFAULT_ENROLLMENT_TTL", 900),
            agent_cert_ttl: env_duration_secs("AGENT_CERT_TTL", 30 * 24 * 3600),
            heartbeat_interval: env_duration_secs("HEARTBEAT_INTERVAL", 30),
            plan_lease_ttl: env_duration_secs("PLAN_LEASE_TTL", 300),
            max_pending_plans: env_parse("MAX_PENDING_PLANS", 16usize),
            heartbeat_offline_after: env_duration_secs("HEARTBEAT_OFFLINE_AFTER", 120),
            offline_sweep_interval: env_duration_secs("OFFLINE_SWEEP_INTERVAL", 30),
            require_persistent_pki: env_parse("REQUIRE_PERSISTENT_PKI", false),
            ca_cert_file: std::env::var("NKUDO_CA_CERT_FILE").ok(),
            ca_key_file: std::env::var("NKUDO_CA_KEY_FILE").ok(),
            revocation_grace: env_duration_secs("NKUDO_REVOCATION_GRACE", 300),
            rate_limit_enroll_per_min: env_parse("RATE_LIMIT_ENROLL", 30u32),
            rate_limit_default_per_min: env_parse("RATE_LIMIT_DEFAULT", 600u32),
            audit_verify_interval: env_duration_secs("AUDIT_VERIFY_INTERVAL", 300),
            secret_store,
            public_url: std::env::var("NKUDO_PUBLIC_URL")
                .unwrap_or_else(|_| format!("https://{bind_addr}")),
        }
    }
}
