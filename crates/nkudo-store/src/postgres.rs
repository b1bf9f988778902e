//! PostgreSQL store backend.
//!
//! Every trait method that mutates runs inside one SQL transaction, so the
//! repository-level atomicity guarantees hold identically to the in-memory
//! backend. Enums persist as their wire strings (TEXT), action payloads as
//! JSONB. Queries use parameterized statements throughout.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use nkudo_types::audit::{self, ActorType, AuditEvent};
use nkudo_types::fingerprint;
use nkudo_types::plan::ActionSpec;
use nkudo_types::state::{AgentState, ConnectivityState, ExecutionState, OperationKind, VmState};
use nkudo_types::wire::{ExecutionUpdate, HostFacts, LogFrame, LogSeverity, ReportedVm};

use crate::error::StoreError;
use crate::model::{
    Agent, ApiKey, CrlEntry, EnrollmentToken, Execution, ExecutionLogLine, Host, MicroVm, Plan,
    Site, Tenant,
};
use crate::{
    EnrollAgent, EnrollOutcome, ExecutionFilter, ExecutionUpdateOutcome, HeartbeatOutcome,
    NewApiKey, NewAuditEvent, NewEnrollmentToken, NewSite, NewTenant, PlanApplyOutcome,
    PlanSubmission, Store, SweepOutcome,
};

/// Advisory lock key serializing audit-chain appends.
const AUDIT_CHAIN_LOCK: i64 = 0x6e6b_7564_6f5f_6175;

/// The PostgreSQL [`Store`] implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to PostgreSQL and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection or schema setup
    /// fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        tracing::info!("postgres store ready");
        Ok(store)
    }

    /// Wrap an existing pool (used by tests that manage their own schema).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    primary_region TEXT NOT NULL,
    data_retention_days INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS api_keys (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ,
    last_used_at TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS sites (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    external_key TEXT NOT NULL,
    location_country_code TEXT NOT NULL,
    connectivity_state TEXT NOT NULL,
    last_heartbeat_at TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS enrollment_tokens (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    site_id UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    consumed BOOLEAN NOT NULL DEFAULT FALSE,
    consumed_at TIMESTAMPTZ,
    consumed_by_agent_id UUID
);
CREATE TABLE IF NOT EXISTS hosts (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    site_id UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    hostname TEXT NOT NULL,
    cpu_cores_total INT NOT NULL,
    memory_bytes_total BIGINT NOT NULL,
    storage_bytes_total BIGINT NOT NULL,
    kvm_available BOOLEAN NOT NULL,
    cloud_hypervisor_available BOOLEAN NOT NULL,
    last_facts_at TIMESTAMPTZ,
    agent_state TEXT NOT NULL,
    UNIQUE (site_id, hostname)
);
CREATE TABLE IF NOT EXISTS agents (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    site_id UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    host_id UUID NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    cert_serial TEXT NOT NULL,
    refresh_token_hash TEXT NOT NULL,
    agent_version TEXT NOT NULL,
    os TEXT NOT NULL,
    arch TEXT NOT NULL,
    kernel_version TEXT NOT NULL,
    state TEXT NOT NULL,
    last_heartbeat_at TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS microvms (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    site_id UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    host_id UUID,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    vcpu_count INT NOT NULL,
    memory_mib BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (site_id, name)
);
CREATE TABLE IF NOT EXISTS plans (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    site_id UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    idempotency_key TEXT NOT NULL,
    client_request_id TEXT,
    version INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, site_id, idempotency_key)
);
CREATE TABLE IF NOT EXISTS executions (
    id UUID PRIMARY KEY,
    plan_id UUID NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
    position INT NOT NULL,
    operation_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    vm_id TEXT NOT NULL,
    spec JSONB NOT NULL,
    timeout_seconds BIGINT,
    state TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    assigned_host_id UUID,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (plan_id, operation_id)
);
CREATE TABLE IF NOT EXISTS execution_logs (
    execution_id UUID NOT NULL,
    sequence BIGINT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    emitted_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (execution_id, sequence)
);
CREATE TABLE IF NOT EXISTS audit_events (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    tenant_id UUID,
    site_id UUID,
    actor_type TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    request_id UUID NOT NULL,
    source_ip TEXT,
    metadata JSONB NOT NULL,
    prev_hash TEXT NOT NULL,
    entry_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS crl_entries (
    serial TEXT PRIMARY KEY,
    revoked_at TIMESTAMPTZ NOT NULL,
    reason TEXT NOT NULL,
    agent_id UUID NOT NULL
);
CREATE INDEX IF NOT EXISTS executions_dispatch_idx
    ON executions (state, created_at, position, id);
";

// ── Enum/text and integer conversions ────────────────────────────────

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Serialization {
            reason: format!("expected string enum, got {other}"),
        }),
        Err(e) => Err(StoreError::Serialization {
            reason: e.to_string(),
        }),
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_owned())).map_err(|e| {
        StoreError::Serialization {
            reason: format!("unknown enum value '{s}': {e}"),
        }
    })
}

fn db_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn db_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn db_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn db_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// ── Row types ────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SiteRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    external_key: String,
    location_country_code: String,
    connectivity_state: String,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl SiteRow {
    fn into_site(self) -> Result<Site, StoreError> {
        Ok(Site {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            external_key: self.external_key,
            location_country_code: self.location_country_code,
            connectivity_state: parse_enum(&self.connectivity_state)?,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HostRow {
    id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    hostname: String,
    cpu_cores_total: i32,
    memory_bytes_total: i64,
    storage_bytes_total: i64,
    kvm_available: bool,
    cloud_hypervisor_available: bool,
    last_facts_at: Option<DateTime<Utc>>,
    agent_state: String,
}

impl HostRow {
    fn into_host(self) -> Result<Host, StoreError> {
        Ok(Host {
            id: self.id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            hostname: self.hostname,
            cpu_cores_total: db_u32(self.cpu_cores_total),
            memory_bytes_total: db_u64(self.memory_bytes_total),
            storage_bytes_total: db_u64(self.storage_bytes_total),
            kvm_available: self.kvm_available,
            cloud_hypervisor_available: self.cloud_hypervisor_available,
            last_facts_at: self.last_facts_at,
            agent_state: parse_enum(&self.agent_state)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    host_id: Uuid,
    cert_serial: String,
    refresh_token_hash: String,
    agent_version: String,
    os: String,
    arch: String,
    kernel_version: String,
    state: String,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl AgentRow {
    fn into_agent(self) -> Result<Agent, StoreError> {
        Ok(Agent {
            id: self.id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            host_id: self.host_id,
            cert_serial: self.cert_serial,
            refresh_token_hash: self.refresh_token_hash,
            agent_version: self.agent_version,
            os: self.os,
            arch: self.arch,
            kernel_version: self.kernel_version,
            state: parse_enum(&self.state)?,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VmRow {
    id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    host_id: Option<Uuid>,
    name: String,
    state: String,
    vcpu_count: i32,
    memory_mib: i64,
    updated_at: DateTime<Utc>,
}

impl VmRow {
    fn into_vm(self) -> Result<MicroVm, StoreError> {
        Ok(MicroVm {
            id: self.id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            host_id: self.host_id,
            name: self.name,
            state: parse_enum(&self.state)?,
            vcpu_count: db_u32(self.vcpu_count),
            memory_mib: db_u64(self.memory_mib),
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    plan_id: Uuid,
    position: i32,
    operation_id: String,
    operation_type: String,
    vm_id: String,
    spec: serde_json::Value,
    timeout_seconds: Option<i64>,
    state: String,
    error_code: Option<String>,
    error_message: Option<String>,
    assigned_host_id: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution, StoreError> {
        let spec: ActionSpec =
            serde_json::from_value(self.spec).map_err(|e| StoreError::Serialization {
                reason: format!("execution spec: {e}"),
            })?;
        Ok(Execution {
            id: self.id,
            plan_id: self.plan_id,
            position: db_u32(self.position),
            operation_id: self.operation_id,
            operation_type: parse_enum(&self.operation_type)?,
            vm_id: self.vm_id,
            spec,
            timeout_seconds: self.timeout_seconds.map(db_u64),
            state: parse_enum(&self.state)?,
            error_code: self.error_code,
            error_message: self.error_message,
            assigned_host_id: self.assigned_host_id,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    idempotency_key: String,
    client_request_id: Option<String>,
    version: i32,
    created_at: DateTime<Utc>,
}

impl PlanRow {
    fn into_plan(self) -> Plan {
        Plan {
            id: self.id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            idempotency_key: self.idempotency_key,
            client_request_id: self.client_request_id,
            version: db_u32(self.version),
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    tenant_id: Option<Uuid>,
    site_id: Option<Uuid>,
    actor_type: String,
    actor_id: String,
    action: String,
    resource_type: String,
    resource_id: String,
    request_id: Uuid,
    source_ip: Option<String>,
    metadata: serde_json::Value,
    prev_hash: String,
    entry_hash: String,
}

impl AuditRow {
    fn into_event(self) -> Result<AuditEvent, StoreError> {
        Ok(AuditEvent {
            id: self.id,
            timestamp: self.timestamp,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            actor_type: parse_enum::<ActorType>(&self.actor_type)?,
            actor_id: self.actor_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            request_id: self.request_id,
            source_ip: self.source_ip,
            metadata: self.metadata,
            prev_hash: self.prev_hash,
            entry_hash: self.entry_hash,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    tenant_id: Uuid,
    site_id: Uuid,
    token_hash: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
    consumed_at: Option<DateTime<Utc>>,
    consumed_by_agent_id: Option<Uuid>,
}

impl TokenRow {
    fn into_token(self) -> EnrollmentToken {
        EnrollmentToken {
            id: self.id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            token_hash: self.token_hash,
            expires_at: self.expires_at,
            consumed: self.consumed,
            consumed_at: self.consumed_at,
            consumed_by_agent_id: self.consumed_by_agent_id,
        }
    }
}

// ── Store implementation ─────────────────────────────────────────────

#[async_trait::async_trait]
impl Store for PostgresStore {
    async fn create_tenant(&self, new: NewTenant) -> Result<Tenant, StoreError> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: new.slug,
            name: new.name,
            primary_region: new.primary_region,
            data_retention_days: new.data_retention_days,
            created_at: Utc::now(),
        };
        sqlx::query(
            r"INSERT INTO tenants (id, slug, name, primary_region, data_retention_days, created_at)
              VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(tenant.id)
        .bind(&tenant.slug)
        .bind(&tenant.name)
        .bind(&tenant.primary_region)
        .bind(db_i32(tenant.data_retention_days))
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, StoreError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("tenant"))?;
        Ok(Tenant {
            id: row.get("id"),
            slug: row.get("slug"),
            name: row.get("name"),
            primary_region: row.get("primary_region"),
            data_retention_days: db_u32(row.get("data_retention_days")),
            created_at: row.get("created_at"),
        })
    }

    async fn create_api_key(&self, new: NewApiKey) -> Result<ApiKey, StoreError> {
        let key = ApiKey {
            id: new.id,
            tenant_id: new.tenant_id,
            name: new.name,
            key_hash: new.key_hash,
            created_at: Utc::now(),
            expires_at: new.expires_at,
            last_used_at: None,
        };
        let result = sqlx::query(
            r"INSERT INTO api_keys (id, tenant_id, name, key_hash, created_at, expires_at)
              SELECT $1, $2, $3, $4, $5, $6 WHERE EXISTS (SELECT 1 FROM tenants WHERE id = $2)",
        )
        .bind(key.id)
        .bind(key.tenant_id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(key.created_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tenant"));
        }
        Ok(key)
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ApiKey {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                name: row.get("name"),
                key_hash: row.get("key_hash"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
                last_used_at: row.get("last_used_at"),
            })
            .collect())
    }

    async fn find_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = $1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| ApiKey {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            key_hash: row.get("key_hash"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
            last_used_at: row.get("last_used_at"),
        }))
    }

    async fn delete_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND tenant_id = $2")
            .bind(key_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("api key"));
        }
        Ok(())
    }

    async fn touch_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_site(&self, new: NewSite) -> Result<Site, StoreError> {
        let site = Site {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            name: new.name,
            external_key: new.external_key,
            location_country_code: new.location_country_code,
            connectivity_state: ConnectivityState::Unknown,
            last_heartbeat_at: None,
        };
        let result = sqlx::query(
            r"INSERT INTO sites (id, tenant_id, name, external_key, location_country_code, connectivity_state)
              SELECT $1, $2, $3, $4, $5, $6 WHERE EXISTS (SELECT 1 FROM tenants WHERE id = $2)",
        )
        .bind(site.id)
        .bind(site.tenant_id)
        .bind(&site.name)
        .bind(&site.external_key)
        .bind(&site.location_country_code)
        .bind(enum_str(&site.connectivity_state)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("tenant"));
        }
        Ok(site)
    }

    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError> {
        let rows = sqlx::query_as::<_, SiteRow>(
            "SELECT * FROM sites WHERE tenant_id = $1 ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SiteRow::into_site).collect()
    }

    async fn get_site(&self, site_id: Uuid) -> Result<Site, StoreError> {
        sqlx::query_as::<_, SiteRow>("SELECT * FROM sites WHERE id = $1")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("site"))?
            .into_site()
    }

    async fn create_enrollment_token(
        &self,
        new: NewEnrollmentToken,
    ) -> Result<EnrollmentToken, StoreError> {
        let result = sqlx::query(
            r"INSERT INTO enrollment_tokens (id, tenant_id, site_id, token_hash, expires_at)
              SELECT $1, $2, $3, $4, $5
              WHERE EXISTS (SELECT 1 FROM sites WHERE id = $3 AND tenant_id = $2)",
        )
        .bind(new.id)
        .bind(new.tenant_id)
        .bind(new.site_id)
        .bind(&new.token_hash)
        .bind(new.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("site"));
        }
        Ok(EnrollmentToken {
            id: new.id,
            tenant_id: new.tenant_id,
            site_id: new.site_id,
            token_hash: new.token_hash,
            expires_at: new.expires_at,
            consumed: false,
            consumed_at: None,
            consumed_by_agent_id: None,
        })
    }

    async fn list_enrollment_tokens(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<EnrollmentToken>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            "SELECT * FROM enrollment_tokens WHERE tenant_id = $1 ORDER BY expires_at",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TokenRow::into_token).collect())
    }

    async fn enroll_agent(&self, enroll: EnrollAgent) -> Result<EnrollOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let token = sqlx::query_as::<_, TokenRow>(
            "SELECT * FROM enrollment_tokens WHERE id = $1 FOR UPDATE",
        )
        .bind(enroll.token_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::TokenInvalid)?
        .into_token();

        if !fingerprint::verify_secret(&enroll.token_plaintext, &token.token_hash) {
            return Err(StoreError::TokenInvalid);
        }
        if token.consumed {
            return Err(StoreError::TokenAlreadyUsed);
        }
        if enroll.now >= token.expires_at {
            return Err(StoreError::TokenExpired);
        }

        sqlx::query(
            r"UPDATE enrollment_tokens
              SET consumed = TRUE, consumed_at = $2, consumed_by_agent_id = $3
              WHERE id = $1",
        )
        .bind(token.id)
        .bind(enroll.now)
        .bind(enroll.agent_id)
        .execute(&mut *tx)
        .await?;

        let online = enum_str(&AgentState::Online)?;
        let host = sqlx::query_as::<_, HostRow>(
            r"INSERT INTO hosts (id, tenant_id, site_id, hostname, cpu_cores_total,
                                 memory_bytes_total, storage_bytes_total, kvm_available,
                                 cloud_hypervisor_available, last_facts_at, agent_state)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
              ON CONFLICT (site_id, hostname) DO UPDATE SET
                cpu_cores_total = EXCLUDED.cpu_cores_total,
                memory_bytes_total = EXCLUDED.memory_bytes_total,
                storage_bytes_total = EXCLUDED.storage_bytes_total,
                kvm_available = EXCLUDED.kvm_available,
                cloud_hypervisor_available = EXCLUDED.cloud_hypervisor_available,
                last_facts_at = EXCLUDED.last_facts_at,
                agent_state = EXCLUDED.agent_state
              RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(token.tenant_id)
        .bind(token.site_id)
        .bind(&enroll.facts.hostname)
        .bind(db_i32(enroll.facts.cpu_cores_total))
        .bind(db_i64(enroll.facts.memory_bytes_total))
        .bind(db_i64(enroll.facts.storage_bytes_total))
        .bind(enroll.facts.kvm_available)
        .bind(enroll.facts.cloud_hypervisor_available)
        .bind(enroll.now)
        .bind(&online)
        .fetch_one(&mut *tx)
        .await?
        .into_host()?;

        let agent = Agent {
            id: enroll.agent_id,
            tenant_id: token.tenant_id,
            site_id: token.site_id,
            host_id: host.id,
            cert_serial: enroll.cert_serial,
            refresh_token_hash: enroll.refresh_token_hash,
            agent_version: enroll.facts.agent_version.clone(),
            os: enroll.facts.os.clone(),
            arch: enroll.facts.arch.clone(),
            kernel_version: enroll.facts.kernel_version.clone(),
            state: AgentState::Online,
            last_heartbeat_at: None,
        };
        sqlx::query(
            r"INSERT INTO agents (id, tenant_id, site_id, host_id, cert_serial, refresh_token_hash,
                                  agent_version, os, arch, kernel_version, state)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(agent.id)
        .bind(agent.tenant_id)
        .bind(agent.site_id)
        .bind(agent.host_id)
        .bind(&agent.cert_serial)
        .bind(&agent.refresh_token_hash)
        .bind(&agent.agent_version)
        .bind(&agent.os)
        .bind(&agent.arch)
        .bind(&agent.kernel_version)
        .bind(&online)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(EnrollOutcome {
            tenant_id: token.tenant_id,
            site_id: token.site_id,
            host,
            agent,
        })
    }

    async fn list_hosts(&self, site_id: Uuid) -> Result<Vec<Host>, StoreError> {
        let rows = sqlx::query_as::<_, HostRow>(
            "SELECT * FROM hosts WHERE site_id = $1 ORDER BY hostname",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HostRow::into_host).collect()
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("agent"))?
            .into_agent()
    }

    async fn set_agent_state(&self, agent_id: Uuid, state: AgentState) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let state_str = enum_str(&state)?;
        let host_id: Option<Uuid> =
            sqlx::query_scalar("UPDATE agents SET state = $2 WHERE id = $1 RETURNING host_id")
                .bind(agent_id)
                .bind(&state_str)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(host_id) = host_id else {
            return Err(StoreError::not_found("agent"));
        };
        sqlx::query("UPDATE hosts SET agent_state = $2 WHERE id = $1")
            .bind(host_id)
            .bind(&state_str)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_agent_cert(&self, agent_id: Uuid, serial: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET cert_serial = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(serial)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("agent"));
        }
        Ok(())
    }

    async fn list_vms(&self, site_id: Uuid) -> Result<Vec<MicroVm>, StoreError> {
        let rows = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM microvms WHERE site_id = $1 ORDER BY name",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(VmRow::into_vm).collect()
    }

    async fn find_vm(&self, site_id: Uuid, name: &str) -> Result<Option<MicroVm>, StoreError> {
        let row = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM microvms WHERE site_id = $1 AND name = $2",
        )
        .bind(site_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VmRow::into_vm).transpose()
    }

    async fn apply_plan(&self, submission: PlanSubmission) -> Result<PlanApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, PlanRow>(
            r"SELECT * FROM plans
              WHERE tenant_id = $1 AND site_id = $2 AND idempotency_key = $3",
        )
        .bind(submission.tenant_id)
        .bind(submission.site_id)
        .bind(&submission.idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let plan = row.into_plan();
            let executions = sqlx::query_as::<_, ExecutionRow>(
                "SELECT * FROM executions WHERE plan_id = $1 ORDER BY position",
            )
            .bind(plan.id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(ExecutionRow::into_execution)
            .collect::<Result<Vec<_>, _>>()?;
            tx.commit().await?;
            return Ok(PlanApplyOutcome {
                plan,
                executions,
                deduplicated: true,
            });
        }

        let plan = Plan {
            id: Uuid::new_v4(),
            tenant_id: submission.tenant_id,
            site_id: submission.site_id,
            idempotency_key: submission.idempotency_key,
            client_request_id: submission.client_request_id,
            version: 1,
            created_at: submission.now,
        };
        sqlx::query(
            r"INSERT INTO plans (id, tenant_id, site_id, idempotency_key, client_request_id, version, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(plan.id)
        .bind(plan.tenant_id)
        .bind(plan.site_id)
        .bind(&plan.idempotency_key)
        .bind(&plan.client_request_id)
        .bind(db_i32(plan.version))
        .bind(plan.created_at)
        .execute(&mut *tx)
        .await?;

        let pending = enum_str(&ExecutionState::Pending)?;
        let mut executions = Vec::with_capacity(submission.actions.len());
        for (position, action) in submission.actions.into_iter().enumerate() {
            let position = u32::try_from(position).map_err(|_| StoreError::Invalid {
                reason: "too many actions in plan".to_owned(),
            })?;
            let spec_json =
                serde_json::to_value(&action.spec).map_err(|e| StoreError::Serialization {
                    reason: e.to_string(),
                })?;
            let execution = Execution {
                id: Uuid::new_v4(),
                plan_id: plan.id,
                position,
                operation_id: action.operation_id,
                operation_type: action.spec.kind(),
                vm_id: action.vm_id,
                spec: action.spec,
                timeout_seconds: action.timeout_seconds,
                state: ExecutionState::Pending,
                error_code: None,
                error_message: None,
                assigned_host_id: None,
                lease_expires_at: None,
                created_at: submission.now,
                updated_at: submission.now,
            };
            sqlx::query(
                r"INSERT INTO executions (id, plan_id, position, operation_id, operation_type,
                                          vm_id, spec, timeout_seconds, state, created_at, updated_at)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(execution.id)
            .bind(execution.plan_id)
            .bind(db_i32(execution.position))
            .bind(&execution.operation_id)
            .bind(enum_str(&execution.operation_type)?)
            .bind(&execution.vm_id)
            .bind(&spec_json)
            .bind(execution.timeout_seconds.map(db_i64))
            .bind(&pending)
            .bind(execution.created_at)
            .bind(execution.updated_at)
            .execute(&mut *tx)
            .await?;
            executions.push(execution);
        }

        tx.commit().await?;
        Ok(PlanApplyOutcome {
            plan,
            executions,
            deduplicated: false,
        })
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, StoreError> {
        let row = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("plan"))?;
        Ok(row.into_plan())
    }

    async fn get_plan_executions(&self, plan_id: Uuid) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE plan_id = $1 ORDER BY position",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn list_executions(
        &self,
        site_id: Uuid,
        filter: ExecutionFilter,
    ) -> Result<Vec<Execution>, StoreError> {
        let states: Option<Vec<String>> = filter
            .states
            .map(|states| {
                states
                    .iter()
                    .map(enum_str)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let limit = filter.limit.map_or(i64::MAX, |l| db_i64(l as u64));
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r"SELECT e.* FROM executions e
              JOIN plans p ON p.id = e.plan_id
              WHERE p.site_id = $1
                AND ($2::text[] IS NULL OR e.state = ANY($2))
              ORDER BY e.created_at, e.position, e.id
              LIMIT $3",
        )
        .bind(site_id)
        .bind(states)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("execution"))?
            .into_execution()
    }

    async fn lease_executions(
        &self,
        site_id: Uuid,
        host_id: Uuid,
        limit: usize,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let pending = enum_str(&ExecutionState::Pending)?;
        let in_progress = enum_str(&ExecutionState::InProgress)?;

        let candidates = sqlx::query_as::<_, ExecutionRow>(
            r"SELECT e.* FROM executions e
              JOIN plans p ON p.id = e.plan_id
              WHERE p.site_id = $1
                AND ((e.state = $2 AND (e.assigned_host_id IS NULL OR e.assigned_host_id = $3))
                  OR (e.state = $4 AND e.assigned_host_id = $3 AND e.lease_expires_at <= $5))
              ORDER BY e.created_at, e.position, e.id
              LIMIT $6
              FOR UPDATE OF e SKIP LOCKED",
        )
        .bind(site_id)
        .bind(&pending)
        .bind(host_id)
        .bind(&in_progress)
        .bind(now)
        .bind(db_i64(limit as u64))
        .fetch_all(&mut *tx)
        .await?;

        let lease_expires_at = now + lease_ttl;
        let mut leased = Vec::with_capacity(candidates.len());
        for row in candidates {
            let mut execution = row.into_execution()?;
            sqlx::query(
                r"UPDATE executions
                  SET state = $2, assigned_host_id = $3, lease_expires_at = $4, updated_at = $5
                  WHERE id = $1",
            )
            .bind(execution.id)
            .bind(&in_progress)
            .bind(host_id)
            .bind(lease_expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            execution.state = ExecutionState::InProgress;
            execution.assigned_host_id = Some(host_id);
            execution.lease_expires_at = Some(lease_expires_at);
            execution.updated_at = now;
            leased.push(execution);
        }

        tx.commit().await?;
        Ok(leased)
    }

    async fn apply_execution_update(
        &self,
        site_id: Uuid,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<ExecutionUpdateOutcome, StoreError> {
        if !update.state.is_terminal() {
            return Err(StoreError::Invalid {
                reason: format!("execution update state must be terminal, got {:?}", update.state),
            });
        }
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ExecutionRow>(
            r"SELECT e.* FROM executions e
              JOIN plans p ON p.id = e.plan_id
              WHERE e.id = $1 AND p.site_id = $2
              FOR UPDATE OF e",
        )
        .bind(update.execution_id)
        .bind(site_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("execution"))?;
        let mut execution = row.into_execution()?;
        let plan = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans WHERE id = $1")
            .bind(execution.plan_id)
            .fetch_one(&mut *tx)
            .await?
            .into_plan();

        if execution.state.is_terminal() {
            tx.commit().await?;
            return Ok(ExecutionUpdateOutcome {
                applied: false,
                execution,
                vm_state: None,
            });
        }

        let mut vm_state = None;
        if update.state == ExecutionState::Succeeded {
            if let Some(settled) = execution.operation_type.state_after_success() {
                let settled_str = enum_str(&settled)?;
                let existing: Option<Uuid> = sqlx::query_scalar(
                    "SELECT id FROM microvms WHERE site_id = $1 AND name = $2 FOR UPDATE",
                )
                .bind(site_id)
                .bind(&execution.vm_id)
                .fetch_optional(&mut *tx)
                .await?;
                match (execution.operation_type, existing) {
                    (OperationKind::Create, None) => {
                        let (vcpu_count, memory_mib) = match &execution.spec {
                            ActionSpec::Create {
                                vcpu_count,
                                memory_mib,
                                ..
                            } => (*vcpu_count, *memory_mib),
                            _ => (0, 0),
                        };
                        sqlx::query(
                            r"INSERT INTO microvms (id, tenant_id, site_id, host_id, name, state,
                                                    vcpu_count, memory_mib, updated_at)
                              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                        )
                        .bind(Uuid::new_v4())
                        .bind(plan.tenant_id)
                        .bind(site_id)
                        .bind(execution.assigned_host_id)
                        .bind(&execution.vm_id)
                        .bind(&settled_str)
                        .bind(db_i32(vcpu_count))
                        .bind(db_i64(memory_mib))
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                        vm_state = Some(settled);
                    }
                    (_, Some(vm_id)) => {
                        sqlx::query(
                            "UPDATE microvms SET state = $2, updated_at = $3 WHERE id = $1",
                        )
                        .bind(vm_id)
                        .bind(&settled_str)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                        vm_state = Some(settled);
                    }
                    (_, None) => {}
                }
            }
        }

        sqlx::query(
            r"UPDATE executions
              SET state = $2, error_code = $3, error_message = $4,
                  lease_expires_at = NULL, updated_at = $5
              WHERE id = $1",
        )
        .bind(execution.id)
        .bind(enum_str(&update.state)?)
        .bind(&update.error_code)
        .bind(&update.error_message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        execution.state = update.state;
        execution.error_code = update.error_code;
        execution.error_message = update.error_message;
        execution.lease_expires_at = None;
        execution.updated_at = now;

        Ok(ExecutionUpdateOutcome {
            applied: true,
            execution,
            vm_state,
        })
    }

    async fn append_log_frames(&self, frames: Vec<LogFrame>) -> Result<usize, StoreError> {
        let mut appended = 0;
        for frame in frames {
            let result = sqlx::query(
                r"INSERT INTO execution_logs (execution_id, sequence, severity, message, emitted_at)
                  VALUES ($1, $2, $3, $4, $5)
                  ON CONFLICT (execution_id, sequence) DO NOTHING",
            )
            .bind(frame.execution_id)
            .bind(i64::from(frame.sequence))
            .bind(enum_str(&frame.severity)?)
            .bind(&frame.message)
            .bind(frame.emitted_at)
            .execute(&self.pool)
            .await?;
            appended += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        Ok(appended)
    }

    async fn list_log_frames(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogLine>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY sequence",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let severity: String = row.get("severity");
                Ok(ExecutionLogLine {
                    execution_id: row.get("execution_id"),
                    sequence: db_u32(i32::try_from(row.get::<i64, _>("sequence")).unwrap_or(0)),
                    severity: parse_enum::<LogSeverity>(&severity)?,
                    message: row.get("message"),
                    emitted_at: row.get("emitted_at"),
                })
            })
            .collect()
    }

    async fn record_heartbeat(
        &self,
        agent_id: Uuid,
        facts: HostFacts,
        reported: Vec<ReportedVm>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let agent = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("agent"))?
            .into_agent()?;
        if agent.state == AgentState::Unenrolled {
            return Err(StoreError::Invalid {
                reason: "agent is unenrolled".to_owned(),
            });
        }
        let agent_restored = agent.state == AgentState::Offline;
        let online = enum_str(&AgentState::Online)?;

        sqlx::query(
            r"UPDATE agents
              SET state = $2, last_heartbeat_at = $3, agent_version = $4, kernel_version = $5
              WHERE id = $1",
        )
        .bind(agent_id)
        .bind(&online)
        .bind(now)
        .bind(&facts.agent_version)
        .bind(&facts.kernel_version)
        .execute(&mut *tx)
        .await?;

        let host = sqlx::query_as::<_, HostRow>(
            r"UPDATE hosts
              SET cpu_cores_total = $2, memory_bytes_total = $3, storage_bytes_total = $4,
                  kvm_available = $5, cloud_hypervisor_available = $6,
                  last_facts_at = $7, agent_state = $8
              WHERE id = $1
              RETURNING *",
        )
        .bind(agent.host_id)
        .bind(db_i32(facts.cpu_cores_total))
        .bind(db_i64(facts.memory_bytes_total))
        .bind(db_i64(facts.storage_bytes_total))
        .bind(facts.kvm_available)
        .bind(facts.cloud_hypervisor_available)
        .bind(now)
        .bind(&online)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("host"))?
        .into_host()?;

        for report in reported {
            if !matches!(
                report.state,
                VmState::Running | VmState::Stopped | VmState::Paused
            ) {
                continue;
            }
            sqlx::query(
                r"UPDATE microvms SET state = $3, updated_at = $4
                  WHERE site_id = $1 AND name = $2",
            )
            .bind(agent.site_id)
            .bind(&report.vm_id)
            .bind(enum_str(&report.state)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let online_site = enum_str(&ConnectivityState::Online)?;
        let previous: Option<String> = sqlx::query_scalar(
            "SELECT connectivity_state FROM sites WHERE id = $1 FOR UPDATE",
        )
        .bind(agent.site_id)
        .fetch_optional(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE sites SET connectivity_state = $2, last_heartbeat_at = $3 WHERE id = $1",
        )
        .bind(agent.site_id)
        .bind(&online_site)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let site_restored = previous.as_deref() != Some(online_site.as_str());

        tx.commit().await?;
        Ok(HeartbeatOutcome {
            host,
            agent_restored,
            site_restored,
        })
    }

    async fn sweep_offline(
        &self,
        stale_before: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<SweepOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let online = enum_str(&AgentState::Online)?;
        let offline = enum_str(&AgentState::Offline)?;

        let agents_marked: Vec<Uuid> = sqlx::query_scalar(
            r"UPDATE agents SET state = $1
              WHERE state = $2 AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $3)
              RETURNING id",
        )
        .bind(&offline)
        .bind(&online)
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r"UPDATE hosts SET agent_state = $1
              WHERE id IN (SELECT host_id FROM agents WHERE state = $1)",
        )
        .bind(&offline)
        .execute(&mut *tx)
        .await?;

        let sites_marked: Vec<Uuid> = sqlx::query_scalar(
            r"UPDATE sites SET connectivity_state = $1
              WHERE connectivity_state = $2
                AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $3)
              RETURNING id",
        )
        .bind(enum_str(&ConnectivityState::Offline)?)
        .bind(enum_str(&ConnectivityState::Online)?)
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SweepOutcome {
            agents_marked,
            sites_marked,
        })
    }

    async fn append_audit(&self, new: NewAuditEvent) -> Result<AuditEvent, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Serialize chain appends across connections.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_CHAIN_LOCK)
            .execute(&mut *tx)
            .await?;

        let prev_hash: Option<String> = sqlx::query_scalar(
            "SELECT entry_hash FROM audit_events ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let mut event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            tenant_id: new.tenant_id,
            site_id: new.site_id,
            actor_type: new.actor_type,
            actor_id: new.actor_id,
            action: new.action,
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            request_id: new.request_id,
            source_ip: new.source_ip,
            metadata: new.metadata,
            prev_hash: prev_hash.unwrap_or_else(|| audit::CHAIN_GENESIS.to_owned()),
            entry_hash: String::new(),
        };
        event.entry_hash = audit::compute_entry_hash(&event);

        sqlx::query(
            r"INSERT INTO audit_events (id, timestamp, tenant_id, site_id, actor_type, actor_id,
                                        action, resource_type, resource_id, request_id, source_ip,
                                        metadata, prev_hash, entry_hash)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(event.tenant_id)
        .bind(event.site_id)
        .bind(enum_str(&event.actor_type)?)
        .bind(&event.actor_id)
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(event.request_id)
        .bind(&event.source_ip)
        .bind(&event.metadata)
        .bind(&event.prev_hash)
        .bind(&event.entry_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn list_audit(&self, limit: Option<usize>) -> Result<Vec<AuditEvent>, StoreError> {
        let limit = limit.map_or(i64::MAX, |l| db_i64(l as u64));
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM audit_events ORDER BY seq LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AuditRow::into_event).collect()
    }

    async fn add_crl_entry(&self, entry: CrlEntry) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO crl_entries (serial, revoked_at, reason, agent_id)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (serial) DO NOTHING",
        )
        .bind(&entry.serial)
        .bind(entry.revoked_at)
        .bind(&entry.reason)
        .bind(entry.agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_crl_entries(&self) -> Result<Vec<CrlEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM crl_entries ORDER BY revoked_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| CrlEntry {
                serial: row.get("serial"),
                revoked_at: row.get("revoked_at"),
                reason: row.get("reason"),
                agent_id: row.get("agent_id"),
            })
            .collect())
    }
}
