//! Full-router integration tests over the in-memory store.
//!
//! Each test drives the HTTP surface the way real callers do: admin
//! bootstrap, tenant provisioning, agent enrollment with a real CSR, and
//! heartbeat-driven plan execution.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use nkudo_server::config::{SecretStoreType, ServerConfig, StorageBackendType};
use nkudo_server::pki::{CertificateAuthority, CrlService};
use nkudo_server::routes::build_router;
use nkudo_server::state::AppState;
use nkudo_store::MemoryStore;

const ADMIN_KEY: &str = "nkadm_test_admin_key";

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        storage_backend: StorageBackendType::Memory,
        log_level: "warn".to_owned(),
        admin_key: ADMIN_KEY.to_owned(),
        default_enrollment_ttl: Duration::from_secs(900),
        agent_cert_ttl: Duration::from_secs(24 * 3600),
        heartbeat_interval: Duration::from_secs(30),
        plan_lease_ttl: Duration::from_secs(300),
        max_pending_plans: 16,
        heartbeat_offline_after: Duration::from_secs(120),
        offline_sweep_interval: Duration::from_secs(30),
        require_persistent_pki: false,
        ca_cert_file: None,
        ca_key_file: None,
        revocation_grace: Duration::from_secs(300),
        rate_limit_enroll_per_min: 1000,
        rate_limit_default_per_min: 10_000,
        audit_verify_interval: Duration::from_secs(300),
        secret_store: SecretStoreType::Env,
        public_url: "https://cp.test".to_owned(),
    }
}

fn test_app() -> Router {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(
            None,
            None,
            false,
            config.agent_cert_ttl,
            config.public_url.clone(),
        )
        .unwrap(),
    );
    let crl = Arc::new(CrlService::new(&ca, vec![]).unwrap());
    build_router(Arc::new(AppState::new(config, store, ca, crl)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn admin_post(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-admin-key", ADMIN_KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn bearer_request(method: &str, path: &str, key: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn agent_request(method: &str, path: &str, cert_pem: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-client-cert", urlencoding::encode(cert_pem).into_owned())
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn generate_csr() -> (rcgen::KeyPair, String) {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    let csr = params.serialize_request(&key).unwrap();
    (key, csr.pem().unwrap())
}

/// Admin bootstrap: tenant + api key + site + enrollment token.
struct Fixture {
    tenant_id: String,
    api_key: String,
    site_id: String,
    enrollment_token: String,
}

async fn bootstrap(app: &Router) -> Fixture {
    let (status, tenant) = send(
        app,
        admin_post(
            "/tenants",
            &json!({"slug": "acme", "name": "Acme", "primary_region": "eu-central"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let tenant_id = tenant["id"].as_str().unwrap().to_owned();

    let (status, key) = send(
        app,
        admin_post(
            &format!("/tenants/{tenant_id}/api-keys"),
            &json!({"name": "ci"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let api_key = key["key"].as_str().unwrap().to_owned();

    let (status, site) = send(
        app,
        bearer_request(
            "POST",
            &format!("/tenants/{tenant_id}/sites"),
            &api_key,
            Some(&json!({
                "name": "berlin",
                "external_key": "ber-1",
                "location_country_code": "DE"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let site_id = site["id"].as_str().unwrap().to_owned();

    let (status, token) = send(
        app,
        bearer_request(
            "POST",
            &format!("/tenants/{tenant_id}/enrollment-tokens"),
            &api_key,
            Some(&json!({"site_id": site_id, "ttl_seconds": 900})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let enrollment_token = token["token"].as_str().unwrap().to_owned();

    Fixture {
        tenant_id,
        api_key,
        site_id,
        enrollment_token,
    }
}

fn enroll_body(token: &str, csr_pem: &str) -> Value {
    json!({
        "enrollment_token": token,
        "hostname": "edge-01",
        "agent_version": "0.3.0",
        "os": "linux",
        "arch": "x86_64",
        "kernel_version": "6.8.0",
        "csr_pem": csr_pem,
        "bootstrap_nonce": "nonce-1"
    })
}

fn heartbeat_body(agent_id: &str, seq: u64, vms: Value, updates: Value) -> Value {
    json!({
        "agent_id": agent_id,
        "heartbeat_seq": seq,
        "hostname": "edge-01",
        "cpu_cores_total": 8,
        "memory_bytes_total": 16_000_000_000u64,
        "storage_bytes_total": 500_000_000_000u64,
        "kvm_available": true,
        "cloud_hypervisor_available": true,
        "agent_version": "0.3.0",
        "os": "linux",
        "arch": "x86_64",
        "kernel_version": "6.8.0",
        "microvms": vms,
        "execution_updates": updates
    })
}

async fn enroll_agent(app: &Router, fixture: &Fixture) -> (String, String, String) {
    let (_, csr_pem) = generate_csr();
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/v1/enroll")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                enroll_body(&fixture.enrollment_token, &csr_pem).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "enroll failed: {body}");
    (
        body["agent_id"].as_str().unwrap().to_owned(),
        body["client_certificate_pem"].as_str().unwrap().to_owned(),
        body["refresh_token"].as_str().unwrap().to_owned(),
    )
}

// ── Scenario 1: bootstrap → enroll → heartbeat ───────────────────────

#[tokio::test]
async fn bootstrap_enroll_heartbeat_brings_site_online() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    // Site starts UNKNOWN.
    let (_, sites) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/tenants/{}/sites", fixture.tenant_id),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(sites[0]["connectivity_state"], "UNKNOWN");

    let (agent_id, cert_pem, _) = enroll_agent(&app, &fixture).await;

    let (status, hb) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 1, json!([]), json!([]))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hb["next_heartbeat_seconds"], 30);

    let (_, sites) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/tenants/{}/sites", fixture.tenant_id),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(sites[0]["connectivity_state"], "ONLINE");

    let (_, hosts) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/sites/{}/hosts", fixture.site_id),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(hosts[0]["cpu_cores_total"], 8);
    assert_eq!(hosts[0]["kvm_available"], true);
}

// ── Scenario 2: VM lifecycle via plan ────────────────────────────────

fn lifecycle_plan() -> Value {
    json!({
        "idempotency_key": "plan-1",
        "actions": [
            {"operation_id": "a", "operation": "CREATE", "vm_id": "vm1",
             "vcpu_count": 2, "memory_mib": 512},
            {"operation_id": "b", "operation": "START", "vm_id": "vm1"}
        ]
    })
}

#[tokio::test]
async fn vm_lifecycle_via_plan_reaches_running() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (agent_id, cert_pem, _) = enroll_agent(&app, &fixture).await;

    let (status, plan) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&lifecycle_plan()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(plan["deduplicated"], false);
    assert_eq!(plan["status"], "PENDING");
    let executions = plan["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|e| e["state"] == "PENDING"));

    // The agent's next heartbeat receives both actions, in order.
    let (_, hb) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 1, json!([]), json!([]))),
        ),
    )
    .await;
    let plans = hb["pending_plans"].as_array().unwrap();
    assert_eq!(plans.len(), 1);
    let actions = plans[0]["actions"].as_array().unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["operation_id"], "a");
    assert_eq!(actions[0]["operation"], "CREATE");
    assert_eq!(actions[1]["operation_id"], "b");

    // Report success for both.
    let updates: Vec<Value> = actions
        .iter()
        .map(|a| json!({"execution_id": a["execution_id"], "state": "SUCCEEDED"}))
        .collect();
    let (status, _) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 2, json!([]), json!(updates))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, vms) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/sites/{}/vms", fixture.site_id),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(vms[0]["vm_id"], "vm1");
    assert_eq!(vms[0]["state"], "RUNNING");
}

// ── Scenario 3: plan idempotency ─────────────────────────────────────

#[tokio::test]
async fn resubmitted_plan_is_deduplicated() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (_, first) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&lifecycle_plan()),
        ),
    )
    .await;

    let (status, second) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&lifecycle_plan()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["deduplicated"], true);
    assert_eq!(second["plan_id"], first["plan_id"]);
    assert_eq!(
        second["executions"].as_array().unwrap().len(),
        first["executions"].as_array().unwrap().len()
    );
    let first_ids: Vec<&str> = first["executions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["execution_id"].as_str().unwrap())
        .collect();
    let second_ids: Vec<&str> = second["executions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["execution_id"].as_str().unwrap())
        .collect();
    assert_eq!(first_ids, second_ids);
}

// ── Scenario 4: cross-tenant rejection ───────────────────────────────

#[tokio::test]
async fn cross_tenant_access_is_forbidden() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (status, other) = send(
        &app,
        admin_post(
            "/tenants",
            &json!({"slug": "rival", "name": "Rival", "primary_region": "us-east"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let other_id = other["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/tenants/{other_id}/sites"),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");
}

#[tokio::test]
async fn foreign_site_is_indistinguishable_from_absent() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (_, other) = send(
        &app,
        admin_post(
            "/tenants",
            &json!({"slug": "rival", "name": "Rival", "primary_region": "us-east"}),
        ),
    )
    .await;
    let other_id = other["id"].as_str().unwrap().to_owned();
    let (_, other_key) = send(
        &app,
        admin_post(&format!("/tenants/{other_id}/api-keys"), &json!({"name": "k"})),
    )
    .await;
    let other_key = other_key["key"].as_str().unwrap();

    let (status, body) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/sites/{}/vms", fixture.site_id),
            other_key,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "SITE_NOT_FOUND");
}

// ── Scenario 5: token reuse ──────────────────────────────────────────

#[tokio::test]
async fn enrollment_token_reuse_is_rejected() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let _ = enroll_agent(&app, &fixture).await;

    let (_, csr_pem) = generate_csr();
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v1/enroll")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                enroll_body(&fixture.enrollment_token, &csr_pem).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "TOKEN_ALREADY_USED");
}

// ── Scenario 6: revocation ───────────────────────────────────────────

#[tokio::test]
async fn unenroll_revokes_certificate() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (agent_id, cert_pem, _) = enroll_agent(&app, &fixture).await;

    let (status, _) = send(&app, agent_request("POST", "/v1/unenroll", &cert_pem, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The next heartbeat with the same cert is rejected.
    let (status, body) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 3, json!([]), json!([]))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "CERTIFICATE_REVOKED");

    // The serial is published on the CRL.
    let (status, _) = send(
        &app,
        Request::builder()
            .method("GET")
            .uri("/v1/crl.pem")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Unenroll is idempotent at the protocol level: the cert is revoked,
    // so a second call fails closed with 401 rather than 500.
    let (status, _) = send(&app, agent_request("POST", "/v1/unenroll", &cert_pem, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ── Boundary behaviors ───────────────────────────────────────────────

#[tokio::test]
async fn empty_plan_is_rejected() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (status, body) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&json!({"idempotency_key": "empty", "actions": []})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

#[tokio::test]
async fn duplicate_operation_id_is_rejected() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (status, body) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&json!({
                "idempotency_key": "dup",
                "actions": [
                    {"operation_id": "a", "operation": "START", "vm_id": "vm1"},
                    {"operation_id": "a", "operation": "STOP", "vm_id": "vm1"}
                ]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DUPLICATE_OPERATION");
}

#[tokio::test]
async fn unknown_operation_is_invalid_request() {
    let app = test_app();
    let fixture = bootstrap(&app).await;

    let (status, body) = send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&json!({
                "idempotency_key": "bad-op",
                "actions": [
                    {"operation_id": "a", "operation": "MIGRATE", "vm_id": "vm1"}
                ]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

#[tokio::test]
async fn terminal_execution_update_is_accepted_and_discarded() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (agent_id, cert_pem, _) = enroll_agent(&app, &fixture).await;

    send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&json!({
                "idempotency_key": "single",
                "actions": [{"operation_id": "a", "operation": "CREATE", "vm_id": "vm9",
                             "vcpu_count": 1, "memory_mib": 256}]
            })),
        ),
    )
    .await;

    let (_, hb) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 1, json!([]), json!([]))),
        ),
    )
    .await;
    let execution_id = hb["pending_plans"][0]["actions"][0]["execution_id"].clone();

    let fail = json!({"updates": [{"execution_id": execution_id, "state": "FAILED",
                                   "error_code": "PROVIDER_ERROR", "error_message": "boom"}]});
    let (status, body) = send(
        &app,
        agent_request("POST", "/v1/executions/result", &cert_pem, Some(&fail)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], 1);

    // A later, contradictory update is accepted (200) and discarded.
    let succeed = json!({"updates": [{"execution_id": execution_id, "state": "SUCCEEDED"}]});
    let (status, body) = send(
        &app,
        agent_request("POST", "/v1/executions/result", &cert_pem, Some(&succeed)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], 0);

    let (_, executions) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/sites/{}/executions?status=FAILED", fixture.site_id),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(executions.as_array().unwrap().len(), 1);
    assert_eq!(executions[0]["error_code"], "PROVIDER_ERROR");
}

#[tokio::test]
async fn heartbeat_requires_matching_agent_id() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (_, cert_pem, _) = enroll_agent(&app, &fixture).await;

    let forged = uuid::Uuid::new_v4().to_string();
    let (status, _) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&forged, 1, json!([]), json!([]))),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn renewal_requires_refresh_token_and_issues_new_serial() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (_, cert_pem, refresh_token) = enroll_agent(&app, &fixture).await;

    let (_, csr_pem) = generate_csr();
    let (status, _) = send(
        &app,
        agent_request(
            "POST",
            "/v1/renew",
            &cert_pem,
            Some(&json!({"refresh_token": "nkrt_wrong", "csr_pem": csr_pem})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        agent_request(
            "POST",
            "/v1/renew",
            &cert_pem,
            Some(&json!({"refresh_token": refresh_token, "csr_pem": csr_pem})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cert_serial"].as_str().unwrap().len() == 32);
    assert!(
        body["client_certificate_pem"]
            .as_str()
            .unwrap()
            .contains("BEGIN CERTIFICATE")
    );
}

#[tokio::test]
async fn execution_logs_are_ordered_by_sequence() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let (agent_id, cert_pem, _) = enroll_agent(&app, &fixture).await;

    send(
        &app,
        bearer_request(
            "POST",
            &format!("/sites/{}/plans", fixture.site_id),
            &fixture.api_key,
            Some(&json!({
                "idempotency_key": "logged",
                "actions": [{"operation_id": "a", "operation": "CREATE", "vm_id": "vm1",
                             "vcpu_count": 1, "memory_mib": 256}]
            })),
        ),
    )
    .await;
    let (_, hb) = send(
        &app,
        agent_request(
            "POST",
            "/v1/heartbeat",
            &cert_pem,
            Some(&heartbeat_body(&agent_id, 1, json!([]), json!([]))),
        ),
    )
    .await;
    let execution_id = hb["pending_plans"][0]["actions"][0]["execution_id"].clone();

    let frames = json!({"frames": [
        {"execution_id": execution_id, "sequence": 1, "severity": "INFO",
         "message": "second", "emitted_at": "2026-08-01T10:00:01Z"},
        {"execution_id": execution_id, "sequence": 0, "severity": "INFO",
         "message": "first", "emitted_at": "2026-08-01T10:00:00Z"}
    ]});
    let (status, body) = send(&app, agent_request("POST", "/v1/logs", &cert_pem, Some(&frames))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appended"], 2);

    let (_, logs) = send(
        &app,
        bearer_request(
            "GET",
            &format!("/executions/{}/logs", execution_id.as_str().unwrap()),
            &fixture.api_key,
            None,
        ),
    )
    .await;
    assert_eq!(logs[0]["message"], "first");
    assert_eq!(logs[1]["message"], "second");
}

#[tokio::test]
async fn audit_chain_verifies_after_activity() {
    let app = test_app();
    let fixture = bootstrap(&app).await;
    let _ = enroll_agent(&app, &fixture).await;

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/admin/audit/verify")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert!(body["entries"].as_u64().unwrap() >= 4);
}

#[tokio::test]
async fn admin_surface_rejects_bad_key() {
    let app = test_app();
    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/tenants")
            .header("x-admin-key", "wrong")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"slug": "x", "name": "X", "primary_region": "eu"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tenant_create_rejects_unknown_fields() {
    let app = test_app();
    let (status, body) = send(
        &app,
        admin_post(
            "/tenants",
            &json!({"slug": "y", "name": "Y", "primary_region": "eu", "extra": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

#[tokio::test]
async fn healthz_is_public() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
