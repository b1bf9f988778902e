//! nkudo control-plane entry point.
//!
//! Bootstraps the store, the CA, and the CRL, then starts the Axum server
//! with graceful shutdown. Two background workers run alongside: the
//! offline sweeper and the audit-chain verifier, both cancelled via a
//! `watch` channel on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{info, warn};

use nkudo_server::config::{SecretStoreType, ServerConfig, StorageBackendType};
use nkudo_server::pki::{CertificateAuthority, CrlService};
use nkudo_server::routes;
use nkudo_server::services::heartbeat;
use nkudo_server::state::AppState;
use nkudo_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    if config.secret_store != SecretStoreType::Env {
        warn!(
            secret_store = ?config.secret_store,
            "configured secret store is not supported in this build, falling back to env"
        );
        config.secret_store = SecretStoreType::Env;
    }
    if config.admin_key.is_empty() {
        let generated = nkudo_types::fingerprint::generate_secret("nkadm_");
        warn!("ADMIN_KEY not set — generated an ephemeral admin credential, see below");
        info!(admin_key = %generated, "ephemeral admin credential (development only)");
        config.admin_key = generated;
    }

    let store: Arc<dyn Store> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory store (data will not persist)");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!("using PostgreSQL store");
            Arc::new(
                nkudo_store::PostgresStore::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!(
                "DATABASE_URL is set but this build lacks the 'postgres-backend' feature"
            );
        }
    };

    let ca = Arc::new(
        CertificateAuthority::load_or_generate(
            config.ca_cert_file.as_deref(),
            config.ca_key_file.as_deref(),
            config.require_persistent_pki,
            config.agent_cert_ttl,
            config.public_url.clone(),
        )
        .context("CA initialization failed")?,
    );

    let persisted_revocations = store
        .list_crl_entries()
        .await
        .map_err(|e| anyhow::anyhow!("failed to load CRL entries: {e}"))?;
    info!(
        entries = persisted_revocations.len(),
        "revocation list loaded"
    );
    let crl = Arc::new(
        CrlService::new(&ca, persisted_revocations).context("initial CRL signing failed")?,
    );

    let state = Arc::new(AppState::new(config.clone(), store, ca, crl));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = tokio::spawn(heartbeat::offline_sweeper(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    let verifier_handle = tokio::spawn(heartbeat::audit_verifier(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));

    let app = build_app(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "nkudo control plane listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), sweeper_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), verifier_handle).await;

    info!("nkudo control plane stopped");
    Ok(())
}

/// Assemble the router with the panic barrier outermost: a panicking
/// handler renders 500 and the process keeps serving.
fn build_app(state: Arc<AppState>) -> Router {
    let audit_state = Arc::clone(&state);
    routes::build_router(state).layer(CatchPanicLayer::custom(
        move |_panic: Box<dyn std::any::Any + Send + 'static>| {
            let state = Arc::clone(&audit_state);
            tokio::spawn(async move {
                state
                    .audit(AppState::system_audit("handler.panic", "process", "server"))
                    .await;
            });
            tracing::error!("request handler panicked");
            axum::response::IntoResponse::into_response((
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({
                    "error": "INTERNAL",
                    "message": "internal error",
                    "request_id": uuid::Uuid::new_v4(),
                })),
            ))
        },
    ))
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
