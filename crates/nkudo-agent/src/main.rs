//! nkudo edge agent — enrolls a host into a site and executes microVM
//! plans from the control plane.
//!
//! Subcommands: `enroll` (redeem a token into an identity), `run` (the
//! long-lived heartbeat + executor + rotator process), `status`, and
//! `unenroll`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod client;
mod config;
mod error;
mod executor;
mod facts;
mod heartbeat;
mod identity;
mod provider;
mod statefile;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use nkudo_types::wire::EnrollRequest;

use crate::client::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::executor::Executor;
use crate::provider::Provider;
use crate::provider::local::LocalProvider;
use crate::statefile::{Identity, StateStore};

/// nkudo edge agent.
#[derive(Parser)]
#[command(
    name = "nkudo-agent",
    version,
    about = "nkudo edge agent — manages microVMs on this host for the nkudo control plane"
)]
struct Cli {
    #[command(flatten)]
    config: AgentConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Redeem an enrollment token and persist the issued identity.
    Enroll {
        /// Single-use enrollment token from the control plane.
        #[arg(long, env = "NKUDO_ENROLLMENT_TOKEN")]
        token: String,
    },
    /// Run the agent: heartbeat loop, plan executor, certificate rotator.
    Run,
    /// Show the enrolled identity and certificate lifetime.
    Status,
    /// Revoke this agent's certificate and detach from the site.
    Unenroll,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match cli.command {
        Commands::Enroll { token } => enroll(&cli.config, &token).await,
        Commands::Run => run(cli.config).await,
        Commands::Status => status(&cli.config),
        Commands::Unenroll => unenroll(&cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn enroll(config: &AgentConfig, token: &str) -> Result<()> {
    let mut state = StateStore::open(&config.state_dir).context("opening state store")?;
    if state.identity().is_ok() {
        bail!("already enrolled — run `nkudo-agent unenroll` first");
    }

    let (key_pem, csr_pem) =
        identity::generate_keypair_and_csr().context("generating keypair")?;
    let facts = facts::collect(config);

    let client = ControlPlaneClient::unauthenticated(&config.control_plane_url, config.insecure_tls)
        .context("building client")?;
    let response = client
        .enroll(&EnrollRequest {
            enrollment_token: token.to_owned(),
            hostname: facts.hostname.clone(),
            agent_version: facts.agent_version.clone(),
            os: facts.os.clone(),
            arch: facts.arch.clone(),
            kernel_version: facts.kernel_version.clone(),
            csr_pem,
            bootstrap_nonce: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .context("enrollment rejected")?;

    identity::write_pki_file(&config.pki_dir, identity::KEY_FILE, &key_pem)?;
    identity::write_pki_file(
        &config.pki_dir,
        identity::CERT_FILE,
        &response.client_certificate_pem,
    )?;
    identity::write_pki_file(&config.pki_dir, identity::CA_FILE, &response.ca_certificate_pem)?;

    let (_, not_after) = identity::cert_validity(&response.client_certificate_pem)?;
    let cert_serial = identity::cert_serial(&response.client_certificate_pem)?;
    state.set_identity(Identity {
        agent_id: response.agent_id,
        tenant_id: response.tenant_id,
        site_id: response.site_id,
        host_id: response.host_id,
        refresh_token: response.refresh_token,
        cert_serial,
        heartbeat_endpoint: response.heartbeat_endpoint,
        heartbeat_interval_sec: response.heartbeat_interval_sec,
    })?;

    println!("enrolled as agent {}", response.agent_id);
    println!("  site:        {}", response.site_id);
    println!("  host:        {}", response.host_id);
    println!("  cert expiry: {not_after}");
    Ok(())
}

async fn run(config: AgentConfig) -> Result<()> {
    let state = StateStore::open(&config.state_dir).context("opening state store")?;
    state.identity().context("loading identity")?;
    let state = Arc::new(Mutex::new(state));

    let key_pem = identity::read_pki_file(&config.pki_dir, identity::KEY_FILE)?;
    let cert_pem = identity::read_pki_file(&config.pki_dir, identity::CERT_FILE)?;
    let ca_pem = identity::read_pki_file(&config.pki_dir, identity::CA_FILE)?;
    let client = Arc::new(ControlPlaneClient::with_identity(
        &config.control_plane_url,
        &key_pem,
        &cert_pem,
        &ca_pem,
        config.insecure_tls,
    )?);

    let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new(
        config.runtime_dir.clone(),
        config.hypervisor_bin.clone(),
    ));
    if config.hypervisor_bin.is_none() {
        info!("no hypervisor binary configured — provider runs in state-only mode");
    }
    let executor = Arc::new(Executor::new(
        Arc::clone(&provider),
        Arc::clone(&state),
        config.action_timeout(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rotator = tokio::spawn(identity::rotation_loop(
        config.clone(),
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));

    let loop_handle = tokio::spawn(heartbeat::run(
        config,
        client,
        executor,
        state,
        provider,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), rotator).await;
    match tokio::time::timeout(std::time::Duration::from_secs(10), loop_handle).await {
        Ok(Ok(result)) => result.context("heartbeat loop failed")?,
        _ => {}
    }
    info!("agent stopped");
    Ok(())
}

fn status(config: &AgentConfig) -> Result<()> {
    let state = StateStore::open(&config.state_dir).context("opening state store")?;
    let Ok(identity_info) = state.identity() else {
        println!("not enrolled");
        return Ok(());
    };

    println!("agent:  {}", identity_info.agent_id);
    println!("tenant: {}", identity_info.tenant_id);
    println!("site:   {}", identity_info.site_id);
    println!("host:   {}", identity_info.host_id);
    println!("cached actions: {}", state.state().action_cache.len());

    match identity::read_pki_file(&config.pki_dir, identity::CERT_FILE)
        .and_then(|pem| identity::cert_validity(&pem))
    {
        Ok((_, not_after)) => println!("cert expiry: {not_after}"),
        Err(e) => println!("cert: unavailable ({e})"),
    }
    Ok(())
}

async fn unenroll(config: &AgentConfig) -> Result<()> {
    let mut state = StateStore::open(&config.state_dir).context("opening state store")?;
    state.identity().context("loading identity")?;

    let key_pem = identity::read_pki_file(&config.pki_dir, identity::KEY_FILE)?;
    let cert_pem = identity::read_pki_file(&config.pki_dir, identity::CERT_FILE)?;
    let ca_pem = identity::read_pki_file(&config.pki_dir, identity::CA_FILE)?;
    let client = ControlPlaneClient::with_identity(
        &config.control_plane_url,
        &key_pem,
        &cert_pem,
        &ca_pem,
        config.insecure_tls,
    )?;

    client.unenroll().await.context("unenroll rejected")?;
    state.clear_identity()?;
    println!("unenrolled — certificate revoked, local identity cleared");
    Ok(())
}
