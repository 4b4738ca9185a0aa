mod api;
mod config;
mod db;
mod error;
mod services;
mod tls;
mod types;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use api::nodes::AppState;
use config::ControlConfig;
use services::bus::{DnsHook, HttpBus, LogBus, LogDnsHook, MessageBus};
use services::credentials::{Argon2Hasher, CredentialVerifier, JwtSigner, MasterKey, TokenSigner};
use services::lifecycle::{random_secret, LifecycleSettings};
use services::propagation::PropagationSettings;
use services::{network_registry, user_registry, AuthorizationGate, NodeLifecycle, Propagator};
use types::ServerInfo;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "netmesh-control")]
#[command(about = "Netmesh control plane", long_about = None)]
struct Args {
    /// Bind address for the HTTP API
    #[arg(long, env = "NETMESH_BIND", default_value = "0.0.0.0:8081")]
    bind: String,

    /// Database file path
    #[arg(long, env = "NETMESH_DB_PATH")]
    db_path: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, env = "NETMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "NETMESH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, env = "NETMESH_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "NETMESH_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Require client certificates signed by this CA
    #[arg(long, env = "NETMESH_TLS_CLIENT_CA", requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,

    /// Master credential, overrides server.master_key
    #[arg(long, env = "NETMESH_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Netmesh Control Plane v{}", env!("CARGO_PKG_VERSION"));

    let mut cfg = match &args.config {
        Some(path) => ControlConfig::load(path)?,
        None => {
            warn!("No --config given, running with defaults and no networks");
            ControlConfig::default()
        }
    };
    if let Some(key) = args.master_key.clone() {
        cfg.server.master_key = Some(key);
    }

    let db = db::init_db(args.db_path.clone())?;

    let seeds = cfg.clone();
    let (networks, users) = db::execute_async(&db, move |conn| {
        let networks = network_registry::seed_networks(conn, &seeds.networks)?;
        let users = user_registry::seed_users(conn, &seeds.users)?;
        Ok((networks, users))
    })
    .await?;
    info!("Seeded {} networks and {} users from configuration", networks, users);

    let secret = if cfg.server.token_secret.is_empty() {
        warn!("server.token_secret is empty, issued tokens will not survive a restart");
        random_secret()
    } else {
        cfg.server.token_secret.clone()
    };
    let signer: Arc<dyn TokenSigner> = Arc::new(JwtSigner::new(
        secret.as_bytes(),
        Duration::from_secs(cfg.server.token_ttl_secs),
    )?);

    let master = match cfg.server.master_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => Some(MasterKey::new(key, cfg.server.master_key_sources.clone())?),
        None => {
            warn!("No master key configured");
            None
        }
    };
    let verifier = Arc::new(CredentialVerifier::new(signer.clone(), master));

    let propagation = PropagationSettings::from(&cfg.server);
    let bus: Arc<dyn MessageBus> = match &cfg.server.broker_url {
        Some(url) => {
            info!("Publishing to broker at {}", url);
            let token = cfg.server.broker_token.as_deref().map(Arc::from);
            Arc::new(HttpBus::new(url, token, propagation.timeout)?)
        }
        None => {
            warn!("No broker_url configured, peer updates will only be logged");
            Arc::new(LogBus)
        }
    };
    let dns: Arc<dyn DnsHook> = Arc::new(LogDnsHook);

    let server_info = ServerInfo {
        name: cfg.server.name.clone(),
        api_endpoint: cfg.server.api_endpoint.clone(),
        broker_endpoint: cfg.server.broker_url.clone(),
        traffic_key: cfg.server.traffic_public_key.clone(),
        client_mode: cfg.server.client_mode,
        dns_mode: cfg.server.dns_mode,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let propagator = Propagator::new(db.clone(), bus, server_info, propagation);

    let lifecycle = Arc::new(NodeLifecycle::new(
        db.clone(),
        Arc::new(Argon2Hasher),
        signer,
        propagator.clone(),
        dns,
        LifecycleSettings {
            allow_remote_exec: cfg.server.allow_remote_exec,
            dns_mode: cfg.server.dns_mode,
            server_traffic_key: cfg.server.traffic_public_key.clone(),
        },
    ));

    if cfg.server.client_mode {
        for net in &cfg.networks {
            if let Some(node) = lifecycle.ensure_server_node(&net.name, &cfg.server.name).await? {
                info!("Created server node {} in network {}", node.id, net.name);
            }
        }
    }

    let state = Arc::new(AppState {
        lifecycle,
        gate: AuthorizationGate::new(db.clone(), verifier),
    });
    let app = api::create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", args.bind))?;

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = tls::listener_config(cert, key, args.tls_client_ca.as_deref())?;
            let handle = axum_server::Handle::new();
            let signal_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    info!("Waiting for outstanding propagation jobs");
    propagator.shutdown(SHUTDOWN_GRACE).await;
    info!("Control plane stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
