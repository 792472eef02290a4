mod api;
mod config;
mod error;
mod services;
mod store;
mod tls;
mod types;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use api::AppState;
use config::Args;
use services::agent_api::HttpAgentEndpoint;
use services::checkpoint::{checkpoint_loop, CheckpointSource, HttpCheckpointSink};
use services::container_runtime::{ContainerRuntime, DockerRuntime};
use services::wireguard::{ServerRecord, WgCliStats};
use services::{
    challenge_sweeper, fleet_reconciler, AgentLedger, ChallengeStore, ClientRegistry,
    ServiceRegistry,
};

const CHALLENGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
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

    info!("Starting Erebrus gateway");

    let cfg = args.resolve()?;

    // WireGuard server identity survives restarts
    let server = Arc::new(ServerRecord::load_or_init(&cfg.wireguard)?);
    info!(
        "WireGuard server {} listening on {}",
        server.public_key, server.listen_port
    );

    let clients = ClientRegistry::new(
        cfg.wireguard.clients_dir.clone(),
        cfg.wireguard.interface_file.clone(),
        server,
        Arc::new(WgCliStats),
    );
    let service_registry = ServiceRegistry::new(&cfg.proxy);

    let cancel = CancellationToken::new();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime);
    let agents = AgentLedger::new(
        cfg.agents.clone(),
        runtime.clone(),
        Arc::new(HttpAgentEndpoint::new()?),
        service_registry.clone(),
        cancel.clone(),
    );
    let challenges = Arc::new(ChallengeStore::new(cfg.challenge_ttl));

    // Regenerate derived files from the persisted records
    if let Err(e) = service_registry.sync_site_file().await {
        warn!("Failed to regenerate proxy site file: {}", e);
    }
    if let Err(e) = clients.sync_interface().await {
        warn!("Failed to regenerate WireGuard interface file: {}", e);
    }

    // Background tasks
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(fleet_reconciler(
        agents.clone(),
        runtime,
        cfg.agents.reconcile_interval,
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(challenge_sweeper(
        challenges.clone(),
        CHALLENGE_SWEEP_INTERVAL,
        cancel.clone(),
    )));
    match &cfg.checkpoint_url {
        Some(url) => {
            let sink = Arc::new(HttpCheckpointSink::new(url.clone())?);
            let source = CheckpointSource {
                node_name: cfg.node_name.clone(),
                clients: clients.clone(),
                agents: agents.clone(),
                services: service_registry.clone(),
            };
            tasks.push(tokio::spawn(checkpoint_loop(
                source,
                sink,
                cfg.checkpoint_interval,
                cancel.clone(),
            )));
        }
        None => info!("No checkpoint endpoint configured, checkpoints disabled"),
    }

    let state = Arc::new(AppState {
        clients,
        services: service_registry,
        agents,
        challenges,
        auth_eula: cfg.auth_eula.clone(),
    });

    let app = api::create_router(state);

    tokio::spawn(shutdown_signal(cancel.clone()));

    let addr: SocketAddr = args.bind.parse()?;

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load_rustls_config(cert, key)?;
            let handle = axum_server::Handle::new();

            let shutdown_handle = handle.clone();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!("Listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.clone().cancelled_owned())
                .await?;
        }
    }

    // The server may also stop on its own; make sure the loops follow.
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("Erebrus gateway stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
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
    cancel.cancel();
}
