use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use rpa_browser::{ExecutionUnitManager, HttpExecutionUnitApi, UnitManagerConfig};
use rpa_core::clock::{Clock, SystemClock};
use rpa_store::intake::{HttpJobIntake, JobIntake, MemoryIntake};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpa_worker::router::build_app_router;
use rpa_worker::{
    AppState, BatchProcessor, CredentialStore, ProcessorConfig, ProviderRegistry, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rpa_worker=debug,rpa_browser=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        worker_id = %config.worker_id,
        host = %config.host,
        port = config.port,
        capacity = config.capacity,
        "Loaded worker configuration",
    );

    // --- State store ---
    let store = config
        .state_store
        .connect()
        .await
        .context("Failed to open the state store")?;

    let intake: Arc<dyn JobIntake> = match &config.intake_url {
        Some(url) => Arc::new(HttpJobIntake::new(url.clone())),
        None => Arc::new(MemoryIntake::new()),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Execution units ---
    let units = Arc::new(ExecutionUnitManager::new(
        Arc::clone(&store),
        Arc::new(HttpExecutionUnitApi::new(config.unit_control_url.clone())),
        Arc::clone(&clock),
        UnitManagerConfig::from_coordination(&config.coordination),
    ));

    // --- Provider automations ---
    let credentials = CredentialStore::from_env();
    if credentials.is_empty() {
        tracing::warn!("No provider credentials configured, every login will fail");
    } else {
        tracing::info!(providers = credentials.len(), "Provider credentials loaded");
    }

    let processor = Arc::new(BatchProcessor::new(
        ProcessorConfig::from_coordination(config.worker_id.clone(), config.capacity, &config.coordination),
        Arc::clone(&store),
        intake,
        units,
        ProviderRegistry::with_passthrough(),
        credentials,
        clock,
    ));

    let state = AppState {
        processor: Arc::clone(&processor),
        store,
    };
    let app = build_app_router(state, config.request_timeout);

    // --- Start server ---
    let host: IpAddr = config.host.parse().context("Invalid HOST address")?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting worker");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, stopping batch processing");
    if tokio::time::timeout(config.shutdown_timeout, processor.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Batches still running at shutdown, leaving them to heartbeat recovery");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
