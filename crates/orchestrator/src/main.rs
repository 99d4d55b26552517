use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rpa_browser::{ExecutionUnitManager, HttpExecutionUnitApi, UnitManagerConfig, UnitReaper};
use rpa_core::clock::{Clock, SystemClock};
use rpa_store::intake::{HttpJobIntake, JobIntake, MemoryIntake};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpa_orchestrator::background;
use rpa_orchestrator::{
    BatchAssembler, BatchDispatcher, DispatcherConfig, HeartbeatMonitor, HttpWorkerTransport,
    OrchestratorConfig, TotpCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rpa_orchestrator=debug,rpa_browser=info,rpa_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = OrchestratorConfig::from_env().context("Invalid orchestrator configuration")?;
    tracing::info!(
        workers = config.workers.len(),
        max_batch_size = config.coordination.max_batch_size,
        selection = ?config.coordination.worker_selection,
        "Loaded orchestrator configuration",
    );

    // --- State store ---
    let store = config
        .state_store
        .connect()
        .await
        .context("Failed to open the state store")?;

    // --- Intake ---
    let intake: Arc<dyn JobIntake> = match &config.intake_url {
        Some(url) => Arc::new(HttpJobIntake::new(url.clone())),
        None => Arc::new(MemoryIntake::new()),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let coordination = &config.coordination;

    // --- Coordination services ---
    let totp = Arc::new(
        TotpCoordinator::from_env(Arc::clone(&store), Arc::clone(&clock), coordination)
            .context("Failed to load TOTP secrets")?,
    );
    let transport = Arc::new(HttpWorkerTransport::new(reqwest::Client::new()));
    let dispatcher = Arc::new(BatchDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&intake),
        Arc::clone(&totp),
        transport,
        config.workers.clone(),
        Arc::clone(&clock),
        DispatcherConfig::from_coordination(coordination),
    ));
    let assembler = Arc::new(BatchAssembler::new(
        Arc::clone(&store),
        Arc::clone(&intake),
        Arc::clone(&clock),
        coordination,
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        Arc::clone(&store),
        Arc::clone(&intake),
        Arc::clone(&dispatcher),
        Arc::clone(&clock),
        coordination.batch_ttl,
    ));

    // --- Execution units ---
    let units = Arc::new(ExecutionUnitManager::new(
        Arc::clone(&store),
        Arc::new(HttpExecutionUnitApi::new(config.unit_control_url.clone())),
        Arc::clone(&clock),
        UnitManagerConfig::from_coordination(coordination),
    ));
    let reaper = UnitReaper::with_interval(Arc::clone(&units), config.reap_interval);

    // --- Background loops ---
    let cancel = CancellationToken::new();
    let handles: Vec<(&str, JoinHandle<()>)> = vec![
        (
            "dispatch",
            tokio::spawn(background::dispatch::run(
                assembler,
                Arc::clone(&dispatcher),
                config.dispatch_poll_interval,
                cancel.clone(),
            )),
        ),
        (
            "recovery",
            tokio::spawn(background::recovery::run(
                monitor,
                config.recovery_interval,
                cancel.clone(),
            )),
        ),
        (
            "store_purge",
            tokio::spawn(background::store_purge::run(Arc::clone(&store), cancel.clone())),
        ),
        ("reaper", {
            let cancel = cancel.clone();
            tokio::spawn(async move { reaper.run(cancel).await })
        }),
    ];
    tracing::info!("Orchestrator started");

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    for (name, handle) in handles {
        if tokio::time::timeout(config.shutdown_timeout, handle).await.is_err() {
            tracing::warn!(task = name, "Background task did not stop in time");
        }
    }

    match tokio::time::timeout(config.shutdown_timeout.max(Duration::from_secs(1)), units.shutdown_all()).await {
        Ok(Ok(summary)) => tracing::info!(
            terminated = summary.terminated,
            failed = summary.failed,
            "Execution units shut down",
        ),
        Ok(Err(e)) => tracing::error!(error = %e, "Failed to shut down execution units"),
        Err(_) => tracing::warn!("Execution unit shutdown timed out"),
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
