//! cloudfleet controller
//!
//! Owns the lifecycle of ephemeral build agents across configured clouds.
//!
//! ## Startup order
//!
//! - **Recovery**: replay termination ledgers left by a previous run, before
//!   anything else may terminate nodes
//! - **Retention worker**: flags agents idle past their retention time
//! - **Cleanup sweeper**: terminates flagged agents
//! - **HTTP server**: phone-home callbacks, agent launch and delete, build
//!   sessions, health
//!
//! Build sessions still open at shutdown are torn down before exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use cloudfleet_controller::{
    agent::AgentInventory,
    api::{self, ApiState},
    clock::SystemClock,
    clouds::CloudRegistry,
    config::{self, Config},
    driver::MockCloudDriver,
    launcher::AgentLauncher,
    ledger::{LedgerStore, StartupRecovery, Terminator},
    phone_home::PhoneHomeRegistry,
    pool::WorkerPool,
    provision::Provisioner,
    retention::{RetentionStrategy, RetentionWorker},
    session::{BuildSessions, SupplementalInstances},
    sweeper::CleanupSweeper,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CLOUDFLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting cloudfleet controller");
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        clouds_file = %config.clouds_file.display(),
        "Configuration loaded"
    );

    let pool = WorkerPool::new(config.max_concurrent_calls);

    let profiles = config::load_cloud_profiles(&config.clouds_file)?;
    let mut clouds = CloudRegistry::new().with_pool(pool.clone());
    for profile in profiles {
        // No provider SDKs are linked in; every cloud runs against the mock.
        warn!(cloud = %profile.name, "Using mock driver");
        clouds.insert(profile, Arc::new(MockCloudDriver::new()));
    }
    let clouds = Arc::new(clouds);
    info!(clouds = clouds.len(), "Clouds registered");

    let store = Arc::new(LedgerStore::new(&config.data_dir));

    let recovery = StartupRecovery::new(Arc::clone(&store), Arc::clone(&clouds), pool.clone())
        .run()
        .await;
    if !recovery.is_clean() {
        for failure in &recovery.failures {
            warn!(error = %failure, "Ledger recovery incomplete");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let terminator = Arc::new(Terminator::new(store, Arc::clone(&clouds), pool.clone()));
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&terminator),
        pool,
        config.provisioner(),
    ));
    let inventory = Arc::new(AgentInventory::new());
    let phone_home = Arc::new(PhoneHomeRegistry::new());
    let launcher = Arc::new(AgentLauncher::new(
        Arc::clone(&clouds),
        Arc::clone(&provisioner),
        Arc::clone(&inventory),
        Arc::clone(&phone_home),
        Arc::new(SystemClock),
    ));
    let supplemental = Arc::new(SupplementalInstances::new(
        Arc::clone(&clouds),
        provisioner,
        Arc::clone(&phone_home),
    ));
    let sessions = Arc::new(BuildSessions::new());

    let strategy = Arc::new(RetentionStrategy::new(
        Arc::clone(&clouds),
        Arc::new(SystemClock),
        config.retention(),
    ));
    let retention_worker =
        RetentionWorker::new(strategy, Arc::clone(&inventory), config.retention_interval);
    let retention_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            retention_worker.run(shutdown_rx).await;
        }
    });

    let sweeper = Arc::new(CleanupSweeper::new(
        Arc::clone(&inventory),
        terminator,
        config.sweeper(),
    ));
    let sweeper_handle = tokio::spawn({
        let sweeper = Arc::clone(&sweeper);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweeper.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(ApiState {
        phone_home,
        inventory,
        launcher,
        sweeper,
        supplemental,
        sessions: Arc::clone(&sessions),
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, retention_handle).await {
        warn!(error = %e, "Retention worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweeper_handle).await {
        warn!(error = %e, "Cleanup sweeper did not shut down in time");
    }

    for (session_id, env) in sessions.drain() {
        info!(session_id = %session_id, "Tearing down open build session");
        let report = env.tear_down().await;
        if !report.is_clean() {
            warn!(session_id = %session_id, failed = report.failures.len(), "Session teardown incomplete");
        }
    }

    info!("Controller shutdown complete");
    Ok(())
}
