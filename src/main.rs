//! foreman - controller entry point
//!
//! Wires configuration, the record store, the oracle and the session manager
//! into the scheduler and runs it until Ctrl+C or SIGTERM.

use std::sync::Arc;

use foreman::config::Config;
use foreman::llm::{OpenRouterBackend, RetryConfig};
use foreman::oracle::DecisionOracle;
use foreman::session::{ProcessIsolation, SessionManager};
use foreman::{store, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        backend = ?config.store.backend,
        oracle = config.oracle.enabled,
        model = %config.oracle.model,
        max_sessions = config.scheduler.max_concurrent_sessions,
        "Loaded configuration"
    );

    let store = store::open(&config.store).await?;

    let oracle = match config.oracle.api_key.clone() {
        Some(api_key) if config.oracle.enabled => {
            // The oracle owns retries and timeouts.
            let backend = OpenRouterBackend::new(api_key, config.oracle.model.clone())
                .with_retry_config(RetryConfig::disabled());
            DecisionOracle::new(Arc::new(backend), config.oracle.clone())
        }
        _ => {
            warn!("Decision oracle disabled: no plan checks, completions go to review");
            DecisionOracle::disabled(config.oracle.clone())
        }
    };

    let isolation = Arc::new(ProcessIsolation::from_config(&config.session));
    let sessions = Arc::new(SessionManager::new(isolation, &config.session));

    let mut scheduler = Scheduler::new(
        store,
        Arc::new(oracle),
        sessions,
        config.scheduler.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    scheduler.run(cancel).await?;
    info!("foreman stopped");
    Ok(())
}

/// Cancel on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    cancel.cancel();
}
