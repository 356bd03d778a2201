//! Process wiring shared by the binary and the HTTP integration tests.

use crate::config::AppConfig;
use crate::engine::AnalysisRegistry;
use crate::retention::RetentionSweeper;
use crate::runner::RunOrchestrator;
use crate::storage::{JournaledStore, RunStore};
use crate::web::{AppState, build_router};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Everything a running server owns besides its listener.
pub struct AppBootstrap {
    pub router: Router,
    pub store: Arc<JournaledStore>,
    sweeper: RetentionSweeper,
}

impl AppBootstrap {
    /// Stop the sweeper, then compact the store so the next start replays
    /// nothing.
    pub async fn shutdown(self) -> Result<()> {
        self.sweeper.stop().await;
        self.store
            .checkpoint()
            .await
            .context("failed to checkpoint run store")?;
        let stats = self.store.stats().await;
        info!(
            runs = stats.runs,
            events = stats.events,
            points = stats.points,
            "run store closed"
        );
        Ok(())
    }
}

/// Open the store, start the sweeper, and assemble the router.
pub async fn bootstrap(config: &AppConfig) -> Result<AppBootstrap> {
    info!(
        bind = %config.address(),
        data_dir = %config.storage.data_dir.display(),
        durability = ?config.storage.durability,
        "bootstrapping assimilation run service"
    );

    let store = Arc::new(
        JournaledStore::open(&config.storage).context("failed to open run store")?,
    );
    let shared: Arc<dyn RunStore> = store.clone();

    let sweeper = RetentionSweeper::spawn(Arc::clone(&shared), config.retention.clone());
    let orchestrator = RunOrchestrator::new(
        shared,
        Arc::new(AnalysisRegistry::with_reference_algorithms()),
        config.worker.clone(),
    );
    let router = build_router(AppState::new(orchestrator, config.stream.clone()));

    Ok(AppBootstrap {
        router,
        store,
        sweeper,
    })
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("assimrun=debug,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
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
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    #[tokio::test]
    async fn bootstrap_in_memory_and_shutdown() {
        let config = AppConfig {
            storage: StorageConfig::in_memory(),
            ..AppConfig::default()
        };
        let boot = bootstrap(&config).await.unwrap();
        assert_eq!(boot.store.stats().await.runs, 0);
        boot.shutdown().await.unwrap();
    }
}
