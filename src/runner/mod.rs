//! Run orchestration: validate a configuration, persist the run, and hand it
//! to a dedicated worker task.

pub mod stats;
mod worker;

use crate::config::WorkerConfig;
use crate::core::{EventPayload, LORENZ96_MODEL, Run, RunConfig, RunId, StoreError};
use crate::engine::{AnalysisRegistry, EngineError};
use crate::storage::RunStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;
use worker::WorkerContext;

/// Largest accepted `lorenz96_n`. Analyses allocate n×n matrices per cycle.
pub const MAX_STATE_DIMENSION: usize = 2_000;

/// Largest accepted `ensemble_size`.
pub const MAX_ENSEMBLE_SIZE: usize = 1_000;

/// Largest accepted number of assimilation cycles per stage.
pub const MAX_CYCLES: f64 = 100_000.0;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Worker task failed: {0}")]
    Join(String),
}

/// A submitted run and the handle of its worker.
#[derive(Debug)]
pub struct RunTicket {
    pub run: Run,
    handle: JoinHandle<()>,
}

impl RunTicket {
    pub fn run_id(&self) -> RunId {
        self.run.run_id
    }

    /// Wait for the worker to leave the run in a terminal status.
    pub async fn wait(self) -> Result<(), RunError> {
        self.handle
            .await
            .map_err(|err| RunError::Join(err.to_string()))
    }
}

#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    registry: Arc<AnalysisRegistry>,
    config: WorkerConfig,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<AnalysisRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn registry(&self) -> &AnalysisRegistry {
        &self.registry
    }

    /// Reject configurations that must never reach the store.
    pub fn validate(&self, request: &RunConfig) -> Result<(), RunError> {
        let invalid = |message: String| Err(RunError::InvalidConfig(message));

        if request.model != LORENZ96_MODEL {
            return invalid(format!(
                "Unsupported model '{}': only {LORENZ96_MODEL} is enabled",
                request.model
            ));
        }

        let mut seen = HashSet::new();
        for stage in &request.methods {
            if !seen.insert(stage.id.as_str()) {
                return invalid(format!("Duplicate method instance id: {}", stage.id));
            }
            if !self.registry.contains(&stage.name) {
                return invalid(format!("Unknown method: {}", stage.name));
            }
        }

        if !(2..=MAX_ENSEMBLE_SIZE).contains(&request.ensemble_size) {
            return invalid(format!(
                "ensemble_size must be between 2 and {MAX_ENSEMBLE_SIZE}"
            ));
        }
        if !(4..=MAX_STATE_DIMENSION).contains(&request.lorenz96_n) {
            return invalid(format!(
                "lorenz96_n must be between 4 and {MAX_STATE_DIMENSION}"
            ));
        }
        if request.m == 0 || request.m > request.lorenz96_n {
            return invalid(format!(
                "m must be between 1 and lorenz96_n ({})",
                request.lorenz96_n
            ));
        }

        let finite = [
            ("std_obs", request.std_obs),
            ("obs_freq", request.obs_freq),
            ("end_time", request.end_time),
            ("inf_fact", request.inf_fact),
            ("lorenz96_F", request.lorenz96_f),
        ];
        if let Some((name, _)) = finite.iter().find(|(_, value)| !value.is_finite()) {
            return invalid(format!("{name} must be a finite number"));
        }

        if request.std_obs <= 0.0 {
            return invalid("std_obs must be positive".to_string());
        }
        if request.obs_freq <= 0.0 {
            return invalid("obs_freq must be positive".to_string());
        }
        if request.end_time < 0.0 {
            return invalid("end_time must not be negative".to_string());
        }
        if request.end_time / request.obs_freq > MAX_CYCLES {
            return invalid(format!(
                "end_time / obs_freq must not exceed {MAX_CYCLES} cycles"
            ));
        }

        Ok(())
    }

    /// Validate, create the run in `queued` status, record `run_created`,
    /// then start its worker. Returns before any stage executes.
    pub async fn submit(&self, request: RunConfig) -> Result<RunTicket, RunError> {
        self.validate(&request)?;

        let run_id = Uuid::new_v4();
        let run = self.store.create_run(run_id, &request).await?;
        self.store
            .append_event(EventPayload::RunCreated {
                run_id,
                request: request.clone(),
                ts: Utc::now(),
            })
            .await?;

        info!(
            run_id = %run_id,
            stages = request.methods.len(),
            end_time = request.end_time,
            "run queued"
        );

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        };
        let handle = tokio::spawn(worker::execute_run(ctx, run_id, request));

        Ok(RunTicket { run, handle })
    }
}
