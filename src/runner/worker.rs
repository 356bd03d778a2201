use super::RunError;
use super::stats::summarize;
use crate::config::WorkerConfig;
use crate::core::{
    EventPayload, MethodInstance, MethodStatus, Point, PointSample, RunConfig, RunId, RunStatus,
    StageSpec,
};
use crate::engine::{
    AnalysisRegistry, EngineError, Lorenz96, Model, SimulationSettings, StageSimulation,
};
use crate::storage::RunStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Absorbs drift from repeatedly adding the cadence.
const TIME_TOLERANCE: f64 = 1e-12;

#[derive(Clone)]
pub(super) struct WorkerContext {
    pub store: Arc<dyn RunStore>,
    pub registry: Arc<AnalysisRegistry>,
    pub config: WorkerConfig,
}

/// Drive a run to a terminal status. Errors from any stage fail the whole
/// run; completed stages stay persisted.
pub(super) async fn execute_run(ctx: WorkerContext, run_id: RunId, request: RunConfig) {
    info!(run_id = %run_id, stages = request.methods.len(), "run started");

    match drive_run(&ctx, run_id, &request).await {
        Ok(()) => info!(run_id = %run_id, "run completed"),
        Err(err) => {
            let message = err.to_string();
            error!(run_id = %run_id, error = %message, "run failed");
            if let Err(store_err) = mark_failed(ctx.store.as_ref(), run_id, &message).await {
                error!(run_id = %run_id, error = %store_err, "could not record run failure");
            }
        }
    }
}

async fn mark_failed(
    store: &dyn RunStore,
    run_id: RunId,
    message: &str,
) -> Result<(), RunError> {
    store
        .finish_run(
            RunStatus::Failed,
            Some(message.to_string()),
            EventPayload::RunFailed {
                run_id,
                error: message.to_string(),
                ts: Utc::now(),
            },
        )
        .await?;
    Ok(())
}

async fn drive_run(ctx: &WorkerContext, run_id: RunId, request: &RunConfig) -> Result<(), RunError> {
    let store = ctx.store.as_ref();
    store
        .set_run_status(run_id, RunStatus::Running, None)
        .await?;
    store
        .append_event(EventPayload::RunStarted {
            run_id,
            ts: Utc::now(),
        })
        .await?;

    let model: Arc<dyn Model> = Arc::new(Lorenz96::new(request.lorenz96_n, request.lorenz96_f));
    let settings = SimulationSettings {
        ensemble_size: request.ensemble_size,
        m: request.m,
        std_obs: request.std_obs,
        obs_freq: request.obs_freq,
        inf_fact: request.inf_fact,
    };

    for (index, stage) in request.methods.iter().enumerate() {
        let seed = request.seed.map(|seed| stage_seed(seed, index));
        run_stage(ctx, run_id, request, stage, &model, settings, seed).await?;
    }

    store
        .finish_run(
            RunStatus::Completed,
            None,
            EventPayload::RunCompleted {
                run_id,
                ts: Utc::now(),
            },
        )
        .await?;
    Ok(())
}

async fn run_stage(
    ctx: &WorkerContext,
    run_id: RunId,
    request: &RunConfig,
    stage: &StageSpec,
    model: &Arc<dyn Model>,
    settings: SimulationSettings,
    seed: Option<u64>,
) -> Result<(), RunError> {
    let store = ctx.store.as_ref();
    if !ctx.registry.contains(&stage.name) {
        return Err(EngineError::UnknownAlgorithm(stage.name.clone()).into());
    }

    let label = stage.display_label().to_string();
    let mut instance = MethodInstance {
        run_id,
        method_id: stage.id.clone(),
        name: stage.name.clone(),
        label: label.clone(),
        params: stage.params.clone(),
        status: MethodStatus::Running,
        metrics: None,
        runtime_sec: None,
    };
    store.upsert_method(instance.clone()).await?;
    store
        .append_event(EventPayload::MethodStarted {
            run_id,
            method_id: stage.id.clone(),
            name: stage.name.clone(),
            label: label.clone(),
            params: stage.params.clone(),
            ts: Utc::now(),
        })
        .await?;

    let analysis = ctx.registry.build(&stage.name, &stage.params, model)?;
    let stage_model = Arc::clone(model);
    let mut simulation = tokio::task::spawn_blocking(move || {
        StageSimulation::new(stage_model, analysis, settings, seed)
    })
    .await
    .map_err(|err| RunError::Join(err.to_string()))??;

    let started = Instant::now();
    let emit_every = ctx.config.emit_partial_every;
    let mut errors_a = Vec::new();
    let mut errors_b = Vec::new();
    let mut t = 0.0_f64;
    let mut step: u32 = 0;

    while t <= request.end_time + TIME_TOLERANCE {
        // Engine calls are synchronous and CPU-bound.
        let (returned, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = simulation.cycle();
            (simulation, outcome)
        })
        .await
        .map_err(|err| RunError::Join(err.to_string()))?;
        simulation = returned;
        let errors = outcome?;

        errors_a.push(errors.error_a);
        errors_b.push(errors.error_b);

        store
            .upsert_point(Point::new(
                run_id,
                &stage.id,
                PointSample {
                    step,
                    t,
                    error_b: errors.error_b,
                    error_a: errors.error_a,
                },
            ))
            .await?;

        if emit_every > 0 && step % emit_every == 0 {
            store
                .append_event(EventPayload::Partial {
                    run_id,
                    method_id: stage.id.clone(),
                    name: stage.name.clone(),
                    label: label.clone(),
                    step,
                    t,
                    error_a: errors.error_a,
                    error_b: errors.error_b,
                    ts: Utc::now(),
                })
                .await?;
        }

        t = advance_time(t, request.obs_freq);
        step += 1;
    }

    let runtime_sec = started.elapsed().as_secs_f64();
    let metrics = summarize(&errors_a, &errors_b);

    instance.status = MethodStatus::Completed;
    instance.metrics = Some(metrics);
    instance.runtime_sec = Some(runtime_sec);
    store.upsert_method(instance).await?;
    store
        .append_event(EventPayload::MethodCompleted {
            run_id,
            method_id: stage.id.clone(),
            name: stage.name.clone(),
            label,
            metrics,
            runtime_sec,
            ts: Utc::now(),
        })
        .await?;

    debug!(
        run_id = %run_id,
        method_id = %stage.id,
        steps = step,
        runtime_sec,
        "stage completed"
    );
    Ok(())
}

/// Next cycle time, rounded to 10 decimals so `t` stays on the cadence grid.
fn advance_time(t: f64, cadence: f64) -> f64 {
    ((t + cadence) * 1e10).round() / 1e10
}

/// Distinct, reproducible seed per stage.
fn stage_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_stays_on_cadence_grid() {
        let mut t = 0.0;
        let mut times = Vec::new();
        while t <= 1.0 + TIME_TOLERANCE {
            times.push(t);
            t = advance_time(t, 0.1);
        }
        assert_eq!(times.len(), 11);
        assert_eq!(times[3], 0.3);
        assert_eq!(times[10], 1.0);
    }

    #[test]
    fn stage_seeds_differ_per_stage() {
        assert_ne!(stage_seed(42, 0), stage_seed(42, 1));
        assert_eq!(stage_seed(42, 1), stage_seed(42, 1));
    }
}
