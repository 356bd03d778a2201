use assimrun::core::{EventPayload, ParamValue};
use assimrun::engine::{
    AlgorithmDescriptor, Analysis, AnalysisRegistry, Background, EngineError, Observation, State,
    StochasticEnKF,
};
use assimrun::{
    EventKind, JournaledStore, MethodStatus, RunConfig, RunError, RunOrchestrator, RunStatus,
    RunStore, StageSpec, WorkerConfig,
};
use rand::rngs::StdRng;
use std::sync::Arc;

/// Plain EnKF that gives up after a fixed number of cycles.
struct DivergingAnalysis {
    inner: StochasticEnKF,
    remaining: usize,
}

impl Analysis for DivergingAnalysis {
    fn name(&self) -> &str {
        "diverging"
    }

    fn assimilate(
        &mut self,
        background: &Background,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> Result<&[State], EngineError> {
        if self.remaining == 0 {
            return Err(EngineError::Numerical("ensemble diverged".to_string()));
        }
        self.remaining -= 1;
        self.inner.assimilate(background, observation, rng)
    }

    fn inflate(&mut self, factor: f64) {
        self.inner.inflate(factor);
    }

    fn ensemble(&self) -> Option<&[State]> {
        self.inner.ensemble()
    }
}

fn registry_with_diverging() -> AnalysisRegistry {
    let mut registry = AnalysisRegistry::with_reference_algorithms();
    registry.register(
        AlgorithmDescriptor::new("diverging", |params, _| {
            let remaining = params
                .get("cycles")
                .and_then(ParamValue::as_i64)
                .unwrap_or(0)
                .max(0) as usize;
            Ok(Box::new(DivergingAnalysis {
                inner: StochasticEnKF::new(),
                remaining,
            }))
        })
        .default_param("cycles", 1_i64),
    );
    registry
}

fn orchestrator(registry: AnalysisRegistry, worker: WorkerConfig) -> (Arc<JournaledStore>, RunOrchestrator) {
    let store = Arc::new(JournaledStore::in_memory());
    let orchestrator = RunOrchestrator::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        Arc::new(registry),
        worker,
    );
    (store, orchestrator)
}

fn small_config() -> RunConfig {
    RunConfig {
        ensemble_size: 10,
        m: 4,
        lorenz96_n: 8,
        seed: Some(11),
        ..RunConfig::default()
    }
    .end_time(0.5)
    .obs_freq(0.1)
}

fn kinds(events: &[assimrun::Event]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

#[tokio::test]
async fn completed_run_emits_the_full_event_sequence() {
    let (store, orchestrator) = orchestrator(
        AnalysisRegistry::with_reference_algorithms(),
        WorkerConfig::default().emit_partial_every(2),
    );
    let config = small_config()
        .with_stage(StageSpec::new("a", "enkf"))
        .with_stage(StageSpec::new("b", "enkf-b-loc").label("localized"));

    let ticket = orchestrator.submit(config).await.unwrap();
    assert_eq!(ticket.run.status, RunStatus::Queued);
    let run_id = ticket.run_id();
    ticket.wait().await.unwrap();

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
    assert!(run.error.is_none());

    // 6 cycles per stage (t = 0.0 ..= 0.5), partials at steps 0, 2, 4.
    let events = store.fetch_events_since(run_id, 0, 1000).await.unwrap();
    assert_eq!(events.len(), 2 + 2 * (2 + 3) + 1);
    let kinds = kinds(&events);
    assert_eq!(kinds[0], EventKind::RunCreated);
    assert_eq!(kinds[1], EventKind::RunStarted);
    assert_eq!(kinds[2], EventKind::MethodStarted);
    assert_eq!(kinds[events.len() - 2], EventKind::MethodCompleted);
    assert_eq!(kinds[events.len() - 1], EventKind::RunCompleted);
    assert!(events.windows(2).all(|pair| pair[0].id < pair[1].id));

    let partial_steps: Vec<u32> = events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::Partial { method_id, step, .. } if method_id == "a" => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(partial_steps, vec![0, 2, 4]);

    let points = store.fetch_points(run_id).await.unwrap();
    assert_eq!(points.len(), 12);
    let a_points: Vec<_> = points.iter().filter(|p| p.method_id == "a").collect();
    let steps: Vec<u32> = a_points.iter().map(|p| p.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3, 4, 5]);
    let times: Vec<f64> = a_points.iter().map(|p| p.t).collect();
    assert_eq!(times, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5]);

    let methods = store.get_methods(run_id).await.unwrap();
    assert_eq!(methods.len(), 2);
    let localized = &methods["b"];
    assert_eq!(localized.status, MethodStatus::Completed);
    assert_eq!(localized.label, "localized");
    assert!(localized.runtime_sec.unwrap() >= 0.0);
    let metrics = localized.metrics.unwrap();
    assert!(metrics.rmse_a.is_finite());
    assert!(metrics.min <= metrics.mean);
}

#[tokio::test]
async fn end_time_on_the_cadence_grid_is_inclusive() {
    let (store, orchestrator) = orchestrator(
        AnalysisRegistry::with_reference_algorithms(),
        WorkerConfig::default(),
    );
    let config = small_config()
        .end_time(0.2)
        .with_stage(StageSpec::new("only", "enkf"));

    let ticket = orchestrator.submit(config).await.unwrap();
    let run_id = ticket.run_id();
    ticket.wait().await.unwrap();

    let points = store.fetch_points(run_id).await.unwrap();
    let times: Vec<f64> = points.iter().map(|p| p.t).collect();
    assert_eq!(times, vec![0.0, 0.1, 0.2]);
}

#[tokio::test]
async fn zero_partial_cadence_disables_partial_events() {
    let (store, orchestrator) = orchestrator(
        AnalysisRegistry::with_reference_algorithms(),
        WorkerConfig::default().emit_partial_every(0),
    );
    let ticket = orchestrator
        .submit(small_config().with_stage(StageSpec::new("a", "enkf")))
        .await
        .unwrap();
    let run_id = ticket.run_id();
    ticket.wait().await.unwrap();

    let events = store.fetch_events_since(run_id, 0, 1000).await.unwrap();
    assert!(!kinds(&events).contains(&EventKind::Partial));
    assert_eq!(events.len(), 2 + 2 + 1);
    assert_eq!(store.fetch_points(run_id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn engine_failure_fails_the_run_and_skips_later_stages() {
    let (store, orchestrator) = orchestrator(registry_with_diverging(), WorkerConfig::default());
    let mut failing = StageSpec::new("bad", "diverging");
    failing.params.insert("cycles".to_string(), ParamValue::Integer(2));
    let config = small_config()
        .with_stage(StageSpec::new("good", "enkf"))
        .with_stage(failing)
        .with_stage(StageSpec::new("never", "enkf"));

    let ticket = orchestrator.submit(config).await.unwrap();
    let run_id = ticket.run_id();
    ticket.wait().await.unwrap();

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.finished_at.is_some());
    assert_eq!(run.error.as_deref(), Some("Numerical failure: ensemble diverged"));

    let events = store.fetch_events_since(run_id, 0, 1000).await.unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::RunFailed);
    match &last.payload {
        EventPayload::RunFailed { error, .. } => {
            assert_eq!(error, "Numerical failure: ensemble diverged")
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(!kinds(&events).contains(&EventKind::RunCompleted));

    let methods = store.get_methods(run_id).await.unwrap();
    assert_eq!(methods["good"].status, MethodStatus::Completed);
    assert_eq!(methods["bad"].status, MethodStatus::Running);
    assert!(!methods.contains_key("never"));

    // Cycles that succeeded before the failure stay persisted.
    let points = store.fetch_points(run_id).await.unwrap();
    assert_eq!(points.iter().filter(|p| p.method_id == "bad").count(), 2);
}

#[tokio::test]
async fn invalid_configuration_writes_nothing() {
    let (store, orchestrator) = orchestrator(
        AnalysisRegistry::with_reference_algorithms(),
        WorkerConfig::default(),
    );
    let config = small_config()
        .with_stage(StageSpec::new("x", "enkf"))
        .with_stage(StageSpec::new("x", "enkf"));

    let err = orchestrator.submit(config).await.unwrap_err();
    assert!(matches!(err, RunError::InvalidConfig(ref message) if message == "Duplicate method instance id: x"));
    assert_eq!(store.stats().await.runs, 0);
    assert_eq!(store.stats().await.events, 0);
}

#[tokio::test]
async fn unknown_parameter_fails_the_run_not_the_request() {
    let (store, orchestrator) = orchestrator(
        AnalysisRegistry::with_reference_algorithms(),
        WorkerConfig::default(),
    );
    let mut stage = StageSpec::new("a", "enkf");
    stage.params.insert("radius".to_string(), ParamValue::Float(1.0));

    let ticket = orchestrator.submit(small_config().with_stage(stage)).await.unwrap();
    let run_id = ticket.run_id();
    ticket.wait().await.unwrap();

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("radius"));
}
