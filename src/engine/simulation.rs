use super::{
    Analysis, Background, EngineError, EngineResult, Model, Observation, State, relative_error,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Cycle-level settings shared by every stage of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationSettings {
    pub ensemble_size: usize,
    pub m: usize,
    pub std_obs: f64,
    pub obs_freq: f64,
    pub inf_fact: f64,
}

/// Errors of one cycle, both relative to the truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleErrors {
    pub error_b: f64,
    pub error_a: f64,
}

/// Per-stage engine state: truth trajectory, background, observation and
/// the analysis under test.
pub struct StageSimulation {
    model: Arc<dyn Model>,
    background: Background,
    observation: Observation,
    analysis: Box<dyn Analysis>,
    truth: State,
    rng: StdRng,
    settings: SimulationSettings,
}

impl StageSimulation {
    /// `seed` pins every random draw of the stage.
    pub fn new(
        model: Arc<dyn Model>,
        analysis: Box<dyn Analysis>,
        settings: SimulationSettings,
        seed: Option<u64>,
    ) -> EngineResult<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let observation = Observation::new(settings.m, settings.std_obs, model.dimension())?;
        let mut background = Background::new(Arc::clone(&model), settings.ensemble_size);
        background.initial_ensemble(&mut rng);
        let truth = model.initial_condition();

        Ok(Self {
            model,
            background,
            observation,
            analysis,
            truth,
            rng,
            settings,
        })
    }

    /// Observe the truth, assimilate, optionally inflate, score, then
    /// advance truth and background by one cadence.
    pub fn cycle(&mut self) -> EngineResult<CycleErrors> {
        self.observation.generate(&self.truth, &mut self.rng)?;
        self.analysis
            .assimilate(&self.background, &self.observation, &mut self.rng)?;
        if self.settings.inf_fact > 0.0 {
            self.analysis.inflate(self.settings.inf_fact);
        }

        let xa = self.analysis.analysis_state()?;
        let xb = self.background.background_state()?;
        let errors = CycleErrors {
            error_b: relative_error(&self.truth, &xb)?,
            error_a: relative_error(&self.truth, &xa)?,
        };

        let members = self.analysis.ensemble().ok_or_else(|| {
            EngineError::Numerical(format!("{} returned no ensemble", self.analysis.name()))
        })?;
        self.background.forecast_step(members, self.settings.obs_freq);
        self.truth = self.model.propagate(&self.truth, self.settings.obs_freq);

        Ok(errors)
    }
}
