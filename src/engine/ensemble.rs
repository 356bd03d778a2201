use super::{EngineError, EngineResult, Model, State, ensemble_mean, standard_normal};
use rand::Rng;
use std::sync::Arc;

const INITIAL_SPREAD: f64 = 0.5;

/// Background ensemble: forecast members and their mean.
pub struct Background {
    model: Arc<dyn Model>,
    ensemble_size: usize,
    ensemble: Option<Vec<State>>,
}

impl Background {
    pub fn new(model: Arc<dyn Model>, ensemble_size: usize) -> Self {
        Self {
            model,
            ensemble_size,
            ensemble: None,
        }
    }

    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Build the initial ensemble on first call by perturbing the model's
    /// initial condition. Later calls return it unchanged.
    pub fn initial_ensemble<R: Rng>(&mut self, rng: &mut R) -> &[State] {
        if self.ensemble.is_none() {
            let x0 = self.model.initial_condition();
            let members = (0..self.ensemble_size)
                .map(|_| {
                    x0.iter()
                        .map(|x| x + INITIAL_SPREAD * standard_normal(rng))
                        .collect()
                })
                .collect();
            self.ensemble = Some(members);
        }
        self.ensemble.get_or_insert_with(Vec::new)
    }

    pub fn ensemble(&self) -> EngineResult<&[State]> {
        self.ensemble.as_deref().ok_or_else(|| {
            EngineError::Numerical("background ensemble used before initialisation".to_string())
        })
    }

    /// Ensemble mean.
    pub fn background_state(&self) -> EngineResult<State> {
        Ok(ensemble_mean(self.ensemble()?))
    }

    /// Propagate the analysis members across one cadence; the result becomes
    /// the next background.
    pub fn forecast_step(&mut self, analysis: &[State], span: f64) -> &[State] {
        let members: Vec<State> = analysis
            .iter()
            .map(|member| self.model.propagate(member, span))
            .collect();
        self.ensemble.insert(members)
    }
}

/// Noisy observations of `m` evenly spaced state components.
#[derive(Debug, Clone)]
pub struct Observation {
    dimension: usize,
    std_obs: f64,
    indices: Vec<usize>,
    values: Option<State>,
}

impl Observation {
    pub fn new(m: usize, std_obs: f64, dimension: usize) -> EngineResult<Self> {
        if m == 0 || m > dimension {
            return Err(EngineError::InvalidParameter {
                algorithm: "observation".to_string(),
                name: "m".to_string(),
                reason: format!("must be between 1 and {dimension}, got {m}"),
            });
        }
        if !(std_obs.is_finite() && std_obs > 0.0) {
            return Err(EngineError::InvalidParameter {
                algorithm: "observation".to_string(),
                name: "std_obs".to_string(),
                reason: format!("must be positive, got {std_obs}"),
            });
        }

        Ok(Self {
            dimension,
            std_obs,
            indices: (0..m).map(|k| k * dimension / m).collect(),
            values: None,
        })
    }

    /// Observe `truth` at the operator indices with Gaussian noise.
    pub fn generate<R: Rng>(&mut self, truth: &[f64], rng: &mut R) -> EngineResult<&[f64]> {
        if truth.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: truth.len(),
            });
        }

        let values: State = self
            .indices
            .iter()
            .map(|&i| truth[i] + self.std_obs * standard_normal(rng))
            .collect();
        let values = self.values.insert(values);
        Ok(values.as_slice())
    }

    pub fn values(&self) -> EngineResult<&[f64]> {
        self.values
            .as_deref()
            .ok_or_else(|| EngineError::Numerical("no observation generated yet".to_string()))
    }

    /// Observed components, ascending.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn variance(&self) -> f64 {
        self.std_obs * self.std_obs
    }

    pub fn std_obs(&self) -> f64 {
        self.std_obs
    }
}
