//! Analysis engine: the numerical collaborator the run worker drives.
//!
//! The worker only relies on the contracts here (`Model`, `Background`,
//! `Observation`, `Analysis`, `AnalysisRegistry`, `relative_error`); the
//! Lorenz-96 model and the EnKF variants are reference implementations.

pub mod analysis;
pub mod ensemble;
pub mod linalg;
pub mod lorenz96;
pub mod registry;
pub mod simulation;

pub use analysis::{Analysis, BLocalizedEnKF, StochasticEnKF};
pub use ensemble::{Background, Observation};
pub use lorenz96::Lorenz96;
pub use registry::{AlgorithmDescriptor, AnalysisRegistry, MethodCatalog};
pub use simulation::{CycleErrors, SimulationSettings, StageSimulation};

use thiserror::Error;

/// Model state vector.
pub type State = Vec<f64>;

/// Ensemble members, each a full state vector.
pub type Ensemble = Vec<State>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Unknown method: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid parameter '{name}' for '{algorithm}': {reason}")]
    InvalidParameter {
        algorithm: String,
        name: String,
        reason: String,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Numerical failure: {0}")]
    Numerical(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Physical model: initial condition and state propagation.
pub trait Model: Send + Sync {
    fn dimension(&self) -> usize;

    fn initial_condition(&self) -> State;

    /// Integrate `state` forward over `span` units of simulated time.
    fn propagate(&self, state: &[f64], span: f64) -> State;
}

/// `‖reference − estimate‖₂ / ‖reference‖₂`
pub fn relative_error(reference: &[f64], estimate: &[f64]) -> EngineResult<f64> {
    if reference.len() != estimate.len() {
        return Err(EngineError::DimensionMismatch {
            expected: reference.len(),
            actual: estimate.len(),
        });
    }

    let norm = l2_norm(reference.iter().copied());
    if norm == 0.0 {
        return Err(EngineError::Numerical(
            "reference state has zero norm".to_string(),
        ));
    }

    let diff = l2_norm(reference.iter().zip(estimate).map(|(r, e)| r - e));
    Ok(diff / norm)
}

fn l2_norm(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

/// Component-wise mean of the members.
pub fn ensemble_mean(ensemble: &[State]) -> State {
    let Some(first) = ensemble.first() else {
        return State::new();
    };

    let mut mean = vec![0.0; first.len()];
    for member in ensemble {
        for (acc, value) in mean.iter_mut().zip(member) {
            *acc += value;
        }
    }
    let count = ensemble.len() as f64;
    mean.iter_mut().for_each(|v| *v /= count);
    mean
}

/// One standard normal draw (Box-Muller).
pub(crate) fn standard_normal<R: rand::Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn relative_error_is_scale_free() {
        let truth = vec![3.0, 4.0];
        assert_eq!(relative_error(&truth, &truth).unwrap(), 0.0);
        assert!((relative_error(&truth, &[0.0, 0.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((relative_error(&truth, &[3.0, 4.5]).unwrap() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn relative_error_rejects_bad_inputs() {
        assert!(matches!(
            relative_error(&[1.0, 2.0], &[1.0]),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            relative_error(&[0.0, 0.0], &[1.0, 1.0]),
            Err(EngineError::Numerical(_))
        ));
    }

    #[test]
    fn ensemble_mean_averages_members() {
        let mean = ensemble_mean(&[vec![1.0, 2.0], vec![3.0, 6.0]]);
        assert_eq!(mean, vec![2.0, 4.0]);
        assert!(ensemble_mean(&[]).is_empty());
    }

    #[test]
    fn standard_normal_has_unit_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<f64> = (0..20_000).map(|_| standard_normal(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }
}
