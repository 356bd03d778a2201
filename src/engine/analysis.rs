use super::linalg::{Matrix, cholesky, cholesky_solve};
use super::{
    Background, EngineError, EngineResult, Model, Observation, State, ensemble_mean,
    standard_normal,
};
use rand::rngs::StdRng;
use std::sync::Arc;

/// One assimilation algorithm. Owns the analysis ensemble between cycles.
pub trait Analysis: Send {
    fn name(&self) -> &str;

    /// Combine the background ensemble with the latest observation.
    fn assimilate(
        &mut self,
        background: &Background,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> EngineResult<&[State]>;

    /// Scale member deviations about the mean by `factor`.
    fn inflate(&mut self, factor: f64);

    fn ensemble(&self) -> Option<&[State]>;

    /// Analysis ensemble mean.
    fn analysis_state(&self) -> EngineResult<State> {
        self.ensemble()
            .map(ensemble_mean)
            .ok_or_else(|| EngineError::Numerical(format!("{} has not assimilated yet", self.name())))
    }
}

/// Stochastic EnKF with perturbed observations.
#[derive(Debug, Default)]
pub struct StochasticEnKF {
    ensemble: Option<Vec<State>>,
}

impl StochasticEnKF {
    pub const NAME: &'static str = "enkf";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Analysis for StochasticEnKF {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn assimilate(
        &mut self,
        background: &Background,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> EngineResult<&[State]> {
        let members = perturbed_observation_update(background.ensemble()?, observation, None, rng)?;
        let members = self.ensemble.insert(members);
        Ok(members.as_slice())
    }

    fn inflate(&mut self, factor: f64) {
        if let Some(members) = self.ensemble.as_mut() {
            inflate_members(members, factor);
        }
    }

    fn ensemble(&self) -> Option<&[State]> {
        self.ensemble.as_deref()
    }
}

/// EnKF whose background covariance is tapered with a Gaussian kernel of
/// radius `r` over the model's periodic grid distance.
pub struct BLocalizedEnKF {
    radius: f64,
    taper: Matrix,
    ensemble: Option<Vec<State>>,
}

impl BLocalizedEnKF {
    pub const NAME: &'static str = "enkf-b-loc";

    pub fn new(model: Arc<dyn Model>, radius: f64) -> Self {
        Self {
            radius,
            taper: gaussian_taper(model.dimension(), radius),
            ensemble: None,
        }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }
}

impl Analysis for BLocalizedEnKF {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn assimilate(
        &mut self,
        background: &Background,
        observation: &Observation,
        rng: &mut StdRng,
    ) -> EngineResult<&[State]> {
        let members = perturbed_observation_update(
            background.ensemble()?,
            observation,
            Some(&self.taper),
            rng,
        )?;
        let members = self.ensemble.insert(members);
        Ok(members.as_slice())
    }

    fn inflate(&mut self, factor: f64) {
        if let Some(members) = self.ensemble.as_mut() {
            inflate_members(members, factor);
        }
    }

    fn ensemble(&self) -> Option<&[State]> {
        self.ensemble.as_deref()
    }
}

fn gaussian_taper(n: usize, radius: f64) -> Matrix {
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let offset = i.abs_diff(j);
                    let distance = offset.min(n - offset) as f64;
                    (-(distance * distance) / (2.0 * radius * radius)).exp()
                })
                .collect()
        })
        .collect()
}

fn inflate_members(members: &mut [State], factor: f64) {
    let mean = ensemble_mean(members);
    for member in members.iter_mut() {
        for (value, centre) in member.iter_mut().zip(&mean) {
            *value = centre + factor * (*value - centre);
        }
    }
}

/// `x_a = x_b + P H^T (H P H^T + R)^-1 (y + ε − H x_b)` for every member,
/// with `P` the sample covariance, optionally tapered element-wise.
fn perturbed_observation_update(
    background: &[State],
    observation: &Observation,
    taper: Option<&Matrix>,
    rng: &mut StdRng,
) -> EngineResult<Vec<State>> {
    let n_members = background.len();
    if n_members < 2 {
        return Err(EngineError::Numerical(format!(
            "ensemble update needs at least two members, got {n_members}"
        )));
    }

    let n = background[0].len();
    let indices = observation.indices();
    if let Some(&last) = indices.last() {
        if last >= n {
            return Err(EngineError::DimensionMismatch {
                expected: n,
                actual: last + 1,
            });
        }
    }
    if let Some(taper) = taper {
        if taper.len() != n {
            return Err(EngineError::DimensionMismatch {
                expected: n,
                actual: taper.len(),
            });
        }
    }

    let mean = ensemble_mean(background);
    let anomalies: Vec<State> = background
        .iter()
        .map(|member| member.iter().zip(&mean).map(|(x, m)| x - m).collect())
        .collect();

    let scale = 1.0 / (n_members - 1) as f64;
    let mut covariance: Matrix = vec![vec![0.0; n]; n];
    for anomaly in &anomalies {
        for i in 0..n {
            for j in 0..n {
                covariance[i][j] += anomaly[i] * anomaly[j] * scale;
            }
        }
    }
    if let Some(taper) = taper {
        for (row, taper_row) in covariance.iter_mut().zip(taper) {
            for (value, weight) in row.iter_mut().zip(taper_row) {
                *value *= weight;
            }
        }
    }

    let variance = observation.variance();
    let innovation: Matrix = indices
        .iter()
        .enumerate()
        .map(|(p, &a)| {
            indices
                .iter()
                .enumerate()
                .map(|(q, &b)| covariance[a][b] + if p == q { variance } else { 0.0 })
                .collect()
        })
        .collect();
    let factor = cholesky(&innovation)?;

    let observed = observation.values()?;
    let std_obs = observation.std_obs();
    background
        .iter()
        .map(|member| {
            let departure: Vec<f64> = indices
                .iter()
                .zip(observed)
                .map(|(&i, y)| y + std_obs * standard_normal(rng) - member[i])
                .collect();
            let weights = cholesky_solve(&factor, &departure);

            let updated: State = (0..n)
                .map(|i| {
                    let gain: f64 = indices
                        .iter()
                        .zip(&weights)
                        .map(|(&k, w)| covariance[i][k] * w)
                        .sum();
                    member[i] + gain
                })
                .collect();
            if updated.iter().all(|v| v.is_finite()) {
                Ok(updated)
            } else {
                Err(EngineError::Numerical("analysis produced non-finite state".to_string()))
            }
        })
        .collect()
}
