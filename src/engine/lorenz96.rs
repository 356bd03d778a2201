use super::{Model, State};

const INTEGRATION_STEP: f64 = 0.01;
const SPIN_UP_TIME: f64 = 5.0;

/// Lorenz-96: `dx_i/dt = (x_{i+1} − x_{i−2}) x_{i−1} − x_i + F` on a ring.
#[derive(Debug, Clone)]
pub struct Lorenz96 {
    n: usize,
    forcing: f64,
}

impl Lorenz96 {
    pub fn new(n: usize, forcing: f64) -> Self {
        Self { n, forcing }
    }

    pub fn forcing(&self) -> f64 {
        self.forcing
    }

    fn tendency(&self, x: &[f64]) -> State {
        let n = x.len();
        (0..n)
            .map(|i| {
                let next = x[(i + 1) % n];
                let prev = x[(i + n - 1) % n];
                let prev2 = x[(i + n - 2) % n];
                (next - prev2) * prev - x[i] + self.forcing
            })
            .collect()
    }

    fn rk4_step(&self, x: &[f64], h: f64) -> State {
        let k1 = self.tendency(x);
        let k2 = self.tendency(&axpy(x, &k1, h / 2.0));
        let k3 = self.tendency(&axpy(x, &k2, h / 2.0));
        let k4 = self.tendency(&axpy(x, &k3, h));
        x.iter()
            .enumerate()
            .map(|(i, xi)| xi + h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]))
            .collect()
    }
}

fn axpy(x: &[f64], k: &[f64], h: f64) -> State {
    x.iter().zip(k).map(|(xi, ki)| xi + h * ki).collect()
}

impl Model for Lorenz96 {
    fn dimension(&self) -> usize {
        self.n
    }

    /// Uniform forcing with a small kick on the first component, spun up
    /// onto the attractor.
    fn initial_condition(&self) -> State {
        let mut x = vec![self.forcing; self.n];
        if let Some(first) = x.first_mut() {
            *first += 0.01;
        }
        self.propagate(&x, SPIN_UP_TIME)
    }

    fn propagate(&self, state: &[f64], span: f64) -> State {
        if span <= 0.0 {
            return state.to_vec();
        }

        let steps = (span / INTEGRATION_STEP).round().max(1.0) as usize;
        let h = span / steps as f64;
        let mut x = state.to_vec();
        for _ in 0..steps {
            x = self.rk4_step(&x, h);
        }
        x
    }
}
