use super::{EngineError, EngineResult};

/// Dense row-major square matrix.
pub type Matrix = Vec<Vec<f64>>;

/// Lower-triangular Cholesky factor of a symmetric positive definite matrix.
pub fn cholesky(a: &Matrix) -> EngineResult<Matrix> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];

    for i in 0..n {
        if a[i].len() != n {
            return Err(EngineError::DimensionMismatch {
                expected: n,
                actual: a[i].len(),
            });
        }
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let pivot = a[i][i] - sum;
                if !pivot.is_finite() || pivot <= 0.0 {
                    return Err(EngineError::Numerical(format!(
                        "innovation covariance is not positive definite (pivot {pivot} at row {i})"
                    )));
                }
                l[i][j] = pivot.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }
    Ok(l)
}

/// Solve `L Lᵀ x = b` given the factor `L`.
pub fn cholesky_solve(l: &Matrix, b: &[f64]) -> Vec<f64> {
    let n = l.len();
    let mut y = vec![0.0; n];
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| l[i][k] * y[k]).sum();
        y[i] = (b[i] - sum) / l[i][i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (y[i] - sum) / l[i][i];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_spd_system() {
        let a = vec![
            vec![4.0, 2.0, 0.4],
            vec![2.0, 5.0, 1.0],
            vec![0.4, 1.0, 3.0],
        ];
        let b = vec![1.0, 2.0, 3.0];
        let l = cholesky(&a).unwrap();
        let x = cholesky_solve(&l, &b);

        for (row, expected) in a.iter().zip(&b) {
            let got: f64 = row.iter().zip(&x).map(|(a, x)| a * x).sum();
            assert!((got - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_indefinite_matrix() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        assert!(matches!(cholesky(&a), Err(EngineError::Numerical(_))));
    }
}
