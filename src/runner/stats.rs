use crate::core::Metrics;

/// Summary of one error series. Every field is NaN for an empty series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub last: f64,
    pub mean: f64,
    pub min: f64,
    pub rmse: f64,
}

impl SeriesStats {
    pub fn from_series(series: &[f64]) -> Self {
        let Some(&last) = series.last() else {
            return Self {
                last: f64::NAN,
                mean: f64::NAN,
                min: f64::NAN,
                rmse: f64::NAN,
            };
        };

        let n = series.len() as f64;
        Self {
            last,
            mean: series.iter().sum::<f64>() / n,
            min: series.iter().copied().fold(f64::INFINITY, f64::min),
            rmse: (series.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
        }
    }
}

/// Analysis statistics at the top level, background ones under a
/// `background_` prefix, both RMS values kept.
pub fn summarize(errors_a: &[f64], errors_b: &[f64]) -> Metrics {
    let analysis = SeriesStats::from_series(errors_a);
    let background = SeriesStats::from_series(errors_b);
    Metrics {
        final_error: analysis.last,
        mean: analysis.mean,
        min: analysis.min,
        rmse_a: analysis.rmse,
        rmse_b: background.rmse,
        background_final: background.last,
        background_mean: background.mean,
        background_min: background.min,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_of_known_series() {
        let stats = SeriesStats::from_series(&[3.0, 1.0, 2.0]);
        assert_eq!(stats.last, 2.0);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.min, 1.0);
        assert!((stats.rmse - (14.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_series_is_nan() {
        let stats = SeriesStats::from_series(&[]);
        assert!(stats.last.is_nan());
        assert!(stats.mean.is_nan());
        assert!(stats.min.is_nan());
        assert!(stats.rmse.is_nan());
    }

    #[test]
    fn summarize_keeps_both_rms_values() {
        let metrics = summarize(&[0.1, 0.3], &[0.4, 0.2]);
        assert_eq!(metrics.final_error, 0.3);
        assert_eq!(metrics.min, 0.1);
        assert_eq!(metrics.background_final, 0.2);
        assert!((metrics.background_mean - 0.3).abs() < 1e-12);
        assert_eq!(metrics.background_min, 0.2);
        assert!((metrics.rmse_a - 0.05f64.sqrt()).abs() < 1e-12);
        assert!((metrics.rmse_b - 0.1f64.sqrt()).abs() < 1e-12);
    }
}
