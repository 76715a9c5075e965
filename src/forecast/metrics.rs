use serde::{Deserialize, Serialize};

/// Below this magnitude a true value is treated as zero for percentage error.
pub const MAPE_ZERO_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    /// Percent. Rows with a zero true value are left out; `None` when none remain.
    pub mape: Option<f64>,
    pub samples: usize,
}

impl RegressionMetrics {
    /// `None` for empty or mismatched inputs.
    pub fn compute(actual: &[f64], predicted: &[f64]) -> Option<Self> {
        if actual.is_empty() || actual.len() != predicted.len() {
            return None;
        }
        let n = actual.len() as f64;
        let mse = actual
            .iter()
            .zip(predicted)
            .map(|(y, p)| (y - p).powi(2))
            .sum::<f64>()
            / n;
        let mae = actual
            .iter()
            .zip(predicted)
            .map(|(y, p)| (y - p).abs())
            .sum::<f64>()
            / n;

        let mean = actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
        let ss_res = mse * n;
        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        let ratios: Vec<f64> = actual
            .iter()
            .zip(predicted)
            .filter(|(y, _)| y.abs() >= MAPE_ZERO_EPSILON)
            .map(|(y, p)| ((y - p) / y).abs())
            .collect();
        let mape = if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64 * 100.0)
        };

        Some(Self {
            mse,
            rmse: mse.sqrt(),
            mae,
            r2,
            mape,
            samples: actual.len(),
        })
    }
}
