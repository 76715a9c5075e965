//! Sequence forecaster: ridge regression over a flattened trailing window.
//!
//! Each forecast reads the last `lookback_window` rows of a small set of
//! sequence columns, min-max scaled, and predicts the scaled target. The full
//! feature schema is still checked strictly so that both variants share the
//! same train/predict parity rule.

use crate::config::LookbackSection;
use crate::features::{FeatureMatrix, VALUE_COLUMN};
use crate::forecast::ForecastError;
use crate::forecast::model::{Forecaster, check_schema};
use crate::scaler::MinMaxScaler;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const KIND: &str = "lookback";

/// Columns read from each row of the window. The first is the predicted signal.
pub const SEQUENCE_COLUMNS: [&str; 4] = [VALUE_COLUMN, "hour", "day_of_week", "is_weekend"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookbackParams {
    pub lookback_window: usize,
    pub ridge_lambda: f64,
}

impl From<&LookbackSection> for LookbackParams {
    fn from(section: &LookbackSection) -> Self {
        Self {
            lookback_window: section.lookback_window,
            ridge_lambda: section.ridge_lambda,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LookbackState {
    params: LookbackParams,
    scaler: MinMaxScaler,
    weights: Vec<f64>,
    bias: f64,
}

#[derive(Debug, Clone)]
pub struct LookbackForecaster {
    schema: Vec<String>,
    horizon: u32,
    indices: Vec<usize>,
    state: LookbackState,
}

fn sequence_indices(schema: &[String]) -> Result<Vec<usize>, ForecastError> {
    SEQUENCE_COLUMNS
        .iter()
        .map(|name| {
            schema.iter().position(|column| column == name).ok_or_else(|| {
                ForecastError::Incompatible(format!("schema lacks sequence column {name}"))
            })
        })
        .collect()
}

fn select(row: &[f64], indices: &[usize]) -> Vec<f64> {
    indices.iter().map(|&index| row[index]).collect()
}

impl LookbackForecaster {
    pub fn train(
        params: LookbackParams,
        horizon: u32,
        features: &FeatureMatrix,
        target: &[f64],
    ) -> Result<Self, ForecastError> {
        let window = params.lookback_window.max(1);
        if features.len() != target.len() {
            return Err(ForecastError::Training(format!(
                "{} feature rows for {} targets",
                features.len(),
                target.len()
            )));
        }
        if features.len() < window {
            return Err(ForecastError::InsufficientHistory {
                required: window,
                available: features.len(),
            });
        }
        let indices = sequence_indices(&features.columns)?;
        let sequence: Vec<Vec<f64>> = features
            .rows
            .iter()
            .map(|row| select(row, &indices))
            .collect();
        let scaler = MinMaxScaler::fit(&sequence);
        let scaled: Vec<Vec<f64>> = sequence.iter().map(|row| scaler.transform(row)).collect();

        let inputs: Vec<Vec<f64>> = (window - 1..scaled.len())
            .map(|end| flatten(&scaled[end + 1 - window..=end]))
            .collect();
        let outputs: Vec<f64> = target[window - 1..]
            .iter()
            .map(|y| scaler.transform_value(0, *y))
            .collect();
        let (weights, bias) = fit_ridge(&inputs, &outputs, params.ridge_lambda)?;

        info!(
            samples = inputs.len(),
            lookback = window,
            "Lookback forecaster trained"
        );
        Ok(Self {
            schema: features.columns.clone(),
            horizon,
            indices,
            state: LookbackState {
                params,
                scaler,
                weights,
                bias,
            },
        })
    }

    pub fn from_params(
        schema: Vec<String>,
        horizon: u32,
        params: serde_json::Value,
    ) -> Result<Self, ForecastError> {
        let state: LookbackState = serde_json::from_value(params)
            .map_err(|err| ForecastError::Incompatible(err.to_string()))?;
        let indices = sequence_indices(&schema)?;
        let expected = state.params.lookback_window.max(1) * SEQUENCE_COLUMNS.len();
        if state.weights.len() != expected
            || state.scaler.min.len() != SEQUENCE_COLUMNS.len()
            || state.scaler.range.len() != SEQUENCE_COLUMNS.len()
        {
            return Err(ForecastError::Incompatible(format!(
                "expected {expected} weights over {} sequence columns",
                SEQUENCE_COLUMNS.len()
            )));
        }
        Ok(Self {
            schema,
            horizon,
            indices,
            state,
        })
    }
}

fn flatten(window: &[Vec<f64>]) -> Vec<f64> {
    window.iter().flatten().copied().collect()
}

/// Closed-form ridge with an unpenalized intercept, solved on centred data.
fn fit_ridge(inputs: &[Vec<f64>], outputs: &[f64], lambda: f64) -> Result<(Vec<f64>, f64), ForecastError> {
    let width = inputs.first().map_or(0, Vec::len);
    let n = inputs.len() as f64;
    let mut input_mean = vec![0.0; width];
    for row in inputs {
        for (mean, value) in input_mean.iter_mut().zip(row) {
            *mean += value / n;
        }
    }
    let output_mean = outputs.iter().sum::<f64>() / n;

    let mut gram = vec![vec![0.0; width]; width];
    let mut moment = vec![0.0; width];
    for (row, y) in inputs.iter().zip(outputs) {
        let centred: Vec<f64> = row.iter().zip(&input_mean).map(|(x, m)| x - m).collect();
        for i in 0..width {
            moment[i] += centred[i] * (y - output_mean);
            for j in 0..width {
                gram[i][j] += centred[i] * centred[j];
            }
        }
    }
    for (i, row) in gram.iter_mut().enumerate() {
        row[i] += lambda.max(1e-9);
    }

    let weights = solve(gram, moment).ok_or_else(|| {
        ForecastError::Training("ridge system is singular".to_string())
    })?;
    let bias = output_mean
        - weights
            .iter()
            .zip(&input_mean)
            .map(|(w, m)| w * m)
            .sum::<f64>();
    Ok((weights, bias))
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

impl Forecaster for LookbackForecaster {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn horizon(&self) -> u32 {
        self.horizon
    }

    fn min_rows(&self) -> usize {
        self.state.params.lookback_window.max(1)
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ForecastError> {
        check_schema(&self.schema, features)?;
        let window = self.min_rows();
        if features.len() < window {
            return Err(ForecastError::InsufficientHistory {
                required: window,
                available: features.len(),
            });
        }
        let scaled: Vec<Vec<f64>> = features
            .rows
            .iter()
            .map(|row| self.state.scaler.transform(&select(row, &self.indices)))
            .collect();
        Ok((window - 1..scaled.len())
            .map(|end| {
                let input = flatten(&scaled[end + 1 - window..=end]);
                let value = self.state.bias
                    + input
                        .iter()
                        .zip(&self.state.weights)
                        .map(|(x, w)| x * w)
                        .sum::<f64>();
                self.state.scaler.inverse_value(0, value)
            })
            .collect())
    }

    fn params(&self) -> Result<serde_json::Value, ForecastError> {
        Ok(serde_json::to_value(&self.state)?)
    }
}
