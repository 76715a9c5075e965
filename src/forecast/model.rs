//! Forecaster trait shared by every regression variant.
//!
//! Variants are selected by the `model` field of the saved artifact (or the
//! `[models.forecasting] kind` setting at training time) and constructed by
//! [`super::create_forecaster`].

use crate::features::FeatureMatrix;
use crate::forecast::ForecastError;
use crate::forecast::metrics::RegressionMetrics;
use std::fmt;

pub trait Forecaster: Send + Sync + fmt::Debug {
    /// Variant name stored in the artifact.
    fn kind(&self) -> &'static str;

    /// Feature columns, by name and order, the model was trained on.
    fn schema(&self) -> &[String];

    /// Forecast distance in window units.
    fn horizon(&self) -> u32;

    /// Trailing rows needed to produce one forecast.
    fn min_rows(&self) -> usize {
        1
    }

    /// One forecast for each row from `min_rows() - 1` onwards.
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ForecastError>;

    /// Variant parameters for the artifact's `params` field.
    fn params(&self) -> Result<serde_json::Value, ForecastError>;

    /// Score forecasts against `target`, aligned on the trailing rows.
    fn evaluate(
        &self,
        features: &FeatureMatrix,
        target: &[f64],
    ) -> Result<RegressionMetrics, ForecastError> {
        let predicted = self.predict(features)?;
        let actual = &target[target.len().saturating_sub(predicted.len())..];
        RegressionMetrics::compute(actual, &predicted).ok_or(ForecastError::InsufficientHistory {
            required: self.min_rows(),
            available: features.len(),
        })
    }
}

/// Fail closed unless `features` carries exactly `expected`, in order.
pub fn check_schema(expected: &[String], features: &FeatureMatrix) -> Result<(), ForecastError> {
    if features.columns == expected {
        return Ok(());
    }
    Err(ForecastError::SchemaMismatch {
        expected: expected.to_vec(),
        actual: features.columns.clone(),
    })
}
