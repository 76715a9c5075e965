//! Short-horizon forecasting of the aggregated traffic signal.
//!
//! Two variants implement [`Forecaster`]: `boosted` (gradient-boosted trees
//! over the current feature row) and `lookback` (ridge regression over a
//! trailing window of rows). Both persist through one tagged JSON artifact
//! and are rebuilt by [`create_forecaster`].

use crate::config::Config;
use crate::features::{FeatureError, FeatureMatrix};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

pub mod boosted;
pub mod lookback;
pub mod metrics;
pub mod model;

use boosted::{BoostedForecaster, BoostedParams};
use lookback::{LookbackForecaster, LookbackParams};
use metrics::RegressionMetrics;
pub use model::Forecaster;

pub const FORECAST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("feature schema mismatch: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("forecaster artifact not found at {0}")]
    Unavailable(PathBuf),
    #[error("forecaster artifact is incompatible: {0}")]
    Incompatible(String),
    #[error("need {required} feature rows, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error("forecaster training failed: {0}")]
    Training(String),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error("forecaster artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("forecaster artifact json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to format training time: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// On-disk form of a trained forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastArtifact {
    pub model: String,
    pub format_version: u32,
    pub feature_schema: Vec<String>,
    pub horizon: u32,
    pub window_hours: u32,
    pub trained_at: String,
    #[serde(default)]
    pub metrics: Option<RegressionMetrics>,
    pub params: serde_json::Value,
}

// Model Factory
pub fn create_forecaster(
    artifact: &ForecastArtifact,
) -> Result<Box<dyn Forecaster>, ForecastError> {
    if artifact.format_version != FORECAST_FORMAT_VERSION {
        return Err(ForecastError::Incompatible(format!(
            "format version {}",
            artifact.format_version
        )));
    }
    let schema = artifact.feature_schema.clone();
    match artifact.model.as_str() {
        boosted::KIND => Ok(Box::new(BoostedForecaster::from_params(
            schema,
            artifact.horizon,
            artifact.params.clone(),
        )?)),
        lookback::KIND => Ok(Box::new(LookbackForecaster::from_params(
            schema,
            artifact.horizon,
            artifact.params.clone(),
        )?)),
        other => Err(ForecastError::Incompatible(format!("unknown model: {other}"))),
    }
}

pub fn load_artifact(path: impl AsRef<Path>) -> Result<ForecastArtifact, ForecastError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ForecastError::Unavailable(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| ForecastError::Incompatible(err.to_string()))
}

pub fn load_forecaster(path: impl AsRef<Path>) -> Result<Box<dyn Forecaster>, ForecastError> {
    create_forecaster(&load_artifact(path)?)
}

pub fn save_forecaster(
    model: &dyn Forecaster,
    window_hours: u32,
    metrics: Option<RegressionMetrics>,
    path: impl AsRef<Path>,
) -> Result<ForecastArtifact, ForecastError> {
    let path = path.as_ref();
    let artifact = ForecastArtifact {
        model: model.kind().to_string(),
        format_version: FORECAST_FORMAT_VERSION,
        feature_schema: model.schema().to_vec(),
        horizon: model.horizon(),
        window_hours,
        trained_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        metrics,
        params: model.params()?,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&artifact)?)?;
    info!(path = %path.display(), model = %artifact.model, "Saved forecaster");
    Ok(artifact)
}

/// Chronological train / validation / test row ranges. Never shuffled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChronologicalSplit {
    pub train: Range<usize>,
    pub validation: Range<usize>,
    pub test: Range<usize>,
}

impl ChronologicalSplit {
    /// The test block is the last `test_fraction` of all rows; validation is
    /// the last `validation_fraction` of what precedes it.
    pub fn new(rows: usize, test_fraction: f64, validation_fraction: f64) -> Self {
        let test = ((rows as f64) * test_fraction).round() as usize;
        let test_start = rows - test.min(rows);
        let validation = ((test_start as f64) * validation_fraction).round() as usize;
        let validation_start = test_start - validation.min(test_start);
        Self {
            train: 0..validation_start,
            validation: validation_start..test_start,
            test: test_start..rows,
        }
    }
}

#[derive(Debug)]
pub struct TrainedForecaster {
    pub model: Box<dyn Forecaster>,
    /// Held-out test metrics; `None` when the test block is empty.
    pub metrics: Option<RegressionMetrics>,
}

/// Train the `[models.forecasting] kind` variant and score it on the test block.
pub fn train(
    features: &FeatureMatrix,
    target: &[f64],
    config: &Config,
) -> Result<TrainedForecaster, ForecastError> {
    let settings = &config.models.forecasting;
    if features.len() != target.len() {
        return Err(ForecastError::Training(format!(
            "{} feature rows for {} targets",
            features.len(),
            target.len()
        )));
    }
    let split = ChronologicalSplit::new(
        features.len(),
        settings.test_fraction,
        settings.validation_fraction,
    );
    let horizon = settings.forecast_horizon;

    let model: Box<dyn Forecaster> = match settings.kind.as_str() {
        boosted::KIND => {
            let train = features.slice(split.train.clone());
            let validation = features.slice(split.validation.clone());
            Box::new(BoostedForecaster::train(
                BoostedParams::from(&config.models.boosted),
                horizon,
                (&train, &target[split.train.clone()]),
                Some((&validation, &target[split.validation.clone()])),
            )?)
        }
        lookback::KIND => {
            // Ridge has no iterative stopping rule, so validation rows train too.
            let fit = split.train.start..split.validation.end;
            Box::new(LookbackForecaster::train(
                LookbackParams::from(&config.models.lookback),
                horizon,
                &features.slice(fit.clone()),
                &target[fit],
            )?)
        }
        other => {
            return Err(ForecastError::Training(format!("unknown model: {other}")));
        }
    };

    let metrics = if split.test.is_empty() {
        warn!("Test block is empty; forecaster metrics unavailable");
        None
    } else {
        let context = split.test.start.saturating_sub(model.min_rows() - 1);
        let window = context..split.test.end;
        let metrics = model.evaluate(&features.slice(window.clone()), &target[window])?;
        info!(
            model = model.kind(),
            rmse = metrics.rmse,
            mae = metrics.mae,
            r2 = metrics.r2,
            mape = ?metrics.mape,
            samples = metrics.samples,
            "Forecaster evaluated"
        );
        Some(metrics)
    };

    Ok(TrainedForecaster { model, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL_CONFIG;
    use std::error::Error;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("pedestrian_flow_{name}_{nanos}.json"))
    }

    fn linear_data(n: usize) -> (FeatureMatrix, Vec<f64>) {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| vec![(i % 24) as f64, (i / 24 % 7) as f64])
            .collect();
        let target = rows.iter().map(|row| 2.0 * row[0] + 1.0).collect();
        (
            FeatureMatrix {
                columns: vec!["avg_devices".to_string(), "hour".to_string()],
                timestamps: Vec::new(),
                rows,
            },
            target,
        )
    }

    #[test]
    fn split_is_chronological_and_covers_every_row() {
        let split = ChronologicalSplit::new(100, 0.2, 0.25);

        assert_eq!(split.train, 0..60);
        assert_eq!(split.validation, 60..80);
        assert_eq!(split.test, 80..100);
    }

    #[test]
    fn tiny_split_keeps_ranges_in_bounds() {
        let split = ChronologicalSplit::new(1, 0.5, 0.5);

        assert_eq!(split.train.end, split.validation.start);
        assert_eq!(split.validation.end, split.test.start);
        assert_eq!(split.test.end, 1);
    }

    #[test]
    fn artifact_roundtrip_restores_predictions() -> Result<(), Box<dyn Error>> {
        let config: Config = toml::from_str(MINIMAL_CONFIG)?;
        let (features, target) = linear_data(72);
        let trained = train(&features, &target, &config)?;
        let path = temp_path("forecaster");

        save_forecaster(trained.model.as_ref(), 1, trained.metrics.clone(), &path)?;
        let restored = load_forecaster(&path)?;

        assert_eq!(restored.kind(), trained.model.kind());
        assert_eq!(restored.schema(), features.columns.as_slice());
        let before = trained.model.predict(&features)?;
        let after = restored.predict(&features)?;
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-9);
        }
        let _ = fs::remove_file(path);
        Ok(())
    }

    #[test]
    fn missing_artifact_is_unavailable() {
        let result = load_forecaster(temp_path("absent"));

        assert!(matches!(result, Err(ForecastError::Unavailable(_))));
    }

    #[test]
    fn unknown_model_is_incompatible() {
        let artifact = ForecastArtifact {
            model: "recurrent".to_string(),
            format_version: FORECAST_FORMAT_VERSION,
            feature_schema: vec!["avg_devices".to_string()],
            horizon: 1,
            window_hours: 1,
            trained_at: "1970-01-01T00:00:00Z".to_string(),
            metrics: None,
            params: serde_json::Value::Null,
        };

        assert!(matches!(
            create_forecaster(&artifact),
            Err(ForecastError::Incompatible(_))
        ));
    }
}
