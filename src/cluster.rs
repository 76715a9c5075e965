//! Activity-level classifier.
//!
//! A diagonal-covariance Gaussian mixture is fitted by EM on a standardized
//! projection of the traffic signal (volume plus cyclical hour and weekday
//! encodings). Mixture components are numbered arbitrarily, so training also
//! records a [`LabelOrder`] ranking components by the mean volume of the
//! windows assigned to them; every prediction is reported through it, which
//! keeps label 0 the quietest level across retrains.

use crate::config::ClusteringSection;
use crate::features::{FeatureError, FeatureMatrix, VALUE_COLUMN};
use crate::scaler::StandardScaler;
use crate::stats;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

pub const CLASSIFIER_FORMAT_VERSION: u32 = 1;
pub const LABEL_ORDER_VERSION: u32 = 1;
pub const LEVEL_NAMES: [&str; 3] = ["Quiet", "Moderate", "Busy"];

const HOUR_COLUMN: &str = "hour";
const WEEKDAY_COLUMN: &str = "day_of_week";
const REG_COVAR: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier artifact not found at {0}")]
    Unavailable(PathBuf),
    #[error("classifier artifact is incompatible: {0}")]
    Incompatible(String),
    #[error("classifier training failed: {0}")]
    Training(String),
    #[error("classifier artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("classifier artifact json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to format training time: {0}")]
    Timestamp(#[from] time::error::Format),
}

impl From<FeatureError> for ClassifierError {
    fn from(err: FeatureError) -> Self {
        ClassifierError::Incompatible(err.to_string())
    }
}

pub fn level_name(label: usize, levels: usize) -> String {
    if levels == LEVEL_NAMES.len() {
        LEVEL_NAMES[label].to_string()
    } else {
        format!("Level {label}")
    }
}

/// Component index to ordinal label, ascending by mean training volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOrder {
    pub version: u32,
    component_to_label: Vec<usize>,
}

impl LabelOrder {
    /// Rank components by `volumes`; ties keep component order.
    pub fn from_volumes(volumes: &[f64]) -> Self {
        let mut components: Vec<usize> = (0..volumes.len()).collect();
        components.sort_by(|&a, &b| volumes[a].total_cmp(&volumes[b]).then(a.cmp(&b)));
        let mut component_to_label = vec![0; volumes.len()];
        for (label, component) in components.into_iter().enumerate() {
            component_to_label[component] = label;
        }
        Self {
            version: LABEL_ORDER_VERSION,
            component_to_label,
        }
    }

    pub fn len(&self) -> usize {
        self.component_to_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.component_to_label.is_empty()
    }

    pub fn label(&self, component: usize) -> usize {
        self.component_to_label[component]
    }

    pub fn is_bijection(&self) -> bool {
        let mut seen = vec![false; self.len()];
        self.component_to_label.iter().all(|&label| {
            label < seen.len() && !std::mem::replace(&mut seen[label], true)
        })
    }

    /// Move each component's probability to its label's slot.
    pub fn reorder(&self, by_component: &[f64]) -> Vec<f64> {
        let mut by_label = vec![0.0; by_component.len()];
        for (component, probability) in by_component.iter().enumerate() {
            by_label[self.component_to_label[component]] = *probability;
        }
        by_label
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GaussianMixture {
    weights: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

impl GaussianMixture {
    fn components(&self) -> usize {
        self.weights.len()
    }

    fn log_joint(&self, point: &[f64]) -> Vec<f64> {
        (0..self.components())
            .map(|component| {
                let log_density: f64 = point
                    .iter()
                    .zip(&self.means[component])
                    .zip(&self.variances[component])
                    .map(|((x, mu), var)| -0.5 * ((2.0 * PI * var).ln() + (x - mu).powi(2) / var))
                    .sum();
                self.weights[component].max(f64::MIN_POSITIVE).ln() + log_density
            })
            .collect()
    }

    /// Posterior responsibilities and the log-likelihood of `point`.
    fn posterior(&self, point: &[f64]) -> (Vec<f64>, f64) {
        let log_joint = self.log_joint(point);
        let peak = log_joint.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let total = peak + log_joint.iter().map(|lp| (lp - peak).exp()).sum::<f64>().ln();
        let responsibilities = log_joint.iter().map(|lp| (lp - total).exp()).collect();
        (responsibilities, total)
    }

    /// Quantile initialisation on the first (volume) dimension.
    fn initialise(points: &[Vec<f64>], components: usize) -> Self {
        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&a, &b| points[a][0].total_cmp(&points[b][0]));
        let width = points[0].len();
        let mut mixture = Self {
            weights: Vec::with_capacity(components),
            means: Vec::with_capacity(components),
            variances: Vec::with_capacity(components),
        };
        for component in 0..components {
            let lo = component * points.len() / components;
            let hi = (component + 1) * points.len() / components;
            let members: Vec<&Vec<f64>> = order[lo..hi].iter().map(|&i| &points[i]).collect();
            let count = members.len().max(1) as f64;
            let mean: Vec<f64> = (0..width)
                .map(|d| members.iter().map(|p| p[d]).sum::<f64>() / count)
                .collect();
            let variance: Vec<f64> = (0..width)
                .map(|d| {
                    members.iter().map(|p| (p[d] - mean[d]).powi(2)).sum::<f64>() / count
                        + REG_COVAR
                })
                .collect();
            mixture.weights.push(members.len() as f64 / points.len() as f64);
            mixture.means.push(mean);
            mixture.variances.push(variance);
        }
        mixture
    }

    fn fit(points: &[Vec<f64>], components: usize, max_iter: usize, tolerance: f64) -> Self {
        let mut mixture = Self::initialise(points, components);
        let width = points[0].len();
        let mut previous = f64::NEG_INFINITY;

        for iteration in 0..max_iter.max(1) {
            let mut responsibilities = Vec::with_capacity(points.len());
            let mut log_likelihood = 0.0;
            for point in points {
                let (resp, total) = mixture.posterior(point);
                log_likelihood += total;
                responsibilities.push(resp);
            }
            log_likelihood /= points.len() as f64;

            for component in 0..components {
                let mass: f64 = responsibilities.iter().map(|r| r[component]).sum();
                if mass < 1e-10 {
                    // Empty component keeps its parameters.
                    mixture.weights[component] = 0.0;
                    continue;
                }
                let mean: Vec<f64> = (0..width)
                    .map(|d| {
                        points
                            .iter()
                            .zip(&responsibilities)
                            .map(|(p, r)| r[component] * p[d])
                            .sum::<f64>()
                            / mass
                    })
                    .collect();
                let variance: Vec<f64> = (0..width)
                    .map(|d| {
                        points
                            .iter()
                            .zip(&responsibilities)
                            .map(|(p, r)| r[component] * (p[d] - mean[d]).powi(2))
                            .sum::<f64>()
                            / mass
                            + REG_COVAR
                    })
                    .collect();
                mixture.weights[component] = mass / points.len() as f64;
                mixture.means[component] = mean;
                mixture.variances[component] = variance;
            }

            if (log_likelihood - previous).abs() < tolerance {
                info!(iterations = iteration + 1, log_likelihood, "Mixture converged");
                return mixture;
            }
            previous = log_likelihood;
        }
        warn!(max_iter, "Mixture did not converge");
        mixture
    }
}

/// Projection of a feature row into the clustering space.
fn project(inputs: &[f64]) -> Vec<f64> {
    let mut projected = vec![inputs[0]];
    if let Some(hour) = inputs.get(1) {
        projected.push((2.0 * PI * hour / 24.0).sin());
        projected.push((2.0 * PI * hour / 24.0).cos());
    }
    if let Some(weekday) = inputs.get(2) {
        projected.push((2.0 * PI * weekday / 7.0).sin());
        projected.push((2.0 * PI * weekday / 7.0).cos());
    }
    projected
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPrediction {
    pub label: usize,
    /// Indexed by ordinal label.
    pub probabilities: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelSummary {
    pub name: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterEvaluation {
    pub silhouette: Option<f64>,
    pub levels: Vec<LevelSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternClassifier {
    format_version: u32,
    trained_at: String,
    /// Feature columns read from each row, volume first.
    input_columns: Vec<String>,
    scaler: StandardScaler,
    mixture: GaussianMixture,
    label_order: LabelOrder,
    /// Mean training volume per ordinal label.
    level_volumes: Vec<f64>,
}

impl PatternClassifier {
    pub fn train(
        features: &FeatureMatrix,
        settings: &ClusteringSection,
    ) -> Result<Self, ClassifierError> {
        let components = settings.n_components;
        if features.len() < components {
            return Err(ClassifierError::Training(format!(
                "need at least {components} rows, got {}",
                features.len()
            )));
        }
        let mut input_columns = vec![VALUE_COLUMN.to_string()];
        if features.columns.iter().any(|c| c == HOUR_COLUMN) {
            input_columns.push(HOUR_COLUMN.to_string());
            if features.columns.iter().any(|c| c == WEEKDAY_COLUMN) {
                input_columns.push(WEEKDAY_COLUMN.to_string());
            }
        }

        let inputs = select_rows(features, &input_columns)?;
        let projected: Vec<Vec<f64>> = inputs.iter().map(|row| project(row)).collect();
        let scaler = StandardScaler::fit(&projected);
        let points: Vec<Vec<f64>> = projected.iter().map(|row| scaler.transform(row)).collect();
        let mixture = GaussianMixture::fit(
            &points,
            components,
            settings.max_iter,
            settings.tolerance,
        );

        let assignments: Vec<usize> = points
            .iter()
            .map(|point| argmax(&mixture.posterior(point).0))
            .collect();
        let component_volumes: Vec<f64> = (0..components)
            .map(|component| {
                let members: Vec<f64> = inputs
                    .iter()
                    .zip(&assignments)
                    .filter(|(_, assigned)| **assigned == component)
                    .map(|(row, _)| row[0])
                    .collect();
                stats::mean(&members)
                    .unwrap_or_else(|| scaler.inverse_column(0, mixture.means[component][0]))
            })
            .collect();
        let label_order = LabelOrder::from_volumes(&component_volumes);
        let mut level_volumes = vec![0.0; components];
        for (component, volume) in component_volumes.iter().enumerate() {
            level_volumes[label_order.label(component)] = *volume;
        }

        info!(
            components,
            rows = features.len(),
            level_volumes = ?level_volumes,
            "Pattern classifier trained"
        );
        Ok(Self {
            format_version: CLASSIFIER_FORMAT_VERSION,
            trained_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
            input_columns,
            scaler,
            mixture,
            label_order,
            level_volumes,
        })
    }

    pub fn levels(&self) -> usize {
        self.label_order.len()
    }

    pub fn label_order(&self) -> &LabelOrder {
        &self.label_order
    }

    pub fn level_volumes(&self) -> &[f64] {
        &self.level_volumes
    }

    pub fn trained_at(&self) -> &str {
        &self.trained_at
    }

    pub fn predict(&self, features: &FeatureMatrix) -> Result<Vec<ClusterPrediction>, ClassifierError> {
        let inputs = select_rows(features, &self.input_columns)?;
        Ok(inputs.iter().map(|row| self.predict_inputs(row)).collect())
    }

    fn predict_inputs(&self, inputs: &[f64]) -> ClusterPrediction {
        let point = self.scaler.transform(&project(inputs));
        let (by_component, _) = self.mixture.posterior(&point);
        let probabilities = self.label_order.reorder(&by_component);
        ClusterPrediction {
            label: argmax(&probabilities),
            probabilities,
        }
    }

    pub fn evaluate(&self, features: &FeatureMatrix) -> Result<ClusterEvaluation, ClassifierError> {
        let inputs = select_rows(features, &self.input_columns)?;
        let labels: Vec<usize> = inputs
            .iter()
            .map(|row| self.predict_inputs(row).label)
            .collect();
        let points: Vec<Vec<f64>> = inputs
            .iter()
            .map(|row| self.scaler.transform(&project(row)))
            .collect();

        let levels = (0..self.levels())
            .map(|label| {
                let volumes: Vec<f64> = inputs
                    .iter()
                    .zip(&labels)
                    .filter(|(_, assigned)| **assigned == label)
                    .map(|(row, _)| row[0])
                    .collect();
                LevelSummary {
                    name: level_name(label, self.levels()),
                    count: volumes.len(),
                    mean: stats::mean(&volumes),
                    std: stats::sample_std(&volumes),
                }
            })
            .collect();
        let evaluation = ClusterEvaluation {
            silhouette: silhouette(&points, &labels),
            levels,
        };
        info!(silhouette = ?evaluation.silhouette, "Pattern classifier evaluated");
        Ok(evaluation)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ClassifierError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Saved pattern classifier");
        Ok(())
    }

    /// Load and check an artifact. Any structural problem is `Incompatible`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::Unavailable(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let classifier: Self = serde_json::from_str(&contents)
            .map_err(|err| ClassifierError::Incompatible(err.to_string()))?;
        classifier.check()?;
        Ok(classifier)
    }

    fn check(&self) -> Result<(), ClassifierError> {
        let incompatible = |msg: String| Err(ClassifierError::Incompatible(msg));
        if self.format_version != CLASSIFIER_FORMAT_VERSION {
            return incompatible(format!("format version {}", self.format_version));
        }
        let components = self.mixture.components();
        if components == 0
            || self.mixture.means.len() != components
            || self.mixture.variances.len() != components
        {
            return incompatible(format!(
                "{components} weights against {} means and {} variances",
                self.mixture.means.len(),
                self.mixture.variances.len()
            ));
        }
        if self.label_order.len() != components || !self.label_order.is_bijection() {
            return incompatible("label order is not a bijection over components".to_string());
        }
        let probe = vec![0.0; self.input_columns.len()];
        let width = project(&probe).len();
        if self.scaler.width() != width
            || self.mixture.means.iter().any(|m| m.len() != width)
            || self.mixture.variances.iter().any(|v| v.len() != width)
        {
            return incompatible(format!("expected {width}-dimensional parameters"));
        }
        Ok(())
    }
}

fn select_rows(features: &FeatureMatrix, columns: &[String]) -> Result<Vec<Vec<f64>>, ClassifierError> {
    let indices = columns
        .iter()
        .map(|name| {
            features
                .columns
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| FeatureError::UnknownColumn(name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(features
        .rows
        .iter()
        .map(|row| indices.iter().map(|&index| row[index]).collect())
        .collect())
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(index, _)| index)
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Mean silhouette coefficient. Undefined unless at least two labels are used
/// and not every point is its own cluster.
fn silhouette(points: &[Vec<f64>], labels: &[usize]) -> Option<f64> {
    let clusters = labels.iter().copied().max()? + 1;
    let mut sizes = vec![0usize; clusters];
    for &label in labels {
        sizes[label] += 1;
    }
    let used = sizes.iter().filter(|&&size| size > 0).count();
    if used < 2 || used == points.len() {
        return None;
    }

    let mut total = 0.0;
    for (i, point) in points.iter().enumerate() {
        let mut sums = vec![0.0; clusters];
        for (j, other) in points.iter().enumerate() {
            if i != j {
                sums[labels[j]] += distance(point, other);
            }
        }
        let own = labels[i];
        if sizes[own] < 2 {
            continue;
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..clusters)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let spread = a.max(b);
        if spread > 0.0 {
            total += (b - a) / spread;
        }
    }
    Some(total / points.len() as f64)
}
