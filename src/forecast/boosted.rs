//! Gradient-boosted regression trees on squared loss.

use crate::config::BoostedSection;
use crate::features::FeatureMatrix;
use crate::forecast::ForecastError;
use crate::forecast::model::{Forecaster, check_schema};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

pub const KIND: &str = "boosted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub min_samples_leaf: usize,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

impl From<&BoostedSection> for BoostedParams {
    fn from(section: &BoostedSection) -> Self {
        Self {
            n_estimators: section.n_estimators,
            max_depth: section.max_depth,
            learning_rate: section.learning_rate,
            subsample: section.subsample,
            min_samples_leaf: section.min_samples_leaf,
            early_stopping_rounds: section.early_stopping_rounds,
            seed: section.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

struct TreeBuilder<'a> {
    rows: &'a [Vec<f64>],
    residuals: &'a [f64],
    max_depth: usize,
    min_samples_leaf: usize,
}

impl TreeBuilder<'_> {
    fn build(&self, indices: Vec<usize>, depth: usize) -> Node {
        let leaf = Node::Leaf {
            value: indices.iter().map(|&i| self.residuals[i]).sum::<f64>()
                / indices.len().max(1) as f64,
        };
        if depth >= self.max_depth || indices.len() < 2 * self.min_samples_leaf {
            return leaf;
        }
        match self.best_split(&indices) {
            Some(split) => {
                trace!(depth, feature = split.feature, gain = split.gain, "Split node");
                Node::Split {
                    feature: split.feature,
                    threshold: split.threshold,
                    left: Box::new(self.build(split.left, depth + 1)),
                    right: Box::new(self.build(split.right, depth + 1)),
                }
            }
            None => leaf,
        }
    }

    /// Exhaustive search maximising the reduction in squared error.
    fn best_split(&self, indices: &[usize]) -> Option<BestSplit> {
        let width = self.rows.first().map_or(0, Vec::len);
        let total: f64 = indices.iter().map(|&i| self.residuals[i]).sum();
        let count = indices.len() as f64;
        let parent_score = total * total / count;
        let mut best: Option<(usize, f64, f64)> = None;

        let mut sorted = indices.to_vec();
        for feature in 0..width {
            sorted.sort_by(|&a, &b| self.rows[a][feature].total_cmp(&self.rows[b][feature]));
            let mut left_sum = 0.0;
            for position in 0..sorted.len() - 1 {
                left_sum += self.residuals[sorted[position]];
                let left_count = position + 1;
                let right_count = sorted.len() - left_count;
                if left_count < self.min_samples_leaf || right_count < self.min_samples_leaf {
                    continue;
                }
                let here = self.rows[sorted[position]][feature];
                let next = self.rows[sorted[position + 1]][feature];
                if next <= here {
                    continue;
                }
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / left_count as f64
                    + right_sum * right_sum / right_count as f64
                    - parent_score;
                if gain > best.map_or(1e-12, |(_, _, g)| g) {
                    best = Some((feature, (here + next) / 2.0, gain));
                }
            }
        }

        let (feature, threshold, gain) = best?;
        let (left, right) = indices
            .iter()
            .partition(|&&i| self.rows[i][feature] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            gain,
            left,
            right,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BoostedState {
    params: BoostedParams,
    base_score: f64,
    trees: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct BoostedForecaster {
    schema: Vec<String>,
    horizon: u32,
    state: BoostedState,
}

impl BoostedForecaster {
    /// Fit on `train`, stopping early once `validation` error stops improving.
    pub fn train(
        params: BoostedParams,
        horizon: u32,
        train: (&FeatureMatrix, &[f64]),
        validation: Option<(&FeatureMatrix, &[f64])>,
    ) -> Result<Self, ForecastError> {
        let (features, target) = train;
        if features.is_empty() || features.len() != target.len() {
            return Err(ForecastError::Training(format!(
                "{} feature rows for {} targets",
                features.len(),
                target.len()
            )));
        }
        if let Some((validation, _)) = validation {
            check_schema(&features.columns, validation)?;
        }

        let base_score = target.iter().sum::<f64>() / target.len() as f64;
        let mut predictions = vec![base_score; target.len()];
        let mut validation_predictions =
            validation.map(|(v, _)| vec![base_score; v.len()]).unwrap_or_default();
        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_size = ((features.len() as f64 * params.subsample.clamp(0.0, 1.0)).round()
            as usize)
            .clamp(1, features.len());

        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut best_loss = f64::INFINITY;
        let mut best_trees = 0;
        for round in 0..params.n_estimators {
            let residuals: Vec<f64> = target
                .iter()
                .zip(&predictions)
                .map(|(y, p)| y - p)
                .collect();
            let indices = if sample_size < features.len() {
                let mut sampled = rand::seq::index::sample(&mut rng, features.len(), sample_size)
                    .into_vec();
                sampled.sort_unstable();
                sampled
            } else {
                (0..features.len()).collect()
            };
            let tree = TreeBuilder {
                rows: &features.rows,
                residuals: &residuals,
                max_depth: params.max_depth,
                min_samples_leaf: params.min_samples_leaf.max(1),
            }
            .build(indices, 0);

            for (prediction, row) in predictions.iter_mut().zip(&features.rows) {
                *prediction += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);

            let Some((validation, validation_target)) = validation else {
                continue;
            };
            if validation.is_empty() {
                continue;
            }
            for (prediction, row) in validation_predictions.iter_mut().zip(&validation.rows) {
                *prediction += params.learning_rate * trees[round].predict(row);
            }
            let loss = validation_target
                .iter()
                .zip(&validation_predictions)
                .map(|(y, p)| (y - p).powi(2))
                .sum::<f64>()
                / validation_target.len() as f64;
            if loss < best_loss {
                best_loss = loss;
                best_trees = round + 1;
            } else if params.early_stopping_rounds > 0
                && round + 1 - best_trees >= params.early_stopping_rounds
            {
                debug!(round, best_trees, "Early stopping");
                break;
            }
        }
        if best_trees > 0 {
            trees.truncate(best_trees);
        }

        info!(
            trees = trees.len(),
            rows = features.len(),
            validation_mse = best_loss,
            "Boosted forecaster trained"
        );
        Ok(Self {
            schema: features.columns.clone(),
            horizon,
            state: BoostedState {
                params,
                base_score,
                trees,
            },
        })
    }

    pub fn from_params(
        schema: Vec<String>,
        horizon: u32,
        params: serde_json::Value,
    ) -> Result<Self, ForecastError> {
        let state: BoostedState = serde_json::from_value(params)
            .map_err(|err| ForecastError::Incompatible(err.to_string()))?;
        let width = schema.len();
        if state.trees.iter().any(|tree| max_feature(tree).is_some_and(|f| f >= width)) {
            return Err(ForecastError::Incompatible(format!(
                "tree references a feature beyond the {width}-column schema"
            )));
        }
        Ok(Self {
            schema,
            horizon,
            state,
        })
    }

    pub fn trees(&self) -> usize {
        self.state.trees.len()
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.state.base_score
            + self
                .state
                .trees
                .iter()
                .map(|tree| self.state.params.learning_rate * tree.predict(row))
                .sum::<f64>()
    }
}

fn max_feature(node: &Node) -> Option<usize> {
    match node {
        Node::Leaf { .. } => None,
        Node::Split {
            feature,
            left,
            right,
            ..
        } => [Some(*feature), max_feature(left), max_feature(right)]
            .into_iter()
            .flatten()
            .max(),
    }
}

impl Forecaster for BoostedForecaster {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn horizon(&self) -> u32 {
        self.horizon
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, ForecastError> {
        check_schema(&self.schema, features)?;
        Ok(features.rows.iter().map(|row| self.predict_row(row)).collect())
    }

    fn params(&self) -> Result<serde_json::Value, ForecastError> {
        Ok(serde_json::to_value(&self.state)?)
    }
}
