use serde::{Deserialize, Serialize};

/// Per-column standardization to zero mean and unit (population) variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let count = rows.len().max(1) as f64;
        let mut mean = vec![0.0; width];
        for row in rows {
            for (sum, value) in mean.iter_mut().zip(row) {
                *sum += value;
            }
        }
        mean.iter_mut().for_each(|sum| *sum /= count);

        let mut scale = vec![0.0; width];
        for row in rows {
            for ((acc, value), mu) in scale.iter_mut().zip(row).zip(&mean) {
                *acc += (value - mu).powi(2);
            }
        }
        for acc in &mut scale {
            let std = (*acc / count).sqrt();
            // Constant columns pass through centred.
            *acc = if std > f64::EPSILON { std } else { 1.0 };
        }
        Self { mean, scale }
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect()
    }

    pub fn inverse_column(&self, column: usize, value: f64) -> f64 {
        value * self.scale[column] + self.mean[column]
    }
}

/// Per-column rescaling onto `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: Vec<f64>,
    pub range: Vec<f64>,
}

impl MinMaxScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let mut min = vec![f64::INFINITY; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        for row in rows {
            for (column, value) in row.iter().enumerate().take(width) {
                min[column] = min[column].min(*value);
                max[column] = max[column].max(*value);
            }
        }
        let range = min
            .iter()
            .zip(&max)
            .map(|(lo, hi)| if hi - lo > f64::EPSILON { hi - lo } else { 1.0 })
            .collect();
        Self { min, range }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.min.iter().zip(&self.range))
            .map(|(value, (min, range))| (value - min) / range)
            .collect()
    }

    pub fn transform_value(&self, column: usize, value: f64) -> f64 {
        (value - self.min[column]) / self.range[column]
    }

    pub fn inverse_value(&self, column: usize, value: f64) -> f64 {
        value * self.range[column] + self.min[column]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_scaler_centres_and_scales() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];

        let scaler = StandardScaler::fit(&rows);

        assert_eq!(scaler.mean, vec![2.0, 5.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform(&[3.0, 5.0]), vec![1.0, 0.0]);
        assert_eq!(scaler.inverse_column(0, -1.0), 1.0);
    }

    #[test]
    fn min_max_scaler_maps_onto_unit_range() {
        let rows = vec![vec![10.0, 2.0], vec![20.0, 2.0], vec![15.0, 2.0]];

        let scaler = MinMaxScaler::fit(&rows);

        assert_eq!(scaler.transform(&[15.0, 2.0]), vec![0.5, 0.0]);
        assert_eq!(scaler.inverse_value(0, 1.0), 20.0);
    }
}
