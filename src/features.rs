//! Feature construction over aggregated windows.
//!
//! The column order produced here is the schema every model is trained on:
//! base window statistics, calendar fields, lags in configured order, then
//! rolling statistics grouped by window size. Lags, rolling spans and the
//! forecast target look windows up by timestamp, so a missing window yields a
//! null (or a shorter span) instead of silently borrowing a neighbour.

use crate::aggregate::AggregatedWindow;
use crate::config::Config;
use crate::stats;
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use time::{Duration, OffsetDateTime, Weekday};
use tracing::debug;

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const VALUE_COLUMN: &str = "avg_devices";
pub const TARGET_COLUMN: &str = "avg_devices_future";

pub const BASE_COLUMNS: [&str; 6] = [
    VALUE_COLUMN,
    "std_devices",
    "min_devices",
    "max_devices",
    "total_devices",
    "num_scans",
];
pub const CALENDAR_COLUMNS: [&str; 4] = ["hour", "day_of_week", "month", "is_weekend"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeatureError {
    #[error("unknown feature column: {0}")]
    UnknownColumn(String),
    #[error("feature column already present: {0}")]
    DuplicateColumn(String),
    #[error("column {column} is null at {timestamp}")]
    NullValue { column: String, timestamp: String },
    #[error("row has {actual} values, expected {expected}")]
    RowWidth { expected: usize, actual: usize },
    #[error("unknown rolling statistic: {0}")]
    UnknownStat(String),
    #[error("feature table is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Std,
    Min,
    Max,
}

impl RollingStat {
    pub fn parse(value: &str) -> Result<Self, FeatureError> {
        match value {
            "mean" => Ok(Self::Mean),
            "std" => Ok(Self::Std),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(FeatureError::UnknownStat(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    fn apply(self, values: &[f64]) -> Option<f64> {
        match self {
            Self::Mean => stats::mean(values),
            Self::Std => stats::sample_std(values),
            Self::Min => stats::min(values),
            Self::Max => stats::max(values),
        }
    }
}

pub fn lag_column(lag: u32) -> String {
    format!("{VALUE_COLUMN}_lag_{lag}")
}

pub fn rolling_column(window: u32, stat: RollingStat) -> String {
    format!("{VALUE_COLUMN}_rolling_{window}_{}", stat.name())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub timestamp: OffsetDateTime,
    pub values: Vec<Option<f64>>,
}

/// Time-ordered rows with named, possibly-null columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureTable {
    columns: Vec<String>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>, mut rows: Vec<FeatureRow>) -> Result<Self, FeatureError> {
        for (index, column) in columns.iter().enumerate() {
            if columns[..index].contains(column) {
                return Err(FeatureError::DuplicateColumn(column.clone()));
            }
        }
        if let Some(row) = rows.iter().find(|row| row.values.len() != columns.len()) {
            return Err(FeatureError::RowWidth {
                expected: columns.len(),
                actual: row.values.len(),
            });
        }
        rows.sort_by_key(|row| row.timestamp);
        Ok(Self { columns, rows })
    }

    pub fn from_windows(windows: &[AggregatedWindow]) -> Self {
        let columns = BASE_COLUMNS.iter().map(|name| name.to_string()).collect();
        let mut rows: Vec<FeatureRow> = windows
            .iter()
            .map(|window| FeatureRow {
                timestamp: window.window_start,
                values: vec![
                    Some(window.avg_devices),
                    window.std_devices,
                    Some(window.min_devices),
                    Some(window.max_devices),
                    Some(window.total_devices),
                    Some(window.num_scans as f64),
                ],
            })
            .collect();
        rows.sort_by_key(|row| row.timestamp);
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, FeatureError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| FeatureError::UnknownColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<Vec<Option<f64>>, FeatureError> {
        let index = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row.values[index]).collect())
    }

    pub fn last(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    /// Rows with `timestamp >= since`.
    pub fn since(&self, since: OffsetDateTime) -> &[FeatureRow] {
        let start = self.rows.partition_point(|row| row.timestamp < since);
        &self.rows[start..]
    }

    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        values: Vec<Option<f64>>,
    ) -> Result<(), FeatureError> {
        let name = name.into();
        if self.columns.contains(&name) {
            return Err(FeatureError::DuplicateColumn(name));
        }
        if values.len() != self.rows.len() {
            return Err(FeatureError::RowWidth {
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.values.push(value);
        }
        self.columns.push(name);
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Result<(), FeatureError> {
        let index = self.column_index(name)?;
        self.columns.remove(index);
        for row in &mut self.rows {
            row.values.remove(index);
        }
        Ok(())
    }

    /// Keep only rows for which `keep` holds.
    pub fn retain_rows(&mut self, keep: impl FnMut(&FeatureRow) -> bool) {
        self.rows.retain(keep);
    }

    /// Dense matrix over every column except `exclude`. Fails on a remaining null.
    pub fn to_matrix(&self, exclude: &[&str]) -> Result<FeatureMatrix, FeatureError> {
        let selected: Vec<usize> = (0..self.columns.len())
            .filter(|&index| !exclude.contains(&self.columns[index].as_str()))
            .collect();
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut dense = Vec::with_capacity(selected.len());
            for &index in &selected {
                let value = row.values[index].ok_or_else(|| FeatureError::NullValue {
                    column: self.columns[index].clone(),
                    timestamp: row.timestamp.to_string(),
                })?;
                dense.push(value);
            }
            rows.push(dense);
        }
        Ok(FeatureMatrix {
            columns: selected.iter().map(|&index| self.columns[index].clone()).collect(),
            timestamps: self.rows.iter().map(|row| row.timestamp).collect(),
            rows,
        })
    }

    fn values_by_time(&self) -> Result<HashMap<OffsetDateTime, f64>, FeatureError> {
        let index = self.column_index(VALUE_COLUMN)?;
        Ok(self
            .rows
            .iter()
            .filter_map(|row| row.values[index].map(|value| (row.timestamp, value)))
            .collect())
    }
}

/// Dense, null-free feature vectors in a fixed column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub timestamps: Vec<OffsetDateTime>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<f64>, FeatureError> {
        let index = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| FeatureError::UnknownColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|row| row[index]).collect())
    }

    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            columns: self.columns.clone(),
            // Hand-built matrices may carry no timestamps.
            timestamps: self
                .timestamps
                .get(range.clone())
                .map(<[OffsetDateTime]>::to_vec)
                .unwrap_or_default(),
            rows: self.rows[range].to_vec(),
        }
    }

    /// The trailing `count` rows.
    pub fn tail(&self, count: usize) -> Self {
        self.slice(self.len().saturating_sub(count)..self.len())
    }
}

/// Builds the feature schema from the `[aggregation]` and `[features]` config.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    step: Duration,
    lags: Vec<u32>,
    rolling_windows: Vec<u32>,
    rolling_stats: Vec<RollingStat>,
}

impl FeatureBuilder {
    pub fn new(
        window_size_hours: u32,
        lags: Vec<u32>,
        rolling_windows: Vec<u32>,
        rolling_stats: Vec<RollingStat>,
    ) -> Self {
        Self {
            step: Duration::hours(i64::from(window_size_hours.max(1))),
            lags,
            rolling_windows,
            rolling_stats,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, FeatureError> {
        let rolling_stats = config
            .features
            .rolling_stats
            .iter()
            .map(|stat| RollingStat::parse(stat))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            config.aggregation.window_size_hours,
            config.features.lag_periods.clone(),
            config.features.rolling_windows.clone(),
            rolling_stats,
        ))
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// `count` window widths, or `None` when that span overflows.
    fn span(&self, count: u32) -> Option<Duration> {
        i32::try_from(count)
            .ok()
            .and_then(|count| self.step.checked_mul(count))
    }

    /// Columns of a finalized table, in order.
    pub fn feature_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = BASE_COLUMNS
            .iter()
            .chain(CALENDAR_COLUMNS.iter())
            .map(|name| name.to_string())
            .collect();
        columns.extend(self.lags.iter().map(|&lag| lag_column(lag)));
        for &window in &self.rolling_windows {
            columns.extend(
                self.rolling_stats
                    .iter()
                    .map(|&stat| rolling_column(window, stat)),
            );
        }
        columns
    }

    /// Base, calendar, lag and rolling columns. Rows with nulls are kept.
    pub fn build(&self, windows: &[AggregatedWindow]) -> Result<FeatureTable, FeatureError> {
        let mut table = FeatureTable::from_windows(windows);
        add_calendar_features(&mut table)?;
        self.add_lag_features(&mut table)?;
        self.add_rolling_features(&mut table)?;
        Ok(table)
    }

    pub fn add_lag_features(&self, table: &mut FeatureTable) -> Result<(), FeatureError> {
        let by_time = table.values_by_time()?;
        for &lag in &self.lags {
            let offset = self.span(lag);
            let values = table
                .rows
                .iter()
                .map(|row| {
                    offset
                        .and_then(|offset| row.timestamp.checked_sub(offset))
                        .and_then(|at| by_time.get(&at).copied())
                })
                .collect();
            table.push_column(lag_column(lag), values)?;
        }
        Ok(())
    }

    /// Trailing spans include the current window and accept as few as one value.
    pub fn add_rolling_features(&self, table: &mut FeatureTable) -> Result<(), FeatureError> {
        let by_time = table.values_by_time()?;
        for &window in &self.rolling_windows {
            let spans: Vec<Vec<f64>> = table
                .rows
                .iter()
                .map(|row| {
                    (0..window)
                        .filter_map(|back| {
                            let at = row.timestamp.checked_sub(self.span(back)?)?;
                            by_time.get(&at).copied()
                        })
                        .collect()
                })
                .collect();
            for &stat in &self.rolling_stats {
                let values = spans.iter().map(|span| stat.apply(span)).collect();
                table.push_column(rolling_column(window, stat), values)?;
            }
        }
        Ok(())
    }

    /// Add the value `horizon` windows ahead as the target, dropping rows that lack one.
    pub fn make_target(&self, table: &mut FeatureTable, horizon: u32) -> Result<(), FeatureError> {
        let by_time = table.values_by_time()?;
        let offset = self.span(horizon);
        let values = table
            .rows
            .iter()
            .map(|row| {
                offset
                    .and_then(|offset| row.timestamp.checked_add(offset))
                    .and_then(|at| by_time.get(&at).copied())
            })
            .collect();
        table.push_column(TARGET_COLUMN, values)?;
        let target = table.column_index(TARGET_COLUMN)?;
        let before = table.len();
        table.retain_rows(|row| row.values[target].is_some());
        debug!(
            horizon,
            dropped = before - table.len(),
            "Dropped rows without a future value"
        );
        Ok(())
    }
}

pub fn add_calendar_features(table: &mut FeatureTable) -> Result<(), FeatureError> {
    let calendar: Vec<[f64; 4]> = table
        .rows
        .iter()
        .map(|row| calendar_values(row.timestamp))
        .collect();
    for (index, name) in CALENDAR_COLUMNS.iter().enumerate() {
        let values = calendar.iter().map(|fields| Some(fields[index])).collect();
        table.push_column(*name, values)?;
    }
    Ok(())
}

/// `[hour, day_of_week (Monday = 0), month, is_weekend]` in UTC.
pub fn calendar_values(timestamp: OffsetDateTime) -> [f64; 4] {
    let weekday = timestamp.weekday();
    let is_weekend = matches!(weekday, Weekday::Saturday | Weekday::Sunday);
    [
        f64::from(timestamp.hour()),
        f64::from(weekday.number_days_from_monday()),
        f64::from(u8::from(timestamp.month())),
        if is_weekend { 1.0 } else { 0.0 },
    ]
}

/// Drop every row that still holds a null. Nothing is imputed.
pub fn finalize(mut table: FeatureTable) -> FeatureTable {
    let before = table.len();
    table.retain_rows(|row| row.values.iter().all(Option::is_some));
    debug!(
        kept = table.len(),
        dropped = before - table.len(),
        "Dropped rows with missing features"
    );
    table
}

/// Split a targeted table into the forecaster's inputs and target.
pub fn split_target(table: &FeatureTable) -> Result<(FeatureMatrix, Vec<f64>), FeatureError> {
    if table.is_empty() {
        return Err(FeatureError::Empty);
    }
    let target = table.column_index(TARGET_COLUMN)?;
    let features = table.to_matrix(&[TARGET_COLUMN])?;
    let values = table
        .rows
        .iter()
        .map(|row| {
            row.values[target].ok_or_else(|| FeatureError::NullValue {
                column: TARGET_COLUMN.to_string(),
                timestamp: row.timestamp.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((features, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2025-03-07 20:00 UTC);

    fn window(start: OffsetDateTime, avg: f64) -> AggregatedWindow {
        AggregatedWindow {
            window_start: start,
            window_end: start + Duration::hours(1),
            avg_devices: avg,
            std_devices: Some(1.0),
            min_devices: avg - 1.0,
            max_devices: avg + 1.0,
            total_devices: avg * 10.0,
            num_scans: 10,
        }
    }

    fn hourly(values: &[f64]) -> Vec<AggregatedWindow> {
        values
            .iter()
            .enumerate()
            .map(|(hour, &avg)| window(START + Duration::hours(hour as i64), avg))
            .collect()
    }

    fn builder() -> FeatureBuilder {
        FeatureBuilder::new(
            1,
            vec![1, 2],
            vec![3],
            vec![RollingStat::Mean, RollingStat::Std, RollingStat::Max],
        )
    }

    #[test]
    fn built_columns_follow_the_schema_order() -> Result<(), FeatureError> {
        let builder = builder();

        let table = builder.build(&hourly(&[1.0, 2.0, 3.0]))?;

        assert_eq!(table.columns(), builder.feature_columns().as_slice());
        assert_eq!(
            &table.columns()[10..],
            [
                "avg_devices_lag_1",
                "avg_devices_lag_2",
                "avg_devices_rolling_3_mean",
                "avg_devices_rolling_3_std",
                "avg_devices_rolling_3_max",
            ]
        );
        Ok(())
    }

    #[test]
    fn calendar_fields_are_utc_with_monday_zero() {
        let saturday_morning = datetime!(2025-03-08 07:30 UTC);

        assert_eq!(calendar_values(saturday_morning), [7.0, 5.0, 3.0, 1.0]);
        assert_eq!(calendar_values(START), [20.0, 4.0, 3.0, 0.0]);
    }

    #[test]
    fn lags_are_null_until_history_exists() -> Result<(), FeatureError> {
        let table = builder().build(&hourly(&[1.0, 2.0, 3.0, 4.0]))?;

        assert_eq!(
            table.column("avg_devices_lag_2")?,
            vec![None, None, Some(1.0), Some(2.0)]
        );
        Ok(())
    }

    #[test]
    fn lags_skip_over_missing_windows() -> Result<(), FeatureError> {
        let mut windows = hourly(&[1.0, 2.0, 3.0, 4.0]);
        windows.remove(1);

        let table = builder().build(&windows)?;

        assert_eq!(
            table.column("avg_devices_lag_1")?,
            vec![None, None, Some(3.0)]
        );
        assert_eq!(
            table.column("avg_devices_lag_2")?,
            vec![None, Some(1.0), None]
        );
        Ok(())
    }

    #[test]
    fn rolling_spans_accept_partial_history() -> Result<(), FeatureError> {
        let table = builder().build(&hourly(&[2.0, 4.0, 6.0, 8.0]))?;

        assert_eq!(
            table.column("avg_devices_rolling_3_mean")?,
            vec![Some(2.0), Some(3.0), Some(4.0), Some(6.0)]
        );
        assert_eq!(
            table.column("avg_devices_rolling_3_max")?,
            vec![Some(2.0), Some(4.0), Some(6.0), Some(8.0)]
        );
        let std = table.column("avg_devices_rolling_3_std")?;
        assert_eq!(std[0], None);
        assert!(std[3].is_some_and(|value| (value - 2.0).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn target_looks_ahead_and_drops_the_tail() -> Result<(), FeatureError> {
        let builder = builder();
        let mut table = builder.build(&hourly(&[1.0, 2.0, 3.0, 4.0, 5.0]))?;

        builder.make_target(&mut table, 2)?;

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.column(TARGET_COLUMN)?,
            vec![Some(3.0), Some(4.0), Some(5.0)]
        );
        Ok(())
    }

    #[test]
    fn offsets_past_the_calendar_are_null() -> Result<(), FeatureError> {
        let builder = FeatureBuilder::new(1, vec![u32::MAX], vec![2], vec![RollingStat::Mean]);
        let mut table = builder.build(&hourly(&[1.0, 2.0, 3.0]))?;
        builder.make_target(&mut table, u32::MAX)?;

        assert!(table.is_empty());
        let table = builder.build(&hourly(&[1.0, 2.0, 3.0]))?;
        assert_eq!(table.column(&lag_column(u32::MAX))?, vec![None, None, None]);
        Ok(())
    }

    #[test]
    fn finalize_drops_rows_with_any_null() -> Result<(), FeatureError> {
        let table = builder().build(&hourly(&[1.0, 2.0, 3.0, 4.0, 5.0]))?;

        let finalized = finalize(table);

        assert_eq!(finalized.len(), 3);
        assert_eq!(finalized.rows()[0].timestamp, START + Duration::hours(2));
        Ok(())
    }

    #[test]
    fn split_target_separates_inputs() -> Result<(), FeatureError> {
        let builder = builder();
        let mut table = finalize(builder.build(&hourly(&[1.0, 2.0, 3.0, 4.0, 5.0]))?);
        builder.make_target(&mut table, 1)?;

        let (features, target) = split_target(&table)?;

        assert_eq!(features.columns, builder.feature_columns());
        assert_eq!(features.len(), 2);
        assert_eq!(target, vec![4.0, 5.0]);
        Ok(())
    }

    #[test]
    fn to_matrix_rejects_remaining_nulls() -> Result<(), FeatureError> {
        let table = builder().build(&hourly(&[1.0, 2.0]))?;

        let result = table.to_matrix(&[]);

        assert!(matches!(result, Err(FeatureError::NullValue { .. })));
        Ok(())
    }

    #[test]
    fn unknown_rolling_stat_is_an_error() {
        assert_eq!(
            RollingStat::parse("median"),
            Err(FeatureError::UnknownStat("median".to_string()))
        );
    }
}
