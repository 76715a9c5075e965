//! Processed dataset storage: one CSV row per window plus a metadata sidecar.

use crate::features::{FeatureError, FeatureRow, FeatureTable, TIMESTAMP_COLUMN};
use crate::scan::record::parse_timestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

pub const DATASET_FILE: &str = "processed_traffic_data.csv";
pub const METADATA_FILE: &str = "processed_traffic_data_metadata.json";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not found at {0}")]
    Missing(PathBuf),
    #[error("dataset io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("dataset metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("failed to format timestamp: {0}")]
    Format(#[from] time::error::Format),
    #[error("dataset must start with a {TIMESTAMP_COLUMN} column")]
    MissingTimestamp,
    #[error("row {row}: invalid timestamp {value:?}")]
    Timestamp { row: usize, value: String },
    #[error("row {row}: invalid value {value:?} in column {column}")]
    Value {
        row: usize,
        column: String,
        value: String,
    },
    #[error(transparent)]
    Features(#[from] FeatureError),
}

impl DatasetError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_)) || matches!(self, Self::Csv(err) if err.is_io_error())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub num_records: usize,
    pub date_range: DateRange,
    pub columns: Vec<String>,
    pub processing_date: String,
}

#[derive(Debug, Clone)]
pub struct DatasetStore {
    dir: PathBuf,
}

impl DatasetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.dir.join(DATASET_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Write the table and its metadata. The CSV is swapped in whole.
    pub fn save(&self, table: &FeatureTable) -> Result<DatasetMetadata, DatasetError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dataset_path();
        let staging = path.with_extension("csv.tmp");

        let mut writer = csv::Writer::from_path(&staging)?;
        let mut header = vec![TIMESTAMP_COLUMN.to_string()];
        header.extend(table.columns().iter().cloned());
        writer.write_record(&header)?;
        for row in table.rows() {
            let mut record = vec![row.timestamp.format(&Rfc3339)?];
            record.extend(
                row.values
                    .iter()
                    .map(|value| value.map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&staging, &path)?;

        let metadata = DatasetMetadata {
            num_records: table.len(),
            date_range: DateRange {
                start: format_bound(table.rows().first())?,
                end: format_bound(table.rows().last())?,
            },
            columns: header,
            processing_date: OffsetDateTime::now_utc().format(&Rfc3339)?,
        };
        fs::write(
            self.metadata_path(),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        info!(
            path = %path.display(),
            records = metadata.num_records,
            columns = metadata.columns.len(),
            "Saved processed dataset"
        );
        Ok(metadata)
    }

    pub fn load(&self) -> Result<FeatureTable, DatasetError> {
        let path = self.dataset_path();
        if !path.exists() {
            return Err(DatasetError::Missing(path));
        }
        read_table(&path)
    }

    pub fn load_metadata(&self) -> Result<DatasetMetadata, DatasetError> {
        let path = self.metadata_path();
        if !path.exists() {
            return Err(DatasetError::Missing(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn format_bound(row: Option<&FeatureRow>) -> Result<Option<String>, DatasetError> {
    row.map(|row| row.timestamp.format(&Rfc3339))
        .transpose()
        .map_err(DatasetError::from)
}

fn read_table(path: &Path) -> Result<FeatureTable, DatasetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if headers.get(0) != Some(TIMESTAMP_COLUMN) {
        return Err(DatasetError::MissingTimestamp);
    }
    let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        let raw_timestamp = record.get(0).unwrap_or_default();
        let timestamp = parse_timestamp(raw_timestamp).map_err(|_| DatasetError::Timestamp {
            row,
            value: raw_timestamp.to_string(),
        })?;
        let values = record
            .iter()
            .skip(1)
            .zip(&columns)
            .map(|(cell, column)| parse_cell(cell, row, column))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(FeatureRow { timestamp, values });
    }
    Ok(FeatureTable::new(columns, rows)?)
}

fn parse_cell(cell: &str, row: usize, column: &str) -> Result<Option<f64>, DatasetError> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    // Boolean flags written by other tooling.
    match cell {
        "True" | "true" => return Ok(Some(1.0)),
        "False" | "false" => return Ok(Some(0.0)),
        _ => {}
    }
    cell.parse::<f64>()
        .map(Some)
        .map_err(|_| DatasetError::Value {
            row,
            column: column.to_string(),
            value: cell.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn temp_store(label: &str) -> Result<DatasetStore, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        Ok(DatasetStore::new(
            std::env::temp_dir().join(format!("pflow-dataset-{label}-{unique}")),
        ))
    }

    fn table() -> Result<FeatureTable, FeatureError> {
        FeatureTable::new(
            vec!["avg_devices".to_string(), "std_devices".to_string()],
            vec![
                FeatureRow {
                    timestamp: datetime!(2025-03-03 09:00 UTC),
                    values: vec![Some(7.5), None],
                },
                FeatureRow {
                    timestamp: datetime!(2025-03-03 08:00 UTC),
                    values: vec![Some(3.25), Some(0.5)],
                },
            ],
        )
    }

    #[test]
    fn saved_table_loads_back_with_nulls() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("roundtrip")?;
        let table = table()?;

        let metadata = store.save(&table)?;
        let loaded = store.load()?;
        let _ = fs::remove_dir_all(&store.dir);

        assert_eq!(loaded, table);
        assert_eq!(metadata.num_records, 2);
        assert_eq!(metadata.columns[0], "timestamp");
        assert_eq!(
            metadata.date_range.start.as_deref(),
            Some("2025-03-03T08:00:00Z")
        );
        Ok(())
    }

    #[test]
    fn missing_dataset_is_reported_not_retried() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("missing")?;

        let result = store.load();

        assert!(matches!(&result, Err(DatasetError::Missing(_))));
        assert!(result.err().is_some_and(|err| !err.is_transient()));
        Ok(())
    }

    #[test]
    fn externally_written_csv_is_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("external")?;
        fs::create_dir_all(&store.dir)?;
        fs::write(
            store.dataset_path(),
            "timestamp,avg_devices,is_weekend\n2025-03-08 08:00:00,12.0,True\n",
        )?;

        let loaded = store.load()?;
        let _ = fs::remove_dir_all(&store.dir);

        assert_eq!(loaded.rows()[0].timestamp, datetime!(2025-03-08 08:00 UTC));
        assert_eq!(loaded.column("is_weekend")?, vec![Some(1.0)]);
        Ok(())
    }

    #[test]
    fn non_numeric_cell_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = temp_store("bad-cell")?;
        fs::create_dir_all(&store.dir)?;
        fs::write(
            store.dataset_path(),
            "timestamp,avg_devices\n2025-03-03T08:00:00Z,lots\n",
        )?;

        let result = store.load();
        let _ = fs::remove_dir_all(&store.dir);

        assert!(matches!(result, Err(DatasetError::Value { row: 1, .. })));
        Ok(())
    }
}
