//! Line-delimited JSON scan log, one file per UTC day.

use crate::identity::IdentityToken;
use crate::scan::{DeviceObservation, Protocol, ScanEvent, ScanId};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "scan_";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("scan log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode scan record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to format scan timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

#[derive(Debug, Error)]
enum RecordError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        source: time::error::Parse,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct ScanRecord {
    timestamp: String,
    scan_id: ScanId,
    #[serde(default)]
    device_count: usize,
    devices: Vec<DeviceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord {
    mac_hash: IdentityToken,
    rssi: Option<i16>,
    #[serde(default = "unknown_protocol")]
    protocol: Protocol,
}

fn unknown_protocol() -> Protocol {
    Protocol::Unknown
}

/// Inclusive timestamp bounds for loading.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    pub fn contains(&self, timestamp: OffsetDateTime) -> bool {
        self.start.is_none_or(|start| timestamp >= start)
            && self.end.is_none_or(|end| timestamp <= end)
    }
}

const SPACED_DATETIME: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
);

/// Parse an RFC 3339 timestamp, or an offset-less one (`T` or space separated) taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).map(|dt| dt.assume_utc()))
        .or_else(|_| PrimitiveDateTime::parse(value, SPACED_DATETIME).map(|dt| dt.assume_utc()))
}

#[derive(Debug, Clone)]
pub struct ScanLog {
    dir: PathBuf,
    log_empty_scans: bool,
}

impl ScanLog {
    pub fn new(dir: impl Into<PathBuf>, log_empty_scans: bool) -> Self {
        Self {
            dir: dir.into(),
            log_empty_scans,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `event` to its day file. Returns `false` when an empty scan was skipped.
    pub fn append(&self, event: &ScanEvent) -> Result<bool, IngestError> {
        if !self.log_empty_scans && event.device_count() == 0 {
            debug!(scan_id = event.scan_id(), "Skipping empty scan");
            return Ok(false);
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(day_file_name(event.timestamp()));
        let record = ScanRecord {
            timestamp: event.timestamp().format(&Rfc3339)?,
            scan_id: event.scan_id(),
            device_count: event.device_count(),
            devices: event
                .observations()
                .iter()
                .map(|observation| DeviceRecord {
                    mac_hash: observation.identity_token,
                    rssi: observation.signal_strength,
                    protocol: observation.protocol,
                })
                .collect(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(true)
    }

    /// Load every scan within `range`, oldest first. Malformed lines are logged and skipped.
    pub fn load(&self, range: TimeRange) -> Result<Vec<ScanEvent>, IngestError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "Scan log directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_scan_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX));
            if is_scan_file {
                files.push(path);
            }
        }
        files.sort();

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for path in &files {
            let reader = BufReader::new(fs::File::open(path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match parse_record(&line) {
                    Ok(event) if range.contains(event.timestamp()) => events.push(event),
                    Ok(_) => {}
                    Err(err) => {
                        skipped += 1;
                        warn!(
                            file = %path.display(),
                            line = index + 1,
                            error = %err,
                            "Skipping malformed scan record"
                        );
                    }
                }
            }
        }

        events.sort_by_key(|event| (event.timestamp(), event.scan_id()));
        info!(
            files = files.len(),
            records = events.len(),
            skipped,
            "Loaded scan records"
        );
        Ok(events)
    }
}

fn parse_record(line: &str) -> Result<ScanEvent, RecordError> {
    let record: ScanRecord = serde_json::from_str(line)?;
    let timestamp = parse_timestamp(&record.timestamp).map_err(|source| RecordError::Timestamp {
        value: record.timestamp.clone(),
        source,
    })?;
    let observations = record.devices.into_iter().map(|device| DeviceObservation {
        identity_token: device.mac_hash,
        signal_strength: device.rssi,
        protocol: device.protocol,
    });
    Ok(ScanEvent::new(timestamp, record.scan_id, observations))
}

fn day_file_name(timestamp: OffsetDateTime) -> String {
    let date = timestamp.date();
    format!(
        "{FILE_PREFIX}{:04}{:02}{:02}{FILE_SUFFIX}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
