//! Fixed-width window aggregation of scan events.
//!
//! Windows are aligned to the Unix epoch, so re-aggregating overlapping input
//! always lands on the same boundaries. Windows with fewer scans than the
//! configured minimum are dropped whole, and missing windows are never
//! zero-filled.

use crate::config::Config;
use crate::scan::ScanEvent;
use crate::stats;
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedWindow {
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub avg_devices: f64,
    /// Absent for a single-scan window.
    pub std_devices: Option<f64>,
    pub min_devices: f64,
    pub max_devices: f64,
    pub total_devices: f64,
    pub num_scans: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowAggregator {
    width: Duration,
    min_scans: usize,
}

impl WindowAggregator {
    pub fn new(window_size_hours: u32, min_scans: usize) -> Self {
        Self {
            width: Duration::hours(i64::from(window_size_hours.max(1))),
            min_scans: min_scans.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.aggregation.window_size_hours,
            config.aggregation.min_scans_per_window,
        )
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    /// Start of the epoch-aligned window containing `timestamp`.
    pub fn window_start(&self, timestamp: OffsetDateTime) -> OffsetDateTime {
        let width = self.width.whole_seconds();
        let offset = timestamp.unix_timestamp().rem_euclid(width);
        timestamp
            - Duration::seconds(offset)
            - Duration::nanoseconds(i64::from(timestamp.nanosecond()))
    }

    pub fn aggregate(&self, events: &[ScanEvent]) -> Vec<AggregatedWindow> {
        let mut buckets: BTreeMap<OffsetDateTime, Vec<f64>> = BTreeMap::new();
        for event in events {
            buckets
                .entry(self.window_start(event.timestamp()))
                .or_default()
                .push(event.device_count() as f64);
        }

        let total = buckets.len();
        let windows: Vec<AggregatedWindow> = buckets
            .into_iter()
            .filter_map(|(start, counts)| self.summarize(start, &counts))
            .collect();

        let dropped = total - windows.len();
        if dropped > 0 {
            debug!(
                dropped,
                min_scans = self.min_scans,
                "Dropped windows below the scan minimum"
            );
        }
        info!(scans = events.len(), windows = windows.len(), "Aggregated scans");
        windows
    }

    fn summarize(&self, window_start: OffsetDateTime, counts: &[f64]) -> Option<AggregatedWindow> {
        if counts.len() < self.min_scans {
            return None;
        }
        Some(AggregatedWindow {
            window_start,
            window_end: window_start + self.width,
            avg_devices: stats::mean(counts)?,
            std_devices: stats::sample_std(counts),
            min_devices: stats::min(counts)?,
            max_devices: stats::max(counts)?,
            total_devices: counts.iter().sum(),
            num_scans: counts.len(),
        })
    }
}
