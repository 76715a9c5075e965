use crate::config::Config;
use crate::identity::IdentityHasher;
use crate::scan::presence::PresenceTracker;
use crate::scan::record::{IngestError, ScanLog};
use crate::scan::{
    DeviceObservation, ScanEvent, ScanId, ScanSource, ScanSourceError, passes_signal_threshold,
};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Source(#[from] ScanSourceError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Clone)]
pub struct CollectOutcome {
    /// The transient-only event handed to the scan log.
    pub event: ScanEvent,
    pub detected: usize,
    pub below_threshold: usize,
    pub written: bool,
}

/// Drives one radio through the hasher and presence tracker into the scan log.
pub struct Collector<S> {
    source: S,
    hasher: IdentityHasher,
    tracker: PresenceTracker,
    log: ScanLog,
    rssi_threshold: i16,
    scan_duration: Duration,
    next_scan_id: ScanId,
}

impl<S: ScanSource> Collector<S> {
    pub fn new(source: S, hasher: IdentityHasher, config: &Config) -> Self {
        Self {
            source,
            hasher,
            tracker: PresenceTracker::from_config(config),
            log: ScanLog::new(
                config.storage.raw_data_dir.clone(),
                config.scanner.log_empty_scans,
            ),
            rssi_threshold: config.scanner.rssi_threshold,
            scan_duration: Duration::from_secs(config.scanner.scan_duration_secs),
            next_scan_id: 0,
        }
    }

    pub fn with_log(mut self, log: ScanLog) -> Self {
        self.log = log;
        self
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Run one scan at `at`. Weak sightings are dropped before they are hashed,
    /// so they never start a presence timer.
    pub fn collect_once(&mut self, at: OffsetDateTime) -> Result<CollectOutcome, CollectError> {
        let sightings = self.source.scan(at, self.scan_duration)?;
        let detected = sightings.len();

        let threshold = self.rssi_threshold;
        let hasher = &self.hasher;
        let observations: Vec<DeviceObservation> = sightings
            .into_iter()
            .filter(|sighting| passes_signal_threshold(sighting.rssi, threshold))
            .map(|sighting| DeviceObservation {
                identity_token: hasher.hash(&sighting.address),
                signal_strength: sighting.rssi,
                protocol: sighting.protocol,
            })
            .collect();
        let below_threshold = detected - observations.len();

        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;
        let event = self
            .tracker
            .filter_scan(ScanEvent::new(at, scan_id, observations));
        let written = self.log.append(&event)?;

        debug!(
            scan_id,
            detected,
            below_threshold,
            transient = event.device_count(),
            "Scan collected"
        );
        Ok(CollectOutcome {
            event,
            detected,
            below_threshold,
            written,
        })
    }

    /// Scan every `interval` over `[start, end)`, returning the number of scans taken.
    pub fn run_between(
        &mut self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        interval: time::Duration,
    ) -> Result<usize, CollectError> {
        if !interval.is_positive() {
            return Ok(0);
        }
        let mut at = start;
        let mut scans = 0;
        while at < end {
            self.collect_once(at)?;
            scans += 1;
            at += interval;
        }
        Ok(scans)
    }
}
