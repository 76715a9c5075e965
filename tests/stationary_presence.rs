mod common;

use pedestrian_flow::aggregate::WindowAggregator;
use pedestrian_flow::identity::{IdentityHasher, SALT_LEN, Salt};
use pedestrian_flow::scan::collect::Collector;
use pedestrian_flow::scan::presence::PresencePhase;
use pedestrian_flow::scan::record::{ScanLog, TimeRange};
use pedestrian_flow::scan::{Protocol, RawSighting, ScanSource, ScanSourceError};
use std::fs;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const PARKED: &str = "AA:BB:CC:00:00:01";
const THRESHOLD_SECS: u64 = 3540;

/// Three fresh passers-by every scan, plus one parked device for a while.
struct Street {
    parked_until: OffsetDateTime,
    next: u32,
}

impl ScanSource for Street {
    fn scan(
        &mut self,
        at: OffsetDateTime,
        _duration: std::time::Duration,
    ) -> Result<Vec<RawSighting>, ScanSourceError> {
        let mut sightings: Vec<RawSighting> = (0..3)
            .map(|_| {
                self.next += 1;
                RawSighting {
                    address: format!("02:00:00:00:{:02X}:{:02X}", self.next / 256, self.next % 256),
                    rssi: Some(-60),
                    protocol: Protocol::Ble,
                }
            })
            .collect();
        if at < self.parked_until {
            sightings.push(RawSighting {
                address: PARKED.to_string(),
                rssi: Some(-50),
                protocol: Protocol::Classic,
            });
        }
        Ok(sightings)
    }
}

#[test]
fn parked_device_counts_until_it_turns_stationary() -> Result<(), Box<dyn std::error::Error>> {
    let root = common::temp_root("stationary");
    let mut config = common::test_config(&root)?;
    config.scanner.stationary_threshold_secs = THRESHOLD_SECS;
    config.scanner.device_timeout_secs = 7200;
    let start = datetime!(2025-03-03 00:00 UTC);
    let parked_for = Duration::seconds(3 * THRESHOLD_SECS as i64);

    let hasher = IdentityHasher::new(Salt::from_bytes([9; SALT_LEN]));
    let parked = hasher.hash(PARKED);
    let log = ScanLog::new(root.join("raw"), true);
    let street = Street {
        parked_until: start + parked_for,
        next: 0,
    };
    let mut collector = Collector::new(street, hasher, &config).with_log(log.clone());
    collector.run_between(start, start + Duration::hours(4), Duration::minutes(1))?;

    assert_eq!(
        collector.tracker().phase(&parked, start + parked_for),
        PresencePhase::Stationary
    );

    let events = log.load(TimeRange::default())?;
    let transition = start + Duration::seconds(THRESHOLD_SECS as i64);
    for event in &events {
        let seen = event
            .observations()
            .iter()
            .any(|observation| observation.identity_token == parked);
        assert_eq!(
            seen,
            event.timestamp() <= transition,
            "parked device at {}",
            event.timestamp()
        );
    }

    // The threshold ends on the last scan of the first hour, so windows split cleanly.
    let windows = WindowAggregator::from_config(&config).aggregate(&events);
    let averages: Vec<f64> = windows.iter().map(|window| window.avg_devices).collect();
    assert_eq!(averages, vec![4.0, 3.0, 3.0, 3.0]);
    let _ = fs::remove_dir_all(root);
    Ok(())
}
