//! Radio stand-in producing a metro-station style traffic profile.

use crate::scan::{Protocol, RawSighting, ScanSource, ScanSourceError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use time::{OffsetDateTime, Weekday};

/// Typical devices per scan for an hour of day.
pub fn hourly_base(hour: u8) -> f64 {
    match hour {
        0..5 => 2.0,
        5..7 => 5.0,
        7..9 => 25.0,
        9..11 => 12.0,
        11..13 => 15.0,
        13..16 => 10.0,
        16..19 => 28.0,
        19..22 => 12.0,
        _ => 5.0,
    }
}

pub fn weekday_multiplier(weekday: Weekday) -> f64 {
    match weekday {
        Weekday::Saturday => 0.7,
        Weekday::Sunday => 0.5,
        _ => 1.0,
    }
}

pub fn expected_volume(at: OffsetDateTime) -> f64 {
    hourly_base(at.hour()) * weekday_multiplier(at.weekday())
}

/// Every scan reports fresh passers-by drawn around [`expected_volume`],
/// plus a fixed set of fixture devices that never leave.
pub struct SyntheticSource {
    rng: StdRng,
    noise_std: f64,
    fixtures: Vec<String>,
    next_device: u64,
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            noise_std: 0.2,
            fixtures: Vec::new(),
            next_device: 0,
        }
    }

    pub fn with_noise(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std.max(0.0);
        self
    }

    pub fn with_fixtures(mut self, count: usize) -> Self {
        self.fixtures = (0..count)
            .map(|index| format!("F1:0E:D0:00:{:02X}:{:02X}", index / 256, index % 256))
            .collect();
        self
    }

    fn standard_normal(&mut self) -> f64 {
        // Box-Muller
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn passer_by(&mut self) -> RawSighting {
        let id = self.next_device;
        self.next_device += 1;
        let bytes = id.to_be_bytes();
        RawSighting {
            address: format!(
                "02:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]
            ),
            rssi: Some(self.rng.gen_range(-80..-40)),
            protocol: if self.rng.gen_bool(0.5) {
                Protocol::Classic
            } else {
                Protocol::Ble
            },
        }
    }
}

impl ScanSource for SyntheticSource {
    fn scan(
        &mut self,
        at: OffsetDateTime,
        _duration: Duration,
    ) -> Result<Vec<RawSighting>, ScanSourceError> {
        let noise = self.noise_std * self.standard_normal();
        let count = (expected_volume(at) * (1.0 + noise)).max(0.0) as usize;

        let mut sightings: Vec<RawSighting> = (0..count).map(|_| self.passer_by()).collect();
        sightings.extend(self.fixtures.iter().map(|address| RawSighting {
            address: address.clone(),
            rssi: Some(-55),
            protocol: Protocol::Ble,
        }));
        Ok(sightings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use time::macros::datetime;

    #[test]
    fn profile_peaks_at_rush_hours() {
        let monday = datetime!(2025-03-03 00:00 UTC);

        assert_eq!(expected_volume(monday + time::Duration::hours(3)), 2.0);
        assert_eq!(expected_volume(monday + time::Duration::hours(8)), 25.0);
        assert_eq!(expected_volume(monday + time::Duration::hours(17)), 28.0);
        assert_eq!(expected_volume(datetime!(2025-03-09 08:00 UTC)), 12.5);
    }

    #[test]
    fn noiseless_scan_matches_profile() -> Result<(), Box<dyn std::error::Error>> {
        let mut source = SyntheticSource::new(1).with_noise(0.0);

        let sightings = source.scan(datetime!(2025-03-03 08:15 UTC), Duration::from_secs(10))?;

        assert_eq!(sightings.len(), 25);
        Ok(())
    }

    #[test]
    fn passers_by_are_fresh_and_fixtures_repeat() -> Result<(), Box<dyn std::error::Error>> {
        let mut source = SyntheticSource::new(7).with_noise(0.0).with_fixtures(2);
        let at = datetime!(2025-03-03 03:00 UTC);

        let first = source.scan(at, Duration::from_secs(10))?;
        let second = source.scan(at, Duration::from_secs(10))?;

        let first: HashSet<String> = first.into_iter().map(|s| s.address).collect();
        let second: HashSet<String> = second.into_iter().map(|s| s.address).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first.intersection(&second).count(), 2);
        Ok(())
    }

    #[test]
    fn same_seed_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let at = datetime!(2025-03-03 12:00 UTC);
        let counts = |seed| -> Result<Vec<usize>, ScanSourceError> {
            let mut source = SyntheticSource::new(seed);
            (0..5)
                .map(|_| source.scan(at, Duration::from_secs(10)).map(|s| s.len()))
                .collect()
        };

        assert_eq!(counts(11)?, counts(11)?);
        Ok(())
    }
}
