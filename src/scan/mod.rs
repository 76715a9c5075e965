use crate::identity::IdentityToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

pub mod collect;
pub mod presence;
pub mod record;
pub mod synthetic;

pub type ScanId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Classic,
    Ble,
    #[serde(other)]
    Unknown,
}

/// One hashed device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObservation {
    pub identity_token: IdentityToken,
    /// RSSI in dBm, absent when the radio could not report it.
    pub signal_strength: Option<i16>,
    pub protocol: Protocol,
}

/// A completed scan. Identity tokens are unique within an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    timestamp: OffsetDateTime,
    scan_id: ScanId,
    observations: Vec<DeviceObservation>,
}

impl ScanEvent {
    /// Build an event, collapsing repeated tokens (e.g. the same device seen
    /// over both classic and BLE) into the observation with the stronger signal.
    pub fn new(
        timestamp: OffsetDateTime,
        scan_id: ScanId,
        observations: impl IntoIterator<Item = DeviceObservation>,
    ) -> Self {
        let mut unique: Vec<DeviceObservation> = Vec::new();
        let mut positions: HashMap<IdentityToken, usize> = HashMap::new();

        for observation in observations {
            match positions.get(&observation.identity_token) {
                Some(&index) => {
                    let kept = &mut unique[index];
                    if is_stronger(observation.signal_strength, kept.signal_strength) {
                        *kept = observation;
                    }
                }
                None => {
                    positions.insert(observation.identity_token, unique.len());
                    unique.push(observation);
                }
            }
        }

        Self {
            timestamp,
            scan_id,
            observations: unique,
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn observations(&self) -> &[DeviceObservation] {
        &self.observations
    }

    pub fn device_count(&self) -> usize {
        self.observations.len()
    }

    /// Keep only the observations matching `keep`.
    pub fn retain(mut self, keep: impl FnMut(&DeviceObservation) -> bool) -> Self {
        self.observations.retain(keep);
        self
    }
}

fn is_stronger(candidate: Option<i16>, current: Option<i16>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Unknown signal strength passes; the radio may not report it for classic inquiries.
pub fn passes_signal_threshold(signal_strength: Option<i16>, threshold: i16) -> bool {
    signal_strength.is_none_or(|rssi| rssi >= threshold)
}

/// A device as reported by the radio, before hashing.
pub struct RawSighting {
    pub address: String,
    pub rssi: Option<i16>,
    pub protocol: Protocol,
}

impl fmt::Debug for RawSighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSighting")
            .field("address", &"<redacted>")
            .field("rssi", &self.rssi)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("scan source error: {0}")]
pub struct ScanSourceError(pub String);

/// The radio that discovers nearby devices.
pub trait ScanSource {
    fn scan(
        &mut self,
        at: OffsetDateTime,
        duration: Duration,
    ) -> Result<Vec<RawSighting>, ScanSourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityHasher, SALT_LEN, Salt};
    use time::macros::datetime;

    fn observation(token: IdentityToken, rssi: Option<i16>, protocol: Protocol) -> DeviceObservation {
        DeviceObservation {
            identity_token: token,
            signal_strength: rssi,
            protocol,
        }
    }

    #[test]
    fn duplicate_tokens_keep_strongest_signal() {
        let hasher = IdentityHasher::new(Salt::from_bytes([0; SALT_LEN]));
        let phone = hasher.hash("phone");
        let watch = hasher.hash("watch");

        let event = ScanEvent::new(
            datetime!(2025-03-03 08:00 UTC),
            1,
            vec![
                observation(phone, Some(-80), Protocol::Classic),
                observation(watch, None, Protocol::Ble),
                observation(phone, Some(-60), Protocol::Ble),
                observation(watch, Some(-70), Protocol::Classic),
                observation(phone, None, Protocol::Classic),
            ],
        );

        assert_eq!(event.device_count(), 2);
        assert_eq!(event.observations()[0].signal_strength, Some(-60));
        assert_eq!(event.observations()[0].protocol, Protocol::Ble);
        assert_eq!(event.observations()[1].signal_strength, Some(-70));
    }

    #[test]
    fn signal_threshold_is_inclusive_and_admits_unknown() {
        assert!(passes_signal_threshold(Some(-90), -90));
        assert!(!passes_signal_threshold(Some(-91), -90));
        assert!(passes_signal_threshold(None, -90));
    }

    #[test]
    fn raw_sighting_debug_hides_address() {
        let sighting = RawSighting {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: Some(-50),
            protocol: Protocol::Classic,
        };

        assert!(!format!("{sighting:?}").contains("AA:BB"));
    }
}
