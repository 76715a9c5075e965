//! Transient/stationary presence tracking.
//!
//! Each identity token moves through `New -> Transient -> Stationary` while it
//! keeps being observed, and becomes `Expired` once unseen for longer than the
//! device timeout. Expired entries are evicted by [`PresenceTracker::sweep`];
//! a token that reappears after expiry starts over as new.

use crate::config::Config;
use crate::identity::IdentityToken;
use crate::scan::ScanEvent;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Transient,
    Stationary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    New,
    Transient,
    Stationary,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceState {
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub is_stationary: bool,
}

#[derive(Debug)]
pub struct PresenceTracker {
    states: HashMap<IdentityToken, PresenceState>,
    stationary_threshold: Duration,
    device_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(stationary_threshold: Duration, device_timeout: Duration) -> Self {
        Self {
            states: HashMap::new(),
            stationary_threshold,
            device_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::seconds(config.scanner.stationary_threshold_secs as i64),
            Duration::seconds(config.scanner.device_timeout_secs as i64),
        )
    }

    /// Classify one observation of `token` at `now`, updating its state.
    pub fn classify(&mut self, token: IdentityToken, now: OffsetDateTime) -> Presence {
        let device_timeout = self.device_timeout;
        match self.states.get_mut(&token) {
            Some(state) if now - state.last_seen <= device_timeout => {
                state.last_seen = state.last_seen.max(now);
                if now - state.first_seen <= self.stationary_threshold {
                    return Presence::Transient;
                }
                if !state.is_stationary {
                    info!(device = %token.short(), "Device marked as stationary");
                    state.is_stationary = true;
                }
                Presence::Stationary
            }
            _ => {
                self.states.insert(
                    token,
                    PresenceState {
                        first_seen: now,
                        last_seen: now,
                        is_stationary: false,
                    },
                );
                Presence::Transient
            }
        }
    }

    /// Drop every token unseen for longer than the device timeout.
    pub fn sweep(&mut self, now: OffsetDateTime) -> usize {
        let before = self.states.len();
        let device_timeout = self.device_timeout;
        self.states
            .retain(|_, state| now - state.last_seen <= device_timeout);
        before - self.states.len()
    }

    /// Classify every observation in `event`, keep only transient ones, then sweep.
    pub fn filter_scan(&mut self, event: ScanEvent) -> ScanEvent {
        let now = event.timestamp();
        let detected = event.device_count();
        let transient = event.retain(|observation| {
            self.classify(observation.identity_token, now) == Presence::Transient
        });
        let evicted = self.sweep(now);
        debug!(
            transient = transient.device_count(),
            detected,
            evicted,
            tracked = self.states.len(),
            "Presence filter applied"
        );
        transient
    }

    pub fn phase(&self, token: &IdentityToken, now: OffsetDateTime) -> PresencePhase {
        match self.states.get(token) {
            None => PresencePhase::New,
            Some(state) if now - state.last_seen > self.device_timeout => PresencePhase::Expired,
            Some(state) if state.is_stationary => PresencePhase::Stationary,
            Some(_) => PresencePhase::Transient,
        }
    }

    pub fn state(&self, token: &IdentityToken) -> Option<&PresenceState> {
        self.states.get(token)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
