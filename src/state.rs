use crate::features::FeatureTable;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;

/// The published view of current traffic. Replaced whole, never edited.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSnapshot {
    /// Start of the newest aggregated window.
    pub as_of: OffsetDateTime,
    pub generated_at: OffsetDateTime,
    pub current_value: f64,
    pub forecast_value: Option<f64>,
    pub forecast_time: Option<OffsetDateTime>,
    pub cluster_label: Option<usize>,
    pub cluster_name: Option<String>,
    /// Indexed by ordinal label.
    pub cluster_probabilities: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    LoadingData,
    Scoring,
    Publishing,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub clustering: bool,
    pub forecasting: bool,
}

/// State shared between the scoring task and the HTTP handlers.
///
/// Each value sits behind its own watch channel, so a reader always sees one
/// complete published value.
#[derive(Debug)]
pub struct AppState {
    snapshot_tx: watch::Sender<Option<Arc<PredictionSnapshot>>>,
    dataset_tx: watch::Sender<Option<Arc<FeatureTable>>>,
    phase_tx: watch::Sender<RefreshPhase>,
    models_tx: watch::Sender<ModelStatus>,
}

impl AppState {
    pub fn new() -> Self {
        let (snapshot_tx, _snapshot_rx) = watch::channel(None);
        let (dataset_tx, _dataset_rx) = watch::channel(None);
        let (phase_tx, _phase_rx) = watch::channel(RefreshPhase::Idle);
        let (models_tx, _models_rx) = watch::channel(ModelStatus::default());
        Self {
            snapshot_tx,
            dataset_tx,
            phase_tx,
            models_tx,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<PredictionSnapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Option<Arc<PredictionSnapshot>>> {
        self.snapshot_tx.subscribe()
    }

    pub fn dataset(&self) -> Option<Arc<FeatureTable>> {
        self.dataset_tx.borrow().clone()
    }

    /// Swap in a new snapshot together with the table it was scored from.
    pub fn publish(
        &self,
        snapshot: PredictionSnapshot,
        dataset: Arc<FeatureTable>,
    ) -> Arc<PredictionSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.dataset_tx.send_replace(Some(dataset));
        self.snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase_tx.borrow()
    }

    pub fn set_phase(&self, phase: RefreshPhase) {
        self.phase_tx.send_replace(phase);
    }

    pub fn models(&self) -> ModelStatus {
        *self.models_tx.borrow()
    }

    pub fn set_models(&self, models: ModelStatus) {
        self.models_tx.send_replace(models);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn snapshot(value: f64) -> PredictionSnapshot {
        PredictionSnapshot {
            as_of: datetime!(2025-03-10 08:00 UTC),
            generated_at: datetime!(2025-03-10 08:05 UTC),
            current_value: value,
            forecast_value: None,
            forecast_time: None,
            cluster_label: None,
            cluster_name: None,
            cluster_probabilities: None,
        }
    }

    #[test]
    fn publish_replaces_snapshot_and_notifies() {
        let state = AppState::new();
        let receiver = state.subscribe_snapshot();

        state.publish(snapshot(4.0), Arc::new(FeatureTable::default()));

        assert_eq!(state.snapshot().map(|s| s.current_value), Some(4.0));
        assert!(receiver.has_changed().unwrap_or(false));
        assert!(state.dataset().is_some());
    }

    #[test]
    fn earlier_snapshot_handle_is_untouched_by_publish() {
        let state = AppState::new();
        state.publish(snapshot(1.0), Arc::new(FeatureTable::default()));
        let held = state.snapshot();

        state.publish(snapshot(2.0), Arc::new(FeatureTable::default()));

        assert_eq!(held.map(|s| s.current_value), Some(1.0));
        assert_eq!(state.snapshot().map(|s| s.current_value), Some(2.0));
    }

    #[test]
    fn phase_and_models_start_idle_and_unloaded() {
        let state = AppState::new();

        assert_eq!(state.phase(), RefreshPhase::Idle);
        assert_eq!(state.models(), ModelStatus::default());
    }
}
