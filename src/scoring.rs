//! Periodic and on-demand scoring of the processed dataset.
//!
//! Every refresh, scheduled or requested, goes through [`ScoringService::refresh`],
//! which admits one cycle at a time. A caller that arrives while a cycle is
//! running waits for it and receives its outcome instead of starting another.

use crate::cluster::{ClassifierError, PatternClassifier, level_name};
use crate::config::{Config, RetrySection};
use crate::dataset::{DatasetError, DatasetStore};
use crate::features::{FeatureTable, VALUE_COLUMN};
use crate::forecast::{self, ForecastError, Forecaster};
use crate::state::{AppState, ModelStatus, PredictionSnapshot, RefreshPhase};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefreshError {
    #[error("dataset storage failed: {0}")]
    Storage(String),
    #[error("no data available: {0}")]
    NoData(String),
    #[error("feature extraction failed: {0}")]
    Features(String),
    #[error("forecast failed: {0}")]
    Forecast(String),
    #[error("scoring service is shutting down")]
    ShuttingDown,
}

impl From<ForecastError> for RefreshError {
    fn from(err: ForecastError) -> Self {
        RefreshError::Forecast(err.to_string())
    }
}

type Outcome = Result<Arc<PredictionSnapshot>, RefreshError>;

/// Returns the phase to idle when a cycle is dropped before it finishes.
struct PhaseReset<'a>(&'a AppState);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        if self.0.phase() != RefreshPhase::Idle {
            self.0.set_phase(RefreshPhase::Idle);
        }
    }
}

/// Backoff before retry number `attempt` (1-based).
fn backoff_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    base_delay_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

pub struct ScoringService {
    state: Arc<AppState>,
    store: DatasetStore,
    classifier: Option<Arc<PatternClassifier>>,
    forecaster: Option<Arc<dyn Forecaster>>,
    window: time::Duration,
    retry: RetrySection,
    cycle: Mutex<Option<Outcome>>,
    /// Count of completed cycles; only written while `cycle` is held.
    completed: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl ScoringService {
    pub fn new(
        state: Arc<AppState>,
        store: DatasetStore,
        classifier: Option<PatternClassifier>,
        forecaster: Option<Box<dyn Forecaster>>,
        window: time::Duration,
        retry: RetrySection,
    ) -> Self {
        state.set_models(ModelStatus {
            clustering: classifier.is_some(),
            forecasting: forecaster.is_some(),
        });
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            state,
            store,
            classifier: classifier.map(Arc::new),
            forecaster: forecaster.map(Arc::from),
            window,
            retry,
            cycle: Mutex::new(None),
            completed: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Load both artifacts once. A missing or unreadable artifact leaves that model out.
    pub fn from_config(config: &Config, state: Arc<AppState>) -> Self {
        let classifier = match PatternClassifier::load(config.clustering_model_path()) {
            Ok(classifier) => Some(classifier),
            Err(ClassifierError::Unavailable(path)) => {
                warn!(path = %path.display(), "Clustering model not found");
                None
            }
            Err(err) => {
                warn!(error = %err, "Clustering model could not be loaded");
                None
            }
        };
        let forecaster = match forecast::load_forecaster(config.forecaster_model_path()) {
            Ok(forecaster) => Some(forecaster),
            Err(ForecastError::Unavailable(path)) => {
                warn!(path = %path.display(), "Forecasting model not found");
                None
            }
            Err(err) => {
                warn!(error = %err, "Forecasting model could not be loaded");
                None
            }
        };
        info!(
            clustering = classifier.is_some(),
            forecasting = forecaster.is_some(),
            "Models loaded"
        );
        Self::new(
            state,
            DatasetStore::new(config.storage.processed_data_dir.clone()),
            classifier,
            forecaster,
            time::Duration::hours(i64::from(config.aggregation.window_size_hours)),
            config.retry.clone(),
        )
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run one cycle, or join the one already in flight.
    pub async fn refresh(&self) -> Outcome {
        if *self.shutdown_tx.borrow() {
            return Err(RefreshError::ShuttingDown);
        }
        let seen = self.completed.load(Ordering::Acquire);
        let mut last = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let last = self.cycle.lock().await;
                // A cycle dropped mid-flight completes nothing, so only a moved count is joined.
                let completed = self.completed.load(Ordering::Acquire);
                if let Some(outcome) = last.as_ref().filter(|_| completed != seen) {
                    debug!(generation = completed, "Joined in-flight refresh");
                    return outcome.clone();
                }
                last
            }
        };

        let generation = self.completed.load(Ordering::Acquire) + 1;
        let outcome = self.run_cycle().await;
        match &outcome {
            Ok(snapshot) => info!(
                generation,
                current = snapshot.current_value,
                forecast = ?snapshot.forecast_value,
                cluster = ?snapshot.cluster_name,
                "Published prediction snapshot"
            ),
            Err(err) => warn!(generation, error = %err, "Refresh cycle failed"),
        }
        *last = Some(outcome.clone());
        self.completed.store(generation, Ordering::Release);
        outcome
    }

    async fn run_cycle(&self) -> Outcome {
        let _reset = PhaseReset(self.state.as_ref());
        self.state.set_phase(RefreshPhase::LoadingData);
        let table = match self.load_with_retry().await {
            Ok(table) => Arc::new(table),
            Err(err) => return self.fail(err),
        };

        self.state.set_phase(RefreshPhase::Scoring);
        let classifier = self.classifier.clone();
        let forecaster = self.forecaster.clone();
        let window = self.window;
        let scored_table = Arc::clone(&table);
        let scored = tokio::task::spawn_blocking(move || {
            score(
                &scored_table,
                classifier.as_deref(),
                forecaster.as_deref(),
                window,
                OffsetDateTime::now_utc(),
            )
        })
        .await
        .unwrap_or_else(|err| Err(RefreshError::Features(format!("scoring task failed: {err}"))));
        let snapshot = match scored {
            Ok(snapshot) => snapshot,
            Err(err) => return self.fail(err),
        };

        self.state.set_phase(RefreshPhase::Publishing);
        let published = self.state.publish(snapshot, table);
        self.state.set_phase(RefreshPhase::Idle);
        Ok(published)
    }

    fn fail(&self, err: RefreshError) -> Outcome {
        self.state.set_phase(RefreshPhase::Failed);
        self.state.set_phase(RefreshPhase::Idle);
        Err(err)
    }

    /// Transient storage errors are retried with exponential backoff.
    async fn load_with_retry(&self) -> Result<FeatureTable, RefreshError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let store = self.store.clone();
            let loaded = tokio::task::spawn_blocking(move || store.load())
                .await
                .map_err(|err| RefreshError::Storage(format!("load task failed: {err}")))?;
            match loaded {
                Ok(table) => return Ok(table),
                Err(DatasetError::Missing(path)) => {
                    return Err(RefreshError::NoData(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = backoff_delay_ms(self.retry.base_delay_ms, attempt);
                    warn!(attempt, delay_ms = delay, error = %err, "Dataset load failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(RefreshError::Storage(err.to_string())),
            }
        }
    }

    /// Refresh every `interval` until [`ScoringService::shutdown`] is called.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                // Failures are logged inside refresh; the next tick retries.
                let _ = self.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            info!("Periodic scoring stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Score the newest row of `table`.
///
/// A forecaster error fails the cycle. A classifier error only drops the
/// cluster fields.
pub fn score(
    table: &FeatureTable,
    classifier: Option<&PatternClassifier>,
    forecaster: Option<&dyn Forecaster>,
    window: time::Duration,
    now: OffsetDateTime,
) -> Result<PredictionSnapshot, RefreshError> {
    let latest = table
        .last()
        .ok_or_else(|| RefreshError::NoData("processed dataset is empty".to_string()))?;
    let value_index = table
        .column_index(VALUE_COLUMN)
        .map_err(|err| RefreshError::Features(err.to_string()))?;
    let current_value = latest.values[value_index].ok_or_else(|| {
        RefreshError::Features(format!("{VALUE_COLUMN} is null in the newest row"))
    })?;
    let matrix = table
        .to_matrix(&[])
        .map_err(|err| RefreshError::Features(err.to_string()))?;

    let (forecast_value, forecast_time) = match forecaster {
        Some(model) => {
            let recent = matrix.tail(model.min_rows());
            let forecast = model
                .predict(&recent)?
                .last()
                .copied()
                .ok_or(ForecastError::InsufficientHistory {
                    required: model.min_rows(),
                    available: recent.len(),
                })?;
            let forecast_time = i32::try_from(model.horizon())
                .ok()
                .and_then(|horizon| window.checked_mul(horizon))
                .and_then(|ahead| latest.timestamp.checked_add(ahead));
            (Some(forecast), forecast_time)
        }
        None => (None, None),
    };

    let cluster = classifier.and_then(|model| {
        match model.predict(&matrix.tail(1)) {
            Ok(predictions) => predictions
                .into_iter()
                .next()
                .map(|prediction| (prediction, model.levels())),
            Err(err) => {
                warn!(error = %err, "Classifier skipped for this cycle");
                None
            }
        }
    });
    let (cluster_label, cluster_name, cluster_probabilities) = match cluster {
        Some((prediction, levels)) => (
            Some(prediction.label),
            Some(level_name(prediction.label, levels)),
            Some(prediction.probabilities),
        ),
        None => (None, None, None),
    };

    Ok(PredictionSnapshot {
        as_of: latest.timestamp,
        generated_at: now,
        current_value,
        forecast_value,
        forecast_time,
        cluster_label,
        cluster_name,
        cluster_probabilities,
    })
}
