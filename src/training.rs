//! Batch pipelines behind the `synthesize`, `process` and `train` commands.

use crate::aggregate::WindowAggregator;
use crate::cluster::{ClusterEvaluation, PatternClassifier};
use crate::config::Config;
use crate::dataset::{DatasetMetadata, DatasetStore};
use crate::error::AppError;
use crate::features::{self, FeatureBuilder, VALUE_COLUMN};
use crate::forecast::{self, ForecastArtifact};
use crate::identity::{IdentityHasher, Salt};
use crate::scan::collect::Collector;
use crate::scan::record::{ScanLog, TimeRange};
use crate::scan::synthetic::SyntheticSource;
use crate::stats;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Drive `days` of synthetic traffic ending at `end` through the collection
/// path into the raw scan log. `fixtures` devices are present in every scan.
/// Returns the number of scans written.
pub fn synthesize(
    config: &Config,
    end: OffsetDateTime,
    days: u32,
    scans_per_hour: u32,
    fixtures: usize,
    seed: u64,
) -> Result<usize, AppError> {
    if scans_per_hour == 0 {
        return Err(AppError::InsufficientData(
            "scans per hour must be positive".to_string(),
        ));
    }
    let start = end
        .checked_sub(Duration::days(i64::from(days)))
        .ok_or_else(|| AppError::InsufficientData(format!("{days} days reach past the calendar")))?;
    let interval = Duration::seconds(3600) / scans_per_hour;
    let source = SyntheticSource::new(seed).with_fixtures(fixtures);
    let mut collector = Collector::new(source, IdentityHasher::new(Salt::generate()), config);
    let scans = collector.run_between(start, end, interval)?;
    info!(scans, days, scans_per_hour, fixtures, "Synthetic scans written");
    Ok(scans)
}

/// Raw scan log to the processed dataset.
pub fn process_raw(config: &Config, range: TimeRange) -> Result<DatasetMetadata, AppError> {
    let log = ScanLog::new(
        config.storage.raw_data_dir.clone(),
        config.scanner.log_empty_scans,
    );
    let events = log.load(range)?;
    if events.is_empty() {
        return Err(AppError::NoScans(log.dir().display().to_string()));
    }
    info!(scans = events.len(), "Loaded scan records");

    let windows = WindowAggregator::from_config(config).aggregate(&events);
    let builder = FeatureBuilder::from_config(config)?;
    let table = features::finalize(builder.build(&windows)?);
    if table.is_empty() {
        return Err(AppError::InsufficientData(format!(
            "{} windows left no complete feature rows",
            windows.len()
        )));
    }

    let metadata = DatasetStore::new(config.storage.processed_data_dir.clone()).save(&table)?;
    let volumes: Vec<f64> = table
        .column(VALUE_COLUMN)?
        .into_iter()
        .flatten()
        .collect();
    info!(
        records = metadata.num_records,
        start = ?metadata.date_range.start,
        end = ?metadata.date_range.end,
        mean = ?stats::mean(&volumes),
        std = ?stats::sample_std(&volumes),
        min = ?stats::min(&volumes),
        max = ?stats::max(&volumes),
        "Dataset statistics"
    );
    Ok(metadata)
}

#[derive(Debug)]
pub struct TrainingReport {
    pub classifier: ClusterEvaluation,
    pub forecaster: ForecastArtifact,
}

/// Fit both models on the processed dataset and save their artifacts.
pub fn train_models(config: &Config) -> Result<TrainingReport, AppError> {
    let store = DatasetStore::new(config.storage.processed_data_dir.clone());
    let table = store.load()?;
    let inputs = table.to_matrix(&[])?;

    let classifier = PatternClassifier::train(&inputs, &config.models.clustering)?;
    let evaluation = classifier.evaluate(&inputs)?;
    classifier.save(config.clustering_model_path())?;

    let builder = FeatureBuilder::from_config(config)?;
    let mut targeted = table;
    builder.make_target(&mut targeted, config.models.forecasting.forecast_horizon)?;
    if targeted.len() < 2 {
        return Err(AppError::InsufficientData(format!(
            "{} rows have a value {} windows ahead",
            targeted.len(),
            config.models.forecasting.forecast_horizon
        )));
    }
    let (features, target) = features::split_target(&targeted)?;
    let trained = forecast::train(&features, &target, config)?;
    let artifact = forecast::save_forecaster(
        trained.model.as_ref(),
        config.aggregation.window_size_hours,
        trained.metrics,
        config.forecaster_model_path(),
    )?;

    Ok(TrainingReport {
        classifier: evaluation,
        forecaster: artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL_CONFIG;
    use crate::identity::IdentityToken;
    use std::collections::HashMap;
    use std::error::Error;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn temp_config() -> Result<Config, Box<dyn Error>> {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let root = std::env::temp_dir().join(format!("pedestrian_flow_training_{nanos}"));
        let mut config: Config = toml::from_str(MINIMAL_CONFIG)?;
        config.storage.raw_data_dir = root.join("raw");
        config.storage.processed_data_dir = root.join("processed");
        config.storage.models_dir = root.join("models");
        Ok(config)
    }

    fn cleanup(config: &Config) {
        if let Some(root) = config.storage.raw_data_dir.parent() {
            let _ = fs::remove_dir_all(root);
        }
    }

    #[test]
    fn empty_scan_log_is_reported() -> Result<(), Box<dyn Error>> {
        let config = temp_config()?;

        let result = process_raw(&config, TimeRange::default());

        assert!(matches!(result, Err(AppError::NoScans(_))));
        Ok(())
    }

    #[test]
    fn synthetic_fixtures_drop_out_once_stationary() -> Result<(), Box<dyn Error>> {
        let config = temp_config()?;
        let end = datetime!(2025-03-10 00:00 UTC);

        synthesize(&config, end, 1, 12, 2, 5)?;
        let events = ScanLog::new(config.storage.raw_data_dir.clone(), true)
            .load(TimeRange::default())?;
        cleanup(&config);

        let mut sightings: HashMap<IdentityToken, usize> = HashMap::new();
        for event in &events {
            for observation in event.observations() {
                *sightings.entry(observation.identity_token).or_default() += 1;
            }
        }
        let fixtures: Vec<&IdentityToken> = sightings
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(token, _)| token)
            .collect();
        assert_eq!(fixtures.len(), 2);
        let last = events.last().ok_or("no scans written")?;
        assert!(
            last.observations()
                .iter()
                .all(|observation| !fixtures.contains(&&observation.identity_token))
        );
        Ok(())
    }

    #[test]
    fn synthesize_process_and_train_produce_artifacts() -> Result<(), Box<dyn Error>> {
        let config = temp_config()?;

        let scans = synthesize(&config, datetime!(2025-03-10 00:00 UTC), 3, 12, 0, 11)?;
        let metadata = process_raw(&config, TimeRange::default())?;
        let report = train_models(&config)?;

        assert_eq!(scans, 3 * 24 * 12);
        assert!(metadata.num_records >= 60);
        assert_eq!(report.classifier.levels.len(), 3);
        assert_eq!(report.forecaster.horizon, 4);
        assert!(config.clustering_model_path().exists());
        assert!(config.forecaster_model_path().exists());
        cleanup(&config);
        Ok(())
    }
}
