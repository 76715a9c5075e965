mod common;

use pedestrian_flow::aggregate::AggregatedWindow;
use pedestrian_flow::dataset::DatasetStore;
use pedestrian_flow::features::{self, FeatureBuilder, FeatureTable};
use pedestrian_flow::forecast::{self, ForecastError, Forecaster};
use pedestrian_flow::scan::synthetic::expected_volume;
use pedestrian_flow::scoring::{RefreshError, ScoringService};
use pedestrian_flow::state::AppState;
use std::fs;
use std::sync::Arc;
use time::Duration;
use time::macros::datetime;

fn windows(hours: i64) -> Vec<AggregatedWindow> {
    let start = datetime!(2025-03-03 00:00 UTC);
    (0..hours)
        .map(|hour| {
            let window_start = start + Duration::hours(hour);
            let volume = expected_volume(window_start);
            AggregatedWindow {
                window_start,
                window_end: window_start + Duration::hours(1),
                avg_devices: volume,
                std_devices: Some(1.0),
                min_devices: volume - 1.0,
                max_devices: volume + 1.0,
                total_devices: volume * 60.0,
                num_scans: 60,
            }
        })
        .collect()
}

#[tokio::test]
async fn dropped_column_fails_the_cycle_and_keeps_the_snapshot()
-> Result<(), Box<dyn std::error::Error>> {
    let root = common::temp_root("schema");
    let config = common::test_config(&root)?;
    let builder = FeatureBuilder::from_config(&config)?;
    let table = features::finalize(builder.build(&windows(72))?);
    let store = DatasetStore::new(config.storage.processed_data_dir.clone());
    store.save(&table)?;

    let mut targeted = store.load()?;
    builder.make_target(&mut targeted, config.models.forecasting.forecast_horizon)?;
    let (inputs, target) = features::split_target(&targeted)?;
    let trained = forecast::train(&inputs, &target, &config)?;
    forecast::save_forecaster(trained.model.as_ref(), 1, None, config.forecaster_model_path())?;

    let state = Arc::new(AppState::new());
    let scoring = ScoringService::from_config(&config, Arc::clone(&state));
    let published = scoring.refresh().await?;
    assert!(published.forecast_value.is_some());
    assert!(state.models().forecasting);
    assert!(!state.models().clustering);

    let mut degraded: FeatureTable = table.clone();
    degraded.drop_column("month")?;
    store.save(&degraded)?;

    let direct = trained.model.predict(&degraded.to_matrix(&[])?);
    assert!(matches!(
        direct,
        Err(ForecastError::SchemaMismatch { ref expected, ref actual })
            if expected.len() == actual.len() + 1
    ));

    let result = scoring.refresh().await;
    assert!(matches!(result, Err(RefreshError::Forecast(_))));
    let current = state.snapshot().ok_or("snapshot disappeared")?;
    assert!(Arc::ptr_eq(&current, &published));
    let _ = fs::remove_dir_all(root);
    Ok(())
}
