mod common;

use pedestrian_flow::aggregate::WindowAggregator;
use pedestrian_flow::features::{self, FeatureBuilder, VALUE_COLUMN};
use pedestrian_flow::forecast::{self, Forecaster};
use pedestrian_flow::identity::{IdentityHasher, Salt};
use pedestrian_flow::scan::collect::Collector;
use pedestrian_flow::scan::record::{ScanLog, TimeRange};
use pedestrian_flow::scan::synthetic::SyntheticSource;
use std::fs;
use time::Duration;
use time::macros::datetime;

#[test]
fn two_days_of_diurnal_traffic_forecast_the_morning_peak() -> Result<(), Box<dyn std::error::Error>>
{
    let root = common::temp_root("diurnal");
    let config = common::test_config(&root)?;
    // Monday and Tuesday, so every hour carries the weekday profile.
    let start = datetime!(2025-03-03 00:00 UTC);
    let end = start + Duration::hours(48);

    let source = SyntheticSource::new(3).with_noise(0.05);
    let log = ScanLog::new(root.join("raw"), true);
    let mut collector =
        Collector::new(source, IdentityHasher::new(Salt::generate()), &config).with_log(log.clone());
    let scans = collector.run_between(start, end, Duration::seconds(36))?;
    assert_eq!(scans, 4800);

    let events = log.load(TimeRange::default())?;
    let windows = WindowAggregator::from_config(&config).aggregate(&events);
    assert_eq!(windows.len(), 48);

    let builder = FeatureBuilder::from_config(&config)?;
    let mut table = features::finalize(builder.build(&windows)?);
    assert!(table.len() >= 44, "only {} complete windows", table.len());

    builder.make_target(&mut table, config.models.forecasting.forecast_horizon)?;
    let (inputs, target) = features::split_target(&table)?;
    let trained = forecast::train(&inputs, &target, &config)?;
    assert!(trained.metrics.is_some());

    let seven = datetime!(2025-03-04 07:00 UTC);
    let row = inputs
        .timestamps
        .iter()
        .position(|ts| *ts == seven)
        .ok_or("no 07:00 row on the second day")?;
    let forecast = trained.model.predict(&inputs.slice(row..row + 1))?;
    let actual = target[row];
    let relative_error = (forecast[0] - actual).abs() / actual;

    assert!(actual > 20.0, "08:00 volume was {actual}");
    assert!(
        relative_error < 0.25,
        "forecast {} vs actual {actual}",
        forecast[0]
    );
    assert_eq!(inputs.columns[0], VALUE_COLUMN);
    let _ = fs::remove_dir_all(root);
    Ok(())
}
