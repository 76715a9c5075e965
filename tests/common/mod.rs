use pedestrian_flow::config::Config;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const TEST_CONFIG: &str = r#"
[app]
name = "pedestrian-flow-test"

[logging]
level = "warn"

[scanner]
scan_interval_secs = 36
scan_duration_secs = 10
rssi_threshold = -90
stationary_threshold_secs = 1800
device_timeout_secs = 3600

[storage]
raw_data_dir = "raw"
processed_data_dir = "processed"
models_dir = "models"

[aggregation]
window_size_hours = 1
min_scans_per_window = 5

[features]
lag_periods = [1, 2, 3]
rolling_windows = [3]
rolling_stats = ["mean", "std", "min", "max"]

[models.clustering]
n_components = 3
max_iter = 200
tolerance = 1e-4

[models.forecasting]
kind = "boosted"
forecast_horizon = 1
test_fraction = 0.1
validation_fraction = 0.1

[models.boosted]
n_estimators = 300
max_depth = 3
learning_rate = 0.1
subsample = 1.0
min_samples_leaf = 1
early_stopping_rounds = 30
seed = 7
"#;

pub fn temp_root(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("pedestrian_flow_{label}_{nanos}"))
}

/// A validated config whose storage lives under `root`.
pub fn test_config(root: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config: Config = toml::from_str(TEST_CONFIG)?;
    config.storage.raw_data_dir = root.join("raw");
    config.storage.processed_data_dir = root.join("processed");
    config.storage.models_dir = root.join("models");
    config.validate()?;
    Ok(config)
}
