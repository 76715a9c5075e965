use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_HISTORY_HOURS: u32 = 48;
pub const MAX_WINDOW_HOURS: u32 = 24 * 7;
/// Longest lag, rolling span or horizon, counted in windows.
pub const MAX_PERIODS: u32 = 24 * 366;
pub const MAX_RETRY_ATTEMPTS: u32 = 16;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    pub scanner: ScannerSection,
    pub storage: StorageSection,
    pub aggregation: AggregationSection,
    pub features: FeaturesSection,
    pub models: ModelsSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerSection {
    pub scan_interval_secs: u64,
    pub scan_duration_secs: u64,
    /// Observations weaker than this (dBm) are dropped before presence tracking.
    pub rssi_threshold: i16,
    /// Continuous presence beyond this many seconds marks a device stationary.
    pub stationary_threshold_secs: u64,
    /// Devices unseen for this many seconds are forgotten.
    pub device_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub log_empty_scans: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    pub raw_data_dir: PathBuf,
    pub processed_data_dir: PathBuf,
    pub models_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationSection {
    pub window_size_hours: u32,
    pub min_scans_per_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeaturesSection {
    pub lag_periods: Vec<u32>,
    pub rolling_windows: Vec<u32>,
    pub rolling_stats: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsSection {
    pub clustering: ClusteringSection,
    pub forecasting: ForecastingSection,
    #[serde(default)]
    pub boosted: BoostedSection,
    #[serde(default)]
    pub lookback: LookbackSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringSection {
    pub n_components: usize,
    pub max_iter: usize,
    pub tolerance: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastingSection {
    /// `boosted` or `lookback`
    pub kind: String,
    /// Forecast horizon in window units.
    pub forecast_horizon: u32,
    pub test_fraction: f64,
    pub validation_fraction: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoostedSection {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub min_samples_leaf: usize,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

impl Default for BoostedSection {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_depth: 4,
            learning_rate: 0.1,
            subsample: 0.8,
            min_samples_leaf: 1,
            early_stopping_rounds: 20,
            seed: 42,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LookbackSection {
    pub lookback_window: usize,
    pub ridge_lambda: f64,
}

impl Default for LookbackSection {
    fn default() -> Self {
        Self {
            lookback_window: 6,
            ridge_lambda: 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
    /// Seconds between scheduled scoring refreshes (default: 300)
    pub refresh_interval_secs: Option<u64>,
    /// Window of `/api/history` when no `hours` query is given (default: 48)
    pub history_default_hours: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub const ROLLING_STATS: [&str; 4] = ["mean", "std", "min", "max"];

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

/// Read, parse and validate a config file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.scanner.device_timeout_secs < self.scanner.stationary_threshold_secs {
            return invalid("scanner.device_timeout_secs must be >= stationary_threshold_secs");
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.aggregation.window_size_hours) {
            return invalid("aggregation.window_size_hours must be in 1..=168");
        }
        if self.aggregation.min_scans_per_window == 0 {
            return invalid("aggregation.min_scans_per_window must be positive");
        }
        let in_periods = |periods: &[u32]| {
            !periods.is_empty() && periods.iter().all(|p| (1..=MAX_PERIODS).contains(p))
        };
        if !in_periods(&self.features.lag_periods) {
            return invalid("features.lag_periods must be non-empty and in 1..=8784");
        }
        if !in_periods(&self.features.rolling_windows) {
            return invalid("features.rolling_windows must be non-empty and in 1..=8784");
        }
        if let Some(stat) = self
            .features
            .rolling_stats
            .iter()
            .find(|stat| !ROLLING_STATS.contains(&stat.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "features.rolling_stats: unknown statistic {stat:?}"
            )));
        }
        if self.models.clustering.n_components < 2 {
            return invalid("models.clustering.n_components must be at least 2");
        }
        let forecasting = &self.models.forecasting;
        if !(1..=MAX_PERIODS).contains(&forecasting.forecast_horizon) {
            return invalid("models.forecasting.forecast_horizon must be in 1..=8784");
        }
        for fraction in [forecasting.test_fraction, forecasting.validation_fraction] {
            if !(fraction > 0.0 && fraction <= 0.5) {
                return invalid("models.forecasting fractions must be in (0, 0.5]");
            }
        }
        if !matches!(forecasting.kind.as_str(), "boosted" | "lookback") {
            return Err(ConfigError::Invalid(format!(
                "models.forecasting.kind: unknown forecaster {:?}",
                forecasting.kind
            )));
        }
        if self.models.lookback.lookback_window == 0 {
            return invalid("models.lookback.lookback_window must be positive");
        }
        if self.refresh_interval().is_zero() {
            return invalid("server.refresh_interval_secs must be positive");
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.retry.attempts) {
            return invalid("retry.attempts must be in 1..=16");
        }
        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        self.logging.level.parse().unwrap_or(tracing::Level::INFO)
    }

    pub fn stationary_threshold(&self) -> Duration {
        Duration::from_secs(self.scanner.stationary_threshold_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.scanner.device_timeout_secs)
    }

    pub fn clustering_model_path(&self) -> PathBuf {
        self.storage.models_dir.join("clustering_model.json")
    }

    pub fn forecaster_model_path(&self) -> PathBuf {
        self.storage.models_dir.join("forecaster.json")
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Returns the refresh interval as Duration (default: 300 seconds)
    pub fn refresh_interval(&self) -> Duration {
        let secs = self
            .server
            .as_ref()
            .and_then(|s| s.refresh_interval_secs)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
        Duration::from_secs(secs)
    }

    pub fn history_default_hours(&self) -> u32 {
        self.server
            .as_ref()
            .and_then(|s| s.history_default_hours)
            .unwrap_or(DEFAULT_HISTORY_HOURS)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub(crate) const MINIMAL_CONFIG: &str = r#"
[app]
name = "pedestrian-flow"

[logging]
level = "info"

[scanner]
scan_interval_secs = 30
scan_duration_secs = 10
rssi_threshold = -90
stationary_threshold_secs = 1800
device_timeout_secs = 3600

[storage]
raw_data_dir = "data/raw"
processed_data_dir = "data/processed"
models_dir = "data/models"

[aggregation]
window_size_hours = 1
min_scans_per_window = 5

[features]
lag_periods = [1, 2, 3]
rolling_windows = [3, 6]
rolling_stats = ["mean", "std", "min", "max"]

[models.clustering]
n_components = 3
max_iter = 200
tolerance = 1e-4

[models.forecasting]
kind = "boosted"
forecast_horizon = 4
test_fraction = 0.2
validation_fraction = 0.2
"#;

    fn write_temp(
        label: &str,
        contents: &str,
    ) -> Result<std::path::PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let path = std::env::temp_dir().join(format!("pflow-config-{label}-{unique}.toml"));
        fs::write(&path, contents)?;
        Ok(path)
    }

    #[test]
    fn default_config_is_valid() -> Result<(), Box<dyn std::error::Error>> {
        let config = load_default()?;
        assert_eq!(config.models.clustering.n_components, 3);
        Ok(())
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("minimal", MINIMAL_CONFIG)?;

        let config = load_from_path(&path)?;
        let _ = fs::remove_file(&path);

        assert_eq!(config.server_port(), DEFAULT_SERVER_PORT);
        assert_eq!(
            config.refresh_interval(),
            Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)
        );
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.models.boosted.n_estimators, 200);
        assert!(config.scanner.log_empty_scans);
        Ok(())
    }

    #[test]
    fn unknown_rolling_stat_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let contents = MINIMAL_CONFIG.replace(r#""min", "max"]"#, r#""min", "median"]"#);
        let path = write_temp("bad-stat", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("median")));
        Ok(())
    }

    #[test]
    fn timeout_shorter_than_threshold_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let contents =
            MINIMAL_CONFIG.replace("device_timeout_secs = 3600", "device_timeout_secs = 60");
        let path = write_temp("bad-timeout", &contents)?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn oversized_periods_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let base: Config = toml::from_str(MINIMAL_CONFIG)?;

        let mut lags = base.clone();
        lags.features.lag_periods = vec![1, u32::MAX];
        let mut horizon = base.clone();
        horizon.models.forecasting.forecast_horizon = 3_000_000_000;
        let mut window = base.clone();
        window.aggregation.window_size_hours = 10_000;
        let mut retries = base.clone();
        retries.retry.attempts = 100;

        for config in [lags, horizon, window, retries] {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
        assert!(base.validate().is_ok());
        Ok(())
    }

    #[test]
    fn missing_config_file_returns_read_error() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("pflow-config-missing-{unique}.toml"));

        let result = load_from_path(&path);

        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn invalid_toml_returns_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let path = write_temp("invalid", "not = [valid")?;

        let result = load_from_path(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        Ok(())
    }
}
