use crate::cluster::ClassifierError;
use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::features::FeatureError;
use crate::forecast::ForecastError;
use crate::scan::collect::CollectError;
use crate::scan::record::IngestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Forecast(#[from] ForecastError),
    #[error("no scan records found in {0}")]
    NoScans(String),
    #[error("not enough data: {0}")]
    InsufficientData(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
