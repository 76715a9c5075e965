pub mod aggregate;
pub mod api;
pub mod cluster;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod forecast;
pub mod identity;
pub mod scaler;
pub mod scan;
pub mod scoring;
pub mod state;
pub mod stats;
pub mod training;
