use clap::{Parser, Subcommand};
use pedestrian_flow::api::{self, ApiState};
use pedestrian_flow::config::{self, Config};
use pedestrian_flow::scan::record::{TimeRange, parse_timestamp};
use pedestrian_flow::scoring::ScoringService;
use pedestrian_flow::state::AppState;
use pedestrian_flow::training;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "pedestrian-flow", version, about = "Pedestrian traffic sensing and forecasting")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the API and refresh predictions periodically (default)
    Serve,
    /// Aggregate raw scan logs into the processed dataset
    Process {
        /// Earliest scan timestamp to include (RFC 3339 or ISO-8601, UTC if no offset)
        #[arg(long)]
        start: Option<String>,
        /// Latest scan timestamp to include
        #[arg(long)]
        end: Option<String>,
    },
    /// Train the classifier and forecaster on the processed dataset
    Train,
    /// Write synthetic scans ending now into the raw scan log
    Synthesize {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value_t = 120)]
        scans_per_hour: u32,
        /// Devices that stay in range for the whole run
        #[arg(long, default_value_t = 0)]
        fixtures: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn init_tracing(level: tracing::Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_bound(value: Option<&str>) -> Result<Option<OffsetDateTime>, Box<dyn std::error::Error>> {
    match value {
        Some(value) => Ok(Some(
            parse_timestamp(value).map_err(|err| format!("invalid timestamp {value:?}: {err}"))?,
        )),
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = config::load_from_path(&cli.config)?;
    init_tracing(config.log_level());
    tracing::info!(
        config_path = %cli.config.display(),
        app = %config.app.name,
        "pedestrian-flow starting"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await?,
        Command::Process { start, end } => {
            let range = TimeRange {
                start: parse_bound(start.as_deref())?,
                end: parse_bound(end.as_deref())?,
            };
            let metadata = training::process_raw(&config, range)?;
            tracing::info!(records = metadata.num_records, "Processing complete");
        }
        Command::Train => {
            let report = training::train_models(&config)?;
            tracing::info!(
                silhouette = ?report.classifier.silhouette,
                forecaster = %report.forecaster.model,
                metrics = ?report.forecaster.metrics,
                "Training complete"
            );
        }
        Command::Synthesize {
            days,
            scans_per_hour,
            fixtures,
            seed,
        } => {
            training::synthesize(
                &config,
                OffsetDateTime::now_utc(),
                days,
                scans_per_hour,
                fixtures,
                seed,
            )?;
        }
    }
    Ok(())
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(AppState::new());
    let scoring = Arc::new(ScoringService::from_config(&config, Arc::clone(&state)));

    let refresh_interval = config.refresh_interval();
    tracing::info!(
        interval_secs = refresh_interval.as_secs(),
        "Starting periodic scoring"
    );
    let refresh_handle = Arc::clone(&scoring).spawn_periodic(refresh_interval);

    let app = api::router(ApiState {
        scoring: Arc::clone(&scoring),
        history_default_hours: config.history_default_hours(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    scoring.shutdown();
    refresh_handle.await?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_toml() -> Result<(), Box<dyn std::error::Error>> {
        let _config = config::load_default()?;
        Ok(())
    }

    #[test]
    fn bare_invocation_serves() {
        let cli = Cli::parse_from(["pedestrian-flow"]);

        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(config::DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn process_accepts_offsetless_bounds() -> Result<(), Box<dyn std::error::Error>> {
        let bound = parse_bound(Some("2025-03-10T08:00:00"))?;

        assert_eq!(bound.map(|b| b.hour()), Some(8));
        Ok(())
    }
}
