use asset_interfaces::{AssetSelector, ViewColumn};
use asset_refresh::{AppConfig, AssetRefresher, DetectorConfig, DetectorPreset, RecordKind, RefreshError, RefreshRequest};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Compare freshly submitted vehicle photos against the hosted ones and
/// replace those that changed.
#[derive(Debug, Parser)]
#[command(name = "asset-refresh", version)]
struct Cli {
    #[arg(long, required_unless_present = "request")]
    segment_id: Option<i32>,

    #[arg(long, required_unless_present = "request")]
    model_type: Option<String>,

    /// New photo for a view slot, e.g. `front_view=/tmp/front.jpg`. Repeatable.
    #[arg(long = "image", value_name = "COLUMN=PATH", value_parser = parse_image_arg)]
    images: Vec<(ViewColumn, PathBuf)>,

    /// JSON request body: `{"segment_id", "model_type", "image_paths"}`.
    #[arg(long, value_name = "FILE", conflicts_with_all = ["segment_id", "model_type", "images"])]
    request: Option<PathBuf>,

    #[arg(long, value_enum)]
    preset: Option<DetectorPreset>,

    /// JSON detector configuration; fields left out keep their defaults.
    #[arg(long, value_name = "FILE", conflicts_with = "preset")]
    detector_config: Option<PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// `car` or `scooter`; overrides RECORD_KIND.
    #[arg(long)]
    record_kind: Option<String>,
}

fn parse_image_arg(raw: &str) -> Result<(ViewColumn, PathBuf), String> {
    let (column, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=PATH, got '{}'", raw))?;
    let column = column.parse::<ViewColumn>().map_err(|e| e.to_string())?;
    if path.trim().is_empty() {
        return Err(format!("empty path for {}", column));
    }
    Ok((column, PathBuf::from(path)))
}

impl Cli {
    fn into_request(self) -> Result<RefreshRequest, RefreshError> {
        if let Some(file) = &self.request {
            let body = std::fs::read_to_string(file)?;
            return Ok(serde_json::from_str(&body)?);
        }

        let (Some(segment_id), Some(model_type)) = (self.segment_id, self.model_type) else {
            return Err(RefreshError::InvalidRequest("--segment-id and --model-type are required".to_string()));
        };
        if self.images.is_empty() {
            return Err(RefreshError::InvalidRequest("at least one --image is required".to_string()));
        }

        let image_paths: BTreeMap<ViewColumn, PathBuf> = self.images.into_iter().collect();
        Ok(RefreshRequest {
            selector: AssetSelector::new(segment_id, model_type),
            image_paths,
        })
    }

    fn apply_overrides(&self, config: &mut AppConfig) -> Result<(), RefreshError> {
        if let Some(preset) = self.preset {
            config.detector = DetectorConfig {
                debug_dir: config.detector.debug_dir.clone(),
                ..preset.config()
            };
        }
        if let Some(file) = &self.detector_config {
            let body = std::fs::read_to_string(file)?;
            let detector: DetectorConfig = serde_json::from_str(&body)?;
            detector.validate()?;
            config.detector = detector;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        if let Some(kind) = &self.record_kind {
            config.record_kind = kind.parse::<RecordKind>()?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    info!("Starting asset refresh");

    let mut config = AppConfig::from_env()?;
    cli.apply_overrides(&mut config)?;
    let request = cli.into_request()?;

    let refresher = AssetRefresher::from_config(&config).await.map_err(|e| {
        error!("Failed to initialise refresher: {}", e);
        error!("  Check connection string: {}", config.redacted_database_url());
        Box::new(e) as Box<dyn std::error::Error>
    })?;

    let results = refresher.refresh(&request).await;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let failures = results.iter().filter(|result| result.status.is_error()).count();
    if failures > 0 {
        error!("{} of {} result(s) failed", failures, results.len());
        std::process::exit(1);
    }

    info!("Asset refresh finished");
    Ok(())
}
