use crate::codec::{decode_bytes, CodecError, ImageCodec};
use crate::config::AppConfig;
use crate::detector::ChangeDetector;
use crate::executor::UpdateExecutor;
use crate::hosting::CloudinaryHost;
use crate::store::PgRecordStore;
use crate::types::{ComparisonInput, ComparisonOutcome, ImageSource, RefreshRequest, Result, UpdateResult, UpdateStatus};
use asset_interfaces::{AssetHost, RecordStore, StoredAsset, ViewColumn};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

type LoadedImage = std::result::Result<Arc<DynamicImage>, CodecError>;

/// Stops a running refresh from starting further pairs. Pairs already in
/// flight finish; applied updates stay applied.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Job {
    Done(UpdateResult),
    Pair {
        asset: StoredAsset,
        path: PathBuf,
        new_image: Arc<OnceCell<LoadedImage>>,
    },
}

pub struct AssetRefresher {
    store: Arc<dyn RecordStore>,
    codec: Arc<ImageCodec>,
    detector: Arc<ChangeDetector>,
    executor: UpdateExecutor,
    concurrency: usize,
}

impl AssetRefresher {
    pub fn new(store: Arc<dyn RecordStore>, host: Arc<dyn AssetHost>, codec: ImageCodec, detector: ChangeDetector) -> Self {
        let executor = UpdateExecutor::new(store.clone(), host);
        Self {
            store,
            codec: Arc::new(codec),
            detector: Arc::new(detector),
            executor,
            concurrency: 1,
        }
    }

    /// Number of pairs evaluated at once. 1 keeps the pipeline sequential.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Postgres record store, Cloudinary host and the configured detector.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        info!("Connecting to database: {}", config.redacted_database_url());
        let store = Arc::new(PgRecordStore::new(&config.database_url, config.record_kind).await?);
        let host = Arc::new(CloudinaryHost::new(config.hosting.clone())?);
        let codec = ImageCodec::new(config.fetch.clone())?;
        let detector = ChangeDetector::new(&config.detector)?;

        Ok(Self::new(store, host, codec, detector).with_concurrency(config.concurrency))
    }

    pub async fn refresh(&self, request: &RefreshRequest) -> Vec<UpdateResult> {
        self.refresh_with_cancel(request, &CancelToken::new()).await
    }

    /// One result per (requested view × matched record), in view order then
    /// record order. A view whose lookup fails yields a single
    /// `lookup-failed` entry; a view without matching records yields none.
    pub async fn refresh_with_cancel(&self, request: &RefreshRequest, cancel: &CancelToken) -> Vec<UpdateResult> {
        let span = info_span!("refresh", request_id = %Uuid::new_v4(), segment_id = request.selector.segment_id, model_type = %request.selector.model_type);

        async move {
            info!("Processing {} view(s) for {}", request.image_paths.len(), request.selector);

            let mut jobs = Vec::new();
            for (column, path) in &request.image_paths {
                jobs.extend(self.plan_view(request, *column, path).await);
            }

            let results: Vec<UpdateResult> = stream::iter(jobs)
                .map(|job| async move {
                    match job {
                        Job::Done(result) => result,
                        Job::Pair { asset, path, new_image } => self.process_pair(asset, path, new_image, cancel).await,
                    }
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            log_summary(&results);
            results
        }
        .instrument(span)
        .await
    }

    /// Decide whether `input.new_image` should replace the reference asset.
    pub async fn compare(&self, input: &ComparisonInput) -> ComparisonOutcome {
        if let ImageSource::Path(path) = &input.new_image {
            if let Err(e) = self.codec.check_local(path).await {
                return ComparisonOutcome::from_new_image_error(&e);
            }
        }

        let Some(reference_url) = reference_of(input.reference_url.as_deref()) else {
            return ComparisonOutcome::no_reference();
        };

        let loaded = match &input.new_image {
            ImageSource::Path(path) => self.codec.load_local(path).await,
            ImageSource::Bytes(bytes) => decode_bytes(bytes, "submitted image"),
        };

        match loaded {
            Ok(image) => self.compare_loaded(Arc::new(image), reference_url, input.column.as_str().to_string()).await,
            Err(e) => ComparisonOutcome::from_new_image_error(&e),
        }
    }

    async fn plan_view(&self, request: &RefreshRequest, column: ViewColumn, path: &Path) -> Vec<Job> {
        debug!("Looking up {} for {}", column, request.selector);

        let assets = match self.store.find_assets(&request.selector, column).await {
            Ok(assets) => assets,
            Err(e) => {
                error!("Record lookup for {} failed: {:#}", column, e);
                return vec![Job::Done(UpdateResult::failed(
                    column,
                    None,
                    UpdateStatus::LookupFailed,
                    format!("{:#}", e),
                ))];
            }
        };

        if assets.is_empty() {
            warn!("No records found for column '{}' with {}", column, request.selector);
            return Vec::new();
        }

        // Decoded at most once per view, and only if some record needs it.
        let new_image = Arc::new(OnceCell::new());
        assets
            .into_iter()
            .map(|asset| Job::Pair {
                asset,
                path: path.to_path_buf(),
                new_image: new_image.clone(),
            })
            .collect()
    }

    async fn process_pair(
        &self,
        asset: StoredAsset,
        path: PathBuf,
        new_image: Arc<OnceCell<LoadedImage>>,
        cancel: &CancelToken,
    ) -> UpdateResult {
        if cancel.is_cancelled() {
            debug!("Skipping record {} ({}): request cancelled", asset.record_id, asset.column);
            return UpdateResult::cancelled(asset.column, asset.record_id);
        }

        let outcome = self.evaluate(&asset, &path, &new_image).await;
        info!(
            "Record {} {}: {} (changed={})",
            asset.record_id, asset.column, outcome.reason, outcome.changed
        );

        self.executor.apply(&asset, &path, outcome).await
    }

    async fn evaluate(&self, asset: &StoredAsset, path: &Path, new_image: &OnceCell<LoadedImage>) -> ComparisonOutcome {
        // A bad path is reported even when there is nothing to compare against.
        if let Err(e) = self.codec.check_local(path).await {
            error!("New image for record {} ({}) missing: {}", asset.record_id, asset.column, e);
            return ComparisonOutcome::from_new_image_error(&e);
        }

        let Some(reference_url) = reference_of(asset.current_url.as_deref()) else {
            warn!("No existing image URL for record {} ({})", asset.record_id, asset.column);
            return ComparisonOutcome::no_reference();
        };

        let loaded = new_image
            .get_or_init(|| async { self.codec.load_local(path).await.map(Arc::new) })
            .await;

        let image = match loaded {
            Ok(image) => image.clone(),
            Err(e) => {
                error!("New image for {} unusable: {}", asset.column, e);
                return ComparisonOutcome::from_new_image_error(e);
            }
        };

        let tag = format!("{}_{}", asset.record_id, asset.column);
        self.compare_loaded(image, reference_url, tag).await
    }

    async fn compare_loaded(&self, new_image: Arc<DynamicImage>, reference_url: &str, tag: String) -> ComparisonOutcome {
        let reference = match self.codec.fetch_remote(reference_url).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!("Reference {} unreadable, treating as changed: {}", reference_url, e);
                return ComparisonOutcome::reference_unreadable(e.to_string());
            }
        };

        let detector = self.detector.clone();
        let verdict = tokio::task::spawn_blocking(move || detector.detect_tagged(&new_image, &reference, &tag)).await;

        match verdict {
            Ok(verdict) => ComparisonOutcome::from_verdict(verdict.changed, verdict.diagnostics),
            Err(e) => {
                error!("Detection task for {} aborted: {}", reference_url, e);
                ComparisonOutcome::detection_failed(e.to_string())
            }
        }
    }
}

fn reference_of(url: Option<&str>) -> Option<&str> {
    url.map(str::trim).filter(|url| !url.is_empty())
}

fn log_summary(results: &[UpdateResult]) {
    let mut counts: HashMap<UpdateStatus, usize> = HashMap::new();
    for result in results {
        *counts.entry(result.status).or_default() += 1;
    }
    let errors = results.iter().filter(|result| result.status.is_error()).count();
    info!("Refresh finished: {} result(s), {} error(s), {:?}", results.len(), errors, counts);
}
