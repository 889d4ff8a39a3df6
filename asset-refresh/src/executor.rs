use crate::types::{ComparisonOutcome, UpdateResult, UpdateStatus};
use asset_interfaces::{AssetHost, RecordStore, StoredAsset};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Applies verdicts: uploads changed photos and points the owning record at
/// the hosted copy.
pub struct UpdateExecutor {
    store: Arc<dyn RecordStore>,
    host: Arc<dyn AssetHost>,
    // Writes to one record are serialized across concurrently processed views.
    record_locks: RwLock<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UpdateExecutor {
    pub fn new(store: Arc<dyn RecordStore>, host: Arc<dyn AssetHost>) -> Self {
        Self {
            store,
            host,
            record_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Always yields exactly one result for the pair; never fails.
    pub async fn apply(&self, asset: &StoredAsset, new_image: &Path, outcome: ComparisonOutcome) -> UpdateResult {
        let base = UpdateResult::from_outcome(asset.column, asset.record_id, &outcome);
        if !outcome.changed {
            return base;
        }

        let url = match self.host.upload(new_image).await {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    "Upload of {} for record {} ({}) failed: {:#}",
                    new_image.display(),
                    asset.record_id,
                    asset.column,
                    e
                );
                return base.with_failure(UpdateStatus::UploadFailed, format!("{:#}", e));
            }
        };

        let lock = self.record_lock(asset.record_id).await;
        let guard = lock.lock().await;
        let persisted = self.store.update_asset(asset.record_id, asset.column, &url).await;
        drop(guard);
        self.release_lock(asset.record_id, lock).await;

        match persisted {
            Ok(()) => {
                info!(
                    "Record {} {} now points at {} ({})",
                    asset.record_id, asset.column, url, outcome.reason
                );
                UpdateResult::from_outcome(asset.column, asset.record_id, &outcome.with_asset_url(url))
            }
            Err(e) => {
                // Not retried; the hosted copy is left for manual reconciliation.
                error!(
                    "Failed to persist {} for record {} ({}): {:#}; orphaned asset {}",
                    url, asset.record_id, asset.column, e, url
                );
                base.with_failure(
                    UpdateStatus::PersistenceFailed,
                    format!("{:#} (orphaned asset {})", e, url),
                )
            }
        }
    }

    async fn record_lock(&self, record_id: i64) -> Arc<Mutex<()>> {
        if let Some(lock) = self.record_locks.read().await.get(&record_id) {
            return lock.clone();
        }
        let mut locks = self.record_locks.write().await;
        locks.entry(record_id).or_default().clone()
    }

    // Drops the map entry once no other write holds or waits on it.
    async fn release_lock(&self, record_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.record_locks.write().await;
        let tracked = locks.get(&record_id).is_some_and(|entry| Arc::ptr_eq(entry, &lock));
        if tracked && Arc::strong_count(&lock) == 2 {
            locks.remove(&record_id);
        }
    }

    /// Records with a write in flight or queued.
    pub async fn locked_records(&self) -> usize {
        self.record_locks.read().await.len()
    }
}
