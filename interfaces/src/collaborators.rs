use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::defs::{AssetSelector, StoredAsset, ViewColumn};

/// Read/write access to the records that own photo slots.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records matching `selector`, with the current value of `column`.
    async fn find_assets(&self, selector: &AssetSelector, column: ViewColumn) -> Result<Vec<StoredAsset>>;

    /// Point `column` of exactly one record at `new_url`.
    ///
    /// Fails when no record with `record_id` exists.
    async fn update_asset(&self, record_id: i64, column: ViewColumn, new_url: &str) -> Result<()>;
}

/// Hosting service that turns a local image file into a public URL.
#[async_trait]
pub trait AssetHost: Send + Sync {
    async fn upload(&self, local_path: &Path) -> Result<String>;
}
