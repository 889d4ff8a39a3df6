use crate::types::RefreshError;
use anyhow::bail;
use asset_interfaces::{AssetSelector, RecordStore, StoredAsset, ViewColumn};
use async_trait::async_trait;
use sqlx::{PgPool, Pool, Postgres, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Which table of photo-bearing records a deployment works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Car,
    Scooter,
}

impl RecordKind {
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Car => "cars",
            RecordKind::Scooter => "scooter_ev",
        }
    }

    pub fn id_column(&self) -> &'static str {
        match self {
            RecordKind::Car => "car_id",
            RecordKind::Scooter => "scooter_id",
        }
    }
}

impl FromStr for RecordKind {
    type Err = RefreshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "car" | "cars" => Ok(RecordKind::Car),
            "scooter" | "scooters" | "scooter_ev" => Ok(RecordKind::Scooter),
            other => Err(RefreshError::Config(format!("unknown record kind '{}'", other))),
        }
    }
}

pub struct PgRecordStore {
    db: Pool<Postgres>,
    kind: RecordKind,
}

impl PgRecordStore {
    pub async fn new(database_url: &str, kind: RecordKind) -> crate::types::Result<Self> {
        let db = PgPool::connect(database_url).await?;

        // The record tables are owned by the catalogue service; nothing is
        // created here.

        Ok(Self { db, kind })
    }

}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_assets(&self, selector: &AssetSelector, column: ViewColumn) -> anyhow::Result<Vec<StoredAsset>> {
        // Identifiers come from closed enums; values are bound.
        let query = format!(
            "SELECT {id}::BIGINT AS record_id, {column} AS current_url FROM {table} \
             WHERE model_type = $1 AND segment_id = $2 ORDER BY {id}",
            id = self.kind.id_column(),
            column = column.as_str(),
            table = self.kind.table(),
        );

        let rows = sqlx::query(&query)
            .bind(&selector.model_type)
            .bind(selector.segment_id)
            .fetch_all(&self.db)
            .await?;

        let mut assets = Vec::with_capacity(rows.len());
        for row in rows {
            assets.push(StoredAsset {
                record_id: row.try_get("record_id")?,
                selector: selector.clone(),
                column,
                current_url: row.try_get("current_url")?,
            });
        }

        debug!("Found {} {} records for {} ({})", assets.len(), self.kind.table(), selector, column);
        Ok(assets)
    }

    async fn update_asset(&self, record_id: i64, column: ViewColumn, new_url: &str) -> anyhow::Result<()> {
        let query = format!(
            "UPDATE {table} SET {column} = $1 WHERE {id} = $2",
            table = self.kind.table(),
            column = column.as_str(),
            id = self.kind.id_column(),
        );

        let result = sqlx::query(&query)
            .bind(new_url)
            .bind(record_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            bail!("no {} record with id {}", self.kind.table(), record_id);
        }

        info!("Updated {} of {} record {}", column, self.kind.table(), record_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    record_id: i64,
    selector: AssetSelector,
    views: HashMap<ViewColumn, Option<String>>,
}

/// Record store kept in process memory, for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<Vec<MemoryRecord>>,
    failing_updates: RwLock<HashSet<i64>>,
    failing_lookups: RwLock<HashSet<ViewColumn>>,
    updates: RwLock<Vec<(i64, ViewColumn, String)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        record_id: i64,
        selector: AssetSelector,
        views: impl IntoIterator<Item = (ViewColumn, Option<String>)>,
    ) {
        let mut records = self.records.write().await;
        records.push(MemoryRecord {
            record_id,
            selector,
            views: views.into_iter().collect(),
        });
    }

    /// Make every later `update_asset` for `record_id` fail.
    pub async fn fail_updates_for(&self, record_id: i64) {
        self.failing_updates.write().await.insert(record_id);
    }

    /// Make every later `find_assets` for `column` fail.
    pub async fn fail_lookups_for(&self, column: ViewColumn) {
        self.failing_lookups.write().await.insert(column);
    }

    pub async fn current_url(&self, record_id: i64, column: ViewColumn) -> Option<String> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|record| record.record_id == record_id)
            .and_then(|record| record.views.get(&column).cloned().flatten())
    }

    /// Successful writes, in the order they were applied.
    pub async fn updates(&self) -> Vec<(i64, ViewColumn, String)> {
        self.updates.read().await.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_assets(&self, selector: &AssetSelector, column: ViewColumn) -> anyhow::Result<Vec<StoredAsset>> {
        if self.failing_lookups.read().await.contains(&column) {
            bail!("lookup of {} is unavailable", column);
        }

        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| &record.selector == selector)
            .map(|record| StoredAsset {
                record_id: record.record_id,
                selector: record.selector.clone(),
                column,
                current_url: record.views.get(&column).cloned().flatten(),
            })
            .collect())
    }

    async fn update_asset(&self, record_id: i64, column: ViewColumn, new_url: &str) -> anyhow::Result<()> {
        if self.failing_updates.read().await.contains(&record_id) {
            bail!("write to record {} rejected", record_id);
        }

        let mut records = self.records.write().await;
        let Some(record) = records.iter_mut().find(|record| record.record_id == record_id) else {
            bail!("no record with id {}", record_id);
        };
        record.views.insert(column, Some(new_url.to_string()));
        drop(records);

        self.updates.write().await.push((record_id, column, new_url.to_string()));
        Ok(())
    }
}
