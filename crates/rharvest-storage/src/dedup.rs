//! Persistent set of previously seen item ids, scoped per [`ItemKind`].
//!
//! Entries carry the item's `created_utc` so the set can be compacted to a
//! sliding window instead of growing forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rharvest_core::{ItemKind, StoreError};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::debug;

use crate::with_timeout;

#[async_trait]
pub trait DedupSet: Send + Sync {
    async fn contains(&self, kind: ItemKind, id: &str) -> Result<bool, StoreError>;

    /// Mark `id` as seen. Adding an id twice is a no-op.
    async fn add(&self, kind: ItemKind, id: &str, created_utc: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drop every entry whose item was created before `older_than`.
    async fn compact(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn len(&self, kind: ItemKind) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDedupSet {
    entries: Mutex<HashMap<(ItemKind, String), DateTime<Utc>>>,
    unavailable: AtomicBool,
}

impl MemoryDedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory dedup set marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DedupSet for MemoryDedupSet {
    async fn contains(&self, kind: ItemKind, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(entries.contains_key(&(kind, id.to_string())))
    }

    async fn add(&self, kind: ItemKind, id: &str, created_utc: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.entry((kind, id.to_string())).or_insert(created_utc);
        Ok(())
    }

    async fn compact(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, created| *created >= older_than);
        Ok((before - entries.len()) as u64)
    }

    async fn len(&self, kind: ItemKind) -> Result<u64, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.keys().filter(|(k, _)| *k == kind).count() as u64)
    }
}

/// Postgres-backed dedup set (`seen_items` table).
#[derive(Debug, Clone)]
pub struct PgDedupSet {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgDedupSet {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }
}

#[async_trait]
impl DedupSet for PgDedupSet {
    async fn contains(&self, kind: ItemKind, id: &str) -> Result<bool, StoreError> {
        with_timeout("dedup.contains", self.op_timeout, async {
            let found: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM seen_items WHERE kind = $1 AND item_id = $2")
                    .bind(kind.as_str())
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(found.is_some())
        })
        .await
    }

    async fn add(&self, kind: ItemKind, id: &str, created_utc: DateTime<Utc>) -> Result<(), StoreError> {
        with_timeout("dedup.add", self.op_timeout, async {
            sqlx::query(
                "INSERT INTO seen_items (kind, item_id, created_utc) VALUES ($1, $2, $3) \
                 ON CONFLICT (kind, item_id) DO NOTHING",
            )
            .bind(kind.as_str())
            .bind(id)
            .bind(created_utc)
            .execute(&self.pool)
            .await
            .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn compact(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        with_timeout("dedup.compact", self.op_timeout, async {
            let result = sqlx::query("DELETE FROM seen_items WHERE created_utc < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(StoreError::unavailable)?;
            debug!(removed = result.rows_affected(), %older_than, "compacted dedup set");
            Ok::<_, StoreError>(result.rows_affected())
        })
        .await
    }

    async fn len(&self, kind: ItemKind) -> Result<u64, StoreError> {
        with_timeout("dedup.len", self.op_timeout, async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_items WHERE kind = $1")
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(count.max(0) as u64)
        })
        .await
    }
}
