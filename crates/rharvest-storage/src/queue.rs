//! Durable FIFO of opaque batches, one logical list per topic.
//!
//! The unit of append, peek and removal is the whole batch. Removal is by
//! value so a consumer only ever deletes the exact bytes it peeked.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rharvest_core::StoreError;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::with_timeout;

pub const QUARANTINE_SUFFIX: &str = ":quarantine";

pub fn quarantine_topic(topic: &str) -> String {
    format!("{topic}{QUARANTINE_SUFFIX}")
}

/// Stable identity of a batch's bytes, used to count failed drain attempts.
pub fn batch_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait BatchQueue: Send + Sync {
    /// Push to the tail of `topic`.
    async fn append(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError>;

    /// Oldest batch of `topic`, left in place.
    async fn peek_oldest(&self, topic: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove up to `count` occurrences equal to `batch`, oldest first.
    /// Returns how many were removed; zero is not an error.
    async fn remove_if_present(&self, topic: &str, batch: &[u8], count: usize) -> Result<usize, StoreError>;

    async fn len(&self, topic: &str) -> Result<usize, StoreError>;

    /// Bump and return the failed-drain counter for `batch`.
    async fn record_failure(&self, topic: &str, batch: &[u8]) -> Result<u32, StoreError>;

    async fn clear_failures(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError>;

    /// Move one occurrence of `batch` from `topic` to its quarantine topic.
    /// Returns false when the batch was no longer present.
    async fn quarantine(&self, topic: &str, batch: &[u8]) -> Result<bool, StoreError>;
}

/// Per-operation call counters, mostly for asserting protocol behavior.
#[derive(Debug, Default)]
pub struct QueueOpCounts {
    pub appends: AtomicUsize,
    pub peeks: AtomicUsize,
    pub removes: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOpSnapshot {
    pub appends: usize,
    pub peeks: usize,
    pub removes: usize,
}

impl QueueOpCounts {
    pub fn snapshot(&self) -> QueueOpSnapshot {
        QueueOpSnapshot {
            appends: self.appends.load(Ordering::SeqCst),
            peeks: self.peeks.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    pub fn total(&self) -> usize {
        let s = self.snapshot();
        s.appends + s.peeks + s.removes
    }
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    topics: HashMap<String, VecDeque<Vec<u8>>>,
    failures: HashMap<(String, String), u32>,
}

/// In-process queue. Same contract as [`PgQueue`]; shared via `Arc`.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    ops: QueueOpCounts,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &QueueOpCounts {
        &self.ops
    }

    /// Simulate the backing store going away: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn contents(&self, topic: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory queue marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BatchQueue for MemoryQueue {
    async fn append(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        self.ops.appends.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(batch.to_vec());
        Ok(())
    }

    async fn peek_oldest(&self, topic: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ops.peeks.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.topics.get(topic).and_then(|q| q.front().cloned()))
    }

    async fn remove_if_present(&self, topic: &str, batch: &[u8], count: usize) -> Result<usize, StoreError> {
        self.ops.removes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Ok(0);
        };
        let mut removed = 0;
        let mut idx = 0;
        while idx < queue.len() && removed < count {
            if queue[idx] == batch {
                queue.remove(idx);
                removed += 1;
            } else {
                idx += 1;
            }
        }
        Ok(removed)
    }

    async fn len(&self, topic: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.topics.get(topic).map(VecDeque::len).unwrap_or(0))
    }

    async fn record_failure(&self, topic: &str, batch: &[u8]) -> Result<u32, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let attempts = state
            .failures
            .entry((topic.to_string(), batch_digest(batch)))
            .or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn clear_failures(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.failures.remove(&(topic.to_string(), batch_digest(batch)));
        Ok(())
    }

    async fn quarantine(&self, topic: &str, batch: &[u8]) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Ok(false);
        };
        let Some(pos) = queue.iter().position(|b| b == batch) else {
            return Ok(false);
        };
        let moved = queue.remove(pos).unwrap_or_default();
        state
            .topics
            .entry(quarantine_topic(topic))
            .or_default()
            .push_back(moved);
        state.failures.remove(&(topic.to_string(), batch_digest(batch)));
        Ok(true)
    }
}

/// Postgres-backed queue (`queue_batches`, `batch_failures`).
///
/// Oldest means smallest `seq`. Value-based removal locks candidate rows with
/// `SKIP LOCKED`, so two consumers racing on the same batch delete it once.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }
}

#[async_trait]
impl BatchQueue for PgQueue {
    async fn append(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        with_timeout("queue.append", self.op_timeout, async {
            sqlx::query("INSERT INTO queue_batches (topic, payload) VALUES ($1, $2)")
                .bind(topic)
                .bind(batch)
                .execute(&self.pool)
                .await
                .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn peek_oldest(&self, topic: &str) -> Result<Option<Vec<u8>>, StoreError> {
        with_timeout("queue.peek_oldest", self.op_timeout, async {
            sqlx::query_scalar::<_, Vec<u8>>(
                "SELECT payload FROM queue_batches WHERE topic = $1 ORDER BY seq ASC LIMIT 1",
            )
            .bind(topic)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::unavailable)
        })
        .await
    }

    async fn remove_if_present(&self, topic: &str, batch: &[u8], count: usize) -> Result<usize, StoreError> {
        with_timeout("queue.remove_if_present", self.op_timeout, async {
            let result = sqlx::query(
                "DELETE FROM queue_batches WHERE seq IN ( \
                    SELECT seq FROM queue_batches \
                    WHERE topic = $1 AND payload = $2 \
                    ORDER BY seq ASC LIMIT $3 \
                    FOR UPDATE SKIP LOCKED)",
            )
            .bind(topic)
            .bind(batch)
            .bind(count as i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(result.rows_affected() as usize)
        })
        .await
    }

    async fn len(&self, topic: &str) -> Result<usize, StoreError> {
        with_timeout("queue.len", self.op_timeout, async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_batches WHERE topic = $1")
                .bind(topic)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(count.max(0) as usize)
        })
        .await
    }

    async fn record_failure(&self, topic: &str, batch: &[u8]) -> Result<u32, StoreError> {
        let digest = batch_digest(batch);
        with_timeout("queue.record_failure", self.op_timeout, async {
            let attempts: i32 = sqlx::query_scalar(
                "INSERT INTO batch_failures (topic, digest, attempts) VALUES ($1, $2, 1) \
                 ON CONFLICT (topic, digest) \
                 DO UPDATE SET attempts = batch_failures.attempts + 1, updated_at = now() \
                 RETURNING attempts",
            )
            .bind(topic)
            .bind(&digest)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(attempts.max(0) as u32)
        })
        .await
    }

    async fn clear_failures(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        let digest = batch_digest(batch);
        with_timeout("queue.clear_failures", self.op_timeout, async {
            sqlx::query("DELETE FROM batch_failures WHERE topic = $1 AND digest = $2")
                .bind(topic)
                .bind(&digest)
                .execute(&self.pool)
                .await
                .map_err(StoreError::unavailable)?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn quarantine(&self, topic: &str, batch: &[u8]) -> Result<bool, StoreError> {
        let digest = batch_digest(batch);
        let target = quarantine_topic(topic);
        with_timeout("queue.quarantine", self.op_timeout, async {
            let mut tx = self.pool.begin().await.map_err(StoreError::unavailable)?;
            let moved = sqlx::query(
                "DELETE FROM queue_batches WHERE seq IN ( \
                    SELECT seq FROM queue_batches \
                    WHERE topic = $1 AND payload = $2 \
                    ORDER BY seq ASC LIMIT 1 \
                    FOR UPDATE SKIP LOCKED)",
            )
            .bind(topic)
            .bind(batch)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::unavailable)?
            .rows_affected();

            if moved == 0 {
                tx.rollback().await.map_err(StoreError::unavailable)?;
                warn!(topic, %digest, "batch vanished before quarantine");
                return Ok(false);
            }

            sqlx::query("INSERT INTO queue_batches (topic, payload) VALUES ($1, $2)")
                .bind(&target)
                .bind(batch)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::unavailable)?;
            sqlx::query("DELETE FROM batch_failures WHERE topic = $1 AND digest = $2")
                .bind(topic)
                .bind(&digest)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::unavailable)?;
            tx.commit().await.map_err(StoreError::unavailable)?;
            debug!(topic, %digest, target = %target, "quarantined batch");
            Ok::<_, StoreError>(true)
        })
        .await
    }
}
