//! Indexer: drains one batch at a time from a topic into the index store.
//!
//! A batch is removed only after every record in it was upserted. Anything
//! less leaves the whole batch at the head of the topic for the next drain,
//! which re-upserts the records that already succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rharvest_core::{decode_batch, IndexError, ItemKind, Record, StoreError};
use rharvest_storage::{batch_digest, quarantine_topic, BatchQueue, IndexSink};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Upserts one record, keyed by its id. Must be idempotent.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    async fn write(&self, record: &Record) -> Result<u64, IndexError>;
}

/// Routes each record to the post or comment index of an [`IndexSink`].
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn IndexSink>,
    post_index: String,
    comment_index: String,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn IndexSink>, post_index: impl Into<String>, comment_index: impl Into<String>) -> Self {
        Self {
            sink,
            post_index: post_index.into(),
            comment_index: comment_index.into(),
        }
    }

    pub fn index_for(&self, kind: ItemKind) -> &str {
        match kind {
            ItemKind::Post => &self.post_index,
            ItemKind::Comment => &self.comment_index,
        }
    }
}

#[async_trait]
impl RecordWriter for SinkWriter {
    async fn write(&self, record: &Record) -> Result<u64, IndexError> {
        self.sink
            .upsert(self.index_for(record.kind()), record.id(), &record.to_document())
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    /// Failed drains of one batch before it is quarantined. `0` disables quarantine.
    pub max_attempts: u32,
    pub record_timeout: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            record_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    NoData,
    /// Head batch does not decode; left in place.
    Corrupt,
    /// Every record indexed. `removed` is zero when another consumer removed it first.
    Completed { indexed: usize, removed: usize },
    /// Some records failed; the whole batch stays queued.
    PartialFailure { indexed: usize, failed: usize },
    /// Moved to the quarantine topic after too many failed drains.
    Quarantined { attempts: u32 },
}

impl DrainOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DrainOutcome::NoData => "no data",
            DrainOutcome::Corrupt => "corrupt batch",
            DrainOutcome::Completed { .. } => "completed",
            DrainOutcome::PartialFailure { .. } => "partial failure",
            DrainOutcome::Quarantined { .. } => "quarantined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub topic: String,
    pub batches_completed: usize,
    pub records_indexed: usize,
    pub batches_quarantined: usize,
    pub last: DrainOutcome,
}

#[derive(Clone)]
pub struct Indexer {
    queue: Arc<dyn BatchQueue>,
    policy: DrainPolicy,
}

impl Indexer {
    pub fn new(queue: Arc<dyn BatchQueue>, policy: DrainPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn policy(&self) -> DrainPolicy {
        self.policy
    }

    /// Process the oldest batch of `topic` once.
    pub async fn drain_once(&self, topic: &str, writer: &dyn RecordWriter) -> Result<DrainOutcome, StoreError> {
        let Some(batch) = self.queue.peek_oldest(topic).await? else {
            return Ok(DrainOutcome::NoData);
        };

        let records = match decode_batch(&batch) {
            Ok(records) => records,
            Err(err) => {
                error!(topic, digest = %batch_digest(&batch), error = %err, "corrupt batch left in queue");
                return self.note_failure(topic, &batch, DrainOutcome::Corrupt).await;
            }
        };

        let mut indexed = 0usize;
        let mut failed = 0usize;
        for record in &records {
            let result = match tokio::time::timeout(self.policy.record_timeout, writer.write(record)).await {
                Ok(result) => result,
                Err(_) => Err(IndexError::Timeout {
                    id: record.id().to_string(),
                    after: self.policy.record_timeout,
                }),
            };
            match result {
                Ok(version) => {
                    indexed += 1;
                    debug!(topic, id = record.id(), version, "indexed");
                }
                Err(err) => {
                    failed += 1;
                    warn!(topic, kind = %record.kind(), id = record.id(), error = %err, "index upsert failed");
                }
            }
        }

        if failed > 0 {
            return self
                .note_failure(topic, &batch, DrainOutcome::PartialFailure { indexed, failed })
                .await;
        }

        let removed = self.queue.remove_if_present(topic, &batch, 1).await?;
        if removed == 0 {
            debug!(topic, "batch already removed by another consumer");
        }
        if self.policy.max_attempts > 0 {
            if let Err(err) = self.queue.clear_failures(topic, &batch).await {
                warn!(topic, error = %err, "could not clear failure counter");
            }
        }
        Ok(DrainOutcome::Completed { indexed, removed })
    }

    /// Drain until the topic is empty, a batch fails, or `max_batches` were processed.
    pub async fn drain_all(
        &self,
        topic: &str,
        writer: &dyn RecordWriter,
        max_batches: usize,
    ) -> Result<DrainSummary, StoreError> {
        let mut summary = DrainSummary {
            topic: topic.to_string(),
            batches_completed: 0,
            records_indexed: 0,
            batches_quarantined: 0,
            last: DrainOutcome::NoData,
        };
        for _ in 0..max_batches {
            let outcome = self.drain_once(topic, writer).await?;
            summary.last = outcome;
            match outcome {
                DrainOutcome::Completed { indexed, .. } => {
                    summary.batches_completed += 1;
                    summary.records_indexed += indexed;
                }
                DrainOutcome::Quarantined { .. } => summary.batches_quarantined += 1,
                DrainOutcome::NoData | DrainOutcome::Corrupt | DrainOutcome::PartialFailure { .. } => break,
            }
        }
        info!(
            topic,
            batches = summary.batches_completed,
            records = summary.records_indexed,
            quarantined = summary.batches_quarantined,
            last = summary.last.label(),
            "drain finished"
        );
        Ok(summary)
    }

    async fn note_failure(
        &self,
        topic: &str,
        batch: &[u8],
        outcome: DrainOutcome,
    ) -> Result<DrainOutcome, StoreError> {
        if self.policy.max_attempts == 0 {
            return Ok(outcome);
        }
        let attempts = self.queue.record_failure(topic, batch).await?;
        if attempts < self.policy.max_attempts {
            debug!(topic, attempts, max = self.policy.max_attempts, "batch left for retry");
            return Ok(outcome);
        }
        if self.queue.quarantine(topic, batch).await? {
            warn!(
                topic,
                attempts,
                quarantine = %quarantine_topic(topic),
                digest = %batch_digest(batch),
                "batch quarantined"
            );
            Ok(DrainOutcome::Quarantined { attempts })
        } else {
            Ok(outcome)
        }
    }
}
