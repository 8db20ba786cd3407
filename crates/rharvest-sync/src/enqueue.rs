//! Enqueuer: serializes a record list into one batch and appends it.

use std::sync::Arc;

use rharvest_core::{encode_batch, parse_input_batch, CoreError, ItemKind, Record, StoreError};
use rharvest_storage::BatchQueue;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted { records: usize, bytes: usize },
    /// Empty input; the queue was not touched.
    Skipped,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Malformed(#[from] CoreError),
    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[from] StoreError),
}

#[derive(Clone)]
pub struct Enqueuer {
    queue: Arc<dyn BatchQueue>,
}

impl Enqueuer {
    pub fn new(queue: Arc<dyn BatchQueue>) -> Self {
        Self { queue }
    }

    pub async fn enqueue(&self, topic: &str, records: &[Record]) -> Result<EnqueueOutcome, EnqueueError> {
        if records.is_empty() {
            debug!(topic, "nothing to enqueue");
            return Ok(EnqueueOutcome::Skipped);
        }
        let batch = encode_batch(records)?;
        self.queue.append(topic, &batch).await?;
        debug!(topic, records = records.len(), bytes = batch.len(), "batch appended");
        Ok(EnqueueOutcome::Accepted {
            records: records.len(),
            bytes: batch.len(),
        })
    }

    /// Validate a raw JSON array of `kind` records, then enqueue it.
    pub async fn enqueue_json(&self, topic: &str, kind: ItemKind, body: &[u8]) -> Result<EnqueueOutcome, EnqueueError> {
        let records = parse_input_batch(kind, body)?;
        self.enqueue(topic, &records).await
    }
}
