//! Queue, dedup set and index sink backends plus HTTP fetch utilities.

use std::future::Future;
use std::time::Duration;

use rharvest_core::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

pub mod dedup;
pub mod http;
pub mod index;
pub mod queue;

pub use dedup::{DedupSet, MemoryDedupSet, PgDedupSet};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, Retry, RetryPolicy, SimpleTokenBucket};
pub use index::{ElasticsearchConfig, ElasticsearchIndex, IndexSink, MemoryIndex, StoredDocument};
pub use queue::{batch_digest, quarantine_topic, BatchQueue, MemoryQueue, PgQueue};

pub const CRATE_NAME: &str = "rharvest-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Bound a store operation; an elapsed deadline becomes [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after }),
    }
}

pub async fn connect_pool(database_url: &str, connect_timeout: Duration) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(connect_timeout)
        .connect(database_url)
        .await
        .map_err(StoreError::unavailable)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await.map_err(StoreError::unavailable)?;
    info!("database migrations applied");
    Ok(())
}
