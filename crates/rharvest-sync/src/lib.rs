//! Harvest pipeline orchestration: harvest, enqueue, drain and compaction,
//! wired to Postgres, Elasticsearch and the Reddit API (or in-memory stand-ins).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rharvest_adapters::{ContentSource, FixtureSource, RedditConfig, RedditSource};
use rharvest_core::{ItemKind, Record, StoreError};
use rharvest_storage::{
    connect_pool, run_migrations, BatchQueue, DedupSet, ElasticsearchConfig, ElasticsearchIndex, HttpClientConfig,
    HttpFetcher, IndexSink, MemoryDedupSet, MemoryIndex, MemoryQueue, PgDedupSet, PgQueue,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod enqueue;
pub mod harvest;
pub mod indexer;

pub use config::{MarkSeen, SyncConfig, TopicConfig, TopicRegistry};
pub use enqueue::{EnqueueError, EnqueueOutcome, Enqueuer};
pub use harvest::{HarvestReport, Harvester, Pacer, TopicFailure};
pub use indexer::{DrainOutcome, DrainPolicy, DrainSummary, Indexer, RecordWriter, SinkWriter};

pub const CRATE_NAME: &str = "rharvest-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Client-side mistakes, as opposed to backend failures worth retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::UnknownTopic(_) | PipelineError::Enqueue(EnqueueError::Malformed(_))
        )
    }
}

/// The shared external state every pipeline step coordinates through.
#[derive(Clone)]
pub struct Backends {
    pub source: Arc<dyn ContentSource>,
    pub dedup: Arc<dyn DedupSet>,
    pub queue: Arc<dyn BatchQueue>,
    pub sink: Arc<dyn IndexSink>,
}

impl Backends {
    pub fn in_memory(source: Arc<dyn ContentSource>) -> Self {
        Self {
            source,
            dedup: Arc::new(MemoryDedupSet::new()),
            queue: Arc::new(MemoryQueue::new()),
            sink: Arc::new(MemoryIndex::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub topics: usize,
    pub posts_enqueued: usize,
    pub comments_enqueued: usize,
    pub failures: Vec<TopicFailure>,
}

impl HarvestRunSummary {
    pub fn is_empty(&self) -> bool {
        self.posts_enqueued == 0 && self.comments_enqueued == 0
    }

    /// Every topic failed upstream and nothing reached the queue.
    pub fn all_topics_failed(&self) -> bool {
        self.topics > 0 && self.failures.len() >= self.topics && self.is_empty()
    }
}

pub struct Pipeline {
    config: SyncConfig,
    backends: Backends,
    topics: Vec<TopicConfig>,
    harvester: Harvester,
    enqueuer: Enqueuer,
    indexer: Indexer,
    writer: SinkWriter,
}

impl Pipeline {
    pub fn new(config: SyncConfig, backends: Backends, topics: TopicRegistry) -> Self {
        let pacer = if config.pacing_ms > 0 {
            Pacer::token_bucket(Duration::from_millis(config.pacing_ms))
        } else {
            Pacer::Off
        };
        let harvester = Harvester::new(backends.source.clone(), backends.dedup.clone())
            .with_mark_seen(config.mark_seen)
            .with_pacer(pacer)
            .with_concurrency(config.topic_concurrency);
        let enqueuer = Enqueuer::new(backends.queue.clone());
        let indexer = Indexer::new(
            backends.queue.clone(),
            DrainPolicy {
                max_attempts: config.max_drain_attempts,
                record_timeout: config.record_timeout(),
            },
        );
        let writer = SinkWriter::new(
            backends.sink.clone(),
            config.post_index.clone(),
            config.comment_index.clone(),
        );
        Self {
            config,
            backends,
            topics: topics.enabled(),
            harvester,
            enqueuer,
            indexer,
            writer,
        }
    }

    /// Build production backends from `config`. Missing `DATABASE_URL` or
    /// `ES_CLIENT` fall back to in-process stores.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let topics = config.load_topics()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let source: Arc<dyn ContentSource> = match (&config.reddit_client_id, &config.reddit_client_secret) {
            (Some(id), Some(secret)) => Arc::new(RedditSource::new(http, RedditConfig::new(id, secret))),
            _ => {
                let dir = config
                    .fixtures_dir
                    .clone()
                    .unwrap_or_else(|| config.workspace_root.join("fixtures"));
                warn!(dir = %dir.display(), "no reddit credentials; harvesting from fixtures");
                Arc::new(FixtureSource::from_dir(dir)?)
            }
        };

        let (dedup, queue): (Arc<dyn DedupSet>, Arc<dyn BatchQueue>) = match &config.database_url {
            Some(url) => {
                let pool = connect_pool(url, config.store_timeout())
                    .await
                    .context("connecting to postgres")?;
                let dedup: Arc<dyn DedupSet> = Arc::new(PgDedupSet::new(pool.clone(), config.store_timeout()));
                let queue: Arc<dyn BatchQueue> = Arc::new(PgQueue::new(pool, config.store_timeout()));
                (dedup, queue)
            }
            None => {
                warn!("DATABASE_URL not set; queue and dedup set are in-memory");
                let dedup: Arc<dyn DedupSet> = Arc::new(MemoryDedupSet::new());
                let queue: Arc<dyn BatchQueue> = Arc::new(MemoryQueue::new());
                (dedup, queue)
            }
        };

        let sink: Arc<dyn IndexSink> = match &config.elasticsearch {
            Some(es) => {
                let es_http = HttpFetcher::new(HttpClientConfig {
                    timeout: config.record_timeout(),
                    user_agent: Some(config.user_agent.clone()),
                    accept_invalid_certs: es.accept_invalid_certs,
                    ..Default::default()
                })?;
                Arc::new(ElasticsearchIndex::new(
                    es_http,
                    ElasticsearchConfig {
                        base_url: es.url.clone(),
                        username: es.username.clone(),
                        password: es.password.clone(),
                    },
                ))
            }
            None => {
                warn!("ES_CLIENT not set; indexing into memory");
                Arc::new(MemoryIndex::new())
            }
        };

        Ok(Self::new(
            config,
            Backends {
                source,
                dedup,
                queue,
                sink,
            },
            topics,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn topics(&self) -> &[TopicConfig] {
        &self.topics
    }

    /// Harvest every enabled topic and enqueue the results, one batch per kind.
    pub async fn harvest_once(&self) -> Result<HarvestRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("harvest_run", %run_id);
        async move {
            let report = self.harvester.harvest(&self.topics).await?;
            let posts_enqueued = self.enqueue_kind(ItemKind::Post, &report.posts).await?;
            let comments_enqueued = self.enqueue_kind(ItemKind::Comment, &report.comments).await?;
            // Only once both batches are queued; a post marked early would hide its comments for good.
            if self.harvester.mark_seen_mode() == MarkSeen::AfterEnqueue {
                self.harvester.mark_seen(&report.posts).await?;
                self.harvester.mark_seen(&report.comments).await?;
            }

            let summary = HarvestRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                topics: self.topics.len(),
                posts_enqueued,
                comments_enqueued,
                failures: report.failures,
            };
            info!(
                posts = summary.posts_enqueued,
                comments = summary.comments_enqueued,
                failed_topics = summary.failures.len(),
                "harvest run complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn enqueue_kind(&self, kind: ItemKind, records: &[Record]) -> Result<usize, PipelineError> {
        let topic = self.config.topic_for(kind);
        match self.enqueuer.enqueue(topic, records).await? {
            EnqueueOutcome::Skipped => Ok(0),
            EnqueueOutcome::Accepted { records: count, .. } => Ok(count),
        }
    }

    /// Enqueue a raw JSON array under `topic`; its kind follows the topic.
    pub async fn enqueue_json(&self, topic: &str, body: &[u8]) -> Result<EnqueueOutcome, PipelineError> {
        let kind = self.kind_of(topic)?;
        Ok(self.enqueuer.enqueue_json(topic, kind, body).await?)
    }

    pub async fn drain_once(&self, topic: &str) -> Result<DrainOutcome, PipelineError> {
        self.kind_of(topic)?;
        Ok(self.indexer.drain_once(topic, &self.writer).await?)
    }

    /// Drain `topic` up to the configured batch limit.
    pub async fn drain_topic(&self, topic: &str) -> Result<DrainSummary, PipelineError> {
        self.kind_of(topic)?;
        Ok(self
            .indexer
            .drain_all(topic, &self.writer, self.config.max_batches_per_drain)
            .await?)
    }

    /// Drain the post topic, then the comment topic.
    pub async fn drain_all_topics(&self) -> Result<Vec<DrainSummary>, PipelineError> {
        let mut out = Vec::with_capacity(ItemKind::ALL.len());
        for kind in ItemKind::ALL {
            out.push(self.drain_topic(self.config.topic_for(kind)).await?);
        }
        Ok(out)
    }

    /// Forget dedup entries older than the retention window.
    pub async fn compact_dedup(&self) -> Result<u64, StoreError> {
        let older_than = Utc::now() - ChronoDuration::days(self.config.dedup_retention_days.max(1));
        let removed = self.backends.dedup.compact(older_than).await?;
        info!(removed, %older_than, "dedup set compacted");
        Ok(removed)
    }

    fn kind_of(&self, topic: &str) -> Result<ItemKind, PipelineError> {
        self.config
            .kind_for_topic(topic)
            .ok_or_else(|| PipelineError::UnknownTopic(topic.to_string()))
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(self);
        let harvest = Job::new_async(&self.config.harvest_cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.harvest_once().await {
                    error!(error = %err, "scheduled harvest failed");
                }
            })
        })
        .with_context(|| format!("creating harvest job for cron {}", self.config.harvest_cron))?;
        sched.add(harvest).await.context("adding harvest job")?;

        let pipeline = Arc::clone(self);
        let drain = Job::new_async(&self.config.drain_cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.drain_all_topics().await {
                    error!(error = %err, "scheduled drain failed");
                }
            })
        })
        .with_context(|| format!("creating drain job for cron {}", self.config.drain_cron))?;
        sched.add(drain).await.context("adding drain job")?;

        let pipeline = Arc::clone(self);
        let compact = Job::new_async(&self.config.compact_cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.compact_dedup().await {
                    error!(error = %err, "scheduled dedup compaction failed");
                }
            })
        })
        .with_context(|| format!("creating compaction job for cron {}", self.config.compact_cron))?;
        sched.add(compact).await.context("adding compaction job")?;

        Ok(Some(sched))
    }
}

pub async fn run_harvest_once_from_env() -> Result<HarvestRunSummary> {
    let pipeline = Pipeline::connect(SyncConfig::from_env()).await?;
    Ok(pipeline.harvest_once().await?)
}

/// Drain one topic, or every known topic when `topic` is `None`.
pub async fn run_drain_from_env(topic: Option<&str>) -> Result<Vec<DrainSummary>> {
    let pipeline = Pipeline::connect(SyncConfig::from_env()).await?;
    let summaries = match topic {
        Some(topic) => vec![pipeline.drain_topic(topic).await?],
        None => pipeline.drain_all_topics().await?,
    };
    Ok(summaries)
}

pub async fn run_compact_from_env() -> Result<u64> {
    let pipeline = Pipeline::connect(SyncConfig::from_env()).await?;
    Ok(pipeline.compact_dedup().await?)
}

pub async fn run_migrations_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let pool = connect_pool(url, config.store_timeout()).await?;
    run_migrations(&pool).await?;
    Ok(())
}

/// Run the cron jobs until ctrl-c.
pub async fn run_scheduler_from_env() -> Result<()> {
    let mut config = SyncConfig::from_env();
    config.scheduler_enabled = true;
    let pipeline = Arc::new(Pipeline::connect(config).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        harvest = %pipeline.config().harvest_cron,
        drain = %pipeline.config().drain_cron,
        compact = %pipeline.config().compact_cron,
        "scheduler running"
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
