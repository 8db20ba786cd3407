use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rharvest_adapters::{Comment, FixtureSource, Sort, StaticSource, Submission, TimeWindow};
use rharvest_core::{decode_batch, encode_batch, ItemKind, PostRecord, Record, StoreError};
use rharvest_storage::{BatchQueue, DedupSet, MemoryDedupSet, MemoryIndex, MemoryQueue};
use rharvest_sync::{
    Backends, DrainOutcome, DrainPolicy, EnqueueError, EnqueueOutcome, Enqueuer, Harvester, Indexer, MarkSeen, Pipeline,
    PipelineError, SinkWriter, SyncConfig, TopicConfig, TopicRegistry,
};

const POSTS: &str = "posts";

fn post(id: &str, score: i64) -> Record {
    PostRecord {
        id: id.into(),
        author: "longblack".into(),
        created_utc: Utc.with_ymd_and_hms(2025, 5, 9, 7, 30, 0).single().unwrap(),
        subreddit: "melbourne".into(),
        title: format!("coffee {id}"),
        selftext: String::new(),
        score,
        num_comments: 0,
        url: String::new(),
    }
    .into()
}

fn no_quarantine() -> DrainPolicy {
    DrainPolicy {
        max_attempts: 0,
        ..DrainPolicy::default()
    }
}

fn writer(index: &Arc<MemoryIndex>) -> SinkWriter {
    SinkWriter::new(index.clone(), POSTS, "comments")
}

#[tokio::test]
async fn reindexing_same_record_keeps_one_document() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let enqueuer = Enqueuer::new(queue.clone());
    let indexer = Indexer::new(queue.clone(), no_quarantine());

    for _ in 0..2 {
        enqueuer.enqueue(POSTS, &[post("p1", 7)]).await.unwrap();
        indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    }

    assert_eq!(index.count(POSTS).await, 1);
    let stored = index.get(POSTS, "p1").await.unwrap();
    assert_eq!(stored.body, post("p1", 7).to_document());
}

#[tokio::test]
async fn partial_failure_keeps_whole_batch_then_completes() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let enqueuer = Enqueuer::new(queue.clone());
    let indexer = Indexer::new(queue.clone(), no_quarantine());
    let batch = vec![post("p1", 1), post("p2", 2), post("p3", 3)];

    enqueuer.enqueue(POSTS, &batch).await.unwrap();
    index.fail_id("p2").await;

    let first = indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    assert_eq!(first, DrainOutcome::PartialFailure { indexed: 2, failed: 1 });
    let stored = queue.contents(POSTS).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(decode_batch(&stored[0]).unwrap(), batch);

    index.heal().await;
    let second = indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    assert_eq!(second, DrainOutcome::Completed { indexed: 3, removed: 1 });
    assert!(queue.contents(POSTS).await.is_empty());

    // p1 and p3 were written twice, p2 once
    assert_eq!(index.get(POSTS, "p1").await.unwrap().version, 2);
    assert_eq!(index.get(POSTS, "p2").await.unwrap().version, 1);
}

#[tokio::test]
async fn failed_records_never_trigger_removal() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let indexer = Indexer::new(queue.clone(), no_quarantine());
    Enqueuer::new(queue.clone())
        .enqueue(POSTS, &[post("p1", 1), post("p2", 1)])
        .await
        .unwrap();
    index.fail_id("p1").await;

    for _ in 0..4 {
        indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    }

    assert_eq!(queue.ops().snapshot().removes, 0);
    assert_eq!(queue.len(POSTS).await.unwrap(), 1);
}

#[tokio::test]
async fn transient_failures_eventually_deliver_every_record() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let enqueuer = Enqueuer::new(queue.clone());
    let indexer = Indexer::new(queue.clone(), no_quarantine());
    let ids: Vec<String> = (0..6).map(|n| format!("p{n}")).collect();
    let records: Vec<Record> = ids.iter().map(|id| post(id, 0)).collect();

    enqueuer.enqueue(POSTS, &records[..3]).await.unwrap();
    enqueuer.enqueue(POSTS, &records[3..]).await.unwrap();
    index.fail_id("p1").await;
    index.fail_id("p4").await;

    let summary = indexer.drain_all(POSTS, &writer(&index), 10).await.unwrap();
    assert_eq!(summary.batches_completed, 0);

    index.heal().await;
    let summary = indexer.drain_all(POSTS, &writer(&index), 10).await.unwrap();
    assert_eq!(summary.batches_completed, 2);
    assert_eq!(summary.last, DrainOutcome::NoData);

    for id in &ids {
        assert!(index.get(POSTS, id).await.is_some(), "{id} missing from index");
    }
}

#[tokio::test]
async fn empty_enqueue_performs_no_queue_operations() {
    let queue = Arc::new(MemoryQueue::new());
    let outcome = Enqueuer::new(queue.clone()).enqueue(POSTS, &[]).await.unwrap();

    assert_eq!(outcome, EnqueueOutcome::Skipped);
    assert_eq!(queue.ops().total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_drains_remove_a_batch_once() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    queue
        .append(POSTS, &encode_batch(&[post("p1", 1), post("p2", 1)]).unwrap())
        .await
        .unwrap();
    let indexer = Indexer::new(queue.clone(), no_quarantine());

    let a = {
        let indexer = indexer.clone();
        let w = writer(&index);
        tokio::spawn(async move { indexer.drain_once(POSTS, &w).await })
    };
    let b = {
        let indexer = indexer.clone();
        let w = writer(&index);
        tokio::spawn(async move { indexer.drain_once(POSTS, &w).await })
    };
    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

    let mut removed_total = 0;
    for outcome in outcomes {
        match outcome {
            DrainOutcome::Completed { removed, .. } => removed_total += removed,
            DrainOutcome::NoData => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(removed_total, 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, DrainOutcome::Completed { removed: 1, .. })));
    assert_eq!(queue.len(POSTS).await.unwrap(), 0);
    assert_eq!(index.count(POSTS).await, 2);
}

#[tokio::test]
async fn duplicate_batches_are_removed_one_at_a_time() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let enqueuer = Enqueuer::new(queue.clone());
    let indexer = Indexer::new(queue.clone(), no_quarantine());

    enqueuer.enqueue(POSTS, &[post("p1", 1)]).await.unwrap();
    enqueuer.enqueue(POSTS, &[post("p1", 1)]).await.unwrap();

    indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    assert_eq!(queue.len(POSTS).await.unwrap(), 1);
    indexer.drain_once(POSTS, &writer(&index)).await.unwrap();
    assert_eq!(queue.len(POSTS).await.unwrap(), 0);
}

#[tokio::test]
async fn corrupt_batch_is_quarantined_after_repeated_drains() {
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    queue.append(POSTS, b"[{\"id\": 1}").await.unwrap();
    Enqueuer::new(queue.clone())
        .enqueue(POSTS, &[post("p9", 1)])
        .await
        .unwrap();
    let indexer = Indexer::new(
        queue.clone(),
        DrainPolicy {
            max_attempts: 2,
            ..DrainPolicy::default()
        },
    );

    assert_eq!(indexer.drain_once(POSTS, &writer(&index)).await.unwrap(), DrainOutcome::Corrupt);
    assert_eq!(
        indexer.drain_once(POSTS, &writer(&index)).await.unwrap(),
        DrainOutcome::Quarantined { attempts: 2 }
    );
    assert_eq!(queue.contents("posts:quarantine").await, vec![b"[{\"id\": 1}".to_vec()]);

    let summary = indexer.drain_all(POSTS, &writer(&index), 5).await.unwrap();
    assert_eq!(summary.batches_completed, 1);
    assert!(index.get(POSTS, "p9").await.is_some());
}

fn harvest_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).single().unwrap()
}

async fn seeded_source() -> Arc<StaticSource> {
    let source = Arc::new(StaticSource::new(harvest_now()));
    for (n, subreddit) in ["sydney", "perth"].iter().enumerate() {
        let id = format!("s{n}");
        source
            .push_submission(
                Submission {
                    id: id.clone(),
                    author: Some("ristretto".into()),
                    created_utc: harvest_now() - ChronoDuration::hours(n as i64 + 1),
                    subreddit: subreddit.to_string(),
                    title: "where to get coffee".into(),
                    selftext: String::new(),
                    score: 1,
                    num_comments: 1,
                    url: String::new(),
                },
                vec![Comment {
                    id: format!("c{n}"),
                    submission_id: id,
                    author: None,
                    created_utc: harvest_now(),
                    body: "anywhere but the airport".into(),
                    score: 0,
                }],
            )
            .await;
    }
    source
}

fn topics() -> Vec<TopicConfig> {
    ["sydney", "perth"]
        .into_iter()
        .map(|subreddit| TopicConfig {
            subreddit: subreddit.into(),
            query: "coffee".into(),
            enabled: true,
            sort: Sort::New,
            time_window: TimeWindow::Week,
            limit: None,
            include_seen_post_comments: false,
            max_new_posts: None,
        })
        .collect()
}

#[tokio::test]
async fn second_harvest_without_new_content_is_empty() {
    let dedup = Arc::new(MemoryDedupSet::new());
    let harvester = Harvester::new(seeded_source().await, dedup.clone()).with_mark_seen(MarkSeen::Eager);

    let first = harvester.harvest(&topics()).await.unwrap();
    assert_eq!(first.posts.len(), 2);
    assert_eq!(first.comments.len(), 2);

    let second = harvester.harvest(&topics()).await.unwrap();
    assert!(second.posts.is_empty());
    assert!(second.comments.is_empty());
    assert_eq!(dedup.len(ItemKind::Post).await.unwrap(), 2);
}

#[tokio::test]
async fn harvest_enqueue_drain_end_to_end() {
    let source = seeded_source().await;
    let dedup = Arc::new(MemoryDedupSet::new());
    let queue = Arc::new(MemoryQueue::new());
    let index = Arc::new(MemoryIndex::new());
    let harvester = Harvester::new(source.clone(), dedup.clone());
    let enqueuer = Enqueuer::new(queue.clone());
    let indexer = Indexer::new(queue.clone(), DrainPolicy::default());
    let writer = SinkWriter::new(index.clone(), "reddit-post", "reddit-comment");

    let report = harvester.harvest(&topics()).await.unwrap();
    assert!(matches!(
        enqueuer.enqueue("rharvest", &report.posts).await.unwrap(),
        EnqueueOutcome::Accepted { records: 2, .. }
    ));
    harvester.mark_seen(&report.posts).await.unwrap();
    enqueuer.enqueue("rharvestcomment", &report.comments).await.unwrap();
    harvester.mark_seen(&report.comments).await.unwrap();

    indexer.drain_all("rharvest", &writer, 10).await.unwrap();
    indexer.drain_all("rharvestcomment", &writer, 10).await.unwrap();

    assert_eq!(index.count("reddit-post").await, 2);
    assert_eq!(index.count("reddit-comment").await, 2);
    let comment = index.get("reddit-comment", "c1").await.unwrap();
    assert_eq!(comment.body["p_id"], "s1");
    assert_eq!(comment.body["subreddit"], "perth");

    assert!(harvester.harvest(&topics()).await.unwrap().is_empty());
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

#[tokio::test]
async fn checked_in_topics_and_fixtures_flow_through_pipeline() {
    let root = workspace_root();
    let config = SyncConfig {
        pacing_ms: 0,
        workspace_root: root.clone(),
        ..SyncConfig::default()
    };
    let topics = config.load_topics().unwrap();
    let source = Arc::new(FixtureSource::from_dir(root.join("fixtures")).unwrap());
    let pipeline = Pipeline::new(config, Backends::in_memory(source), topics);
    assert!(pipeline.topics().iter().all(|t| t.include_seen_post_comments));

    let summary = pipeline.harvest_once().await.unwrap();
    assert_eq!(summary.topics, 5);
    assert_eq!(summary.posts_enqueued, 3);
    assert_eq!(summary.comments_enqueued, 6);
    assert!(summary.failures.is_empty());

    let drained: usize = pipeline
        .drain_all_topics()
        .await
        .unwrap()
        .iter()
        .map(|s| s.records_indexed)
        .sum();
    assert_eq!(drained, 9);

    assert!(pipeline.harvest_once().await.unwrap().is_empty());
}

/// Memory queue whose appends to one topic fail while `down` is set.
struct TopicOutage {
    inner: MemoryQueue,
    topic: &'static str,
    down: AtomicBool,
}

#[async_trait]
impl BatchQueue for TopicOutage {
    async fn append(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        if topic == self.topic && self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{topic} is down")));
        }
        self.inner.append(topic, batch).await
    }

    async fn peek_oldest(&self, topic: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.peek_oldest(topic).await
    }

    async fn remove_if_present(&self, topic: &str, batch: &[u8], count: usize) -> Result<usize, StoreError> {
        self.inner.remove_if_present(topic, batch, count).await
    }

    async fn len(&self, topic: &str) -> Result<usize, StoreError> {
        self.inner.len(topic).await
    }

    async fn record_failure(&self, topic: &str, batch: &[u8]) -> Result<u32, StoreError> {
        self.inner.record_failure(topic, batch).await
    }

    async fn clear_failures(&self, topic: &str, batch: &[u8]) -> Result<(), StoreError> {
        self.inner.clear_failures(topic, batch).await
    }

    async fn quarantine(&self, topic: &str, batch: &[u8]) -> Result<bool, StoreError> {
        self.inner.quarantine(topic, batch).await
    }
}

#[tokio::test]
async fn failed_comment_enqueue_leaves_post_unseen() {
    let queue = Arc::new(TopicOutage {
        inner: MemoryQueue::new(),
        topic: "rharvestcomment",
        down: AtomicBool::new(true),
    });
    let dedup = Arc::new(MemoryDedupSet::new());
    let index = Arc::new(MemoryIndex::new());
    let backends = Backends {
        source: seeded_source().await,
        dedup: dedup.clone(),
        queue: queue.clone(),
        sink: index.clone(),
    };
    let config = SyncConfig {
        pacing_ms: 0,
        ..SyncConfig::default()
    };
    let pipeline = Pipeline::new(config, backends, TopicRegistry { topics: topics() });

    let err = pipeline.harvest_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Enqueue(EnqueueError::QueueUnavailable(_))));
    assert_eq!(dedup.len(ItemKind::Post).await.unwrap(), 0);
    assert_eq!(dedup.len(ItemKind::Comment).await.unwrap(), 0);
    assert_eq!(queue.len("rharvest").await.unwrap(), 1);

    queue.down.store(false, Ordering::SeqCst);
    let retry = pipeline.harvest_once().await.unwrap();
    assert_eq!(retry.posts_enqueued, 2);
    assert_eq!(retry.comments_enqueued, 2);
    assert_eq!(dedup.len(ItemKind::Post).await.unwrap(), 2);

    pipeline.drain_all_topics().await.unwrap();
    assert_eq!(index.count("reddit-post").await, 2);
    assert!(index.get("reddit-comment", "c0").await.is_some());
    assert!(index.get("reddit-comment", "c1").await.is_some());
}
