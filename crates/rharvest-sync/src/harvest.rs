//! Harvester: turns topic queries into normalized post and comment records,
//! filtering out anything the dedup set has already seen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rharvest_adapters::{Comment, ContentSource, SearchQuery, Submission};
use rharvest_core::{CommentRecord, ItemKind, PostRecord, Record, SourceError, StoreError};
use rharvest_storage::{DedupSet, SimpleTokenBucket};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{MarkSeen, TopicConfig};

const DELETED_AUTHOR: &str = "[deleted]";

/// Pacing between comment-tree fetches.
#[derive(Debug, Clone, Default)]
pub enum Pacer {
    #[default]
    Off,
    /// Sleep between consecutive submissions of one topic.
    Fixed(Duration),
    /// Token bucket shared by every topic worker hitting the same upstream.
    Shared(Arc<SimpleTokenBucket>),
}

impl Pacer {
    /// One fetch per `every`, with the first one free.
    pub fn token_bucket(every: Duration) -> Self {
        Pacer::Shared(Arc::new(SimpleTokenBucket::new(1, every)))
    }

    async fn wait(&self, fetches_so_far: usize) {
        match self {
            Pacer::Off => {}
            Pacer::Fixed(delay) => {
                if fetches_so_far > 0 {
                    tokio::time::sleep(*delay).await;
                }
            }
            Pacer::Shared(bucket) => bucket.take().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicFailure {
    pub topic: String,
    pub error: String,
}

impl TopicFailure {
    fn new(query: &SearchQuery, err: &SourceError) -> Self {
        Self {
            topic: query.to_string(),
            error: err.to_string(),
        }
    }
}

/// Records gathered by one harvest call plus the topics that failed upstream.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub posts: Vec<Record>,
    pub comments: Vec<Record>,
    pub failures: Vec<TopicFailure>,
}

impl HarvestReport {
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty() && self.comments.is_empty()
    }

    fn absorb(&mut self, part: TopicHarvest, taken: &mut HashSet<(ItemKind, String)>) {
        for record in part.posts {
            if taken.insert((ItemKind::Post, record.id().to_string())) {
                self.posts.push(record);
            }
        }
        for record in part.comments {
            if taken.insert((ItemKind::Comment, record.id().to_string())) {
                self.comments.push(record);
            }
        }
        self.failures.extend(part.failure);
    }
}

#[derive(Debug, Default)]
struct TopicHarvest {
    posts: Vec<Record>,
    comments: Vec<Record>,
    failure: Option<TopicFailure>,
}

pub struct Harvester {
    source: Arc<dyn ContentSource>,
    dedup: Arc<dyn DedupSet>,
    mark_seen: MarkSeen,
    pacer: Pacer,
    concurrency: usize,
}

impl Harvester {
    pub fn new(source: Arc<dyn ContentSource>, dedup: Arc<dyn DedupSet>) -> Self {
        Self {
            source,
            dedup,
            mark_seen: MarkSeen::default(),
            pacer: Pacer::Off,
            concurrency: 1,
        }
    }

    pub fn with_mark_seen(mut self, mark_seen: MarkSeen) -> Self {
        self.mark_seen = mark_seen;
        self
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// How many topics are harvested at once. Submissions within a topic stay sequential.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn mark_seen_mode(&self) -> MarkSeen {
        self.mark_seen
    }

    /// Harvest every topic. Upstream errors are scoped to their topic and
    /// reported in [`HarvestReport::failures`]; a dedup set failure aborts the
    /// whole call.
    pub async fn harvest(&self, topics: &[TopicConfig]) -> Result<HarvestReport, StoreError> {
        let futures: Vec<_> = topics
            .iter()
            .map(|topic| {
                let span = info_span!("harvest_topic", subreddit = %topic.subreddit, query = %topic.query);
                self.harvest_topic(topic).instrument(span)
            })
            .collect();
        let results: Vec<Result<TopicHarvest, StoreError>> = stream::iter(futures)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = HarvestReport::default();
        let mut taken = HashSet::new();
        for result in results {
            report.absorb(result?, &mut taken);
        }
        info!(
            topics = topics.len(),
            posts = report.posts.len(),
            comments = report.comments.len(),
            failed_topics = report.failures.len(),
            "harvest finished"
        );
        Ok(report)
    }

    /// Record every id in `records` in the dedup set.
    pub async fn mark_seen(&self, records: &[Record]) -> Result<(), StoreError> {
        for record in records {
            self.dedup
                .add(record.kind(), record.id(), record.created_utc())
                .await?;
        }
        Ok(())
    }

    async fn harvest_topic(&self, topic: &TopicConfig) -> Result<TopicHarvest, StoreError> {
        let query = topic.search_query();
        let mut out = TopicHarvest::default();

        let submissions = match self.source.search(&query).await {
            Ok(submissions) => submissions,
            Err(err) => {
                warn!(error = %err, "search failed; skipping topic");
                out.failure = Some(TopicFailure::new(&query, &err));
                return Ok(out);
            }
        };
        debug!(candidates = submissions.len(), source = self.source.source_id(), "search returned");

        let mut fetches = 0usize;
        for submission in &submissions {
            let post_seen = self.dedup.contains(ItemKind::Post, &submission.id).await?;
            if post_seen && !topic.include_seen_post_comments {
                continue;
            }

            self.pacer.wait(fetches).await;
            fetches += 1;
            let comments = match self.source.comments_of(&submission.id).await {
                Ok(comments) => comments,
                Err(err) => {
                    warn!(submission = %submission.id, error = %err, "comment fetch failed; aborting topic");
                    out.failure = Some(TopicFailure::new(&query, &err));
                    break;
                }
            };

            let mut fresh = Vec::new();
            for comment in &comments {
                if !self.dedup.contains(ItemKind::Comment, &comment.id).await? {
                    fresh.push(normalize_comment(submission, comment));
                }
            }
            let post = (!post_seen).then(|| normalize_post(submission));

            if self.mark_seen == MarkSeen::Eager {
                self.mark_seen(post.as_slice()).await?;
                self.mark_seen(&fresh).await?;
            }
            out.posts.extend(post);
            out.comments.extend(fresh);
            if topic.max_new_posts.is_some_and(|cap| out.posts.len() >= cap) {
                debug!(posts = out.posts.len(), "new-post cap reached");
                break;
            }
        }
        Ok(out)
    }
}

pub fn normalize_post(submission: &Submission) -> Record {
    PostRecord {
        id: submission.id.clone(),
        author: submission
            .author
            .clone()
            .unwrap_or_else(|| DELETED_AUTHOR.to_string()),
        created_utc: submission.created_utc,
        subreddit: submission.subreddit.clone(),
        title: submission.title.clone(),
        selftext: submission.selftext.clone(),
        score: submission.score,
        num_comments: submission.num_comments,
        url: submission.url.clone(),
    }
    .into()
}

pub fn normalize_comment(submission: &Submission, comment: &Comment) -> Record {
    CommentRecord {
        p_id: submission.id.clone(),
        c_id: comment.id.clone(),
        created_utc: comment.created_utc,
        subreddit: submission.subreddit.clone(),
        title: submission.title.clone(),
        body: comment.body.clone(),
        score: comment.score,
    }
    .into()
}
