//! Content source contracts and adapters (Reddit API, fixtures, in-memory).

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rharvest_core::SourceError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub mod fixture;
pub mod reddit;

pub use fixture::{FixtureBundle, FixtureSource};
pub use reddit::{RedditConfig, RedditSource};

pub const CRATE_NAME: &str = "rharvest-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sort {
    #[default]
    New,
    Relevance,
    Top,
}

impl Sort {
    pub fn as_param(&self) -> &'static str {
        match self {
            Sort::New => "new",
            Sort::Relevance => "relevance",
            Sort::Top => "top",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Hour,
    Day,
    #[default]
    Week,
    Month,
    Year,
    All,
}

impl TimeWindow {
    pub fn as_param(&self) -> &'static str {
        match self {
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
            TimeWindow::Month => "month",
            TimeWindow::Year => "year",
            TimeWindow::All => "all",
        }
    }

    pub fn duration(&self) -> Option<ChronoDuration> {
        match self {
            TimeWindow::Hour => Some(ChronoDuration::hours(1)),
            TimeWindow::Day => Some(ChronoDuration::days(1)),
            TimeWindow::Week => Some(ChronoDuration::weeks(1)),
            TimeWindow::Month => Some(ChronoDuration::days(31)),
            TimeWindow::Year => Some(ChronoDuration::days(366)),
            TimeWindow::All => None,
        }
    }
}

/// One topic query: a search term scoped to a subreddit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub subreddit: String,
    pub query: String,
    #[serde(default)]
    pub sort: Sort,
    #[serde(default)]
    pub time_window: TimeWindow,
    /// Cap on submissions returned across pages; `None` walks every page.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r/{} \"{}\"", self.subreddit, self.query)
    }
}

/// Submission as the content source reports it, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub subreddit: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: u64,
    #[serde(default)]
    pub url: String,
}

/// Comment from a submission's tree, flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub submission_id: String,
    #[serde(default)]
    pub author: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub body: String,
    #[serde(default)]
    pub score: i64,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Matching submissions, ordered per `query.sort`.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Submission>, SourceError>;

    /// Every comment under `submission_id`, depth-first.
    async fn comments_of(&self, submission_id: &str) -> Result<Vec<Comment>, SourceError>;
}

/// True when `text` contains `query` ignoring ASCII case. An empty query matches all.
pub fn matches_query(query: &str, text: &str) -> bool {
    let needle = query.trim().to_ascii_lowercase();
    needle.is_empty() || text.to_ascii_lowercase().contains(&needle)
}

/// Apply window, ordering and cap to a candidate list. Shared by offline sources.
pub fn select_submissions(
    mut candidates: Vec<Submission>,
    query: &SearchQuery,
    now: DateTime<Utc>,
) -> Vec<Submission> {
    let cutoff = query.time_window.duration().map(|d| now - d);
    candidates.retain(|s| {
        s.subreddit.eq_ignore_ascii_case(&query.subreddit)
            && cutoff.map(|c| s.created_utc >= c).unwrap_or(true)
            && (matches_query(&query.query, &s.title) || matches_query(&query.query, &s.selftext))
    });
    match query.sort {
        Sort::New => candidates.sort_by(|a, b| b.created_utc.cmp(&a.created_utc)),
        Sort::Top => candidates.sort_by(|a, b| b.score.cmp(&a.score)),
        Sort::Relevance => {}
    }
    if let Some(limit) = query.limit {
        candidates.truncate(limit);
    }
    candidates
}

#[derive(Debug, Default)]
struct StaticState {
    submissions: Vec<Submission>,
    comments: HashMap<String, Vec<Comment>>,
    failing_subreddits: Vec<String>,
    failing_comment_threads: Vec<String>,
    search_calls: usize,
}

/// In-memory source whose content can be changed between harvests.
#[derive(Debug)]
pub struct StaticSource {
    now: DateTime<Utc>,
    state: Mutex<StaticState>,
}

impl StaticSource {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            state: Mutex::new(StaticState::default()),
        }
    }

    pub async fn push_submission(&self, submission: Submission, comments: Vec<Comment>) {
        let mut state = self.state.lock().await;
        state
            .comments
            .entry(submission.id.clone())
            .or_default()
            .extend(comments);
        state.submissions.push(submission);
    }

    pub async fn push_comment(&self, comment: Comment) {
        let mut state = self.state.lock().await;
        state
            .comments
            .entry(comment.submission_id.clone())
            .or_default()
            .push(comment);
    }

    pub async fn fail_subreddit(&self, subreddit: &str) {
        self.state.lock().await.failing_subreddits.push(subreddit.to_string());
    }

    pub async fn fail_comments_of(&self, submission_id: &str) {
        self.state
            .lock()
            .await
            .failing_comment_threads
            .push(submission_id.to_string());
    }

    pub async fn recover(&self) {
        let mut state = self.state.lock().await;
        state.failing_subreddits.clear();
        state.failing_comment_threads.clear();
    }

    pub async fn search_calls(&self) -> usize {
        self.state.lock().await.search_calls
    }
}

#[async_trait]
impl ContentSource for StaticSource {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Submission>, SourceError> {
        let mut state = self.state.lock().await;
        state.search_calls += 1;
        if state
            .failing_subreddits
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&query.subreddit))
        {
            return Err(SourceError::Unavailable(format!("search failed for {query}")));
        }
        Ok(select_submissions(state.submissions.clone(), query, self.now))
    }

    async fn comments_of(&self, submission_id: &str) -> Result<Vec<Comment>, SourceError> {
        let state = self.state.lock().await;
        if state.failing_comment_threads.iter().any(|s| s == submission_id) {
            return Err(SourceError::Unavailable(format!(
                "comments unavailable for {submission_id}"
            )));
        }
        Ok(state.comments.get(submission_id).cloned().unwrap_or_default())
    }
}
