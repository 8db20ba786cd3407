//! Reddit API adapter using application-only OAuth.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rharvest_core::SourceError;
use rharvest_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{ContentSource, SearchQuery, Comment, Submission};

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;
const MORECHILDREN_CHUNK: usize = 100;
const MAX_MORE_ROUNDS: usize = 50;

#[derive(Debug, Clone)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub api_base: String,
}

impl RedditConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            api_base: "https://oauth.reddit.com".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

pub struct RedditSource {
    http: HttpFetcher,
    config: RedditConfig,
    token: Mutex<Option<CachedToken>>,
}

impl RedditSource {
    pub fn new(http: HttpFetcher, config: RedditConfig) -> Self {
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .send("reddit.token", &self.config.auth_url, |client| {
                client
                    .post(&self.config.auth_url)
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .form(&[("grant_type", "client_credentials")])
            })
            .await
            .map_err(map_fetch_error)?;
        let token: TokenResponse = response.json().map_err(map_fetch_error)?;

        // Refresh a minute early so in-flight requests never carry an expired token.
        let ttl = Duration::from_secs(token.expires_in.saturating_sub(60).max(1));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        debug!(ttl_secs = ttl.as_secs(), "refreshed reddit access token");
        Ok(token.access_token)
    }

    async fn get_json(&self, label: &str, url: &str, query: &[(&str, String)]) -> Result<JsonValue, SourceError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .send(label, url, |client| client.get(url).bearer_auth(&token).query(query))
            .await
            .map_err(map_fetch_error)?;
        response.json().map_err(map_fetch_error)
    }

    async fn expand_more(&self, submission_id: &str, mut pending: Vec<String>) -> Result<Vec<Comment>, SourceError> {
        let url = format!("{}/api/morechildren", self.config.api_base);
        let mut out = Vec::new();
        let mut rounds = 0;
        while !pending.is_empty() && rounds < MAX_MORE_ROUNDS {
            rounds += 1;
            let take = pending.len().min(MORECHILDREN_CHUNK);
            let chunk: Vec<String> = pending.drain(..take).collect();
            let body = self
                .get_json(
                    "reddit.morechildren",
                    &url,
                    &[
                        ("api_type", "json".to_string()),
                        ("link_id", format!("t3_{submission_id}")),
                        ("children", chunk.join(",")),
                        ("raw_json", "1".to_string()),
                    ],
                )
                .await?;
            let things = body
                .pointer("/json/data/things")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            let mut more = Vec::new();
            collect_things(&things, submission_id, &mut out, &mut more)?;
            pending.extend(more);
        }
        Ok(out)
    }
}

#[async_trait]
impl ContentSource for RedditSource {
    fn source_id(&self) -> &'static str {
        "reddit"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Submission>, SourceError> {
        let url = format!("{}/r/{}/search", self.config.api_base, query.subreddit);
        let mut out = Vec::new();
        let mut after: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let remaining = query.limit.map(|l| l.saturating_sub(out.len()));
            if remaining == Some(0) {
                break;
            }
            let page_size = remaining.unwrap_or(PAGE_SIZE).min(PAGE_SIZE);
            let mut params = vec![
                ("q", query.query.clone()),
                ("restrict_sr", "1".to_string()),
                ("sort", query.sort.as_param().to_string()),
                ("t", query.time_window.as_param().to_string()),
                ("limit", page_size.to_string()),
                ("raw_json", "1".to_string()),
            ];
            if let Some(cursor) = &after {
                params.push(("after", cursor.clone()));
            }

            let body = self.get_json("reddit.search", &url, &params).await?;
            let (page, next) = parse_search_listing(&body)?;
            out.extend(page);
            match next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        info!(query = %query, submissions = out.len(), "reddit search complete");
        Ok(out)
    }

    async fn comments_of(&self, submission_id: &str) -> Result<Vec<Comment>, SourceError> {
        let url = format!("{}/comments/{}", self.config.api_base, submission_id);
        let body = self
            .get_json(
                "reddit.comments",
                &url,
                &[("limit", "500".to_string()), ("raw_json", "1".to_string())],
            )
            .await?;
        let (mut comments, more) = flatten_comment_listing(&body, submission_id)?;
        if !more.is_empty() {
            comments.extend(self.expand_more(submission_id, more).await?);
        }
        Ok(comments)
    }
}

fn map_fetch_error(err: FetchError) -> SourceError {
    if err.is_throttled() {
        return SourceError::Throttled(err.to_string());
    }
    match err {
        FetchError::Decode { .. } => SourceError::Malformed(err.to_string()),
        other => SourceError::Unavailable(other.to_string()),
    }
}

fn timestamp(value: Option<&JsonValue>) -> Result<DateTime<Utc>, SourceError> {
    let secs = value
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| SourceError::Malformed("missing created_utc".into()))?;
    DateTime::<Utc>::from_timestamp(secs.trunc() as i64, 0)
        .ok_or_else(|| SourceError::Malformed(format!("created_utc out of range: {secs}")))
}

fn str_field(data: &JsonValue, key: &str) -> String {
    data.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn author_field(data: &JsonValue) -> Option<String> {
    data.get("author")
        .and_then(JsonValue::as_str)
        .filter(|a| *a != "[deleted]")
        .map(str::to_string)
}

/// Parse one page of a search listing into submissions and the `after` cursor.
pub fn parse_search_listing(body: &JsonValue) -> Result<(Vec<Submission>, Option<String>), SourceError> {
    let data = body
        .get("data")
        .ok_or_else(|| SourceError::Malformed("search listing without data".into()))?;
    let children = data
        .get("children")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    let mut submissions = Vec::with_capacity(children.len());
    for child in &children {
        if child.get("kind").and_then(JsonValue::as_str) != Some("t3") {
            continue;
        }
        let Some(d) = child.get("data") else { continue };
        let id = str_field(d, "id");
        if id.is_empty() {
            return Err(SourceError::Malformed("submission without id".into()));
        }
        submissions.push(Submission {
            id,
            author: author_field(d),
            created_utc: timestamp(d.get("created_utc"))?,
            subreddit: str_field(d, "subreddit"),
            title: str_field(d, "title"),
            selftext: str_field(d, "selftext"),
            score: d.get("score").and_then(JsonValue::as_i64).unwrap_or_default(),
            num_comments: d.get("num_comments").and_then(JsonValue::as_u64).unwrap_or_default(),
            url: str_field(d, "url"),
        });
    }

    let after = data
        .get("after")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok((submissions, after))
}

/// Flatten the `/comments/{id}` response depth-first.
/// Returns the comments plus ids of `more` stubs still to expand.
pub fn flatten_comment_listing(
    body: &JsonValue,
    submission_id: &str,
) -> Result<(Vec<Comment>, Vec<String>), SourceError> {
    // Response is [submission listing, comment listing].
    let listing = body
        .as_array()
        .and_then(|parts| parts.get(1))
        .ok_or_else(|| SourceError::Malformed("comments response is not a two-part listing".into()))?;
    let children = listing
        .pointer("/data/children")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    let mut comments = Vec::new();
    let mut more = Vec::new();
    collect_things(&children, submission_id, &mut comments, &mut more)?;
    Ok((comments, more))
}

fn collect_things(
    things: &[JsonValue],
    submission_id: &str,
    comments: &mut Vec<Comment>,
    more: &mut Vec<String>,
) -> Result<(), SourceError> {
    for thing in things {
        let kind = thing.get("kind").and_then(JsonValue::as_str).unwrap_or_default();
        let Some(data) = thing.get("data") else { continue };
        match kind {
            "t1" => {
                let id = str_field(data, "id");
                if id.is_empty() {
                    return Err(SourceError::Malformed(format!("comment without id under {submission_id}")));
                }
                comments.push(Comment {
                    id,
                    submission_id: submission_id.to_string(),
                    author: author_field(data),
                    created_utc: timestamp(data.get("created_utc"))?,
                    body: str_field(data, "body"),
                    score: data.get("score").and_then(JsonValue::as_i64).unwrap_or_default(),
                });
                if let Some(replies) = data
                    .pointer("/replies/data/children")
                    .and_then(JsonValue::as_array)
                {
                    collect_things(replies, submission_id, comments, more)?;
                }
            }
            "more" => {
                if let Some(ids) = data.get("children").and_then(JsonValue::as_array) {
                    more.extend(ids.iter().filter_map(JsonValue::as_str).map(str::to_string));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
