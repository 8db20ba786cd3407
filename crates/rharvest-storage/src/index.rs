//! Document sink keyed by stable id. Every write is an idempotent upsert.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use rharvest_core::IndexError;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::http::{FetchError, HttpFetcher};

#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Write `document` under `id`, replacing any previous version.
    /// Returns the store's version counter for the document.
    async fn upsert(&self, index: &str, id: &str, document: &serde_json::Value) -> Result<u64, IndexError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: u64,
    pub body: serde_json::Value,
}

/// In-process index with injectable per-id failures.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: Mutex<HashMap<(String, String), StoredDocument>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert of `id` fail until [`MemoryIndex::heal`] is called.
    pub async fn fail_id(&self, id: &str) {
        self.failing.lock().await.insert(id.to_string());
    }

    pub async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    pub async fn get(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.docs
            .lock()
            .await
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn count(&self, index: &str) -> usize {
        self.docs
            .lock()
            .await
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }
}

#[async_trait]
impl IndexSink for MemoryIndex {
    async fn upsert(&self, index: &str, id: &str, document: &serde_json::Value) -> Result<u64, IndexError> {
        if self.failing.lock().await.contains(id) {
            return Err(IndexError::Unavailable(format!("injected failure for {id}")));
        }
        let mut docs = self.docs.lock().await;
        let entry = docs
            .entry((index.to_string(), id.to_string()))
            .or_insert(StoredDocument {
                version: 0,
                body: serde_json::Value::Null,
            });
        entry.version += 1;
        entry.body = document.clone();
        Ok(entry.version)
    }
}

#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// `PUT /{index}/_doc/{id}` against an Elasticsearch cluster.
#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    http: HttpFetcher,
    config: ElasticsearchConfig,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_version")]
    version: u64,
}

impl ElasticsearchIndex {
    pub fn new(http: HttpFetcher, config: ElasticsearchConfig) -> Self {
        Self { http, config }
    }

    fn document_url(&self, index: &str, id: &str) -> Result<Url, IndexError> {
        let mut url = Url::parse(self.config.base_url.trim_end_matches('/'))
            .map_err(|err| IndexError::Unavailable(format!("invalid index url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| IndexError::Unavailable("index url cannot be a base".into()))?
            .pop_if_empty()
            .extend([index, "_doc", id]);
        Ok(url)
    }
}

#[async_trait]
impl IndexSink for ElasticsearchIndex {
    async fn upsert(&self, index: &str, id: &str, document: &serde_json::Value) -> Result<u64, IndexError> {
        let url = self.document_url(index, id)?;
        let response = self
            .http
            .send("index.upsert", url.as_str(), |client| {
                let req = client.put(url.clone()).json(document);
                match &self.config.username {
                    Some(user) => req.basic_auth(user, self.config.password.as_ref()),
                    None => req,
                }
            })
            .await
            .map_err(|err| map_fetch_error(id, err))?;
        let parsed: IndexResponse = response
            .json()
            .map_err(|err| IndexError::Rejected {
                id: id.to_string(),
                reason: err.to_string(),
            })?;
        Ok(parsed.version)
    }
}

fn map_fetch_error(id: &str, err: FetchError) -> IndexError {
    if err.is_timeout() {
        return IndexError::Unavailable(format!("timeout indexing {id}: {err}"));
    }
    match err.status().and_then(|s| StatusCode::from_u16(s).ok()) {
        Some(status) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            IndexError::Unavailable(err.to_string())
        }
        Some(_) => IndexError::Rejected {
            id: id.to_string(),
            reason: err.to_string(),
        },
        None => IndexError::Unavailable(err.to_string()),
    }
}
