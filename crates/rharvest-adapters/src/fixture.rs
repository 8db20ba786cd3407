//! Fixture-backed content source for offline runs and tests.
//!
//! A fixture directory holds one `*.json` bundle per capture. Each bundle
//! lists submissions and the flattened comments that belonged to them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rharvest_core::SourceError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{select_submissions, Comment, ContentSource, SearchQuery, Submission};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    /// Time windows are evaluated relative to this instant, not wall-clock now.
    pub captured_at: DateTime<Utc>,
    pub submissions: Vec<Submission>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
    bundles: Vec<FixtureBundle>,
    comments: HashMap<String, Vec<Comment>>,
}

impl FixtureSource {
    pub fn from_dir(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut paths = fs::read_dir(&root)
            .with_context(|| format!("reading fixture dir {}", root.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect::<Vec<_>>();
        paths.sort();

        let mut bundles = Vec::with_capacity(paths.len());
        for path in &paths {
            bundles.push(load_fixture_bundle(path)?);
        }
        debug!(root = %root.display(), bundles = bundles.len(), "loaded fixtures");
        Ok(Self::from_bundles(root, bundles))
    }

    pub fn from_bundles(root: PathBuf, bundles: Vec<FixtureBundle>) -> Self {
        let mut comments: HashMap<String, Vec<Comment>> = HashMap::new();
        for bundle in &bundles {
            for comment in &bundle.comments {
                comments
                    .entry(comment.submission_id.clone())
                    .or_default()
                    .push(comment.clone());
            }
        }
        Self {
            root,
            bundles,
            comments,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ContentSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Submission>, SourceError> {
        let mut out = Vec::new();
        for bundle in &self.bundles {
            out.extend(select_submissions(
                bundle.submissions.clone(),
                &SearchQuery {
                    limit: None,
                    ..query.clone()
                },
                bundle.captured_at,
            ));
        }
        let mut seen = std::collections::HashSet::new();
        out.retain(|s| seen.insert(s.id.clone()));
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn comments_of(&self, submission_id: &str) -> Result<Vec<Comment>, SourceError> {
        Ok(self.comments.get(submission_id).cloned().unwrap_or_default())
    }
}
