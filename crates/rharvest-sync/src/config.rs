//! Environment and `topics.yaml` configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rharvest_adapters::{SearchQuery, Sort, TimeWindow};
use rharvest_core::{ItemKind, COMMENT_TOPIC, POST_TOPIC};
use serde::Deserialize;

/// When harvested ids are written to the dedup set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkSeen {
    /// During harvest, before the batch is enqueued. A failed enqueue loses those items.
    Eager,
    /// Only after the Enqueuer accepted the batch. A failed enqueue re-harvests them.
    #[default]
    AfterEnqueue,
}

impl FromStr for MarkSeen {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(MarkSeen::Eager),
            "after-enqueue" | "after_enqueue" => Ok(MarkSeen::AfterEnqueue),
            other => anyhow::bail!("unknown mark-seen mode `{other}`"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicRegistry {
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub subreddit: String,
    pub query: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub sort: Sort,
    #[serde(default)]
    pub time_window: TimeWindow,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Also collect unseen comments under posts that were harvested earlier.
    #[serde(default)]
    pub include_seen_post_comments: bool,
    /// Stop the topic once this many unseen posts were collected in one run.
    #[serde(default)]
    pub max_new_posts: Option<usize>,
}

fn enabled_by_default() -> bool {
    true
}

impl TopicConfig {
    pub fn search_query(&self) -> SearchQuery {
        SearchQuery {
            subreddit: self.subreddit.clone(),
            query: self.query.clone(),
            sort: self.sort,
            time_window: self.time_window,
            limit: self.limit,
        }
    }
}

impl TopicRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: TopicRegistry = serde_yaml::from_str(text)?;
        if let Some(empty) = registry.topics.iter().find(|t| t.subreddit.trim().is_empty()) {
            anyhow::bail!("topic with query `{}` has no subreddit", empty.query);
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> Vec<TopicConfig> {
        self.topics.iter().filter(|t| t.enabled).cloned().collect()
    }
}

impl Default for TopicRegistry {
    /// The deployed harvest set: coffee threads from five subreddits, following
    /// new comments on known threads everywhere and at most ten new sydney posts per run.
    fn default() -> Self {
        let topics = ["Adelaide", "australia", "brisbane", "melbourne", "sydney"]
            .into_iter()
            .map(|subreddit| TopicConfig {
                subreddit: subreddit.to_string(),
                query: "coffee".to_string(),
                enabled: true,
                sort: Sort::New,
                time_window: TimeWindow::Week,
                limit: None,
                include_seen_post_comments: true,
                max_new_posts: (subreddit == "sydney").then_some(10),
            })
            .collect();
        Self { topics }
    }
}

#[derive(Debug, Clone)]
pub struct ElasticsearchSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub elasticsearch: Option<ElasticsearchSettings>,
    pub post_index: String,
    pub comment_index: String,
    pub post_topic: String,
    pub comment_topic: String,
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub record_timeout_secs: u64,
    pub pacing_ms: u64,
    pub topic_concurrency: usize,
    pub max_drain_attempts: u32,
    pub max_batches_per_drain: usize,
    pub dedup_retention_days: i64,
    pub mark_seen: MarkSeen,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
    pub drain_cron: String,
    pub compact_cron: String,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            elasticsearch: None,
            post_index: "reddit-post".to_string(),
            comment_index: "reddit-comment".to_string(),
            post_topic: POST_TOPIC.to_string(),
            comment_topic: COMMENT_TOPIC.to_string(),
            reddit_client_id: None,
            reddit_client_secret: None,
            fixtures_dir: None,
            user_agent: "rharvest-bot/0.1".to_string(),
            http_timeout_secs: 20,
            store_timeout_secs: 5,
            record_timeout_secs: 10,
            pacing_ms: 2000,
            topic_concurrency: 1,
            max_drain_attempts: 5,
            max_batches_per_drain: 50,
            dedup_retention_days: 30,
            mark_seen: MarkSeen::AfterEnqueue,
            scheduler_enabled: false,
            harvest_cron: "0 */30 * * * *".to_string(),
            drain_cron: "0 * * * * *".to_string(),
            compact_cron: "0 15 3 * * *".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env_opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let elasticsearch = env_opt("ES_CLIENT").map(|url| ElasticsearchSettings {
            url,
            username: env_opt("ES_USERNAME"),
            password: env_opt("ES_PASSWORD"),
            accept_invalid_certs: env_flag("ES_INSECURE_TLS"),
        });
        Self {
            database_url: env_opt("DATABASE_URL"),
            elasticsearch,
            post_index: env_opt("ES_REDDIT_INDEX").unwrap_or(defaults.post_index),
            comment_index: env_opt("ES_REDDIT_COMMENT_INDEX").unwrap_or(defaults.comment_index),
            post_topic: env_opt("RHARVEST_POST_TOPIC").unwrap_or(defaults.post_topic),
            comment_topic: env_opt("RHARVEST_COMMENT_TOPIC").unwrap_or(defaults.comment_topic),
            reddit_client_id: env_opt("REDDIT_CLIENT_ID"),
            reddit_client_secret: env_opt("REDDIT_CLIENT_SECRET"),
            fixtures_dir: env_opt("RHARVEST_FIXTURES_DIR").map(PathBuf::from),
            user_agent: env_opt("RHARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("RHARVEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            store_timeout_secs: env_parse("RHARVEST_STORE_TIMEOUT_SECS", defaults.store_timeout_secs),
            record_timeout_secs: env_parse("RHARVEST_RECORD_TIMEOUT_SECS", defaults.record_timeout_secs),
            pacing_ms: env_parse("RHARVEST_PACING_MS", defaults.pacing_ms),
            topic_concurrency: env_parse("RHARVEST_TOPIC_CONCURRENCY", defaults.topic_concurrency),
            max_drain_attempts: env_parse("RHARVEST_MAX_DRAIN_ATTEMPTS", defaults.max_drain_attempts),
            max_batches_per_drain: env_parse("RHARVEST_MAX_BATCHES_PER_DRAIN", defaults.max_batches_per_drain),
            dedup_retention_days: env_parse("RHARVEST_DEDUP_RETENTION_DAYS", defaults.dedup_retention_days),
            mark_seen: env_parse("RHARVEST_MARK_SEEN", defaults.mark_seen),
            scheduler_enabled: env_flag("RHARVEST_SCHEDULER_ENABLED"),
            harvest_cron: env_opt("HARVEST_CRON").unwrap_or(defaults.harvest_cron),
            drain_cron: env_opt("DRAIN_CRON").unwrap_or(defaults.drain_cron),
            compact_cron: env_opt("COMPACT_CRON").unwrap_or(defaults.compact_cron),
            workspace_root: env_opt("RHARVEST_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs.max(1))
    }

    /// `topics.yaml` under the workspace root, or the built-in set when absent.
    pub fn load_topics(&self) -> Result<TopicRegistry> {
        let path = self.workspace_root.join("topics.yaml");
        if path.exists() {
            TopicRegistry::load(&path)
        } else {
            Ok(TopicRegistry::default())
        }
    }

    pub fn topic_for(&self, kind: ItemKind) -> &str {
        match kind {
            ItemKind::Post => &self.post_topic,
            ItemKind::Comment => &self.comment_topic,
        }
    }

    pub fn kind_for_topic(&self, topic: &str) -> Option<ItemKind> {
        if topic == self.post_topic {
            Some(ItemKind::Post)
        } else if topic == self.comment_topic {
            Some(ItemKind::Comment)
        } else {
            None
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_defaults_fill_optional_fields() {
        let registry = TopicRegistry::parse(
            r#"
topics:
  - subreddit: sydney
    query: coffee
  - subreddit: perth
    query: coffee
    enabled: false
    sort: top
    time_window: month
    limit: 25
"#,
        )
        .expect("parse");
        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].sort, Sort::New);
        assert_eq!(enabled[0].time_window, TimeWindow::Week);
        assert_eq!(registry.topics[1].search_query().limit, Some(25));
    }

    #[test]
    fn registry_rejects_blank_subreddit() {
        assert!(TopicRegistry::parse("topics:\n  - subreddit: ''\n    query: coffee\n").is_err());
    }

    #[test]
    fn default_registry_matches_deployed_harvest_set() {
        let registry = TopicRegistry::default();
        assert_eq!(registry.topics.len(), 5);
        assert!(registry.topics.iter().all(|t| t.query == "coffee"));
        assert!(registry.topics.iter().all(|t| t.include_seen_post_comments));
        let capped: Vec<_> = registry
            .topics
            .iter()
            .filter_map(|t| t.max_new_posts.map(|cap| (t.subreddit.as_str(), cap)))
            .collect();
        assert_eq!(capped, vec![("sydney", 10)]);
    }

    #[test]
    fn checked_in_topics_match_default_registry() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../topics.yaml");
        let loaded = TopicRegistry::load(&path).expect("load topics.yaml");
        let defaults = TopicRegistry::default();
        assert_eq!(loaded.topics.len(), defaults.topics.len());
        for (a, b) in loaded.topics.iter().zip(&defaults.topics) {
            assert_eq!(a.subreddit, b.subreddit);
            assert_eq!(a.include_seen_post_comments, b.include_seen_post_comments);
            assert_eq!(a.max_new_posts, b.max_new_posts);
            assert_eq!(a.limit, b.limit);
        }
    }

    #[test]
    fn topics_route_to_kinds() {
        let config = SyncConfig::default();
        assert_eq!(config.kind_for_topic("rharvest"), Some(ItemKind::Post));
        assert_eq!(config.kind_for_topic("rharvestcomment"), Some(ItemKind::Comment));
        assert_eq!(config.kind_for_topic("other"), None);
        assert_eq!(config.topic_for(ItemKind::Comment), "rharvestcomment");
    }

    #[test]
    fn mark_seen_parses() {
        assert_eq!("eager".parse::<MarkSeen>().unwrap(), MarkSeen::Eager);
        assert_eq!("After-Enqueue".parse::<MarkSeen>().unwrap(), MarkSeen::AfterEnqueue);
        assert!("never".parse::<MarkSeen>().is_err());
    }
}
