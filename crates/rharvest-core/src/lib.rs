//! Core domain model for the harvest pipeline: item records, the batch codec
//! and the error taxonomy shared across crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{CoreError, IndexError, SourceError, StoreError};

pub const CRATE_NAME: &str = "rharvest-core";

/// Topic the deployed harvesters push post batches to.
pub const POST_TOPIC: &str = "rharvest";
/// Topic the deployed harvesters push comment batches to.
pub const COMMENT_TOPIC: &str = "rharvestcomment";

/// Item category. Scopes both dedup identity and queue topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Post,
    Comment,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Post, ItemKind::Comment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Post => "post",
            ItemKind::Comment => "comment",
        }
    }

    pub fn default_topic(&self) -> &'static str {
        match self {
            ItemKind::Post => POST_TOPIC,
            ItemKind::Comment => COMMENT_TOPIC,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Ok(ItemKind::Post),
            "comment" | "comments" => Ok(ItemKind::Comment),
            other => Err(CoreError::MalformedInput(format!("unknown item kind `{other}`"))),
        }
    }
}

/// Normalized submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub author: String,
    pub created_utc: DateTime<Utc>,
    pub subreddit: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    pub score: i64,
    #[serde(default)]
    pub num_comments: u64,
    #[serde(default)]
    pub url: String,
}

/// Normalized comment. `p_id` links to the owning post, `c_id` is the
/// comment's own id and `title` carries the parent post title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub p_id: String,
    pub c_id: String,
    pub created_utc: DateTime<Utc>,
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    pub body: String,
    pub score: i64,
}

/// A harvested item of either kind.
///
/// Serialized without a tag so batches keep the flat JSON shape consumers
/// already read. Post and comment shapes never overlap: a post needs `id`,
/// a comment needs `c_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    Post(PostRecord),
    Comment(CommentRecord),
}

impl Record {
    pub fn kind(&self) -> ItemKind {
        match self {
            Record::Post(_) => ItemKind::Post,
            Record::Comment(_) => ItemKind::Comment,
        }
    }

    /// Stable key used for both dedup and index upsert.
    pub fn id(&self) -> &str {
        match self {
            Record::Post(post) => &post.id,
            Record::Comment(comment) => &comment.c_id,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Record::Post(_) => None,
            Record::Comment(comment) => Some(&comment.p_id),
        }
    }

    pub fn created_utc(&self) -> DateTime<Utc> {
        match self {
            Record::Post(post) => post.created_utc,
            Record::Comment(comment) => comment.created_utc,
        }
    }

    /// Index document body: exactly the record's own fields.
    pub fn to_document(&self) -> serde_json::Value {
        // Plain structs of strings, integers and timestamps always serialize.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<PostRecord> for Record {
    fn from(value: PostRecord) -> Self {
        Record::Post(value)
    }
}

impl From<CommentRecord> for Record {
    fn from(value: CommentRecord) -> Self {
        Record::Comment(value)
    }
}

/// Serialize a batch as one opaque JSON array.
pub fn encode_batch(records: &[Record]) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(records).map_err(|err| CoreError::MalformedInput(err.to_string()))
}

/// Decode a previously enqueued batch. Mixed kinds are treated as corruption.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Record>, CoreError> {
    let records: Vec<Record> =
        serde_json::from_slice(bytes).map_err(|err| CoreError::Corrupt(err.to_string()))?;
    ensure_homogeneous(&records).map_err(CoreError::Corrupt)?;
    Ok(records)
}

/// Validate a raw JSON payload offered for enqueue under a topic of `kind`.
pub fn parse_input_batch(kind: ItemKind, bytes: &[u8]) -> Result<Vec<Record>, CoreError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| CoreError::MalformedInput(err.to_string()))?;
    if !value.is_array() {
        return Err(CoreError::MalformedInput(
            "expected a JSON array of records".to_string(),
        ));
    }
    let records: Vec<Record> = match kind {
        ItemKind::Post => serde_json::from_value::<Vec<PostRecord>>(value)
            .map(|items| items.into_iter().map(Record::from).collect()),
        ItemKind::Comment => serde_json::from_value::<Vec<CommentRecord>>(value)
            .map(|items| items.into_iter().map(Record::from).collect()),
    }
    .map_err(|err| CoreError::MalformedInput(format!("invalid {kind} record: {err}")))?;
    Ok(records)
}

fn ensure_homogeneous(records: &[Record]) -> Result<(), String> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let kind = first.kind();
    match records.iter().find(|r| r.kind() != kind) {
        Some(other) => Err(format!(
            "batch mixes {kind} and {} records (first mismatch: {})",
            other.kind(),
            other.id()
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 30, 0).single().unwrap()
    }

    fn post(id: &str) -> Record {
        Record::Post(PostRecord {
            id: id.to_string(),
            author: "flatwhite".into(),
            created_utc: ts(),
            subreddit: "melbourne".into(),
            title: "Best coffee near Flinders St?".into(),
            selftext: String::new(),
            score: 12,
            num_comments: 3,
            url: format!("https://www.reddit.com/r/melbourne/comments/{id}/"),
        })
    }

    fn comment(id: &str, parent: &str) -> Record {
        Record::Comment(CommentRecord {
            p_id: parent.to_string(),
            c_id: id.to_string(),
            created_utc: ts(),
            subreddit: "melbourne".into(),
            title: "Best coffee near Flinders St?".into(),
            body: "Try the laneways.".into(),
            score: 4,
        })
    }

    #[test]
    fn record_id_is_kind_specific() {
        assert_eq!(post("p1").id(), "p1");
        assert_eq!(comment("c1", "p1").id(), "c1");
        assert_eq!(comment("c1", "p1").parent_id(), Some("p1"));
        assert_eq!(post("p1").parent_id(), None);
    }

    #[test]
    fn decodes_legacy_comment_payload() {
        let raw = br#"[{"created_utc":"2025-05-01T09:30:00Z","p_id":"abc","c_id":"xyz",
            "body":"decent crema","subreddit":"sydney","title":"coffee?","score":2}]"#;
        let records = decode_batch(raw).expect("decode");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), ItemKind::Comment);
        assert_eq!(records[0].id(), "xyz");
    }

    #[test]
    fn mixed_batches_are_corrupt() {
        let bytes = encode_batch(&[post("p1"), comment("c1", "p1")]).unwrap();
        assert!(matches!(decode_batch(&bytes), Err(CoreError::Corrupt(_))));
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(matches!(decode_batch(b"{not json"), Err(CoreError::Corrupt(_))));
    }

    #[test]
    fn input_must_be_array_of_topic_kind() {
        let posts = encode_batch(&[post("p1")]).unwrap();
        assert!(parse_input_batch(ItemKind::Post, &posts).is_ok());
        assert!(matches!(
            parse_input_batch(ItemKind::Comment, &posts),
            Err(CoreError::MalformedInput(_))
        ));
        assert!(matches!(
            parse_input_batch(ItemKind::Post, br#"{"id":"p1"}"#),
            Err(CoreError::MalformedInput(_))
        ));
    }

    #[test]
    fn document_carries_record_fields() {
        let doc = post("p9").to_document();
        assert_eq!(doc["id"], "p9");
        assert_eq!(doc["num_comments"], 3);
        assert_eq!(doc["created_utc"], "2025-05-01T09:30:00Z");
    }

    #[test]
    fn kind_parses_plurals() {
        assert_eq!("Posts".parse::<ItemKind>().unwrap(), ItemKind::Post);
        assert_eq!("comment".parse::<ItemKind>().unwrap(), ItemKind::Comment);
        assert!("thread".parse::<ItemKind>().is_err());
    }
}
