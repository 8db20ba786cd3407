//! HTTP trigger surface for the harvest pipeline.
//!
//! Every response is a short status string. 200 means the step ran, 204 that
//! there was nothing to do, 400 that the request itself was bad and 500 a
//! backend failure that is safe to retry.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rharvest_sync::{DrainOutcome, EnqueueOutcome, Pipeline, PipelineError, SyncConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "rharvest-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/harvest", post(harvest_handler))
        .route("/enqueue/{topic}", post(enqueue_handler))
        .route("/drain/{topic}", post(drain_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RHARVEST_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pipeline = Arc::new(Pipeline::connect(SyncConfig::from_env()).await?);
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!("scheduler started alongside web server");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "topics": state.pipeline.topics().len(),
    }))
    .into_response()
}

async fn harvest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.harvest_once().await {
        Ok(summary) if summary.all_topics_failed() => {
            error!(failed_topics = summary.failures.len(), "every topic failed upstream");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("all {} topics failed upstream", summary.topics),
            )
                .into_response()
        }
        Ok(summary) => {
            let mut message = format!(
                "harvested {} posts and {} comments",
                summary.posts_enqueued, summary.comments_enqueued
            );
            if !summary.failures.is_empty() {
                message.push_str(&format!("; {} topics failed upstream", summary.failures.len()));
            }
            (StatusCode::OK, message).into_response()
        }
        Err(err) => pipeline_error(err),
    }
}

async fn enqueue_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Response {
    match state.pipeline.enqueue_json(&topic, &body).await {
        Ok(EnqueueOutcome::Accepted { records, .. }) => {
            (StatusCode::OK, format!("accepted {records} records")).into_response()
        }
        Ok(EnqueueOutcome::Skipped) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn drain_handler(State(state): State<Arc<AppState>>, Path(topic): Path<String>) -> Response {
    match state.pipeline.drain_once(&topic).await {
        Ok(DrainOutcome::NoData) => StatusCode::NO_CONTENT.into_response(),
        Ok(DrainOutcome::Completed { indexed, .. }) => {
            (StatusCode::OK, format!("indexed {indexed} records")).into_response()
        }
        Ok(DrainOutcome::Quarantined { attempts }) => (
            StatusCode::OK,
            format!("batch quarantined after {attempts} attempts"),
        )
            .into_response(),
        Ok(DrainOutcome::PartialFailure { indexed, failed }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{failed} records failed ({indexed} indexed); batch kept for retry"),
        )
            .into_response(),
        Ok(DrainOutcome::Corrupt) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "corrupt batch left in queue".to_string(),
        )
            .into_response(),
        Err(err) => pipeline_error(err),
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    if err.is_client_error() {
        warn!(error = %err, "rejected request");
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }
    error!(error = %err, "pipeline step failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("transient backend failure: {err}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{Duration as ChronoDuration, Utc};
    use http_body_util::BodyExt;
    use rharvest_adapters::{StaticSource, Submission};
    use rharvest_storage::{BatchQueue, MemoryDedupSet, MemoryIndex, MemoryQueue};
    use rharvest_sync::{Backends, TopicRegistry};
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        queue: Arc<MemoryQueue>,
        index: Arc<MemoryIndex>,
    }

    async fn harness() -> Harness {
        let source = Arc::new(StaticSource::new(Utc::now()));
        source
            .push_submission(
                Submission {
                    id: "s1".into(),
                    author: Some("piccolo".into()),
                    created_utc: Utc::now() - ChronoDuration::hours(3),
                    subreddit: "Adelaide".into(),
                    title: "coffee on Rundle".into(),
                    selftext: String::new(),
                    score: 5,
                    num_comments: 0,
                    url: String::new(),
                },
                vec![],
            )
            .await;
        let queue = Arc::new(MemoryQueue::new());
        let index = Arc::new(MemoryIndex::new());
        let backends = Backends {
            source,
            dedup: Arc::new(MemoryDedupSet::new()),
            queue: queue.clone(),
            sink: index.clone(),
        };
        let config = SyncConfig {
            pacing_ms: 0,
            ..SyncConfig::default()
        };
        let pipeline = Pipeline::new(config, backends, TopicRegistry::default());
        Harness {
            app: app(AppState::new(Arc::new(pipeline))),
            queue,
            index,
        }
    }

    fn post_request(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    const TWO_POSTS: &str = r#"[
        {"id": "p1", "author": "a", "created_utc": "2025-05-09T08:00:00Z", "subreddit": "sydney", "title": "coffee", "score": 1},
        {"id": "p2", "author": "b", "created_utc": "2025-05-09T09:00:00Z", "subreddit": "sydney", "title": "more coffee", "score": 2}
    ]"#;

    #[tokio::test]
    async fn health_reports_topics() {
        let h = harness().await;
        let resp = h
            .app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(text(resp).await.contains("\"topics\":5"));
    }

    #[tokio::test]
    async fn enqueue_status_codes() {
        let h = harness().await;

        let accepted = h.app.clone().oneshot(post_request("/enqueue/rharvest", TWO_POSTS)).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(text(accepted).await, "accepted 2 records");

        let skipped = h.app.clone().oneshot(post_request("/enqueue/rharvest", "[]")).await.unwrap();
        assert_eq!(skipped.status(), StatusCode::NO_CONTENT);

        let malformed = h.app.clone().oneshot(post_request("/enqueue/rharvest", "{\"id\":1}")).await.unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let unknown = h.app.clone().oneshot(post_request("/enqueue/elsewhere", TWO_POSTS)).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        assert_eq!(h.queue.len("rharvest").await.unwrap(), 1);

        h.queue.set_unavailable(true);
        let down = h.app.oneshot(post_request("/enqueue/rharvest", TWO_POSTS)).await.unwrap();
        assert_eq!(down.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn drain_status_codes() {
        let h = harness().await;

        let empty = h.app.clone().oneshot(post_request("/drain/rharvest", "")).await.unwrap();
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);

        h.app.clone().oneshot(post_request("/enqueue/rharvest", TWO_POSTS)).await.unwrap();
        h.index.fail_id("p2").await;
        let partial = h.app.clone().oneshot(post_request("/drain/rharvest", "")).await.unwrap();
        assert_eq!(partial.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.queue.len("rharvest").await.unwrap(), 1);

        h.index.heal().await;
        let done = h.app.oneshot(post_request("/drain/rharvest", "")).await.unwrap();
        assert_eq!(done.status(), StatusCode::OK);
        assert_eq!(text(done).await, "indexed 2 records");
        assert_eq!(h.index.count("reddit-post").await, 2);
    }

    #[tokio::test]
    async fn harvest_fails_when_every_topic_fails_upstream() {
        let source = Arc::new(StaticSource::new(Utc::now()));
        for topic in TopicRegistry::default().topics {
            source.fail_subreddit(&topic.subreddit).await;
        }
        let backends = Backends::in_memory(source);
        let config = SyncConfig {
            pacing_ms: 0,
            ..SyncConfig::default()
        };
        let pipeline = Pipeline::new(config, backends, TopicRegistry::default());
        let app = app(AppState::new(Arc::new(pipeline)));

        let resp = app.oneshot(post_request("/harvest", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text(resp).await, "all 5 topics failed upstream");
    }

    #[tokio::test]
    async fn harvest_enqueues_new_posts() {
        let h = harness().await;
        let resp = h.app.oneshot(post_request("/harvest", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(resp).await, "harvested 1 posts and 0 comments");
        assert_eq!(h.queue.len("rharvest").await.unwrap(), 1);
        assert_eq!(h.queue.len("rharvestcomment").await.unwrap(), 0);
    }
}
