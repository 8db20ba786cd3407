//! Rate-limited HTTP client shared by the content source and the index sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// How a failed attempt should be followed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Stop,
    /// Wait on the exponential schedule.
    Backoff,
    /// Upstream told us how long to wait.
    After(Duration),
}

/// 429 honors the upstream wait hint; other 5xx back off; everything else stops.
pub fn retry_for_status(status: StatusCode, headers: &HeaderMap) -> Retry {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return throttle_hint(headers).map_or(Retry::Backoff, Retry::After);
    }
    if status.is_server_error() {
        Retry::Backoff
    } else {
        Retry::Stop
    }
}

fn retry_for_transport(err: &reqwest::Error) -> Retry {
    if err.is_timeout() || err.is_connect() {
        Retry::Backoff
    } else {
        Retry::Stop
    }
}

/// `Retry-After` in seconds, else Reddit's `x-ratelimit-reset`.
fn throttle_hint(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset"].iter().find_map(|name| {
        let secs: f64 = headers.get(*name)?.to_str().ok()?.trim().parse().ok()?;
        (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longer upstream hints fail the request rather than stall the run.
    pub max_throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_throttle_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (zero-based), `None` to give up.
    pub fn delay(&self, attempt: usize, retry: Retry) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        match retry {
            Retry::Stop => None,
            Retry::Backoff => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
            }
            Retry::After(wait) => (wait <= self.max_throttle_wait).then_some(wait),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
            accept_invalid_certs: false,
        }
    }
}

/// Token bucket shared by every worker that talks to the same upstream.
/// One token comes back per `refill_every`, up to `capacity`; a bucket starts full.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<Refill>,
}

#[derive(Debug)]
struct Refill {
    tokens: u32,
    as_of: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(Refill {
                tokens: capacity.max(1),
                as_of: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every
                    .saturating_sub(now.saturating_duration_since(state.as_of))
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut Refill, now: Instant) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.as_of = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.as_of);
        let period = self.refill_every.as_nanos();
        let due = (elapsed.as_nanos() / period).min(u128::from(u32::MAX)) as u32;
        if due == 0 {
            return;
        }
        state.tokens = state.tokens.saturating_add(due).min(self.capacity);
        // the unfinished interval carries over
        let carried = Duration::from_nanos((elapsed.as_nanos() % period) as u64);
        state.as_of = now - carried;
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }

    pub fn is_throttled(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    /// Send the request `build` produces, retrying per the policy.
    /// `build` runs once per attempt.
    pub async fn send<F>(&self, label: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let span = info_span!("http_fetch", label, url);
        self.send_with_retries(build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::HttpStatus {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                url: String::new(),
                body: "fetcher closed".to_string(),
            })?;

        let mut attempt = 0usize;
        loop {
            let resp = match build(&self.client).send().await {
                Ok(resp) => resp,
                Err(err) => match self.retry.delay(attempt, retry_for_transport(&err)) {
                    Some(wait) => {
                        debug!(error = %err, attempt, ?wait, "transport error; retrying");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    None => return Err(FetchError::Request(err)),
                },
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            let retry = retry_for_status(status, resp.headers());
            if let Some(wait) = self.retry.delay(attempt, retry) {
                if matches!(retry, Retry::After(_)) {
                    warn!(%status, ?wait, "throttled upstream; waiting as asked");
                } else {
                    debug!(%status, attempt, ?wait, "retryable status; retrying");
                }
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body: truncate(&body, 512),
            });
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
