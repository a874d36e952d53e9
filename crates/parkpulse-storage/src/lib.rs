//! Raw payload archive + HTTP fetch utilities for ParkPulse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "parkpulse-storage";

pub const DEFAULT_BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// The run and entity a fetched payload was requested for.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveScope<'a> {
    pub pipeline: &'a str,
    pub run_id: Uuid,
    pub entity: &'a str,
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub sha256: String,
    /// Body location relative to the archive root.
    pub body_path: PathBuf,
    pub meta_path: PathBuf,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
struct PayloadMeta<'a> {
    pipeline: &'a str,
    run_id: Uuid,
    entity: &'a str,
    source_id: &'a str,
    url: &'a str,
    status: u16,
    content_type: Option<&'a str>,
    fetched_at: DateTime<Utc>,
    sha256: &'a str,
    bytes: usize,
}

/// Upstream bodies filed per pipeline run and entity, each with a JSON
/// sidecar describing the request. A markup change can be replayed from
/// here into a parser fixture.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn extension_for(content_type: Option<&str>) -> &'static str {
        match content_type.map(|c| c.to_ascii_lowercase()) {
            Some(c) if c.contains("html") => "html",
            Some(c) if c.contains("json") => "json",
            _ => "bin",
        }
    }

    /// `<pipeline>/<fetch date>/<run_id>/<entity>/<source_id>-<digest prefix>.<ext>`
    fn body_path(
        scope: &ArchiveScope<'_>,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        sha256: &str,
        ext: &str,
    ) -> PathBuf {
        let prefix = sha256.get(..16).unwrap_or(sha256);
        PathBuf::from(path_segment(scope.pipeline))
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(scope.run_id.to_string())
            .join(path_segment(scope.entity))
            .join(format!("{}-{prefix}.{ext}", path_segment(source_id)))
    }

    /// Same body fetched again within one run and entity is stored once.
    pub async fn archive_response(
        &self,
        scope: ArchiveScope<'_>,
        source_id: &str,
        response: &FetchedResponse,
    ) -> anyhow::Result<ArchivedPayload> {
        let sha256 = hex::encode(Sha256::digest(&response.body));
        let ext = Self::extension_for(response.content_type.as_deref());
        let body_path = Self::body_path(&scope, source_id, response.fetched_at, &sha256, ext);
        let meta_path = body_path.with_extension(format!("{ext}.meta.json"));
        let absolute = self.root.join(&body_path);

        if fs::try_exists(&absolute)
            .await
            .with_context(|| format!("checking {}", absolute.display()))?
        {
            return Ok(ArchivedPayload {
                sha256,
                body_path,
                meta_path,
                deduplicated: true,
            });
        }

        if let Some(dir) = absolute.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating archive directory {}", dir.display()))?;
        }
        write_atomically(&absolute, &response.body).await?;

        let meta = serde_json::to_vec_pretty(&PayloadMeta {
            pipeline: scope.pipeline,
            run_id: scope.run_id,
            entity: scope.entity,
            source_id,
            url: &response.final_url,
            status: response.status,
            content_type: response.content_type.as_deref(),
            fetched_at: response.fetched_at,
            sha256: &sha256,
            bytes: response.body.len(),
        })
        .context("encoding payload metadata")?;
        write_atomically(&self.root.join(&meta_path), &meta).await?;

        Ok(ArchivedPayload {
            sha256,
            body_path,
            meta_path,
            deduplicated: false,
        })
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("moving archive file to {}", path.display()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_id: String,
    pub url: String,
}

impl FetchRequest {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited (429) by {url}")]
    RateLimited { url: String },
    #[error("forbidden (403) by {url}")]
    Forbidden { url: String },
    #[error("not found (404) at {url}")]
    NotFound { url: String },
    #[error("upstream returned {status} {reason} for {url}")]
    Upstream {
        status: u16,
        reason: String,
        url: String,
    },
    #[error("network failure for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FetchError {
    /// Map a non-success status onto the error taxonomy. `None` for 2xx.
    pub fn from_status(status: StatusCode, url: &str) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        let url = url.to_string();
        Some(match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { url },
            StatusCode::FORBIDDEN => Self::Forbidden { url },
            StatusCode::NOT_FOUND => Self::NotFound { url },
            other => Self::Upstream {
                status: other.as_u16(),
                reason: other.canonical_reason().unwrap_or("unknown").to_string(),
                url,
            },
        })
    }

    /// Only transport failures and rate limiting are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::RateLimited { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base * 2^attempt`, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|n| 2u32.checked_pow(n))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// One token per elapsed `refill_every`, holding at most `capacity`.
#[derive(Debug)]
struct RefillingBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: u32,
    refilled_at: Instant,
}

impl RefillingBucket {
    /// `refill_every` must be non-zero.
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                available: config.capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        let TokenBucketConfig {
            capacity,
            refill_every,
        } = self.config;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let periods =
                    now.duration_since(state.refilled_at).as_nanos() / refill_every.as_nanos();
                let missing = capacity - state.available;
                if periods >= u128::from(missing) {
                    state.available = capacity;
                    state.refilled_at = now;
                } else if periods > 0 {
                    // periods < missing <= capacity, so it fits in u32.
                    let periods = periods as u32;
                    state.available += periods;
                    state.refilled_at += refill_every * periods;
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                (state.refilled_at + refill_every).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Throttling applied between the entities of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacingPolicy {
    #[default]
    None,
    FixedDelay(Duration),
    TokenBucket(TokenBucketConfig),
}

#[derive(Debug)]
pub struct Pacer {
    policy: PacingPolicy,
    bucket: Option<RefillingBucket>,
}

impl Pacer {
    /// A token bucket that never refills is treated as no pacing.
    pub fn new(policy: PacingPolicy) -> Self {
        let policy = match policy {
            PacingPolicy::TokenBucket(config) if config.refill_every.is_zero() => {
                warn!("token bucket with zero refill interval; pacing disabled");
                PacingPolicy::None
            }
            PacingPolicy::TokenBucket(config) => PacingPolicy::TokenBucket(TokenBucketConfig {
                capacity: config.capacity.max(1),
                ..config
            }),
            other => other,
        };
        let bucket = match policy {
            PacingPolicy::TokenBucket(config) => Some(RefillingBucket::new(config)),
            _ => None,
        };
        Self { policy, bucket }
    }

    pub fn policy(&self) -> PacingPolicy {
        self.policy
    }

    /// Wait before the entity at `index`; the first entity never waits on a fixed delay.
    pub async fn pace(&self, index: usize) {
        match self.policy {
            PacingPolicy::None => {}
            PacingPolicy::FixedDelay(delay) => {
                if index > 0 && !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "pacing before next entity");
                    tokio::time::sleep(delay).await;
                }
            }
            PacingPolicy::TokenBucket(_) => {
                if let Some(bucket) = &self.bucket {
                    bucket.acquire().await;
                }
            }
        }
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Perform a single GET. Implementations never retry.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_BROWSER_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id = %request.source_id, url = %request.url);
        async {
            let network = |err: reqwest::Error| FetchError::Network {
                url: request.url.clone(),
                source: Box::new(err),
            };

            let resp = self.client.get(&request.url).send().await.map_err(network)?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if let Some(err) = FetchError::from_status(status, &final_url) {
                return Err(err);
            }

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await.map_err(network)?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");

            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                content_type,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
enum CannedOutcome {
    Response {
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    NetworkFailure(String),
}

/// In-memory fetcher serving canned responses by URL, for tests and offline replays.
///
/// Several outcomes queued for one URL are served in order; the last one repeats.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: Mutex<HashMap<String, Vec<CannedOutcome>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, url: &str, outcome: CannedOutcome) -> Self {
        self.routes
            .get_mut()
            .entry(url.to_string())
            .or_default()
            .push(outcome);
        self
    }

    pub fn with_body(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.push(
            url,
            CannedOutcome::Response {
                status: 200,
                content_type: Some(content_type.to_string()),
                body: body.into(),
            },
        )
    }

    pub fn with_html(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.with_body(url, "text/html; charset=utf-8", body)
    }

    pub fn with_json(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.with_body(url, "application/json", body)
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.push(
            url,
            CannedOutcome::Response {
                status,
                content_type: None,
                body: Vec::new(),
            },
        )
    }

    pub fn with_network_failure(self, url: &str, message: &str) -> Self {
        self.push(url, CannedOutcome::NetworkFailure(message.to_string()))
    }

    pub async fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().await.get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let call_index = {
            let mut calls = self.calls.lock().await;
            let count = calls.entry(request.url.clone()).or_default();
            *count += 1;
            *count - 1
        };

        let outcome = {
            let routes = self.routes.lock().await;
            routes
                .get(&request.url)
                .and_then(|queue| queue.get(call_index).or_else(|| queue.last()))
                .cloned()
        };

        match outcome {
            None => Err(FetchError::NotFound {
                url: request.url.clone(),
            }),
            Some(CannedOutcome::NetworkFailure(message)) => Err(FetchError::Network {
                url: request.url.clone(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    message,
                )),
            }),
            Some(CannedOutcome::Response {
                status,
                content_type,
                body,
            }) => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if let Some(err) = FetchError::from_status(code, &request.url) {
                    return Err(err);
                }
                Ok(FetchedResponse {
                    status,
                    final_url: request.url.clone(),
                    content_type,
                    body,
                    fetched_at: Utc::now(),
                })
            }
        }
    }
}
