//! Web-archive snapshot retrieval with bounded retries, plus an on-disk snapshot store.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vtrend_core::SnapshotRequest;

pub const CRATE_NAME: &str = "vtrend-archive";

pub const DEFAULT_ARCHIVE_HOST: &str = "http://web.archive.org";

/// `{archive_host}/web/{YYYYMMDD}/{original_url}`
pub fn archive_url(archive_host: &str, request: &SnapshotRequest) -> String {
    format!(
        "{}/web/{}/{}",
        archive_host.trim_end_matches('/'),
        request.timestamp(),
        request.url
    )
}

/// Final result of retrieving one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Markup(String),
    /// The archive holds no capture for the day. Never retried.
    NotFound,
    /// Every attempt failed transiently.
    Unavailable { attempts: usize, last_error: String },
}

impl FetchOutcome {
    pub fn markup(&self) -> Option<&str> {
        match self {
            FetchOutcome::Markup(markup) => Some(markup),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Markup(_) => "markup",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Unavailable { .. } => "unavailable",
        }
    }
}

/// Why a single attempt did not produce markup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("no archived snapshot (404)")]
    NotFound,
    #[error("transient failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Success,
    Terminal,
    Retryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_success() {
        RetryDisposition::Success
    } else if status == StatusCode::NOT_FOUND {
        RetryDisposition::Terminal
    } else {
        RetryDisposition::Retryable
    }
}

/// Every transport-level error (connect, timeout, body read) is worth another attempt.
pub fn transient_from_reqwest(err: reqwest::Error) -> AttemptFailure {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "request"
    };
    AttemptFailure::Transient(format!("{kind} error: {err}"))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Observability hooks for the retry loop. All methods default to no-ops.
pub trait FetchObserver: Send + Sync {
    fn attempt_started(&self, _request: &SnapshotRequest, _attempt: usize, _max_attempts: usize) {}

    fn attempt_failed(
        &self,
        _request: &SnapshotRequest,
        _attempt: usize,
        _failure: &AttemptFailure,
    ) {
    }

    fn finished(&self, _request: &SnapshotRequest, _outcome: &FetchOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFetchObserver;

impl FetchObserver for TracingFetchObserver {
    fn attempt_started(&self, request: &SnapshotRequest, attempt: usize, max_attempts: usize) {
        debug!(
            site = %request.url,
            day = %request.day,
            attempt,
            max_attempts,
            "retrieving snapshot"
        );
    }

    fn attempt_failed(&self, request: &SnapshotRequest, attempt: usize, failure: &AttemptFailure) {
        match failure {
            AttemptFailure::NotFound => {
                info!(site = %request.url, day = %request.day, "archive has no snapshot")
            }
            AttemptFailure::Transient(reason) => {
                warn!(
                    site = %request.url,
                    day = %request.day,
                    attempt,
                    %reason,
                    "snapshot attempt failed"
                )
            }
        }
    }

    fn finished(&self, request: &SnapshotRequest, outcome: &FetchOutcome) {
        if let FetchOutcome::Unavailable { attempts, last_error } = outcome {
            warn!(
                site = %request.url,
                day = %request.day,
                attempts,
                %last_error,
                "max attempts exceeded; snapshot unavailable"
            );
        } else {
            debug!(
                site = %request.url,
                day = %request.day,
                outcome = outcome.label(),
                "snapshot retrieved"
            );
        }
    }
}

/// Drive `attempt` until it yields markup, hits a 404, or the policy runs out of attempts.
pub async fn fetch_with_retries<F, Fut>(
    request: &SnapshotRequest,
    policy: &BackoffPolicy,
    observer: &dyn FetchObserver,
    mut attempt: F,
) -> FetchOutcome
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<String, AttemptFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt_no in 1..=max_attempts {
        observer.attempt_started(request, attempt_no, max_attempts);
        match attempt(attempt_no).await {
            Ok(markup) => {
                let outcome = FetchOutcome::Markup(markup);
                observer.finished(request, &outcome);
                return outcome;
            }
            Err(AttemptFailure::NotFound) => {
                observer.attempt_failed(request, attempt_no, &AttemptFailure::NotFound);
                let outcome = FetchOutcome::NotFound;
                observer.finished(request, &outcome);
                return outcome;
            }
            Err(failure) => {
                observer.attempt_failed(request, attempt_no, &failure);
                last_error = failure.to_string();
                if attempt_no < max_attempts {
                    let delay = policy.delay_for_attempt(attempt_no - 1);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    let outcome = FetchOutcome::Unavailable {
        attempts: max_attempts,
        last_error,
    };
    observer.finished(request, &outcome);
    outcome
}

/// Anything that can hand back the archived markup for a (site, day).
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, request: &SnapshotRequest) -> FetchOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    pub archive_host: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            archive_host: DEFAULT_ARCHIVE_HOST.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

pub struct ArchiveFetcher {
    client: reqwest::Client,
    archive_host: String,
    backoff: BackoffPolicy,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    observer: Arc<dyn FetchObserver>,
}

impl ArchiveFetcher {
    pub fn new(config: ArchiveClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            archive_host: config.archive_host,
            backoff: config.backoff,
            token_bucket,
            observer: Arc::new(TracingFetchObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn FetchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn archive_url(&self, request: &SnapshotRequest) -> String {
        archive_url(&self.archive_host, request)
    }

    async fn attempt(&self, url: &str) -> Result<String, AttemptFailure> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transient_from_reqwest)?;
        let status = resp.status();

        match classify_status(status) {
            RetryDisposition::Success => resp.text().await.map_err(transient_from_reqwest),
            RetryDisposition::Terminal => Err(AttemptFailure::NotFound),
            RetryDisposition::Retryable => Err(AttemptFailure::Transient(format!(
                "http status {} for {}",
                status.as_u16(),
                url
            ))),
        }
    }
}

#[async_trait]
impl SnapshotSource for ArchiveFetcher {
    async fn fetch(&self, request: &SnapshotRequest) -> FetchOutcome {
        let url = self.archive_url(request);
        let span = info_span!("archive_fetch", site = %request.url, day = %request.day);
        fetch_with_retries(request, &self.backoff, self.observer.as_ref(), |_| {
            self.attempt(&url)
        })
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedSnapshot {
    Markup(String),
    /// A previous run saw a 404 for this day.
    Missing,
}

const SITE_HASH_LEN: usize = 12;

/// Immutable on-disk store of archived markup, one file per (site, day).
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Filesystem-safe directory name for a site URL: a readable slug followed by a short
    /// hash of the exact URL, so URLs that slug alike never share a directory.
    pub fn site_slug(url: &str) -> String {
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let slug = without_scheme
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let readable = if slug.is_empty() { "site" } else { slug.as_str() };
        let digest = Self::sha256_hex(url.as_bytes());
        format!("{readable}-{}", &digest[..SITE_HASH_LEN])
    }

    pub fn snapshot_relative_path(&self, request: &SnapshotRequest, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "html" } else { ext };
        PathBuf::from(Self::site_slug(&request.url))
            .join(format!("{}.{ext}", request.timestamp()))
    }

    /// Store markup using temp-file + atomic rename. An existing capture is left untouched.
    pub async fn store_markup(
        &self,
        request: &SnapshotRequest,
        markup: &str,
    ) -> anyhow::Result<StoredSnapshot> {
        let bytes = markup.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(request, "html");
        let absolute_path = self.root.join(&relative_path);
        let deduplicated = write_atomic(&absolute_path, bytes).await?;
        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    pub async fn mark_missing(&self, request: &SnapshotRequest) -> anyhow::Result<()> {
        let path = self.root.join(self.snapshot_relative_path(request, "missing"));
        write_atomic(&path, b"").await?;
        Ok(())
    }

    pub async fn load(&self, request: &SnapshotRequest) -> anyhow::Result<Option<CachedSnapshot>> {
        let markup_path = self.root.join(self.snapshot_relative_path(request, "html"));
        if fs::try_exists(&markup_path)
            .await
            .with_context(|| format!("checking snapshot path {}", markup_path.display()))?
        {
            let markup = fs::read_to_string(&markup_path)
                .await
                .with_context(|| format!("reading snapshot {}", markup_path.display()))?;
            return Ok(Some(CachedSnapshot::Markup(markup)));
        }

        let missing_path = self.root.join(self.snapshot_relative_path(request, "missing"));
        if fs::try_exists(&missing_path)
            .await
            .with_context(|| format!("checking snapshot path {}", missing_path.display()))?
        {
            return Ok(Some(CachedSnapshot::Missing));
        }

        Ok(None)
    }
}

/// Returns `true` when the destination already existed.
async fn write_atomic(absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = absolute_path
        .parent()
        .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    if fs::try_exists(absolute_path)
        .await
        .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
    {
        return Ok(true);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, absolute_path).await {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(true)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            })
        }
    }
}

/// Read-through cache: serve from the store, otherwise ask `inner` and remember the answer.
pub struct CachedSource {
    inner: Arc<dyn SnapshotSource>,
    store: SnapshotStore,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn SnapshotSource>, store: SnapshotStore) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl SnapshotSource for CachedSource {
    async fn fetch(&self, request: &SnapshotRequest) -> FetchOutcome {
        match self.store.load(request).await {
            Ok(Some(CachedSnapshot::Markup(markup))) => return FetchOutcome::Markup(markup),
            Ok(Some(CachedSnapshot::Missing)) => return FetchOutcome::NotFound,
            Ok(None) => {}
            Err(err) => warn!(
                site = %request.url,
                day = %request.day,
                error = %err,
                "snapshot cache read failed"
            ),
        }

        let outcome = self.inner.fetch(request).await;
        let stored = match &outcome {
            FetchOutcome::Markup(markup) => {
                self.store.store_markup(request, markup).await.map(|_| ())
            }
            FetchOutcome::NotFound => self.store.mark_missing(request).await,
            FetchOutcome::Unavailable { .. } => Ok(()),
        };
        if let Err(err) = stored {
            warn!(
                site = %request.url,
                day = %request.day,
                error = %err,
                "snapshot cache write failed"
            );
        }
        outcome
    }
}

/// Replays a previously populated store without touching the network.
pub struct OfflineSource {
    store: SnapshotStore,
}

impl OfflineSource {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotSource for OfflineSource {
    async fn fetch(&self, request: &SnapshotRequest) -> FetchOutcome {
        match self.store.load(request).await {
            Ok(Some(CachedSnapshot::Markup(markup))) => FetchOutcome::Markup(markup),
            Ok(Some(CachedSnapshot::Missing)) | Ok(None) => FetchOutcome::NotFound,
            Err(err) => FetchOutcome::Unavailable {
                attempts: 1,
                last_error: format!("{err:#}"),
            },
        }
    }
}
