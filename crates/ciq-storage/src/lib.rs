//! Raw dump + checkpoint storage and the domain fetcher for CIQ.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciq_core::{Checkpoint, Domain, FetchError, IoError, RawPage};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ciq-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a dot-prefixed temp file in the same
/// directory and an atomic rename. Readers never observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpMeta {
    pub url_fetched: String,
    pub status_code: u16,
    pub fetched_at: DateTime<Utc>,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct StoredDump {
    pub content_hash: String,
    pub html_path: PathBuf,
    pub byte_size: usize,
}

/// Domain-keyed raw page dumps: `<root>/<key>/index.html` + `meta.json`.
#[derive(Debug, Clone)]
pub struct RawDumpStore {
    root: PathBuf,
}

impl RawDumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dump_dir(&self, domain: &Domain) -> PathBuf {
        self.root.join(domain.storage_key())
    }

    pub fn html_path(&self, domain: &Domain) -> PathBuf {
        self.dump_dir(domain).join("index.html")
    }

    pub async fn exists(&self, domain: &Domain) -> bool {
        fs::try_exists(self.html_path(domain)).await.unwrap_or(false)
    }

    pub async fn store(&self, page: &RawPage) -> anyhow::Result<StoredDump> {
        let html_path = self.html_path(&page.domain);
        let content_hash = sha256_hex(&page.html_bytes);
        write_atomic(&html_path, &page.html_bytes)
            .await
            .with_context(|| format!("writing raw dump {}", html_path.display()))?;

        let meta = DumpMeta {
            url_fetched: page.url_fetched.clone(),
            status_code: page.status_code,
            fetched_at: page.fetched_at,
            sha256: content_hash.clone(),
            byte_size: page.html_bytes.len(),
        };
        let meta_path = self.dump_dir(&page.domain).join("meta.json");
        let meta_bytes = serde_json::to_vec_pretty(&meta).context("serializing dump metadata")?;
        write_atomic(&meta_path, &meta_bytes)
            .await
            .with_context(|| format!("writing dump metadata {}", meta_path.display()))?;

        Ok(StoredDump {
            content_hash,
            html_path,
            byte_size: page.html_bytes.len(),
        })
    }

    /// Rebuild a RawPage from an existing dump, if there is one.
    pub async fn load(&self, domain: &Domain) -> anyhow::Result<Option<RawPage>> {
        let html_path = self.html_path(domain);
        let html_bytes = match fs::read(&html_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading raw dump {}", html_path.display()))
            }
        };

        let meta_path = self.dump_dir(domain).join("meta.json");
        let meta = match fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice::<DumpMeta>(&bytes).ok(),
            Err(_) => None,
        };
        let (url_fetched, status_code, fetched_at) = match meta {
            Some(meta) => (meta.url_fetched, meta.status_code, meta.fetched_at),
            None => {
                let modified = fs::metadata(&html_path)
                    .await
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                (format!("https://{domain}/"), 200, modified)
            }
        };

        Ok(Some(RawPage {
            domain: domain.clone(),
            url_fetched,
            status_code,
            html_bytes,
            fetched_at,
        }))
    }
}

/// Key-value store of terminal per-domain results.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, domain: &Domain) -> Result<Option<Checkpoint>, IoError>;

    /// Replaces any previous checkpoint for the domain.
    async fn save(&self, domain: &Domain, checkpoint: &Checkpoint) -> Result<(), IoError>;

    /// Every domain with a checkpoint, sorted.
    async fn domains(&self) -> Result<Vec<Domain>, IoError>;

    async fn check_writable(&self) -> Result<(), IoError>;
}

/// One JSON file per domain under `root`.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, domain: &Domain) -> PathBuf {
        self.root.join(format!("{}.json", domain.storage_key()))
    }
}

fn write_failure(path: &Path, err: impl std::fmt::Display) -> IoError {
    IoError::WriteFailure {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn read_corrupt(path: &Path, err: impl std::fmt::Display) -> IoError {
    IoError::ReadCorrupt {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, domain: &Domain) -> Result<Option<Checkpoint>, IoError> {
        let path = self.path_for(domain);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(read_corrupt(&path, err)),
        };
        Checkpoint::decode(domain, &bytes)
            .map(Some)
            .map_err(|err| read_corrupt(&path, err))
    }

    async fn save(&self, domain: &Domain, checkpoint: &Checkpoint) -> Result<(), IoError> {
        let path = self.path_for(domain);
        let bytes = checkpoint
            .to_json_bytes()
            .map_err(|err| write_failure(&path, err))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|err| write_failure(&path, err))
    }

    async fn domains(&self) -> Result<Vec<Domain>, IoError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(read_corrupt(&self.root, err)),
        };

        let mut domains = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| read_corrupt(&self.root, err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            match Domain::from_storage_key(key) {
                Ok(domain) => domains.push(domain),
                Err(err) => warn!(file = %name, error = %err, "ignoring checkpoint with invalid name"),
            }
        }
        domains.sort();
        Ok(domains)
    }

    async fn check_writable(&self) -> Result<(), IoError> {
        let marker = self.root.join(format!(".writable-{}", Uuid::new_v4()));
        write_atomic(&marker, b"ok")
            .await
            .map_err(|err| write_failure(&self.root, err))?;
        fs::remove_file(&marker)
            .await
            .map_err(|err| write_failure(&marker, err))
    }
}

/// Hands out one async mutex per domain so a domain's read-then-act
/// sequence is exclusive. Distinct domains never contend.
#[derive(Debug, Default)]
pub struct DomainLocks {
    locks: Mutex<HashMap<Domain, Arc<Mutex<()>>>>,
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, domain: &Domain) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(domain.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn fetch_error_for_status(status: StatusCode) -> FetchError {
    if status.is_server_error() {
        FetchError::ServerError {
            status: status.as_u16(),
        }
    } else {
        FetchError::BotBlocked {
            status: status.as_u16(),
        }
    }
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    if err.is_redirect() {
        return FetchError::RedirectLoopExceeded;
    }

    let text = error_chain_text(err);
    let lower = text.to_ascii_lowercase();
    if ["dns error", "failed to lookup address", "name or service not known", "no such host"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchError::DnsFailure(text)
    } else if ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchError::TlsFailure(text)
    } else {
        FetchError::Connect(text)
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
            max_retries: 1,
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

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_redirects: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            max_redirects: 5,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request pacing: `capacity` fetches may start back to back, then one more
/// is released every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `None` for a zero rate, which means unpaced.
    pub fn per_second(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            capacity: 1,
            refill_every: Duration::from_secs(1) / rate,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, config: TokenBucketConfig) {
        if config.refill_every.is_zero() {
            self.tokens = config.capacity;
            return;
        }
        let refills = self.last_refill.elapsed().as_nanos() / config.refill_every.as_nanos();
        if refills == 0 {
            return;
        }
        if refills >= u128::from(config.capacity) {
            self.tokens = config.capacity;
            self.last_refill = Instant::now();
        } else {
            // refills < capacity, so the cast is lossless
            let refills = refills as u32;
            self.tokens = (self.tokens + refills).min(config.capacity);
            self.last_refill += config.refill_every * refills;
        }
    }
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let config = TokenBucketConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a fetch may start.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                state.refill(self.config);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.config
                    .refill_every
                    .saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Retrieves the landing page for one domain. Failure is a value.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, domain: &Domain) -> Result<RawPage, FetchError>;
}

pub fn candidate_urls(domain: &Domain) -> [String; 2] {
    [format!("https://{domain}/"), format!("http://{domain}/")]
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn fetch_url(&self, domain: &Domain, url: &str) -> Result<RawPage, FetchError> {
        let mut attempt = 0;
        loop {
            let error = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| classify_reqwest_error(&err))?;
                        if body.iter().all(u8::is_ascii_whitespace) {
                            return Err(FetchError::EmptyBody);
                        }
                        return Ok(RawPage {
                            domain: domain.clone(),
                            url_fetched: final_url,
                            status_code: status.as_u16(),
                            html_bytes: body.to_vec(),
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(fetch_error_for_status(status));
                    }
                    fetch_error_for_status(status)
                }
                Err(err) => {
                    let error = classify_reqwest_error(&err);
                    if !error.is_transient() {
                        return Err(error);
                    }
                    error
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(error);
            }
            debug!(url, attempt, error_kind = error.kind(), "retrying fetch");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, domain: &Domain) -> Result<RawPage, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let [secure, insecure] = candidate_urls(domain);
        let span = tracing::info_span!("http_fetch", %domain);
        async {
            let secure_err = match self.fetch_url(domain, &secure).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };
            debug!(error_kind = secure_err.kind(), "secure fetch failed, trying insecure scheme");

            match self.fetch_url(domain, &insecure).await {
                Ok(page) => Ok(page),
                Err(insecure_err) if insecure_err.progress() >= secure_err.progress() => {
                    Err(insecure_err)
                }
                Err(_) => Err(secure_err),
            }
        }
        .instrument(span)
        .await
    }
}
