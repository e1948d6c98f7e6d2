//! Run orchestration: domain list, status board, bounded worker pool,
//! corpus merge and run reports.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ciq_core::{
    Checkpoint, CleanError, CleanedText, CompanyProfile, Domain, DomainStatus, ExtractionError, FailureMarker,
    IoError, RawPage, Stage,
};
use ciq_extract::{
    Cleaner, CleanerConfig, Extractor, ExtractorConfig, OllamaClient, OllamaConfig, RetryPolicy,
};
use ciq_storage::{
    write_atomic, CheckpointStore, DomainLocks, FsCheckpointStore, HttpClientConfig,
    HttpFetcher, PageFetcher, RawDumpStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ciq-pipeline";

/// Fields counted in the merge report's coverage table.
pub const COVERAGE_FIELDS: [&str; 5] = [
    "short_description",
    "long_description",
    "sector",
    "industry",
    "logo",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub corpus_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_redirects: usize,
    pub fetch_concurrency: usize,
    /// Fetch starts per second across the run; 0 leaves fetches unpaced.
    pub fetch_rate_per_sec: u32,
    pub inference_concurrency: usize,
    pub inference_url: String,
    pub model: String,
    pub inference_timeout_secs: u64,
    pub max_attempts: usize,
    pub max_chars: usize,
    pub min_chars: usize,
    pub unavailable_threshold: usize,
    pub max_passes: usize,
    pub retry_failed: bool,
    pub reuse_raw_dumps: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            corpus_path: None,
            user_agent: "Mozilla/5.0 (compatible; ciq-bot/0.1)".to_string(),
            http_timeout_secs: 15,
            max_redirects: 5,
            fetch_concurrency: 4,
            fetch_rate_per_sec: 0,
            inference_concurrency: 1,
            inference_url: "http://localhost:11434/api/generate".to_string(),
            model: "phi".to_string(),
            inference_timeout_secs: 60,
            max_attempts: 3,
            max_chars: 3000,
            min_chars: 50,
            unavailable_threshold: 5,
            max_passes: 1,
            retry_failed: true,
            reuse_raw_dumps: true,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

/// Optional YAML overlay; every key is optional and unknown keys are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfigFile {
    pub data_dir: Option<PathBuf>,
    pub corpus_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub max_redirects: Option<usize>,
    pub fetch_concurrency: Option<usize>,
    pub fetch_rate_per_sec: Option<u32>,
    pub inference_concurrency: Option<usize>,
    pub inference_url: Option<String>,
    pub model: Option<String>,
    pub inference_timeout_secs: Option<u64>,
    pub max_attempts: Option<usize>,
    pub max_chars: Option<usize>,
    pub min_chars: Option<usize>,
    pub unavailable_threshold: Option<usize>,
    pub max_passes: Option<usize>,
    pub retry_failed: Option<bool>,
    pub reuse_raw_dumps: Option<bool>,
}

impl PipelineConfigFile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing pipeline config yaml")
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("CIQ_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            corpus_path: std::env::var("CIQ_CORPUS_PATH").ok().map(PathBuf::from),
            user_agent: std::env::var("CIQ_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("CIQ_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_redirects: env_parse("CIQ_MAX_REDIRECTS").unwrap_or(defaults.max_redirects),
            fetch_concurrency: env_parse("CIQ_FETCH_CONCURRENCY").unwrap_or(defaults.fetch_concurrency),
            fetch_rate_per_sec: env_parse("CIQ_FETCH_RATE_PER_SEC")
                .unwrap_or(defaults.fetch_rate_per_sec),
            inference_concurrency: env_parse("CIQ_INFERENCE_CONCURRENCY")
                .unwrap_or(defaults.inference_concurrency),
            inference_url: std::env::var("CIQ_INFERENCE_URL").unwrap_or(defaults.inference_url),
            model: std::env::var("CIQ_MODEL").unwrap_or(defaults.model),
            inference_timeout_secs: env_parse("CIQ_INFERENCE_TIMEOUT_SECS")
                .unwrap_or(defaults.inference_timeout_secs),
            max_attempts: env_parse("CIQ_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            max_chars: env_parse("CIQ_MAX_CHARS").unwrap_or(defaults.max_chars),
            min_chars: env_parse("CIQ_MIN_CHARS").unwrap_or(defaults.min_chars),
            unavailable_threshold: env_parse("CIQ_UNAVAILABLE_THRESHOLD")
                .unwrap_or(defaults.unavailable_threshold),
            max_passes: env_parse("CIQ_MAX_PASSES").unwrap_or(defaults.max_passes),
            retry_failed: env_flag("CIQ_RETRY_FAILED").unwrap_or(defaults.retry_failed),
            reuse_raw_dumps: env_flag("CIQ_REUSE_RAW_DUMPS").unwrap_or(defaults.reuse_raw_dumps),
        }
    }

    /// Environment first, then the YAML file named by `path` or `CIQ_CONFIG`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("CIQ_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = path {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.apply_file(PipelineConfigFile::from_yaml_str(&raw)?);
        }
        Ok(config)
    }

    pub fn apply_file(&mut self, file: PipelineConfigFile) {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if file.corpus_path.is_some() {
            self.corpus_path = file.corpus_path;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.max_redirects {
            self.max_redirects = v;
        }
        if let Some(v) = file.fetch_concurrency {
            self.fetch_concurrency = v;
        }
        if let Some(v) = file.fetch_rate_per_sec {
            self.fetch_rate_per_sec = v;
        }
        if let Some(v) = file.inference_concurrency {
            self.inference_concurrency = v;
        }
        if let Some(v) = file.inference_url {
            self.inference_url = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.inference_timeout_secs {
            self.inference_timeout_secs = v;
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.max_chars {
            self.max_chars = v;
        }
        if let Some(v) = file.min_chars {
            self.min_chars = v;
        }
        if let Some(v) = file.unavailable_threshold {
            self.unavailable_threshold = v;
        }
        if let Some(v) = file.max_passes {
            self.max_passes = v;
        }
        if let Some(v) = file.retry_failed {
            self.retry_failed = v;
        }
        if let Some(v) = file.reuse_raw_dumps {
            self.reuse_raw_dumps = v;
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.corpus_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("output").join("companies.json"))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_redirects: self.max_redirects,
            token_bucket: TokenBucketConfig::per_second(self.fetch_rate_per_sec),
            ..Default::default()
        }
    }

    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            max_chars: self.max_chars,
            min_chars: self.min_chars,
        }
    }

    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            endpoint: self.inference_url.clone(),
            model: self.model.clone(),
            timeout: Duration::from_secs(self.inference_timeout_secs),
            ..Default::default()
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
            inference_timeout: Duration::from_secs(self.inference_timeout_secs),
            inference_concurrency: self.inference_concurrency,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_concurrency: self.fetch_concurrency,
            workers: self.fetch_concurrency.max(1) + self.inference_concurrency.max(1),
            max_passes: self.max_passes,
            retry_failed: self.retry_failed,
            reuse_raw_dumps: self.reuse_raw_dumps,
            unavailable_threshold: self.unavailable_threshold,
            corpus_path: self.corpus_path(),
            reports_dir: Some(self.reports_dir()),
        }
    }
}

/// Parse a domain list. A first line carrying a `domain` column header
/// switches to CSV mode; otherwise every non-empty line not starting with
/// `#` is one domain. Unparsable entries are logged and skipped.
pub fn parse_domain_list(contents: &str) -> Vec<Domain> {
    let mut lines = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .peekable();

    let split_cells = |line: &str| -> Vec<String> {
        line.split(',')
            .map(|cell| cell.trim().trim_matches('"').trim().to_string())
            .collect()
    };

    let column = lines.peek().and_then(|header| {
        split_cells(header)
            .iter()
            .position(|cell| cell.eq_ignore_ascii_case("domain"))
    });
    if column.is_some() {
        lines.next();
    }

    let mut domains = Vec::new();
    for line in lines {
        let candidate = match column {
            Some(idx) => split_cells(line).get(idx).cloned().unwrap_or_default(),
            None => line.to_string(),
        };
        match Domain::parse(&candidate) {
            Ok(domain) => domains.push(domain),
            Err(err) => warn!(entry = %candidate, error = %err, "skipping unparsable domain entry"),
        }
    }
    domains
}

pub async fn read_domain_list(path: &Path) -> Result<Vec<Domain>, RunError> {
    let raw = fs::read_to_string(path).await.map_err(|err| RunError::InputUnreadable {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    let domains = parse_domain_list(&raw);
    if domains.is_empty() {
        return Err(RunError::EmptyInput);
    }
    Ok(domains)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{domain}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub domain: String,
    pub from: DomainStatus,
    pub to: DomainStatus,
}

#[derive(Debug, Clone)]
struct BoardEntry {
    status: DomainStatus,
    failure: Option<FailureMarker>,
}

/// Per-run status of every input domain. Statuses only move forward.
#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: Mutex<BTreeMap<Domain, BoardEntry>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<Domain, BoardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, domain: &Domain) {
        self.entries().entry(domain.clone()).or_insert(BoardEntry {
            status: DomainStatus::Pending,
            failure: None,
        });
    }

    pub fn status(&self, domain: &Domain) -> Option<DomainStatus> {
        self.entries().get(domain).map(|e| e.status)
    }

    pub fn advance(&self, domain: &Domain, next: DomainStatus) -> Result<(), TransitionError> {
        let mut entries = self.entries();
        let entry = entries.entry(domain.clone()).or_insert(BoardEntry {
            status: DomainStatus::Pending,
            failure: None,
        });
        if !entry.status.can_advance_to(next) {
            return Err(TransitionError {
                domain: domain.to_string(),
                from: entry.status,
                to: next,
            });
        }
        entry.status = next;
        Ok(())
    }

    pub fn record_failure(&self, domain: &Domain, marker: FailureMarker) -> Result<(), TransitionError> {
        self.advance(domain, marker.stage.failed_status())?;
        if let Some(entry) = self.entries().get_mut(domain) {
            entry.failure = Some(marker);
        }
        Ok(())
    }

    pub fn failures(&self) -> Vec<FailureMarker> {
        self.entries()
            .values()
            .filter(|e| matches!(e.status, DomainStatus::FetchFailed | DomainStatus::ExtractFailed))
            .filter_map(|e| e.failure.clone())
            .collect()
    }

    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries().values() {
            *counts.entry(entry.status.as_str().to_string()).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("domain list is empty")]
    EmptyInput,
    #[error("reading domain list {path}: {message}")]
    InputUnreadable { path: String, message: String },
    #[error("inference service unavailable for {consecutive} consecutive domains")]
    InferenceUnavailable { consecutive: usize },
    #[error("checkpoint storage is unwritable: {0}")]
    StorageUnwritable(#[source] IoError),
    #[error(transparent)]
    Output(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub total_records: usize,
    pub failure_markers: usize,
    pub skipped_corrupt: usize,
    pub field_coverage: BTreeMap<String, usize>,
    pub sector_distribution: BTreeMap<String, usize>,
    pub corpus_path: String,
}

/// Folds extracted checkpoints into the corpus artifact: every checkpoint on
/// disk, or only those of a scoped domain set.
pub struct Merger {
    store: Arc<dyn CheckpointStore>,
    corpus_path: PathBuf,
    scope: Option<HashSet<Domain>>,
}

impl Merger {
    pub fn new(store: Arc<dyn CheckpointStore>, corpus_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            corpus_path: corpus_path.into(),
            scope: None,
        }
    }

    /// Ignore checkpoints of domains outside `domains`.
    pub fn scoped_to(mut self, domains: impl IntoIterator<Item = Domain>) -> Self {
        self.scope = Some(domains.into_iter().collect());
        self
    }

    pub async fn merge(&self, board: Option<&StatusBoard>) -> Result<MergeReport> {
        let mut domains = self.store.domains().await.context("listing checkpoints")?;
        if let Some(scope) = &self.scope {
            domains.retain(|d| scope.contains(d));
        }

        let mut report = MergeReport {
            corpus_path: self.corpus_path.display().to_string(),
            ..Default::default()
        };
        let mut records: Vec<CompanyProfile> = Vec::new();
        for domain in &domains {
            match self.store.load(domain).await {
                Ok(Some(Checkpoint::Extracted(profile))) => records.push(profile),
                Ok(Some(Checkpoint::Failed(_))) => report.failure_markers += 1,
                Ok(None) => {}
                Err(err) => {
                    report.skipped_corrupt += 1;
                    warn!(domain = %domain, error_kind = err.kind(), error = %err, "skipping unreadable checkpoint");
                }
            }
        }

        records.sort_by(|a, b| {
            (a.company_name.to_lowercase(), &a.domain).cmp(&(b.company_name.to_lowercase(), &b.domain))
        });

        for field in COVERAGE_FIELDS {
            report.field_coverage.insert(field.to_string(), 0);
        }
        for record in &records {
            let present = [
                !record.short_description.is_empty(),
                !record.long_description.is_empty(),
                !record.sector.is_empty(),
                !record.industry.is_empty(),
                !record.logo.is_empty(),
            ];
            for (field, present) in COVERAGE_FIELDS.iter().zip(present) {
                if present {
                    *report.field_coverage.entry(field.to_string()).or_default() += 1;
                }
            }
            let sector = if record.sector.is_empty() {
                "Unknown".to_string()
            } else {
                record.sector.clone()
            };
            *report.sector_distribution.entry(sector).or_default() += 1;
        }
        report.total_records = records.len();

        let mut bytes = serde_json::to_vec_pretty(&records).context("serializing corpus")?;
        bytes.push(b'\n');
        if let Some(parent) = self.corpus_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        write_atomic(&self.corpus_path, &bytes)
            .await
            .with_context(|| format!("writing {}", self.corpus_path.display()))?;

        if let Some(board) = board {
            for record in &records {
                let Ok(domain) = Domain::parse(&record.domain) else {
                    continue;
                };
                if board.status(&domain) == Some(DomainStatus::Extracted) {
                    if let Err(err) = board.advance(&domain, DomainStatus::Merged) {
                        warn!(error = %err, "status transition rejected");
                    }
                }
            }
        }

        info!(
            records = report.total_records,
            failures = report.failure_markers,
            skipped_corrupt = report.skipped_corrupt,
            corpus = %self.corpus_path.display(),
            "corpus merged"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fetch_concurrency: usize,
    pub workers: usize,
    pub max_passes: usize,
    pub retry_failed: bool,
    pub reuse_raw_dumps: bool,
    /// Zero disables the escalation.
    pub unavailable_threshold: usize,
    pub corpus_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_domains: usize,
    pub passes: usize,
    pub attempted: usize,
    pub resumed: usize,
    pub fetched: usize,
    pub extracted: usize,
    pub failed_by_stage: BTreeMap<String, usize>,
    pub failed_by_kind: BTreeMap<String, usize>,
    pub merged: usize,
    pub statuses: BTreeMap<String, usize>,
    pub aborted: Option<String>,
    pub merge: Option<MergeReport>,
    pub reports_dir: Option<String>,
}

#[derive(Debug, Default)]
struct RunState {
    board: StatusBoard,
    cancelled: AtomicBool,
    unavailable_streak: AtomicUsize,
    deferred: Mutex<HashMap<Domain, CleanedText>>,
    attempted: Mutex<HashSet<Domain>>,
    resumed: AtomicUsize,
    fetched: AtomicUsize,
    extracted: AtomicUsize,
}

impl RunState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn defer(&self, cleaned: CleanedText) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cleaned.domain.clone(), cleaned);
    }

    fn take_deferred(&self, domain: &Domain) -> Option<CleanedText> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(domain)
    }

    /// Domains that reached the fetch stage this run, counted once across passes.
    fn mark_attempted(&self, domain: &Domain) {
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.clone());
    }

    fn attempted(&self) -> usize {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn advance(&self, domain: &Domain, next: DomainStatus) {
        if let Err(err) = self.board.advance(domain, next) {
            warn!(error = %err, "status transition rejected");
        }
    }
}

/// Everything one domain unit needs, shared across spawned tasks.
struct DomainWorker {
    config: OrchestratorConfig,
    fetcher: Arc<dyn PageFetcher>,
    dumps: Option<RawDumpStore>,
    cleaner: Cleaner,
    extractor: Arc<Extractor>,
    store: Arc<dyn CheckpointStore>,
    locks: DomainLocks,
    fetch_permits: Semaphore,
}

impl DomainWorker {
    async fn process(self: Arc<Self>, run: Arc<RunState>, domain: Domain, final_pass: bool) -> Result<(), RunError> {
        if run.is_cancelled() {
            return Ok(());
        }
        let _guard = self.locks.lock(&domain).await;

        let cleaned = match run.take_deferred(&domain) {
            Some(cleaned) => cleaned,
            None => {
                if self.resume(&run, &domain).await {
                    return Ok(());
                }
                run.mark_attempted(&domain);
                match self.fetch_and_clean(&run, &domain, final_pass).await? {
                    Some(cleaned) => cleaned,
                    None => return Ok(()),
                }
            }
        };

        if run.is_cancelled() {
            return Ok(());
        }
        self.extract_and_save(&run, &domain, cleaned, final_pass).await
    }

    /// True when a checkpoint settles the domain without further work.
    async fn resume(&self, run: &RunState, domain: &Domain) -> bool {
        match self.store.load(domain).await {
            Ok(Some(Checkpoint::Extracted(_))) => {
                debug!("checkpoint found, skipping");
                run.advance(domain, DomainStatus::Extracted);
                run.resumed.fetch_add(1, Ordering::SeqCst);
                true
            }
            Ok(Some(Checkpoint::Failed(marker))) if !self.config.retry_failed => {
                debug!(stage = %marker.stage, error_kind = %marker.error_kind, "failure checkpoint found, not retrying");
                if let Err(err) = run.board.record_failure(domain, marker) {
                    warn!(error = %err, "status transition rejected");
                }
                run.resumed.fetch_add(1, Ordering::SeqCst);
                true
            }
            Ok(Some(Checkpoint::Failed(marker))) => {
                info!(stage = %marker.stage, error_kind = %marker.error_kind, "retrying previously failed domain");
                false
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error_kind = err.kind(), error = %err, "unreadable checkpoint, re-running domain");
                false
            }
        }
    }

    async fn fetch_page(&self, domain: &Domain) -> Result<RawPage, ciq_core::FetchError> {
        if let Some(dumps) = self.dumps.as_ref().filter(|_| self.config.reuse_raw_dumps) {
            match dumps.load(domain).await {
                Ok(Some(page)) => {
                    debug!("reusing raw dump");
                    return Ok(page);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "raw dump unreadable, fetching again"),
            }
        }

        let page = {
            let _permit = self.fetch_permits.acquire().await.ok();
            self.fetcher.fetch(domain).await?
        };
        if let Some(dumps) = &self.dumps {
            if let Err(err) = dumps.store(&page).await {
                warn!(error = %err, "failed to write raw dump");
            }
        }
        Ok(page)
    }

    async fn fetch_and_clean(
        &self,
        run: &RunState,
        domain: &Domain,
        final_pass: bool,
    ) -> Result<Option<CleanedText>, RunError> {
        let page = match self.fetch_page(domain).await {
            Ok(page) => page,
            Err(err) if !final_pass && err.is_transient() => {
                info!(stage = "fetch", error_kind = err.kind(), "transient failure, deferring to next pass");
                return Ok(None);
            }
            Err(err) => {
                let marker = FailureMarker::new(domain, Stage::Fetch, err.kind(), err.to_string());
                self.fail(run, domain, marker).await?;
                return Ok(None);
            }
        };
        run.advance(domain, DomainStatus::Fetched);
        run.fetched.fetch_add(1, Ordering::SeqCst);

        // html5ever parsing is CPU bound; keep it off the async workers.
        let cleaner = self.cleaner.clone();
        let cleaned = tokio::task::spawn_blocking(move || cleaner.clean(&page))
            .await
            .unwrap_or_else(|err| Err(CleanError::Aborted(err.to_string())));
        match cleaned {
            Ok(cleaned) => Ok(Some(cleaned)),
            Err(err) => {
                let marker = FailureMarker::new(domain, Stage::Clean, err.kind(), err.to_string());
                self.fail(run, domain, marker).await?;
                Ok(None)
            }
        }
    }

    async fn extract_and_save(
        &self,
        run: &RunState,
        domain: &Domain,
        cleaned: CleanedText,
        final_pass: bool,
    ) -> Result<(), RunError> {
        match self.extractor.extract(&cleaned).await {
            Ok(profile) => {
                run.unavailable_streak.store(0, Ordering::SeqCst);
                self.save(domain, &Checkpoint::Extracted(profile)).await?;
                run.advance(domain, DomainStatus::Extracted);
                run.extracted.fetch_add(1, Ordering::SeqCst);
                info!("extracted");
                Ok(())
            }
            Err(err) => {
                if matches!(err, ExtractionError::InferenceUnavailable(_)) {
                    let streak = run.unavailable_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    let threshold = self.config.unavailable_threshold;
                    if threshold > 0 && streak >= threshold {
                        return Err(RunError::InferenceUnavailable { consecutive: streak });
                    }
                } else {
                    run.unavailable_streak.store(0, Ordering::SeqCst);
                }

                if !final_pass && err.is_transient() {
                    info!(stage = "extract", error_kind = err.kind(), "transient failure, deferring to next pass");
                    run.defer(cleaned);
                    return Ok(());
                }
                let marker = FailureMarker::new(domain, Stage::Extract, err.kind(), err.to_string());
                self.fail(run, domain, marker).await
            }
        }
    }

    async fn fail(&self, run: &RunState, domain: &Domain, marker: FailureMarker) -> Result<(), RunError> {
        warn!(
            stage = %marker.stage,
            error_kind = %marker.error_kind,
            message = %marker.message,
            "domain failed"
        );
        self.save(domain, &Checkpoint::Failed(marker.clone())).await?;
        if let Err(err) = run.board.record_failure(domain, marker) {
            warn!(error = %err, "status transition rejected");
        }
        Ok(())
    }

    async fn save(&self, domain: &Domain, checkpoint: &Checkpoint) -> Result<(), RunError> {
        self.store
            .save(domain, checkpoint)
            .await
            .map_err(RunError::StorageUnwritable)
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    fetcher: Arc<dyn PageFetcher>,
    dumps: Option<RawDumpStore>,
    cleaner: Cleaner,
    extractor: Arc<Extractor>,
    store: Arc<dyn CheckpointStore>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<Extractor>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            fetcher,
            dumps: None,
            cleaner: Cleaner::default(),
            extractor,
            store,
        }
    }

    pub fn with_raw_dumps(mut self, dumps: RawDumpStore) -> Self {
        self.dumps = Some(dumps);
        self
    }

    pub fn with_cleaner(mut self, cleaner: Cleaner) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let client = OllamaClient::new(config.ollama_config())?;
        let extractor = Extractor::new(Arc::new(client), config.extractor_config());
        let store = FsCheckpointStore::new(config.checkpoint_dir());
        Ok(Self::new(
            config.orchestrator_config(),
            Arc::new(fetcher),
            Arc::new(extractor),
            Arc::new(store),
        )
        .with_raw_dumps(RawDumpStore::new(config.raw_dir()))
        .with_cleaner(Cleaner::new(config.cleaner_config())))
    }

    pub fn merger(&self) -> Merger {
        Merger::new(self.store.clone(), self.config.corpus_path.clone())
    }

    fn worker(&self) -> Arc<DomainWorker> {
        Arc::new(DomainWorker {
            config: self.config.clone(),
            fetcher: self.fetcher.clone(),
            dumps: self.dumps.clone(),
            cleaner: self.cleaner.clone(),
            extractor: self.extractor.clone(),
            store: self.store.clone(),
            locks: DomainLocks::new(),
            fetch_permits: Semaphore::new(self.config.fetch_concurrency.max(1)),
        })
    }

    /// One full sweep over `domains`, then merge and report. Per-domain
    /// failures are recorded; only run-level conditions return `Err`.
    pub async fn run(&self, domains: Vec<Domain>) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut seen = HashSet::new();
        let domains: Vec<Domain> = domains.into_iter().filter(|d| seen.insert(d.clone())).collect();
        if domains.is_empty() {
            return Err(RunError::EmptyInput);
        }
        self.store
            .check_writable()
            .await
            .map_err(RunError::StorageUnwritable)?;

        let run = Arc::new(RunState::default());
        for domain in &domains {
            run.board.register(domain);
        }
        info!(%run_id, domains = domains.len(), "run started");

        let worker = self.worker();
        let max_passes = self.config.max_passes.max(1);
        let mut passes = 0;
        let mut fatal: Option<RunError> = None;

        for pass in 1..=max_passes {
            let todo: Vec<Domain> = domains
                .iter()
                .filter(|d| run.board.status(d).is_some_and(|s| !s.is_terminal()))
                .cloned()
                .collect();
            if todo.is_empty() {
                break;
            }
            passes = pass;
            let final_pass = pass == max_passes;
            debug!(pass, domains = todo.len(), "starting pass");

            fatal = self.sweep(&worker, &run, todo, final_pass).await;
            if fatal.is_some() {
                break;
            }
        }

        if let Some(RunError::StorageUnwritable(err)) = &fatal {
            warn!(error = %err, "checkpoint storage failed, skipping merge");
            return Err(RunError::StorageUnwritable(err.clone()));
        }

        let merge = self
            .merger()
            .scoped_to(domains.iter().cloned())
            .merge(Some(&run.board))
            .await;
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_domains: domains.len(),
            passes,
            attempted: run.attempted(),
            resumed: run.resumed.load(Ordering::SeqCst),
            fetched: run.fetched.load(Ordering::SeqCst),
            extracted: run.extracted.load(Ordering::SeqCst),
            statuses: run.board.status_counts(),
            aborted: fatal.as_ref().map(|e| e.to_string()),
            ..Default::default()
        };
        let failures = run.board.failures();
        for marker in &failures {
            *summary.failed_by_stage.entry(marker.stage.as_str().to_string()).or_default() += 1;
            *summary.failed_by_kind.entry(marker.error_kind.clone()).or_default() += 1;
        }
        match merge {
            Ok(report) => {
                summary.merged = report.total_records;
                summary.merge = Some(report);
            }
            Err(err) if fatal.is_some() => warn!(error = %format!("{err:#}"), "best-effort merge failed"),
            Err(err) => return Err(RunError::Output(err)),
        }

        if let Some(reports_root) = &self.config.reports_dir {
            match write_run_report(reports_root, &summary, &failures).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %format!("{err:#}"), "failed to write run report"),
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => {
                info!(
                    %run_id,
                    extracted = summary.extracted,
                    resumed = summary.resumed,
                    failed = failures.len(),
                    merged = summary.merged,
                    "run complete"
                );
                Ok(summary)
            }
        }
    }

    async fn sweep(
        &self,
        worker: &Arc<DomainWorker>,
        run: &Arc<RunState>,
        todo: Vec<Domain>,
        final_pass: bool,
    ) -> Option<RunError> {
        let workers = self.config.workers.max(1);
        let mut queue = todo.into_iter();
        let mut set = JoinSet::new();
        let mut fatal = None;

        loop {
            while set.len() < workers && !run.is_cancelled() {
                let Some(domain) = queue.next() else {
                    break;
                };
                let span = info_span!("domain", domain = %domain);
                set.spawn(worker.clone().process(run.clone(), domain, final_pass).instrument(span));
            }

            match set.join_next().await {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    warn!(error = %err, "fatal condition, cancelling run");
                    run.cancelled.store(true, Ordering::SeqCst);
                    set.abort_all();
                    fatal.get_or_insert(err);
                }
                Some(Err(join_err)) if join_err.is_cancelled() => {}
                Some(Err(join_err)) => warn!(error = %join_err, "domain task panicked"),
            }
        }
        fatal
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchAllSummary {
    pub requested: usize,
    pub skipped_existing: usize,
    pub fetched: usize,
    pub failed_by_kind: BTreeMap<String, usize>,
}

/// Download and persist raw pages only. Domains that already have a dump are
/// skipped, so repeated calls converge.
pub async fn fetch_all(
    fetcher: Arc<dyn PageFetcher>,
    dumps: &RawDumpStore,
    domains: Vec<Domain>,
    concurrency: usize,
) -> Result<FetchAllSummary, RunError> {
    let mut seen = HashSet::new();
    let domains: Vec<Domain> = domains.into_iter().filter(|d| seen.insert(d.clone())).collect();
    if domains.is_empty() {
        return Err(RunError::EmptyInput);
    }

    let mut summary = FetchAllSummary {
        requested: domains.len(),
        ..Default::default()
    };
    let mut todo = Vec::new();
    for domain in domains {
        if dumps.exists(&domain).await {
            summary.skipped_existing += 1;
        } else {
            todo.push(domain);
        }
    }

    let mut queue = todo.into_iter();
    let mut set = JoinSet::new();
    loop {
        while set.len() < concurrency.max(1) {
            let Some(domain) = queue.next() else {
                break;
            };
            let fetcher = fetcher.clone();
            let span = info_span!("domain", domain = %domain);
            set.spawn(async move { fetcher.fetch(&domain).await }.instrument(span));
        }
        match set.join_next().await {
            None => break,
            Some(Ok(Ok(page))) => {
                if let Err(err) = dumps.store(&page).await {
                    warn!(domain = %page.domain, error = %format!("{err:#}"), "failed to write raw dump");
                    *summary.failed_by_kind.entry("write_failure".to_string()).or_default() += 1;
                } else {
                    summary.fetched += 1;
                }
            }
            Some(Ok(Err(err))) => {
                warn!(stage = "fetch", error_kind = err.kind(), error = %err, "fetch failed");
                *summary.failed_by_kind.entry(err.kind().to_string()).or_default() += 1;
            }
            Some(Err(join_err)) => warn!(error = %join_err, "fetch task panicked"),
        }
    }

    info!(
        fetched = summary.fetched,
        skipped = summary.skipped_existing,
        "fetch-all complete"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReportFile {
    pub summary: RunSummary,
    pub failures: Vec<FailureMarker>,
}

fn summary_markdown(summary: &RunSummary, failures: &[FailureMarker]) -> String {
    let counts = |map: &BTreeMap<String, usize>| {
        if map.is_empty() {
            "- none".to_string()
        } else {
            map.iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    let mut out = format!(
        "# CIQ Run Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Input domains: {}\n- Passes: {}\n- Attempted: {}\n- Resumed from checkpoints: {}\n- Fetched: {}\n- Extracted: {}\n- Merged into corpus: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.input_domains,
        summary.passes,
        summary.attempted,
        summary.resumed,
        summary.fetched,
        summary.extracted,
        summary.merged,
    );
    if let Some(reason) = &summary.aborted {
        out.push_str(&format!("- Aborted: {reason}\n"));
    }
    out.push_str(&format!(
        "\n## Failures by Stage\n{}\n\n## Failures by Kind\n{}\n",
        counts(&summary.failed_by_stage),
        counts(&summary.failed_by_kind)
    ));
    if let Some(merge) = &summary.merge {
        out.push_str(&format!(
            "\n## Field Coverage\n{}\n\n## Sectors\n{}\n",
            counts(&merge.field_coverage),
            counts(&merge.sector_distribution)
        ));
    }
    if !failures.is_empty() {
        out.push_str("\n## Failed Domains\n");
        for marker in failures {
            out.push_str(&format!(
                "- `{}` {} / {}: {}\n",
                marker.domain, marker.stage, marker.error_kind, marker.message
            ));
        }
    }
    out
}

pub async fn write_run_report(
    reports_root: &Path,
    summary: &RunSummary,
    failures: &[FailureMarker],
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut summary = summary.clone();
    summary.reports_dir = Some(reports_dir.display().to_string());
    let file = RunReportFile {
        summary,
        failures: failures.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&file).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(reports_dir.join("summary.md"), summary_markdown(&file.summary, failures))
        .await
        .context("writing summary.md")?;

    Ok(reports_dir)
}

/// Briefs of the most recent `runs` reports, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut reports = Vec::new();
    for dir in dirs {
        let path = dir.path().join("run_summary.json");
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<RunReportFile>(&raw).map_err(anyhow::Error::from));
        match parsed {
            Ok(report) => reports.push(report),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    reports.sort_by(|a, b| b.summary.started_at.cmp(&a.summary.started_at));

    let mut lines = vec!["# CIQ Run Reports".to_string(), String::new()];
    for report in reports.into_iter().take(runs.max(1)) {
        let s = &report.summary;
        lines.push(format!("## Run `{}` ({})", s.run_id, s.started_at));
        lines.push(format!("- domains: {}", s.input_domains));
        lines.push(format!("- extracted: {} (resumed {})", s.extracted, s.resumed));
        lines.push(format!("- failed: {}", report.failures.len()));
        lines.push(format!("- merged: {}", s.merged));
        if let Some(reason) = &s.aborted {
            lines.push(format!("- aborted: {reason}"));
        }
        if let Some(dir) = &s.reports_dir {
            lines.push(format!("- brief: `{}`", Path::new(dir).join("summary.md").display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

pub async fn fetch_all_from_config(
    config: &PipelineConfig,
    domains: Vec<Domain>,
) -> Result<FetchAllSummary, RunError> {
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let dumps = RawDumpStore::new(config.raw_dir());
    fetch_all(Arc::new(fetcher), &dumps, domains, config.fetch_concurrency).await
}

pub async fn merge_from_config(config: &PipelineConfig) -> Result<MergeReport> {
    let store = FsCheckpointStore::new(config.checkpoint_dir());
    Merger::new(Arc::new(store), config.corpus_path()).merge(None).await
}
