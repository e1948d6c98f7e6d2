use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ciq_core::{Checkpoint, Domain, FetchError, IoError, RawPage, SCHEMA_FIELDS};
use ciq_extract::{Extractor, ExtractorConfig, InferenceClient, InferenceError, RetryPolicy};
use ciq_pipeline::{Orchestrator, OrchestratorConfig, RunError};
use ciq_storage::{CheckpointStore, FsCheckpointStore, PageFetcher, RawDumpStore};

fn d(s: &str) -> Domain {
    Domain::parse(s).expect("domain")
}

fn page_html(name: &str) -> String {
    format!(
        "<html><head><title>{name}</title></head><body><nav>Home</nav>\
         <p>{name} designs and sells industrial widgets to construction firms in Ohio.</p></body></html>"
    )
}

/// Tracks how many calls overlap.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    async fn hold(&self, latency: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeFetcher {
    scripted: Mutex<HashMap<Domain, VecDeque<Result<String, FetchError>>>>,
    calls: Mutex<HashMap<Domain, usize>>,
    latency: Duration,
    in_flight: InFlight,
}

impl FakeFetcher {
    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn script(self, domain: &str, replies: Vec<Result<String, FetchError>>) -> Self {
        self.scripted.lock().unwrap().insert(d(domain), replies.into());
        self
    }

    fn calls(&self, domain: &str) -> usize {
        self.calls.lock().unwrap().get(&d(domain)).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, domain: &Domain) -> Result<RawPage, FetchError> {
        *self.calls.lock().unwrap().entry(domain.clone()).or_default() += 1;
        self.in_flight.hold(self.latency).await;
        let reply = {
            let mut scripted = self.scripted.lock().unwrap();
            match scripted.get_mut(domain) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        let html = reply.unwrap_or_else(|| Ok(page_html(&domain.display_name())))?;
        Ok(RawPage {
            domain: domain.clone(),
            url_fetched: format!("https://{domain}/"),
            status_code: 200,
            html_bytes: html.into_bytes(),
            fetched_at: Utc::now(),
        })
    }
}

/// Replies per domain, keyed off the `Domain:` line of the prompt. The last
/// scripted reply repeats.
#[derive(Default)]
struct FakeModel {
    scripted: Mutex<HashMap<String, VecDeque<Result<String, InferenceError>>>>,
    fallback: Option<Result<String, InferenceError>>,
    calls: AtomicUsize,
    latency: Duration,
    in_flight: InFlight,
}

impl FakeModel {
    fn script(self, domain: &str, replies: Vec<Result<String, InferenceError>>) -> Self {
        self.scripted.lock().unwrap().insert(domain.to_string(), replies.into());
        self
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn always(reply: Result<String, InferenceError>) -> Self {
        Self {
            fallback: Some(reply),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for FakeModel {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.hold(self.latency).await;
        let domain = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Domain: "))
            .unwrap_or_default()
            .to_string();
        let mut scripted = self.scripted.lock().unwrap();
        match scripted.get_mut(&domain) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Ok(format!("{{\"company_name\": \"{domain}\"}}"))),
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    fetcher: Arc<FakeFetcher>,
    model: Arc<FakeModel>,
    store: Arc<FsCheckpointStore>,
}

impl Harness {
    fn new(fetcher: FakeFetcher, model: FakeModel) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        Self {
            store: Arc::new(FsCheckpointStore::new(root.join("checkpoints"))),
            _dir: dir,
            root,
            fetcher: Arc::new(fetcher),
            model: Arc::new(model),
        }
    }

    fn corpus_path(&self) -> PathBuf {
        self.root.join("output").join("companies.json")
    }

    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fetch_concurrency: 2,
            workers: 3,
            max_passes: 1,
            retry_failed: true,
            reuse_raw_dumps: false,
            unavailable_threshold: 3,
            corpus_path: self.corpus_path(),
            reports_dir: Some(self.root.join("reports")),
        }
    }

    fn orchestrator(&self, config: OrchestratorConfig, max_attempts: usize) -> Orchestrator {
        let extractor = Extractor::new(
            self.model.clone(),
            ExtractorConfig {
                retry: RetryPolicy::immediate(max_attempts),
                inference_timeout: Duration::from_secs(5),
                inference_concurrency: 1,
            },
        );
        Orchestrator::new(config, self.fetcher.clone(), Arc::new(extractor), self.store.clone())
    }

    fn corpus(&self) -> Vec<serde_json::Value> {
        read_json_array(&self.corpus_path())
    }
}

fn read_json_array(path: &Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read(path).expect("corpus exists");
    serde_json::from_slice(&raw).expect("corpus is a JSON array")
}

fn abc_harness() -> Harness {
    Harness::new(
        FakeFetcher::default().script("a.com", vec![Err(FetchError::Timeout)]),
        FakeModel::default()
            .script(
                "b.com",
                vec![
                    Ok("Sorry, I cannot produce JSON today.".into()),
                    Ok(r#"{"company_name": "B Corp", "industry": "Manufacturing", "locations": "Ohio, Texas"}"#.into()),
                ],
            )
            .script("c.com", vec![Ok(r#"```json
{"company_name": "C Inc", "sector": "Industrials", "ceo_mood": "happy"}
```"#
                .into())]),
    )
}

#[tokio::test]
async fn failures_are_isolated_and_the_corpus_holds_only_extracted_domains() {
    let h = abc_harness();
    let summary = h
        .orchestrator(h.config(), 3)
        .run(vec![d("a.com"), d("b.com"), d("c.com")])
        .await
        .expect("run succeeds despite per-domain failures");

    assert_eq!(summary.input_domains, 3);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.merged, 2);
    assert_eq!(summary.failed_by_stage.get("fetch"), Some(&1));
    assert_eq!(summary.failed_by_kind.get("timeout"), Some(&1));
    assert_eq!(h.model.calls(), 3);

    let corpus = h.corpus();
    assert_eq!(corpus.len(), 2);
    assert_eq!(corpus[0]["company_name"], "B Corp");
    assert_eq!(corpus[0]["domain"], "b.com");
    assert_eq!(corpus[0]["locations"], serde_json::json!(["Ohio", "Texas"]));
    assert_eq!(corpus[1]["company_name"], "C Inc");
    for record in &corpus {
        let object = record.as_object().expect("object");
        assert_eq!(object.len(), SCHEMA_FIELDS.len());
        for field in SCHEMA_FIELDS {
            assert!(object.contains_key(field), "missing {field}");
        }
        assert!(!object.contains_key("ceo_mood"));
    }

    match h.store.load(&d("a.com")).await.expect("load") {
        Some(Checkpoint::Failed(marker)) => assert_eq!(marker.error_kind, "timeout"),
        other => panic!("expected failure marker, got {other:?}"),
    }

    let reports_dir = PathBuf::from(summary.reports_dir.expect("report written"));
    assert!(reports_dir.join("run_summary.json").exists());
    assert!(reports_dir.join("summary.md").exists());
}

#[tokio::test]
async fn rerunning_skips_extracted_domains_and_keeps_the_corpus_byte_identical() {
    let h = abc_harness();
    let domains = vec![d("a.com"), d("b.com"), d("c.com")];
    h.orchestrator(h.config(), 3)
        .run(domains.clone())
        .await
        .expect("first run");
    let first_corpus = std::fs::read(h.corpus_path()).expect("corpus");
    let fetches = h.fetcher.total_calls();
    let inferences = h.model.calls();

    let summary = h
        .orchestrator(
            OrchestratorConfig {
                retry_failed: false,
                ..h.config()
            },
            3,
        )
        .run(domains.clone())
        .await
        .expect("second run");
    assert_eq!(summary.resumed, 3);
    assert_eq!(h.fetcher.total_calls(), fetches);
    assert_eq!(h.model.calls(), inferences);
    assert_eq!(std::fs::read(h.corpus_path()).expect("corpus"), first_corpus);

    h.orchestrator(h.config(), 3)
        .run(domains)
        .await
        .expect("third run");
    assert_eq!(h.fetcher.calls("a.com"), 2, "failed domain is retried");
    assert_eq!(h.fetcher.calls("b.com"), 1);
    assert_eq!(h.fetcher.calls("c.com"), 1);
    assert_eq!(h.model.calls(), inferences);
}

#[tokio::test]
async fn a_run_corpus_holds_only_that_runs_input_domains() {
    let h = Harness::new(FakeFetcher::default(), FakeModel::default());
    h.orchestrator(h.config(), 3)
        .run(vec![d("old.com")])
        .await
        .expect("first run");

    let summary = h
        .orchestrator(h.config(), 3)
        .run(vec![d("new.com")])
        .await
        .expect("second run");
    assert_eq!(summary.merged, 1);
    let corpus = h.corpus();
    assert_eq!(corpus.len(), 1);
    assert_eq!(corpus[0]["domain"], "new.com");
    assert!(matches!(
        h.store.load(&d("old.com")).await,
        Ok(Some(Checkpoint::Extracted(_)))
    ));
}

#[tokio::test]
async fn transient_failures_are_retried_on_the_next_pass() {
    let h = Harness::new(
        FakeFetcher::default().script(
            "a.com",
            vec![Err(FetchError::Timeout), Ok(page_html("Acme"))],
        ),
        FakeModel::default().script(
            "b.com",
            vec![
                Err(InferenceError::Timeout),
                Ok(r#"{"company_name": "B Corp"}"#.into()),
            ],
        ),
    );
    let summary = h
        .orchestrator(
            OrchestratorConfig {
                max_passes: 2,
                ..h.config()
            },
            1,
        )
        .run(vec![d("a.com"), d("b.com")])
        .await
        .expect("run");

    assert_eq!(summary.passes, 2);
    assert_eq!(summary.attempted, 2, "a domain retried on a later pass counts once");
    assert_eq!(summary.extracted, 2);
    assert_eq!(h.fetcher.calls("a.com"), 2);
    assert_eq!(h.fetcher.calls("b.com"), 1, "deferred extraction reuses the cleaned page");
    assert_eq!(h.corpus().len(), 2);
}

#[tokio::test]
async fn thin_pages_fail_in_the_clean_stage_without_inference() {
    let h = Harness::new(
        FakeFetcher::default().script(
            "spa.io",
            vec![Ok("<html><body><div id=\"root\"></div><script>boot()</script></body></html>".into())],
        ),
        FakeModel::default(),
    );
    let summary = h
        .orchestrator(h.config(), 3)
        .run(vec![d("spa.io")])
        .await
        .expect("run");

    assert_eq!(summary.failed_by_stage.get("clean"), Some(&1));
    assert_eq!(summary.failed_by_kind.get("empty_content"), Some(&1));
    assert_eq!(summary.statuses.get("extract_failed"), Some(&1));
    assert_eq!(h.model.calls(), 0);
    assert!(h.corpus().is_empty());
}

#[tokio::test]
async fn raw_dumps_survive_clean_failures_and_are_reused_on_rerun() {
    let h = Harness::new(
        FakeFetcher::default().script(
            "spa.io",
            vec![Ok("<html><body><div id=\"root\"></div><script>boot()</script></body></html>".into())],
        ),
        FakeModel::default(),
    );
    let dumps = RawDumpStore::new(h.root.join("raw"));
    let config = OrchestratorConfig {
        reuse_raw_dumps: true,
        ..h.config()
    };

    let first = h
        .orchestrator(config.clone(), 3)
        .with_raw_dumps(dumps.clone())
        .run(vec![d("spa.io")])
        .await
        .expect("first run");
    assert_eq!(first.failed_by_stage.get("clean"), Some(&1));
    assert!(h.root.join("raw").join("spa.io").join("index.html").exists());
    assert_eq!(h.fetcher.total_calls(), 1);

    let second = h
        .orchestrator(config, 3)
        .with_raw_dumps(dumps)
        .run(vec![d("spa.io")])
        .await
        .expect("second run");
    assert_eq!(second.failed_by_stage.get("clean"), Some(&1));
    assert_eq!(h.fetcher.total_calls(), 1, "dump reused instead of fetching");
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn fetch_and_inference_caps_bound_calls_in_flight() {
    let h = Harness::new(
        FakeFetcher::slow(Duration::from_millis(20)),
        FakeModel::slow(Duration::from_millis(20)),
    );
    let domains: Vec<Domain> = (0..8).map(|i| d(&format!("site{i}.com"))).collect();
    let summary = h
        .orchestrator(
            OrchestratorConfig {
                fetch_concurrency: 2,
                workers: 6,
                ..h.config()
            },
            1,
        )
        .run(domains)
        .await
        .expect("run");

    assert_eq!(summary.extracted, 8);
    assert_eq!(h.fetcher.total_calls(), 8);
    let fetch_peak = h.fetcher.in_flight.peak();
    assert!((1..=2).contains(&fetch_peak), "fetch peak {fetch_peak}");
    assert_eq!(h.model.in_flight.peak(), 1);
}

#[tokio::test]
async fn corrupt_checkpoints_are_rerun_and_duplicate_inputs_processed_once() {
    let h = Harness::new(FakeFetcher::default(), FakeModel::default());
    std::fs::create_dir_all(h.root.join("checkpoints")).expect("dir");
    std::fs::write(h.store.path_for(&d("d.com")), b"{\"company_name\": \"D").expect("corrupt");

    let summary = h
        .orchestrator(h.config(), 3)
        .run(vec![d("d.com"), d("D.com"), d("https://d.com/")])
        .await
        .expect("run");

    assert_eq!(summary.input_domains, 1);
    assert_eq!(h.fetcher.calls("d.com"), 1);
    assert!(matches!(
        h.store.load(&d("d.com")).await,
        Ok(Some(Checkpoint::Extracted(_)))
    ));
    assert_eq!(summary.merge.expect("merge").skipped_corrupt, 0);
}

#[tokio::test]
async fn sustained_inference_outage_aborts_after_a_best_effort_merge() {
    let h = Harness::new(
        FakeFetcher::default(),
        FakeModel::always(Err(InferenceError::Unavailable("connection refused".into()))),
    );
    let err = h
        .orchestrator(
            OrchestratorConfig {
                workers: 1,
                unavailable_threshold: 2,
                ..h.config()
            },
            1,
        )
        .run(vec![d("w.com"), d("x.com"), d("y.com"), d("z.com")])
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::InferenceUnavailable { consecutive: 2 }));
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.fetcher.total_calls(), 2);
    assert!(h.corpus().is_empty(), "merge still ran");
    assert!(matches!(h.store.load(&d("w.com")).await, Ok(Some(Checkpoint::Failed(_)))));
    assert!(matches!(h.store.load(&d("x.com")).await, Ok(None)));
}

#[tokio::test]
async fn empty_input_is_fatal() {
    let h = Harness::new(FakeFetcher::default(), FakeModel::default());
    let err = h.orchestrator(h.config(), 3).run(Vec::new()).await.unwrap_err();
    assert!(matches!(err, RunError::EmptyInput));
    assert!(!h.corpus_path().exists());
}

struct ReadOnlyStore;

#[async_trait]
impl CheckpointStore for ReadOnlyStore {
    async fn load(&self, _domain: &Domain) -> Result<Option<Checkpoint>, IoError> {
        Ok(None)
    }

    async fn save(&self, domain: &Domain, _checkpoint: &Checkpoint) -> Result<(), IoError> {
        Err(IoError::WriteFailure {
            path: format!("{}.json", domain.storage_key()),
            message: "read-only file system".into(),
        })
    }

    async fn domains(&self) -> Result<Vec<Domain>, IoError> {
        Ok(Vec::new())
    }

    async fn check_writable(&self) -> Result<(), IoError> {
        Ok(())
    }
}

#[tokio::test]
async fn checkpoint_write_failures_abort_without_merging() {
    let h = Harness::new(FakeFetcher::default(), FakeModel::default());
    let extractor = Extractor::new(h.model.clone(), ExtractorConfig::default());
    let orchestrator = Orchestrator::new(
        h.config(),
        h.fetcher.clone(),
        Arc::new(extractor),
        Arc::new(ReadOnlyStore),
    );

    let err = orchestrator.run(vec![d("a.com")]).await.unwrap_err();
    assert!(matches!(err, RunError::StorageUnwritable(IoError::WriteFailure { .. })));
    assert!(!h.corpus_path().exists());
}
