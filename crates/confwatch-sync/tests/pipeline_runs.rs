use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use confwatch_core::DateValue;
use confwatch_notify::{NotificationSendError, NotificationSink};
use confwatch_oracle::{BackendError, OracleBackend, OracleConfig, ReconciliationClient};
use confwatch_sources::PageSource;
use confwatch_storage::{FetchError, RetryPolicy, VersionKey};
use confwatch_sync::{init_store, pending_changes, SyncConfig, SyncPipeline};
use tempfile::tempdir;
use uuid::Uuid;

const MSAM_REPLY: &str = r#"{"start_date": "2027-04-07", "end_date": "2027-04-10",
    "location": "Chicago, Illinois, USA", "submission_deadline": "2026-11-30"}"#;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).expect("valid date")
}

fn catalog_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog.json")
}

fn config(data_dir: &Path) -> SyncConfig {
    SyncConfig::from_env()
        .with_data_dir(data_dir)
        .with_today(today())
}

struct StaticPages(HashMap<String, String>);

impl StaticPages {
    fn standard() -> Self {
        Self(
            [
                (
                    "https://www.measurement.example/2027-annual-meeting",
                    "<h1>2027 Annual Meeting</h1><p>April 7-10, 2027</p><p>Chicago, Illinois</p>",
                ),
                (
                    "https://www.measurement.example/call-for-proposals",
                    "<p>Proposals due November 30</p>",
                ),
                ("https://convention.example/dates", "<p>See you next year!</p>"),
            ]
            .into_iter()
            .map(|(url, html)| (url.to_string(), html.to_string()))
            .collect(),
        )
    }
}

#[async_trait]
impl PageSource for StaticPages {
    async fn fetch_page(&self, _run_id: Uuid, url: &str) -> Result<String, FetchError> {
        self.0.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

/// Replaces one store directory with a plain file on the first fetch, so the
/// run's later writes under it fail.
struct BlockingPages {
    pages: StaticPages,
    victim: PathBuf,
    armed: AtomicBool,
}

impl BlockingPages {
    fn new(victim: PathBuf) -> Self {
        Self {
            pages: StaticPages::standard(),
            victim,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl PageSource for BlockingPages {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            std::fs::rename(&self.victim, self.victim.with_extension("moved")).expect("move aside");
            std::fs::write(&self.victim, "not a directory").expect("block");
        }
        self.pages.fetch_page(run_id, url).await
    }
}

fn unblock(victim: &Path) {
    std::fs::remove_file(victim).expect("remove blocker");
    std::fs::rename(victim.with_extension("moved"), victim).expect("restore");
}

#[derive(Default)]
struct OracleCalls(AtomicUsize);

/// Answers for the measurement meeting, keeps everything else as-is.
struct ScriptedOracle {
    calls: Arc<OracleCalls>,
    available: bool,
}

#[async_trait]
impl OracleBackend for ScriptedOracle {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String, BackendError> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(BackendError::Status {
                status: 503,
                body: "overloaded".into(),
            });
        }
        if user.contains("Measurement Society Annual Meeting") {
            Ok(MSAM_REPLY.to_string())
        } else {
            Ok("{}".to_string())
        }
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, chunk: &str) -> Result<(), NotificationSendError> {
        self.0.lock().unwrap().push(chunk.to_string());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn send(&self, _chunk: &str) -> Result<(), NotificationSendError> {
        Err(NotificationSendError::Status {
            status: 500,
            body: "webhook down".into(),
        })
    }
}

fn pipeline(config: SyncConfig, available: bool) -> (SyncPipeline, Arc<OracleCalls>, RecordingSink) {
    pipeline_with(config, available, Box::new(StaticPages::standard()))
}

fn pipeline_with(
    config: SyncConfig,
    available: bool,
    pages: Box<dyn PageSource>,
) -> (SyncPipeline, Arc<OracleCalls>, RecordingSink) {
    let calls = Arc::new(OracleCalls::default());
    let oracle = ReconciliationClient::new(
        Box::new(ScriptedOracle {
            calls: calls.clone(),
            available,
        }),
        OracleConfig {
            retry: RetryPolicy::fixed(3, Duration::ZERO),
            ..Default::default()
        },
    );
    let sink = RecordingSink::default();
    let pipeline = SyncPipeline::new(config)
        .expect("pipeline")
        .with_sources(pages)
        .with_oracle(oracle)
        .with_sink(Box::new(sink.clone()));
    (pipeline, calls, sink)
}

#[tokio::test]
async fn run_requires_an_initialized_store() {
    let dir = tempdir().expect("tempdir");
    let (pipeline, _, _) = pipeline(config(dir.path()), true);
    let err = pipeline.run_once().await.expect_err("empty store");
    assert!(format!("{err:#}").contains("confwatch init"));
}

#[tokio::test]
async fn init_refuses_to_overwrite_history() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    let key = init_store(&config, &catalog_fixture()).await.expect("init");
    assert_eq!(key, VersionKey::first_of(today()));
    assert!(init_store(&config, &catalog_fixture()).await.is_err());
}

#[tokio::test]
async fn changed_pages_are_reconciled_persisted_and_announced() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let (pipeline, calls, sink) = pipeline(config.clone(), true);

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.entities, 2);
    assert_eq!(summary.urls_checked, 4);
    assert_eq!(summary.urls_changed, 3);
    assert_eq!(summary.fetch_failures, 1);
    assert_eq!(summary.oracle_calls, 2);
    assert_eq!(calls.0.load(Ordering::SeqCst), 2);
    assert_eq!(summary.oracle_fallbacks, 0);
    assert_eq!(summary.version_key.as_deref(), Some("2026_10_16_r2"));
    assert_eq!(summary.changed_entities, 2);
    assert_eq!(summary.chunks_sent, 1);

    let latest = config
        .record_store()
        .latest_version()
        .await
        .expect("load")
        .expect("version");
    let (_, msam) = latest.catalog.entities().next().expect("entity");
    assert_eq!(msam.location, "Chicago, Illinois, USA");
    assert_eq!(
        msam.submission_deadline,
        DateValue::Date(NaiveDate::from_ymd_opt(2026, 11, 30).expect("date"))
    );
    let (_, csc) = latest.catalog.entities().nth(1).expect("entity");
    assert_eq!(csc.start_date, DateValue::Unknown);
    assert_eq!(csc.extra["organizer"], "Cognitive Science Society");

    let sent = sink.0.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert!(message.starts_with("\u{1F4E2} **Conference Updates Detected** (2026-10-16)"));
    assert!(message.contains("**Measurement Society Annual Meeting**\nRemoved: * Date unknown\n"));
    assert!(message.contains("* April 7\u{2013}10, 2027 -- Chicago, Illinois, USA"));
    assert!(message.contains("* Submission Deadline: November 30, 2026"));
    assert!(message.contains("Removed: * Submission Deadline: Closed"));
    assert!(!message.contains("## "));
}

#[tokio::test]
async fn rerun_without_page_changes_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let (pipeline, calls, sink) = pipeline(config.clone(), true);
    pipeline.run_once().await.expect("first run");
    let versions_before = config.record_store().list_versions().await.expect("list");

    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.urls_changed, 0);
    assert_eq!(second.oracle_calls, 0);
    assert_eq!(calls.0.load(Ordering::SeqCst), 2);
    assert_eq!(second.version_key, None);
    assert_eq!(second.chunks_sent, 0);
    assert_eq!(
        config.record_store().list_versions().await.expect("list"),
        versions_before
    );
    assert_eq!(sink.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unavailable_oracle_keeps_sanitized_records() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let (pipeline, calls, _) = pipeline(config.clone(), false);

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.oracle_fallbacks, 2);
    assert_eq!(calls.0.load(Ordering::SeqCst), 6);
    // the lapsed convention still changed, so a version is written
    assert!(summary.version_key.is_some());

    let latest = config
        .record_store()
        .latest_version()
        .await
        .expect("load")
        .expect("version");
    let (_, msam) = latest.catalog.entities().next().expect("entity");
    assert_eq!(msam.location, "unknown");
    assert_eq!(msam.start_date, DateValue::Unknown);

    let report = pending_changes(&config.record_store(), today())
        .await
        .expect("diff")
        .expect("changes");
    assert_eq!(report.changed_entities, 1);
}

#[tokio::test]
async fn malformed_styles_abort_before_anything_is_written() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    std::fs::write(config.categories_path(), "categories: [unclosed").expect("write styles");
    let (pipeline, calls, sink) = pipeline(config.clone(), true);

    let err = pipeline.run_once().await.expect_err("bad styles");
    assert!(format!("{err:#}").contains("categories.yaml"));
    assert_eq!(calls.0.load(Ordering::SeqCst), 0);
    let store = config.record_store();
    assert_eq!(store.list_versions().await.expect("list").len(), 1);
    assert!(sink.0.lock().unwrap().is_empty());

    std::fs::remove_file(config.categories_path()).expect("remove styles");
    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.version_key.as_deref(), Some("2026_10_16_r2"));
    assert_eq!(store.latest_rendered(5).await.expect("rendered").len(), 2);
    assert_eq!(sink.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn version_write_failure_aborts_without_notification() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let store = config.record_store();
    let pages = BlockingPages::new(store.versions_dir());
    let (pipeline, _, sink) = pipeline_with(config.clone(), true, Box::new(pages));

    let err = pipeline.run_once().await.expect_err("versions blocked");
    assert!(format!("{err:#}").contains("persisting record version"));
    assert!(sink.0.lock().unwrap().is_empty());
    assert_eq!(store.latest_rendered(5).await.expect("rendered").len(), 1);

    unblock(&store.versions_dir());
    assert_eq!(
        store.list_versions().await.expect("list"),
        vec![VersionKey::first_of(today())]
    );
}

#[tokio::test]
async fn missing_rendered_document_is_restored_and_announced() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let store = config.record_store();
    let pages = BlockingPages::new(store.rendered_dir());
    let (pipeline, _, sink) = pipeline_with(config.clone(), true, Box::new(pages));

    let err = pipeline.run_once().await.expect_err("rendered blocked");
    assert!(format!("{err:#}").contains("persisting rendered document 2026_10_16_r2"));
    assert!(sink.0.lock().unwrap().is_empty());
    unblock(&store.rendered_dir());
    let written = VersionKey::parse("2026_10_16_r2").expect("key");
    assert!(!store.has_rendered(written).await.expect("check"));

    // pages are unchanged now, so only the restored document drives the announcement
    let summary = pipeline.run_once().await.expect("rerun");
    assert_eq!(summary.version_key, None);
    assert!(store.has_rendered(written).await.expect("check"));
    assert_eq!(summary.changed_entities, 2);
    assert_eq!(summary.chunks_sent, 1);
    let sent = sink.0.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("* April 7\u{2013}10, 2027 -- Chicago, Illinois, USA"));
}

#[tokio::test]
async fn failed_notification_keeps_stored_data() {
    let dir = tempdir().expect("tempdir");
    let config = config(dir.path());
    init_store(&config, &catalog_fixture()).await.expect("init");
    let (pipeline, _, _) = pipeline(config.clone(), true);
    let pipeline = pipeline.with_sink(Box::new(FailingSink));

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.version_key.as_deref(), Some("2026_10_16_r2"));
    assert_eq!(summary.changed_entities, 2);
    assert_eq!(summary.chunks_sent, 0);

    let store = config.record_store();
    let latest = store.latest_version().await.expect("load").expect("version");
    assert_eq!(latest.key.to_string(), "2026_10_16_r2");
    let (_, msam) = latest.catalog.entities().next().expect("entity");
    assert_eq!(msam.location, "Chicago, Illinois, USA");
    assert_eq!(store.latest_rendered(5).await.expect("rendered").len(), 2);
    let report = pending_changes(&store, today()).await.expect("diff").expect("changes");
    assert_eq!(report.changed_entities, 2);
}
