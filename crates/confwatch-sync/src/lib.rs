//! Run orchestration: sanitize, probe, reconcile, persist, notify.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use confwatch_core::{Catalog, DateValue, EntityRecord, PlausibleYears};
use confwatch_notify::{
    build_message, chunk_message, compute_change_set, deliver, render_document,
    upcoming_digest, CategoryStyles, LogSink, NotificationSink, WebhookSink,
    DEFAULT_MESSAGE_LIMIT,
};
use confwatch_oracle::{OpenAiBackend, OracleConfig, ReconciliationClient};
use confwatch_sources::{HttpPageSource, PageSource, SourceProbe};
use confwatch_storage::{
    HttpClientConfig, HttpFetcher, RecordStore, SnapshotStore, VersionKey, BROWSER_USER_AGENT,
};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "confwatch-sync";

const DEFAULT_ORACLE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ORACLE_MODEL: &str = "gpt-5-nano";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    /// Run date; every date comparison in a run uses this, never the wall clock.
    pub today: NaiveDate,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub oracle_url: String,
    pub oracle_model: String,
    pub oracle_api_key: Option<String>,
    pub oracle_timeout_secs: u64,
    pub oracle_service_tier: Option<String>,
    pub webhook_url: Option<String>,
    pub message_limit: usize,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: env_string("CONFWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            today: Local::now().date_naive(),
            user_agent: env_string("CONFWATCH_USER_AGENT")
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: env_parsed("CONFWATCH_HTTP_TIMEOUT_SECS", 15),
            oracle_url: env_string("CONFWATCH_ORACLE_URL")
                .unwrap_or_else(|| DEFAULT_ORACLE_URL.to_string()),
            oracle_model: env_string("CONFWATCH_ORACLE_MODEL")
                .unwrap_or_else(|| DEFAULT_ORACLE_MODEL.to_string()),
            oracle_api_key: env_string("OPENAI_API_KEY"),
            oracle_timeout_secs: env_parsed("CONFWATCH_ORACLE_TIMEOUT_SECS", 120),
            oracle_service_tier: env_string("CONFWATCH_ORACLE_SERVICE_TIER"),
            webhook_url: env_string("CONFWATCH_WEBHOOK_URL"),
            message_limit: env_parsed("CONFWATCH_MESSAGE_LIMIT", DEFAULT_MESSAGE_LIMIT),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn categories_path(&self) -> PathBuf {
        self.data_dir.join("categories.yaml")
    }

    pub fn record_store(&self) -> RecordStore {
        RecordStore::new(self.data_dir.clone())
    }

    /// Webhook sink when a URL is configured, otherwise the log.
    pub fn notification_sink(&self) -> Result<Box<dyn NotificationSink>> {
        Ok(match &self.webhook_url {
            Some(url) => Box::new(WebhookSink::new(url.clone(), WEBHOOK_TIMEOUT)?),
            None => Box::new(LogSink),
        })
    }
}

/// Collapse lapsed dates before any fetching happens.
pub fn sanitize(record: &EntityRecord, today: NaiveDate) -> EntityRecord {
    let mut cleaned = record.clone();
    if cleaned.submission_deadline.is_before(today) {
        cleaned.submission_deadline = DateValue::Closed;
    }
    if cleaned.end_date.is_before(today) {
        cleaned.start_date = DateValue::Unknown;
        cleaned.submission_deadline = DateValue::Unknown;
    }
    cleaned
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub urls_checked: usize,
    pub urls_changed: usize,
    pub fetch_failures: usize,
    pub oracle_calls: usize,
    pub oracle_fallbacks: usize,
    /// Key of the version written by this run; `None` when the catalog was unchanged.
    pub version_key: Option<String>,
    pub changed_entities: usize,
    pub chunks_sent: usize,
}

/// Grouped change message between the two newest rendered documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    pub message: String,
    pub changed_entities: usize,
}

pub async fn pending_changes(store: &RecordStore, today: NaiveDate) -> Result<Option<ChangeReport>> {
    let docs = store.latest_rendered(2).await?;
    let [old, new] = docs.as_slice() else {
        info!(documents = docs.len(), "not enough rendered documents to compare");
        return Ok(None);
    };
    let changes = compute_change_set(&old.text, &new.text);
    Ok(build_message(&changes, today).map(|message| ChangeReport {
        message,
        changed_entities: changes.len(),
    }))
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: RecordStore,
    snapshots: SnapshotStore,
    pages: Box<dyn PageSource>,
    oracle: ReconciliationClient,
    sink: Box<dyn NotificationSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        if config.oracle_api_key.is_none() {
            warn!("OPENAI_API_KEY is not set; oracle calls will fall back to sanitized records");
        }
        let backend = OpenAiBackend::new(
            config.oracle_url.clone(),
            config.oracle_model.clone(),
            config.oracle_api_key.clone(),
            Duration::from_secs(config.oracle_timeout_secs),
        )?
        .with_service_tier(config.oracle_service_tier.clone());
        let sink = config.notification_sink()?;

        Ok(Self {
            store: config.record_store(),
            snapshots: SnapshotStore::new(config.snapshots_dir()),
            pages: Box::new(HttpPageSource::new(http)),
            oracle: ReconciliationClient::new(Box::new(backend), OracleConfig::default()),
            sink,
            config,
        })
    }

    pub fn with_sources(mut self, pages: Box<dyn PageSource>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_oracle(mut self, oracle: ReconciliationClient) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id, today = %self.config.today))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let today = self.config.today;
        let previous = self
            .store
            .latest_version()
            .await?
            .context("record store is empty; run `confwatch init --catalog <file>` first")?;
        info!(version = %previous.key, entities = previous.catalog.entity_count(), "loaded catalog");
        let styles = CategoryStyles::load(&self.config.categories_path()).await?;

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            entities: 0,
            urls_checked: 0,
            urls_changed: 0,
            fetch_failures: 0,
            oracle_calls: 0,
            oracle_fallbacks: 0,
            version_key: None,
            changed_entities: 0,
            chunks_sent: 0,
        };

        // a version whose document never got written would otherwise stay unannounced forever
        let recovered = !self.store.has_rendered(previous.key).await?;
        if recovered {
            warn!(version = %previous.key, "rendered document missing; re-rendering");
            self.store
                .write_rendered(previous.key, &render_document(&previous.catalog, &styles, today))
                .await
                .with_context(|| format!("persisting rendered document {}", previous.key))?;
        }

        let probe = SourceProbe::new(self.pages.as_ref(), &self.snapshots);
        let mut updated = Catalog::new();
        for category in previous.catalog.categories() {
            let mut entities = Vec::with_capacity(category.entities.len());
            for entity in &category.entities {
                info!(entity = %entity.name, "checking");
                summary.entities += 1;
                let sanitized = sanitize(entity, today);
                let years = PlausibleYears::for_today(sanitized.previous_year, today);
                let outcome = probe.probe(run_id, &sanitized, years).await;
                summary.urls_checked += outcome.urls_checked;
                summary.urls_changed += outcome.urls_changed;
                summary.fetch_failures += outcome.fetch_failures();

                if !outcome.has_candidates() {
                    entities.push(sanitized);
                    continue;
                }
                let reconciled = self
                    .oracle
                    .reconcile(run_id, sanitized, &outcome.candidate_text, &outcome.years, today)
                    .await;
                summary.oracle_calls += usize::from(reconciled.invoked_oracle());
                summary.oracle_fallbacks += usize::from(reconciled.fell_back());
                entities.push(reconciled.record);
            }
            updated.push_category(category.name.clone(), entities);
        }

        if updated == previous.catalog {
            info!("no changes detected; nothing written");
            if recovered {
                self.announce(today, &mut summary).await;
            }
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let document = render_document(&updated, &styles, today);
        let key = self
            .store
            .write_version(today, &updated)
            .await
            .context("persisting record version")?;
        self.store
            .write_rendered(key, &document)
            .await
            .with_context(|| format!("persisting rendered document {key}"))?;
        info!(version = %key, "record version written");
        summary.version_key = Some(key.to_string());

        self.announce(today, &mut summary).await;
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Diff the two newest documents and send the result. Failures here never fail the run.
    async fn announce(&self, today: NaiveDate, summary: &mut SyncRunSummary) {
        let report = match pending_changes(&self.store, today).await {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not compute change set; skipping notification");
                return;
            }
        };
        let chunks = chunk_message(&report.message, self.config.message_limit);
        let delivery = deliver(self.sink.as_ref(), &chunks).await;
        summary.changed_entities = report.changed_entities;
        summary.chunks_sent = delivery.sent;
    }
}

/// Seed an empty Record Store with `catalog_path` as its first version.
pub async fn init_store(config: &SyncConfig, catalog_path: &Path) -> Result<VersionKey> {
    let store = config.record_store();
    if let Some(existing) = store.list_versions().await?.last() {
        bail!(
            "record store {} already has history (latest version {existing})",
            config.data_dir.display()
        );
    }
    let text = fs::read_to_string(catalog_path)
        .await
        .with_context(|| format!("reading {}", catalog_path.display()))?;
    let catalog: Catalog = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", catalog_path.display()))?;
    catalog.validate()?;
    let styles = CategoryStyles::load(&config.categories_path()).await?;
    let document = render_document(&catalog, &styles, config.today);

    let key = store.write_version(config.today, &catalog).await?;
    store.write_rendered(key, &document).await?;
    info!(version = %key, entities = catalog.entity_count(), "record store initialized");
    Ok(key)
}

pub async fn latest_document(config: &SyncConfig) -> Result<Option<String>> {
    Ok(config
        .record_store()
        .latest_rendered(1)
        .await?
        .pop()
        .map(|doc| doc.text))
}

pub async fn upcoming(config: &SyncConfig) -> Result<Option<String>> {
    let Some(latest) = config.record_store().latest_version().await? else {
        return Ok(None);
    };
    Ok(upcoming_digest(&latest.catalog, config.today))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}
