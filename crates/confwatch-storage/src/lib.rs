//! Snapshot + record version storage, HTTP fetch, and the shared retry policy for confwatch.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use confwatch_core::Catalog;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "confwatch-storage";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36";

const MAX_SNAPSHOT_KEY_CHARS: usize = 150;
const VERSION_DATE_FORMAT: &str = "%Y_%m_%d";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write via temp file + rename. With `overwrite == false` an existing target is an error.
async fn write_file_atomically(path: &Path, bytes: &[u8], overwrite: bool) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    if !overwrite && fs::try_exists(path).await? {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        ));
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[derive(Debug, Error)]
#[error("writing snapshot {path}: {source}")]
pub struct SnapshotWriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Last-seen extracted page text, one file per (entity, URL).
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

    /// `<ABBR>_<url with non-word runs collapsed to '_'>`, hashed when too long for a file name.
    pub fn snapshot_key(abbreviation: &str, url: &str) -> String {
        let mut sanitized = String::with_capacity(url.len());
        let mut in_run = false;
        for ch in url.chars() {
            if ch.is_alphanumeric() || ch == '_' {
                sanitized.push(ch);
                in_run = false;
            } else if !in_run {
                sanitized.push('_');
                in_run = true;
            }
        }
        let key = format!("{abbreviation}_{sanitized}");
        if key.chars().count() <= MAX_SNAPSHOT_KEY_CHARS {
            return key;
        }
        let prefix: String = key.chars().take(MAX_SNAPSHOT_KEY_CHARS).collect();
        let digest = sha256_hex(url.as_bytes());
        format!("{prefix}_{}", &digest[..16])
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.txt"))
    }

    /// `None` when the snapshot is missing or empty.
    pub async fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(text) if text.is_empty() => Ok(None),
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading snapshot {}", path.display())),
        }
    }

    pub async fn write(&self, key: &str, text: &str) -> Result<PathBuf, SnapshotWriteError> {
        let path = self.path_for(key);
        write_file_atomically(&path, text.as_bytes(), true)
            .await
            .map_err(|source| SnapshotWriteError {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// Identity of one record version: run date plus same-day revision (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionKey {
    pub date: NaiveDate,
    pub revision: u32,
}

impl VersionKey {
    pub fn first_of(date: NaiveDate) -> Self {
        Self { date, revision: 1 }
    }

    pub fn parse(stem: &str) -> Option<Self> {
        let date_part = stem.get(..10)?;
        let date = NaiveDate::parse_from_str(date_part, VERSION_DATE_FORMAT).ok()?;
        let rest = &stem[10..];
        let revision = if rest.is_empty() {
            1
        } else {
            let n: u32 = rest.strip_prefix("_r")?.parse().ok()?;
            if n < 2 {
                return None;
            }
            n
        };
        Some(Self { date, revision })
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format(VERSION_DATE_FORMAT))?;
        if self.revision > 1 {
            write!(f, "_r{}", self.revision)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RecordPersistError {
    #[error("serializing record version {key}: {source}")]
    Serialize {
        key: VersionKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("record version {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub key: VersionKey,
    pub catalog: Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub key: VersionKey,
    pub text: String,
}

/// Append-only store of dated catalog versions and their rendered documents.
///
/// Single writer: callers serialize runs; nothing here locks.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    pub fn rendered_dir(&self) -> PathBuf {
        self.root.join("rendered")
    }

    fn post_log_path(&self) -> PathBuf {
        self.root.join("post_log.txt")
    }

    pub fn version_path(&self, key: VersionKey) -> PathBuf {
        self.versions_dir().join(format!("{key}.json"))
    }

    pub fn rendered_path(&self, key: VersionKey) -> PathBuf {
        self.rendered_dir().join(format!("{key}.md"))
    }

    async fn list_keys(dir: &Path, extension: &str) -> anyhow::Result<Vec<VersionKey>> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(VersionKey::parse) {
                Some(key) => keys.push(key),
                None => debug!(path = %path.display(), "ignoring file with unrecognized version name"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// All version keys, oldest first.
    pub async fn list_versions(&self) -> anyhow::Result<Vec<VersionKey>> {
        Self::list_keys(&self.versions_dir(), "json").await
    }

    pub async fn load_version(&self, key: VersionKey) -> anyhow::Result<Catalog> {
        let path = self.version_path(key);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn latest_version(&self) -> anyhow::Result<Option<StoredVersion>> {
        let Some(key) = self.list_versions().await?.pop() else {
            return Ok(None);
        };
        let catalog = self.load_version(key).await?;
        Ok(Some(StoredVersion { key, catalog }))
    }

    /// Write a new immutable version for `date`; a same-day rerun gets the next revision.
    pub async fn write_version(
        &self,
        date: NaiveDate,
        catalog: &Catalog,
    ) -> Result<VersionKey, RecordPersistError> {
        let existing = self.list_versions().await.map_err(|err| RecordPersistError::Io {
            path: self.versions_dir(),
            source: std::io::Error::other(err.to_string()),
        })?;
        let revision = existing
            .iter()
            .filter(|k| k.date == date)
            .map(|k| k.revision + 1)
            .max()
            .unwrap_or(1);
        let key = VersionKey { date, revision };

        let bytes = serde_json::to_vec_pretty(catalog)
            .map_err(|source| RecordPersistError::Serialize { key, source })?;
        let path = self.version_path(key);
        write_file_atomically(&path, &bytes, false)
            .await
            .map_err(|source| persist_error(path.clone(), source))?;
        Ok(key)
    }

    pub async fn write_rendered(
        &self,
        key: VersionKey,
        text: &str,
    ) -> Result<PathBuf, RecordPersistError> {
        let path = self.rendered_path(key);
        write_file_atomically(&path, text.as_bytes(), false)
            .await
            .map_err(|source| persist_error(path.clone(), source))?;
        Ok(path)
    }

    pub async fn has_rendered(&self, key: VersionKey) -> anyhow::Result<bool> {
        let path = self.rendered_path(key);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    /// Up to `count` most recent rendered documents, oldest first.
    pub async fn latest_rendered(&self, count: usize) -> anyhow::Result<Vec<RenderedDocument>> {
        let keys = Self::list_keys(&self.rendered_dir(), "md").await?;
        let start = keys.len().saturating_sub(count);
        let mut docs = Vec::with_capacity(keys.len() - start);
        for key in &keys[start..] {
            let path = self.rendered_path(*key);
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            docs.push(RenderedDocument { key: *key, text });
        }
        Ok(docs)
    }

    pub async fn last_posted(&self) -> anyhow::Result<Option<VersionKey>> {
        let path = self.post_log_path();
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(VersionKey::parse(text.trim())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn record_posted(&self, key: VersionKey) -> anyhow::Result<()> {
        let path = self.post_log_path();
        write_file_atomically(&path, key.to_string().as_bytes(), true)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

fn persist_error(path: PathBuf, source: std::io::Error) -> RecordPersistError {
    if source.kind() == std::io::ErrorKind::AlreadyExists {
        RecordPersistError::AlreadyExists(path)
    } else {
        RecordPersistError::Io { path, source }
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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential { max_delay: Duration },
}

/// Bounded synchronous sleep-and-retry, shared by the fetcher and the oracle client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(250), Duration::from_secs(5))
    }
}

/// Last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: usize,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempt(s): {}", self.attempts, self.last_error)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            strategy: RetryStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: base_delay,
            strategy: RetryStrategy::Exponential { max_delay },
        }
    }

    /// Pause after the zero-based failed attempt `attempt_index`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.delay,
            RetryStrategy::Exponential { max_delay } => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor).min(max_delay)
            }
        }
    }

    /// Run `op` (given the 1-based attempt number) until it succeeds, the error is not
    /// retryable, or `max_attempts` is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable(&err) {
                        return Err(RetryError {
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    warn!(attempt, max_attempts, error = %err, "attempt failed; retrying");
                    tokio::time::sleep(self.delay_for_attempt(attempt - 1)).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.retry
            .run(
                |_attempt| self.fetch_once(url),
                |err: &FetchError| err.disposition() == RetryDisposition::Retryable,
            )
            .instrument(span)
            .await
            .map_err(|err| {
                debug!(attempts = err.attempts, url, "fetch gave up");
                err.last_error
            })
    }
}
