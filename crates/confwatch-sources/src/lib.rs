//! Fetch & snapshot engine: probes an entity's source pages and yields only text that changed.

use async_trait::async_trait;
use confwatch_core::{expand_urls, EntityRecord, PlausibleYears};
use confwatch_storage::{FetchError, HttpFetcher, SnapshotStore, SnapshotWriteError};
use scraper::Html;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "confwatch-sources";

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Anything that can hand back the raw HTML for a URL.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError>;
}

pub struct HttpPageSource {
    fetcher: HttpFetcher,
}

impl HttpPageSource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        Ok(self.fetcher.fetch_text(run_id, url).await?.body)
    }
}

/// Visible text of an HTML page: one trimmed, whitespace-collapsed line per text node.
pub fn extract_visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    SnapshotWrite(#[from] SnapshotWriteError),
}

#[derive(Debug)]
pub struct UrlFailure {
    pub url: String,
    pub error: SourceError,
}

#[derive(Debug)]
pub struct ProbeOutcome {
    /// Concatenated changed text; empty when nothing changed.
    pub candidate_text: String,
    pub years: PlausibleYears,
    pub urls_checked: usize,
    pub urls_changed: usize,
    pub failures: Vec<UrlFailure>,
}

impl ProbeOutcome {
    pub fn has_candidates(&self) -> bool {
        !self.candidate_text.is_empty()
    }

    pub fn fetch_failures(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, SourceError::Fetch(_)))
            .count()
    }
}

pub struct SourceProbe<'a> {
    pages: &'a dyn PageSource,
    snapshots: &'a SnapshotStore,
}

impl<'a> SourceProbe<'a> {
    pub fn new(pages: &'a dyn PageSource, snapshots: &'a SnapshotStore) -> Self {
        Self { pages, snapshots }
    }

    /// Fetch every expanded URL of `entity` in order. A failing URL is logged and skipped;
    /// a snapshot is only rewritten when its text changed.
    pub async fn probe(
        &self,
        run_id: Uuid,
        entity: &EntityRecord,
        years: PlausibleYears,
    ) -> ProbeOutcome {
        let urls = expand_urls(&entity.search_urls, &years);
        let mut candidates: Vec<String> = Vec::new();
        let mut failures = Vec::new();
        let mut urls_changed = 0usize;

        for url in &urls {
            let html = match self.pages.fetch_page(run_id, url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(%run_id, entity = %entity.abbreviation, url = %url, error = %err, "fetch failed; skipping url");
                    failures.push(UrlFailure {
                        url: url.clone(),
                        error: err.into(),
                    });
                    continue;
                }
            };
            let text = extract_visible_text(&html);

            let key = SnapshotStore::snapshot_key(&entity.abbreviation, url);
            let previous = match self.snapshots.load(&key).await {
                Ok(previous) => previous,
                Err(err) => {
                    warn!(%run_id, key = %key, error = %err, "snapshot unreadable; treating as absent");
                    None
                }
            };

            // an absent snapshot and an empty page are the same "nothing"
            if previous.as_deref().unwrap_or_default().trim() == text.trim() {
                info!(%run_id, url = %url, "no change");
                continue;
            }

            info!(%run_id, url = %url, "changed; updating snapshot");
            urls_changed += 1;
            if let Err(err) = self.snapshots.write(&key, &text).await {
                warn!(%run_id, error = %err, "snapshot write failed; candidate text still used");
                failures.push(UrlFailure {
                    url: url.clone(),
                    error: err.into(),
                });
            }
            candidates.push(format!("Source: {url}\n{text}"));
        }

        ProbeOutcome {
            candidate_text: candidates.join("\n\n"),
            years,
            urls_checked: urls.len(),
            urls_changed,
            failures,
        }
    }
}
