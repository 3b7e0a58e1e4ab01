//! Rendering, change detection and delivery of the human-readable conference document.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate};
use confwatch_core::{replace_url_years, Catalog, DateValue, EntityRecord};
use confwatch_storage::{RecordStore, VersionKey};
use reqwest::Client;
use serde::Deserialize;
use similar::{ChangeTag, TextDiff};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "confwatch-notify";

/// Discord's per-message character limit.
pub const DEFAULT_MESSAGE_LIMIT: usize = 2000;

pub const UPCOMING_HEADER: &str =
    "### :calendar_spiral: Upcoming Conferences and Deadlines in the next 1 month";

const BLOCK_PREFIX: &str = "[**";
const HUMAN_DATE: &str = "%B %d, %Y";

const BUILTIN_EMOJI: &[(&str, &str)] = &[
    ("Psychometrics / Measurement / Testing Conferences", ":bar_chart:"),
    ("Education / Policy Conferences", ":mortar_board:"),
    ("AI / Machine Learning Conferences", ":robot:"),
    ("Psychology Conferences", ":brain:"),
];

#[derive(Debug, Clone, Deserialize)]
struct CategoryStylesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    categories: BTreeMap<String, CategoryStyle>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryStyle {
    #[serde(default)]
    emoji: Option<String>,
}

/// Emoji shown in each category header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryStyles {
    emoji: BTreeMap<String, String>,
}

impl Default for CategoryStyles {
    fn default() -> Self {
        Self {
            emoji: BUILTIN_EMOJI
                .iter()
                .map(|(name, emoji)| (name.to_string(), emoji.to_string()))
                .collect(),
        }
    }
}

impl CategoryStyles {
    /// Built-in table overlaid with `path` when it exists. An entry with an empty
    /// or missing emoji removes the built-in one.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut styles = Self::default();
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(styles),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let file: CategoryStylesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for (name, style) in file.categories {
            match style.emoji.filter(|e| !e.trim().is_empty()) {
                Some(emoji) => {
                    styles.emoji.insert(name, emoji);
                }
                None => {
                    styles.emoji.remove(&name);
                }
            }
        }
        Ok(styles)
    }

    pub fn emoji_for(&self, category: &str) -> Option<&str> {
        self.emoji.get(category).map(String::as_str)
    }

    pub fn header(&self, category: &str) -> String {
        match self.emoji_for(category) {
            Some(emoji) => format!("## {emoji} {category}"),
            None => format!("## {category}"),
        }
    }
}

/// Human-readable date range; `unknown`, `Closed` and unparsed values count as unknown.
pub fn format_date_range(start: &DateValue, end: &DateValue) -> String {
    match (start.as_date(), end.as_date()) {
        (None, None) => "Date unknown".to_string(),
        (Some(day), None) | (None, Some(day)) => day.format(HUMAN_DATE).to_string(),
        (Some(s), Some(e)) if s.year() == e.year() && s.month() == e.month() => {
            format!("{} {}\u{2013}{}, {}", s.format("%B"), s.day(), e.day(), s.year())
        }
        (Some(s), Some(e)) if s.year() == e.year() => {
            format!("{} to {}, {}", s.format("%B %d"), e.format("%B %d"), s.year())
        }
        (Some(s), Some(e)) => format!("{} to {}", s.format(HUMAN_DATE), e.format(HUMAN_DATE)),
    }
}

pub fn format_deadline(deadline: &DateValue) -> String {
    match deadline {
        DateValue::Date(day) => day.format(HUMAN_DATE).to_string(),
        other => other.to_string(),
    }
}

/// The three-line block for one entity.
pub fn render_entity(entity: &EntityRecord, today: NaiveDate) -> [String; 3] {
    let url = replace_url_years(entity.display_url(), &entity.start_date, today);
    let range = format_date_range(&entity.start_date, &entity.end_date);
    let when_where = if entity.location_known() {
        format!("* {range} -- {}", entity.location)
    } else {
        format!("* {range}")
    };
    [
        format!("[**{}**](<{url}>)", entity.name),
        when_where,
        format!("* Submission Deadline: {}", format_deadline(&entity.submission_deadline)),
    ]
}

pub fn render_document(catalog: &Catalog, styles: &CategoryStyles, today: NaiveDate) -> String {
    let mut lines = Vec::new();
    for category in catalog.categories() {
        lines.push(styles.header(&category.name));
        for entity in &category.entities {
            lines.extend(render_entity(entity, today));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Identity of an entity block: its title plus how many earlier blocks share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub name: String,
    pub occurrence: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBlock {
    pub key: BlockKey,
    pub lines: Vec<String>,
}

fn block_title(line: &str) -> String {
    let rest = line.strip_prefix(BLOCK_PREFIX).unwrap_or(line);
    match rest.find("**]") {
        Some(end) => rest[..end].to_string(),
        None => rest.trim().to_string(),
    }
}

/// Entity blocks of a rendered document in order. Headers and blank lines only end blocks.
pub fn split_blocks(document: &str) -> Vec<EntityBlock> {
    let mut blocks: Vec<EntityBlock> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut open = false;

    for line in document.lines() {
        if line.starts_with(BLOCK_PREFIX) {
            let name = block_title(line);
            let occurrence = seen.entry(name.clone()).or_default();
            blocks.push(EntityBlock {
                key: BlockKey {
                    name,
                    occurrence: *occurrence,
                },
                lines: vec![line.trim().to_string()],
            });
            *occurrence += 1;
            open = true;
        } else if line.trim().is_empty() || line.starts_with('#') {
            open = false;
        } else if open {
            if let Some(block) = blocks.last_mut() {
                block.lines.push(line.trim().to_string());
            }
        }
    }
    blocks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Added(String),
    Removed(String),
}

/// Inserted and removed lines of a line alignment, removals first within each hunk.
pub fn line_diff(old: &[String], new: &[String]) -> Vec<DiffLine> {
    let old: Vec<&str> = old.iter().map(String::as_str).collect();
    let new: Vec<&str> = new.iter().map(String::as_str).collect();
    TextDiff::from_slices(&old, &new)
        .iter_all_changes()
        .filter_map(|change| match change.tag() {
            ChangeTag::Delete => Some(DiffLine::Removed(change.value().to_string())),
            ChangeTag::Insert => Some(DiffLine::Added(change.value().to_string())),
            ChangeTag::Equal => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub name: String,
    pub lines: Vec<DiffLine>,
}

/// Changed entities: new-document order first, then entities that disappeared.
pub type ChangeSet = Vec<EntityChange>;

pub fn compute_change_set(old_document: &str, new_document: &str) -> ChangeSet {
    let old_blocks = split_blocks(old_document);
    let new_blocks = split_blocks(new_document);
    let old_by_key: HashMap<&BlockKey, &EntityBlock> =
        old_blocks.iter().map(|b| (&b.key, b)).collect();

    let mut changes = Vec::new();
    for block in &new_blocks {
        let old_lines = old_by_key
            .get(&block.key)
            .map(|b| b.lines.as_slice())
            .unwrap_or_default();
        let lines = line_diff(old_lines, &block.lines);
        if !lines.is_empty() {
            changes.push(EntityChange {
                name: block.key.name.clone(),
                lines,
            });
        }
    }

    let new_keys: std::collections::HashSet<&BlockKey> = new_blocks.iter().map(|b| &b.key).collect();
    for block in old_blocks.iter().filter(|b| !new_keys.contains(&b.key)) {
        changes.push(EntityChange {
            name: block.key.name.clone(),
            lines: block.lines.iter().cloned().map(DiffLine::Removed).collect(),
        });
    }
    changes
}

/// Grouped update message, or `None` when nothing changed.
pub fn build_message(changes: &[EntityChange], today: NaiveDate) -> Option<String> {
    if changes.is_empty() {
        return None;
    }
    let mut lines = vec![format!(
        "\u{1F4E2} **Conference Updates Detected** ({})",
        today.format("%Y-%m-%d")
    )];
    for change in changes {
        lines.push(String::new());
        lines.push(format!("**{}**", change.name));
        for line in &change.lines {
            match line {
                DiffLine::Added(text) => lines.push(text.clone()),
                DiffLine::Removed(text) => lines.push(format!("Removed: {text}")),
            }
        }
    }
    Some(lines.join("\n"))
}

/// Split `text` into chunks of at most `max_len` chars, on line boundaries where possible.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.lines() {
        let line_len = line.chars().count();
        let needed = if current.is_empty() { line_len } else { line_len + 1 };
        if current_len + needed <= max_len {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len += needed;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= max_len {
            current.push_str(line);
            current_len = line_len;
        } else {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_len) {
                chunks.push(piece.iter().collect());
            }
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split a rendered document into its `## ` category sections.
pub fn split_by_category(document: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in document.lines() {
        if line.starts_with("## ") && !current.is_empty() {
            sections.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }
    sections.retain(|s| !s.trim().is_empty());
    sections
}

#[derive(Debug, Error)]
pub enum NotificationSendError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, chunk: &str) -> Result<(), NotificationSendError>;
}

/// Posts each chunk as `{"content": chunk}` to a chat webhook.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, chunk: &str) -> Result<(), NotificationSendError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "content": chunk }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationSendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Writes messages to the log; used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, chunk: &str) -> Result<(), NotificationSendError> {
        info!(chars = chunk.chars().count(), "notification:\n{chunk}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

/// Send every chunk in order. Failures are logged and counted, never propagated.
pub async fn deliver(sink: &dyn NotificationSink, chunks: &[String]) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for (index, chunk) in chunks.iter().enumerate() {
        match sink.send(chunk).await {
            Ok(()) => report.sent += 1,
            Err(err) => {
                warn!(chunk = index + 1, of = chunks.len(), error = %err, "notification send failed");
                report.failed += 1;
            }
        }
    }
    report
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    NoDocument,
    AlreadyPosted(VersionKey),
    Posted { key: VersionKey, chunks: usize },
}

/// Post the newest rendered document one category section at a time.
///
/// The post log only advances when every chunk went out, so a failed publish is retried
/// by the next invocation.
pub async fn publish_document(
    store: &RecordStore,
    sink: &dyn NotificationSink,
    max_len: usize,
) -> Result<PublishOutcome> {
    let Some(latest) = store.latest_rendered(1).await?.pop() else {
        return Ok(PublishOutcome::NoDocument);
    };
    if store.last_posted().await? == Some(latest.key) {
        info!(key = %latest.key, "document already posted");
        return Ok(PublishOutcome::AlreadyPosted(latest.key));
    }

    let chunks: Vec<String> = split_by_category(&latest.text)
        .iter()
        .flat_map(|section| chunk_message(section, max_len))
        .collect();
    for chunk in &chunks {
        sink.send(chunk)
            .await
            .with_context(|| format!("publishing document {}", latest.key))?;
    }
    store.record_posted(latest.key).await?;
    info!(key = %latest.key, chunks = chunks.len(), "document published");
    Ok(PublishOutcome::Posted {
        key: latest.key,
        chunks: chunks.len(),
    })
}

fn within(value: &DateValue, from: NaiveDate, to: NaiveDate) -> bool {
    value.as_date().is_some_and(|day| from <= day && day <= to)
}

/// Entities starting or with a deadline in `[today, today + 1 month]`, or `None`.
pub fn upcoming_digest(catalog: &Catalog, today: NaiveDate) -> Option<String> {
    let horizon = today.checked_add_months(Months::new(1)).unwrap_or(NaiveDate::MAX);
    let mut lines = vec![UPCOMING_HEADER.to_string()];
    for (_, entity) in catalog.entities() {
        if within(&entity.start_date, today, horizon)
            || within(&entity.submission_deadline, today, horizon)
        {
            lines.extend(render_entity(entity, today));
        }
    }
    (lines.len() > 1).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tempfile::tempdir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn date(y: i32, m: u32, d: u32) -> DateValue {
        DateValue::Date(ymd(y, m, d))
    }

    fn entity(name: &str, start: DateValue, end: DateValue, location: &str, deadline: DateValue) -> EntityRecord {
        EntityRecord {
            name: name.into(),
            abbreviation: name.chars().filter(char::is_ascii_uppercase).collect(),
            url: Some("https://conf.org/{YEAR}".into()),
            search_urls: vec![],
            previous_year: 2025,
            start_date: start,
            end_date: end,
            location: location.into(),
            submission_deadline: deadline,
            extra: BTreeMap::new(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, chunk: &str) -> Result<(), NotificationSendError> {
            if self.fail {
                return Err(NotificationSendError::Status {
                    status: 500,
                    body: "nope".into(),
                });
            }
            self.sent.lock().unwrap().push(chunk.to_string());
            Ok(())
        }
    }

    #[test]
    fn date_ranges_follow_the_documented_shapes() {
        let u = DateValue::Unknown;
        assert_eq!(format_date_range(&u, &u), "Date unknown");
        assert_eq!(format_date_range(&date(2026, 4, 8), &u), "April 08, 2026");
        assert_eq!(format_date_range(&u, &DateValue::Closed), "Date unknown");
        assert_eq!(
            format_date_range(&date(2026, 4, 8), &date(2026, 4, 11)),
            "April 8\u{2013}11, 2026"
        );
        assert_eq!(
            format_date_range(&date(2026, 4, 8), &date(2026, 5, 2)),
            "April 08 to May 02, 2026"
        );
        assert_eq!(
            format_date_range(&date(2025, 12, 29), &date(2026, 1, 3)),
            "December 29, 2025 to January 03, 2026"
        );
    }

    #[test]
    fn document_renders_headers_blocks_and_trailing_blank_line() {
        let mut catalog = Catalog::new();
        catalog.push_category(
            "Psychology Conferences",
            vec![entity(
                "Annual Meeting",
                date(2026, 4, 8),
                date(2026, 4, 11),
                "Los Angeles, California, USA",
                DateValue::Closed,
            )],
        );
        catalog.push_category(
            "Other Events",
            vec![entity("Workshop", DateValue::Unknown, DateValue::Unknown, "unknown", date(2026, 1, 15))],
        );
        let doc = render_document(&catalog, &CategoryStyles::default(), ymd(2025, 10, 1));
        let expected = "## :brain: Psychology Conferences
[**Annual Meeting**](<https://conf.org/2026>)
* April 8\u{2013}11, 2026 -- Los Angeles, California, USA
* Submission Deadline: Closed

## Other Events
[**Workshop**](<https://conf.org/2026>)
* Date unknown
* Submission Deadline: January 15, 2026
";
        assert_eq!(doc, expected);
    }

    #[tokio::test]
    async fn styles_file_overrides_and_removes_emoji() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("categories.yaml");
        std::fs::write(
            &path,
            "version: 1\ncategories:\n  Other Events:\n    emoji: \":star:\"\n  Psychology Conferences: {}\n",
        )
        .expect("write yaml");
        let styles = CategoryStyles::load(&path).await.expect("load");
        assert_eq!(styles.header("Other Events"), "## :star: Other Events");
        assert_eq!(styles.header("Psychology Conferences"), "## Psychology Conferences");
        assert_eq!(styles.emoji_for("Education / Policy Conferences"), Some(":mortar_board:"));

        let missing = CategoryStyles::load(&dir.path().join("absent.yaml")).await.expect("load");
        assert_eq!(missing, CategoryStyles::default());
    }

    #[test]
    fn change_set_contains_only_changed_lines() {
        let old = "## :brain: Psych\n[**A**](<a>)\n* Date unknown\n* Submission Deadline: unknown\n[**B**](<b>)\n* Date unknown\n* Submission Deadline: unknown\n";
        let new = "## :brain: Psych\n[**A**](<a>)\n* April 8\u{2013}11, 2026 -- Paris, France\n* Submission Deadline: unknown\n[**B**](<b>)\n* Date unknown\n* Submission Deadline: unknown\n";
        let changes = compute_change_set(old, new);
        assert_eq!(
            changes,
            vec![EntityChange {
                name: "A".into(),
                lines: vec![
                    DiffLine::Removed("* Date unknown".into()),
                    DiffLine::Added("* April 8\u{2013}11, 2026 -- Paris, France".into()),
                ],
            }]
        );
        assert!(compute_change_set(new, new).is_empty());
    }

    #[test]
    fn change_set_keys_by_title_not_position() {
        let old = "[**A**](<a>)\n* one\n[**B**](<b>)\n* two\n";
        let new = "[**N**](<n>)\n* new\n[**A**](<a>)\n* one\n[**B**](<b>)\n* two\n";
        let changes = compute_change_set(old, new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "N");
        assert_eq!(changes[0].lines.len(), 2);

        let gone = compute_change_set(new, old);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].name, "N");
        assert!(gone[0].lines.iter().all(|l| matches!(l, DiffLine::Removed(_))));
    }

    #[test]
    fn line_diff_skips_common_lines() {
        let lines = |s: &[&str]| s.iter().map(|l| l.to_string()).collect::<Vec<_>>();
        let old = lines(&["[**A**](<a>)", "* Date unknown", "* Submission Deadline: unknown"]);
        let new = lines(&["[**A**](<a>)", "* May 1, 2027", "* Submission Deadline: unknown", "* extra"]);
        assert_eq!(
            line_diff(&old, &new),
            vec![
                DiffLine::Removed("* Date unknown".into()),
                DiffLine::Added("* May 1, 2027".into()),
                DiffLine::Added("* extra".into()),
            ]
        );
        assert!(line_diff(&old, &old).is_empty());
    }

    #[test]
    fn message_lists_additions_and_removals_per_entity() {
        let changes = vec![EntityChange {
            name: "A".into(),
            lines: vec![DiffLine::Removed("* old".into()), DiffLine::Added("* new".into())],
        }];
        let message = build_message(&changes, ymd(2026, 10, 16)).expect("message");
        assert_eq!(
            message,
            "\u{1F4E2} **Conference Updates Detected** (2026-10-16)\n\n**A**\nRemoved: * old\n* new"
        );
        assert_eq!(build_message(&[], ymd(2026, 10, 16)), None);
    }

    #[test]
    fn chunks_respect_limit_and_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(chunk_message(text, 9), vec!["aaaa\nbbbb", "cccc"]);
        assert_eq!(chunk_message(text, 100), vec![text]);

        let long = "x".repeat(25);
        let chunks = chunk_message(&format!("hi\n{long}\nbye"), 10);
        assert_eq!(chunks, vec!["hi", "xxxxxxxxxx", "xxxxxxxxxx", "xxxxx", "bye"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[tokio::test]
    async fn publish_posts_each_category_once() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let key = VersionKey::first_of(ymd(2026, 10, 16));
        store
            .write_rendered(key, "## A\n[**x**](<x>)\n\n## B\n[**y**](<y>)\n")
            .await
            .expect("write");

        let sink = RecordingSink::default();
        let first = publish_document(&store, &sink, 2000).await.expect("publish");
        assert_eq!(first, PublishOutcome::Posted { key, chunks: 2 });
        assert_eq!(sink.sent.lock().unwrap()[1], "## B\n[**y**](<y>)");

        let second = publish_document(&store, &sink, 2000).await.expect("publish");
        assert_eq!(second, PublishOutcome::AlreadyPosted(key));
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_publish_leaves_post_log_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let key = VersionKey::first_of(ymd(2026, 10, 16));
        store.write_rendered(key, "## A\n").await.expect("write");
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        assert!(publish_document(&store, &sink, 2000).await.is_err());
        assert_eq!(store.last_posted().await.expect("read"), None);
    }

    #[tokio::test]
    async fn delivery_counts_failures_without_stopping() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let report = deliver(&sink, &["a".to_string(), "b".to_string()]).await;
        assert_eq!(report, DeliveryReport { sent: 0, failed: 2 });
    }

    #[test]
    fn upcoming_digest_uses_one_month_window() {
        let today = ymd(2026, 3, 20);
        let mut catalog = Catalog::new();
        catalog.push_category(
            "Psychology Conferences",
            vec![
                entity("Soon", date(2026, 4, 8), date(2026, 4, 11), "Paris, France", DateValue::Closed),
                entity("Later", date(2026, 9, 1), date(2026, 9, 3), "unknown", date(2026, 6, 1)),
                entity("Deadline", date(2026, 11, 1), DateValue::Unknown, "unknown", date(2026, 3, 20)),
            ],
        );
        let digest = upcoming_digest(&catalog, today).expect("digest");
        assert!(digest.starts_with(UPCOMING_HEADER));
        assert!(digest.contains("[**Soon**]"));
        assert!(digest.contains("[**Deadline**]"));
        assert!(!digest.contains("[**Later**]"));

        assert_eq!(upcoming_digest(&catalog, ymd(2027, 1, 1)), None);
    }
}
