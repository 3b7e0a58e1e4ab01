//! Reconciliation oracle client: merges changed page text into an entity's date,
//! location and deadline fields through an external language model.
//!
//! The oracle is untrusted. Its reply must parse as a partial record with strictly
//! valid date values, otherwise the sanitized record is kept as-is. Invocation
//! failures are retried under a [`RetryPolicy`] and never abort the run.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use confwatch_core::{DateValue, EntityRecord, PlausibleYears};
use confwatch_storage::{
    classify_reqwest_error, classify_status, RetryDisposition, RetryPolicy,
};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "confwatch-oracle";

pub const SYSTEM_INSTRUCTION: &str =
    "You are a JSON editor. Always return valid JSON without additional explanations.";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reply contained no content")]
    EmptyReply,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        let disposition = match self {
            Self::Network(err) => classify_reqwest_error(err),
            Self::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::EmptyReply => RetryDisposition::Retryable,
        };
        disposition == RetryDisposition::Retryable
    }
}

/// Text in, text out.
#[async_trait]
pub trait OracleBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn complete(&self, system: &str, user: &str) -> Result<String, BackendError>;
}

/// OpenAI-compatible `/chat/completions` backend.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    service_tier: Option<String>,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building oracle http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            service_tier: None,
        })
    }

    pub fn with_service_tier(mut self, tier: Option<String>) -> Self {
        self.service_tier = tier;
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_tier: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

#[async_trait]
impl OracleBackend for OpenAiBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            service_tier: self.service_tier.as_deref(),
        };

        let mut request = self.client.post(self.chat_completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(BackendError::EmptyReply)
    }
}

/// The fields the oracle is allowed to see and change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentFields {
    pub start_date: DateValue,
    pub end_date: DateValue,
    pub location: String,
    pub submission_deadline: DateValue,
}

impl From<&EntityRecord> for CurrentFields {
    fn from(record: &EntityRecord) -> Self {
        Self {
            start_date: record.start_date.clone(),
            end_date: record.end_date.clone(),
            location: record.location.clone(),
            submission_deadline: record.submission_deadline.clone(),
        }
    }
}

/// A validated oracle reply. Absent fields leave the record untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialRecord {
    pub start_date: Option<DateValue>,
    pub end_date: Option<DateValue>,
    pub location: Option<String>,
    pub submission_deadline: Option<DateValue>,
}

impl PartialRecord {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge_into(self, mut record: EntityRecord) -> EntityRecord {
        if let Some(v) = self.start_date {
            record.start_date = v;
        }
        if let Some(v) = self.end_date {
            record.end_date = v;
        }
        if let Some(v) = self.location {
            record.location = v;
        }
        if let Some(v) = self.submission_deadline {
            record.submission_deadline = v;
        }
        record
    }

    /// Drop event dates that fall outside `years`; returns the names of the dropped fields.
    /// The deadline is left alone since it may precede the event by a year.
    pub fn retain_plausible_years(&mut self, years: &PlausibleYears) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        for (name, field) in [("start_date", &mut self.start_date), ("end_date", &mut self.end_date)] {
            let implausible = field
                .as_ref()
                .and_then(DateValue::as_date)
                .is_some_and(|date| !years.contains(date.year()));
            if implausible {
                *field = None;
                dropped.push(name);
            }
        }
        dropped
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn date_field(object: &serde_json::Map<String, JsonValue>, key: &str) -> Result<Option<DateValue>, String> {
    match object.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(raw)) => DateValue::parse_strict(raw)
            .map(Some)
            .ok_or_else(|| format!("{key}: {raw:?} is not YYYY-MM-DD, \"unknown\" or \"Closed\"")),
        Some(other) => Err(format!("{key}: expected a string, got {other}")),
    }
}

/// Parse and validate an oracle reply. Markdown code fences around the JSON are tolerated.
pub fn parse_partial_record(reply: &str) -> Result<PartialRecord, String> {
    let value: JsonValue =
        serde_json::from_str(strip_code_fence(reply)).map_err(|e| format!("invalid JSON: {e}"))?;
    let JsonValue::Object(object) = value else {
        return Err("reply is not a JSON object".to_string());
    };

    let location = match object.get("location") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(raw)) if raw.trim().is_empty() => Some(confwatch_core::UNKNOWN.to_string()),
        Some(JsonValue::String(raw)) => Some(raw.trim().to_string()),
        Some(other) => return Err(format!("location: expected a string, got {other}")),
    };

    Ok(PartialRecord {
        start_date: date_field(&object, "start_date")?,
        end_date: date_field(&object, "end_date")?,
        location,
        submission_deadline: date_field(&object, "submission_deadline")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OraclePrompt {
    pub system: String,
    pub user: String,
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_prompt(
    record: &EntityRecord,
    candidate_text: &str,
    years: &PlausibleYears,
    today: NaiveDate,
    max_candidate_chars: usize,
) -> OraclePrompt {
    let current = serde_json::to_string_pretty(&CurrentFields::from(record))
        .unwrap_or_else(|_| "{}".to_string());
    let years_text = years.describe();
    let candidate = truncate_chars(candidate_text, max_candidate_chars);

    let user = format!(
        "Conference: {name}
Today's date: {today}
Potential years when the next conference will be held: {years_text}
Current info:
{current}

Web scraped text that may contain dates, location, and submission deadline:
{candidate}

Task:
- If the text indicates a new future start and end date, location, or submission_deadline for this conference, update the JSON accordingly.
- Format every date as YYYY-MM-DD, for example \"2000-01-01\".
- Format the location as \"City, State/Province, Country\" or \"City, Country\", for example \"Chicago, Illinois, USA\", \"Paris, France\", \"Vancouver, British Columbia, Canada\", \"Seoul, Republic of Korea\".
- When a city is unavailable or irrelevant, an institution name such as \"University of Washington\" or \"Virtual\" is acceptable.
- If there is both a virtual and an in-person meeting, use the in-person dates and location.
- If a submission deadline is missing a year, use the year that places it less than one year before the start_date.
- The next conference will be held in {years_text}. Ignore dates and locations for any other year.
- Text may lack dates or location, or mention unrelated events. Ignore unrelated information.
- When information is missing, ambiguous, or unconfirmed, keep the current value. Never guess.
- Return only a JSON object with the keys start_date, end_date, location, submission_deadline.",
        name = record.name,
        today = today.format("%Y-%m-%d"),
    );

    OraclePrompt {
        system: SYSTEM_INSTRUCTION.to_string(),
        user,
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle invocation failed after {attempts} attempt(s): {message}")]
    Invocation { attempts: usize, message: String },
    #[error("oracle reply rejected: {0}")]
    Parse(String),
}

#[derive(Debug)]
pub enum ReconcileOutcome {
    /// No candidate text; the oracle was not called.
    Skipped,
    Merged,
    Fallback(OracleError),
}

#[derive(Debug)]
pub struct Reconciliation {
    pub record: EntityRecord,
    pub outcome: ReconcileOutcome,
}

impl Reconciliation {
    pub fn invoked_oracle(&self) -> bool {
        !matches!(self.outcome, ReconcileOutcome::Skipped)
    }

    pub fn fell_back(&self) -> bool {
        matches!(self.outcome, ReconcileOutcome::Fallback(_))
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub retry: RetryPolicy,
    pub max_candidate_chars: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::fixed(3, Duration::from_secs(5)),
            max_candidate_chars: 60_000,
        }
    }
}

pub struct ReconciliationClient {
    backend: Box<dyn OracleBackend>,
    config: OracleConfig,
}

impl ReconciliationClient {
    pub fn new(backend: Box<dyn OracleBackend>, config: OracleConfig) -> Self {
        Self { backend, config }
    }

    async fn invoke(&self, prompt: &OraclePrompt) -> Result<PartialRecord, OracleError> {
        let reply = self
            .config
            .retry
            .run(
                |_attempt| self.backend.complete(&prompt.system, &prompt.user),
                BackendError::is_retryable,
            )
            .await
            .map_err(|err| OracleError::Invocation {
                attempts: err.attempts,
                message: err.last_error.to_string(),
            })?;
        parse_partial_record(&reply).map_err(OracleError::Parse)
    }

    /// Merge `candidate_text` into `sanitized`. Any failure returns `sanitized` unchanged.
    pub async fn reconcile(
        &self,
        run_id: Uuid,
        sanitized: EntityRecord,
        candidate_text: &str,
        years: &PlausibleYears,
        today: NaiveDate,
    ) -> Reconciliation {
        if candidate_text.trim().is_empty() {
            return Reconciliation {
                record: sanitized,
                outcome: ReconcileOutcome::Skipped,
            };
        }

        let prompt = build_prompt(
            &sanitized,
            candidate_text,
            years,
            today,
            self.config.max_candidate_chars,
        );
        let span = info_span!("oracle", %run_id, entity = %sanitized.abbreviation, backend = self.backend.id());

        match self.invoke(&prompt).instrument(span).await {
            Ok(mut partial) => {
                let dropped = partial.retain_plausible_years(years);
                if !dropped.is_empty() {
                    warn!(%run_id, entity = %sanitized.abbreviation, ?dropped, years = %years.describe(), "ignoring dates outside plausible years");
                }
                info!(%run_id, entity = %sanitized.abbreviation, changed_fields = !partial.is_empty(), "oracle reply merged");
                Reconciliation {
                    record: partial.merge_into(sanitized),
                    outcome: ReconcileOutcome::Merged,
                }
            }
            Err(err) => {
                warn!(%run_id, entity = %sanitized.abbreviation, error = %err, "keeping sanitized record");
                Reconciliation {
                    record: sanitized,
                    outcome: ReconcileOutcome::Fallback(err),
                }
            }
        }
    }
}
