//! Adapters to the outside world: AI output normalization, the chat-completion
//! gateway, the creator analyzer built on top of it, and SMTP delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clo_core::{normalize_date, CandidateLead};
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "clo-adapters";

// ---------------------------------------------------------------------------
// AI response normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("could not recover a JSON array from analysis output: {reason}")]
    Parse { reason: String, raw: String },
}

impl NormalizeError {
    pub fn raw(&self) -> &str {
        match self {
            NormalizeError::Parse { raw, .. } => raw,
        }
    }
}

const FENCE: &str = "```";

/// Strip one leading fence (with an optional language token) and one trailing
/// fence. Each edge is handled on its own, so a lone opener or closer is removed too.
fn strip_fences(text: &str) -> &str {
    let mut out = text;
    if let Some(rest) = out.strip_prefix(FENCE) {
        let tag_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+')))
            .unwrap_or(rest.len());
        out = &rest[tag_len..];
    }
    if let Some(rest) = out.trim_end().strip_suffix(FENCE) {
        out = rest;
    }
    out
}

/// Balanced bracket region opening at `start`, ignoring brackets inside strings.
fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every balanced region in the text, widest first.
fn balanced_regions(text: &str) -> Vec<&str> {
    let mut regions: Vec<&str> = text
        .match_indices('[')
        .filter_map(|(start, _)| balanced_from(text, start))
        .collect();
    regions.sort_by_key(|region| std::cmp::Reverse(region.len()));
    regions
}

/// Everything between the first `[` and the last `]`.
fn widest_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn holds_records(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Array(items) if items.iter().any(JsonValue::is_object))
}

/// A recovered region only counts when it carries at least one record, so a
/// stray `[1]` in the prose never stands in for the real array.
fn recover_array(text: &str) -> Option<JsonValue> {
    balanced_regions(text)
        .into_iter()
        .chain(widest_array(text))
        .filter_map(|slice| serde_json::from_str::<JsonValue>(slice).ok())
        .find(holds_records)
}

/// Decode analysis output into candidate leads, preserving array order.
///
/// Output that parses directly but is not an array yields no candidates, as does
/// an array without any object elements. Text that only parses after recovery
/// must yield an array holding records, otherwise it is an error.
pub fn normalize(raw: &str) -> Result<Vec<CandidateLead>, NormalizeError> {
    let cleaned = strip_fences(raw.trim()).trim();
    let value = match serde_json::from_str::<JsonValue>(cleaned) {
        Ok(value) => value,
        Err(direct) => {
            let recovered = recover_array(cleaned).ok_or_else(|| NormalizeError::Parse {
                reason: direct.to_string(),
                raw: raw.to_string(),
            })?;
            debug!("recovered JSON array from surrounding text");
            recovered
        }
    };
    Ok(candidates_from_value(value))
}

fn candidates_from_value(value: JsonValue) -> Vec<CandidateLead> {
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                JsonValue::Object(record) => Some(candidate_from_record(&record)),
                _ => {
                    debug!(index, "skipping non-record element in analysis output");
                    None
                }
            })
            .collect(),
        other => {
            warn!(kind = json_kind(&other), "analysis output is not an array; no candidates");
            Vec::new()
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn text_field(record: &Map<String, JsonValue>, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn candidate_from_record(record: &Map<String, JsonValue>) -> CandidateLead {
    CandidateLead {
        name: text_field(record, "name"),
        // The model writes placeholders such as "No email found" instead of null.
        email: text_field(record, "email").filter(|e| e.contains('@')),
        channel_name: text_field(record, "channel_name"),
        platform: text_field(record, "platform"),
        source_url: text_field(record, "youtube_url").or_else(|| text_field(record, "source_url")),
        niche: text_field(record, "niche"),
        last_posted: record
            .get("last_posted")
            .and_then(JsonValue::as_str)
            .map(normalize_date),
        ability_to_pay_analysis: text_field(record, "ability_to_pay_analysis"),
    }
}

// ---------------------------------------------------------------------------
// Completion gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("AI gateway API key not configured")]
    MissingApiKey,
    #[error("invalid request header: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("AI gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("AI gateway error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("AI gateway returned no message content")]
    EmptyResponse,
}

/// Chat-completion capability: one system instruction plus one user payload in, one text blob out.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("AI_GATEWAY_URL")
                .unwrap_or_else(|_| "https://ai.gateway.lovable.dev/v1".to_string()),
            api_key: std::env::var("AI_GATEWAY_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            model: std::env::var("AI_MODEL")
                .unwrap_or_else(|_| "google/gemini-2.5-flash".to_string()),
            temperature: std::env::var("AI_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.3),
            timeout_secs: std::env::var("CLO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug)]
pub struct GatewayClient {
    config: GatewayConfig,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building reqwest client")?;
        Ok(Self { config, http })
    }

    fn headers(&self, api_key: &str) -> Result<HeaderMap, CompletionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl CompletionClient for GatewayClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(CompletionError::MissingApiKey)?;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: self.config.temperature,
        };

        debug!(model = %self.config.model, "chat completion request");
        let response = self
            .http
            .post(&url)
            .headers(self.headers(api_key)?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(CompletionError::EmptyResponse)
    }
}

// ---------------------------------------------------------------------------
// Creator analyzer
// ---------------------------------------------------------------------------

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You analyze YouTube channels for a video editing outreach service.

Step 1: find every YouTube channel referenced in the text: full URLs (youtube.com/@handle, youtube.com/c/name), @handles, or creators named in context.

Step 2: for each channel, determine:
- the channel name
- the creator's name (best guess)
- the niche (Gaming, Tech, Beauty, Vlog, Education, ...)
- the most recent upload date you can estimate
- a professional contact email (about section, contact@, business@, name@domain)
- whether the creator can afford an editor, judged from subscribers, views relative to subscribers, upload consistency, production quality, visible sponsorships and comments asking for editors

Respond with a raw JSON array only. No markdown, no code fences, no backticks.
Each element has exactly these keys:
[
  {
    "name": "Creator Name",
    "email": "contact@example.com or No email found",
    "channel_name": "Channel Name",
    "platform": "YouTube",
    "youtube_url": "full channel url",
    "niche": "Gaming/Tech/Beauty/Vlog/etc",
    "last_posted": "2025-01-15 or recent estimate",
    "ability_to_pay_analysis": "High potential - 500K subs, weekly uploads, professional production, visible sponsorships."
  }
]

If the text references no YouTube channel, respond with []."#;

const USER_PAYLOAD_PREFIX: &str = "Extract and analyze all YouTube channels from this text:\n\n";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("nothing to analyze: input has no non-blank lines")]
    EmptyInput,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Split raw user input into trimmed, non-empty lines.
pub fn split_input(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn user_payload(lines: &[String]) -> String {
    format!("{USER_PAYLOAD_PREFIX}{}", lines.join("\n\n"))
}

/// Prompt-and-normalize step shared by ingestion and enrichment.
#[derive(Clone)]
pub struct LeadAnalyzer {
    client: Arc<dyn CompletionClient>,
}

impl LeadAnalyzer {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub async fn analyze(&self, lines: &[String]) -> Result<Vec<CandidateLead>, AnalysisError> {
        if lines.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        let request = CompletionRequest {
            system: ANALYSIS_SYSTEM_PROMPT.to_string(),
            user: user_payload(lines),
        };
        let span = info_span!("analyze", inputs = lines.len());
        async move {
            let raw = self.client.complete(&request).await?;
            let candidates = normalize(&raw).inspect_err(|err| {
                warn!(error = %err, raw = err.raw(), "analysis output could not be parsed");
            })?;
            info!(candidates = candidates.len(), "analysis complete");
            Ok::<_, AnalysisError>(candidates)
        }
        .instrument(span)
        .await
    }

    pub async fn analyze_text(&self, raw: &str) -> Result<Vec<CandidateLead>, AnalysisError> {
        self.analyze(&split_input(raw)).await
    }
}

// ---------------------------------------------------------------------------
// Outbound mail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail credentials not configured")]
    NotConfigured,
    #[error("invalid address `{address}`: {reason}")]
    Address { address: String, reason: String },
    #[error("failed to build email message: {0}")]
    Build(String),
    #[error("SMTP send failed: {0}")]
    Transport(String),
}

/// Outbound-mail capability. One call, one message, success or failure.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;
}

#[derive(Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MailConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string()),
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(465),
            username: non_empty("SMTP_USERNAME"),
            password: non_empty("SMTP_PASSWORD"),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.trim().parse().map_err(|e| MailError::Address {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

/// SMTP delivery over implicit TLS. The sender address is the SMTP username.
pub struct SmtpMailer {
    sender: Option<(Mailbox, AsyncSmtpTransport<Tokio1Executor>)>,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let (Some(username), Some(password)) = (&config.username, &config.password) else {
            warn!("SMTP credentials missing; every send will fail");
            return Ok(Self { sender: None });
        };
        let from = parse_mailbox(username)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| MailError::Transport(format!("relay `{}`: {e}", config.host)))?
            .port(config.port)
            .credentials(Credentials::new(username.clone(), password.clone()))
            .build();
        Ok(Self {
            sender: Some((from, transport)),
        })
    }

    pub fn unconfigured() -> Self {
        Self { sender: None }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let (from, transport) = self.sender.as_ref().ok_or(MailError::NotConfigured)?;
        let message = Message::builder()
            .from(from.clone())
            .to(parse_mailbox(&email.to)?)
            .subject(email.subject.clone())
            .body(email.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))?;
        transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        debug!(to = %email.to, "email delivered to SMTP relay");
        Ok(())
    }
}
