//! Core domain model for creator lead outreach: leads, email log entries,
//! templates, lifecycle transitions, date normalization and placeholder rendering.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clo-core";

/// Subject used when the caller does not supply one.
pub const DEFAULT_SUBJECT: &str = "Quick question about your channel, {name}";

/// Body used when the caller does not supply one.
pub const DEFAULT_BODY: &str = "Hey {name},\n\nI help creators like you at {channel_name} save 5-10 hours/week with editing. Would you be open to a quick call to see if I can help streamline your workflow?\n\n– Your Name";

/// Identity of the user owning a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OwnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Supplies the identity of the user on whose behalf an operation runs.
pub trait IdentityProvider: Send + Sync {
    fn current_owner(&self) -> Option<OwnerId>;
}

/// Identity resolved once up front (CLI env var, request header).
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticIdentity(pub Option<OwnerId>);

impl IdentityProvider for StaticIdentity {
    fn current_owner(&self) -> Option<OwnerId> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    New,
    Contacted,
    Campaign,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Campaign => "campaign",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lead status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for LeadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "campaign" => Ok(LeadStatus::Campaign),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Things that happen to a lead and may move its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Ingested,
    MovedToCampaign,
    SendSucceeded,
    SendFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("lead does not exist (never ingested or deleted); cannot apply {0:?}")]
    Missing(LifecycleEvent),
    #[error("lead already exists with status {0}; cannot ingest again")]
    AlreadyIngested(LeadStatus),
}

/// Transition table for the lead status field.
///
/// `current` is `None` when there is no live record (never created, or deleted);
/// only ingestion may start from there. Any other event on a missing record fails closed.
pub fn next_status(
    current: Option<LeadStatus>,
    event: LifecycleEvent,
) -> Result<LeadStatus, TransitionError> {
    match (current, event) {
        (None, LifecycleEvent::Ingested) => Ok(LeadStatus::New),
        (None, other) => Err(TransitionError::Missing(other)),
        (Some(status), LifecycleEvent::Ingested) => Err(TransitionError::AlreadyIngested(status)),
        (Some(_), LifecycleEvent::MovedToCampaign) => Ok(LeadStatus::Campaign),
        (Some(_), LifecycleEvent::SendSucceeded) => Ok(LeadStatus::Contacted),
        (Some(status), LifecycleEvent::SendFailed) => Ok(status),
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Strings the analysis model uses to say it has no real date.
pub const DATE_SENTINELS: [&str; 2] = ["Unknown", "recent estimate"];

/// Result of normalizing a loosely formatted "last posted" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum LastActivity {
    At(DateTime<Utc>),
    Unknown,
}

impl LastActivity {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            LastActivity::At(ts) => Some(*ts),
            LastActivity::Unknown => None,
        }
    }
}

/// Offset-carrying shapes RFC3339 rejects, such as Postgres text output (`+00`).
const OFFSET_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %#z"];

const DATETIME_FORMATS: [&str; 7] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f UTC",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%Y%m%d",
];

/// Convert a loosely formatted date into a UTC timestamp.
///
/// Sentinels map to `Unknown` without a parse attempt, and anything unparseable
/// is `Unknown` rather than an error. Offset-less values are read as UTC.
pub fn normalize_date(text: &str) -> LastActivity {
    if DATE_SENTINELS.contains(&text) {
        return LastActivity::Unknown;
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return LastActivity::Unknown;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return LastActivity::At(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(trimmed) {
        return LastActivity::At(ts.with_timezone(&Utc));
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(trimmed, fmt) {
            return LastActivity::At(ts.with_timezone(&Utc));
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return LastActivity::At(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return LastActivity::At(naive.and_utc());
            }
        }
    }
    LastActivity::Unknown
}

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

/// Unvalidated lead produced by the analysis step. `None` means the field was not supplied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateLead {
    pub name: Option<String>,
    pub email: Option<String>,
    pub channel_name: Option<String>,
    pub platform: Option<String>,
    pub source_url: Option<String>,
    pub niche: Option<String>,
    pub last_posted: Option<LastActivity>,
    pub ability_to_pay_analysis: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateRejection {
    #[error("candidate has no name")]
    MissingName,
    #[error("candidate has no email")]
    MissingEmail,
}

/// Candidate that satisfies the lead invariants and can be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub name: String,
    pub email: String,
    pub channel_name: Option<String>,
    pub platform: Option<String>,
    pub source_url: Option<String>,
    pub niche: Option<String>,
    pub last_posted: Option<DateTime<Utc>>,
    pub ability_to_pay_analysis: Option<String>,
}

impl TryFrom<CandidateLead> for NewLead {
    type Error = CandidateRejection;

    fn try_from(candidate: CandidateLead) -> Result<Self, Self::Error> {
        let name = non_blank(candidate.name).ok_or(CandidateRejection::MissingName)?;
        let email = non_blank(candidate.email).ok_or(CandidateRejection::MissingEmail)?;
        Ok(Self {
            name,
            email,
            channel_name: candidate.channel_name,
            platform: candidate.platform,
            source_url: candidate.source_url,
            niche: candidate.niche,
            last_posted: candidate.last_posted.and_then(|l| l.timestamp()),
            ability_to_pay_analysis: candidate.ability_to_pay_analysis,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub name: String,
    pub email: String,
    pub channel_name: Option<String>,
    pub platform: Option<String>,
    pub source_url: Option<String>,
    pub niche: Option<String>,
    pub last_posted: Option<DateTime<Utc>>,
    pub ability_to_pay_analysis: Option<String>,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
    pub last_contacted: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn from_new(owner_id: OwnerId, new: NewLead, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: new.name,
            email: new.email,
            channel_name: new.channel_name,
            platform: new.platform,
            source_url: new.source_url,
            niche: new.niche,
            last_posted: new.last_posted,
            ability_to_pay_analysis: new.ability_to_pay_analysis,
            status: LeadStatus::New,
            created_at,
            last_contacted: None,
        }
    }

    /// Fields of `enriched` that should overwrite this lead. Absent values never
    /// replace known ones, so re-running enrichment cannot blank a field.
    pub fn enrichment_patch(&self, enriched: &CandidateLead) -> LeadPatch {
        LeadPatch {
            email: non_blank(enriched.email.clone()),
            channel_name: non_blank(enriched.channel_name.clone()),
            niche: non_blank(enriched.niche.clone()),
            last_posted: enriched.last_posted.and_then(|l| l.timestamp()),
            ability_to_pay_analysis: non_blank(enriched.ability_to_pay_analysis.clone()),
        }
    }

    pub fn apply_patch(&mut self, patch: &LeadPatch) {
        if let Some(email) = &patch.email {
            self.email = email.clone();
        }
        if let Some(channel_name) = &patch.channel_name {
            self.channel_name = Some(channel_name.clone());
        }
        if let Some(niche) = &patch.niche {
            self.niche = Some(niche.clone());
        }
        if let Some(last_posted) = patch.last_posted {
            self.last_posted = Some(last_posted);
        }
        if let Some(analysis) = &patch.ability_to_pay_analysis {
            self.ability_to_pay_analysis = Some(analysis.clone());
        }
    }

    pub fn render_context(&self) -> RenderContext<'_> {
        RenderContext {
            name: Some(self.name.as_str()),
            channel_name: self.channel_name.as_deref(),
            email: Some(self.email.as_str()),
            platform: self.platform.as_deref(),
        }
    }
}

/// Partial update of the enrichable lead fields; `None` leaves the stored value alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeadPatch {
    pub email: Option<String>,
    pub channel_name: Option<String>,
    pub niche: Option<String>,
    pub last_posted: Option<DateTime<Utc>>,
    pub ability_to_pay_analysis: Option<String>,
}

impl LeadPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.channel_name.is_none()
            && self.niche.is_none()
            && self.last_posted.is_none()
            && self.ability_to_pay_analysis.is_none()
    }
}

// ---------------------------------------------------------------------------
// Email log
// ---------------------------------------------------------------------------

/// Outcome of one send attempt. The timestamp only exists for `Sent`, the detail only for `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EmailOutcome {
    Sent { sent_at: DateTime<Utc> },
    Failed { error_message: String },
}

impl EmailOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailOutcome::Sent { .. } => "sent",
            EmailOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, EmailOutcome::Sent { .. })
    }
}

/// Immutable record of one dispatch attempt for one lead. Outlives the lead it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub lead_id: Uuid,
    pub subject: String,
    pub body: String,
    #[serde(flatten)]
    pub outcome: EmailOutcome,
    pub created_at: DateTime<Utc>,
}

impl EmailLogEntry {
    pub fn sent(
        owner_id: OwnerId,
        lead_id: Uuid,
        subject: String,
        body: String,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            lead_id,
            subject,
            body,
            outcome: EmailOutcome::Sent { sent_at },
            created_at: sent_at,
        }
    }

    pub fn failed(
        owner_id: OwnerId,
        lead_id: Uuid,
        subject: String,
        body: String,
        error_message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            lead_id,
            subject,
            body,
            outcome: EmailOutcome::Failed { error_message },
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub owner_id: OwnerId,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template {0} is required")]
pub struct TemplateRejection(pub &'static str);

impl NewTemplate {
    pub fn validate(&self) -> Result<(), TemplateRejection> {
        if self.name.trim().is_empty() {
            return Err(TemplateRejection("name"));
        }
        if self.subject.trim().is_empty() {
            return Err(TemplateRejection("subject"));
        }
        if self.body.trim().is_empty() {
            return Err(TemplateRejection("body"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Per-lead values available to placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderContext<'a> {
    pub name: Option<&'a str>,
    pub channel_name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub platform: Option<&'a str>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Send-time renderer: replaces every `{name}` and `{channel_name}`.
///
/// Missing values fall back to `"there"` and `"your channel"`; any other `{...}`
/// token is left as written. This is the only syntax applied when mail goes out.
pub fn render(pattern: &str, ctx: &RenderContext<'_>) -> String {
    substitute(pattern, "{", "}", |token| match token {
        "name" => Some(present(ctx.name).unwrap_or("there")),
        "channel_name" => Some(present(ctx.channel_name).unwrap_or("your channel")),
        _ => None,
    })
}

/// Authoring-surface renderer for `{{name}}`, `{{email}}`, `{{channel_name}}` and `{{platform}}`.
///
/// Used for template previews only. `{{email}}` and `{{platform}}` stay untouched
/// when the lead has no value for them.
pub fn render_authoring(pattern: &str, ctx: &RenderContext<'_>) -> String {
    substitute(pattern, "{{", "}}", |token| match token.trim() {
        "name" => Some(present(ctx.name).unwrap_or("there")),
        "channel_name" => Some(present(ctx.channel_name).unwrap_or("your channel")),
        "email" => present(ctx.email),
        "platform" => present(ctx.platform),
        _ => None,
    })
}

fn substitute<'v>(
    pattern: &str,
    open: &str,
    close: &str,
    lookup: impl Fn(&str) -> Option<&'v str>,
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        let replaced = after_open.find(close).and_then(|end| {
            lookup(&after_open[..end]).map(|value| (value, end))
        });
        match replaced {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after_open[end + close.len()..];
            }
            None => {
                // Emit one character of the opener and rescan from the next one.
                let step = open.chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&rest[start..start + step]);
                rest = &rest[start + step..];
            }
        }
    }
    out.push_str(rest);
    out
}
