//! Owner-scoped record store for leads, email log entries and templates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clo_core::{
    next_status, CandidateLead, CandidateRejection, EmailLogEntry, EmailOutcome, Lead, LeadPatch,
    LeadStatus, LifecycleEvent, NewLead, NewTemplate, OwnerId, Template, TemplateRejection,
    TransitionError,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clo-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lead {0} not found")]
    LeadNotFound(Uuid),
    #[error("candidate #{index} rejected: {reason}")]
    InvalidCandidate {
        index: usize,
        reason: CandidateRejection,
    },
    #[error(transparent)]
    InvalidTemplate(#[from] TemplateRejection),
    #[error("lead {0} belongs to another owner")]
    OwnerMismatch(Uuid),
    #[error("invalid email log entry: {0}")]
    InvalidLogEntry(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Keyed CRUD over leads, email log entries and templates.
///
/// Every call is scoped to `owner`; records belonging to someone else behave as
/// if they did not exist. Listings are newest first.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn list_leads(&self, owner: OwnerId) -> Result<Vec<Lead>, StoreError>;

    async fn get_lead(&self, owner: OwnerId, id: Uuid) -> Result<Lead, StoreError>;

    /// Validates every candidate first; one invalid candidate rejects the whole batch.
    /// Returned leads keep the input order.
    async fn insert_leads(
        &self,
        owner: OwnerId,
        candidates: Vec<CandidateLead>,
    ) -> Result<Vec<Lead>, StoreError>;

    async fn update_lead(
        &self,
        owner: OwnerId,
        id: Uuid,
        patch: &LeadPatch,
    ) -> Result<Lead, StoreError>;

    /// Applies a lifecycle event. `contacted_at` stamps `last_contacted` on a successful send.
    async fn update_lead_status(
        &self,
        owner: OwnerId,
        id: Uuid,
        event: LifecycleEvent,
        contacted_at: Option<DateTime<Utc>>,
    ) -> Result<Lead, StoreError>;

    async fn delete_lead(&self, owner: OwnerId, id: Uuid) -> Result<(), StoreError>;

    async fn insert_email_log(&self, entry: &EmailLogEntry) -> Result<(), StoreError>;

    /// Writes a `sent` log entry and marks its lead contacted, both or neither.
    async fn record_send_success(&self, entry: &EmailLogEntry) -> Result<Lead, StoreError>;

    async fn list_email_logs(
        &self,
        owner: OwnerId,
        lead_id: Option<Uuid>,
    ) -> Result<Vec<EmailLogEntry>, StoreError>;

    async fn insert_template(
        &self,
        owner: OwnerId,
        template: NewTemplate,
    ) -> Result<Template, StoreError>;

    async fn list_templates(&self, owner: OwnerId) -> Result<Vec<Template>, StoreError>;
}

fn validate_candidates(candidates: Vec<CandidateLead>) -> Result<Vec<NewLead>, StoreError> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| {
            NewLead::try_from(candidate)
                .map_err(|reason| StoreError::InvalidCandidate { index, reason })
        })
        .collect()
}

fn sent_at_of(entry: &EmailLogEntry) -> Result<DateTime<Utc>, StoreError> {
    match &entry.outcome {
        EmailOutcome::Sent { sent_at } => Ok(*sent_at),
        EmailOutcome::Failed { .. } => Err(StoreError::InvalidLogEntry(
            "success bookkeeping requires a sent entry".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    leads: HashMap<Uuid, (u64, Lead)>,
    emails: Vec<(u64, EmailLogEntry)>,
    templates: Vec<(u64, Template)>,
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn owned_lead_mut(&mut self, owner: OwnerId, id: Uuid) -> Result<&mut Lead, StoreError> {
        match self.leads.get_mut(&id) {
            Some((_, lead)) if lead.owner_id == owner => Ok(lead),
            _ => Err(StoreError::LeadNotFound(id)),
        }
    }

    fn check_log_owner(&self, entry: &EmailLogEntry) -> Result<(), StoreError> {
        match self.leads.get(&entry.lead_id) {
            Some((_, lead)) if lead.owner_id != entry.owner_id => {
                Err(StoreError::OwnerMismatch(entry.lead_id))
            }
            _ => Ok(()),
        }
    }
}

/// Process-local store used by tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    state: Mutex<MemoryState>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T: Clone>(mut rows: Vec<(u64, DateTime<Utc>, T)>) -> Vec<T> {
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    rows.into_iter().map(|(_, _, row)| row).collect()
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn list_leads(&self, owner: OwnerId) -> Result<Vec<Lead>, StoreError> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .leads
                .values()
                .filter(|(_, lead)| lead.owner_id == owner)
                .map(|(seq, lead)| (*seq, lead.created_at, lead.clone()))
                .collect(),
        ))
    }

    async fn get_lead(&self, owner: OwnerId, id: Uuid) -> Result<Lead, StoreError> {
        let mut state = self.state.lock().await;
        state.owned_lead_mut(owner, id).map(|lead| lead.clone())
    }

    async fn insert_leads(
        &self,
        owner: OwnerId,
        candidates: Vec<CandidateLead>,
    ) -> Result<Vec<Lead>, StoreError> {
        let validated = validate_candidates(candidates)?;
        let created_at = Utc::now();
        let mut state = self.state.lock().await;
        let mut inserted = Vec::with_capacity(validated.len());
        for new in validated {
            let lead = Lead::from_new(owner, new, created_at);
            let seq = state.bump();
            state.leads.insert(lead.id, (seq, lead.clone()));
            inserted.push(lead);
        }
        debug!(%owner, count = inserted.len(), "inserted leads");
        Ok(inserted)
    }

    async fn update_lead(
        &self,
        owner: OwnerId,
        id: Uuid,
        patch: &LeadPatch,
    ) -> Result<Lead, StoreError> {
        let mut state = self.state.lock().await;
        let lead = state.owned_lead_mut(owner, id)?;
        lead.apply_patch(patch);
        Ok(lead.clone())
    }

    async fn update_lead_status(
        &self,
        owner: OwnerId,
        id: Uuid,
        event: LifecycleEvent,
        contacted_at: Option<DateTime<Utc>>,
    ) -> Result<Lead, StoreError> {
        let mut state = self.state.lock().await;
        let lead = state
            .owned_lead_mut(owner, id)
            .map_err(|_| StoreError::Transition(TransitionError::Missing(event)))?;
        lead.status = next_status(Some(lead.status), event)?;
        if event == LifecycleEvent::SendSucceeded {
            if let Some(at) = contacted_at {
                lead.last_contacted = Some(at);
            }
        }
        Ok(lead.clone())
    }

    async fn delete_lead(&self, owner: OwnerId, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.owned_lead_mut(owner, id)?;
        state.leads.remove(&id);
        Ok(())
    }

    async fn insert_email_log(&self, entry: &EmailLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_log_owner(entry)?;
        let seq = state.bump();
        state.emails.push((seq, entry.clone()));
        Ok(())
    }

    async fn record_send_success(&self, entry: &EmailLogEntry) -> Result<Lead, StoreError> {
        let sent_at = sent_at_of(entry)?;
        let mut state = self.state.lock().await;
        let lead = state
            .owned_lead_mut(entry.owner_id, entry.lead_id)
            .map_err(|_| StoreError::Transition(TransitionError::Missing(LifecycleEvent::SendSucceeded)))?;
        lead.status = next_status(Some(lead.status), LifecycleEvent::SendSucceeded)?;
        lead.last_contacted = Some(sent_at);
        let updated = lead.clone();
        let seq = state.bump();
        state.emails.push((seq, entry.clone()));
        Ok(updated)
    }

    async fn list_email_logs(
        &self,
        owner: OwnerId,
        lead_id: Option<Uuid>,
    ) -> Result<Vec<EmailLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .emails
                .iter()
                .filter(|(_, e)| e.owner_id == owner)
                .filter(|(_, e)| lead_id.map_or(true, |id| e.lead_id == id))
                .map(|(seq, e)| (*seq, e.created_at, e.clone()))
                .collect(),
        ))
    }

    async fn insert_template(
        &self,
        owner: OwnerId,
        template: NewTemplate,
    ) -> Result<Template, StoreError> {
        template.validate()?;
        let mut state = self.state.lock().await;
        let created = Template {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: template.name,
            subject: template.subject,
            body: template.body,
            created_at: Utc::now(),
        };
        let seq = state.bump();
        state.templates.push((seq, created.clone()));
        Ok(created)
    }

    async fn list_templates(&self, owner: OwnerId) -> Result<Vec<Template>, StoreError> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .templates
                .iter()
                .filter(|(_, t)| t.owner_id == owner)
                .map(|(seq, t)| (*seq, t.created_at, t.clone()))
                .collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

const LEAD_COLUMNS: &str = "id, owner_id, name, email, channel_name, platform, source_url, niche, \
     last_posted, ability_to_pay_analysis, status, created_at, last_contacted";

const EMAIL_COLUMNS: &str =
    "id, owner_id, lead_id, subject, body, status, error_message, sent_at, created_at";

#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn locked_status(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        owner: OwnerId,
        id: Uuid,
    ) -> Result<Option<LeadStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM leads WHERE id = $1 AND owner_id = $2 FOR UPDATE")
            .bind(id)
            .bind(owner.0)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                parse_status(&status).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn parse_status(raw: &str) -> Result<LeadStatus, StoreError> {
    raw.parse()
        .map_err(|e: clo_core::UnknownStatus| StoreError::Corrupt(e.to_string()))
}

fn lead_from_row(row: &PgRow) -> Result<Lead, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Lead {
        id: row.try_get("id")?,
        owner_id: OwnerId(row.try_get("owner_id")?),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        channel_name: row.try_get("channel_name")?,
        platform: row.try_get("platform")?,
        source_url: row.try_get("source_url")?,
        niche: row.try_get("niche")?,
        last_posted: row.try_get("last_posted")?,
        ability_to_pay_analysis: row.try_get("ability_to_pay_analysis")?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at")?,
        last_contacted: row.try_get("last_contacted")?,
    })
}

fn email_from_row(row: &PgRow) -> Result<EmailLogEntry, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let sent_at: Option<DateTime<Utc>> = row.try_get("sent_at")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let outcome = match (status.as_str(), sent_at, error_message) {
        ("sent", Some(sent_at), None) => EmailOutcome::Sent { sent_at },
        ("failed", None, Some(error_message)) => EmailOutcome::Failed { error_message },
        (other, _, _) => {
            return Err(StoreError::Corrupt(format!(
                "email {id} has inconsistent outcome `{other}`"
            )))
        }
    };
    Ok(EmailLogEntry {
        id,
        owner_id: OwnerId(row.try_get("owner_id")?),
        lead_id: row.try_get("lead_id")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        outcome,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template, StoreError> {
    Ok(Template {
        id: row.try_get("id")?,
        owner_id: OwnerId(row.try_get("owner_id")?),
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_email_row<'e, E>(executor: E, entry: &EmailLogEntry) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let (sent_at, error_message) = match &entry.outcome {
        EmailOutcome::Sent { sent_at } => (Some(*sent_at), None),
        EmailOutcome::Failed { error_message } => (None, Some(error_message.as_str())),
    };
    sqlx::query(
        r#"
        INSERT INTO emails (id, owner_id, lead_id, subject, body, status, error_message, sent_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(entry.owner_id.0)
    .bind(entry.lead_id)
    .bind(&entry.subject)
    .bind(&entry.body)
    .bind(entry.outcome.as_str())
    .bind(error_message)
    .bind(sent_at)
    .bind(entry.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn list_leads(&self, owner: OwnerId) -> Result<Vec<Lead>, StoreError> {
        let sql = format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE owner_id = $1 ORDER BY created_at DESC, seq DESC"
        );
        let rows = sqlx::query(&sql).bind(owner.0).fetch_all(&self.pool).await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn get_lead(&self, owner: OwnerId, id: Uuid) -> Result<Lead, StoreError> {
        let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1 AND owner_id = $2");
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(owner.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::LeadNotFound(id))?;
        lead_from_row(&row)
    }

    async fn insert_leads(
        &self,
        owner: OwnerId,
        candidates: Vec<CandidateLead>,
    ) -> Result<Vec<Lead>, StoreError> {
        let validated = validate_candidates(candidates)?;
        let created_at = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO leads (id, owner_id, name, email, channel_name, platform, source_url, niche,
                               last_posted, ability_to_pay_analysis, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {LEAD_COLUMNS}
            "#
        );
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(validated.len());
        for new in validated {
            let status = next_status(None, LifecycleEvent::Ingested)?;
            let row = sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(owner.0)
                .bind(&new.name)
                .bind(&new.email)
                .bind(&new.channel_name)
                .bind(&new.platform)
                .bind(&new.source_url)
                .bind(&new.niche)
                .bind(new.last_posted)
                .bind(&new.ability_to_pay_analysis)
                .bind(status.as_str())
                .bind(created_at)
                .fetch_one(&mut *tx)
                .await?;
            inserted.push(lead_from_row(&row)?);
        }
        tx.commit().await?;
        debug!(%owner, count = inserted.len(), "inserted leads");
        Ok(inserted)
    }

    async fn update_lead(
        &self,
        owner: OwnerId,
        id: Uuid,
        patch: &LeadPatch,
    ) -> Result<Lead, StoreError> {
        let sql = format!(
            r#"
            UPDATE leads
               SET email = COALESCE($3, email),
                   channel_name = COALESCE($4, channel_name),
                   niche = COALESCE($5, niche),
                   last_posted = COALESCE($6, last_posted),
                   ability_to_pay_analysis = COALESCE($7, ability_to_pay_analysis)
             WHERE id = $1 AND owner_id = $2
            RETURNING {LEAD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(owner.0)
            .bind(&patch.email)
            .bind(&patch.channel_name)
            .bind(&patch.niche)
            .bind(patch.last_posted)
            .bind(&patch.ability_to_pay_analysis)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::LeadNotFound(id))?;
        lead_from_row(&row)
    }

    async fn update_lead_status(
        &self,
        owner: OwnerId,
        id: Uuid,
        event: LifecycleEvent,
        contacted_at: Option<DateTime<Utc>>,
    ) -> Result<Lead, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::locked_status(&mut tx, owner, id).await?;
        let status = next_status(current, event)?;
        let contacted_at = contacted_at.filter(|_| event == LifecycleEvent::SendSucceeded);
        let sql = format!(
            r#"
            UPDATE leads
               SET status = $3,
                   last_contacted = COALESCE($4, last_contacted)
             WHERE id = $1 AND owner_id = $2
            RETURNING {LEAD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(owner.0)
            .bind(status.as_str())
            .bind(contacted_at)
            .fetch_one(&mut *tx)
            .await?;
        let lead = lead_from_row(&row)?;
        tx.commit().await?;
        Ok(lead)
    }

    async fn delete_lead(&self, owner: OwnerId, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM leads WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LeadNotFound(id));
        }
        Ok(())
    }

    async fn insert_email_log(&self, entry: &EmailLogEntry) -> Result<(), StoreError> {
        let lead_owner: Option<Uuid> = sqlx::query("SELECT owner_id FROM leads WHERE id = $1")
            .bind(entry.lead_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("owner_id"))
            .transpose()?;
        if lead_owner.is_some_and(|o| o != entry.owner_id.0) {
            return Err(StoreError::OwnerMismatch(entry.lead_id));
        }
        insert_email_row(&self.pool, entry).await
    }

    async fn record_send_success(&self, entry: &EmailLogEntry) -> Result<Lead, StoreError> {
        let sent_at = sent_at_of(entry)?;
        let mut tx = self.pool.begin().await?;
        let current = Self::locked_status(&mut tx, entry.owner_id, entry.lead_id).await?;
        let status = next_status(current, LifecycleEvent::SendSucceeded)?;
        insert_email_row(&mut *tx, entry).await?;
        let sql = format!(
            r#"
            UPDATE leads
               SET status = $3,
                   last_contacted = $4
             WHERE id = $1 AND owner_id = $2
            RETURNING {LEAD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(entry.lead_id)
            .bind(entry.owner_id.0)
            .bind(status.as_str())
            .bind(sent_at)
            .fetch_one(&mut *tx)
            .await?;
        let lead = lead_from_row(&row)?;
        tx.commit().await?;
        Ok(lead)
    }

    async fn list_email_logs(
        &self,
        owner: OwnerId,
        lead_id: Option<Uuid>,
    ) -> Result<Vec<EmailLogEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {EMAIL_COLUMNS}
              FROM emails
             WHERE owner_id = $1
               AND ($2::uuid IS NULL OR lead_id = $2)
             ORDER BY created_at DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(owner.0)
            .bind(lead_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(email_from_row).collect()
    }

    async fn insert_template(
        &self,
        owner: OwnerId,
        template: NewTemplate,
    ) -> Result<Template, StoreError> {
        template.validate()?;
        let row = sqlx::query(
            r#"
            INSERT INTO templates (id, owner_id, name, subject, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, owner_id, name, subject, body, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner.0)
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        template_from_row(&row)
    }

    async fn list_templates(&self, owner: OwnerId) -> Result<Vec<Template>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, name, subject, body, created_at
              FROM templates
             WHERE owner_id = $1
             ORDER BY created_at DESC
            "#,
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(template_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clo_core::LastActivity;

    fn candidate(name: &str) -> CandidateLead {
        CandidateLead {
            name: Some(name.to_string()),
            email: Some(format!("{}@example.com", name.to_ascii_lowercase())),
            channel_name: Some(format!("{name} Channel")),
            platform: Some("YouTube".into()),
            source_url: Some(format!("https://youtube.com/@{}", name.to_ascii_lowercase())),
            niche: None,
            last_posted: Some(LastActivity::Unknown),
            ability_to_pay_analysis: None,
        }
    }

    #[tokio::test]
    async fn inserted_leads_are_listed_newest_first_with_fields_preserved() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let inserted = store
            .insert_leads(owner, vec![candidate("Ana"), candidate("Ben"), candidate("Cy")])
            .await
            .unwrap();
        assert_eq!(
            inserted.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            vec!["Ana", "Ben", "Cy"]
        );

        let listed = store.list_leads(owner).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(
            listed.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            vec!["Cy", "Ben", "Ana"]
        );
        for lead in &listed {
            assert_eq!(lead.status, LeadStatus::New);
            assert_eq!(lead.niche, None);
            assert_eq!(lead.last_posted, None);
            assert!(inserted.iter().any(|i| i.id == lead.id));
        }
    }

    #[tokio::test]
    async fn invalid_candidate_rejects_whole_batch() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let mut bad = candidate("Dee");
        bad.email = None;
        let err = store
            .insert_leads(owner, vec![candidate("Ana"), bad])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidCandidate {
                index: 1,
                reason: CandidateRejection::MissingEmail
            }
        ));
        assert!(store.list_leads(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_are_invisible_to_other_owners() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let intruder = OwnerId::new();
        let lead = store
            .insert_leads(owner, vec![candidate("Ana")])
            .await
            .unwrap()
            .remove(0);

        assert!(store.list_leads(intruder).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_lead(intruder, lead.id).await,
            Err(StoreError::LeadNotFound(_))
        ));
        assert!(store
            .update_lead(intruder, lead.id, &LeadPatch::default())
            .await
            .is_err());

        let foreign_log = EmailLogEntry::failed(intruder, lead.id, "s".into(), "b".into(), "x".into());
        assert!(matches!(
            store.insert_email_log(&foreign_log).await,
            Err(StoreError::OwnerMismatch(_))
        ));
    }

    #[tokio::test]
    async fn status_updates_on_deleted_leads_fail_closed() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let lead = store
            .insert_leads(owner, vec![candidate("Ana")])
            .await
            .unwrap()
            .remove(0);
        store.delete_lead(owner, lead.id).await.unwrap();

        let err = store
            .update_lead_status(owner, lead.id, LifecycleEvent::MovedToCampaign, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(TransitionError::Missing(_))));
    }

    #[tokio::test]
    async fn send_success_is_recorded_atomically() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let lead = store
            .insert_leads(owner, vec![candidate("Ana")])
            .await
            .unwrap()
            .remove(0);
        let sent_at = Utc::now();

        let entry = EmailLogEntry::sent(owner, lead.id, "Hi".into(), "Body".into(), sent_at);
        let updated = store.record_send_success(&entry).await.unwrap();
        assert_eq!(updated.status, LeadStatus::Contacted);
        assert_eq!(updated.last_contacted, Some(sent_at));

        store.delete_lead(owner, lead.id).await.unwrap();
        let again = EmailLogEntry::sent(owner, lead.id, "Hi".into(), "Body".into(), Utc::now());
        assert!(store.record_send_success(&again).await.is_err());

        let logs = store.list_email_logs(owner, Some(lead.id)).await.unwrap();
        assert_eq!(logs.len(), 1, "log entries survive lead deletion, failed writes add none");
        assert_eq!(logs[0].id, entry.id);
    }

    #[tokio::test]
    async fn failed_entries_cannot_drive_success_bookkeeping() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let lead = store
            .insert_leads(owner, vec![candidate("Ana")])
            .await
            .unwrap()
            .remove(0);
        let entry = EmailLogEntry::failed(owner, lead.id, "s".into(), "b".into(), "boom".into());
        assert!(matches!(
            store.record_send_success(&entry).await,
            Err(StoreError::InvalidLogEntry(_))
        ));
        assert_eq!(store.get_lead(owner, lead.id).await.unwrap().status, LeadStatus::New);
    }

    #[tokio::test]
    async fn templates_require_content_and_list_newest_first() {
        let store = MemoryLeadStore::new();
        let owner = OwnerId::new();
        let first = store
            .insert_template(
                owner,
                NewTemplate {
                    name: "First".into(),
                    subject: "Hi {{name}}".into(),
                    body: "Body".into(),
                },
            )
            .await
            .unwrap();
        let second = store
            .insert_template(
                owner,
                NewTemplate {
                    name: "Second".into(),
                    subject: "Hello".into(),
                    body: "Body".into(),
                },
            )
            .await
            .unwrap();
        let rejected = store
            .insert_template(
                owner,
                NewTemplate {
                    name: "".into(),
                    subject: "Hello".into(),
                    body: "Body".into(),
                },
            )
            .await;
        assert!(matches!(rejected, Err(StoreError::InvalidTemplate(_))));

        let listed = store.list_templates(owner).await.unwrap();
        assert_eq!(
            listed.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
    }
}
