//! Staging table for fetched emails awaiting conversion into tickets.
//!
//! Rows are never deleted: once a row is `processed`, `duplicate` or `failed`
//! it stays as the audit trail of what the mailbox delivered and what the
//! pipeline did with it.

mod postgres_queue;
mod sqlite_queue;
mod types;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use self::postgres_queue::PostgresEmailQueue;
pub use self::sqlite_queue::SqliteEmailQueue;
pub use self::types::{
    EnqueueResult, NewQueuedEmail, QueueSettings, QueueStats, QueueStatus, QueuedEmail,
    DEFAULT_LEASE_SECS, DEFAULT_MAX_RETRIES,
};

#[derive(Debug, thiserror::Error)]
pub enum EmailQueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("uuid error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown queue status: {0}")]
    InvalidStatus(String),
    #[error("missing EMAIL_QUEUE_DB_URL/DATABASE_URL")]
    MissingDbUrl,
    #[error("invalid email queue table name: {0}")]
    InvalidTableName(String),
    #[error("email queue config error: {0}")]
    Config(String),
}

pub trait EmailQueue: Send + Sync {
    fn enqueue(&self, email: &NewQueuedEmail) -> Result<EnqueueResult, EmailQueueError>;
    fn contains_dedupe_key(&self, dedupe_key: &str) -> Result<bool, EmailQueueError>;
    fn claim_next(&self) -> Result<Option<QueuedEmail>, EmailQueueError>;
    fn mark_processed(&self, id: &Uuid, ticket_id: Option<i64>) -> Result<(), EmailQueueError>;
    /// Pins the ticket created for a row that is still in flight, so a retry
    /// comments on it instead of creating another.
    fn record_ticket(&self, id: &Uuid, ticket_id: i64) -> Result<(), EmailQueueError>;
    fn mark_duplicate(
        &self,
        id: &Uuid,
        duplicate_of: &Uuid,
        reason: &str,
    ) -> Result<(), EmailQueueError>;
    /// Records a retryable failure and returns the status the row ended in.
    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<QueueStatus, EmailQueueError>;
    /// Records a failure that retrying cannot fix.
    fn mark_rejected(&self, id: &Uuid, error: &str) -> Result<(), EmailQueueError>;
    fn requeue(&self, id: &Uuid) -> Result<bool, EmailQueueError>;
    fn find_processed_by_message_id(
        &self,
        message_id: &str,
        exclude: &Uuid,
    ) -> Result<Option<Uuid>, EmailQueueError>;
    fn recent_processed_from_sender(
        &self,
        from_address: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: &Uuid,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError>;
    fn find_ticket_for_message_ids(
        &self,
        message_ids: &[String],
    ) -> Result<Option<i64>, EmailQueueError>;
    fn get(&self, id: &Uuid) -> Result<Option<QueuedEmail>, EmailQueueError>;
    fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError>;
    fn stats(&self) -> Result<QueueStats, EmailQueueError>;
}

pub fn resolve_queue_backend() -> String {
    env::var("EMAIL_QUEUE_BACKEND")
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "sqlite".to_string())
}

pub fn resolve_db_url() -> Result<String, EmailQueueError> {
    env::var("EMAIL_QUEUE_DB_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            env::var("DATABASE_URL")
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
        .ok_or(EmailQueueError::MissingDbUrl)
}

/// Opens the configured backend. Postgres connects eagerly, so call this from
/// a blocking context.
pub fn build_queue(
    backend: &str,
    sqlite_path: PathBuf,
    settings: QueueSettings,
) -> Result<Arc<dyn EmailQueue>, EmailQueueError> {
    match backend {
        "sqlite" => Ok(Arc::new(SqliteEmailQueue::new(sqlite_path, settings)?)),
        "postgres" => {
            let db_url = resolve_db_url()?;
            Ok(Arc::new(PostgresEmailQueue::from_url(&db_url, settings)?))
        }
        other => Err(EmailQueueError::Config(format!(
            "unknown EMAIL_QUEUE_BACKEND: {}",
            other
        ))),
    }
}
