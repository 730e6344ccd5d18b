use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::inbound::InboundEmail;

use super::types::{
    next_failure_state, EnqueueResult, LEASE_EXPIRED_MESSAGE, NewQueuedEmail, QueueSettings, QueueStats, QueueStatus,
    QueuedEmail,
};
use super::{EmailQueue, EmailQueueError};

const EMAIL_QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS email_queue (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    message_id TEXT NOT NULL,
    from_address TEXT,
    from_name TEXT,
    to_addresses TEXT NOT NULL DEFAULT '[]',
    cc_addresses TEXT NOT NULL DEFAULT '[]',
    subject TEXT,
    text_body TEXT,
    html_body TEXT,
    in_reply_to TEXT NOT NULL DEFAULT '[]',
    references_json TEXT NOT NULL DEFAULT '[]',
    received_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    processed_at TEXT,
    locked_at TEXT,
    ticket_id INTEGER,
    duplicate_of TEXT
);
CREATE INDEX IF NOT EXISTS email_queue_pending_idx
    ON email_queue(status, retry_count, received_at);
CREATE INDEX IF NOT EXISTS email_queue_message_idx
    ON email_queue(message_id);
CREATE INDEX IF NOT EXISTS email_queue_sender_idx
    ON email_queue(from_address, received_at);
"#;

const SELECT_COLUMNS: &str = "id, account_id, dedupe_key, message_id, from_address, from_name,
    to_addresses, cc_addresses, subject, text_body, html_body, in_reply_to, references_json,
    received_at, created_at, status, retry_count, error_message, processed_at, ticket_id,
    duplicate_of";

#[derive(Debug)]
pub struct SqliteEmailQueue {
    path: PathBuf,
    settings: QueueSettings,
}

impl SqliteEmailQueue {
    pub fn new(path: impl Into<PathBuf>, settings: QueueSettings) -> Result<Self, EmailQueueError> {
        let queue = Self {
            path: path.into(),
            settings,
        };
        let _ = queue.open()?;
        Ok(queue)
    }

    fn open(&self) -> Result<Connection, EmailQueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(EMAIL_QUEUE_SCHEMA)?;
        Ok(conn)
    }

    fn query_rows(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<QueuedEmail>, EmailQueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, read_raw)?;
        let mut emails = Vec::new();
        for row in rows {
            emails.push(row?.into_queued()?);
        }
        Ok(emails)
    }
}

impl EmailQueue for SqliteEmailQueue {
    fn enqueue(&self, new: &NewQueuedEmail) -> Result<EnqueueResult, EmailQueueError> {
        let conn = self.open()?;
        let id = Uuid::new_v4();
        let email = &new.email;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO email_queue
                (id, account_id, dedupe_key, message_id, from_address, from_name, to_addresses,
                 cc_addresses, subject, text_body, html_body, in_reply_to, references_json,
                 received_at, created_at, status, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 'pending', 0)",
            params![
                id.to_string(),
                new.account_id,
                new.dedupe_key,
                email.message_id,
                email.from_address,
                email.from_name,
                serde_json::to_string(&email.to_addresses)?,
                serde_json::to_string(&email.cc_addresses)?,
                email.subject,
                email.text_body,
                email.html_body,
                serde_json::to_string(&email.in_reply_to)?,
                serde_json::to_string(&email.references)?,
                format_datetime(email.received_at),
                format_datetime(Utc::now()),
            ],
        )?;
        if changed == 0 {
            debug!("email queue skipped known message dedupe_key={}", new.dedupe_key);
            return Ok(EnqueueResult {
                inserted: false,
                id: None,
            });
        }
        Ok(EnqueueResult {
            inserted: true,
            id: Some(id),
        })
    }

    fn contains_dedupe_key(&self, dedupe_key: &str) -> Result<bool, EmailQueueError> {
        let conn = self.open()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM email_queue WHERE dedupe_key = ?1",
                params![dedupe_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn claim_next(&self) -> Result<Option<QueuedEmail>, EmailQueueError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let max_retries = i64::from(self.settings.max_retries);
        let lease_cutoff = format_datetime(now - self.settings.lease);
        // An expired lease means the run holding the row died; that counts
        // as an attempt.
        let expired = tx.execute(
            "UPDATE email_queue
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                 error_message = ?3,
                 locked_at = NULL
             WHERE status = 'processing' AND (locked_at IS NULL OR locked_at < ?2)",
            params![max_retries, lease_cutoff, LEASE_EXPIRED_MESSAGE],
        )?;
        if expired > 0 {
            warn!("email queue reclaimed {} row(s) with expired leases", expired);
        }
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {}
                     FROM email_queue
                     WHERE status = 'pending' AND retry_count < ?1
                     ORDER BY received_at, created_at
                     LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![max_retries],
                read_raw,
            )
            .optional()?;

        let Some(raw) = raw else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE email_queue SET status = 'processing', locked_at = ?2 WHERE id = ?1",
            params![raw.id, format_datetime(now)],
        )?;
        tx.commit()?;

        let mut email = raw.into_queued()?;
        email.status = QueueStatus::Processing;
        email.is_processed = false;
        Ok(Some(email))
    }

    fn mark_processed(&self, id: &Uuid, ticket_id: Option<i64>) -> Result<(), EmailQueueError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE email_queue
             SET status = 'processed',
                 processed_at = ?2,
                 locked_at = NULL,
                 ticket_id = ?3,
                 error_message = NULL
             WHERE id = ?1",
            params![id.to_string(), format_datetime(Utc::now()), ticket_id],
        )?;
        Ok(())
    }

    fn record_ticket(&self, id: &Uuid, ticket_id: i64) -> Result<(), EmailQueueError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE email_queue SET ticket_id = ?2 WHERE id = ?1",
            params![id.to_string(), ticket_id],
        )?;
        Ok(())
    }

    fn mark_duplicate(
        &self,
        id: &Uuid,
        duplicate_of: &Uuid,
        reason: &str,
    ) -> Result<(), EmailQueueError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE email_queue
             SET status = 'duplicate',
                 processed_at = ?2,
                 locked_at = NULL,
                 duplicate_of = ?3,
                 error_message = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                format_datetime(Utc::now()),
                duplicate_of.to_string(),
                reason
            ],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<QueueStatus, EmailQueueError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let retry_count: i64 = tx.query_row(
            "SELECT retry_count FROM email_queue WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        let (next_count, status) =
            next_failure_state(u32::try_from(retry_count).unwrap_or(0), self.settings.max_retries);
        tx.execute(
            "UPDATE email_queue
             SET status = ?2,
                 retry_count = ?3,
                 error_message = ?4,
                 locked_at = NULL
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), i64::from(next_count), error],
        )?;
        tx.commit()?;
        Ok(status)
    }

    fn mark_rejected(&self, id: &Uuid, error: &str) -> Result<(), EmailQueueError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE email_queue
             SET status = 'failed',
                 error_message = ?2,
                 processed_at = ?3,
                 locked_at = NULL
             WHERE id = ?1",
            params![id.to_string(), error, format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    fn requeue(&self, id: &Uuid) -> Result<bool, EmailQueueError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE email_queue
             SET status = 'pending',
                 retry_count = 0,
                 error_message = NULL,
                 processed_at = NULL,
                 locked_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn find_processed_by_message_id(
        &self,
        message_id: &str,
        exclude: &Uuid,
    ) -> Result<Option<Uuid>, EmailQueueError> {
        let conn = self.open()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM email_queue
                 WHERE message_id = ?1
                   AND id != ?2
                   AND status IN ('processed', 'duplicate')
                 ORDER BY CASE status WHEN 'processed' THEN 0 ELSE 1 END, received_at
                 LIMIT 1",
                params![message_id, exclude.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        found
            .map(|value| Uuid::parse_str(&value).map_err(EmailQueueError::from))
            .transpose()
    }

    fn recent_processed_from_sender(
        &self,
        from_address: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: &Uuid,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError> {
        self.query_rows(
            &format!(
                "SELECT {}
                 FROM email_queue
                 WHERE from_address = ?1
                   AND status = 'processed'
                   AND received_at >= ?2
                   AND received_at <= ?3
                   AND id != ?4
                 ORDER BY received_at DESC
                 LIMIT 50",
                SELECT_COLUMNS
            ),
            params![
                from_address,
                format_datetime(since),
                format_datetime(until),
                exclude.to_string()
            ],
        )
    }

    fn find_ticket_for_message_ids(
        &self,
        message_ids: &[String],
    ) -> Result<Option<i64>, EmailQueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT ticket_id FROM email_queue
             WHERE message_id = ?1
               AND status = 'processed'
               AND ticket_id IS NOT NULL
             ORDER BY received_at DESC
             LIMIT 1",
        )?;
        for message_id in message_ids {
            let ticket_id: Option<i64> = stmt
                .query_row(params![message_id], |row| row.get(0))
                .optional()?;
            if ticket_id.is_some() {
                return Ok(ticket_id);
            }
        }
        Ok(None)
    }

    fn get(&self, id: &Uuid) -> Result<Option<QueuedEmail>, EmailQueueError> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM email_queue WHERE id = ?1", SELECT_COLUMNS),
                params![id.to_string()],
                read_raw,
            )
            .optional()?;
        raw.map(RawRow::into_queued).transpose()
    }

    fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => self.query_rows(
                &format!(
                    "SELECT {} FROM email_queue WHERE status = ?1
                     ORDER BY received_at DESC LIMIT ?2",
                    SELECT_COLUMNS
                ),
                params![status.as_str(), limit],
            ),
            None => self.query_rows(
                &format!(
                    "SELECT {} FROM email_queue ORDER BY received_at DESC LIMIT ?1",
                    SELECT_COLUMNS
                ),
                params![limit],
            ),
        }
    }

    fn stats(&self) -> Result<QueueStats, EmailQueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM email_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            stats.add(status.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

struct RawRow {
    id: String,
    account_id: String,
    dedupe_key: String,
    message_id: String,
    from_address: Option<String>,
    from_name: Option<String>,
    to_addresses: String,
    cc_addresses: String,
    subject: Option<String>,
    text_body: Option<String>,
    html_body: Option<String>,
    in_reply_to: String,
    references: String,
    received_at: String,
    created_at: String,
    status: String,
    retry_count: i64,
    error_message: Option<String>,
    processed_at: Option<String>,
    ticket_id: Option<i64>,
    duplicate_of: Option<String>,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        account_id: row.get(1)?,
        dedupe_key: row.get(2)?,
        message_id: row.get(3)?,
        from_address: row.get(4)?,
        from_name: row.get(5)?,
        to_addresses: row.get(6)?,
        cc_addresses: row.get(7)?,
        subject: row.get(8)?,
        text_body: row.get(9)?,
        html_body: row.get(10)?,
        in_reply_to: row.get(11)?,
        references: row.get(12)?,
        received_at: row.get(13)?,
        created_at: row.get(14)?,
        status: row.get(15)?,
        retry_count: row.get(16)?,
        error_message: row.get(17)?,
        processed_at: row.get(18)?,
        ticket_id: row.get(19)?,
        duplicate_of: row.get(20)?,
    })
}

impl RawRow {
    fn into_queued(self) -> Result<QueuedEmail, EmailQueueError> {
        let status: QueueStatus = self.status.parse()?;
        Ok(QueuedEmail {
            id: Uuid::parse_str(&self.id)?,
            account_id: self.account_id,
            dedupe_key: self.dedupe_key,
            email: InboundEmail {
                message_id: self.message_id,
                from_address: self.from_address,
                from_name: self.from_name,
                to_addresses: serde_json::from_str(&self.to_addresses)?,
                cc_addresses: serde_json::from_str(&self.cc_addresses)?,
                subject: self.subject,
                text_body: self.text_body,
                html_body: self.html_body,
                in_reply_to: serde_json::from_str(&self.in_reply_to)?,
                references: serde_json::from_str(&self.references)?,
                received_at: parse_datetime(&self.received_at)?,
            },
            status,
            is_processed: status.is_processed(),
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            error_message: self.error_message,
            created_at: parse_datetime(&self.created_at)?,
            processed_at: self
                .processed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            ticket_id: self.ticket_id,
            duplicate_of: self
                .duplicate_of
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()?,
        })
    }
}

/// Fixed-width UTC timestamps so TEXT comparison orders chronologically.
fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
