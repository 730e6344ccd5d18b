use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{error, warn};
use uuid::Uuid;

use crate::inbound::InboundEmail;

use super::types::{
    next_failure_state, EnqueueResult, LEASE_EXPIRED_MESSAGE, NewQueuedEmail, QueueSettings, QueueStats, QueueStatus,
    QueuedEmail,
};
use super::{EmailQueue, EmailQueueError};

type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;
type PgConnection = PooledConnection<PostgresConnectionManager<MakeTlsConnector>>;

const SELECT_COLUMNS: &str = "id, account_id, dedupe_key, message_id, from_address, from_name,
    to_addresses, cc_addresses, subject, text_body, html_body, in_reply_to, references_json,
    received_at, created_at, status, retry_count, error_message, processed_at, ticket_id,
    duplicate_of";

/// Logs the underlying connection error instead of letting r2d2 swallow it.
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("postgres connection pool error: {:?}", err);
    }
}

pub struct PostgresEmailQueue {
    pool: Option<PgPool>,
    table: String,
    settings: QueueSettings,
}

impl PostgresEmailQueue {
    pub fn from_url(db_url: &str, settings: QueueSettings) -> Result<Self, EmailQueueError> {
        let table = resolve_table_name()?;
        Self::new(db_url, &table, settings)
    }

    pub fn new(db_url: &str, table: &str, settings: QueueSettings) -> Result<Self, EmailQueueError> {
        let table = sanitize_table_name(table)?;

        let config: postgres::Config = db_url.parse()?;
        let mut tls_builder = native_tls::TlsConnector::builder();
        if env_flag("EMAIL_QUEUE_TLS_ALLOW_INVALID_CERTS") {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| EmailQueueError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(4)
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let queue = Self {
            pool: Some(pool),
            table,
            settings,
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn connection(&self) -> Result<PgConnection, EmailQueueError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| EmailQueueError::Config("email queue pool unavailable".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), EmailQueueError> {
        let mut conn = self.connection()?;
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
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
                received_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                processed_at TIMESTAMPTZ,
                locked_at TIMESTAMPTZ,
                ticket_id BIGINT,
                duplicate_of UUID
            );
            CREATE INDEX IF NOT EXISTS {table}_pending_idx
                ON {table}(status, retry_count, received_at);
            CREATE INDEX IF NOT EXISTS {table}_message_idx
                ON {table}(message_id);
            CREATE INDEX IF NOT EXISTS {table}_sender_idx
                ON {table}(from_address, received_at);",
            table = self.table
        );
        conn.batch_execute(&statement)?;
        Ok(())
    }

    fn max_retries(&self) -> i32 {
        i32::try_from(self.settings.max_retries).unwrap_or(i32::MAX)
    }

    #[cfg(test)]
    fn drop_table_for_tests(&self) {
        if let Ok(mut conn) = self.connection() {
            let _ = conn.execute(&format!("DROP TABLE IF EXISTS {}", self.table), &[]);
        }
    }
}

impl EmailQueue for PostgresEmailQueue {
    fn enqueue(&self, new: &NewQueuedEmail) -> Result<EnqueueResult, EmailQueueError> {
        let mut conn = self.connection()?;
        let id = Uuid::new_v4();
        let email = &new.email;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table}
                    (id, account_id, dedupe_key, message_id, from_address, from_name,
                     to_addresses, cc_addresses, subject, text_body, html_body, in_reply_to,
                     references_json, received_at, created_at, status, retry_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(),
                         'pending', 0)
                 ON CONFLICT (dedupe_key) DO NOTHING",
                table = self.table
            ),
            &[
                &id,
                &new.account_id,
                &new.dedupe_key,
                &email.message_id,
                &email.from_address,
                &email.from_name,
                &serde_json::to_string(&email.to_addresses)?,
                &serde_json::to_string(&email.cc_addresses)?,
                &email.subject,
                &email.text_body,
                &email.html_body,
                &serde_json::to_string(&email.in_reply_to)?,
                &serde_json::to_string(&email.references)?,
                &email.received_at,
            ],
        )?;

        Ok(EnqueueResult {
            inserted: inserted > 0,
            id: (inserted > 0).then_some(id),
        })
    }

    fn contains_dedupe_key(&self, dedupe_key: &str) -> Result<bool, EmailQueueError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT 1 FROM {table} WHERE dedupe_key = $1",
                table = self.table
            ),
            &[&dedupe_key],
        )?;
        Ok(row.is_some())
    }

    fn claim_next(&self) -> Result<Option<QueuedEmail>, EmailQueueError> {
        let mut conn = self.connection()?;
        let lease_secs = self.settings.lease.num_seconds();

        let mut tx = conn.transaction()?;
        // An expired lease means the run holding the row died; that counts
        // as an attempt.
        let expired = tx.execute(
            &format!(
                "UPDATE {table}
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 >= $1 THEN 'failed' ELSE 'pending' END,
                     error_message = $3,
                     locked_at = NULL
                 WHERE status = 'processing'
                   AND (locked_at IS NULL
                        OR locked_at < now() - ($2::bigint * interval '1 second'))",
                table = self.table
            ),
            &[&self.max_retries(), &lease_secs, &LEASE_EXPIRED_MESSAGE],
        )?;
        if expired > 0 {
            warn!("email queue reclaimed {} row(s) with expired leases", expired);
        }
        let row = tx.query_opt(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE status = 'pending' AND retry_count < $1
                 ORDER BY received_at, created_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED",
                columns = SELECT_COLUMNS,
                table = self.table
            ),
            &[&self.max_retries()],
        )?;

        let Some(row) = row else {
            tx.commit()?;
            return Ok(None);
        };

        let mut email = queued_from_row(&row)?;
        tx.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'processing',
                     locked_at = now()
                 WHERE id = $1",
                table = self.table
            ),
            &[&email.id],
        )?;
        tx.commit()?;

        email.status = QueueStatus::Processing;
        email.is_processed = false;
        Ok(Some(email))
    }

    fn mark_processed(&self, id: &Uuid, ticket_id: Option<i64>) -> Result<(), EmailQueueError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'processed',
                     processed_at = now(),
                     locked_at = NULL,
                     ticket_id = $2,
                     error_message = NULL
                 WHERE id = $1",
                table = self.table
            ),
            &[id, &ticket_id],
        )?;
        Ok(())
    }

    fn record_ticket(&self, id: &Uuid, ticket_id: i64) -> Result<(), EmailQueueError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "UPDATE {table} SET ticket_id = $2 WHERE id = $1",
                table = self.table
            ),
            &[id, &ticket_id],
        )?;
        Ok(())
    }

    fn mark_duplicate(
        &self,
        id: &Uuid,
        duplicate_of: &Uuid,
        reason: &str,
    ) -> Result<(), EmailQueueError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'duplicate',
                     processed_at = now(),
                     locked_at = NULL,
                     duplicate_of = $2,
                     error_message = $3
                 WHERE id = $1",
                table = self.table
            ),
            &[id, duplicate_of, &reason],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &Uuid, error: &str) -> Result<QueueStatus, EmailQueueError> {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let retry_count: i32 = tx
            .query_one(
                &format!(
                    "SELECT retry_count FROM {table} WHERE id = $1 FOR UPDATE",
                    table = self.table
                ),
                &[id],
            )?
            .get(0);

        let (next_count, status) = next_failure_state(
            u32::try_from(retry_count).unwrap_or(0),
            self.settings.max_retries,
        );
        let next_count = i32::try_from(next_count).unwrap_or(i32::MAX);
        tx.execute(
            &format!(
                "UPDATE {table}
                 SET status = $2,
                     retry_count = $3,
                     error_message = $4,
                     locked_at = NULL
                 WHERE id = $1",
                table = self.table
            ),
            &[id, &status.as_str(), &next_count, &error],
        )?;
        tx.commit()?;
        Ok(status)
    }

    fn mark_rejected(&self, id: &Uuid, error: &str) -> Result<(), EmailQueueError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'failed',
                     error_message = $2,
                     processed_at = now(),
                     locked_at = NULL
                 WHERE id = $1",
                table = self.table
            ),
            &[id, &error],
        )?;
        Ok(())
    }

    fn requeue(&self, id: &Uuid) -> Result<bool, EmailQueueError> {
        let mut conn = self.connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {table}
                 SET status = 'pending',
                     retry_count = 0,
                     error_message = NULL,
                     processed_at = NULL,
                     locked_at = NULL
                 WHERE id = $1 AND status = 'failed'",
                table = self.table
            ),
            &[id],
        )?;
        Ok(updated > 0)
    }

    fn find_processed_by_message_id(
        &self,
        message_id: &str,
        exclude: &Uuid,
    ) -> Result<Option<Uuid>, EmailQueueError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT id FROM {table}
                 WHERE message_id = $1
                   AND id <> $2
                   AND status IN ('processed', 'duplicate')
                 ORDER BY CASE status WHEN 'processed' THEN 0 ELSE 1 END, received_at
                 LIMIT 1",
                table = self.table
            ),
            &[&message_id, exclude],
        )?;
        Ok(row.map(|row| row.get(0)))
    }

    fn recent_processed_from_sender(
        &self,
        from_address: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: &Uuid,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns}
                 FROM {table}
                 WHERE from_address = $1
                   AND status = 'processed'
                   AND received_at >= $2
                   AND received_at <= $3
                   AND id <> $4
                 ORDER BY received_at DESC
                 LIMIT 50",
                columns = SELECT_COLUMNS,
                table = self.table
            ),
            &[&from_address, &since, &until, exclude],
        )?;
        rows.iter().map(queued_from_row).collect()
    }

    fn find_ticket_for_message_ids(
        &self,
        message_ids: &[String],
    ) -> Result<Option<i64>, EmailQueueError> {
        let mut conn = self.connection()?;
        let statement = format!(
            "SELECT ticket_id FROM {table}
             WHERE message_id = $1
               AND status = 'processed'
               AND ticket_id IS NOT NULL
             ORDER BY received_at DESC
             LIMIT 1",
            table = self.table
        );
        for message_id in message_ids {
            if let Some(row) = conn.query_opt(&statement, &[message_id])? {
                return Ok(Some(row.get(0)));
            }
        }
        Ok(None)
    }

    fn get(&self, id: &Uuid) -> Result<Option<QueuedEmail>, EmailQueueError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE id = $1",
                columns = SELECT_COLUMNS,
                table = self.table
            ),
            &[id],
        )?;
        row.as_ref().map(queued_from_row).transpose()
    }

    fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueuedEmail>, EmailQueueError> {
        let mut conn = self.connection()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => conn.query(
                &format!(
                    "SELECT {columns} FROM {table} WHERE status = $1
                     ORDER BY received_at DESC LIMIT $2",
                    columns = SELECT_COLUMNS,
                    table = self.table
                ),
                &[&status.as_str(), &limit],
            )?,
            None => conn.query(
                &format!(
                    "SELECT {columns} FROM {table} ORDER BY received_at DESC LIMIT $1",
                    columns = SELECT_COLUMNS,
                    table = self.table
                ),
                &[&limit],
            )?,
        };
        rows.iter().map(queued_from_row).collect()
    }

    fn stats(&self) -> Result<QueueStats, EmailQueueError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT status, COUNT(*) FROM {table} GROUP BY status",
                table = self.table
            ),
            &[],
        )?;
        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            stats.add(status.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

impl Drop for PostgresEmailQueue {
    fn drop(&mut self) {
        // r2d2 joins its reaper on drop; keep that off async runtime threads.
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

fn queued_from_row(row: &Row) -> Result<QueuedEmail, EmailQueueError> {
    let status: String = row.get(15);
    let status: QueueStatus = status.parse()?;
    let to_addresses: String = row.get(6);
    let cc_addresses: String = row.get(7);
    let in_reply_to: String = row.get(11);
    let references: String = row.get(12);
    let retry_count: i32 = row.get(16);
    Ok(QueuedEmail {
        id: row.get(0),
        account_id: row.get(1),
        dedupe_key: row.get(2),
        email: InboundEmail {
            message_id: row.get(3),
            from_address: row.get(4),
            from_name: row.get(5),
            to_addresses: serde_json::from_str(&to_addresses)?,
            cc_addresses: serde_json::from_str(&cc_addresses)?,
            subject: row.get(8),
            text_body: row.get(9),
            html_body: row.get(10),
            in_reply_to: serde_json::from_str(&in_reply_to)?,
            references: serde_json::from_str(&references)?,
            received_at: row.get(13),
        },
        status,
        is_processed: status.is_processed(),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        error_message: row.get(17),
        created_at: row.get(14),
        processed_at: row.get(18),
        ticket_id: row.get(19),
        duplicate_of: row.get(20),
    })
}

fn resolve_table_name() -> Result<String, EmailQueueError> {
    let raw = env::var("EMAIL_QUEUE_TABLE")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "email_queue".to_string());
    sanitize_table_name(&raw)
}

fn sanitize_table_name(raw: &str) -> Result<String, EmailQueueError> {
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(EmailQueueError::InvalidTableName(raw.to_string()));
    }
    for part in &parts {
        if part.is_empty()
            || !part
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(EmailQueueError::InvalidTableName(raw.to_string()));
        }
    }
    Ok(raw.to_string())
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_allow_optional_schema_prefix() {
        assert_eq!(sanitize_table_name("email_queue").unwrap(), "email_queue");
        assert_eq!(
            sanitize_table_name("helpdesk.email_queue").unwrap(),
            "helpdesk.email_queue"
        );
        assert!(sanitize_table_name("a.b.c").is_err());
        assert!(sanitize_table_name("queue; DROP TABLE x").is_err());
        assert!(sanitize_table_name("").is_err());
    }

    fn test_queue() -> Option<PostgresEmailQueue> {
        dotenvy::dotenv().ok();
        let db_url = env::var("EMAIL_QUEUE_DB_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        let table = format!("email_queue_test_{}", Uuid::new_v4().simple());
        Some(PostgresEmailQueue::new(&db_url, &table, QueueSettings::default()).expect("queue"))
    }

    fn sample(dedupe_key: &str) -> NewQueuedEmail {
        NewQueuedEmail {
            account_id: "support".to_string(),
            dedupe_key: dedupe_key.to_string(),
            email: InboundEmail {
                message_id: format!("{}@customer.example", dedupe_key),
                from_address: Some("dana@customer.example".to_string()),
                from_name: None,
                to_addresses: vec!["support@helpdesk.example".to_string()],
                cc_addresses: Vec::new(),
                subject: Some("Printer offline".to_string()),
                text_body: Some("It stopped printing.".to_string()),
                html_body: None,
                in_reply_to: Vec::new(),
                references: Vec::new(),
                received_at: Utc::now(),
            },
        }
    }

    #[test]
    fn enqueue_claim_and_process_roundtrip() {
        let Some(queue) = test_queue() else {
            eprintln!("skipping postgres queue test: EMAIL_QUEUE_DB_URL not set");
            return;
        };
        let first = queue.enqueue(&sample("support:1:1")).expect("enqueue");
        let second = queue.enqueue(&sample("support:1:1")).expect("enqueue");
        assert!(first.inserted);
        assert!(!second.inserted);

        let claimed = queue.claim_next().expect("claim").expect("row");
        assert_eq!(claimed.dedupe_key, "support:1:1");
        queue.mark_processed(&claimed.id, Some(7)).expect("processed");
        assert_eq!(
            queue
                .find_ticket_for_message_ids(&[claimed.email.message_id.clone()])
                .expect("lookup"),
            Some(7)
        );
        assert_eq!(queue.stats().expect("stats").processed, 1);
        queue.drop_table_for_tests();
    }
}
