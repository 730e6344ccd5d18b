use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inbound::InboundEmail;

use super::EmailQueueError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 600;
pub(super) const LEASE_EXPIRED_MESSAGE: &str = "processing lease expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Duplicate,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Duplicate => "duplicate",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_processed(self) -> bool {
        matches!(self, QueueStatus::Processed | QueueStatus::Duplicate)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = EmailQueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "processed" => Ok(QueueStatus::Processed),
            "duplicate" => Ok(QueueStatus::Duplicate),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(EmailQueueError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Attempts allowed before a row is parked as `failed`.
    pub max_retries: u32,
    /// How long a `processing` claim is honoured before another run may take
    /// the row over.
    pub lease: chrono::Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewQueuedEmail {
    pub account_id: String,
    /// Unique per mailbox message, e.g. `account:uidvalidity:uid`.
    pub dedupe_key: String,
    pub email: InboundEmail,
}

impl NewQueuedEmail {
    pub fn dedupe_key_for(account_id: &str, uid_validity: u32, uid: u32) -> String {
        format!("{}:{}:{}", account_id, uid_validity, uid)
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub inserted: bool,
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEmail {
    pub id: Uuid,
    pub account_id: String,
    pub dedupe_key: String,
    #[serde(flatten)]
    pub email: InboundEmail,
    pub status: QueueStatus,
    pub is_processed: bool,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub ticket_id: Option<i64>,
    pub duplicate_of: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub duplicate: u64,
    pub failed: u64,
}

impl QueueStats {
    pub(super) fn add(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Processed => self.processed += count,
            QueueStatus::Duplicate => self.duplicate += count,
            QueueStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.processed + self.duplicate + self.failed
    }
}

/// Retry bookkeeping shared by both backends: the count saturates at the cap
/// and the row only goes back to `pending` while it is below the cap.
pub(super) fn next_failure_state(retry_count: u32, max_retries: u32) -> (u32, QueueStatus) {
    let next = retry_count.saturating_add(1).min(max_retries);
    if next >= max_retries {
        (next, QueueStatus::Failed)
    } else {
        (next, QueueStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_state_never_exceeds_cap() {
        assert_eq!(next_failure_state(0, 3), (1, QueueStatus::Pending));
        assert_eq!(next_failure_state(1, 3), (2, QueueStatus::Pending));
        assert_eq!(next_failure_state(2, 3), (3, QueueStatus::Failed));
        assert_eq!(next_failure_state(3, 3), (3, QueueStatus::Failed));
        assert_eq!(next_failure_state(9, 3), (3, QueueStatus::Failed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Processed,
            QueueStatus::Duplicate,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("done".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn duplicates_count_as_processed() {
        assert!(QueueStatus::Duplicate.is_processed());
        assert!(!QueueStatus::Failed.is_processed());
    }
}
