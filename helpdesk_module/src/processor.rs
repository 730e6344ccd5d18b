//! One processing run: claim queued emails, drop duplicates, convert the rest.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::accounts::AccountRegistry;
use crate::convert::{convert_email, ConversionOutcome, ConversionPolicy, TicketBackend};
use crate::dedupe::DuplicateDetector;
use crate::email_queue::{EmailQueue, EmailQueueError, QueueStatus, QueuedEmail};
use crate::run_lock::{RunLock, RunLockError};

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Lock(#[from] RunLockError),
    #[error(transparent)]
    Queue(#[from] EmailQueueError),
}

impl ProcessError {
    pub fn is_locked(&self) -> bool {
        matches!(self, ProcessError::Lock(RunLockError::Locked { .. }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rejected: usize,
}

pub struct Processor {
    queue: Arc<dyn EmailQueue>,
    backend: Arc<dyn TicketBackend>,
    accounts: Arc<AccountRegistry>,
    detector: DuplicateDetector,
    run_lock: RunLock,
    batch_size: usize,
}

impl Processor {
    pub fn new(
        queue: Arc<dyn EmailQueue>,
        backend: Arc<dyn TicketBackend>,
        accounts: Arc<AccountRegistry>,
        detector: DuplicateDetector,
        run_lock: RunLock,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            backend,
            accounts,
            detector,
            run_lock,
            batch_size: batch_size.max(1),
        }
    }

    /// Processes up to `batch_size` rows under the run lock. A transient
    /// downstream failure ends the batch early so the remaining rows keep
    /// their retry budget for the next run.
    pub fn run_batch(&self) -> Result<BatchReport, ProcessError> {
        let _guard = self.run_lock.acquire()?;
        let mut report = BatchReport::default();

        while report.claimed < self.batch_size {
            let Some(row) = self.queue.claim_next()? else {
                break;
            };
            report.claimed += 1;
            let keep_going = self.process_row(&row, &mut report).map_err(|err| {
                error!("queue update failed for email {}: {}", row.id, err);
                err
            })?;
            if !keep_going {
                warn!("stopping batch after transient failure on email {}", row.id);
                break;
            }
        }

        info!(
            "processing batch done claimed={} processed={} duplicates={} skipped={} failed={} rejected={}",
            report.claimed,
            report.processed,
            report.duplicates,
            report.skipped,
            report.failed,
            report.rejected
        );
        Ok(report)
    }

    /// Returns false when the batch should stop. A queue write that fails
    /// is returned as an error: the row stays leased and the run aborts.
    fn process_row(
        &self,
        row: &QueuedEmail,
        report: &mut BatchReport,
    ) -> Result<bool, EmailQueueError> {
        let verdict = match self.detector.check(self.queue.as_ref(), row) {
            Ok(verdict) => verdict,
            Err(err) => {
                error!("duplicate check failed for email {}: {}", row.id, err);
                self.record_failure(row, &err.to_string(), report)?;
                return Ok(false);
            }
        };
        if let Some(original) = verdict.original() {
            info!(
                "email {} is a duplicate of {}: {}",
                row.id,
                original,
                verdict.reason()
            );
            self.queue
                .mark_duplicate(&row.id, &original, &verdict.reason())?;
            report.duplicates += 1;
            return Ok(true);
        }

        let policy = match self.accounts.get(&row.account_id) {
            Some(account) => ConversionPolicy::for_account(account),
            None => {
                warn!(
                    "account {} not configured; converting email {} with defaults",
                    row.account_id, row.id
                );
                ConversionPolicy::default()
            }
        };

        match convert_email(self.backend.as_ref(), self.queue.as_ref(), &policy, row) {
            Ok(outcome) => {
                self.queue.mark_processed(&row.id, outcome.ticket_id())?;
                match outcome {
                    ConversionOutcome::Skipped { .. } => report.skipped += 1,
                    _ => report.processed += 1,
                }
                Ok(true)
            }
            Err(err) if err.is_permanent() => {
                warn!("rejecting email {}: {}", row.id, err);
                self.queue.mark_rejected(&row.id, &err.to_string())?;
                report.rejected += 1;
                Ok(true)
            }
            Err(err) => {
                warn!("email {} failed: {}", row.id, err);
                self.record_failure(row, &err.to_string(), report)?;
                Ok(false)
            }
        }
    }

    fn record_failure(
        &self,
        row: &QueuedEmail,
        message: &str,
        report: &mut BatchReport,
    ) -> Result<(), EmailQueueError> {
        if self.queue.mark_failed(&row.id, message)? == QueueStatus::Failed {
            warn!("email {} exhausted its retries", row.id);
        }
        report.failed += 1;
        Ok(())
    }
}
