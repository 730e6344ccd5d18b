use std::sync::Arc;

use tracing::info;

use crate::accounts::AccountRegistry;
use crate::convert::{ServiceBackend, TicketBackend};
use crate::email_queue::{build_queue, EmailQueue, EmailQueueError, QueueStats};
use crate::fetch::{fetch_all, FetchSummary, ImapFetcher, MailFetcher};
use crate::processor::{BatchReport, ProcessError, Processor};

use super::config::ServiceConfig;
use super::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("mail fetching is disabled: HELPDESK_CREDENTIALS_KEY is not set")]
    FetchDisabled,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Queue(#[from] EmailQueueError),
}

impl PipelineError {
    pub fn is_locked(&self) -> bool {
        matches!(self, PipelineError::Process(err) if err.is_locked())
    }
}

/// The fetch and process halves of ingestion, shared by the admin service,
/// its background worker and the one-shot CLI.
pub struct Pipeline {
    queue: Arc<dyn EmailQueue>,
    processor: Processor,
    accounts: Arc<AccountRegistry>,
    fetcher: Option<Arc<dyn MailFetcher>>,
}

impl Pipeline {
    pub fn new(
        queue: Arc<dyn EmailQueue>,
        processor: Processor,
        accounts: Arc<AccountRegistry>,
        fetcher: Option<Arc<dyn MailFetcher>>,
    ) -> Self {
        Self {
            queue,
            processor,
            accounts,
            fetcher,
        }
    }

    /// Opens the queue and builds the HTTP backend, so call it from a
    /// blocking context.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, BoxError> {
        let queue = build_queue(
            &config.queue_backend,
            config.queue_db_path.clone(),
            config.queue_settings,
        )?;
        let accounts = Arc::new(AccountRegistry::load_or_empty(&config.accounts_config_path)?);
        let backend: Arc<dyn TicketBackend> =
            Arc::new(ServiceBackend::new(&config.service_endpoints)?);
        let processor = Processor::new(
            queue.clone(),
            backend,
            accounts.clone(),
            config.detector(),
            config.run_lock(),
            config.batch_size,
        );
        let fetcher = config
            .credential_key
            .clone()
            .map(|key| Arc::new(ImapFetcher::new(key)) as Arc<dyn MailFetcher>);

        info!(
            "pipeline ready backend={} accounts={} fetch_enabled={}",
            config.queue_backend,
            accounts.accounts().len(),
            fetcher.is_some()
        );
        Ok(Self::new(queue, processor, accounts, fetcher))
    }

    pub fn queue(&self) -> &Arc<dyn EmailQueue> {
        &self.queue
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn fetch_enabled(&self) -> bool {
        self.fetcher.is_some()
    }

    pub fn fetch_once(&self) -> Result<FetchSummary, PipelineError> {
        let fetcher = self.fetcher.as_ref().ok_or(PipelineError::FetchDisabled)?;
        Ok(fetch_all(
            fetcher.as_ref(),
            &self.accounts,
            self.queue.as_ref(),
        ))
    }

    pub fn process_once(&self) -> Result<BatchReport, PipelineError> {
        Ok(self.processor.run_batch()?)
    }

    pub fn stats(&self) -> Result<QueueStats, PipelineError> {
        Ok(self.queue.stats()?)
    }
}
