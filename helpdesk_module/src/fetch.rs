//! Pulls unseen mail from IMAP mailboxes into the email queue.

use std::io::{Read, Write};
use std::net::TcpStream;

use chrono::{DateTime, Utc};
use imap::Session;
use serde::Serialize;
use tracing::{info, warn};

use crate::accounts::{AccountError, AccountRegistry, CredentialKey, EmailAccount, ImapSecurity};
use crate::email_queue::{EmailQueue, EmailQueueError, NewQueuedEmail};
use crate::inbound::InboundEmail;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("imap error: {0}")]
    Imap(#[from] imap::Error),
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Queue(#[from] EmailQueueError),
    #[error("mailbox {0} did not report UIDVALIDITY")]
    MissingUidValidity(String),
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub uid_validity: u32,
    pub raw: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
}

/// Answers whether the message `(uid_validity, uid)` is already queued.
pub type QueuedCheck<'a> = dyn Fn(u32, u32) -> Result<bool, FetchError> + 'a;

pub trait MailFetcher: Send + Sync {
    /// Unseen messages in the account's folder that are not queued yet,
    /// oldest UID first, at most `limit`. Queued messages are skipped before
    /// the limit applies so unflagged mail cannot starve newer mail.
    fn fetch_new(
        &self,
        account: &EmailAccount,
        limit: usize,
        already_queued: &QueuedCheck<'_>,
    ) -> Result<Vec<FetchedMessage>, FetchError>;
    fn mark_seen(&self, account: &EmailAccount, uids: &[u32]) -> Result<(), FetchError>;
}

#[derive(Debug, Clone)]
pub struct ImapFetcher {
    key: CredentialKey,
}

impl ImapFetcher {
    pub fn new(key: CredentialKey) -> Self {
        Self { key }
    }

    fn with_session<R>(
        &self,
        account: &EmailAccount,
        action: impl FnOnce(&mut dyn MailboxSession) -> Result<R, FetchError>,
    ) -> Result<R, FetchError> {
        let password = self.key_password(account)?;
        let host = account.imap_host.as_str();
        match account.security {
            ImapSecurity::Tls => {
                let tls = native_tls::TlsConnector::builder().build()?;
                let client = imap::connect((host, account.imap_port), host, &tls)?;
                let mut session = client
                    .login(account.username(), &password)
                    .map_err(|(err, _client)| err)?;
                let result = action(&mut session);
                let _ = session.logout();
                result
            }
            ImapSecurity::Plain => {
                let stream = TcpStream::connect((host, account.imap_port))?;
                let mut client = imap::Client::new(stream);
                client.read_greeting()?;
                let mut session = client
                    .login(account.username(), &password)
                    .map_err(|(err, _client)| err)?;
                let result = action(&mut session);
                let _ = session.logout();
                result
            }
        }
    }

    fn key_password(&self, account: &EmailAccount) -> Result<String, FetchError> {
        Ok(account.password(&self.key)?)
    }
}

/// The handful of IMAP commands the fetcher needs, over either transport.
trait MailboxSession {
    fn select_uid_validity(&mut self, folder: &str) -> Result<Option<u32>, FetchError>;
    fn unseen_uids(&mut self) -> Result<Vec<u32>, FetchError>;
    fn fetch_raw(&mut self, uid_set: &str) -> Result<Vec<(u32, Vec<u8>, Option<DateTime<Utc>>)>, FetchError>;
    fn add_seen_flag(&mut self, uid_set: &str) -> Result<(), FetchError>;
}

impl<T: Read + Write> MailboxSession for Session<T> {
    fn select_uid_validity(&mut self, folder: &str) -> Result<Option<u32>, FetchError> {
        Ok(self.select(folder)?.uid_validity)
    }

    fn unseen_uids(&mut self) -> Result<Vec<u32>, FetchError> {
        let mut uids: Vec<u32> = self.uid_search("UNSEEN")?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_raw(&mut self, uid_set: &str) -> Result<Vec<(u32, Vec<u8>, Option<DateTime<Utc>>)>, FetchError> {
        let messages = self.uid_fetch(uid_set, "(UID INTERNALDATE BODY.PEEK[])")?;
        let mut fetched = Vec::new();
        for message in messages.iter() {
            let (Some(uid), Some(body)) = (message.uid, message.body()) else {
                continue;
            };
            let internal_date = message
                .internal_date()
                .map(|date| date.with_timezone(&Utc));
            fetched.push((uid, body.to_vec(), internal_date));
        }
        Ok(fetched)
    }

    fn add_seen_flag(&mut self, uid_set: &str) -> Result<(), FetchError> {
        self.uid_store(uid_set, "+FLAGS (\\Seen)")?;
        Ok(())
    }
}

impl MailFetcher for ImapFetcher {
    fn fetch_new(
        &self,
        account: &EmailAccount,
        limit: usize,
        already_queued: &QueuedCheck<'_>,
    ) -> Result<Vec<FetchedMessage>, FetchError> {
        self.with_session(account, |session| {
            let uid_validity = session
                .select_uid_validity(&account.folder)?
                .ok_or_else(|| FetchError::MissingUidValidity(account.folder.clone()))?;
            let uids = session.unseen_uids()?;
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            let limit = limit.max(1);
            let mut batch = Vec::new();
            for uid in uids {
                if batch.len() >= limit {
                    break;
                }
                if !already_queued(uid_validity, uid)? {
                    batch.push(uid);
                }
            }
            if batch.is_empty() {
                return Ok(Vec::new());
            }
            let mut messages: Vec<FetchedMessage> = session
                .fetch_raw(&uid_set(&batch))?
                .into_iter()
                .map(|(uid, raw, internal_date)| FetchedMessage {
                    uid,
                    uid_validity,
                    raw,
                    internal_date,
                })
                .collect();
            messages.sort_by_key(|message| message.uid);
            Ok(messages)
        })
    }

    fn mark_seen(&self, account: &EmailAccount, uids: &[u32]) -> Result<(), FetchError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.with_session(account, |session| {
            session.select_uid_validity(&account.folder)?;
            session.add_seen_flag(&uid_set(uids))
        })
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub account_id: String,
    pub fetched: usize,
    pub enqueued: usize,
    pub already_queued: usize,
    pub unparseable: usize,
    pub marked_seen: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountFetchFailure {
    pub account_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchSummary {
    pub reports: Vec<FetchReport>,
    pub failures: Vec<AccountFetchFailure>,
}

/// Fetches one mailbox into the queue. Messages that fail to parse are
/// logged and still flagged seen so they are not fetched forever.
pub fn fetch_account(
    fetcher: &dyn MailFetcher,
    account: &EmailAccount,
    queue: &dyn EmailQueue,
) -> Result<FetchReport, FetchError> {
    let already_queued = |uid_validity: u32, uid: u32| -> Result<bool, FetchError> {
        let key = NewQueuedEmail::dedupe_key_for(&account.id, uid_validity, uid);
        Ok(queue.contains_dedupe_key(&key)?)
    };
    let messages = fetcher.fetch_new(account, account.fetch_limit, &already_queued)?;
    let mut report = FetchReport {
        account_id: account.id.clone(),
        fetched: messages.len(),
        ..FetchReport::default()
    };

    let mut handled = Vec::with_capacity(messages.len());
    let mut queue_error = None;
    for message in messages {
        let email = match InboundEmail::parse(&message.raw, message.internal_date) {
            Ok(email) => email,
            Err(err) => {
                warn!(
                    "skipping unparseable message account={} uid={}: {}",
                    account.id, message.uid, err
                );
                report.unparseable += 1;
                handled.push(message.uid);
                continue;
            }
        };
        let new = NewQueuedEmail {
            account_id: account.id.clone(),
            dedupe_key: NewQueuedEmail::dedupe_key_for(
                &account.id,
                message.uid_validity,
                message.uid,
            ),
            email,
        };
        match queue.enqueue(&new) {
            Ok(result) => {
                if result.inserted {
                    report.enqueued += 1;
                } else {
                    report.already_queued += 1;
                }
                handled.push(message.uid);
            }
            Err(err) => {
                queue_error = Some(err);
                break;
            }
        }
    }

    if account.mark_seen && !handled.is_empty() {
        fetcher.mark_seen(account, &handled)?;
        report.marked_seen = handled.len();
    }
    if let Some(err) = queue_error {
        return Err(err.into());
    }

    info!(
        "fetched account={} fetched={} enqueued={} already_queued={} unparseable={}",
        report.account_id, report.fetched, report.enqueued, report.already_queued, report.unparseable
    );
    Ok(report)
}

/// Fetches every enabled account; one failing mailbox does not stop the rest.
pub fn fetch_all(
    fetcher: &dyn MailFetcher,
    registry: &AccountRegistry,
    queue: &dyn EmailQueue,
) -> FetchSummary {
    let mut summary = FetchSummary::default();
    for account in registry.enabled() {
        match fetch_account(fetcher, account, queue) {
            Ok(report) => summary.reports.push(report),
            Err(err) => {
                warn!("fetch failed account={}: {}", account.id, err);
                summary.failures.push(AccountFetchFailure {
                    account_id: account.id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    summary
}
