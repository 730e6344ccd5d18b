#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use helpdesk_module::accounts::EmailAccount;
use helpdesk_module::fetch::{FetchError, FetchedMessage, MailFetcher, QueuedCheck};
use helpdesk_module::service::ServiceConfig;
use service_api_module::ServiceEndpoints;

pub const UID_VALIDITY: u32 = 7;

pub struct RawEmail<'a> {
    pub message_id: &'a str,
    pub from: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub in_reply_to: Option<&'a str>,
}

impl RawEmail<'_> {
    pub fn render(&self) -> Vec<u8> {
        let mut raw = format!(
            "From: {}\r\nTo: support@helpdesk.example\r\nSubject: {}\r\nMessage-ID: {}\r\nDate: Mon, 1 Jul 2024 09:00:00 +0000\r\n",
            self.from, self.subject, self.message_id
        );
        if let Some(parent) = self.in_reply_to {
            raw.push_str(&format!("In-Reply-To: {}\r\nReferences: {}\r\n", parent, parent));
        }
        raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        raw.push_str(self.body);
        raw.push_str("\r\n");
        raw.into_bytes()
    }

    pub fn fetched(&self, uid: u32, internal_date: DateTime<Utc>) -> FetchedMessage {
        FetchedMessage {
            uid,
            uid_validity: UID_VALIDITY,
            raw: self.render(),
            internal_date: Some(internal_date),
        }
    }
}

/// An in-memory mailbox: delivered messages stay until flagged seen, and
/// the uids that got flagged are recorded.
#[derive(Default)]
pub struct ScriptedFetcher {
    mailbox: Mutex<Vec<FetchedMessage>>,
    pub seen: Mutex<Vec<u32>>,
}

impl ScriptedFetcher {
    pub fn deliver(&self, messages: Vec<FetchedMessage>) {
        self.mailbox.lock().unwrap().extend(messages);
    }
}

impl MailFetcher for ScriptedFetcher {
    fn fetch_new(
        &self,
        _account: &EmailAccount,
        limit: usize,
        already_queued: &QueuedCheck<'_>,
    ) -> Result<Vec<FetchedMessage>, FetchError> {
        let seen = self.seen.lock().unwrap().clone();
        let mailbox = self.mailbox.lock().unwrap();
        let mut batch = Vec::new();
        for message in mailbox.iter() {
            if batch.len() >= limit {
                break;
            }
            if seen.contains(&message.uid) || already_queued(message.uid_validity, message.uid)? {
                continue;
            }
            batch.push(message.clone());
        }
        Ok(batch)
    }

    fn mark_seen(&self, _account: &EmailAccount, uids: &[u32]) -> Result<(), FetchError> {
        self.seen.lock().unwrap().extend_from_slice(uids);
        Ok(())
    }
}

pub const SUPPORT_ACCOUNTS: &str = r#"
[[accounts]]
id = "support"
address = "support@helpdesk.example"
imap_host = "imap.helpdesk.example"
imap_password_encrypted = "unused"

[[accounts.routing_rules]]
name = "outage"
keywords = ["fire", "outage"]
priority = "urgent"
department = "operations"
tags = ["escalated"]
"#;

pub fn service_config(state_dir: &Path, endpoints: ServiceEndpoints) -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        state_dir: state_dir.to_path_buf(),
        queue_backend: "sqlite".to_string(),
        queue_db_path: state_dir.join("email_queue.db"),
        queue_settings: Default::default(),
        batch_size: 10,
        dedupe_window: chrono::Duration::minutes(10),
        dedupe_threshold: 0.9,
        dedupe_max_compare_chars: 2000,
        accounts_config_path: state_dir.join("accounts.toml"),
        clients_db_path: state_dir.join("clients.db"),
        run_lock_path: state_dir.join("process.lock"),
        run_lock_stale_after: Duration::from_secs(600),
        worker_enabled: false,
        worker_poll_interval: Duration::from_secs(60),
        app_debug: false,
        body_max_bytes: 1024 * 1024,
        credential_key: None,
        service_endpoints: endpoints,
    }
}
