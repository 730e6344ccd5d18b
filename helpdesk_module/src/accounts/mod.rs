//! Shared mailbox registry loaded from `accounts.toml`.

mod credentials;

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use service_api_module::TicketPriority;
use tracing::warn;

use crate::routing::{RoutingDefaults, RoutingRule};

pub use self::credentials::{decrypt_secret, encrypt_secret, CredentialKey};

pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_FOLDER: &str = "INBOX";
pub const DEFAULT_FETCH_LIMIT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse accounts config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid account config: {0}")]
    Invalid(String),
    #[error("HELPDESK_CREDENTIALS_KEY is not set")]
    MissingKey,
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("credential error: {0}")]
    Crypto(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapSecurity {
    #[default]
    Tls,
    Plain,
}

fn default_imap_port() -> u16 {
    DEFAULT_IMAP_PORT
}

fn default_folder() -> String {
    DEFAULT_FOLDER.to_string()
}

fn default_fetch_limit() -> usize {
    DEFAULT_FETCH_LIMIT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    /// Defaults to `address` when omitted.
    #[serde(default)]
    pub imap_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub imap_password_encrypted: String,
    #[serde(default)]
    pub security: ImapSecurity,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_create_tickets: bool,
    #[serde(default = "default_true")]
    pub mark_seen: bool,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default)]
    pub default_priority: Option<TicketPriority>,
    #[serde(default)]
    pub default_category_id: Option<i64>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
}

impl EmailAccount {
    pub fn username(&self) -> &str {
        self.imap_username
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.address)
    }

    pub fn routing_defaults(&self) -> RoutingDefaults {
        RoutingDefaults {
            priority: self.default_priority,
            category_id: self.default_category_id,
        }
    }

    pub fn password(&self, key: &CredentialKey) -> Result<String, AccountError> {
        if self.imap_password_encrypted.trim().is_empty() {
            return Err(AccountError::Invalid(format!(
                "account {} has no imap_password_encrypted",
                self.id
            )));
        }
        decrypt_secret(key, &self.imap_password_encrypted)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<EmailAccount>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: Vec<EmailAccount>,
}

impl AccountRegistry {
    pub fn new(accounts: Vec<EmailAccount>) -> Result<Self, AccountError> {
        let mut seen = HashSet::new();
        for account in &accounts {
            if account.id.trim().is_empty() {
                return Err(AccountError::Invalid("account id is empty".to_string()));
            }
            if !seen.insert(account.id.clone()) {
                return Err(AccountError::Invalid(format!(
                    "duplicate account id {}",
                    account.id
                )));
            }
            if account.imap_host.trim().is_empty() {
                return Err(AccountError::Invalid(format!(
                    "account {} has no imap_host",
                    account.id
                )));
            }
        }
        Ok(Self { accounts })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, AccountError> {
        let file: AccountsFile = toml::from_str(content)?;
        Self::new(file.accounts)
    }

    pub fn load(path: &Path) -> Result<Self, AccountError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// A missing file means no mailboxes are configured yet.
    pub fn load_or_empty(path: &Path) -> Result<Self, AccountError> {
        if !path.exists() {
            warn!("accounts config {} not found; no mailboxes will be fetched", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn accounts(&self) -> &[EmailAccount] {
        &self.accounts
    }

    pub fn enabled(&self) -> impl Iterator<Item = &EmailAccount> {
        self.accounts.iter().filter(|account| account.enabled)
    }

    pub fn get(&self, id: &str) -> Option<&EmailAccount> {
        self.accounts.iter().find(|account| account.id == id)
    }
}

pub fn resolve_accounts_path() -> PathBuf {
    if let Ok(path) = env::var("ACCOUNTS_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join("accounts.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[accounts]]
id = "support"
address = "support@helpdesk.example"
imap_host = "imap.helpdesk.example"
imap_password_encrypted = "c2VjcmV0"
default_priority = "high"

[[accounts.routing_rules]]
name = "outage"
keywords = ["outage"]
priority = "urgent"

[[accounts]]
id = "billing"
address = "billing@helpdesk.example"
imap_host = "localhost"
imap_port = 1143
imap_username = "billing-bot"
security = "plain"
folder = "Billing"
enabled = false
auto_create_tickets = false
mark_seen = false
fetch_limit = 10
"#;

    #[test]
    fn parses_accounts_with_defaults() {
        let registry = AccountRegistry::from_toml_str(SAMPLE).unwrap();
        let support = registry.get("support").unwrap();
        assert_eq!(support.imap_port, 993);
        assert_eq!(support.security, ImapSecurity::Tls);
        assert_eq!(support.folder, "INBOX");
        assert_eq!(support.username(), "support@helpdesk.example");
        assert!(support.auto_create_tickets);
        assert!(support.mark_seen);
        assert_eq!(support.fetch_limit, 50);
        assert_eq!(support.routing_defaults().priority, Some(TicketPriority::High));
        assert_eq!(support.routing_rules.len(), 1);
        assert_eq!(support.routing_rules[0].priority, Some(TicketPriority::Urgent));

        let billing = registry.get("billing").unwrap();
        assert_eq!(billing.username(), "billing-bot");
        assert_eq!(billing.security, ImapSecurity::Plain);
        assert!(!billing.auto_create_tickets);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let content = r#"
[[accounts]]
id = "a"
address = "a@x.example"
imap_host = "imap.x.example"

[[accounts]]
id = "a"
address = "b@x.example"
imap_host = "imap.x.example"
"#;
        assert!(matches!(
            AccountRegistry::from_toml_str(content),
            Err(AccountError::Invalid(_))
        ));
    }

    #[test]
    fn password_decrypts_with_key() {
        let key = CredentialKey::from_secret("registry-test").unwrap();
        let mut registry = AccountRegistry::from_toml_str(SAMPLE).unwrap();
        registry.accounts[0].imap_password_encrypted = encrypt_secret(&key, "hunter2");
        assert_eq!(registry.accounts()[0].password(&key).unwrap(), "hunter2");
        assert!(registry.get("billing").unwrap().password(&key).is_err());
    }

    #[test]
    fn missing_file_loads_empty_registry() {
        let temp = tempfile::TempDir::new().unwrap();
        let registry = AccountRegistry::load_or_empty(&temp.path().join("accounts.toml")).unwrap();
        assert!(registry.accounts().is_empty());
    }
}
