use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use service_api_module::ServiceEndpoints;
use tracing::warn;

use crate::accounts::{resolve_accounts_path, AccountError, CredentialKey};
use crate::dedupe::{
    DuplicateDetector, DEFAULT_MAX_COMPARE_CHARS, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_WINDOW_SECS,
};
use crate::email_queue::{resolve_queue_backend, QueueSettings, DEFAULT_LEASE_SECS, DEFAULT_MAX_RETRIES};
use crate::processor::DEFAULT_BATCH_SIZE;
use crate::run_lock::{RunLock, DEFAULT_STALE_SECS};

use super::BoxError;

pub const DEFAULT_BODY_MAX_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub state_dir: PathBuf,
    /// `sqlite` or `postgres`.
    pub queue_backend: String,
    pub queue_db_path: PathBuf,
    pub queue_settings: QueueSettings,
    pub batch_size: usize,
    pub dedupe_window: chrono::Duration,
    pub dedupe_threshold: f64,
    /// Body prefix length compared by the similarity pass.
    pub dedupe_max_compare_chars: usize,
    pub accounts_config_path: PathBuf,
    pub clients_db_path: PathBuf,
    pub run_lock_path: PathBuf,
    pub run_lock_stale_after: Duration,
    pub worker_enabled: bool,
    pub worker_poll_interval: Duration,
    /// Include internal error details in 500 responses.
    pub app_debug: bool,
    pub body_max_bytes: usize,
    /// None when `HELPDESK_CREDENTIALS_KEY` is unset; mailbox fetching is
    /// then unavailable.
    pub credential_key: Option<CredentialKey>,
    pub service_endpoints: ServiceEndpoints,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("HELPDESK_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("HELPDESK_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9200);

        let state_dir = match env_var_non_empty("HELPDESK_STATE_DIR") {
            Some(raw) => resolve_path(raw)?,
            None => default_state_dir()?,
        };
        let queue_backend = resolve_queue_backend();
        let queue_db_path = resolve_path(env::var("EMAIL_QUEUE_DB_PATH").unwrap_or_else(|_| {
            state_dir
                .join("email_queue.db")
                .to_string_lossy()
                .into_owned()
        }))?;
        let max_retries = env::var("EMAIL_QUEUE_MAX_RETRIES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let lease_secs = env::var("EMAIL_QUEUE_LEASE_SECS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_LEASE_SECS);
        let batch_size = env::var("PROCESS_BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let dedupe_window = env::var("DEDUPE_WINDOW_SECS")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .map(chrono::Duration::seconds)
            .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_WINDOW_SECS));
        let dedupe_threshold = env::var("DEDUPE_SIMILARITY_THRESHOLD")
            .ok()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| *value > 0.0 && *value <= 1.0)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        let dedupe_max_compare_chars = env::var("DEDUPE_MAX_COMPARE_CHARS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_COMPARE_CHARS);

        let accounts_config_path = resolve_accounts_path();
        let clients_db_path = resolve_path(env::var("CLIENTS_DB_PATH").unwrap_or_else(|_| {
            state_dir.join("clients.db").to_string_lossy().into_owned()
        }))?;
        let run_lock_path = resolve_path(env::var("RUN_LOCK_PATH").unwrap_or_else(|_| {
            state_dir.join("process.lock").to_string_lossy().into_owned()
        }))?;
        let run_lock_stale_after = env::var("RUN_LOCK_STALE_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_STALE_SECS));
        let worker_enabled = env_flag("WORKER_ENABLED", true);
        let worker_poll_interval = env::var("WORKER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));
        let app_debug = env_flag("APP_DEBUG", false);
        let body_max_bytes = env::var("HELPDESK_BODY_MAX_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BODY_MAX_BYTES);

        let credential_key = match CredentialKey::from_env() {
            Ok(key) => Some(key),
            Err(AccountError::MissingKey) => {
                warn!("HELPDESK_CREDENTIALS_KEY not set; mailbox fetching disabled");
                None
            }
            Err(err) => return Err(err.into()),
        };
        let service_endpoints = ServiceEndpoints::from_env()?;

        Ok(Self {
            host,
            port,
            state_dir,
            queue_backend,
            queue_db_path,
            queue_settings: QueueSettings {
                max_retries,
                lease: chrono::Duration::seconds(lease_secs),
            },
            batch_size,
            dedupe_window,
            dedupe_threshold,
            dedupe_max_compare_chars,
            accounts_config_path,
            clients_db_path,
            run_lock_path,
            run_lock_stale_after,
            worker_enabled,
            worker_poll_interval,
            app_debug,
            body_max_bytes,
            credential_key,
            service_endpoints,
        })
    }

    pub fn detector(&self) -> DuplicateDetector {
        DuplicateDetector::new(self.dedupe_window, self.dedupe_threshold)
            .with_max_compare_chars(self.dedupe_max_compare_chars)
    }

    pub fn run_lock(&self) -> RunLock {
        RunLock::new(self.run_lock_path.clone(), self.run_lock_stale_after)
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_state_dir() -> Result<PathBuf, io::Error> {
    let home =
        env::var("HOME").map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home).join(".helpdesk").join("state"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: String,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                previous,
            }
        }

        fn unset(key: &str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                previous,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(&self.key, value),
                None => env::remove_var(&self.key),
            }
        }
    }

    const TUNABLES: [&str; 13] = [
        "HELPDESK_PORT",
        "EMAIL_QUEUE_BACKEND",
        "EMAIL_QUEUE_DB_PATH",
        "EMAIL_QUEUE_MAX_RETRIES",
        "EMAIL_QUEUE_LEASE_SECS",
        "PROCESS_BATCH_SIZE",
        "DEDUPE_WINDOW_SECS",
        "DEDUPE_SIMILARITY_THRESHOLD",
        "DEDUPE_MAX_COMPARE_CHARS",
        "CLIENTS_DB_PATH",
        "RUN_LOCK_PATH",
        "WORKER_ENABLED",
        "APP_DEBUG",
    ];

    fn base_env(state_dir: &str) -> Vec<EnvGuard> {
        let mut guards: Vec<EnvGuard> = TUNABLES.iter().map(|key| EnvGuard::unset(key)).collect();
        guards.push(EnvGuard::set("HELPDESK_STATE_DIR", state_dir));
        guards.push(EnvGuard::set("TICKET_SERVICE_URL", "http://tickets.test"));
        guards.push(EnvGuard::set("CLIENT_SERVICE_URL", "http://clients.test"));
        guards.push(EnvGuard::unset("HELPDESK_CREDENTIALS_KEY"));
        guards
    }

    #[test]
    fn from_env_applies_defaults_under_state_dir() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = base_env("/srv/helpdesk");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.port, 9200);
        assert_eq!(config.queue_backend, "sqlite");
        assert_eq!(config.queue_db_path, PathBuf::from("/srv/helpdesk/email_queue.db"));
        assert_eq!(config.clients_db_path, PathBuf::from("/srv/helpdesk/clients.db"));
        assert_eq!(config.run_lock_path, PathBuf::from("/srv/helpdesk/process.lock"));
        assert_eq!(config.queue_settings.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.dedupe_window, chrono::Duration::seconds(600));
        assert_eq!(config.dedupe_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.dedupe_max_compare_chars, DEFAULT_MAX_COMPARE_CHARS);
        assert!(config.worker_enabled);
        assert!(!config.app_debug);
        assert!(config.credential_key.is_none());
    }

    #[test]
    fn from_env_ignores_invalid_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = base_env("/srv/helpdesk");
        let _retries = EnvGuard::set("EMAIL_QUEUE_MAX_RETRIES", "0");
        let _batch = EnvGuard::set("PROCESS_BATCH_SIZE", "many");
        let _threshold = EnvGuard::set("DEDUPE_SIMILARITY_THRESHOLD", "1.5");
        let _window = EnvGuard::set("DEDUPE_WINDOW_SECS", "-30");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.queue_settings.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.dedupe_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.dedupe_window, chrono::Duration::seconds(DEFAULT_WINDOW_SECS));
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = base_env("/srv/helpdesk");
        let _retries = EnvGuard::set("EMAIL_QUEUE_MAX_RETRIES", "5");
        let _threshold = EnvGuard::set("DEDUPE_SIMILARITY_THRESHOLD", "0.8");
        let _compare = EnvGuard::set("DEDUPE_MAX_COMPARE_CHARS", "500");
        let _worker = EnvGuard::set("WORKER_ENABLED", "false");
        let _debug = EnvGuard::set("APP_DEBUG", "yes");
        let _clients = EnvGuard::set("CLIENTS_DB_PATH", "/data/clients.db");
        let _key = EnvGuard::set("HELPDESK_CREDENTIALS_KEY", "s3cret");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.queue_settings.max_retries, 5);
        assert_eq!(config.dedupe_threshold, 0.8);
        assert_eq!(config.dedupe_max_compare_chars, 500);
        assert!(!config.worker_enabled);
        assert!(config.app_debug);
        assert_eq!(config.clients_db_path, PathBuf::from("/data/clients.db"));
        assert!(config.credential_key.is_some());
    }

    #[test]
    fn from_env_requires_service_urls() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guards = base_env("/srv/helpdesk");
        let _tickets = EnvGuard::unset("TICKET_SERVICE_URL");

        assert!(ServiceConfig::from_env().is_err());
    }
}
