use std::env;
use std::time::Duration;

use crate::error::ServiceApiError;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub ticket_service_url: String,
    pub client_service_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl ServiceEndpoints {
    pub fn from_env() -> Result<Self, ServiceApiError> {
        dotenvy::dotenv().ok();

        let ticket_service_url = env_var_non_empty("TICKET_SERVICE_URL")
            .ok_or_else(|| ServiceApiError::Config("missing TICKET_SERVICE_URL".to_string()))?;
        let client_service_url = env_var_non_empty("CLIENT_SERVICE_URL")
            .ok_or_else(|| ServiceApiError::Config("missing CLIENT_SERVICE_URL".to_string()))?;
        let api_token = env_var_non_empty("SERVICE_API_TOKEN");
        let timeout = env::var("SERVICE_API_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Ok(Self {
            ticket_service_url,
            client_service_url,
            api_token,
            timeout,
        })
    }

    pub fn new(ticket_service_url: &str, client_service_url: &str) -> Self {
        Self {
            ticket_service_url: ticket_service_url.to_string(),
            client_service_url: client_service_url.to_string(),
            api_token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.api_token = Some(token.to_string());
        self
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
