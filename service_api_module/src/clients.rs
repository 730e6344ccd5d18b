use reqwest::blocking::Client;
use tracing::info;

use crate::config::ServiceEndpoints;
use crate::error::ServiceApiError;
use crate::http::{authorized, build_http_client, join_url, read_json};
use crate::types::{ClientSummary, NewClient};

const SERVICE: &str = "client-service";

#[derive(Debug, Clone)]
pub struct ClientServiceClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl ClientServiceClient {
    pub fn new(endpoints: &ServiceEndpoints) -> Result<Self, ServiceApiError> {
        Ok(Self {
            base_url: endpoints.client_service_url.clone(),
            token: endpoints.api_token.clone(),
            http: build_http_client(endpoints.timeout)?,
        })
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<ClientSummary>, ServiceApiError> {
        let url = join_url(&self.base_url, "api/clients");
        let response = authorized(self.http.get(url), self.token.as_deref())
            .query(&[("email", email)])
            .send()?;
        let clients: Vec<ClientSummary> = read_json(SERVICE, response)?;
        Ok(clients.into_iter().find(|client| {
            client
                .email
                .as_deref()
                .map(|value| value.eq_ignore_ascii_case(email))
                .unwrap_or(false)
        }))
    }

    pub fn create_client(&self, client: &NewClient) -> Result<ClientSummary, ServiceApiError> {
        let url = join_url(&self.base_url, "api/clients");
        let response = authorized(self.http.post(url), self.token.as_deref())
            .json(client)
            .send()?;
        let created: ClientSummary = read_json(SERVICE, response)?;
        info!("client service created client id={}", created.id);
        Ok(created)
    }

    pub fn find_or_create(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<ClientSummary, ServiceApiError> {
        if let Some(existing) = self.find_by_email(email)? {
            return Ok(existing);
        }
        self.create_client(&NewClient {
            email: email.to_string(),
            name: name.map(|value| value.to_string()),
            source: "email".to_string(),
        })
    }
}
