use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::info;

use crate::config::ServiceEndpoints;
use crate::error::ServiceApiError;
use crate::http::{authorized, build_http_client, join_url, read_json};
use crate::types::{NewComment, NewTicket, Ticket, TicketComment};

const SERVICE: &str = "ticket-service";

#[derive(Debug, Clone)]
pub struct TicketServiceClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl TicketServiceClient {
    pub fn new(endpoints: &ServiceEndpoints) -> Result<Self, ServiceApiError> {
        Ok(Self {
            base_url: endpoints.ticket_service_url.clone(),
            token: endpoints.api_token.clone(),
            http: build_http_client(endpoints.timeout)?,
        })
    }

    /// Returns `None` when the ticket service answers 404.
    pub fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, ServiceApiError> {
        let url = join_url(&self.base_url, &format!("api/tickets/{}", ticket_id));
        let response = authorized(self.http.get(url), self.token.as_deref()).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(SERVICE, response).map(Some)
    }

    pub fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket, ServiceApiError> {
        let url = join_url(&self.base_url, "api/tickets");
        let response = authorized(self.http.post(url), self.token.as_deref())
            .json(ticket)
            .send()?;
        let created: Ticket = read_json(SERVICE, response)?;
        info!(
            "ticket service created ticket id={} client_id={}",
            created.id, ticket.client_id
        );
        Ok(created)
    }

    pub fn add_comment(
        &self,
        ticket_id: i64,
        comment: &NewComment,
    ) -> Result<TicketComment, ServiceApiError> {
        let url = join_url(&self.base_url, &format!("api/tickets/{}/comments", ticket_id));
        let response = authorized(self.http.post(url), self.token.as_deref())
            .json(comment)
            .send()?;
        read_json(SERVICE, response)
    }
}
