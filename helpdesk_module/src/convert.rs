//! Turns a unique queued email into a ticket or a comment on an existing one.

use serde::Serialize;
use serde_json::json;
use service_api_module::{
    ClientServiceClient, ClientSummary, NewComment, NewTicket, ServiceApiError, ServiceEndpoints,
    Ticket, TicketComment, TicketServiceClient, TicketStatus,
};
use tracing::{debug, info};

use crate::accounts::EmailAccount;
use crate::dedupe::{strip_html, ticket_reference};
use crate::email_queue::{EmailQueue, EmailQueueError, QueuedEmail};
use crate::mail::normalize_email;
use crate::routing::{route, RoutingDefaults, RoutingRule};

pub const NO_SUBJECT: &str = "(no subject)";
const EMAIL_SOURCE: &str = "email";

/// The sibling services a conversion talks to.
pub trait TicketBackend: Send + Sync {
    fn find_or_create_client(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<ClientSummary, ServiceApiError>;
    fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, ServiceApiError>;
    fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket, ServiceApiError>;
    fn add_comment(
        &self,
        ticket_id: i64,
        comment: &NewComment,
    ) -> Result<TicketComment, ServiceApiError>;
}

pub struct ServiceBackend {
    tickets: TicketServiceClient,
    clients: ClientServiceClient,
}

impl ServiceBackend {
    pub fn new(endpoints: &ServiceEndpoints) -> Result<Self, ServiceApiError> {
        Ok(Self {
            tickets: TicketServiceClient::new(endpoints)?,
            clients: ClientServiceClient::new(endpoints)?,
        })
    }
}

impl TicketBackend for ServiceBackend {
    fn find_or_create_client(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<ClientSummary, ServiceApiError> {
        self.clients.find_or_create(email, name)
    }

    fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, ServiceApiError> {
        self.tickets.get_ticket(ticket_id)
    }

    fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket, ServiceApiError> {
        self.tickets.create_ticket(ticket)
    }

    fn add_comment(
        &self,
        ticket_id: i64,
        comment: &NewComment,
    ) -> Result<TicketComment, ServiceApiError> {
        self.tickets.add_comment(ticket_id, comment)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("sender address is missing or invalid")]
    InvalidSender,
    #[error(transparent)]
    Service(#[from] ServiceApiError),
    #[error(transparent)]
    Queue(#[from] EmailQueueError),
}

impl ConvertError {
    /// Permanent errors are not retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            ConvertError::InvalidSender => true,
            ConvertError::Service(err) => err.is_permanent(),
            ConvertError::Queue(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Commented {
        ticket_id: i64,
        comment_id: i64,
    },
    Created {
        ticket_id: i64,
        comment_id: i64,
        rule: Option<String>,
    },
    /// Auto-create is off and no open thread matched.
    Skipped { client_id: i64 },
}

impl ConversionOutcome {
    pub fn ticket_id(&self) -> Option<i64> {
        match self {
            ConversionOutcome::Commented { ticket_id, .. }
            | ConversionOutcome::Created { ticket_id, .. } => Some(*ticket_id),
            ConversionOutcome::Skipped { .. } => None,
        }
    }
}

/// Per-mailbox knobs the converter needs.
#[derive(Debug, Clone)]
pub struct ConversionPolicy {
    pub auto_create_tickets: bool,
    pub rules: Vec<RoutingRule>,
    pub defaults: RoutingDefaults,
}

impl Default for ConversionPolicy {
    fn default() -> Self {
        Self {
            auto_create_tickets: true,
            rules: Vec::new(),
            defaults: RoutingDefaults::default(),
        }
    }
}

impl ConversionPolicy {
    pub fn for_account(account: &EmailAccount) -> Self {
        Self {
            auto_create_tickets: account.auto_create_tickets,
            rules: account.routing_rules.clone(),
            defaults: account.routing_defaults(),
        }
    }
}

pub fn convert_email(
    backend: &dyn TicketBackend,
    queue: &dyn EmailQueue,
    policy: &ConversionPolicy,
    row: &QueuedEmail,
) -> Result<ConversionOutcome, ConvertError> {
    let email = &row.email;
    let sender = email
        .from_address
        .as_deref()
        .and_then(normalize_email)
        .ok_or(ConvertError::InvalidSender)?;
    let client = backend.find_or_create_client(&sender, email.from_name.as_deref())?;
    let body = comment_body(row);
    let comment = NewComment {
        content: body.clone(),
        author_email: Some(sender.clone()),
        author_name: email.from_name.clone(),
        is_internal: false,
        source: EMAIL_SOURCE.to_string(),
    };

    // A previous attempt already created the ticket; finish its first comment.
    if let Some(ticket_id) = row.ticket_id {
        let created = backend.add_comment(ticket_id, &comment)?;
        info!(
            "resumed email {} on its ticket {} with comment {}",
            row.id, ticket_id, created.id
        );
        return Ok(ConversionOutcome::Created {
            ticket_id,
            comment_id: created.id,
            rule: None,
        });
    }

    if let Some(ticket) = find_thread(backend, queue, row, client.id)? {
        let created = backend.add_comment(ticket.id, &comment)?;
        info!(
            "appended email {} to ticket {} as comment {}",
            row.id, ticket.id, created.id
        );
        return Ok(ConversionOutcome::Commented {
            ticket_id: ticket.id,
            comment_id: created.id,
        });
    }

    if !policy.auto_create_tickets {
        debug!("auto-create disabled; email {} left without ticket", row.id);
        return Ok(ConversionOutcome::Skipped {
            client_id: client.id,
        });
    }

    let routing = route(&policy.rules, &policy.defaults, email);
    let ticket = backend.create_ticket(&NewTicket {
        subject: email
            .subject
            .clone()
            .unwrap_or_else(|| NO_SUBJECT.to_string()),
        description: body,
        status: TicketStatus::New,
        priority: routing.priority,
        client_id: client.id,
        category_id: routing.category_id,
        assigned_agent_id: routing.assigned_agent_id,
        department: routing.department.clone(),
        tags: routing.tags.clone(),
        source: EMAIL_SOURCE.to_string(),
        custom_fields: json!({
            "message_id": email.message_id,
            "account_id": row.account_id,
            "queue_id": row.id.to_string(),
        }),
    })?;
    queue.record_ticket(&row.id, ticket.id)?;
    let created = backend.add_comment(ticket.id, &comment)?;
    info!(
        "created ticket {} from email {} (rule={})",
        ticket.id,
        row.id,
        routing.rule.as_deref().unwrap_or("-")
    );
    Ok(ConversionOutcome::Created {
        ticket_id: ticket.id,
        comment_id: created.id,
        rule: routing.rule,
    })
}

/// Reply headers win over subject tokens. A subject token is only trusted
/// for an open ticket that belongs to the sender.
fn find_thread(
    backend: &dyn TicketBackend,
    queue: &dyn EmailQueue,
    row: &QueuedEmail,
    client_id: i64,
) -> Result<Option<Ticket>, ConvertError> {
    let candidates = row.email.thread_candidates();
    if !candidates.is_empty() {
        if let Some(ticket_id) = queue.find_ticket_for_message_ids(&candidates)? {
            match backend.get_ticket(ticket_id)? {
                Some(ticket) if ticket.status.is_open() => return Ok(Some(ticket)),
                Some(ticket) => debug!(
                    "thread ticket {} is {}; not reopening",
                    ticket.id, ticket.status
                ),
                None => debug!("thread ticket {} no longer exists", ticket_id),
            }
        }
    }

    let Some(ticket_id) = row.email.subject.as_deref().and_then(ticket_reference) else {
        return Ok(None);
    };
    match backend.get_ticket(ticket_id)? {
        Some(ticket) if ticket.status.is_open() && ticket.client_id == Some(client_id) => {
            Ok(Some(ticket))
        }
        _ => Ok(None),
    }
}

fn comment_body(row: &QueuedEmail) -> String {
    let email = &row.email;
    let body = match (&email.text_body, &email.html_body) {
        (Some(text), _) => text.trim().to_string(),
        (None, Some(html)) => strip_html(html).trim().to_string(),
        (None, None) => String::new(),
    };
    if body.is_empty() {
        "(empty message)".to_string()
    } else {
        body
    }
}
