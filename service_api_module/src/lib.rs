//! Blocking HTTP clients for the sibling helpdesk services.
//!
//! The ticket service owns tickets and their comments, the client service owns
//! customer contact records. Both speak plain JSON over HTTP and authenticate
//! service-to-service calls with a shared bearer token.

mod clients;
mod config;
mod error;
mod http;
mod tickets;
mod types;

pub use clients::ClientServiceClient;
pub use config::ServiceEndpoints;
pub use error::ServiceApiError;
pub use tickets::TicketServiceClient;
pub use types::{
    ClientSummary, NewClient, NewComment, NewTicket, Ticket, TicketComment, TicketPriority,
    TicketStatus,
};
