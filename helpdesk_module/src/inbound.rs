use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser};
use serde::{Deserialize, Serialize};

use crate::mail::{extract_message_ids, normalize_email, normalize_message_id, synthesize_message_id};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,
    #[error("message could not be parsed as RFC 5322")]
    Malformed,
}

/// A fetched email reduced to the fields the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub message_id: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundEmail {
    /// `internal_date` is the server-side arrival time (IMAP INTERNALDATE);
    /// the Date header is only a fallback since senders control it.
    pub fn parse(raw: &[u8], internal_date: Option<DateTime<Utc>>) -> Result<Self, ParseError> {
        if raw.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }
        let message = MessageParser::default()
            .parse(raw)
            .ok_or(ParseError::Malformed)?;

        let sender = message.from().and_then(|address| address.first());
        let from_address = sender
            .and_then(|addr| addr.address())
            .and_then(normalize_email);
        let from_name = sender
            .and_then(|addr| addr.name())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let message_id = message
            .message_id()
            .and_then(normalize_message_id)
            .unwrap_or_else(|| synthesize_message_id(raw));

        let header_date = message
            .date()
            .and_then(|date| DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0));
        let received_at = internal_date.or(header_date).unwrap_or_else(Utc::now);

        Ok(Self {
            message_id,
            from_address,
            from_name,
            to_addresses: address_list(message.to()),
            cc_addresses: address_list(message.cc()),
            subject: message
                .subject()
                .map(|subject| subject.trim().to_string())
                .filter(|subject| !subject.is_empty()),
            text_body: message
                .body_text(0)
                .map(|body| body.into_owned())
                .filter(|body| !body.trim().is_empty()),
            html_body: message
                .body_html(0)
                .map(|body| body.into_owned())
                .filter(|body| !body.trim().is_empty()),
            in_reply_to: header_message_ids(message.in_reply_to()),
            references: header_message_ids(message.references()),
            received_at,
        })
    }

    /// Message ids this email claims to answer, most specific first.
    pub fn thread_candidates(&self) -> Vec<String> {
        let mut ids = self.in_reply_to.clone();
        for id in self.references.iter().rev() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

fn address_list(value: Option<&Address>) -> Vec<String> {
    let mut addresses = Vec::new();
    if let Some(list) = value {
        for addr in list.iter() {
            if let Some(email) = addr.address().and_then(normalize_email) {
                if !addresses.contains(&email) {
                    addresses.push(email);
                }
            }
        }
    }
    addresses
}

fn header_message_ids(value: &HeaderValue) -> Vec<String> {
    let mut ids = Vec::new();
    let mut push_all = |text: &str| {
        for id in extract_message_ids(text) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    };
    match value {
        HeaderValue::Text(text) => push_all(text),
        HeaderValue::TextList(list) => {
            for text in list {
                push_all(text);
            }
        }
        _ => {}
    }
    ids
}
