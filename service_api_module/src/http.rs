use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ServiceApiError;

/// Resource endpoints wrap payloads in `{"data": ...}`; older endpoints
/// return the bare object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(value) => value,
        }
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<Client, ServiceApiError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn authorized(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    let builder = builder.header("Accept", "application/json");
    match token {
        Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
        None => builder,
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(
    service: &'static str,
    response: Response,
) -> Result<T, ServiceApiError> {
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(ServiceApiError::Status {
            service,
            status: status.as_u16(),
            body,
        });
    }
    let envelope: Envelope<T> = serde_json::from_str(&body)?;
    Ok(envelope.into_inner())
}
