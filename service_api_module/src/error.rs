#[derive(Debug, thiserror::Error)]
pub enum ServiceApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service api config error: {0}")]
    Config(String),
}

impl ServiceApiError {
    /// Client errors that will not succeed on retry (bad payload, forbidden).
    /// 404, 408 and 429 are excluded since they are transient or racy.
    pub fn is_permanent(&self) -> bool {
        match self {
            ServiceApiError::Status { status, .. } => {
                (400..500).contains(status) && !matches!(status, 404 | 408 | 429)
            }
            ServiceApiError::Config(_) => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
