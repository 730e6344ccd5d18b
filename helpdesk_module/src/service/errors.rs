use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error responses of the admin API.
#[derive(Debug)]
pub enum ApiError {
    /// 422 with per-field messages.
    Validation(BTreeMap<String, Vec<String>>),
    NotFound { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    Unavailable { code: &'static str, message: String },
    /// 500; the detail is only present when debug output is enabled.
    Internal(Option<String>),
}

impl ApiError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        ApiError::Validation(errors)
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Validation(errors) => {
                let mut messages = errors.values().flatten();
                let first = messages
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "The given data was invalid.".to_string());
                let more = messages.count();
                let message = match more {
                    0 => first,
                    1 => format!("{} (and 1 more error)", first),
                    n => format!("{} (and {} more errors)", first, n),
                };
                json!({ "message": message, "errors": errors })
            }
            ApiError::NotFound { code, message }
            | ApiError::Conflict { code, message }
            | ApiError::Unavailable { code, message } => {
                json!({ "error": { "code": code, "message": message } })
            }
            ApiError::Internal(detail) => json!({
                "error": {
                    "code": "internal_error",
                    "message": detail.unwrap_or_else(|| "Internal server error".to_string()),
                }
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_lists_field_errors() {
        let mut errors = BTreeMap::new();
        errors.insert("email".to_string(), vec!["The email must be a valid email address.".to_string()]);
        errors.insert("name".to_string(), vec!["The name field is required.".to_string()]);

        let (status, body) = body_json(ApiError::Validation(errors)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body["message"],
            "The email must be a valid email address. (and 1 more error)"
        );
        assert_eq!(body["errors"]["name"][0], "The name field is required.");
    }

    #[tokio::test]
    async fn internal_hides_detail_unless_present() {
        let (status, body) = body_json(ApiError::Internal(None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "Internal server error");

        let (_, body) = body_json(ApiError::Internal(Some("disk full".to_string()))).await;
        assert_eq!(body["error"]["message"], "disk full");
    }
}
