//! HTTP error responses
//!
//! Every error body has the shape
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Provider failures are collapsed into one generic 503 so clients never see
//! key labels, upstream bodies or which credential was tried.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::assistant::AssistantError;
use crate::documents::ExtractError;

/// Message returned whenever the key pool gives up.
pub const UNAVAILABLE_MESSAGE: &str = "AI service unavailable right now, please try again later";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("upload exceeds the size limit")]
    PayloadTooLarge,

    #[error("{}", UNAVAILABLE_MESSAGE)]
    Unavailable,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request_error",
            ApiError::SessionNotFound => "not_found_error",
            ApiError::PayloadTooLarge => "request_too_large",
            ApiError::Unavailable => "service_unavailable_error",
        }
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        match err {
            AssistantError::Extract(ExtractError::NoDocuments) => {
                ApiError::BadRequest("upload at least one PDF".into())
            }
            AssistantError::Extract(e) => ApiError::BadRequest(e.to_string()),
            AssistantError::NoText | AssistantError::EmptyQuestion => {
                ApiError::BadRequest(err.to_string())
            }
            AssistantError::Pool(e) => {
                error!(
                    operation = e.operation(),
                    quota = e.is_quota(),
                    error = %e,
                    "provider call failed after retries"
                );
                ApiError::Unavailable
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        let status = self.status();
        if status.is_client_error() {
            warn!(%request_id, status = status.as_u16(), error = %self, "request rejected");
        }
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
