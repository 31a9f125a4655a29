//! Error response formatting
//!
//! Every failed request gets the same JSON body shape, the HTTP status from
//! [`AppError::status_code`] and the caller's request id.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// RFC 3339 timestamp of the error
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Whether the client should retry the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        let details = error
            .field()
            .map(|field| serde_json::json!({ "field": field }));

        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            details,
            retryable: Some(error.is_retryable()),
        }
    }

}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                context = ?self.context,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let retry_after = match &self.kind {
            crate::error::AppErrorKind::External(crate::error::ExternalError::RateLimit {
                retry_after: Some(secs),
                ..
            }) => Some(*secs),
            _ => None,
        };

        let body = Json(ErrorResponse::from_app_error(&self));
        match retry_after {
            Some(secs) => (
                status_code,
                [(axum::http::header::RETRY_AFTER, secs.to_string())],
                body,
            )
                .into_response(),
            None => (status_code, body).into_response(),
        }
    }
}

/// Helper to extract request ID from request headers
pub fn get_request_id_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppErrorKind, ExternalError};

    #[test]
    fn test_error_response_from_app_error() {
        let app_error = AppError::not_found("pi_123").with_request_id("req_123");

        let error_response = ErrorResponse::from_app_error(&app_error);

        assert_eq!(error_response.error, ErrorCode::PaymentNotFound);
        assert_eq!(error_response.request_id, Some("req_123".to_string()));
        assert!(error_response.details.is_none());
    }

    #[test]
    fn test_validation_error_carries_field() {
        let app_error = AppError::invalid_field("description", "too long");
        let error_response = ErrorResponse::from_app_error(&app_error);
        assert_eq!(
            error_response.details,
            Some(serde_json::json!({ "field": "description" }))
        );
    }

    #[test]
    fn test_app_error_into_response() {
        let response = AppError::invalid_field("amount", "must be positive").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = AppError::new(AppErrorKind::External(ExternalError::RateLimit {
            service: "api".to_string(),
            retry_after: Some(42),
        }))
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap().to_str().unwrap(),
            "42"
        );
    }

    #[test]
    fn test_context_stays_out_of_the_body() {
        let app_error = AppError::not_found("pi_123").with_context("loading payment history");
        let error_response = ErrorResponse::from_app_error(&app_error);

        let body = serde_json::to_string(&error_response).unwrap();
        assert!(!body.contains("loading payment history"));
        assert_eq!(app_error.context.as_deref(), Some("loading payment history"));
    }
}
