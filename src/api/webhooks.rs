use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};

use super::AppState;
use crate::error::AppError;
use crate::middleware::error::get_request_id_from_headers;
use crate::services::webhook_processor::{WebhookAck, WebhookProcessorError};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/v1/stripe/webhook
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.webhooks.ingest(&body, signature).await {
        Ok(WebhookAck::Processed {
            event_id,
            event_type,
            status_changed,
        }) => {
            info!(event_id = %event_id, event_type = %event_type, status_changed, "Webhook processed successfully");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Ok(WebhookAck::Duplicate { event_id }) => {
            info!(event_id = %event_id, "Webhook already processed");
            (
                StatusCode::OK,
                Json(json!({ "received": true, "duplicate": true })),
            )
                .into_response()
        }
        Ok(WebhookAck::Ignored { event_id, event_type }) => {
            info!(event_id = %event_id, event_type = %event_type, "Webhook acknowledged without action");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(e) => {
            match &e {
                WebhookProcessorError::InvalidSignature(reason) => {
                    warn!(reason = %reason, "Rejected webhook with invalid signature")
                }
                WebhookProcessorError::MalformedEvent(reason) => {
                    warn!(reason = %reason, "Rejected malformed webhook")
                }
                WebhookProcessorError::DatabaseError(message) => {
                    error!(error = %message, "Webhook processing failed; provider will retry")
                }
            }
            let mut err = AppError::from(e);
            if let Some(id) = get_request_id_from_headers(&headers) {
                err = err.with_request_id(id);
            }
            err.into_response()
        }
    }
}
