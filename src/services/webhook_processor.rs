use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::status_sync::StatusSynchronizer;
use super::PaymentBackends;
use crate::cache::payment_cache::{StatusChangeSource, PROCESSED_EVENT_TTL};
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::payments::types::WebhookEvent;

/// Event types that move a payment's status.
pub const HANDLED_EVENT_TYPES: [&str; 3] = [
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
    "payment_intent.canceled",
];

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<WebhookProcessorError> for AppError {
    fn from(err: WebhookProcessorError) -> Self {
        match err {
            WebhookProcessorError::InvalidSignature(reason) => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidSignature { reason }))
            }
            WebhookProcessorError::MalformedEvent(reason) => AppError::invalid_field("body", reason),
            WebhookProcessorError::DatabaseError(message) => {
                AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: true,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Processed {
        event_id: String,
        event_type: String,
        status_changed: bool,
    },
    /// Seen before; nothing was touched.
    Duplicate { event_id: String },
    /// Verified but not an event type we act on.
    Ignored { event_id: String, event_type: String },
}

pub struct WebhookProcessor {
    backends: PaymentBackends,
    sync: Arc<StatusSynchronizer>,
}

impl WebhookProcessor {
    pub fn new(backends: PaymentBackends, sync: Arc<StatusSynchronizer>) -> Self {
        Self { backends, sync }
    }

    /// Verify, deduplicate and apply one provider notification.
    pub async fn ingest(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, WebhookProcessorError> {
        let signature = signature
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| WebhookProcessorError::InvalidSignature("missing signature".into()))?;

        let gateway = &self.backends.gateway;
        let verification = gateway
            .verify_webhook(payload, signature)
            .map_err(|e| WebhookProcessorError::InvalidSignature(e.to_string()))?;
        if !verification.valid {
            let reason = verification
                .reason
                .unwrap_or_else(|| "signature mismatch".to_string());
            warn!(provider = gateway.name(), reason = %reason, "Invalid webhook signature");
            return Err(WebhookProcessorError::InvalidSignature(reason));
        }

        let event = gateway
            .parse_webhook_event(payload)
            .map_err(|e| WebhookProcessorError::MalformedEvent(e.to_string()))?;

        if !self.claim(&event.id).await {
            info!(event_id = %event.id, "Webhook already processed");
            return Ok(WebhookAck::Duplicate { event_id: event.id });
        }

        match self.process_event(&event).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Webhook processing failed");
                self.release(&event.id).await;
                Err(e)
            }
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> Result<WebhookAck, WebhookProcessorError> {
        if !HANDLED_EVENT_TYPES.contains(&event.event_type.as_str()) {
            info!(event_id = %event.id, event_type = %event.event_type, "Ignoring webhook event type");
            return Ok(WebhookAck::Ignored {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
            });
        }

        let intent = event.intent.as_ref().ok_or_else(|| {
            WebhookProcessorError::MalformedEvent(format!(
                "{} event carries no payment intent",
                event.event_type
            ))
        })?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            provider_reference = %intent.reference_id,
            status = %intent.status,
            "Processing payment webhook"
        );

        let outcome = self
            .sync
            .apply(intent, StatusChangeSource::Webhook)
            .await
            .map_err(|e| WebhookProcessorError::DatabaseError(e.to_string()))?;

        Ok(WebhookAck::Processed {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            status_changed: outcome.changed,
        })
    }

    /// `false` only when the event id is known to be taken. A cache outage
    /// lets the event through; the guarded status write keeps replays harmless.
    async fn claim(&self, event_id: &str) -> bool {
        let Some(cache) = &self.backends.cache else {
            return true;
        };
        match cache.claim_event(event_id, PROCESSED_EVENT_TTL).await {
            Ok(first) => first,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Webhook dedup unavailable, processing anyway");
                true
            }
        }
    }

    async fn release(&self, event_id: &str) {
        if let Some(cache) = &self.backends.cache {
            if let Err(e) = cache.release_event(event_id).await {
                warn!(event_id = %event_id, error = %e, "Failed to release webhook claim");
            }
        }
    }
}
