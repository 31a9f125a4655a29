//! Confirm, refund, client status sync and per-user reads.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::status_sync::StatusSynchronizer;
use super::{cache_hit, cache_write, PaymentBackends};
use crate::cache::payment_cache::StatusChangeSource;
use crate::database::{DatabaseError, PaymentRecord, UserPaymentAggregate};
use crate::error::{AppError, AppResult};
use crate::payments::types::{IntentSnapshot, RefundReason, RefundRequest, RefundResult};
use crate::payments::{validation, with_timeout, PaymentError};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmResponse {
    pub payment_id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundCommand {
    pub payment_intent_id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatusSync {
    pub payment_intent_id: String,
    /// What the provider says, which is what was stored.
    pub status: String,
    pub reported_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentHistory {
    pub user_id: String,
    pub count: usize,
    pub history: Vec<PaymentRecord>,
}

/// Clamp a requested page size into `1..=MAX_HISTORY_LIMIT`.
pub fn history_limit(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// Cached user aggregate, derived from the database on a miss.
pub(crate) async fn load_user_aggregate(
    backends: &PaymentBackends,
    user_id: &str,
    ttl: Duration,
) -> Result<UserPaymentAggregate, DatabaseError> {
    if let Some(cache) = &backends.cache {
        if let Some(aggregate) = cache_hit(
            cache.get_user_aggregate(user_id).await,
            "get_user_aggregate",
            user_id,
        ) {
            return Ok(aggregate);
        }
    }

    let Some(store) = &backends.store else {
        return Ok(UserPaymentAggregate::empty(user_id));
    };
    let aggregate = store.user_aggregate(user_id).await?;

    if let Some(cache) = &backends.cache {
        cache_write(
            cache.set_user_aggregate(&aggregate, ttl).await,
            "set_user_aggregate",
            user_id,
        );
    }
    Ok(aggregate)
}

pub struct PaymentOperations {
    backends: PaymentBackends,
    sync: Arc<StatusSynchronizer>,
    provider_timeout: Duration,
    user_ttl: Duration,
}

impl PaymentOperations {
    pub fn new(
        backends: PaymentBackends,
        sync: Arc<StatusSynchronizer>,
        provider_timeout: Duration,
        user_ttl: Duration,
    ) -> Self {
        Self {
            backends,
            sync,
            provider_timeout,
            user_ttl,
        }
    }

    async fn fetch_intent(&self, reference: &str) -> Result<IntentSnapshot, PaymentError> {
        with_timeout(
            self.provider_timeout,
            "get_intent",
            self.backends.gateway.get_intent(reference),
        )
        .await
    }

    /// Live intent state for a client that just finished a payment sheet.
    pub async fn confirm(&self, payment_intent_id: &str) -> AppResult<ConfirmResponse> {
        validation::validate_payment_intent_id(payment_intent_id)?;
        let intent = self.fetch_intent(payment_intent_id).await?;

        Ok(ConfirmResponse {
            payment_id: intent.reference_id,
            status: intent.status,
            amount: intent.amount,
            currency: intent.currency,
        })
    }

    pub async fn refund(&self, command: RefundCommand) -> AppResult<RefundResult> {
        validation::validate_payment_intent_id(&command.payment_intent_id)?;
        if let Some(amount) = command.amount {
            validation::validate_amount(amount)?;
        }
        let reason = match command.reason.as_deref().filter(|r| !r.is_empty()) {
            Some(raw) => {
                validation::validate_refund_reason(raw)?;
                Some(RefundReason::from_str(raw)?)
            }
            None => None,
        };

        let request = RefundRequest {
            reference_id: command.payment_intent_id.clone(),
            amount: command.amount,
            reason,
        };
        let result = with_timeout(
            self.provider_timeout,
            "refund",
            self.backends.gateway.refund(request),
        )
        .await?;

        info!(
            payment_intent_id = %command.payment_intent_id,
            refund_id = %result.refund_id,
            amount = result.amount,
            status = %result.status,
            "Refund created"
        );
        Ok(result)
    }

    /// A client reports a status; the provider's answer is what gets stored.
    pub async fn sync_client_status(
        &self,
        payment_intent_id: &str,
        reported_status: &str,
    ) -> AppResult<ClientStatusSync> {
        validation::validate_payment_intent_id(payment_intent_id)?;
        validation::validate_client_status(reported_status)?;

        let intent = self.fetch_intent(payment_intent_id).await?;
        if intent.status != reported_status {
            info!(
                payment_intent_id = %payment_intent_id,
                reported_status = %reported_status,
                provider_status = %intent.status,
                "client-reported status differs from provider"
            );
        }

        let outcome = self
            .sync
            .apply(&intent, StatusChangeSource::Revalidate)
            .await
            .map_err(AppError::from)?;

        Ok(ClientStatusSync {
            payment_intent_id: payment_intent_id.to_string(),
            status: outcome.status,
            reported_status: reported_status.to_string(),
            previous_status: outcome.previous,
            updated: outcome.changed,
        })
    }

    pub async fn user_payment_info(&self, user_id: &str) -> AppResult<UserPaymentAggregate> {
        validation::validate_user_id(user_id)?;
        let aggregate = load_user_aggregate(&self.backends, user_id, self.user_ttl)
            .await
            .map_err(|e| AppError::from(e).with_context("loading user payment info"))?;
        Ok(aggregate)
    }

    pub async fn payment_history(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> AppResult<PaymentHistory> {
        validation::validate_user_id(user_id)?;
        let limit = history_limit(limit);

        let history = match &self.backends.store {
            Some(store) => store
                .history(user_id, limit)
                .await
                .map_err(|e| AppError::from(e).with_context("loading payment history"))?,
            None => {
                warn!(user_id = %user_id, "payment history requested without a database");
                Vec::new()
            }
        };

        Ok(PaymentHistory {
            user_id: user_id.to_string(),
            count: history.len(),
            history,
        })
    }
}
