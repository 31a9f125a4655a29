//! Intent creation with idempotency and the paid-within-window check.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::payment_operations::load_user_aggregate;
use super::{cache_write, PaymentBackends};
use crate::cache::payment_cache::{PaymentSnapshot, ProviderStatusSnapshot};
use crate::config::PricingConfig;
use crate::database::{NewPayment, PaymentRecord, UserPaymentAggregate};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError};
use crate::logging::mask_idempotency_key;
use crate::payments::status;
use crate::payments::types::{CreateIntentRequest, CreatedIntent, PaymentMethod};
use crate::payments::{validation, with_timeout};
use crate::workers::RevalidationPool;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PricingInfo {
    pub amount: i64,
    pub currency: String,
    pub label: String,
}

/// "HK$59", "$12.50", "€9"...
pub fn price_label(amount: i64, currency: &str) -> String {
    let currency = currency.to_lowercase();
    let symbol = match currency.as_str() {
        "usd" => "$".to_string(),
        "hkd" => "HK$".to_string(),
        "cny" | "jpy" => "¥".to_string(),
        "eur" => "€".to_string(),
        "gbp" => "£".to_string(),
        other => format!("{} ", other.to_uppercase()),
    };
    if validation::is_zero_decimal(&currency) {
        return format!("{}{}", symbol, amount);
    }
    let major = amount / 100;
    let minor = (amount % 100).abs();
    if minor == 0 {
        format!("{}{}", symbol, major)
    } else {
        format!("{}{}.{:02}", symbol, major, minor)
    }
}

#[derive(Debug, Clone)]
pub struct CreatePaymentCommand {
    pub user_id: String,
    pub description: String,
    pub method: PaymentMethod,
    pub return_url: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatedPayment {
    pub client_secret: Option<String>,
    pub payment_id: String,
    pub payment_intent_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreationOutcome {
    Created(CreatedPayment),
    /// The idempotency key was already used; these are the first call's ids.
    Existing(CreatedPayment),
    AlreadyPaid {
        days_remaining: i64,
        user_info: UserPaymentAggregate,
    },
}

impl CreationOutcome {
    pub fn payment(&self) -> Option<&CreatedPayment> {
        match self {
            CreationOutcome::Created(p) | CreationOutcome::Existing(p) => Some(p),
            CreationOutcome::AlreadyPaid { .. } => None,
        }
    }
}

pub struct PaymentCreationService {
    backends: PaymentBackends,
    pricing: PricingConfig,
    pool: RevalidationPool,
    provider_timeout: Duration,
    payment_ttl: Duration,
    user_ttl: Duration,
}

impl PaymentCreationService {
    pub fn new(
        backends: PaymentBackends,
        pricing: PricingConfig,
        pool: RevalidationPool,
        provider_timeout: Duration,
        payment_ttl: Duration,
        user_ttl: Duration,
    ) -> Self {
        Self {
            backends,
            pricing,
            pool,
            provider_timeout,
            payment_ttl,
            user_ttl,
        }
    }

    pub fn pricing(&self) -> PricingInfo {
        PricingInfo {
            amount: self.pricing.amount,
            currency: self.pricing.currency.clone(),
            label: price_label(self.pricing.amount, &self.pricing.currency),
        }
    }

    pub async fn create(&self, command: CreatePaymentCommand) -> AppResult<CreationOutcome> {
        validation::validate_user_id(&command.user_id)?;
        validation::validate_description(&command.description)?;
        if let Some(url) = command.return_url.as_deref() {
            validation::validate_url(url)?;
        }
        let idempotency_key = command
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        info!(
            user_id = %command.user_id,
            method = %command.method,
            idempotency_key = %mask_idempotency_key(idempotency_key.as_deref()),
            "Creating payment"
        );

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency_key(key).await {
                info!(
                    payment_id = %existing.internal_id,
                    payment_intent_id = %existing.provider_reference,
                    "Duplicate request detected, returning existing payment"
                );
                return Ok(CreationOutcome::Existing(
                    self.existing_payment(&existing, command.return_url.clone())
                        .await,
                ));
            }
        }

        let aggregate = load_user_aggregate(&self.backends, &command.user_id, self.user_ttl).await?;
        if let Some(days_remaining) = aggregate.days_remaining(self.pricing.validity_days, Utc::now())
        {
            info!(user_id = %command.user_id, days_remaining, "User already paid");
            return Ok(CreationOutcome::AlreadyPaid {
                days_remaining,
                user_info: aggregate,
            });
        }

        let internal_id = Uuid::new_v4();
        let mut metadata = BTreeMap::new();
        metadata.insert("user_id".to_string(), command.user_id.clone());
        metadata.insert("description".to_string(), command.description.clone());
        metadata.insert("payment_id".to_string(), internal_id.to_string());

        let request = CreateIntentRequest {
            amount: self.pricing.amount,
            currency: self.pricing.currency.clone(),
            method: command.method.clone(),
            metadata: metadata.clone(),
            idempotency_key: idempotency_key.clone(),
            return_url: command.return_url.clone(),
        };
        let intent = with_timeout(
            self.provider_timeout,
            "create_intent",
            self.backends.gateway.create_intent(request),
        )
        .await?;

        info!(
            payment_id = %internal_id,
            payment_intent_id = %intent.reference_id,
            status = %intent.status,
            "Payment intent created"
        );

        let record = match &self.backends.store {
            Some(store) => {
                let new_payment = NewPayment {
                    internal_id,
                    provider_reference: intent.reference_id.clone(),
                    idempotency_key: idempotency_key.clone(),
                    user_id: command.user_id.clone(),
                    amount: intent.amount,
                    currency: intent.currency.clone(),
                    status: intent.status.clone(),
                    payment_method: command.method.as_str().to_string(),
                    description: command.description.clone(),
                    metadata: serde_json::to_value(&metadata).unwrap_or_default(),
                };
                match store.insert(&new_payment).await {
                    Ok(record) => Some(record),
                    Err(e) if e.is_unique_violation() => {
                        let winner = self
                            .resolve_duplicate(idempotency_key.as_deref(), &intent.reference_id)
                            .await?;
                        info!(
                            payment_id = %winner.internal_id,
                            payment_intent_id = %winner.provider_reference,
                            "Concurrent creation detected, returning winner"
                        );
                        let mut payment = self.payment_from_record(&winner, command.return_url.clone());
                        if winner.provider_reference == intent.reference_id {
                            payment.client_secret = intent.client_secret.clone();
                        } else {
                            payment = self.existing_payment(&winner, command.return_url.clone()).await;
                        }
                        return Ok(CreationOutcome::Existing(payment));
                    }
                    Err(e) => {
                        warn!(
                            payment_id = %internal_id,
                            payment_intent_id = %intent.reference_id,
                            error = %e,
                            "Failed to save payment to database"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        self.warm_caches(internal_id, &command, &intent, record);

        Ok(CreationOutcome::Created(CreatedPayment {
            client_secret: intent.client_secret,
            payment_id: internal_id.to_string(),
            payment_intent_id: intent.reference_id,
            status: intent.status,
            return_url: command.return_url,
        }))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Option<PaymentRecord> {
        let store = self.backends.store.as_ref()?;
        match store.find_by_idempotency_key(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Failed to check idempotency key, continuing");
                None
            }
        }
    }

    async fn resolve_duplicate(
        &self,
        idempotency_key: Option<&str>,
        provider_reference: &str,
    ) -> AppResult<PaymentRecord> {
        let Some(store) = &self.backends.store else {
            return Err(duplicate(provider_reference));
        };
        if let Some(key) = idempotency_key {
            if let Some(record) = store.find_by_idempotency_key(key).await? {
                return Ok(record);
            }
        }
        store
            .find_by_reference(provider_reference)
            .await?
            .ok_or_else(|| duplicate(provider_reference))
    }

    fn payment_from_record(&self, record: &PaymentRecord, return_url: Option<String>) -> CreatedPayment {
        CreatedPayment {
            client_secret: None,
            payment_id: record.internal_id.to_string(),
            payment_intent_id: record.provider_reference.clone(),
            status: record.status.clone(),
            return_url,
        }
    }

    /// The client secret is not stored; fetch it again from the provider.
    async fn existing_payment(&self, record: &PaymentRecord, return_url: Option<String>) -> CreatedPayment {
        let mut payment = self.payment_from_record(record, return_url);
        match with_timeout(
            self.provider_timeout,
            "get_intent",
            self.backends.gateway.get_intent(&record.provider_reference),
        )
        .await
        {
            Ok(intent) => {
                payment.client_secret = intent.client_secret;
                payment.status = intent.status;
            }
            Err(e) => {
                warn!(
                    payment_intent_id = %record.provider_reference,
                    error = %e,
                    "Failed to refresh existing intent, returning stored data"
                );
            }
        }
        payment
    }

    fn warm_caches(
        &self,
        internal_id: Uuid,
        command: &CreatePaymentCommand,
        intent: &CreatedIntent,
        record: Option<PaymentRecord>,
    ) {
        let Some(cache) = self.backends.cache.clone() else {
            return;
        };
        let snapshot = match &record {
            Some(record) => PaymentSnapshot::from(record),
            None => {
                let now = Utc::now();
                PaymentSnapshot {
                    internal_id: internal_id.to_string(),
                    provider_reference: intent.reference_id.clone(),
                    user_id: command.user_id.clone(),
                    amount: intent.amount,
                    currency: intent.currency.clone(),
                    status: intent.status.clone(),
                    payment_method: command.method.as_str().to_string(),
                    description: command.description.clone(),
                    created_at: now,
                    updated_at: now,
                }
            }
        };
        let provider_status = ProviderStatusSnapshot {
            provider_reference: intent.reference_id.clone(),
            status: intent.status.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            cached_at: Utc::now(),
        };
        let payment_ttl = self.payment_ttl;

        let scheduled = self.pool.spawn("warm_payment_cache", async move {
            let reference = snapshot.provider_reference.clone();
            cache_write(
                cache.set_payment(&snapshot, payment_ttl).await,
                "set_payment",
                &reference,
            );
            cache_write(
                cache
                    .set_provider_status(&provider_status, status::ttl_for(&provider_status.status))
                    .await,
                "set_provider_status",
                &reference,
            );
        });
        if !scheduled {
            debug!(payment_id = %internal_id, "cache warm-up skipped");
        }
    }
}

fn duplicate(key: &str) -> AppError {
    AppError::new(AppErrorKind::Domain(DomainError::DuplicatePayment {
        key: key.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_use_currency_symbols() {
        assert_eq!(price_label(5900, "hkd"), "HK$59");
        assert_eq!(price_label(1250, "usd"), "$12.50");
        assert_eq!(price_label(999, "EUR"), "€9.99");
        assert_eq!(price_label(100, "gbp"), "£1");
        assert_eq!(price_label(5000, "cny"), "¥50");
        assert_eq!(price_label(5005, "chf"), "CHF 50.05");
        assert_eq!(price_label(5000, "jpy"), "¥5000");
        assert_eq!(price_label(5000, "JPY"), "¥5000");
    }

    #[test]
    fn outcome_exposes_payment_only_when_created() {
        let payment = CreatedPayment {
            client_secret: Some("pi_1_secret".into()),
            payment_id: "id".into(),
            payment_intent_id: "pi_1".into(),
            status: "requires_payment_method".into(),
            return_url: None,
        };
        assert!(CreationOutcome::Created(payment.clone()).payment().is_some());
        assert!(CreationOutcome::AlreadyPaid {
            days_remaining: 3,
            user_info: UserPaymentAggregate::empty("u"),
        }
        .payment()
        .is_none());
    }
}
