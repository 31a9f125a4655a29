//! Write-back of a provider status into the database and the caches.
//!
//! Shared by background revalidation, the webhook path and client status
//! sync so all three apply the same transition rules and leave the same
//! trail of cache entries behind.

use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use super::{cache_hit, cache_write, PaymentBackends};
use crate::cache::payment_cache::{
    PaymentSnapshot, ProviderStatusSnapshot, StatusChangeEvent, StatusChangeSource,
    STATUS_CHANGE_TTL,
};
use crate::database::{DatabaseError, PaymentRecord, StatusUpdate};
use crate::payments::status::{self, Transition};
use crate::payments::types::IntentSnapshot;

/// What a status write did.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub provider_reference: String,
    /// Status held before the write, when one was known.
    pub previous: Option<String>,
    /// Status in force after the write. Differs from the provider's answer
    /// only when a final status refused to move.
    pub status: String,
    pub changed: bool,
    pub rejected: bool,
    /// A status-change notice was left for the client.
    pub notified: bool,
    pub record: Option<PaymentRecord>,
}

#[derive(Clone)]
pub struct StatusSynchronizer {
    backends: PaymentBackends,
    payment_ttl: Duration,
}

impl StatusSynchronizer {
    pub fn new(backends: PaymentBackends, payment_ttl: Duration) -> Self {
        Self {
            backends,
            payment_ttl,
        }
    }

    /// Apply `intent.status` with a guarded update, refresh both cache
    /// layers and leave a status-change notice when the status moved.
    ///
    /// A database failure is returned before any cache is touched.
    pub async fn apply(
        &self,
        intent: &IntentSnapshot,
        source: StatusChangeSource,
    ) -> Result<SyncOutcome, DatabaseError> {
        self.apply_served(intent, source, None).await
    }

    /// Like [`apply`](Self::apply), but the notice is judged against
    /// `served`, the status a client was last handed, rather than the
    /// stored row. A stale cache entry that disagrees with the resolved
    /// status leaves a notice even when the row itself did not move.
    pub async fn apply_served(
        &self,
        intent: &IntentSnapshot,
        source: StatusChangeSource,
        served: Option<&str>,
    ) -> Result<SyncOutcome, DatabaseError> {
        let reference = intent.reference_id.as_str();

        let update = match &self.backends.store {
            Some(store) => store.update_status(reference, &intent.status).await?,
            None => StatusUpdate::Missing,
        };

        let mut outcome = match update {
            StatusUpdate::Applied { previous, record } => SyncOutcome {
                provider_reference: reference.to_string(),
                previous: Some(previous),
                status: record.status.clone(),
                changed: true,
                rejected: false,
                notified: false,
                record: Some(record),
            },
            StatusUpdate::Unchanged { record } => SyncOutcome {
                provider_reference: reference.to_string(),
                previous: Some(record.status.clone()),
                status: record.status.clone(),
                changed: false,
                rejected: false,
                notified: false,
                record: Some(record),
            },
            StatusUpdate::Rejected { record } => SyncOutcome {
                provider_reference: reference.to_string(),
                previous: Some(record.status.clone()),
                status: record.status.clone(),
                changed: false,
                rejected: true,
                notified: false,
                record: Some(record),
            },
            StatusUpdate::Missing => self.compare_with_cache(intent).await,
        };

        if outcome.rejected {
            warn!(
                provider_reference = %reference,
                stored_status = %outcome.status,
                provider_status = %intent.status,
                "provider reported a change away from a final status; keeping stored status"
            );
        }

        self.write_caches(intent, &outcome).await;

        let notice_from = match served {
            Some(seen) if seen != outcome.status => Some(seen.to_string()),
            Some(_) => None,
            None if outcome.changed => Some(outcome.previous.clone().unwrap_or_default()),
            None => None,
        };

        if let Some(old_status) = &notice_from {
            info!(
                provider_reference = %reference,
                old_status = %old_status,
                new_status = %outcome.status,
                source = %source,
                "payment status changed"
            );
            self.record_change(reference, old_status, &outcome.status, source)
                .await;
            outcome.notified = true;
        }

        if outcome.changed && outcome.status == status::SUCCEEDED {
            self.invalidate_owner(&outcome).await;
        }

        Ok(outcome)
    }

    /// Refresh only the provider-status entry. Used when the database write
    /// failed but the provider's answer is still worth caching.
    pub async fn cache_provider_status(&self, intent: &IntentSnapshot) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        let snapshot = ProviderStatusSnapshot {
            provider_reference: intent.reference_id.clone(),
            status: intent.status.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            cached_at: Utc::now(),
        };
        cache_write(
            cache
                .set_provider_status(&snapshot, status::ttl_for(&snapshot.status))
                .await,
            "set_provider_status",
            &snapshot.provider_reference,
        );
    }

    /// No durable row: judge the change against whatever the cache holds.
    async fn compare_with_cache(&self, intent: &IntentSnapshot) -> SyncOutcome {
        let reference = intent.reference_id.as_str();
        let previous = match &self.backends.cache {
            Some(cache) => {
                match cache_hit(
                    cache.get_provider_status(reference).await,
                    "get_provider_status",
                    reference,
                ) {
                    Some(snapshot) => Some(snapshot.status),
                    None => cache_hit(
                        cache.get_payment_by_reference(reference).await,
                        "get_payment_by_reference",
                        reference,
                    )
                    .map(|snapshot| snapshot.status),
                }
            }
            None => None,
        };

        let (status, changed, rejected) = match previous.as_deref() {
            Some(current) => match status::transition(current, &intent.status) {
                Transition::Apply => (intent.status.clone(), true, false),
                Transition::Unchanged => (intent.status.clone(), false, false),
                Transition::Rejected => (current.to_string(), false, true),
            },
            None => (intent.status.clone(), false, false),
        };

        SyncOutcome {
            provider_reference: reference.to_string(),
            previous,
            status,
            changed,
            rejected,
            notified: false,
            record: None,
        }
    }

    async fn write_caches(&self, intent: &IntentSnapshot, outcome: &SyncOutcome) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        let reference = outcome.provider_reference.as_str();

        let (amount, currency) = match &outcome.record {
            Some(record) => (record.amount, record.currency.clone()),
            None => (intent.amount, intent.currency.clone()),
        };
        let provider_snapshot = ProviderStatusSnapshot {
            provider_reference: reference.to_string(),
            status: outcome.status.clone(),
            amount,
            currency,
            cached_at: Utc::now(),
        };
        cache_write(
            cache
                .set_provider_status(&provider_snapshot, status::ttl_for(&outcome.status))
                .await,
            "set_provider_status",
            reference,
        );

        let payment_snapshot = match &outcome.record {
            Some(record) => Some(PaymentSnapshot::from(record)),
            None => cache_hit(
                cache.get_payment_by_reference(reference).await,
                "get_payment_by_reference",
                reference,
            )
            .map(|mut snapshot| {
                snapshot.status = outcome.status.clone();
                snapshot.updated_at = Utc::now();
                snapshot
            }),
        };
        if let Some(snapshot) = payment_snapshot {
            cache_write(
                cache.set_payment(&snapshot, self.payment_ttl).await,
                "set_payment",
                reference,
            );
        }
    }

    async fn record_change(
        &self,
        reference: &str,
        old_status: &str,
        new_status: &str,
        source: StatusChangeSource,
    ) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        let event = StatusChangeEvent {
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
            changed_at: Utc::now(),
            source,
        };
        cache_write(
            cache
                .record_status_change(reference, &event, STATUS_CHANGE_TTL)
                .await,
            "record_status_change",
            reference,
        );
    }

    async fn invalidate_owner(&self, outcome: &SyncOutcome) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        let user_id = match &outcome.record {
            Some(record) => Some(record.user_id.clone()),
            None => cache_hit(
                cache
                    .get_payment_by_reference(&outcome.provider_reference)
                    .await,
                "get_payment_by_reference",
                &outcome.provider_reference,
            )
            .map(|snapshot| snapshot.user_id),
        };

        if let Some(user_id) = user_id {
            match cache.invalidate_user(&user_id).await {
                Ok(removed) => {
                    info!(user_id = %user_id, removed, "user payment cache invalidated")
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "user cache invalidation failed"),
            }
        }
    }
}
