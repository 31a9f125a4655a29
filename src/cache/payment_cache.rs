//! Payment-shaped records stored in the cache.

use super::error::CacheResult;
use crate::database::payment_repository::{PaymentRecord, UserPaymentAggregate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "cache")]
use super::cache::{Cache, RedisCache};
#[cfg(feature = "cache")]
use super::keys::{payment, provider, user};

pub const DEFAULT_PAYMENT_TTL: Duration = Duration::from_secs(1800);
pub const DEFAULT_USER_AGGREGATE_TTL: Duration = Duration::from_secs(900);
pub const STATUS_CHANGE_TTL: Duration = Duration::from_secs(60);
pub const PROCESSED_EVENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentSnapshot {
    pub internal_id: String,
    pub provider_reference: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PaymentRecord> for PaymentSnapshot {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            internal_id: record.internal_id.to_string(),
            provider_reference: record.provider_reference.clone(),
            user_id: record.user_id.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            status: record.status.clone(),
            payment_method: record.payment_method.clone(),
            description: record.description.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatusSnapshot {
    pub provider_reference: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusChangeSource {
    Webhook,
    Revalidate,
}

impl std::fmt::Display for StatusChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusChangeSource::Webhook => f.write_str("webhook"),
            StatusChangeSource::Revalidate => f.write_str("revalidate"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChangeEvent {
    pub old_status: String,
    pub new_status: String,
    pub changed_at: DateTime<Utc>,
    pub source: StatusChangeSource,
}

/// Cache operations the payment services rely on.
///
/// `Ok(None)` is a miss. An `Err` means the store could not answer and the
/// caller should fall through to the database or the provider.
#[async_trait]
pub trait PaymentCache: Send + Sync {
    async fn get_payment(&self, internal_id: &str) -> CacheResult<Option<PaymentSnapshot>>;

    async fn get_payment_by_reference(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<PaymentSnapshot>>;

    /// Writes the snapshot under both its internal id and provider reference.
    async fn set_payment(&self, snapshot: &PaymentSnapshot, ttl: Duration) -> CacheResult<()>;

    async fn get_provider_status(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<ProviderStatusSnapshot>>;

    async fn set_provider_status(
        &self,
        snapshot: &ProviderStatusSnapshot,
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn record_status_change(
        &self,
        provider_reference: &str,
        event: &StatusChangeEvent,
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn peek_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>>;

    /// Read and delete in one step.
    async fn take_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>>;

    /// Returns `true` if this caller is the first to see `event_id`.
    async fn claim_event(&self, event_id: &str, ttl: Duration) -> CacheResult<bool>;

    async fn release_event(&self, event_id: &str) -> CacheResult<()>;

    async fn get_user_aggregate(&self, user_id: &str)
        -> CacheResult<Option<UserPaymentAggregate>>;

    async fn set_user_aggregate(
        &self,
        aggregate: &UserPaymentAggregate,
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Drops every cached entry for the user. Returns the number removed.
    async fn invalidate_user(&self, user_id: &str) -> CacheResult<u64>;
}

#[cfg(feature = "cache")]
#[derive(Clone)]
pub struct RedisPaymentCache {
    cache: RedisCache,
}

#[cfg(feature = "cache")]
impl RedisPaymentCache {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl PaymentCache for RedisPaymentCache {
    async fn get_payment(&self, internal_id: &str) -> CacheResult<Option<PaymentSnapshot>> {
        let key = payment::PaymentKey::new(internal_id).to_string();
        Cache::<PaymentSnapshot>::get(&self.cache, &key).await
    }

    async fn get_payment_by_reference(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<PaymentSnapshot>> {
        let key = payment::ReferenceKey::new(provider_reference).to_string();
        Cache::<PaymentSnapshot>::get(&self.cache, &key).await
    }

    async fn set_payment(&self, snapshot: &PaymentSnapshot, ttl: Duration) -> CacheResult<()> {
        let by_id = payment::PaymentKey::new(&snapshot.internal_id).to_string();
        let by_ref = payment::ReferenceKey::new(&snapshot.provider_reference).to_string();
        self.cache.set(&by_id, snapshot, ttl).await?;
        self.cache.set(&by_ref, snapshot, ttl).await
    }

    async fn get_provider_status(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<ProviderStatusSnapshot>> {
        let key = provider::StatusKey::new(provider_reference).to_string();
        Cache::<ProviderStatusSnapshot>::get(&self.cache, &key).await
    }

    async fn set_provider_status(
        &self,
        snapshot: &ProviderStatusSnapshot,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = provider::StatusKey::new(&snapshot.provider_reference).to_string();
        self.cache.set(&key, snapshot, ttl).await
    }

    async fn record_status_change(
        &self,
        provider_reference: &str,
        event: &StatusChangeEvent,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = provider::StatusChangeKey::new(provider_reference).to_string();
        self.cache.set(&key, event, ttl).await
    }

    async fn peek_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>> {
        let key = provider::StatusChangeKey::new(provider_reference).to_string();
        Cache::<StatusChangeEvent>::get(&self.cache, &key).await
    }

    async fn take_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>> {
        let key = provider::StatusChangeKey::new(provider_reference).to_string();
        self.cache.take(&key).await
    }

    async fn claim_event(&self, event_id: &str, ttl: Duration) -> CacheResult<bool> {
        let key = provider::ProcessedEventKey::new(event_id).to_string();
        self.cache.set_if_absent(&key, &Utc::now(), ttl).await
    }

    async fn release_event(&self, event_id: &str) -> CacheResult<()> {
        let key = provider::ProcessedEventKey::new(event_id).to_string();
        Cache::<DateTime<Utc>>::delete(&self.cache, &key).await?;
        Ok(())
    }

    async fn get_user_aggregate(
        &self,
        user_id: &str,
    ) -> CacheResult<Option<UserPaymentAggregate>> {
        let key = user::PaymentInfoKey::new(user_id).to_string();
        Cache::<UserPaymentAggregate>::get(&self.cache, &key).await
    }

    async fn set_user_aggregate(
        &self,
        aggregate: &UserPaymentAggregate,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = user::PaymentInfoKey::new(&aggregate.user_id).to_string();
        self.cache.set(&key, aggregate, ttl).await
    }

    async fn invalidate_user(&self, user_id: &str) -> CacheResult<u64> {
        let pattern = user::PaymentInfoKey::new(user_id).pattern();
        self.cache.delete_pattern(&pattern).await
    }
}
