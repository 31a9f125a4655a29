//! Payment status reads.
//!
//! Answers "what is the status of this payment" from the fastest source that
//! can be trusted for the status in question:
//!
//! * intermediate statuses are served from the provider-status cache and
//!   revalidated in the background;
//! * final statuses are served from the database, which outranks the cache;
//! * everything else goes to the provider, degrading to the last known
//!   status if the provider cannot be reached.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::status_sync::StatusSynchronizer;
use super::{cache_hit, cache_write, PaymentBackends};
use crate::cache::payment_cache::{
    PaymentSnapshot, ProviderStatusSnapshot, StatusChangeSource, DEFAULT_PAYMENT_TTL,
    DEFAULT_USER_AGGREGATE_TTL,
};
use crate::database::PaymentRecord;
use crate::error::AppError;
use crate::payments::status::{self, StatusClass};
use crate::payments::types::{IntentSnapshot, LookupKey};
use crate::payments::{with_timeout, PaymentError};
use crate::workers::revalidation::{RevalidationPool, DEFAULT_MAX_IN_FLIGHT};

const STATUS_CHANGED_MESSAGE: &str =
    "Payment status has changed. Please query again for the latest status.";
const STALE_MESSAGE: &str =
    "Payment provider is unreachable; showing the last known status.";

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Bound on each live provider lookup.
    pub provider_timeout: Duration,
    pub max_in_flight: usize,
    /// Ids starting with this are provider references, anything else is ours.
    pub provider_reference_prefix: String,
    pub payment_ttl: Duration,
    pub user_ttl: Duration,
    /// Intermediate database rows younger than this are served without a
    /// synchronous provider call.
    pub fresh_row_window: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(5),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            provider_reference_prefix: "pi_".to_string(),
            payment_ttl: DEFAULT_PAYMENT_TTL,
            user_ttl: DEFAULT_USER_AGGREGATE_TTL,
            fresh_row_window: status::INTERMEDIATE_STATUS_TTL,
        }
    }
}

impl ReconciliationConfig {
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider_timeout: env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider_timeout),
            max_in_flight: env::var("REVALIDATION_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_in_flight),
            provider_reference_prefix: env::var("PROVIDER_REFERENCE_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.provider_reference_prefix),
            ..defaults
        }
    }
}

/// Where a status answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusSource {
    #[serde(rename = "cache")]
    Cache,
    #[serde(rename = "database")]
    Database,
    #[serde(rename = "provider")]
    Provider,
    #[serde(rename = "database+cache")]
    DatabaseCache,
    #[serde(rename = "database+provider")]
    DatabaseProvider,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSource::Cache => "cache",
            StatusSource::Database => "database",
            StatusSource::Provider => "provider",
            StatusSource::DatabaseCache => "database+cache",
            StatusSource::DatabaseProvider => "database+provider",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "payment_id", skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
    #[serde(rename = "payment_intent_id")]
    pub provider_reference: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub source: StatusSource,
    pub cached: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    fn new(
        internal_id: Option<String>,
        provider_reference: &str,
        status: &str,
        amount: i64,
        currency: &str,
        source: StatusSource,
    ) -> Self {
        Self {
            internal_id,
            provider_reference: provider_reference.to_string(),
            status: status.to_string(),
            amount,
            currency: currency.to_string(),
            source,
            cached: false,
            stale: false,
            status_changed: None,
            new_status: None,
            status_changed_at: None,
            message: None,
        }
    }

    fn from_record(record: &PaymentRecord, source: StatusSource) -> Self {
        Self::new(
            Some(record.internal_id.to_string()),
            &record.provider_reference,
            &record.status,
            record.amount,
            &record.currency,
            source,
        )
    }
}

/// One-shot answer to "did the status change since I last asked".
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangeNotice {
    #[serde(rename = "payment_intent_id")]
    pub provider_reference: String,
    pub status_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<StatusChangeSource>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("payment {0} not found")]
    NotFound(String),
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(PaymentError),
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::NotFound(id) => AppError::not_found(id),
            ReconciliationError::ProviderUnavailable(e) => AppError::from(e),
        }
    }
}

/// A lookup key after it has been tied to a provider reference.
struct Resolved {
    provider_reference: String,
    internal_id: Option<String>,
    /// Row loaded while resolving, if any.
    row: Option<PaymentRecord>,
    /// Resolution needed the database.
    via_database: bool,
    snapshot: Option<PaymentSnapshot>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    backends: PaymentBackends,
    sync: Arc<StatusSynchronizer>,
    pool: RevalidationPool,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    pub fn new(
        backends: PaymentBackends,
        sync: Arc<StatusSynchronizer>,
        pool: RevalidationPool,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            backends,
            sync,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn pool(&self) -> &RevalidationPool {
        &self.pool
    }

    /// Classify a raw id from the API.
    pub fn lookup_key(&self, raw: &str) -> LookupKey {
        LookupKey::infer(raw, &self.config.provider_reference_prefix)
    }

    pub async fn get_status(&self, key: &LookupKey) -> Result<StatusResponse, ReconciliationError> {
        let resolved = self.resolve(key).await?;
        let reference = resolved.provider_reference.clone();

        let cached = match &self.backends.cache {
            Some(cache) => cache_hit(
                cache.get_provider_status(&reference).await,
                "get_provider_status",
                &reference,
            ),
            None => None,
        };

        if let Some(hit) = &cached {
            if status::classify(&hit.status) == StatusClass::Intermediate {
                let source = if resolved.via_database {
                    StatusSource::DatabaseCache
                } else {
                    StatusSource::Cache
                };
                let mut response = StatusResponse::new(
                    resolved.internal_id.clone(),
                    &reference,
                    &hit.status,
                    hit.amount,
                    &hit.currency,
                    source,
                );
                response.cached = true;
                self.attach_pending_change(&mut response).await;
                debug!(provider_reference = %reference, status = %hit.status, "intermediate status served from cache");
                self.schedule_revalidation(&reference, &hit.status);
                return Ok(response);
            }
        }

        let row = match resolved.row {
            Some(row) => Some(row),
            None => self.load_row(&reference).await,
        };
        let internal_id = resolved
            .internal_id
            .clone()
            .or_else(|| row.as_ref().map(|r| r.internal_id.to_string()));

        if let Some(row) = &row {
            match status::classify(&row.status) {
                StatusClass::Final => {
                    if let Some(hit) = &cached {
                        if hit.status != row.status {
                            warn!(
                                provider_reference = %reference,
                                cache_status = %hit.status,
                                database_status = %row.status,
                                "cache disagrees with database on a final status; database wins"
                            );
                        }
                    }
                    if cached.as_ref().map(|hit| hit.status != row.status).unwrap_or(true) {
                        self.refresh_provider_status(row).await;
                    }
                    return Ok(StatusResponse::from_record(row, StatusSource::Database));
                }
                StatusClass::Intermediate if cached.is_none() && self.is_fresh(row) => {
                    let mut response = StatusResponse::from_record(row, StatusSource::Database);
                    self.attach_pending_change(&mut response).await;
                    self.schedule_revalidation(&reference, &row.status);
                    return Ok(response);
                }
                _ => {}
            }
        }

        self.live_status(&reference, internal_id, row, cached, resolved.snapshot)
            .await
    }

    /// Read and clear the pending status-change notice.
    pub async fn check_status_change(&self, provider_reference: &str) -> StatusChangeNotice {
        let event = match &self.backends.cache {
            Some(cache) => cache_hit(
                cache.take_status_change(provider_reference).await,
                "take_status_change",
                provider_reference,
            ),
            None => None,
        };

        match event {
            Some(event) => StatusChangeNotice {
                provider_reference: provider_reference.to_string(),
                status_changed: true,
                old_status: Some(event.old_status),
                new_status: Some(event.new_status),
                changed_at: Some(event.changed_at),
                source: Some(event.source),
                message: "Payment status has changed".to_string(),
            },
            None => StatusChangeNotice {
                provider_reference: provider_reference.to_string(),
                status_changed: false,
                old_status: None,
                new_status: None,
                changed_at: None,
                source: None,
                message: "No status change detected".to_string(),
            },
        }
    }

    /// Fetch the live status and write it back. Runs on the revalidation pool.
    ///
    /// `served` is the status the caller was just given; a notice is left
    /// whenever the resolved status differs from it.
    pub async fn revalidate(&self, provider_reference: &str, served: Option<&str>) {
        let intent = match self.fetch_intent(provider_reference).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(provider_reference = %provider_reference, error = %e, "background revalidation failed");
                return;
            }
        };

        match self
            .sync
            .apply_served(&intent, StatusChangeSource::Revalidate, served)
            .await
        {
            Ok(outcome) if outcome.notified => {
                info!(
                    provider_reference = %provider_reference,
                    served_status = ?served,
                    new_status = %outcome.status,
                    "revalidation found a new status"
                );
            }
            Ok(_) => {
                debug!(provider_reference = %provider_reference, "revalidation confirmed cached status");
            }
            Err(e) => {
                warn!(provider_reference = %provider_reference, error = %e, "revalidation could not persist status");
                self.sync.cache_provider_status(&intent).await;
            }
        }
    }

    async fn resolve(&self, key: &LookupKey) -> Result<Resolved, ReconciliationError> {
        match key {
            LookupKey::ProviderReference(reference) => {
                let snapshot = match &self.backends.cache {
                    Some(cache) => cache_hit(
                        cache.get_payment_by_reference(reference).await,
                        "get_payment_by_reference",
                        reference,
                    ),
                    None => None,
                };
                Ok(Resolved {
                    provider_reference: reference.clone(),
                    internal_id: snapshot.as_ref().map(|s| s.internal_id.clone()),
                    row: None,
                    via_database: false,
                    snapshot,
                })
            }
            LookupKey::InternalId(id) => {
                if let Some(cache) = &self.backends.cache {
                    if let Some(snapshot) =
                        cache_hit(cache.get_payment(id).await, "get_payment", id)
                    {
                        return Ok(Resolved {
                            provider_reference: snapshot.provider_reference.clone(),
                            internal_id: Some(snapshot.internal_id.clone()),
                            row: None,
                            via_database: false,
                            snapshot: Some(snapshot),
                        });
                    }
                }

                let Some(store) = &self.backends.store else {
                    return Err(ReconciliationError::NotFound(id.clone()));
                };
                let row = match store.find_by_internal_id(id).await {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(payment_id = %id, error = %e, "database lookup failed");
                        None
                    }
                };
                let row = row.ok_or_else(|| ReconciliationError::NotFound(id.clone()))?;

                if let Some(cache) = &self.backends.cache {
                    cache_write(
                        cache
                            .set_payment(&PaymentSnapshot::from(&row), self.config.payment_ttl)
                            .await,
                        "set_payment",
                        id,
                    );
                }

                Ok(Resolved {
                    provider_reference: row.provider_reference.clone(),
                    internal_id: Some(row.internal_id.to_string()),
                    row: Some(row),
                    via_database: true,
                    snapshot: None,
                })
            }
        }
    }

    async fn live_status(
        &self,
        reference: &str,
        internal_id: Option<String>,
        row: Option<PaymentRecord>,
        cached: Option<ProviderStatusSnapshot>,
        snapshot: Option<PaymentSnapshot>,
    ) -> Result<StatusResponse, ReconciliationError> {
        let source = if row.is_some() {
            StatusSource::DatabaseProvider
        } else {
            StatusSource::Provider
        };

        match self.fetch_intent(reference).await {
            Ok(intent) => {
                let effective = match self.sync.apply(&intent, StatusChangeSource::Revalidate).await {
                    Ok(outcome) => outcome.status,
                    Err(e) => {
                        warn!(provider_reference = %reference, error = %e, "could not persist provider status");
                        self.sync.cache_provider_status(&intent).await;
                        intent.status.clone()
                    }
                };
                Ok(StatusResponse::new(
                    internal_id,
                    &intent.reference_id,
                    &effective,
                    intent.amount,
                    &intent.currency,
                    source,
                ))
            }
            Err(e) => {
                warn!(provider_reference = %reference, error = %e, "provider status lookup failed");

                let mut response = if let Some(row) = &row {
                    StatusResponse::from_record(row, StatusSource::Database)
                } else if let Some(hit) = &cached {
                    let mut response = StatusResponse::new(
                        internal_id,
                        reference,
                        &hit.status,
                        hit.amount,
                        &hit.currency,
                        StatusSource::Cache,
                    );
                    response.cached = true;
                    response
                } else if let Some(snapshot) = &snapshot {
                    let mut response = StatusResponse::new(
                        Some(snapshot.internal_id.clone()),
                        reference,
                        &snapshot.status,
                        snapshot.amount,
                        &snapshot.currency,
                        StatusSource::Cache,
                    );
                    response.cached = true;
                    response
                } else if matches!(e, PaymentError::NotFoundError { .. }) {
                    return Err(ReconciliationError::NotFound(reference.to_string()));
                } else {
                    return Err(ReconciliationError::ProviderUnavailable(e));
                };

                response.stale = true;
                response.message = Some(STALE_MESSAGE.to_string());
                Ok(response)
            }
        }
    }

    async fn fetch_intent(&self, reference: &str) -> Result<IntentSnapshot, PaymentError> {
        with_timeout(
            self.config.provider_timeout,
            "get_intent",
            self.backends.gateway.get_intent(reference),
        )
        .await
    }

    async fn load_row(&self, reference: &str) -> Option<PaymentRecord> {
        let store = self.backends.store.as_ref()?;
        match store.find_by_reference(reference).await {
            Ok(row) => row,
            Err(e) => {
                warn!(provider_reference = %reference, error = %e, "database lookup failed");
                None
            }
        }
    }

    async fn refresh_provider_status(&self, row: &PaymentRecord) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        let snapshot = ProviderStatusSnapshot {
            provider_reference: row.provider_reference.clone(),
            status: row.status.clone(),
            amount: row.amount,
            currency: row.currency.clone(),
            cached_at: Utc::now(),
        };
        cache_write(
            cache
                .set_provider_status(&snapshot, status::ttl_for(&row.status))
                .await,
            "set_provider_status",
            &row.provider_reference,
        );
    }

    /// Peek, not take: the notice stays for the dedicated change endpoint.
    async fn attach_pending_change(&self, response: &mut StatusResponse) {
        let Some(cache) = &self.backends.cache else {
            return;
        };
        if let Some(event) = cache_hit(
            cache.peek_status_change(&response.provider_reference).await,
            "peek_status_change",
            &response.provider_reference,
        ) {
            response.status_changed = Some(true);
            response.new_status = Some(event.new_status);
            response.status_changed_at = Some(event.changed_at);
            response.message = Some(STATUS_CHANGED_MESSAGE.to_string());
        }
    }

    fn is_fresh(&self, row: &PaymentRecord) -> bool {
        match Utc::now().signed_duration_since(row.updated_at).to_std() {
            Ok(age) => age <= self.config.fresh_row_window,
            // updated_at in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }

    fn schedule_revalidation(&self, provider_reference: &str, served: &str) {
        let engine = self.clone();
        let reference = provider_reference.to_string();
        let served = served.to_string();
        self.pool.spawn("revalidate", async move {
            engine.revalidate(&reference, Some(&served)).await;
        });
    }
}
