//! In-memory stand-ins for Postgres, Redis and Stripe shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_backend::cache::payment_cache::{
    PaymentSnapshot, ProviderStatusSnapshot, StatusChangeEvent,
};
use payflow_backend::cache::{CacheError, CacheResult, PaymentCache};
use payflow_backend::config::PricingConfig;
use payflow_backend::database::{
    DatabaseError, NewPayment, PaymentRecord, PaymentStore, StatusUpdate, UserPaymentAggregate,
};
use payflow_backend::payments::providers::stripe::parse_event;
use payflow_backend::payments::status::{self, Transition};
use payflow_backend::payments::types::{
    CreateIntentRequest, CreatedIntent, IntentSnapshot, RefundRequest, RefundResult,
    WebhookEvent, WebhookVerificationResult,
};
use payflow_backend::payments::utils::{sign_payload, verify_stripe_signature};
use payflow_backend::payments::{PaymentError, PaymentGateway, PaymentResult};
use payflow_backend::services::{
    PaymentBackends, PaymentCreationService, PaymentOperations, ReconciliationConfig,
    ReconciliationEngine, StatusSynchronizer, WebhookProcessor,
};
use payflow_backend::workers::RevalidationPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Provider references in the shape Stripe issues them.
pub fn intent_id(n: u32) -> String {
    format!("pi_3MtwBwLkdIwHu7ix{:08}", n)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockGateway {
    intents: Mutex<HashMap<String, IntentSnapshot>>,
    by_idempotency_key: Mutex<HashMap<String, String>>,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            ..Default::default()
        }
    }

    pub fn put_intent(&self, reference: &str, status: &str) {
        let mut intents = self.intents.lock().unwrap();
        intents.insert(
            reference.to_string(),
            IntentSnapshot {
                reference_id: reference.to_string(),
                status: status.to_string(),
                amount: 5900,
                currency: "hkd".to_string(),
                client_secret: Some(format!("{}_secret_test", reference)),
                metadata: BTreeMap::new(),
            },
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn maybe_fail(&self, operation: &str) -> PaymentResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PaymentError::NetworkError {
                message: format!("{}: connection refused", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock-stripe"
    }

    async fn create_intent(&self, request: CreateIntentRequest) -> PaymentResult<CreatedIntent> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.maybe_fail("create_intent").await?;

        let existing = request
            .idempotency_key
            .as_ref()
            .and_then(|key| self.by_idempotency_key.lock().unwrap().get(key).cloned());
        let reference = match existing {
            Some(reference) => reference,
            None => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) as u32;
                let reference = intent_id(n);
                if let Some(key) = &request.idempotency_key {
                    self.by_idempotency_key
                        .lock()
                        .unwrap()
                        .insert(key.clone(), reference.clone());
                }
                self.put_intent(&reference, status::REQUIRES_PAYMENT_METHOD);
                reference
            }
        };

        let intent = self.intents.lock().unwrap()[&reference].clone();
        Ok(CreatedIntent {
            reference_id: intent.reference_id,
            client_secret: intent.client_secret,
            status: intent.status,
            amount: request.amount,
            currency: request.currency,
        })
    }

    async fn get_intent(&self, reference_id: &str) -> PaymentResult<IntentSnapshot> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail("get_intent").await?;
        self.intents
            .lock()
            .unwrap()
            .get(reference_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFoundError {
                reference: reference_id.to_string(),
            })
    }

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundResult> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail("refund").await?;
        Ok(RefundResult {
            refund_id: "re_test".to_string(),
            status: "succeeded".to_string(),
            amount: request.amount.unwrap_or(5900),
            currency: "hkd".to_string(),
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let now = Utc::now().timestamp();
        Ok(
            match verify_stripe_signature(payload, signature, WEBHOOK_SECRET, now) {
                Ok(()) => WebhookVerificationResult {
                    valid: true,
                    reason: None,
                },
                Err(reason) => WebhookVerificationResult {
                    valid: false,
                    reason: Some(reason),
                },
            },
        )
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        parse_event(payload)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<PaymentRecord>>,
    pub status_writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a row directly, bypassing uniqueness checks.
    pub fn seed(
        &self,
        user_id: &str,
        reference: &str,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> PaymentRecord {
        let mut rows = self.rows.lock().unwrap();
        let record = PaymentRecord {
            id: rows.len() as i64 + 1,
            internal_id: Uuid::new_v4(),
            provider_reference: reference.to_string(),
            idempotency_key: None,
            user_id: user_id.to_string(),
            amount: 5900,
            currency: "hkd".to_string(),
            status: status.to_string(),
            payment_method: "card".to_string(),
            description: "Premium access".to_string(),
            metadata: serde_json::json!({}),
            created_at: updated_at,
            updated_at,
        };
        rows.push(record.clone());
        record
    }

    pub fn row(&self, reference: &str) -> Option<PaymentRecord> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.provider_reference == reference)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DatabaseError::connection("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert(&self, payment: &NewPayment) -> Result<PaymentRecord, DatabaseError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|r| r.provider_reference == payment.provider_reference)
        {
            return Err(DatabaseError::unique_violation(
                "payments_provider_reference_key",
            ));
        }
        if let Some(key) = &payment.idempotency_key {
            if rows
                .iter()
                .any(|r| r.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Err(DatabaseError::unique_violation(
                    "payments_idempotency_key_key",
                ));
            }
        }

        let now = Utc::now();
        let record = PaymentRecord {
            id: rows.len() as i64 + 1,
            internal_id: payment.internal_id,
            provider_reference: payment.provider_reference.clone(),
            idempotency_key: payment.idempotency_key.clone(),
            user_id: payment.user_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            status: payment.status.clone(),
            payment_method: payment.payment_method.clone(),
            description: payment.description.clone(),
            metadata: payment.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn find_by_internal_id(
        &self,
        internal_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.internal_id.to_string() == internal_id)
            .cloned())
    }

    async fn find_by_reference(
        &self,
        provider_reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.check()?;
        Ok(self.row(provider_reference))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn update_status(
        &self,
        provider_reference: &str,
        new_status: &str,
    ) -> Result<StatusUpdate, DatabaseError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .iter_mut()
            .find(|r| r.provider_reference == provider_reference)
        else {
            return Ok(StatusUpdate::Missing);
        };

        Ok(match status::transition(&row.status, new_status) {
            Transition::Apply => {
                let previous = std::mem::replace(&mut row.status, new_status.to_string());
                row.updated_at = Utc::now();
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                StatusUpdate::Applied {
                    previous,
                    record: row.clone(),
                }
            }
            Transition::Unchanged => StatusUpdate::Unchanged {
                record: row.clone(),
            },
            Transition::Rejected => StatusUpdate::Rejected {
                record: row.clone(),
            },
        })
    }

    async fn user_aggregate(&self, user_id: &str) -> Result<UserPaymentAggregate, DatabaseError> {
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(UserPaymentAggregate::from_succeeded(
            user_id,
            rows.iter()
                .filter(|r| r.user_id == user_id && r.status == status::SUCCEEDED)
                .map(|r| (r.amount, r.created_at)),
        ))
    }

    async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<PaymentRecord>, DatabaseError> {
        self.check()?;
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCache {
    payments: Mutex<HashMap<String, PaymentSnapshot>>,
    references: Mutex<HashMap<String, PaymentSnapshot>>,
    provider_status: Mutex<HashMap<String, ProviderStatusSnapshot>>,
    changes: Mutex<HashMap<String, StatusChangeEvent>>,
    events: Mutex<HashMap<String, Duration>>,
    aggregates: Mutex<HashMap<String, UserPaymentAggregate>>,
    /// Every TTL written, keyed by operation name.
    pub ttls: Mutex<Vec<(&'static str, Duration)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn put_provider_status(&self, reference: &str, status: &str) {
        self.provider_status.lock().unwrap().insert(
            reference.to_string(),
            ProviderStatusSnapshot {
                provider_reference: reference.to_string(),
                status: status.to_string(),
                amount: 5900,
                currency: "hkd".to_string(),
                cached_at: Utc::now(),
            },
        );
    }

    pub fn provider_status(&self, reference: &str) -> Option<String> {
        self.provider_status
            .lock()
            .unwrap()
            .get(reference)
            .map(|s| s.status.clone())
    }

    pub fn payment(&self, internal_id: &str) -> Option<PaymentSnapshot> {
        self.payments.lock().unwrap().get(internal_id).cloned()
    }

    pub fn pending_change(&self, reference: &str) -> Option<StatusChangeEvent> {
        self.changes.lock().unwrap().get(reference).cloned()
    }

    pub fn is_claimed(&self, event_id: &str) -> bool {
        self.events.lock().unwrap().contains_key(event_id)
    }

    pub fn put_aggregate(&self, aggregate: UserPaymentAggregate) {
        self.aggregates
            .lock()
            .unwrap()
            .insert(aggregate.user_id.clone(), aggregate);
    }

    pub fn aggregate(&self, user_id: &str) -> Option<UserPaymentAggregate> {
        self.aggregates.lock().unwrap().get(user_id).cloned()
    }

    pub fn ttl_for(&self, operation: &str) -> Option<Duration> {
        self.ttls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(op, _)| *op == operation)
            .map(|(_, ttl)| *ttl)
    }

    fn check(&self) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::ConnectionError("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn record_ttl(&self, operation: &'static str, ttl: Duration) -> CacheResult<()> {
        if ttl.is_zero() {
            return Err(CacheError::TtlError(format!("{} without TTL", operation)));
        }
        self.ttls.lock().unwrap().push((operation, ttl));
        Ok(())
    }
}

#[async_trait]
impl PaymentCache for MemoryCache {
    async fn get_payment(&self, internal_id: &str) -> CacheResult<Option<PaymentSnapshot>> {
        self.check()?;
        Ok(self.payment(internal_id))
    }

    async fn get_payment_by_reference(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<PaymentSnapshot>> {
        self.check()?;
        Ok(self
            .references
            .lock()
            .unwrap()
            .get(provider_reference)
            .cloned())
    }

    async fn set_payment(&self, snapshot: &PaymentSnapshot, ttl: Duration) -> CacheResult<()> {
        self.check()?;
        self.record_ttl("set_payment", ttl)?;
        self.payments
            .lock()
            .unwrap()
            .insert(snapshot.internal_id.clone(), snapshot.clone());
        self.references
            .lock()
            .unwrap()
            .insert(snapshot.provider_reference.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_provider_status(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<ProviderStatusSnapshot>> {
        self.check()?;
        Ok(self
            .provider_status
            .lock()
            .unwrap()
            .get(provider_reference)
            .cloned())
    }

    async fn set_provider_status(
        &self,
        snapshot: &ProviderStatusSnapshot,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.check()?;
        self.record_ttl("set_provider_status", ttl)?;
        self.provider_status
            .lock()
            .unwrap()
            .insert(snapshot.provider_reference.clone(), snapshot.clone());
        Ok(())
    }

    async fn record_status_change(
        &self,
        provider_reference: &str,
        event: &StatusChangeEvent,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.check()?;
        self.record_ttl("record_status_change", ttl)?;
        self.changes
            .lock()
            .unwrap()
            .insert(provider_reference.to_string(), event.clone());
        Ok(())
    }

    async fn peek_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>> {
        self.check()?;
        Ok(self.pending_change(provider_reference))
    }

    async fn take_status_change(
        &self,
        provider_reference: &str,
    ) -> CacheResult<Option<StatusChangeEvent>> {
        self.check()?;
        Ok(self.changes.lock().unwrap().remove(provider_reference))
    }

    async fn claim_event(&self, event_id: &str, ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        self.record_ttl("claim_event", ttl)?;
        let mut events = self.events.lock().unwrap();
        if events.contains_key(event_id) {
            return Ok(false);
        }
        events.insert(event_id.to_string(), ttl);
        Ok(true)
    }

    async fn release_event(&self, event_id: &str) -> CacheResult<()> {
        self.check()?;
        self.events.lock().unwrap().remove(event_id);
        Ok(())
    }

    async fn get_user_aggregate(
        &self,
        user_id: &str,
    ) -> CacheResult<Option<UserPaymentAggregate>> {
        self.check()?;
        Ok(self.aggregate(user_id))
    }

    async fn set_user_aggregate(
        &self,
        aggregate: &UserPaymentAggregate,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.check()?;
        self.record_ttl("set_user_aggregate", ttl)?;
        self.put_aggregate(aggregate.clone());
        Ok(())
    }

    async fn invalidate_user(&self, user_id: &str) -> CacheResult<u64> {
        self.check()?;
        let removed = self.aggregates.lock().unwrap().remove(user_id).is_some();
        Ok(u64::from(removed))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub gateway: Arc<MockGateway>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub pool: RevalidationPool,
    pub sync: Arc<StatusSynchronizer>,
    pub engine: Arc<ReconciliationEngine>,
    pub creation: Arc<PaymentCreationService>,
    pub operations: Arc<PaymentOperations>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl Harness {
    /// Store, cache and provider all present.
    pub fn new() -> Self {
        Self::build(true, true, ReconciliationConfig::default())
    }

    pub fn build(with_store: bool, with_cache: bool, config: ReconciliationConfig) -> Self {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());

        let backends = PaymentBackends::new(
            with_store.then(|| store.clone() as Arc<dyn PaymentStore>),
            with_cache.then(|| cache.clone() as Arc<dyn PaymentCache>),
            gateway.clone() as Arc<dyn PaymentGateway>,
        );
        let pool = RevalidationPool::new(config.max_in_flight);
        let sync = Arc::new(StatusSynchronizer::new(backends.clone(), config.payment_ttl));

        let engine = Arc::new(ReconciliationEngine::new(
            backends.clone(),
            sync.clone(),
            pool.clone(),
            config.clone(),
        ));
        let creation = Arc::new(PaymentCreationService::new(
            backends.clone(),
            PricingConfig::default(),
            pool.clone(),
            config.provider_timeout,
            config.payment_ttl,
            config.user_ttl,
        ));
        let operations = Arc::new(PaymentOperations::new(
            backends.clone(),
            sync.clone(),
            config.provider_timeout,
            config.user_ttl,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(backends, sync.clone()));

        Self {
            gateway,
            store,
            cache,
            pool,
            sync,
            engine,
            creation,
            operations,
            webhooks,
        }
    }
}

/// A Stripe `payment_intent.*` event body.
pub fn intent_event(event_id: &str, event_type: &str, reference: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "data": {
            "object": {
                "id": reference,
                "object": "payment_intent",
                "amount": 5900,
                "currency": "hkd",
                "status": status,
                "metadata": { "user_id": "user-1" }
            }
        }
    })
    .to_string()
    .into_bytes()
}

pub fn sign(payload: &[u8]) -> String {
    sign_payload(payload, WEBHOOK_SECRET, Utc::now().timestamp())
}
