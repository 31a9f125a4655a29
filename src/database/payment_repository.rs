use crate::database::error::DatabaseError;
use crate::payments::status;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "database")]
use crate::payments::status::Transition;
#[cfg(feature = "database")]
use sqlx::PgPool;
#[cfg(feature = "database")]
use tracing::warn;

/// Durable payment row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct PaymentRecord {
    #[serde(skip_serializing)]
    pub id: i64,
    pub internal_id: Uuid,
    pub provider_reference: String,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub internal_id: Uuid,
    pub provider_reference: String,
    pub idempotency_key: Option<String>,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

/// Per-user totals over succeeded payments. Always derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPaymentAggregate {
    pub user_id: String,
    pub has_paid: bool,
    pub total_payment_count: i64,
    pub total_payment_amount: i64,
    pub first_payment_at: Option<DateTime<Utc>>,
    pub last_payment_at: Option<DateTime<Utc>>,
}

impl UserPaymentAggregate {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            has_paid: false,
            total_payment_count: 0,
            total_payment_amount: 0,
            first_payment_at: None,
            last_payment_at: None,
        }
    }

    /// Build from the rows' `(amount, created_at)` pairs of succeeded payments.
    pub fn from_succeeded<I>(user_id: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = (i64, DateTime<Utc>)>,
    {
        let mut aggregate = Self::empty(user_id);
        for (amount, created_at) in rows {
            aggregate.total_payment_count += 1;
            aggregate.total_payment_amount += amount;
            aggregate.first_payment_at = Some(
                aggregate
                    .first_payment_at
                    .map_or(created_at, |first| first.min(created_at)),
            );
            aggregate.last_payment_at = Some(
                aggregate
                    .last_payment_at
                    .map_or(created_at, |last| last.max(created_at)),
            );
        }
        aggregate.has_paid = aggregate.total_payment_count > 0;
        aggregate
    }

    /// Whole days left in the eligibility window, or `None` once it has lapsed.
    pub fn days_remaining(&self, validity_days: i64, now: DateTime<Utc>) -> Option<i64> {
        if !self.has_paid {
            return None;
        }
        let last = self.last_payment_at?;
        let window = chrono::Duration::days(validity_days);
        let elapsed = now.signed_duration_since(last);
        if elapsed > window {
            return None;
        }
        Some((window - elapsed).num_days())
    }
}

/// Result of a guarded status write.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied { previous: String, record: PaymentRecord },
    Unchanged { record: PaymentRecord },
    /// The stored status is final; `record` holds it untouched.
    Rejected { record: PaymentRecord },
    Missing,
}

impl StatusUpdate {
    pub fn record(&self) -> Option<&PaymentRecord> {
        match self {
            StatusUpdate::Applied { record, .. }
            | StatusUpdate::Unchanged { record }
            | StatusUpdate::Rejected { record } => Some(record),
            StatusUpdate::Missing => None,
        }
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `UniqueViolation` when the reference or idempotency key exists.
    async fn insert(&self, payment: &NewPayment) -> Result<PaymentRecord, DatabaseError>;

    async fn find_by_internal_id(
        &self,
        internal_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_reference(
        &self,
        provider_reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;

    /// Atomic compare-and-swap governed by [`status::transition`].
    async fn update_status(
        &self,
        provider_reference: &str,
        new_status: &str,
    ) -> Result<StatusUpdate, DatabaseError>;

    async fn user_aggregate(&self, user_id: &str) -> Result<UserPaymentAggregate, DatabaseError>;

    /// Newest first.
    async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<PaymentRecord>, DatabaseError>;
}

#[cfg(feature = "database")]
const COLUMNS: &str = "id, internal_id, provider_reference, idempotency_key, user_id, amount, \
     currency, status, payment_method, description, metadata, created_at, updated_at";

/// Postgres-backed payment store.
#[cfg(feature = "database")]
pub struct PaymentRepository {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn insert(&self, payment: &NewPayment) -> Result<PaymentRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO payments (internal_id, provider_reference, idempotency_key, user_id, \
             amount, currency, status, payment_method, description, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {}",
            COLUMNS
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(payment.internal_id)
            .bind(&payment.provider_reference)
            .bind(payment.idempotency_key.as_deref().filter(|k| !k.is_empty()))
            .bind(&payment.user_id)
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(&payment.status)
            .bind(&payment.payment_method)
            .bind(&payment.description)
            .bind(&payment.metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_internal_id(
        &self,
        internal_id: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let Ok(uuid) = Uuid::parse_str(internal_id) else {
            return Ok(None);
        };
        let sql = format!("SELECT {} FROM payments WHERE internal_id = $1", COLUMNS);
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_reference(
        &self,
        provider_reference: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE provider_reference = $1",
            COLUMNS
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(provider_reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!("SELECT {} FROM payments WHERE idempotency_key = $1", COLUMNS);
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn update_status(
        &self,
        provider_reference: &str,
        new_status: &str,
    ) -> Result<StatusUpdate, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let select = format!(
            "SELECT {} FROM payments WHERE provider_reference = $1 FOR UPDATE",
            COLUMNS
        );
        let current = sqlx::query_as::<_, PaymentRecord>(&select)
            .bind(provider_reference)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let Some(current) = current else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(StatusUpdate::Missing);
        };

        match status::transition(&current.status, new_status) {
            Transition::Unchanged => {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                Ok(StatusUpdate::Unchanged { record: current })
            }
            Transition::Rejected => {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                warn!(
                    provider_reference = %provider_reference,
                    current = %current.status,
                    attempted = %new_status,
                    "refusing to overwrite final payment status"
                );
                Ok(StatusUpdate::Rejected { record: current })
            }
            Transition::Apply => {
                let update = format!(
                    "UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
                    COLUMNS
                );
                let record = sqlx::query_as::<_, PaymentRecord>(&update)
                    .bind(current.id)
                    .bind(new_status)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;
                tx.commit().await.map_err(DatabaseError::from_sqlx)?;
                Ok(StatusUpdate::Applied {
                    previous: current.status,
                    record,
                })
            }
        }
    }

    async fn user_aggregate(&self, user_id: &str) -> Result<UserPaymentAggregate, DatabaseError> {
        let (count, amount, first, last): (i64, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(amount), 0)::BIGINT, MIN(created_at), MAX(created_at) \
                 FROM payments WHERE user_id = $1 AND status = 'succeeded'",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(UserPaymentAggregate {
            user_id: user_id.to_string(),
            has_paid: count > 0,
            total_payment_count: count,
            total_payment_amount: amount,
            first_payment_at: first,
            last_payment_at: last,
        })
    }

    async fn history(&self, user_id: &str, limit: i64) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            COLUMNS
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }
}
