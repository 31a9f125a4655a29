//! Services module for business logic

pub mod payment_creation;
pub mod payment_operations;
pub mod reconciliation;
pub mod status_sync;
pub mod webhook_processor;

use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheResult, PaymentCache};
use crate::database::PaymentStore;
use crate::payments::PaymentGateway;

pub use payment_creation::{CreationOutcome, PaymentCreationService};
pub use payment_operations::PaymentOperations;
pub use reconciliation::{ReconciliationConfig, ReconciliationEngine, StatusResponse, StatusSource};
pub use status_sync::{StatusSynchronizer, SyncOutcome};
pub use webhook_processor::{WebhookAck, WebhookProcessor, WebhookProcessorError};

/// Handles to the three places payment state lives.
///
/// Either store may be absent: the service keeps answering from whatever is
/// left plus the provider.
#[derive(Clone)]
pub struct PaymentBackends {
    pub store: Option<Arc<dyn PaymentStore>>,
    pub cache: Option<Arc<dyn PaymentCache>>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl PaymentBackends {
    pub fn new(
        store: Option<Arc<dyn PaymentStore>>,
        cache: Option<Arc<dyn PaymentCache>>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            store,
            cache,
            gateway,
        }
    }
}

/// Collapse a cache read: errors are logged and read as a miss.
pub(crate) fn cache_hit<T>(result: CacheResult<Option<T>>, operation: &str, key: &str) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(operation, key, error = %e, "cache read failed, treating as miss");
            None
        }
    }
}

/// Cache writes never fail a request.
pub(crate) fn cache_write<T>(result: CacheResult<T>, operation: &str, key: &str) {
    if let Err(e) = result {
        warn!(operation, key, error = %e, "cache write failed");
    }
}
