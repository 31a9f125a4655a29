use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{
    CreateIntentRequest, CreatedIntent, IntentSnapshot, RefundRequest, RefundResult,
    WebhookEvent, WebhookVerificationResult,
};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Outbound calls to the payment provider.
///
/// Implementations must be safe to share across tasks; the engine holds one
/// behind an `Arc<dyn PaymentGateway>`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_intent(&self, request: CreateIntentRequest) -> PaymentResult<CreatedIntent>;

    async fn get_intent(&self, reference_id: &str) -> PaymentResult<IntentSnapshot>;

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundResult>;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult>;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

/// Bound a provider call; expiry becomes a retryable `TimeoutError`.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, call: F) -> PaymentResult<T>
where
    F: Future<Output = PaymentResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PaymentError::TimeoutError {
            operation: operation.to_string(),
            timeout_secs: limit.as_secs(),
        }),
    }
}
