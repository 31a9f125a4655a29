use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CreateIntentRequest, CreatedIntent, IntentSnapshot, PaymentMethod, RefundRequest,
    RefundResult, WebhookEvent, WebhookVerificationResult,
};
use crate::payments::utils::{verify_stripe_signature, PaymentHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            base_url: "https://api.stripe.com/v1".to_string(),
            timeout_secs: 10,
            max_retries: 2,
        }
    }
}

impl StripeConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").map_err(|_| PaymentError::ValidationError {
                message: "STRIPE_SECRET_KEY environment variable is required".to_string(),
                field: Some("STRIPE_SECRET_KEY".to_string()),
            })?;
        let webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| PaymentError::ValidationError {
                message: "STRIPE_WEBHOOK_SECRET environment variable is required".to_string(),
                field: Some("STRIPE_WEBHOOK_SECRET".to_string()),
            })?;

        Ok(Self {
            base_url: std::env::var("STRIPE_BASE_URL")
                .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
            timeout_secs: std::env::var("STRIPE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10),
            max_retries: std::env::var("STRIPE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
            secret_key,
            webhook_secret,
        })
    }
}

pub struct StripeProvider {
    config: StripeConfig,
    http: PaymentHttpClient,
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> PaymentResult<Self> {
        let http =
            PaymentHttpClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn intent_form(request: &CreateIntentRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
        ];

        match &request.method {
            PaymentMethod::Card => {
                form.push((
                    "automatic_payment_methods[enabled]".to_string(),
                    "true".to_string(),
                ));
            }
            PaymentMethod::WechatPay { client } => {
                form.push(("payment_method_types[]".to_string(), "wechat_pay".to_string()));
                form.push((
                    "payment_method_options[wechat_pay][client]".to_string(),
                    client.as_str().to_string(),
                ));
            }
            PaymentMethod::Alipay => {
                form.push(("payment_method_types[]".to_string(), "alipay".to_string()));
            }
        }

        for (key, value) in &request.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }
        if let Some(url) = request.return_url.as_deref().filter(|u| !u.is_empty()) {
            form.push(("metadata[return_url]".to_string(), url.to_string()));
        }

        form
    }
}

#[async_trait]
impl PaymentGateway for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_intent(&self, request: CreateIntentRequest) -> PaymentResult<CreatedIntent> {
        if request.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be positive".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let form = Self::intent_form(&request);
        let mut headers = Vec::new();
        if let Some(key) = request.idempotency_key.as_deref() {
            headers.push(("Idempotency-Key", key));
        }

        let raw: StripeIntent = self
            .http
            .request_form(
                reqwest::Method::POST,
                &self.endpoint("/payment_intents"),
                &self.config.secret_key,
                &form,
                &headers,
            )
            .await?;

        info!(
            provider_reference = %raw.id,
            method = %request.method,
            status = %raw.status,
            "stripe payment intent created"
        );

        Ok(CreatedIntent {
            reference_id: raw.id,
            client_secret: raw.client_secret,
            status: raw.status,
            amount: raw.amount,
            currency: raw.currency,
        })
    }

    async fn get_intent(&self, reference_id: &str) -> PaymentResult<IntentSnapshot> {
        if reference_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "payment intent id is required".to_string(),
                field: Some("payment_intent_id".to_string()),
            });
        }

        let raw: StripeIntent = self
            .http
            .request_form(
                reqwest::Method::GET,
                &self.endpoint(&format!("/payment_intents/{}", reference_id)),
                &self.config.secret_key,
                &[],
                &[],
            )
            .await?;
        debug!(provider_reference = %raw.id, status = %raw.status, "stripe intent fetched");

        Ok(raw.into_snapshot())
    }

    async fn refund(&self, request: RefundRequest) -> PaymentResult<RefundResult> {
        let mut form = vec![("payment_intent".to_string(), request.reference_id.clone())];
        if let Some(amount) = request.amount {
            form.push(("amount".to_string(), amount.to_string()));
        }
        if let Some(reason) = request.reason {
            form.push(("reason".to_string(), reason.as_str().to_string()));
        }

        let raw: StripeRefund = self
            .http
            .request_form(
                reqwest::Method::POST,
                &self.endpoint("/refunds"),
                &self.config.secret_key,
                &form,
                &[],
            )
            .await?;

        info!(
            provider_reference = %request.reference_id,
            refund_id = %raw.id,
            amount = raw.amount,
            "stripe refund created"
        );

        Ok(RefundResult {
            refund_id: raw.id,
            status: raw.status.unwrap_or_else(|| "pending".to_string()),
            amount: raw.amount,
            currency: raw.currency,
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<WebhookVerificationResult> {
        let now = chrono::Utc::now().timestamp();
        match verify_stripe_signature(payload, signature, &self.config.webhook_secret, now) {
            Ok(()) => Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            }),
            Err(reason) => Ok(WebhookVerificationResult {
                valid: false,
                reason: Some(reason),
            }),
        }
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        parse_event(payload)
    }
}

/// Decode a Stripe event envelope. The intent is extracted when the event's
/// object is a payment intent.
pub fn parse_event(payload: &[u8]) -> PaymentResult<WebhookEvent> {
    let parsed: JsonValue =
        serde_json::from_slice(payload).map_err(|e| PaymentError::WebhookVerificationError {
            message: format!("invalid webhook JSON payload: {}", e),
        })?;

    let id = parsed
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::WebhookVerificationError {
            message: "webhook event id is missing".to_string(),
        })?
        .to_string();
    let event_type = parsed
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let intent = parsed
        .get("data")
        .and_then(|d| d.get("object"))
        .filter(|o| o.get("object").and_then(|v| v.as_str()) == Some("payment_intent"))
        .and_then(|o| serde_json::from_value::<StripeIntent>(o.clone()).ok())
        .map(StripeIntent::into_snapshot);

    Ok(WebhookEvent {
        id,
        event_type,
        intent,
        payload: parsed,
        received_at: chrono::Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl StripeIntent {
    fn into_snapshot(self) -> IntentSnapshot {
        IntentSnapshot {
            reference_id: self.id,
            status: self.status,
            amount: self.amount,
            currency: self.currency,
            client_secret: self.client_secret,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::WechatClient;
    use crate::payments::utils::sign_payload;

    fn provider() -> StripeProvider {
        StripeProvider::new(StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            base_url: "https://api.stripe.com/v1".to_string(),
            timeout_secs: 5,
            max_retries: 1,
        })
        .expect("provider init should succeed")
    }

    #[test]
    fn webhook_signature_validation_invalid() {
        let provider = provider();
        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let result = provider
            .verify_webhook(payload, "t=1,v1=deadbeef")
            .expect("verification should not error");
        assert!(!result.valid);
    }

    #[test]
    fn webhook_signature_validation_valid() {
        let provider = provider();
        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let header = sign_payload(payload, "whsec_test", chrono::Utc::now().timestamp());
        assert!(provider.verify_webhook(payload, &header).unwrap().valid);
    }

    #[test]
    fn intent_events_carry_the_intent() {
        let payload = serde_json::json!({
            "id": "evt_123",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_123",
                "object": "payment_intent",
                "amount": 5900,
                "currency": "hkd",
                "status": "succeeded",
                "metadata": { "user_id": "u1", "payment_id": "abc" }
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.id, "evt_123");
        let intent = event.intent.expect("intent should be parsed");
        assert_eq!(intent.reference_id, "pi_123");
        assert_eq!(intent.metadata.get("user_id").map(String::as_str), Some("u1"));
    }

    #[test]
    fn non_intent_events_have_no_intent() {
        let payload = serde_json::json!({
            "id": "evt_9",
            "type": "charge.refunded",
            "data": { "object": { "id": "ch_1", "object": "charge" } }
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert!(event.intent.is_none());
        assert_eq!(event.event_type, "charge.refunded");
    }

    #[test]
    fn wechat_form_sets_method_type_and_client() {
        let form = StripeProvider::intent_form(&CreateIntentRequest {
            amount: 5900,
            currency: "HKD".to_string(),
            method: PaymentMethod::WechatPay {
                client: WechatClient::Web,
            },
            metadata: BTreeMap::from([("user_id".to_string(), "u1".to_string())]),
            idempotency_key: None,
            return_url: Some("https://example.com/done".to_string()),
        });

        assert!(form.contains(&("currency".to_string(), "hkd".to_string())));
        assert!(form.contains(&("payment_method_types[]".to_string(), "wechat_pay".to_string())));
        assert!(form.contains(&(
            "payment_method_options[wechat_pay][client]".to_string(),
            "web".to_string()
        )));
        assert!(form.contains(&("metadata[user_id]".to_string(), "u1".to_string())));
        assert!(form.contains(&(
            "metadata[return_url]".to_string(),
            "https://example.com/done".to_string()
        )));
    }
}
