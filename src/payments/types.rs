use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Identifier supplied to a status query, resolved once at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    /// Opaque id minted by this service at creation time.
    InternalId(String),
    /// The provider's id for the payment intent.
    ProviderReference(String),
}

impl LookupKey {
    /// Classify a raw path segment by the provider's reference prefix.
    pub fn infer(raw: &str, provider_prefix: &str) -> Self {
        let raw = raw.trim();
        if !provider_prefix.is_empty() && raw.starts_with(provider_prefix) {
            LookupKey::ProviderReference(raw.to_string())
        } else {
            LookupKey::InternalId(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LookupKey::InternalId(id) | LookupKey::ProviderReference(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LookupKey::InternalId(_) => "internal_id",
            LookupKey::ProviderReference(_) => "provider_reference",
        }
    }
}

impl std::fmt::Display for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WechatClient {
    #[default]
    Web,
    Mobile,
}

impl WechatClient {
    pub fn as_str(&self) -> &'static str {
        match self {
            WechatClient::Web => "web",
            WechatClient::Mobile => "mobile",
        }
    }
}

impl FromStr for WechatClient {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "web" => Ok(WechatClient::Web),
            "mobile" => Ok(WechatClient::Mobile),
            other => Err(PaymentError::ValidationError {
                message: format!("client must be 'web' or 'mobile', got '{}'", other),
                field: Some("client".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card with automatic payment methods, which covers Apple Pay.
    Card,
    WechatPay { client: WechatClient },
    Alipay,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::WechatPay { .. } => "wechat_pay",
            PaymentMethod::Alipay => "alipay",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
            RefundReason::RequestedByCustomer => "requested_by_customer",
        }
    }
}

impl FromStr for RefundReason {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "duplicate" => Ok(RefundReason::Duplicate),
            "fraudulent" => Ok(RefundReason::Fraudulent),
            "requested_by_customer" => Ok(RefundReason::RequestedByCustomer),
            other => Err(PaymentError::ValidationError {
                message: format!("unsupported refund reason: {}", other),
                field: Some("reason".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub metadata: BTreeMap<String, String>,
    /// Forwarded to the provider so a retried creation maps to one intent.
    pub idempotency_key: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedIntent {
    pub reference_id: String,
    pub client_secret: Option<String>,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentSnapshot {
    pub reference_id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub reference_id: String,
    pub amount: Option<i64>,
    pub reason: Option<RefundReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Provider notification after signature verification and parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    /// Present when the event's object is a payment intent.
    pub intent: Option<IntentSnapshot>,
    pub payload: JsonValue,
    pub received_at: chrono::DateTime<chrono::Utc>,
}
