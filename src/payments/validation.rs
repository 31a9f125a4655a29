//! Input predicates applied at the HTTP boundary.

use crate::payments::error::{PaymentError, PaymentResult};
use regex::Regex;
use std::sync::OnceLock;

pub const MIN_USER_ID_LENGTH: usize = 1;
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
pub const MAX_URL_LENGTH: usize = 2048;
pub const MIN_AMOUNT: i64 = 1;
pub const MAX_AMOUNT: i64 = 10_000_000;

pub const ALLOWED_CURRENCIES: [&str; 6] = ["hkd", "usd", "cny", "eur", "gbp", "jpy"];
/// Currencies whose amounts carry no minor unit.
pub const ZERO_DECIMAL_CURRENCIES: [&str; 1] = ["jpy"];
pub const ALLOWED_CLIENTS: [&str; 2] = ["web", "mobile"];
pub const ALLOWED_REFUND_REASONS: [&str; 3] = ["duplicate", "fraudulent", "requested_by_customer"];
/// Statuses a client may report through the status sync endpoint.
pub const ALLOWED_CLIENT_STATUSES: [&str; 5] =
    ["succeeded", "failed", "canceled", "pending", "processing"];

const DANGEROUS_FRAGMENTS: [&str; 5] = [
    "<script",
    "javascript:",
    "onerror=",
    "onload=",
    "onclick=",
];

static USER_ID_PATTERN: OnceLock<Regex> = OnceLock::new();
static INTENT_ID_PATTERN: OnceLock<Regex> = OnceLock::new();

fn user_id_pattern() -> &'static Regex {
    USER_ID_PATTERN.get_or_init(|| Regex::new(r"^[\p{L}\p{N}._-]+$").expect("valid regex"))
}

fn intent_id_pattern() -> &'static Regex {
    INTENT_ID_PATTERN.get_or_init(|| Regex::new(r"^pi_[A-Za-z0-9]{24}$").expect("valid regex"))
}

fn invalid(field: &str, message: impl Into<String>) -> PaymentError {
    PaymentError::ValidationError {
        message: message.into(),
        field: Some(field.to_string()),
    }
}

pub fn validate_user_id(user_id: &str) -> PaymentResult<()> {
    if user_id.is_empty() {
        return Err(invalid("user_id", "user_id is required"));
    }
    let length = user_id.chars().count();
    if !(MIN_USER_ID_LENGTH..=MAX_USER_ID_LENGTH).contains(&length) {
        return Err(invalid(
            "user_id",
            format!(
                "user_id length must be between {} and {} characters",
                MIN_USER_ID_LENGTH, MAX_USER_ID_LENGTH
            ),
        ));
    }
    if !user_id_pattern().is_match(user_id) {
        return Err(invalid(
            "user_id",
            "user_id can only contain letters, numbers, underscores, dots, and hyphens",
        ));
    }
    Ok(())
}

/// Optional; empty passes.
pub fn validate_description(description: &str) -> PaymentResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(invalid(
            "description",
            format!(
                "description length must not exceed {} characters",
                MAX_DESCRIPTION_LENGTH
            ),
        ));
    }
    let lowered = description.to_lowercase();
    if DANGEROUS_FRAGMENTS.iter().any(|f| lowered.contains(f)) {
        return Err(invalid(
            "description",
            "description contains potentially dangerous content",
        ));
    }
    Ok(())
}

/// Optional; empty passes. Only absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> PaymentResult<()> {
    if url.is_empty() {
        return Ok(());
    }
    if url.len() > MAX_URL_LENGTH {
        return Err(invalid(
            "return_url",
            format!("URL length must not exceed {} characters", MAX_URL_LENGTH),
        ));
    }
    let parsed = reqwest::Url::parse(url).map_err(|_| invalid("return_url", "invalid URL format"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("return_url", "URL must use http or https scheme"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("return_url", "URL must have a valid host"));
    }
    Ok(())
}

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_lowercase().as_str())
}

pub fn validate_client(client: &str) -> PaymentResult<()> {
    let client = client.trim().to_lowercase();
    if client.is_empty() || ALLOWED_CLIENTS.contains(&client.as_str()) {
        Ok(())
    } else {
        Err(invalid("client", "client must be 'web' or 'mobile'"))
    }
}

pub fn validate_currency(currency: &str) -> PaymentResult<()> {
    if ALLOWED_CURRENCIES.contains(&currency.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(invalid(
            "currency",
            format!("unsupported currency: {}", currency),
        ))
    }
}

pub fn validate_amount(amount: i64) -> PaymentResult<()> {
    if (MIN_AMOUNT..=MAX_AMOUNT).contains(&amount) {
        Ok(())
    } else {
        Err(invalid(
            "amount",
            format!("amount must be between {} and {}", MIN_AMOUNT, MAX_AMOUNT),
        ))
    }
}

pub fn validate_refund_reason(reason: &str) -> PaymentResult<()> {
    if reason.is_empty() || ALLOWED_REFUND_REASONS.contains(&reason) {
        Ok(())
    } else {
        Err(invalid(
            "reason",
            "reason must be one of: duplicate, fraudulent, requested_by_customer",
        ))
    }
}

pub fn validate_payment_intent_id(id: &str) -> PaymentResult<()> {
    if id.is_empty() {
        return Err(invalid("payment_intent_id", "payment_intent_id is required"));
    }
    if !intent_id_pattern().is_match(id) {
        return Err(invalid(
            "payment_intent_id",
            "invalid payment_intent_id format",
        ));
    }
    Ok(())
}

pub fn validate_client_status(status: &str) -> PaymentResult<()> {
    if ALLOWED_CLIENT_STATUSES.contains(&status) {
        Ok(())
    } else {
        Err(invalid(
            "status",
            "status must be one of: succeeded, failed, canceled, pending, processing",
        ))
    }
}
