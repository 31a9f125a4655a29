//! Tracing subscriber setup and log-safe formatting helpers.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `LOG_LEVEL` (default `info`) applies to
/// this crate and `warn` to dependencies. `LOG_FORMAT=json` switches to
/// one-JSON-object-per-line output.
pub fn init_tracing() {
    let level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase();
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    init_tracing_with(&level, format);
}

pub fn init_tracing_with(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,payflow_backend={level},tower_http={level}",
            level = level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Keep the first and last four characters of a secret.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Idempotency keys are client-chosen and may embed user data.
pub fn mask_idempotency_key(value: Option<&str>) -> String {
    match value {
        Some(key) if !key.is_empty() => mask_secret(key),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_secrets_are_fully_masked() {
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn long_secrets_keep_edges() {
        assert_eq!(mask_secret("sk_test_1234567890"), "sk_t…7890");
    }

    #[test]
    fn missing_idempotency_key_renders_dash() {
        assert_eq!(mask_idempotency_key(None), "-");
        assert_eq!(mask_idempotency_key(Some("")), "-");
        assert_eq!(mask_idempotency_key(Some("order-2026-0001")), "orde…0001");
    }
}
