use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Tolerance for webhook timestamps, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    /// Send a form-encoded request and decode the JSON answer.
    ///
    /// 429 and 5xx are retried with exponential backoff. Connection errors are
    /// retried as well.
    pub async fn request_form<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: &str,
        form: &[(String, String)],
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let body = encode_form(form);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let mut request = self
                .client
                .request(method.clone(), url)
                .timeout(self.timeout)
                .bearer_auth(bearer_token);

            for (k, v) in additional_headers {
                request = request.header(*k, *v);
            }
            if !form.is_empty() {
                request = request
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(body.clone());
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    PaymentError::TimeoutError {
                        operation: url.to_string(),
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    PaymentError::NetworkError {
                        message: format!("provider request failed: {}", e),
                    }
                }
            });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: "stripe".to_string(),
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(retry_backoff(attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: "provider rate limit exceeded".to_string(),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "provider server error, retrying"
                        );
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }

                    return Err(map_error_response(status.as_u16(), &text, url));
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "provider request failed".to_string(),
        }))
    }
}

fn map_error_response(status: u16, text: &str, url: &str) -> PaymentError {
    let body = serde_json::from_str::<ErrorEnvelope>(text).ok().map(|e| e.error);
    let message = body
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let code = body
        .as_ref()
        .and_then(|b| b.code.clone().or_else(|| b.kind.clone()));

    match status {
        404 => PaymentError::NotFoundError {
            reference: url.rsplit('/').next().unwrap_or(url).to_string(),
        },
        401 | 403 => PaymentError::AuthenticationError { message },
        400 | 402 => PaymentError::ValidationError {
            message,
            field: None,
        },
        _ => PaymentError::ProviderError {
            provider: "stripe".to_string(),
            message,
            provider_code: code.or_else(|| Some(status.to_string())),
            retryable: status >= 500,
        },
    }
}

/// `application/x-www-form-urlencoded` body from ordered pairs.
pub fn encode_form(pairs: &[(String, String)]) -> String {
    let mut url = match reqwest::Url::parse("http://form.local/") {
        Ok(url) => url,
        Err(_) => return String::new(),
    };
    url.query_pairs_mut()
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    url.query().unwrap_or_default().to_string()
}

fn hmac_sha256_hex(secret: &str, message: &[u8]) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Build a `t=<ts>,v1=<hex>` header for `payload`.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let digest = hmac_sha256_hex(secret, &signed).unwrap_or_default();
    format!("t={},v1={}", timestamp, digest)
}

/// Exponential backoff between provider retries, capped at 32s.
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(MAX_BACKOFF_SHIFT))
}

/// Check a `t=<ts>,v1=<hex>[,v1=...]` header against the raw body.
pub fn verify_stripe_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), String> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or("missing timestamp")?;
    if candidates.is_empty() {
        return Err("missing v1 signature".to_string());
    }
    let skew = now.checked_sub(timestamp).and_then(i64::checked_abs);
    if !matches!(skew, Some(skew) if skew <= SIGNATURE_TOLERANCE_SECS) {
        return Err("timestamp outside tolerance".to_string());
    }

    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let expected = hmac_sha256_hex(secret, &signed).ok_or("invalid secret")?;

    if candidates
        .iter()
        .any(|sig| secure_eq(expected.as_bytes(), sig.as_bytes()))
    {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn signed_payload_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        assert!(verify_stripe_signature(payload, &header, SECRET, 1_700_000_100).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign_payload(br#"{"id":"evt_1"}"#, SECRET, 1_700_000_000);
        let err = verify_stripe_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000)
            .unwrap_err();
        assert_eq!(err, "signature mismatch");
    }

    #[test]
    fn old_timestamp_is_rejected() {
        let payload = b"{}";
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        assert!(verify_stripe_signature(payload, &header, SECRET, 1_700_000_301).is_err());
    }

    #[test]
    fn extreme_timestamps_are_outside_tolerance() {
        let payload = b"{}";
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1={}", t, "00".repeat(32));
            let err = verify_stripe_signature(payload, &header, SECRET, 1_700_000_000).unwrap_err();
            assert_eq!(err, "timestamp outside tolerance");
        }
        let header = sign_payload(payload, SECRET, 0);
        assert!(verify_stripe_signature(payload, &header, SECRET, i64::MIN).is_err());
    }

    #[test]
    fn retry_backoff_is_capped() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(64), Duration::from_secs(32));
        assert_eq!(retry_backoff(u32::MAX), Duration::from_secs(32));
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(verify_stripe_signature(b"{}", "garbage", SECRET, 0).is_err());
        assert!(verify_stripe_signature(b"{}", "t=1", SECRET, 1).is_err());
    }

    #[test]
    fn form_encoding_escapes_reserved_characters() {
        let body = encode_form(&[
            ("metadata[description]".to_string(), "a b&c".to_string()),
            ("amount".to_string(), "5900".to_string()),
        ]);
        assert_eq!(body, "metadata%5Bdescription%5D=a+b%26c&amount=5900");
    }

    #[test]
    fn error_envelope_maps_to_typed_errors() {
        let not_found = map_error_response(
            404,
            r#"{"error":{"message":"No such payment_intent","code":"resource_missing"}}"#,
            "https://api.stripe.com/v1/payment_intents/pi_missing",
        );
        assert!(matches!(
            not_found,
            PaymentError::NotFoundError { ref reference } if reference == "pi_missing"
        ));
        assert!(matches!(
            map_error_response(401, "{}", "x"),
            PaymentError::AuthenticationError { .. }
        ));
    }
}
