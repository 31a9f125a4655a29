//! Fixed-window request limiting.
//!
//! One counter per client and minute. Redis holds the counters when it is
//! reachable; otherwise a process-local map does, which is good enough for a
//! single instance.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::cache::keys::rate_limit::WindowKey;
use crate::error::{AppError, AppErrorKind, ExternalError};

#[cfg(feature = "cache")]
use crate::cache::RedisCache;
#[cfg(feature = "cache")]
use std::time::Duration;

pub const WINDOW_SECS: i64 = 60;

/// Provider callbacks are never throttled.
const WEBHOOK_PATH: &str = "/api/v1/stripe/webhook";

/// Endpoints that create or move money get the stricter budget.
const PAYMENT_PATHS: [&str; 8] = [
    "/api/v1/stripe/create-payment",
    "/api/v1/stripe/create-wechat-payment",
    "/api/v1/stripe/create-alipay-payment",
    "/api/v1/stripe/confirm-payment",
    "/api/v1/stripe/refund",
    "/api/v1/payment/update-status",
    "/api/v1/payment/status",
    "/api/v1/payment/status-change",
];

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_minute: u64,
    pub payment_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            payment_per_minute: 10,
        }
    }
}

impl RateLimitConfig {
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env::var("RATE_LIMIT_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enabled),
            per_minute: env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.per_minute),
            payment_per_minute: env::var("RATE_LIMIT_PAYMENT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.payment_per_minute),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Api,
    Payment,
}

impl RateLimitScope {
    pub fn for_path(path: &str) -> Self {
        let path = path.to_ascii_lowercase();
        if PAYMENT_PATHS.iter().any(|p| path.starts_with(p)) {
            RateLimitScope::Payment
        } else {
            RateLimitScope::Api
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::Api => "api",
            RateLimitScope::Payment => "payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Limited { retry_after: u64 },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    #[cfg(feature = "cache")]
    redis: Option<RedisCache>,
    local: Mutex<HashMap<String, (i64, u64)>>,
}

impl RateLimiter {
    /// Counts in process memory only.
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "cache")]
            redis: None,
            local: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(feature = "cache")]
    pub fn with_redis(config: RateLimitConfig, redis: Option<RedisCache>) -> Self {
        Self {
            config,
            redis,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn limit_for(&self, scope: RateLimitScope) -> u64 {
        match scope {
            RateLimitScope::Api => self.config.per_minute,
            RateLimitScope::Payment => self.config.payment_per_minute,
        }
    }

    /// Count one request for `client` at unix time `now` and decide.
    pub async fn check(&self, client: &str, scope: RateLimitScope, now: i64) -> RateDecision {
        let window = now.div_euclid(WINDOW_SECS);
        let key = WindowKey::new(client, scope.as_str(), window).to_string();
        let count = self.increment(&key, window).await;
        let limit = self.limit_for(scope);

        if count > limit {
            let retry_after = (WINDOW_SECS - now.rem_euclid(WINDOW_SECS)).max(1) as u64;
            RateDecision::Limited { retry_after }
        } else {
            RateDecision::Allowed {
                remaining: limit - count,
            }
        }
    }

    async fn increment(&self, key: &str, window: i64) -> u64 {
        #[cfg(feature = "cache")]
        if let Some(redis) = &self.redis {
            match redis
                .increment_window(key, Duration::from_secs((WINDOW_SECS * 2) as u64))
                .await
            {
                Ok(count) => return count,
                Err(e) => {
                    warn!(error = %e, "rate limit counter unavailable, counting locally");
                }
            }
        }

        self.increment_local(key, window)
    }

    fn increment_local(&self, key: &str, window: i64) -> u64 {
        let mut counters = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Keys embed the window, so anything older is dead weight.
        counters.retain(|_, (w, _)| *w >= window - 1);

        let entry = counters.entry(key.to_string()).or_insert((window, 0));
        entry.1 += 1;
        entry.1
    }
}

/// User id from `/api/v1/user/{id}/...` or `x-user-id`, else the first
/// `x-forwarded-for` hop, else `"unknown"`.
pub fn client_key(request: &Request) -> String {
    let path = request.uri().path();
    if let Some(rest) = path.strip_prefix("/api/v1/user/") {
        if let Some(user_id) = rest.split('/').next().filter(|s| !s.is_empty()) {
            return format!("user:{}", user_id);
        }
    }

    if let Some(user_id) = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return format!("user:{}", user_id);
    }

    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    format!("ip:{}", ip)
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !limiter.config.enabled || path.starts_with("/health") || path == WEBHOOK_PATH {
        return next.run(request).await;
    }

    let client = client_key(&request);
    let scope = RateLimitScope::for_path(request.uri().path());

    match limiter.check(&client, scope, Utc::now().timestamp()).await {
        RateDecision::Allowed { remaining } => {
            debug!(client = %client, scope = scope.as_str(), remaining, "rate limit ok");
            next.run(request).await
        }
        RateDecision::Limited { retry_after } => {
            warn!(client = %client, scope = scope.as_str(), "rate limit exceeded");
            let mut error = AppError::new(AppErrorKind::External(ExternalError::RateLimit {
                service: scope.as_str().to_string(),
                retry_after: Some(retry_after),
            }));
            if let Some(id) = crate::middleware::error::get_request_id_from_headers(request.headers())
            {
                error = error.with_request_id(id);
            }
            error.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(axum::body::Body::empty()).unwrap()
    }

    #[test]
    fn payment_paths_get_payment_scope() {
        assert_eq!(
            RateLimitScope::for_path("/api/v1/stripe/create-wechat-payment"),
            RateLimitScope::Payment
        );
        assert_eq!(
            RateLimitScope::for_path("/api/v1/payment/status/pi_123"),
            RateLimitScope::Payment
        );
        assert_eq!(RateLimitScope::for_path("/api/v1/pricing"), RateLimitScope::Api);
    }

    #[test]
    fn client_key_prefers_user_then_forwarded_ip() {
        let r = request("/api/v1/user/u-1/payment-info", &[("x-forwarded-for", "1.1.1.1")]);
        assert_eq!(client_key(&r), "user:u-1");

        let r = request("/api/v1/pricing", &[("x-forwarded-for", "10.0.0.1, 172.16.0.1")]);
        assert_eq!(client_key(&r), "ip:10.0.0.1");

        let r = request("/api/v1/pricing", &[]);
        assert_eq!(client_key(&r), "ip:unknown");
    }

    #[tokio::test]
    async fn local_counter_limits_within_window() {
        let limiter = RateLimiter::in_memory(RateLimitConfig {
            enabled: true,
            per_minute: 2,
            payment_per_minute: 1,
        });
        let now = 1_800_000_010;

        assert_eq!(
            limiter.check("ip:a", RateLimitScope::Api, now).await,
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check("ip:a", RateLimitScope::Api, now).await,
            RateDecision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check("ip:a", RateLimitScope::Api, now).await,
            RateDecision::Limited { retry_after: 50 }
        );

        // Other clients and the next window start fresh.
        assert!(matches!(
            limiter.check("ip:b", RateLimitScope::Api, now).await,
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("ip:a", RateLimitScope::Api, now + 60).await,
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn payment_scope_uses_stricter_limit() {
        let limiter = RateLimiter::in_memory(RateLimitConfig::default());
        let now = 1_800_000_000;
        for _ in 0..10 {
            assert!(matches!(
                limiter.check("user:u", RateLimitScope::Payment, now).await,
                RateDecision::Allowed { .. }
            ));
        }
        assert!(matches!(
            limiter.check("user:u", RateLimitScope::Payment, now).await,
            RateDecision::Limited { .. }
        ));
    }
}
