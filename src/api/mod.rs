//! HTTP handlers and route table.

pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::middleware::rate_limit::{self, RateLimiter};
use crate::services::{
    PaymentCreationService, PaymentOperations, ReconciliationEngine, WebhookProcessor,
};

/// Shared state for every payment route.
#[derive(Clone)]
pub struct AppState {
    pub reconciliation: Arc<ReconciliationEngine>,
    pub creation: Arc<PaymentCreationService>,
    pub operations: Arc<PaymentOperations>,
    pub webhooks: Arc<WebhookProcessor>,
}

/// All `/api/v1` routes with rate limiting applied.
pub fn router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/api/v1/pricing", get(payments::get_pricing))
        .route("/api/v1/stripe/create-payment", post(payments::create_card_payment))
        .route(
            "/api/v1/stripe/create-wechat-payment",
            post(payments::create_wechat_payment),
        )
        .route(
            "/api/v1/stripe/create-alipay-payment",
            post(payments::create_alipay_payment),
        )
        .route("/api/v1/stripe/confirm-payment", post(payments::confirm_payment))
        .route("/api/v1/stripe/refund", post(payments::refund_payment))
        .route("/api/v1/stripe/webhook", post(webhooks::handle_stripe_webhook))
        .route("/api/v1/payment/update-status", post(payments::update_status))
        .route("/api/v1/payment/status/{id}", get(payments::get_payment_status))
        .route(
            "/api/v1/payment/status-change/{payment_intent_id}",
            get(payments::check_status_change),
        )
        .route(
            "/api/v1/user/{user_id}/payment-info",
            get(payments::get_user_payment_info),
        )
        .route(
            "/api/v1/user/{user_id}/payment-history",
            get(payments::get_user_payment_history),
        )
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit::enforce,
        ))
        .with_state(state)
}
