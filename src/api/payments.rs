use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use tracing::{debug, info};

use super::AppState;
use crate::error::AppError;
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::types::{PaymentMethod, WechatClient};
use crate::payments::validation;
use crate::services::payment_creation::{CreatePaymentCommand, CreationOutcome};
use crate::services::payment_operations::RefundCommand;

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub user_id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateWechatPaymentBody {
    pub user_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlipayPaymentBody {
    pub user_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentBody {
    pub payment_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub payment_intent_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// `Idempotency-Key`, falling back to `X-Idempotency-Key`.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    ["idempotency-key", "x-idempotency-key"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn tagged(headers: &HeaderMap) -> impl Fn(AppError) -> AppError + '_ {
    move |err| match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

fn creation_response(outcome: CreationOutcome) -> Response {
    match outcome {
        CreationOutcome::Created(payment) => Json(payment).into_response(),
        CreationOutcome::Existing(payment) => Json(json!({
            "client_secret": payment.client_secret,
            "payment_id": payment.payment_id,
            "payment_intent_id": payment.payment_intent_id,
            "status": payment.status,
            "return_url": payment.return_url,
            "message": "Returning existing payment record",
        }))
        .into_response(),
        CreationOutcome::AlreadyPaid {
            days_remaining,
            user_info,
        } => Json(json!({
            "already_paid": true,
            "message": "User has already paid successfully, no need to pay again",
            "days_remaining": days_remaining,
            "user_info": user_info,
        }))
        .into_response(),
    }
}

/// GET /api/v1/pricing
pub async fn get_pricing(State(state): State<AppState>) -> Response {
    Json(state.creation.pricing()).into_response()
}

/// POST /api/v1/stripe/create-payment
pub async fn create_card_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePaymentBody>,
) -> Result<Response, AppError> {
    let command = CreatePaymentCommand {
        user_id: body.user_id,
        description: body.description,
        method: PaymentMethod::Card,
        return_url: None,
        idempotency_key: idempotency_key(&headers),
    };
    let outcome = state.creation.create(command).await.map_err(tagged(&headers))?;
    Ok(creation_response(outcome))
}

/// POST /api/v1/stripe/create-wechat-payment
pub async fn create_wechat_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWechatPaymentBody>,
) -> Result<Response, AppError> {
    let client = match body.client.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            validation::validate_client(raw)
                .and_then(|_| WechatClient::from_str(raw))
                .map_err(|e| tagged(&headers)(e.into()))?
        }
        _ => WechatClient::Web,
    };
    let command = CreatePaymentCommand {
        user_id: body.user_id,
        description: body.description,
        method: PaymentMethod::WechatPay { client },
        return_url: body.return_url.filter(|u| !u.is_empty()),
        idempotency_key: idempotency_key(&headers),
    };
    let outcome = state.creation.create(command).await.map_err(tagged(&headers))?;
    Ok(creation_response(outcome))
}

/// POST /api/v1/stripe/create-alipay-payment
pub async fn create_alipay_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAlipayPaymentBody>,
) -> Result<Response, AppError> {
    let command = CreatePaymentCommand {
        user_id: body.user_id,
        description: body.description,
        method: PaymentMethod::Alipay,
        return_url: body.return_url.filter(|u| !u.is_empty()),
        idempotency_key: idempotency_key(&headers),
    };
    let outcome = state.creation.create(command).await.map_err(tagged(&headers))?;
    Ok(creation_response(outcome))
}

/// POST /api/v1/stripe/confirm-payment
pub async fn confirm_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfirmPaymentBody>,
) -> Result<Response, AppError> {
    let confirmed = state
        .operations
        .confirm(&body.payment_id)
        .await
        .map_err(tagged(&headers))?;
    Ok(Json(confirmed).into_response())
}

/// POST /api/v1/stripe/refund
pub async fn refund_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefundCommand>,
) -> Result<Response, AppError> {
    let refund = state
        .operations
        .refund(body)
        .await
        .map_err(tagged(&headers))?;
    Ok(Json(refund).into_response())
}

/// POST /api/v1/payment/update-status
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Response, AppError> {
    let synced = state
        .operations
        .sync_client_status(&body.payment_intent_id, &body.status)
        .await
        .map_err(tagged(&headers))?;
    Ok(Json(json!({
        "success": true,
        "payment_intent_id": synced.payment_intent_id,
        "status": synced.status,
        "reported_status": synced.reported_status,
        "previous_status": synced.previous_status,
        "updated": synced.updated,
    }))
    .into_response())
}

/// GET /api/v1/payment/status/{id}
pub async fn get_payment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if id.trim().is_empty() {
        return Err(tagged(&headers)(AppError::invalid_field(
            "payment_id",
            "payment_id is required",
        )));
    }
    let key = state.reconciliation.lookup_key(&id);
    debug!(lookup = %key, "payment status requested");

    let status = state
        .reconciliation
        .get_status(&key)
        .await
        .map_err(|e| tagged(&headers)(e.into()))?;
    info!(
        provider_reference = %status.provider_reference,
        status = %status.status,
        source = status.source.as_str(),
        stale = status.stale,
        "payment status served"
    );
    Ok(Json(status).into_response())
}

/// GET /api/v1/payment/status-change/{payment_intent_id}
pub async fn check_status_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_intent_id): Path<String>,
) -> Result<Response, AppError> {
    if payment_intent_id.trim().is_empty() {
        return Err(tagged(&headers)(AppError::invalid_field(
            "payment_intent_id",
            "payment_intent_id is required",
        )));
    }
    let notice = state
        .reconciliation
        .check_status_change(&payment_intent_id)
        .await;
    Ok(Json(notice).into_response())
}

/// GET /api/v1/user/{user_id}/payment-info
pub async fn get_user_payment_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Response, AppError> {
    let info = state
        .operations
        .user_payment_info(&user_id)
        .await
        .map_err(tagged(&headers))?;
    Ok(Json(info).into_response())
}

/// GET /api/v1/user/{user_id}/payment-history
pub async fn get_user_payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, AppError> {
    let history = state
        .operations
        .payment_history(&user_id, query.limit)
        .await
        .map_err(tagged(&headers))?;
    Ok(Json(history).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn idempotency_key_prefers_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-idempotency-key", HeaderValue::from_static("legacy"));
        assert_eq!(idempotency_key(&headers).as_deref(), Some("legacy"));

        headers.insert("idempotency-key", HeaderValue::from_static("standard"));
        assert_eq!(idempotency_key(&headers).as_deref(), Some("standard"));
    }

    #[test]
    fn blank_idempotency_key_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static("  "));
        assert_eq!(idempotency_key(&headers), None);
    }
}
