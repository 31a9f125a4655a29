mod common;

use chrono::Utc;
use common::{intent_event, intent_id, sign, Harness};
use payflow_backend::cache::payment_cache::{StatusChangeSource, PROCESSED_EVENT_TTL};
use payflow_backend::database::UserPaymentAggregate;
use payflow_backend::payments::status;
use payflow_backend::services::{WebhookAck, WebhookProcessorError};

#[tokio::test]
async fn succeeded_event_updates_row_and_leaves_notice() {
    let h = Harness::new();
    let reference = intent_id(1);
    h.store
        .seed("user-1", &reference, status::PROCESSING, Utc::now());
    h.cache.put_aggregate(UserPaymentAggregate::empty("user-1"));

    let payload = intent_event("evt_1", "payment_intent.succeeded", &reference, "succeeded");
    let ack = h
        .webhooks
        .ingest(&payload, Some(&sign(&payload)))
        .await
        .expect("processed");

    assert_eq!(
        ack,
        WebhookAck::Processed {
            event_id: "evt_1".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            status_changed: true,
        }
    );
    assert_eq!(h.store.row(&reference).unwrap().status, "succeeded");
    assert_eq!(h.cache.provider_status(&reference).as_deref(), Some("succeeded"));

    let change = h.cache.pending_change(&reference).expect("notice");
    assert_eq!(change.old_status, "processing");
    assert_eq!(change.source, StatusChangeSource::Webhook);

    // A success changes the user's totals; the cached aggregate is dropped.
    assert!(h.cache.aggregate("user-1").is_none());
    assert!(h.cache.is_claimed("evt_1"));
    assert_eq!(h.cache.ttl_for("claim_event"), Some(PROCESSED_EVENT_TTL));
}

#[tokio::test]
async fn replayed_event_is_acknowledged_once() {
    let h = Harness::new();
    let reference = intent_id(2);
    h.store
        .seed("user-1", &reference, status::PROCESSING, Utc::now());

    let payload = intent_event("evt_2", "payment_intent.payment_failed", &reference, "failed");
    let signature = sign(&payload);

    let first = h.webhooks.ingest(&payload, Some(&signature)).await.unwrap();
    assert!(matches!(first, WebhookAck::Processed { status_changed: true, .. }));

    let second = h.webhooks.ingest(&payload, Some(&signature)).await.unwrap();
    assert_eq!(
        second,
        WebhookAck::Duplicate {
            event_id: "evt_2".to_string()
        }
    );
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn missing_or_wrong_signature_is_rejected() {
    let h = Harness::new();
    let payload = intent_event("evt_3", "payment_intent.succeeded", &intent_id(3), "succeeded");

    let err = h.webhooks.ingest(&payload, None).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));

    let forged = format!("t={},v1={}", Utc::now().timestamp(), "00".repeat(32));
    let err = h.webhooks.ingest(&payload, Some(&forged)).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));

    // Rejected events are never claimed.
    assert!(!h.cache.is_claimed("evt_3"));
}

#[tokio::test]
async fn tampered_body_fails_verification() {
    let h = Harness::new();
    let payload = intent_event("evt_4", "payment_intent.succeeded", &intent_id(4), "succeeded");
    let signature = sign(&payload);
    let tampered = intent_event("evt_4", "payment_intent.succeeded", &intent_id(5), "succeeded");

    let err = h.webhooks.ingest(&tampered, Some(&signature)).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature(_)));
}

#[tokio::test]
async fn unhandled_event_types_are_ignored() {
    let h = Harness::new();
    let reference = intent_id(6);
    h.store
        .seed("user-1", &reference, status::REQUIRES_PAYMENT_METHOD, Utc::now());

    let payload = intent_event("evt_6", "payment_intent.created", &reference, "requires_payment_method");
    let ack = h.webhooks.ingest(&payload, Some(&sign(&payload))).await.unwrap();

    assert!(matches!(ack, WebhookAck::Ignored { .. }));
    assert_eq!(h.store.writes(), 0);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let h = Harness::new();
    let payload = b"{not json".to_vec();
    let err = h
        .webhooks
        .ingest(&payload, Some(&sign(&payload)))
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::MalformedEvent(_)));
}

#[tokio::test]
async fn database_failure_releases_claim_for_retry() {
    let h = Harness::new();
    let reference = intent_id(7);
    h.store
        .seed("user-1", &reference, status::PROCESSING, Utc::now());
    h.store.set_unavailable(true);

    let payload = intent_event("evt_7", "payment_intent.succeeded", &reference, "succeeded");
    let signature = sign(&payload);

    let err = h.webhooks.ingest(&payload, Some(&signature)).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::DatabaseError(_)));
    assert!(!h.cache.is_claimed("evt_7"));

    // Provider retry after the database recovers goes through.
    h.store.set_unavailable(false);
    let ack = h.webhooks.ingest(&payload, Some(&signature)).await.unwrap();
    assert!(matches!(ack, WebhookAck::Processed { status_changed: true, .. }));
    assert_eq!(h.store.row(&reference).unwrap().status, "succeeded");
}

#[tokio::test]
async fn late_failure_does_not_overwrite_success() {
    let h = Harness::new();
    let reference = intent_id(8);
    h.store
        .seed("user-1", &reference, status::SUCCEEDED, Utc::now());

    let payload = intent_event("evt_8", "payment_intent.payment_failed", &reference, "failed");
    let ack = h.webhooks.ingest(&payload, Some(&sign(&payload))).await.unwrap();

    assert!(matches!(ack, WebhookAck::Processed { status_changed: false, .. }));
    assert_eq!(h.store.row(&reference).unwrap().status, "succeeded");
    assert!(h.cache.pending_change(&reference).is_none());
}

#[tokio::test]
async fn cache_outage_still_processes_event() {
    let h = Harness::new();
    let reference = intent_id(9);
    h.store
        .seed("user-1", &reference, status::PROCESSING, Utc::now());
    h.cache.set_unavailable(true);

    let payload = intent_event("evt_9", "payment_intent.canceled", &reference, "canceled");
    let ack = h.webhooks.ingest(&payload, Some(&sign(&payload))).await.unwrap();

    assert!(matches!(ack, WebhookAck::Processed { status_changed: true, .. }));
    assert_eq!(h.store.row(&reference).unwrap().status, "canceled");
}
