//! Runs against a real Postgres: `DATABASE_URL=... cargo test -- --ignored`.

#![cfg(feature = "database")]

use payflow_backend::config::DatabaseConfig;
use payflow_backend::database::{
    init_pool_from_config, run_migrations, NewPayment, PaymentRepository, PaymentStore,
    StatusUpdate,
};
use uuid::Uuid;

async fn repository() -> PaymentRepository {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = init_pool_from_config(&DatabaseConfig {
        url,
        max_connections: 5,
        min_connections: 1,
        connection_timeout: 5,
        idle_timeout: None,
        run_migrations: true,
    })
    .await
    .expect("pool");
    run_migrations(&pool).await.expect("migrations");
    PaymentRepository::new(pool)
}

fn new_payment(key: Option<String>) -> NewPayment {
    let suffix = Uuid::new_v4().simple().to_string();
    payment_for(&format!("it-{}", &suffix[..8]), 5900, key)
}

fn payment_for(user_id: &str, amount: i64, key: Option<String>) -> NewPayment {
    let suffix = Uuid::new_v4().simple().to_string();
    NewPayment {
        internal_id: Uuid::new_v4(),
        provider_reference: format!("pi_{}", &suffix[..24]),
        idempotency_key: key,
        user_id: user_id.to_string(),
        amount,
        currency: "hkd".to_string(),
        status: "requires_payment_method".to_string(),
        payment_method: "card".to_string(),
        description: "integration".to_string(),
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
#[ignore]
async fn duplicate_idempotency_key_is_unique_violation() {
    let repo = repository().await;
    let key = format!("key-{}", Uuid::new_v4());

    repo.insert(&new_payment(Some(key.clone()))).await.expect("first insert");
    let err = repo
        .insert(&new_payment(Some(key.clone())))
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());

    let found = repo.find_by_idempotency_key(&key).await.unwrap();
    assert!(found.is_some());
}

#[tokio::test]
#[ignore]
async fn guarded_update_keeps_final_status() {
    let repo = repository().await;
    let payment = new_payment(None);
    let reference = payment.provider_reference.clone();
    repo.insert(&payment).await.unwrap();

    let update = repo.update_status(&reference, "succeeded").await.unwrap();
    assert!(matches!(update, StatusUpdate::Applied { ref previous, .. } if previous == "requires_payment_method"));

    let update = repo.update_status(&reference, "processing").await.unwrap();
    assert!(matches!(update, StatusUpdate::Rejected { .. }));

    let update = repo.update_status(&reference, "succeeded").await.unwrap();
    assert!(matches!(update, StatusUpdate::Unchanged { .. }));

    let aggregate = repo.user_aggregate(&payment.user_id).await.unwrap();
    assert!(aggregate.has_paid);
    assert_eq!(aggregate.total_payment_amount, 5900);
}

#[tokio::test]
#[ignore]
async fn missing_reference_reports_missing() {
    let repo = repository().await;
    let update = repo
        .update_status("pi_000000000000000000000000", "succeeded")
        .await
        .unwrap();
    assert_eq!(update, StatusUpdate::Missing);
}

#[tokio::test]
#[ignore]
async fn aggregate_counts_only_succeeded_rows() {
    let repo = repository().await;
    let user = format!("agg-{}", &Uuid::new_v4().simple().to_string()[..8]);

    let rows = [
        (5900, "succeeded"),
        (1200, "succeeded"),
        (300, "succeeded"),
        (7000, "failed"),
        (4000, "processing"),
        (2500, "canceled"),
        (900, "requires_payment_method"),
    ];
    for (amount, target) in rows {
        let payment = payment_for(&user, amount, None);
        repo.insert(&payment).await.unwrap();
        if target != "requires_payment_method" {
            repo.update_status(&payment.provider_reference, target)
                .await
                .unwrap();
        }
    }
    // Another user's success must not leak in.
    let other = payment_for("agg-someone-else", 9999, None);
    repo.insert(&other).await.unwrap();
    repo.update_status(&other.provider_reference, "succeeded")
        .await
        .unwrap();

    let aggregate = repo.user_aggregate(&user).await.unwrap();
    assert!(aggregate.has_paid);
    assert_eq!(aggregate.total_payment_count, 3);
    assert_eq!(aggregate.total_payment_amount, 7400);
    assert!(aggregate.first_payment_at <= aggregate.last_payment_at);

    let history = repo.history(&user, 100).await.unwrap();
    assert_eq!(history.len(), rows.len());
}
