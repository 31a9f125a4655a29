use axum::{routing::get, Json, Router};
use dotenv::dotenv;
use payflow_backend::api::{self, AppState};
use payflow_backend::cache::{
    init_cache_pool, CacheConfig as PoolCacheConfig, PaymentCache, RedisCache, RedisPaymentCache,
};
use payflow_backend::config::AppConfig;
use payflow_backend::database::{
    init_pool_from_config, run_migrations, PaymentRepository, PaymentStore,
};
use payflow_backend::health::{self, HealthChecker};
use payflow_backend::logging::init_tracing;
use payflow_backend::middleware::logging::{request_logging_middleware, UuidRequestId};
use payflow_backend::middleware::RateLimiter;
use payflow_backend::payments::providers::StripeProvider;
use payflow_backend::payments::PaymentGateway;
use payflow_backend::services::{
    PaymentBackends, PaymentCreationService, PaymentOperations, ReconciliationEngine,
    StatusSynchronizer, WebhookProcessor,
};
use payflow_backend::workers::RevalidationPool;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "payflow-backend",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loaded before tracing so LOG_LEVEL / LOG_FORMAT from .env apply.
    dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().map_err(|e| {
        error!("❌ Failed to load configuration: {}", e);
        anyhow::anyhow!(e.to_string())
    })?;
    config.validate().map_err(|e| {
        error!("❌ Invalid configuration: {}", e);
        anyhow::anyhow!(e.to_string())
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting payflow backend service"
    );
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Server configuration loaded"
    );

    // Database is optional: without it the service answers from cache and provider.
    let db_pool = match &config.database {
        Some(db_config) => {
            info!("📊 Initializing database connection pool...");
            match init_pool_from_config(db_config).await {
                Ok(pool) => {
                    if db_config.run_migrations {
                        if let Err(e) = run_migrations(&pool).await {
                            error!("❌ Failed to run migrations: {}", e);
                            return Err(anyhow::anyhow!(e.to_string()));
                        }
                        info!("✅ Migrations applied");
                    }
                    info!(
                        max_connections = db_config.max_connections,
                        "✅ Database connection pool initialized"
                    );
                    Some(pool)
                }
                Err(e) => {
                    warn!("⚠️  Database unavailable, continuing without persistence: {}", e);
                    None
                }
            }
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, running without persistence");
            None
        }
    };

    let redis_cache = match &config.cache {
        Some(cache_config) => {
            info!("🔄 Initializing Redis cache...");
            let pool_config = PoolCacheConfig {
                redis_url: cache_config.redis_url.clone(),
                max_connections: cache_config.max_connections,
                payment_ttl: cache_config.payment_ttl(),
                user_ttl: cache_config.user_ttl(),
                ..Default::default()
            };
            match init_cache_pool(&pool_config).await {
                Ok(pool) => {
                    info!("✅ Redis cache initialized");
                    Some(RedisCache::new(pool))
                }
                Err(e) => {
                    warn!("⚠️  Redis unavailable, continuing without cache: {}", e);
                    None
                }
            }
        }
        None => {
            warn!("⚠️  REDIS_URL not set, running without cache");
            None
        }
    };

    info!("💳 Initializing Stripe provider...");
    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        StripeProvider::new(config.stripe.clone())
            .map_err(|e| anyhow::anyhow!("Failed to initialize Stripe provider: {}", e))?,
    );

    let store = db_pool
        .clone()
        .map(|pool| Arc::new(PaymentRepository::new(pool)) as Arc<dyn PaymentStore>);
    let payment_cache = redis_cache
        .clone()
        .map(|cache| Arc::new(RedisPaymentCache::new(cache)) as Arc<dyn PaymentCache>);
    let backends = PaymentBackends::new(store, payment_cache, gateway);

    let mut reconciliation_config = config.reconciliation.clone();
    if let Some(cache_config) = &config.cache {
        reconciliation_config.payment_ttl = cache_config.payment_ttl();
        reconciliation_config.user_ttl = cache_config.user_ttl();
    }

    let pool = RevalidationPool::new(reconciliation_config.max_in_flight);
    let sync = Arc::new(StatusSynchronizer::new(
        backends.clone(),
        reconciliation_config.payment_ttl,
    ));
    let state = AppState {
        reconciliation: Arc::new(ReconciliationEngine::new(
            backends.clone(),
            sync.clone(),
            pool.clone(),
            reconciliation_config.clone(),
        )),
        creation: Arc::new(PaymentCreationService::new(
            backends.clone(),
            config.pricing.clone(),
            pool.clone(),
            reconciliation_config.provider_timeout,
            reconciliation_config.payment_ttl,
            reconciliation_config.user_ttl,
        )),
        operations: Arc::new(PaymentOperations::new(
            backends.clone(),
            sync.clone(),
            reconciliation_config.provider_timeout,
            reconciliation_config.user_ttl,
        )),
        webhooks: Arc::new(WebhookProcessor::new(backends, sync)),
    };
    info!(
        max_in_flight = pool.capacity(),
        "✅ Payment services initialized"
    );

    let limiter = Arc::new(RateLimiter::with_redis(
        config.rate_limit.clone(),
        redis_cache.clone(),
    ));
    let health_checker = HealthChecker::new(db_pool, redis_cache);

    let app = Router::new()
        .route("/", get(root))
        .merge(health::router(health_checker))
        .merge(api::router(state, limiter))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    info!("✅ Routes configured");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("⏳ Waiting for background revalidations...");
    pool.shutdown().await;

    info!("👋 Server shutdown complete");

    Ok(())
}
