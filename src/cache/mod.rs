//! Redis-backed caching layer
//!
//! Holds short-lived copies of payment snapshots, provider statuses,
//! status-change notices and webhook dedup markers. Redis being down is never
//! fatal: callers treat an unavailable cache as a miss.

#[allow(clippy::module_inception)]
pub mod cache;
pub mod error;
pub mod keys;
pub mod payment_cache;

pub use error::{CacheError, CacheResult};
pub use payment_cache::PaymentCache;

#[cfg(feature = "cache")]
pub use cache::RedisCache;
#[cfg(feature = "cache")]
pub use payment_cache::RedisPaymentCache;

#[cfg(feature = "cache")]
mod pool {
    use super::error::CacheError;
    use bb8::Pool;
    use bb8_redis::RedisConnectionManager;
    use std::time::Duration;
    use tracing::{error, info, warn};

    /// Redis connection pool type alias
    pub type RedisPool = Pool<RedisConnectionManager>;

    /// Redis pool settings
    #[derive(Debug, Clone)]
    pub struct CacheConfig {
        pub redis_url: String,
        pub max_connections: u32,
        pub min_idle: u32,
        pub connection_timeout: Duration,
        pub max_lifetime: Duration,
        pub idle_timeout: Duration,
        /// Lifetime of payment snapshots
        pub payment_ttl: Duration,
        /// Lifetime of per-user aggregates
        pub user_ttl: Duration,
    }

    impl Default for CacheConfig {
        fn default() -> Self {
            Self {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                max_connections: 20,
                min_idle: 5,
                connection_timeout: Duration::from_secs(5),
                max_lifetime: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(60),
                payment_ttl: super::payment_cache::DEFAULT_PAYMENT_TTL,
                user_ttl: super::payment_cache::DEFAULT_USER_AGGREGATE_TTL,
            }
        }
    }

    /// Build the pool. A failed initial PING is logged, not returned.
    pub async fn init_cache_pool(config: &CacheConfig) -> Result<RedisPool, CacheError> {
        info!(
            max_connections = config.max_connections,
            "Initializing Redis cache pool"
        );

        let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
            error!(error = %e, "Failed to create Redis connection manager");
            CacheError::ConnectionError(e.to_string())
        })?;

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout)
            .max_lifetime(Some(config.max_lifetime))
            .idle_timeout(Some(config.idle_timeout))
            .test_on_check_out(false)
            .build(manager)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to build Redis connection pool");
                CacheError::ConnectionError(e.to_string())
            })?;

        if let Err(e) = test_connection(&pool).await {
            warn!(error = %e, "Initial Redis connection test failed, continuing degraded");
        }

        info!("Redis cache pool initialized");
        Ok(pool)
    }

    async fn test_connection(pool: &RedisPool) -> Result<(), CacheError> {
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
        test_connection(pool).await
    }

    #[derive(Debug)]
    pub struct CacheStats {
        pub connections: u32,
        pub idle_connections: u32,
        pub connections_in_use: u32,
    }

    pub fn get_cache_stats(pool: &RedisPool) -> CacheStats {
        let state = pool.state();
        CacheStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
            connections_in_use: state.connections.saturating_sub(state.idle_connections),
        }
    }
}

#[cfg(feature = "cache")]
pub use pool::{get_cache_stats, health_check, init_cache_pool, CacheConfig, CacheStats, RedisPool};
