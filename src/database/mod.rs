//! Postgres persistence for payment records.

pub mod error;
pub mod payment_repository;

pub use error::{DatabaseError, DatabaseErrorKind};
pub use payment_repository::{
    NewPayment, PaymentRecord, PaymentStore, StatusUpdate, UserPaymentAggregate,
};

#[cfg(feature = "database")]
pub use payment_repository::PaymentRepository;

#[cfg(feature = "database")]
mod pool {
    use super::error::DatabaseError;
    use crate::config::DatabaseConfig;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info, warn};

    /// Database pool configuration
    #[derive(Debug, Clone)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 20,
                min_connections: 2,
                connection_timeout: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    pub async fn init_pool(
        database_url: &str,
        config: Option<PoolConfig>,
    ) -> Result<PgPool, DatabaseError> {
        let config = config.unwrap_or_default();

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Initializing database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!(error = %e, "Failed to initialize database pool");
                DatabaseError::from_sqlx(e)
            })?;

        info!("Database pool initialized successfully");
        Ok(pool)
    }

    /// Apply the SQL files under `migrations/`.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| DatabaseError::connection(format!("migration failed: {}", e)))?;
        Ok(())
    }

    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| {
                warn!(error = %e, "Database health check failed");
                DatabaseError::from_sqlx(e)
            })?;
        Ok(())
    }

    #[derive(Debug)]
    pub struct PoolStats {
        pub num_idle: u32,
        pub size: u32,
    }

    pub fn get_pool_stats(pool: &PgPool) -> PoolStats {
        PoolStats {
            num_idle: pool.num_idle() as u32,
            size: pool.size(),
        }
    }

    pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        let pool_config = PoolConfig {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connection_timeout: Duration::from_secs(config.connection_timeout),
            idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
            max_lifetime: Duration::from_secs(1800),
        };

        init_pool(&config.url, Some(pool_config)).await
    }

}

#[cfg(feature = "database")]
pub use pool::{
    get_pool_stats, health_check, init_pool, init_pool_from_config, run_migrations, PoolConfig,
    PoolStats,
};
