//! Health check module
//! Provides health status for the application and its dependencies

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::cache::{
    get_cache_stats, health_check as ping_cache, CacheError, CacheStats, RedisCache,
};
use crate::database::{get_pool_stats, health_check as ping_database, DatabaseError, PoolStats};

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Running without the cache: slower, still correct.
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    pub fn http_status(&self) -> StatusCode {
        match self.status {
            HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    db_pool: Option<sqlx::PgPool>,
    cache: Option<RedisCache>,
}

impl HealthChecker {
    pub fn new(db_pool: Option<sqlx::PgPool>, cache: Option<RedisCache>) -> Self {
        Self { db_pool, cache }
    }

    /// Database and cache are probed concurrently, each under its own timeout.
    pub async fn check_health(&self) -> HealthStatus {
        let (database, cache) = futures::join!(self.database_component(), self.cache_component());

        let mut health_status = HealthStatus::new();
        health_status.status = overall_state(&database, &cache);
        health_status.checks.insert("database".to_string(), database);
        health_status.checks.insert("cache".to_string(), cache);
        health_status
    }

    async fn database_component(&self) -> ComponentHealth {
        let Some(pool) = &self.db_pool else {
            return ComponentHealth::warning(None, Some("Database disabled".to_string()));
        };
        match timeout(CHECK_TIMEOUT, check_database_health(pool)).await {
            Ok(Ok(response_time)) => {
                info!("Database health check: OK ({}ms)", response_time);
                ComponentHealth::up(Some(response_time))
                    .with_details(describe_pool(&get_pool_stats(pool)))
            }
            Ok(Err(e)) => {
                error!("Database health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Database health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        }
    }

    async fn cache_component(&self) -> ComponentHealth {
        let Some(cache) = &self.cache else {
            return ComponentHealth::warning(None, Some("Cache disabled".to_string()));
        };
        match timeout(CHECK_TIMEOUT, check_cache_health(cache)).await {
            Ok(Ok(response_time)) => {
                info!("Cache health check: OK ({}ms)", response_time);
                ComponentHealth::up(Some(response_time))
                    .with_details(describe_cache_pool(&get_cache_stats(cache.pool())))
            }
            Ok(Err(e)) => {
                warn!("Cache health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                warn!("Cache health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        }
    }
}

/// A down database is fatal; a down cache only degrades.
pub fn overall_state(database: &ComponentHealth, cache: &ComponentHealth) -> HealthState {
    if database.status == ComponentState::Down {
        HealthState::Unhealthy
    } else if cache.status == ComponentState::Down {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

pub async fn check_database_health(pool: &sqlx::PgPool) -> Result<u128, DatabaseError> {
    let start = Instant::now();
    ping_database(pool).await?;
    Ok(start.elapsed().as_millis())
}

pub async fn check_cache_health(cache: &RedisCache) -> Result<u128, CacheError> {
    let start = Instant::now();
    ping_cache(cache.pool()).await?;
    Ok(start.elapsed().as_millis())
}

fn describe_pool(stats: &PoolStats) -> String {
    format!("connections={} idle={}", stats.size, stats.num_idle)
}

fn describe_cache_pool(stats: &CacheStats) -> String {
    format!(
        "connections={} idle={} in_use={}",
        stats.connections, stats.idle_connections, stats.connections_in_use
    )
}

async fn health(State(checker): State<HealthChecker>) -> impl IntoResponse {
    let health_status = checker.check_health().await;
    let code = health_status.http_status();
    if code.is_server_error() {
        error!("Health check failed - service unhealthy");
    }
    (code, Json(health_status))
}

async fn liveness() -> &'static str {
    "OK"
}

/// `/health`, `/health/ready` and `/health/live`.
pub fn router(checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health))
        .route("/health/live", get(liveness))
        .with_state(checker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
    }

    #[test]
    fn cache_outage_degrades_database_outage_fails() {
        let up = ComponentHealth::up(Some(1));
        let down = ComponentHealth::down(None);
        let disabled = ComponentHealth::warning(None, None);

        assert_eq!(overall_state(&up, &up), HealthState::Healthy);
        assert_eq!(overall_state(&up, &down), HealthState::Degraded);
        assert_eq!(overall_state(&down, &up), HealthState::Unhealthy);
        assert_eq!(overall_state(&disabled, &disabled), HealthState::Healthy);
    }

    #[test]
    fn pool_stats_are_reported_as_details() {
        let db = ComponentHealth::up(Some(2)).with_details(describe_pool(&PoolStats {
            num_idle: 3,
            size: 5,
        }));
        assert_eq!(db.details.as_deref(), Some("connections=5 idle=3"));

        let redis = describe_cache_pool(&CacheStats {
            connections: 4,
            idle_connections: 1,
            connections_in_use: 3,
        });
        assert_eq!(redis, "connections=4 idle=1 in_use=3");
    }

    #[tokio::test]
    async fn disabled_components_report_warning() {
        let status = HealthChecker::new(None, None).check_health().await;
        assert_eq!(status.checks["database"].status, ComponentState::Warning);
        assert_eq!(status.checks["cache"].status, ComponentState::Warning);
        assert_eq!(status.http_status(), StatusCode::OK);
    }
}
