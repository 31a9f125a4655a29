//! Application configuration module
//! Loads settings from the environment (and `.env`), then validates each section.

use crate::middleware::rate_limit::RateLimitConfig;
use crate::payments::providers::StripeConfig;
use crate::services::reconciliation::ReconciliationConfig;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when `DATABASE_URL` is unset; the service then runs cache + provider only.
    pub database: Option<DatabaseConfig>,
    /// `None` when `REDIS_URL` is unset.
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub stripe: StripeConfig,
    pub reconciliation: ReconciliationConfig,
    pub pricing: PricingConfig,
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub run_migrations: bool,
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub payment_ttl: u64, // seconds
    pub user_ttl: u64,    // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Price charged for one payment, in minor units.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub amount: i64,
    pub currency: String,
    /// A success within this many days makes the user "already paid".
    pub validity_days: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            amount: 5900,
            currency: "hkd".to_string(),
            validity_days: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env_optional()?,
            cache: CacheConfig::from_env_optional()?,
            logging: LoggingConfig::from_env()?,
            stripe: StripeConfig::from_env()
                .map_err(|e| ConfigError::MissingVariable(e.to_string()))?,
            reconciliation: ReconciliationConfig::from_env(),
            pricing: PricingConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env(),
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        self.logging.validate()?;
        self.pricing.validate()?;

        if self.stripe.secret_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue("STRIPE_SECRET_KEY".to_string()));
        }
        if self.reconciliation.provider_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("PROVIDER_TIMEOUT_SECS".to_string()));
        }
        if self.reconciliation.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue(
                "REVALIDATION_MAX_IN_FLIGHT".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Ok(Some(Self::with_url(url)?)),
            _ => Ok(None),
        }
    }

    fn with_url(url: String) -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            run_migrations: env::var("DB_RUN_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env_optional() -> Result<Option<Self>, ConfigError> {
        let redis_url = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => return Ok(None),
        };

        Ok(Some(CacheConfig {
            redis_url,
            max_connections: env::var("CACHE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()))?,
            payment_ttl: env::var("CACHE_PAYMENT_TTL_SECS")
                .unwrap_or_else(|_| "1800".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_PAYMENT_TTL_SECS".to_string()))?,
            user_ttl: env::var("CACHE_USER_TTL_SECS")
                .unwrap_or_else(|_| "900".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_USER_TTL_SECS".to_string()))?,
        }))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.payment_ttl == 0 || self.user_ttl == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache TTLs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn payment_ttl(&self) -> Duration {
        Duration::from_secs(self.payment_ttl)
    }

    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.user_ttl)
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

impl PricingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(PricingConfig {
            amount: match env::var("PRICING_AMOUNT") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PRICING_AMOUNT".to_string()))?,
                Err(_) => defaults.amount,
            },
            currency: env::var("PRICING_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.currency),
            validity_days: match env::var("PAYMENT_VALIDITY_DAYS") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PAYMENT_VALIDITY_DAYS".to_string()))?,
                Err(_) => defaults.validity_days,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::payments::validation::validate_amount(self.amount)
            .map_err(|e| ConfigError::ValidationFailed(format!("PRICING_AMOUNT: {}", e)))?;
        crate::payments::validation::validate_currency(&self.currency)
            .map_err(|e| ConfigError::ValidationFailed(format!("PRICING_CURRENCY: {}", e)))?;
        if self.validity_days <= 0 {
            return Err(ConfigError::InvalidValue("PAYMENT_VALIDITY_DAYS".to_string()));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
