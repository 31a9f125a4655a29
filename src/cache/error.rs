//! Cache-specific error types

use std::fmt;

/// Cache operation errors
///
/// A miss is `Ok(None)`, never an error. `ConnectionError` means the store
/// could not be reached and callers degrade to the next source.
#[derive(Debug)]
pub enum CacheError {
    /// Redis unavailable, pool exhausted, network failure
    ConnectionError(String),
    /// Stored value did not decode into the requested type
    SerializationError(String),
    /// Invalid key or pattern
    KeyError(String),
    /// Missing or zero TTL on a write
    TtlError(String),
    /// Command rejected by the store
    OperationError(String),
}

impl CacheError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::ConnectionError(_))
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::ConnectionError(msg) => write!(f, "Cache connection error: {}", msg),
            CacheError::SerializationError(msg) => write!(f, "Cache serialization error: {}", msg),
            CacheError::KeyError(msg) => write!(f, "Cache key error: {}", msg),
            CacheError::TtlError(msg) => write!(f, "Cache TTL error: {}", msg),
            CacheError::OperationError(msg) => write!(f, "Cache operation error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            CacheError::ConnectionError(err.to_string())
        } else {
            CacheError::OperationError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "cache")]
impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(format!("Pool error: {}", err))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
