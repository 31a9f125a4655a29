//! Database error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("database unavailable: {message}")]
    Connection { message: String },

    #[error("database error: {message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.into(),
            id: id.into(),
        })
    }

    pub fn unique_violation(constraint: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::UniqueViolation {
            constraint: constraint.into(),
        })
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Connection {
            message: message.into(),
        })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }

    /// Classify a driver error by its SQLSTATE code rather than message text.
    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("record", "unknown"),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => {
                    Self::unique_violation(db_err.constraint().unwrap_or("unknown").to_string())
                }
                _ => Self::new(DatabaseErrorKind::Unknown {
                    message: db_err.message().to_string(),
                }),
            },
            sqlx::Error::PoolTimedOut => Self::connection("connection pool timed out"),
            sqlx::Error::PoolClosed => Self::connection("connection pool is closed"),
            sqlx::Error::Io(io_err) => Self::connection(io_err.to_string()),
            sqlx::Error::Tls(tls_err) => Self::connection(format!("TLS error: {}", tls_err)),
            other => Self::new(DatabaseErrorKind::Unknown {
                message: other.to_string(),
            }),
        }
    }
}

impl From<DatabaseError> for crate::error::AppError {
    fn from(err: DatabaseError) -> Self {
        use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};

        let kind = match err.kind {
            DatabaseErrorKind::NotFound { id, .. } => {
                AppErrorKind::Domain(DomainError::PaymentNotFound { id })
            }
            DatabaseErrorKind::UniqueViolation { constraint } => {
                AppErrorKind::Domain(DomainError::DuplicatePayment { key: constraint })
            }
            DatabaseErrorKind::Connection { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: true,
                })
            }
            DatabaseErrorKind::Unknown { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message,
                    is_retryable: false,
                })
            }
        };

        AppError::new(kind)
    }
}
