use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Provider call timed out after {timeout_secs}s: {operation}")]
    TimeoutError {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Not found at provider: {reference}")]
    NotFoundError { reference: String },

    #[error("Provider authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::TimeoutError { .. } => true,
            PaymentError::NotFoundError { .. } => false,
            PaymentError::AuthenticationError { .. } => false,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    /// True when the provider could not be reached or did not answer in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PaymentError::NetworkError { .. }
                | PaymentError::TimeoutError { .. }
                | PaymentError::RateLimitError { .. }
        ) || matches!(self, PaymentError::ProviderError { retryable: true, .. })
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::NetworkError { .. } => 502,
            PaymentError::TimeoutError { .. } => 504,
            PaymentError::NotFoundError { .. } => 404,
            PaymentError::AuthenticationError { .. } => 500,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::WebhookVerificationError { .. } => 401,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } | PaymentError::TimeoutError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::NotFoundError { .. } => "Payment not found".to_string(),
            PaymentError::AuthenticationError { .. } => {
                "Payment service is misconfigured".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{
            AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError,
            ValidationError,
        };

        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            PaymentError::NotFoundError { reference } => {
                AppErrorKind::Domain(DomainError::PaymentNotFound { id: reference })
            }
            PaymentError::TimeoutError {
                operation,
                timeout_secs,
            } => AppErrorKind::External(ExternalError::Timeout {
                service: format!("stripe {}", operation),
                timeout_secs,
            }),
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "stripe".to_string(),
                retry_after: retry_after_seconds,
            }),
            PaymentError::AuthenticationError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration { message })
            }
            PaymentError::WebhookVerificationError { message } => {
                AppErrorKind::Domain(DomainError::InvalidSignature { reason: message })
            }
            other => AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "stripe".to_string(),
                message: other.to_string(),
                is_retryable: other.is_retryable(),
            }),
        };

        AppError::new(kind)
    }
}
