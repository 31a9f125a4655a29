//! HTTP middleware: error rendering, request logging and rate limiting.

pub mod error;
pub mod logging;
pub mod rate_limit;

pub use error::{get_request_id_from_headers, ErrorResponse};
pub use logging::{request_logging_middleware, UuidRequestId};
pub use rate_limit::{RateLimitConfig, RateLimiter};
