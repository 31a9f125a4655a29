//! Payment provider integration: gateway trait, Stripe client, status
//! vocabulary and request validation.

pub mod error;
pub mod provider;
pub mod providers;
pub mod status;
pub mod types;
pub mod utils;
pub mod validation;

pub use error::{PaymentError, PaymentResult};
pub use provider::{with_timeout, PaymentGateway};
pub use types::LookupKey;
