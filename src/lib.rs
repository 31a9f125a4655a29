//! Payment orchestration backend.
//!
//! Creates provider payment intents, persists them, and reconciles payment
//! status across Postgres, Redis and the provider's webhooks.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
#[cfg(all(feature = "database", feature = "cache"))]
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
