//! Background workers

pub mod revalidation;

pub use revalidation::RevalidationPool;
