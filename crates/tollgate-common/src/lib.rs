//! Tollgate Common - Shared types for the balance ledger and pricing engine
//!
//! This crate provides side-effect-free building blocks:
//! - Currency model (minor/major units, formatting, display alias)
//! - Typed identifiers
//! - Immutable pricing configuration
//! - Error types
//!
//! Nothing in here performs I/O apart from [`PricingConfig::load`]; every
//! function is safe to call from any number of concurrent readers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod money;

pub use config::{months_in_period, remaining_months, PricingConfig, TrafficMode, TrafficPackage};
pub use error::{ConfigError, MoneyError};
pub use ids::{SubscriptionId, TransactionId, UserId};
pub use money::{CurrencyMeta, Money};
