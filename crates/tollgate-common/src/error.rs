//! Error types shared across Tollgate crates

use thiserror::Error;

/// Money arithmetic error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Amount does not fit the minor-unit integer range
    #[error("amount out of range: {0}")]
    Overflow(String),

    /// Conversion rate must be positive
    #[error("invalid conversion rate: {0}")]
    InvalidRate(String),
}

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for the expected shape
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Config parsed but violates an invariant
    #[error("invalid config: {0}")]
    Invalid(String),
}
