//! Billing error types

use serde::Serialize;
use thiserror::Error;
use tollgate_common::MoneyError;

/// Storage error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint violated; carries the constraint name
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Violated constraint, e.g. `accounts_pkey`
        constraint: String,
    },

    /// Store unreachable
    #[error("connection error: {0}")]
    Connection(String),

    /// Statement failed
    #[error("query error: {0}")]
    Query(String),
}

impl StoreError {
    /// Primary-key collision, the symptom of a drifted id sequence
    pub fn is_primary_key_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { constraint } if constraint.ends_with("_pkey"))
    }
}

/// Store result
pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Balance below the requested debit
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Requested amount (minor units)
        required: i64,
        /// Balance at the time of the check
        available: i64,
    },

    /// Negative or overflowing amount
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The promo offer priced into the amount is no longer on the account
    #[error("promo offer changed: priced with {expected}%, account has {active}%")]
    PromoOfferChanged {
        /// Percent the amount was priced with
        expected: i32,
        /// Percent active under the lock
        active: i32,
    },

    /// No such account
    #[error("account not found: {0}")]
    AccountNotFound(i64),

    /// Underlying store failed; nothing was changed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Amount the caller needs to top up, zero for other failures
    pub fn missing(&self) -> i64 {
        match self {
            LedgerError::InsufficientFunds { required, available } => (required - available).max(0),
            _ => 0,
        }
    }
}

/// User registration error
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Id sequence still collided after every resynchronisation
    #[error("account id sequence still out of sync after {attempts} attempts")]
    SequenceDriftExhausted {
        /// Insert attempts made
        attempts: u32,
    },

    /// Underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a best-effort collaborator
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HookError(pub String);

/// Machine-readable validation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// Unknown or missing period
    InvalidPeriod,
    /// Traffic value not offered
    InvalidTraffic,
    /// Server set unresolvable or below the minimum
    InvalidServers,
    /// Device count not a number
    InvalidDevices,
    /// Trial cannot be activated for this account
    TrialUnavailable,
    /// Add-on cannot be bought for this subscription
    AddonUnavailable,
}

impl ValidationCode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::InvalidPeriod => "invalid_period",
            ValidationCode::InvalidTraffic => "invalid_traffic",
            ValidationCode::InvalidServers => "invalid_servers",
            ValidationCode::InvalidDevices => "invalid_devices",
            ValidationCode::TrialUnavailable => "trial_unavailable",
            ValidationCode::AddonUnavailable => "addon_unavailable",
        }
    }
}

/// Caller-facing failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Balance too low
    InsufficientFunds,
    /// Selection rejected
    InvalidSelection,
    /// Anything else; nothing was charged
    ConfigurationError,
}

/// Purchase error
#[derive(Error, Debug)]
pub enum PurchaseError {
    /// Selection rejected before any money moved
    #[error("{message} ({})", .code.as_str())]
    Validation {
        /// Machine-readable code
        code: ValidationCode,
        /// Human-readable detail
        message: String,
    },

    /// Balance too low for the recomputed total
    #[error("insufficient funds: missing {missing}")]
    InsufficientFunds {
        /// Amount to top up (minor units)
        missing: i64,
    },

    /// Recomputed total does not reconcile
    #[error("pricing calculation rejected: {0}")]
    Calculation(String),

    /// Deployment misconfigured
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No conversion rate between currencies
    #[error("no rate from {from} to {to}")]
    Rate {
        /// Source currency
        from: String,
        /// Target currency
        to: String,
    },

    /// Entitlements could not be applied and the flow was reversed
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Account missing
    #[error("account not found: {0}")]
    AccountNotFound(i64),

    /// Underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Money arithmetic failed
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl PurchaseError {
    pub(crate) fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        PurchaseError::Validation {
            code,
            message: message.into(),
        }
    }

    /// Collapse into the three caller-facing kinds
    pub fn kind(&self) -> FailureKind {
        match self {
            PurchaseError::InsufficientFunds { .. } => FailureKind::InsufficientFunds,
            PurchaseError::Validation { .. } | PurchaseError::AccountNotFound(_) => {
                FailureKind::InvalidSelection
            }
            _ => FailureKind::ConfigurationError,
        }
    }

    /// Validation code, if this is a validation failure
    pub fn code(&self) -> Option<ValidationCode> {
        match self {
            PurchaseError::Validation { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<LedgerError> for PurchaseError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { required, available } => {
                PurchaseError::InsufficientFunds {
                    missing: (required - available).max(0),
                }
            }
            LedgerError::AccountNotFound(id) => PurchaseError::AccountNotFound(id),
            LedgerError::InvalidAmount(amount) => {
                PurchaseError::Calculation(format!("invalid charge amount {}", amount))
            }
            LedgerError::PromoOfferChanged { expected, active } => PurchaseError::Calculation(format!(
                "priced with a {}% promo offer, account now has {}%; price again",
                expected, active
            )),
            LedgerError::Store(e) => PurchaseError::Store(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_amount() {
        let err = LedgerError::InsufficientFunds {
            required: 6000,
            available: 4000,
        };
        assert_eq!(err.missing(), 2000);
        assert_eq!(LedgerError::InvalidAmount(-1).missing(), 0);
    }

    #[test]
    fn test_kind_mapping() {
        let err: PurchaseError = LedgerError::InsufficientFunds {
            required: 10,
            available: 3,
        }
        .into();
        assert_eq!(err.kind(), FailureKind::InsufficientFunds);
        assert!(matches!(err, PurchaseError::InsufficientFunds { missing: 7 }));

        let err = PurchaseError::validation(ValidationCode::InvalidTraffic, "nope");
        assert_eq!(err.kind(), FailureKind::InvalidSelection);
        assert_eq!(err.code(), Some(ValidationCode::InvalidTraffic));

        let err = PurchaseError::Calculation("mismatch".into());
        assert_eq!(err.kind(), FailureKind::ConfigurationError);

        let err: PurchaseError = LedgerError::PromoOfferChanged { expected: 20, active: 0 }.into();
        assert!(matches!(err, PurchaseError::Calculation(_)));
        assert!(err.to_string().contains("price again"));
    }

    #[test]
    fn test_pkey_detection() {
        let pk = StoreError::UniqueViolation {
            constraint: "accounts_pkey".into(),
        };
        let referral = StoreError::UniqueViolation {
            constraint: "accounts_referral_code_key".into(),
        };
        assert!(pk.is_primary_key_violation());
        assert!(!referral.is_primary_key_violation());
    }
}
