//! User registry
//!
//! Account creation with a unique referral code and recovery from a drifted
//! id sequence. A primary-key collision means the sequence fell behind the
//! table (e.g. after a bulk import); the sequence is reset to `max(id) + 1`
//! and the insert retried. Any other integrity violation is returned as is.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tollgate_common::money::normalize_currency;
use tollgate_common::UserId;
use tracing::{info, warn};

use crate::error::RegistrationError;
use crate::model::{Account, NewAccount};
use crate::store::AccountStore;

/// Random referral code attempts before the timestamp fallback
pub const REFERRAL_CODE_ATTEMPTS: u32 = 10;

/// Insert attempts when the id sequence keeps colliding
pub const CREATE_USER_ATTEMPTS: u32 = 3;

const REFERRAL_PREFIX: &str = "ref";

/// Produces candidate referral codes
pub trait ReferralCodeSource: Send + Sync {
    /// Next candidate
    fn generate(&self) -> String;
}

/// `ref` followed by eight random alphanumerics
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomReferralCodes;

impl ReferralCodeSource for RandomReferralCodes {
    fn generate(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!("{}{}", REFERRAL_PREFIX, suffix)
    }
}

/// Code used once every random attempt collided
pub fn fallback_referral_code() -> String {
    let millis = Utc::now().timestamp_millis().to_string();
    let tail = &millis[millis.len().saturating_sub(6)..];
    format!("{}{}", REFERRAL_PREFIX, tail)
}

/// Registration request
#[derive(Debug, Clone, Default)]
pub struct RegisterUser {
    /// Chat-platform id
    pub external_id: Option<i64>,
    /// Username
    pub username: Option<String>,
    /// Referring account
    pub referred_by: Option<UserId>,
    /// Preset referral code; generated when absent
    pub referral_code: Option<String>,
    /// Balance currency; deployment default when absent
    pub currency: Option<String>,
    /// Promo group
    pub promo_group_id: Option<i64>,
}

/// User registry
pub struct UserRegistry {
    accounts: Arc<dyn AccountStore>,
    codes: Arc<dyn ReferralCodeSource>,
    default_currency: String,
}

impl UserRegistry {
    /// Create a registry with random referral codes
    pub fn new(accounts: Arc<dyn AccountStore>, default_currency: &str) -> Self {
        Self {
            accounts,
            codes: Arc::new(RandomReferralCodes),
            default_currency: normalize_currency(Some(default_currency)),
        }
    }

    /// Replace the referral code source
    pub fn with_code_source(mut self, codes: Arc<dyn ReferralCodeSource>) -> Self {
        self.codes = codes;
        self
    }

    /// Pick a referral code no account uses yet
    pub async fn unique_referral_code(&self) -> Result<String, RegistrationError> {
        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let code = self.codes.generate();
            if !self.accounts.referral_code_taken(&code).await? {
                return Ok(code);
            }
        }
        let code = fallback_referral_code();
        warn!(code = %code, "Random referral codes exhausted, using timestamp code");
        Ok(code)
    }

    /// Create an account with a zero balance
    pub async fn create_user(&self, request: RegisterUser) -> Result<Account, RegistrationError> {
        let referral_code = match request.referral_code {
            Some(code) => code,
            None => self.unique_referral_code().await?,
        };
        let new = NewAccount {
            external_id: request.external_id,
            username: request.username,
            referral_code,
            referred_by: request.referred_by,
            currency: request
                .currency
                .map(|c| normalize_currency(Some(&c)))
                .unwrap_or_else(|| self.default_currency.clone()),
            promo_group_id: request.promo_group_id,
        };

        for attempt in 1..=CREATE_USER_ATTEMPTS {
            match self.accounts.insert_account(new.clone()).await {
                Ok(account) => {
                    info!(user_id = %account.id, referral_code = %account.referral_code, "User created");
                    return Ok(account);
                }
                Err(e) if e.is_primary_key_violation() && attempt < CREATE_USER_ATTEMPTS => {
                    warn!(attempt, max_attempts = CREATE_USER_ATTEMPTS, "Account id sequence out of sync, resynchronising");
                    let next_id = self.accounts.resync_account_sequence().await?;
                    info!(next_id, "Account id sequence resynchronised");
                }
                Err(e) if e.is_primary_key_violation() => break,
                Err(e) => return Err(e.into()),
            }
        }

        Err(RegistrationError::SequenceDriftExhausted {
            attempts: CREATE_USER_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    struct Fixed(&'static str);

    impl ReferralCodeSource for Fixed {
        fn generate(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_random_code_shape() {
        let code = RandomReferralCodes.generate();
        assert!(code.starts_with("ref"));
        assert_eq!(code.len(), 11);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(fallback_referral_code().len(), 9);
    }

    #[tokio::test]
    async fn test_create_user_defaults() {
        let store = MemoryStore::new();
        let registry = UserRegistry::new(Arc::new(store.clone()), "rub");
        let account = registry.create_user(RegisterUser::default()).await.unwrap();
        assert_eq!(account.balance_minor, 0);
        assert_eq!(account.currency, "RUB");
        assert!(account.referral_code.starts_with("ref"));
    }

    #[tokio::test]
    async fn test_colliding_codes_fall_back() {
        let store = MemoryStore::new();
        let registry = UserRegistry::new(Arc::new(store.clone()), "RUB").with_code_source(Arc::new(Fixed("refSAME")));

        let first = registry.create_user(RegisterUser::default()).await.unwrap();
        let second = registry.create_user(RegisterUser::default()).await.unwrap();
        assert_eq!(first.referral_code, "refSAME");
        assert_ne!(second.referral_code, first.referral_code);
    }

    #[tokio::test]
    async fn test_other_integrity_violation_not_retried() {
        let store = MemoryStore::new();
        let registry = UserRegistry::new(Arc::new(store.clone()), "RUB");
        registry.create_user(RegisterUser::default()).await.unwrap();

        // A preset code that is already taken is a different violation: no retry
        let taken = store.get_account(UserId::new(1)).await.unwrap().referral_code;
        let err = registry
            .create_user(RegisterUser {
                referral_code: Some(taken),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Store(StoreError::UniqueViolation { ref constraint }) if constraint == "accounts_referral_code_key"
        ));
        assert_eq!(store.sequence_resyncs(), 0);
    }
}
