//! Storage ports
//!
//! The ledger never reads-modifies-writes a balance without holding the
//! account row exclusively. [`AccountStore::lock_account`] hands out an
//! [`AccountGuard`]: a unit of work that keeps the row locked until it is
//! committed or rolled back (dropping it rolls back).
//!
//! ```text
//!   lock_account(id) ──► AccountGuard ──┬─► commit(BalanceChange) ──► row + transaction, atomically
//!                                       └─► rollback / drop        ──► nothing changed
//! ```

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tollgate_common::{SubscriptionId, UserId};

pub use crate::error::{StoreError, StoreResult};
use crate::model::{
    Account, ExpiredPromoOffer, NewAccount, NewSubscription, NewTransaction, PromoOffer,
    PromoOfferEvent, Subscription, Transaction, TrialConversion,
};

/// What happens to the account's promo offer on commit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PromoOfferChange {
    /// Leave untouched
    #[default]
    Keep,
    /// Reset to no offer
    Clear,
    /// Replace with a new offer
    Set(PromoOffer),
}

/// Mutation applied by [`AccountGuard::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    /// Balance after the mutation, never negative
    pub new_balance: i64,
    /// Promo-offer update in the same write
    pub promo_offer: PromoOfferChange,
    /// Audit record written in the same unit of work
    pub transaction: Option<NewTransaction>,
}

impl BalanceChange {
    /// Balance-only change
    pub fn balance(new_balance: i64) -> Self {
        Self {
            new_balance,
            promo_offer: PromoOfferChange::Keep,
            transaction: None,
        }
    }
}

/// Result of a committed change
#[derive(Debug, Clone)]
pub struct CommittedChange {
    /// Account as stored after the commit
    pub account: Account,
    /// Transaction written with it
    pub transaction: Option<Transaction>,
}

/// Exclusive hold on one account row
#[async_trait]
pub trait AccountGuard: Send + Sync {
    /// Row as read under the lock
    fn account(&self) -> &Account;

    /// Apply `change` and release the lock. On error nothing is persisted.
    async fn commit(self: Box<Self>, change: BalanceChange) -> StoreResult<CommittedChange>;

    /// Release the lock without changes
    async fn rollback(self: Box<Self>);
}

/// Account persistence port
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Lock an account row for a read-modify-write cycle
    async fn lock_account(&self, id: UserId) -> StoreResult<Box<dyn AccountGuard>>;

    /// Read an account without locking
    async fn get_account(&self, id: UserId) -> StoreResult<Account>;

    /// Insert an account with the next sequence id and a zero balance
    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account>;

    /// Whether a referral code is already used
    async fn referral_code_taken(&self, code: &str) -> StoreResult<bool>;

    /// Reset the id sequence to `max(id) + 1`; returns the next id
    async fn resync_account_sequence(&self) -> StoreResult<i64>;

    /// Clear every promo offer expired at `now`, one row at a time
    async fn clear_expired_promo_offers(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredPromoOffer>>;

    /// Append to the promo-offer event log
    async fn record_promo_offer_event(&self, event: PromoOfferEvent) -> StoreResult<()>;

    /// Transactions of an account, oldest first
    async fn list_transactions(&self, user_id: UserId) -> StoreResult<Vec<Transaction>>;
}

/// Subscription persistence port
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Subscription owned by an account
    async fn subscription_for_user(&self, user_id: UserId) -> StoreResult<Option<Subscription>>;

    /// Create a subscription
    async fn create_subscription(&self, subscription: NewSubscription) -> StoreResult<Subscription>;

    /// Overwrite a subscription
    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<()>;

    /// Delete a subscription
    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<()>;

    /// Record a trial to paid conversion
    async fn record_conversion(&self, conversion: TrialConversion) -> StoreResult<()>;
}
