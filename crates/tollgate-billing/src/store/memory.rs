//! In-memory store
//!
//! Each account row sits behind its own `tokio::sync::Mutex`, so a locked row
//! blocks only other writers of that account. The id sequence is simulated
//! and can be pushed out of sync to exercise drift recovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tollgate_common::{SubscriptionId, TransactionId, UserId};

use super::{
    AccountGuard, AccountStore, BalanceChange, CommittedChange, PromoOfferChange, StoreError,
    StoreResult, SubscriptionStore,
};
use crate::model::{
    Account, ExpiredPromoOffer, NewAccount, NewSubscription, NewTransaction, PromoOfferEvent,
    Subscription, Transaction, TrialConversion,
};

const ACCOUNTS_PKEY: &str = "accounts_pkey";
const REFERRAL_CODE_KEY: &str = "accounts_referral_code_key";
const SUBSCRIPTIONS_USER_KEY: &str = "subscriptions_user_id_key";

#[derive(Default)]
struct Inner {
    accounts: DashMap<i64, Arc<Mutex<Account>>>,
    referral_codes: DashMap<String, i64>,
    account_seq: AtomicI64,
    resyncs: AtomicUsize,
    transactions: RwLock<Vec<Transaction>>,
    transaction_seq: AtomicI64,
    subscriptions: RwLock<HashMap<i64, Subscription>>,
    subscription_seq: AtomicI64,
    conversions: RwLock<Vec<TrialConversion>>,
    promo_events: RwLock<Vec<PromoOfferEvent>>,
    fail_next_transaction: AtomicBool,
    fail_promo_events: AtomicBool,
}

impl Inner {
    fn build_transaction(&self, new: NewTransaction, now: DateTime<Utc>) -> Transaction {
        let id = self.transaction_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Transaction {
            id: TransactionId::new(id),
            user_id: new.user_id,
            kind: new.kind,
            amount_minor: new.amount_minor,
            description: new.description,
            payment_method: new.payment_method,
            is_completed: true,
            created_at: now,
            completed_at: Some(now),
        }
    }
}

/// In-memory implementation of both store ports
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the next id the account sequence hands out
    pub fn set_account_sequence(&self, next_id: i64) {
        self.inner.account_seq.store(next_id - 1, Ordering::SeqCst);
    }

    /// How many times the account sequence was resynchronised
    pub fn sequence_resyncs(&self) -> usize {
        self.inner.resyncs.load(Ordering::SeqCst)
    }

    /// Make the next transaction insert fail
    pub fn fail_next_transaction_insert(&self) {
        self.inner.fail_next_transaction.store(true, Ordering::SeqCst);
    }

    /// Make promo-offer event inserts fail
    pub fn fail_promo_offer_events(&self, fail: bool) {
        self.inner.fail_promo_events.store(fail, Ordering::SeqCst);
    }

    /// Number of stored accounts
    pub fn account_count(&self) -> usize {
        self.inner.accounts.len()
    }

    /// Promo-offer event log
    pub fn promo_offer_events(&self) -> Vec<PromoOfferEvent> {
        self.inner.promo_events.read().clone()
    }

    /// Trial conversion log
    pub fn conversions(&self) -> Vec<TrialConversion> {
        self.inner.conversions.read().clone()
    }

    fn row(&self, id: UserId) -> StoreResult<Arc<Mutex<Account>>> {
        self.inner
            .accounts
            .get(&id.get())
            .map(|row| Arc::clone(row.value()))
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }
}

struct MemoryAccountGuard {
    row: OwnedMutexGuard<Account>,
    inner: Arc<Inner>,
}

#[async_trait]
impl AccountGuard for MemoryAccountGuard {
    fn account(&self) -> &Account {
        &self.row
    }

    async fn commit(mut self: Box<Self>, change: BalanceChange) -> StoreResult<CommittedChange> {
        if change.new_balance < 0 {
            return Err(StoreError::Query("balance_minor must not be negative".into()));
        }

        let now = Utc::now();
        let transaction = match change.transaction {
            Some(new) => {
                if self.inner.fail_next_transaction.swap(false, Ordering::SeqCst) {
                    return Err(StoreError::Query("transaction insert failed".into()));
                }
                Some(self.inner.build_transaction(new, now))
            }
            None => None,
        };

        // Nothing below can fail: row and transaction land together.
        if let Some(tx) = &transaction {
            self.inner.transactions.write().push(tx.clone());
        }
        let row = &mut self.row;
        row.balance_minor = change.new_balance;
        match change.promo_offer {
            PromoOfferChange::Keep => {}
            PromoOfferChange::Clear => row.promo_offer = None,
            PromoOfferChange::Set(offer) => row.promo_offer = Some(offer),
        }
        row.updated_at = now;

        Ok(CommittedChange {
            account: row.clone(),
            transaction,
        })
    }

    async fn rollback(self: Box<Self>) {}
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn lock_account(&self, id: UserId) -> StoreResult<Box<dyn AccountGuard>> {
        let row = self.row(id)?;
        let guard = row.lock_owned().await;
        Ok(Box::new(MemoryAccountGuard {
            row: guard,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn get_account(&self, id: UserId) -> StoreResult<Account> {
        let row = self.row(id)?;
        let account = row.lock().await.clone();
        Ok(account)
    }

    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account> {
        // The sequence advances even when the insert fails, as in a database.
        let id = self.inner.account_seq.fetch_add(1, Ordering::SeqCst) + 1;

        match self.inner.accounts.entry(id) {
            Entry::Occupied(_) => Err(StoreError::UniqueViolation {
                constraint: ACCOUNTS_PKEY.into(),
            }),
            Entry::Vacant(slot) => {
                match self.inner.referral_codes.entry(account.referral_code.clone()) {
                    Entry::Occupied(_) => {
                        return Err(StoreError::UniqueViolation {
                            constraint: REFERRAL_CODE_KEY.into(),
                        })
                    }
                    Entry::Vacant(code) => {
                        code.insert(id);
                    }
                }

                let now = Utc::now();
                let stored = Account {
                    id: UserId::new(id),
                    external_id: account.external_id,
                    username: account.username,
                    referral_code: account.referral_code,
                    referred_by: account.referred_by,
                    balance_minor: 0,
                    currency: account.currency,
                    promo_group_id: account.promo_group_id,
                    promo_offer: None,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(Arc::new(Mutex::new(stored.clone())));
                Ok(stored)
            }
        }
    }

    async fn referral_code_taken(&self, code: &str) -> StoreResult<bool> {
        Ok(self.inner.referral_codes.contains_key(code))
    }

    async fn resync_account_sequence(&self) -> StoreResult<i64> {
        let max_id = self
            .inner
            .accounts
            .iter()
            .map(|row| *row.key())
            .max()
            .unwrap_or(0);
        self.inner.account_seq.store(max_id, Ordering::SeqCst);
        self.inner.resyncs.fetch_add(1, Ordering::SeqCst);
        Ok(max_id + 1)
    }

    async fn clear_expired_promo_offers(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredPromoOffer>> {
        let rows: Vec<Arc<Mutex<Account>>> = self
            .inner
            .accounts
            .iter()
            .map(|row| Arc::clone(row.value()))
            .collect();

        let mut cleared = Vec::new();
        for row in rows {
            let mut account = row.lock().await;
            let expired = match &account.promo_offer {
                Some(offer) => offer.percent > 0 && offer.expires_at.is_some_and(|at| at <= now),
                None => false,
            };
            if expired {
                if let Some(offer) = account.promo_offer.take() {
                    account.updated_at = now;
                    cleared.push(ExpiredPromoOffer {
                        user_id: account.id,
                        offer,
                    });
                }
            }
        }
        Ok(cleared)
    }

    async fn record_promo_offer_event(&self, event: PromoOfferEvent) -> StoreResult<()> {
        if self.inner.fail_promo_events.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("promo offer log unavailable".into()));
        }
        self.inner.promo_events.write().push(event);
        Ok(())
    }

    async fn list_transactions(&self, user_id: UserId) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .inner
            .transactions
            .read()
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn subscription_for_user(&self, user_id: UserId) -> StoreResult<Option<Subscription>> {
        Ok(self
            .inner
            .subscriptions
            .read()
            .values()
            .find(|s| s.user_id == user_id)
            .cloned())
    }

    async fn create_subscription(&self, new: NewSubscription) -> StoreResult<Subscription> {
        let mut subscriptions = self.inner.subscriptions.write();
        if subscriptions.values().any(|s| s.user_id == new.user_id) {
            return Err(StoreError::UniqueViolation {
                constraint: SUBSCRIPTIONS_USER_KEY.into(),
            });
        }

        let id = self.inner.subscription_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Subscription {
            id: SubscriptionId::new(id),
            user_id: new.user_id,
            status: new.status,
            is_trial: new.is_trial,
            start_date: new.start_date,
            end_date: new.end_date,
            traffic_limit_gb: new.traffic_limit_gb,
            traffic_used_gb: 0.0,
            device_limit: new.device_limit,
            connected_servers: new.connected_servers,
            updated_at: Utc::now(),
        };
        subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        let mut subscriptions = self.inner.subscriptions.write();
        match subscriptions.get_mut(&subscription.id.get()) {
            Some(slot) => {
                *slot = subscription.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("subscription {}", subscription.id))),
        }
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<()> {
        self.inner
            .subscriptions
            .write()
            .remove(&id.get())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", id)))
    }

    async fn record_conversion(&self, conversion: TrialConversion) -> StoreResult<()> {
        self.inner.conversions.write().push(conversion);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionType;

    fn new_account(code: &str) -> NewAccount {
        NewAccount {
            external_id: None,
            username: None,
            referral_code: code.into(),
            referred_by: None,
            currency: "RUB".into(),
            promo_group_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_lock() {
        let store = MemoryStore::new();
        let account = store.insert_account(new_account("refA")).await.unwrap();
        assert_eq!(account.id, UserId::new(1));
        assert!(store.referral_code_taken("refA").await.unwrap());

        let guard = store.lock_account(account.id).await.unwrap();
        let committed = guard
            .commit(BalanceChange {
                new_balance: 500,
                promo_offer: PromoOfferChange::Keep,
                transaction: Some(NewTransaction {
                    user_id: account.id,
                    kind: TransactionType::Deposit,
                    amount_minor: 500,
                    description: "top-up".into(),
                    payment_method: None,
                }),
            })
            .await
            .unwrap();
        assert_eq!(committed.account.balance_minor, 500);
        assert_eq!(store.list_transactions(account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_insert_leaves_row_untouched() {
        let store = MemoryStore::new();
        let account = store.insert_account(new_account("refA")).await.unwrap();
        store.fail_next_transaction_insert();

        let guard = store.lock_account(account.id).await.unwrap();
        let result = guard
            .commit(BalanceChange {
                new_balance: 100,
                promo_offer: PromoOfferChange::Clear,
                transaction: Some(NewTransaction {
                    user_id: account.id,
                    kind: TransactionType::Deposit,
                    amount_minor: 100,
                    description: "top-up".into(),
                    payment_method: None,
                }),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_account(account.id).await.unwrap().balance_minor, 0);
        assert!(store.list_transactions(account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_drift_and_resync() {
        let store = MemoryStore::new();
        store.insert_account(new_account("refA")).await.unwrap();
        store.insert_account(new_account("refB")).await.unwrap();

        store.set_account_sequence(2);
        let err = store.insert_account(new_account("refC")).await.unwrap_err();
        assert!(err.is_primary_key_violation());

        assert_eq!(store.resync_account_sequence().await.unwrap(), 3);
        let account = store.insert_account(new_account("refC")).await.unwrap();
        assert_eq!(account.id, UserId::new(3));
        assert_eq!(store.sequence_resyncs(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_referral_code_rejected() {
        let store = MemoryStore::new();
        store.insert_account(new_account("refA")).await.unwrap();
        let err = store.insert_account(new_account("refA")).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::UniqueViolation {
                constraint: REFERRAL_CODE_KEY.into()
            }
        );
        assert_eq!(store.account_count(), 1);
    }
}
