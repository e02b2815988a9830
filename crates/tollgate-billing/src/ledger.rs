//! Balance Ledger
//!
//! The only writer of account balances. Every mutation is a single-writer
//! critical section on one account row:
//!
//! ```text
//!   Stable ──lock──► Locked ──commit / rollback──► Stable
//! ```
//!
//! A debit re-reads the balance under the lock and fails before writing
//! anything when it would go negative. The audit transaction is written in
//! the same commit as the balance.
//!
//! A caller that must write other rows before the charge holds the lock
//! through a [`LedgerSession`] and debits at the end.

use chrono::Utc;
use std::sync::Arc;
use tollgate_common::money::format_minor;
use tollgate_common::UserId;
use tracing::{error, info, warn};

use crate::error::LedgerError;
use crate::hooks::{BalanceObserver, Noop};
use crate::model::{Account, NewTransaction, PromoOffer, PromoOfferEvent, PromoOfferEventKind, Transaction, TransactionType};
use crate::store::{AccountGuard, AccountStore, BalanceChange, PromoOfferChange, StoreError};

/// One balance movement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Amount in minor units, not negative
    pub amount_minor: i64,
    /// Transaction type
    pub kind: TransactionType,
    /// Description stored on the transaction
    pub description: String,
    /// Payment method tag
    pub payment_method: Option<String>,
    /// Write an audit transaction in the same commit
    pub record_transaction: bool,
}

impl LedgerEntry {
    /// Entry that records a transaction
    pub fn new(amount_minor: i64, kind: TransactionType, description: impl Into<String>) -> Self {
        Self {
            amount_minor,
            kind,
            description: description.into(),
            payment_method: None,
            record_transaction: true,
        }
    }

    /// Tag the payment method
    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = Some(method.into());
        self
    }

    /// Change the balance without an audit record
    pub fn without_transaction(mut self) -> Self {
        self.record_transaction = false;
        self
    }

    fn transaction_for(&self, user_id: UserId) -> Option<NewTransaction> {
        self.record_transaction.then(|| NewTransaction {
            user_id,
            kind: self.kind,
            amount_minor: self.amount_minor,
            description: self.description.clone(),
            payment_method: self.payment_method.clone(),
        })
    }
}

/// Outcome of a committed mutation
#[derive(Debug, Clone)]
pub struct BalanceReceipt {
    /// Account after the mutation
    pub account: Account,
    /// Balance before
    pub old_balance: i64,
    /// Balance after
    pub new_balance: i64,
    /// Transaction written with it
    pub transaction: Option<Transaction>,
    /// Offer cleared by this debit
    pub consumed_promo_offer: Option<PromoOffer>,
}

/// Balance ledger
pub struct Ledger {
    accounts: Arc<dyn AccountStore>,
    observer: Arc<dyn BalanceObserver>,
}

impl Ledger {
    /// Create a ledger without a credit follow-up
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            accounts,
            observer: Arc::new(Noop),
        }
    }

    /// Set the follow-up run after qualifying credits
    pub fn with_observer(mut self, observer: Arc<dyn BalanceObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Current balance
    pub async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let account = self
            .accounts
            .get_account(user_id)
            .await
            .map_err(|e| not_found_as_account(e, user_id))?;
        Ok(account.balance_minor)
    }

    async fn lock(&self, user_id: UserId) -> Result<Box<dyn AccountGuard>, LedgerError> {
        self.accounts
            .lock_account(user_id)
            .await
            .map_err(|e| not_found_as_account(e, user_id))
    }

    /// Increase a balance. Never fails for lack of funds.
    pub async fn credit(&self, user_id: UserId, entry: LedgerEntry) -> Result<BalanceReceipt, LedgerError> {
        if entry.amount_minor < 0 {
            return Err(LedgerError::InvalidAmount(entry.amount_minor));
        }

        let guard = self.lock(user_id).await?;
        let old_balance = guard.account().balance_minor;
        let currency = guard.account().currency.clone();
        let Some(new_balance) = old_balance.checked_add(entry.amount_minor) else {
            guard.rollback().await;
            return Err(LedgerError::InvalidAmount(entry.amount_minor));
        };

        let committed = guard
            .commit(BalanceChange {
                new_balance,
                promo_offer: PromoOfferChange::Keep,
                transaction: entry.transaction_for(user_id),
            })
            .await
            .map_err(|e| {
                error!(user_id = %user_id, amount_minor = entry.amount_minor, error = %e, "Credit rolled back");
                LedgerError::Store(e)
            })?;

        info!(
            user_id = %user_id,
            kind = %entry.kind,
            amount = %format_minor(entry.amount_minor, &currency, None),
            old_balance,
            new_balance,
            "Balance credited"
        );

        if entry.kind.triggers_balance_followup() {
            if let Err(e) = self
                .observer
                .balance_credited(&committed.account, entry.kind, entry.amount_minor)
                .await
            {
                warn!(user_id = %user_id, error = %e, "Balance follow-up failed");
            }
        }

        Ok(BalanceReceipt {
            account: committed.account,
            old_balance,
            new_balance,
            transaction: committed.transaction,
            consumed_promo_offer: None,
        })
    }

    /// Decrease a balance under the row lock.
    ///
    /// `promo_offer_percent` is the offer percent the amount was priced with.
    /// The locked account must still carry that offer; it is cleared in the
    /// same write.
    pub async fn debit(
        &self,
        user_id: UserId,
        entry: LedgerEntry,
        promo_offer_percent: Option<i32>,
    ) -> Result<BalanceReceipt, LedgerError> {
        self.begin(user_id).await?.debit(entry, promo_offer_percent).await
    }

    /// Lock an account for a charge that needs more work under the same lock
    pub async fn begin(&self, user_id: UserId) -> Result<LedgerSession<'_>, LedgerError> {
        let guard = self.lock(user_id).await?;
        Ok(LedgerSession {
            ledger: self,
            user_id,
            guard,
        })
    }
}

/// One account held under its row lock until [`LedgerSession::debit`] or
/// [`LedgerSession::release`]
pub struct LedgerSession<'a> {
    ledger: &'a Ledger,
    user_id: UserId,
    guard: Box<dyn AccountGuard>,
}

impl LedgerSession<'_> {
    /// Account as read under the lock
    pub fn account(&self) -> &Account {
        self.guard.account()
    }

    /// Fail when the locked balance cannot cover `amount_minor`
    pub fn check_funds(&self, amount_minor: i64) -> Result<(), LedgerError> {
        let available = self.account().balance_minor;
        if available < amount_minor {
            warn!(
                user_id = %self.user_id,
                required = amount_minor,
                available,
                "Insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds {
                required: amount_minor,
                available,
            });
        }
        Ok(())
    }

    /// Release the lock without changes
    pub async fn release(self) {
        self.guard.rollback().await;
    }

    /// Commit the debit and release the lock
    pub async fn debit(
        self,
        entry: LedgerEntry,
        promo_offer_percent: Option<i32>,
    ) -> Result<BalanceReceipt, LedgerError> {
        let Self { ledger, user_id, guard } = self;
        if entry.amount_minor < 0 {
            guard.rollback().await;
            return Err(LedgerError::InvalidAmount(entry.amount_minor));
        }

        let old_balance = guard.account().balance_minor;
        let currency = guard.account().currency.clone();

        if old_balance < entry.amount_minor {
            guard.rollback().await;
            warn!(
                user_id = %user_id,
                required = entry.amount_minor,
                available = old_balance,
                "Insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds {
                required: entry.amount_minor,
                available: old_balance,
            });
        }

        let consumed = match promo_offer_percent.filter(|p| *p > 0) {
            Some(expected) => {
                let active = guard.account().promo_offer_percent(Utc::now());
                if active != expected {
                    guard.rollback().await;
                    warn!(user_id = %user_id, expected, active, "Promo offer changed since pricing");
                    return Err(LedgerError::PromoOfferChanged { expected, active });
                }
                guard.account().promo_offer.clone()
            }
            None => None,
        };

        let new_balance = old_balance - entry.amount_minor;
        let committed = guard
            .commit(BalanceChange {
                new_balance,
                promo_offer: if consumed.is_some() {
                    PromoOfferChange::Clear
                } else {
                    PromoOfferChange::Keep
                },
                transaction: entry.transaction_for(user_id),
            })
            .await
            .map_err(|e| {
                error!(user_id = %user_id, amount_minor = entry.amount_minor, error = %e, "Debit rolled back");
                LedgerError::Store(e)
            })?;

        info!(
            user_id = %user_id,
            kind = %entry.kind,
            amount = %format_minor(entry.amount_minor, &currency, None),
            old_balance,
            new_balance,
            "Balance debited"
        );

        if let Some(offer) = &consumed {
            let event = PromoOfferEvent {
                user_id,
                kind: PromoOfferEventKind::Consumed,
                percent: offer.percent,
                source: offer.source.clone(),
                reason: None,
                at: Utc::now(),
            };
            if let Err(e) = ledger.accounts.record_promo_offer_event(event).await {
                warn!(user_id = %user_id, error = %e, "Failed to log promo offer consumption");
            }
        }

        Ok(BalanceReceipt {
            account: committed.account,
            old_balance,
            new_balance,
            transaction: committed.transaction,
            consumed_promo_offer: consumed,
        })
    }
}

fn not_found_as_account(err: StoreError, user_id: UserId) -> LedgerError {
    match err {
        StoreError::NotFound(_) => LedgerError::AccountNotFound(user_id.get()),
        other => LedgerError::Store(other),
    }
}
