//! PostgreSQL store against a live database
//!
//! Runs only when `TEST_DATABASE_URL` points at a scratch database.

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};
use tollgate_billing::ledger::{Ledger, LedgerEntry};
use tollgate_billing::store::{AccountStore, PgStore};
use tollgate_billing::users::{RegisterUser, UserRegistry};
use tollgate_billing::{LedgerError, TransactionType};

async fn store() -> Option<PgStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = PgStore::connect(&url).await.expect("connect to TEST_DATABASE_URL");
    store.migrate().await.expect("apply migrations");
    Some(store)
}

#[tokio::test]
async fn ledger_round_trip() {
    let Some(store) = store().await else {
        return;
    };
    let registry = UserRegistry::new(Arc::new(store.clone()), "RUB");
    let ledger = Ledger::new(Arc::new(store.clone()));
    let account = assert_ok!(registry.create_user(RegisterUser::default()).await);
    assert_eq!(account.balance_minor, 0);

    assert_ok!(
        ledger
            .credit(account.id, LedgerEntry::new(10_000, TransactionType::Deposit, "top-up"))
            .await
    );
    let receipt = assert_ok!(
        ledger
            .debit(
                account.id,
                LedgerEntry::new(2_500, TransactionType::SubscriptionPayment, "Subscription for 30 days (1 mo)"),
                None,
            )
            .await
    );
    assert_eq!(receipt.new_balance, 7_500);

    let err = assert_err!(
        ledger
            .debit(account.id, LedgerEntry::new(9_000, TransactionType::Withdrawal, "too much"), None)
            .await
    );
    assert!(matches!(err, LedgerError::InsufficientFunds { available: 7_500, .. }));

    let transactions = assert_ok!(store.list_transactions(account.id).await);
    assert_eq!(transactions.len(), 2);
    assert_eq!(ledger.balance(account.id).await.unwrap(), 7_500);
}

#[tokio::test]
async fn sequence_resync_points_past_existing_rows() {
    let Some(store) = store().await else {
        return;
    };
    let registry = UserRegistry::new(Arc::new(store.clone()), "RUB");
    let account = assert_ok!(registry.create_user(RegisterUser::default()).await);

    let next = assert_ok!(store.resync_account_sequence().await);
    assert!(next > account.id.get());
    assert!(store.referral_code_taken(&account.referral_code).await.unwrap());
}
