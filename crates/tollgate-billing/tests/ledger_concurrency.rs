//! Concurrent balance mutations on one account

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use tollgate_billing::ledger::{Ledger, LedgerEntry};
use tollgate_billing::model::NewAccount;
use tollgate_billing::store::AccountStore;
use tollgate_billing::{
    BillingPlatform, LedgerError, MemoryStore, PurchaseError, SelectionRequest, TransactionType,
};
use tollgate_common::{PricingConfig, TrafficMode, UserId};

async fn account_with_balance(store: &MemoryStore, ledger: &Ledger, balance: i64) -> UserId {
    let account = store
        .insert_account(NewAccount {
            external_id: None,
            username: None,
            referral_code: "refRACE".into(),
            referred_by: None,
            currency: "RUB".into(),
            promo_group_id: None,
        })
        .await
        .unwrap();
    ledger
        .credit(account.id, LedgerEntry::new(balance, TransactionType::Deposit, "seed").without_transaction())
        .await
        .unwrap();
    account.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_exactly_one_wins() {
    let store = MemoryStore::new();
    let ledger = Arc::new(Ledger::new(Arc::new(store.clone())));
    let user = account_with_balance(&store, &ledger, 10_000).await;

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit(
                        user,
                        LedgerEntry::new(6_000, TransactionType::SubscriptionPayment, format!("race {}", i)),
                        None,
                    )
                    .await
            })
        })
        .collect();

    let mut ok = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::InsufficientFunds { required, available }) => {
                assert_eq!(required, 6_000);
                assert_eq!(available, 4_000);
                insufficient += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!((ok, insufficient), (1, 1));
    assert_eq!(ledger.balance(user).await.unwrap(), 4_000);
    assert_eq!(store.list_transactions(user).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn balance_never_negative_under_mixed_load() {
    let store = MemoryStore::new();
    let ledger = Arc::new(Ledger::new(Arc::new(store.clone())));
    let start = 50_000;
    let user = account_with_balance(&store, &ledger, start).await;

    let ops: Vec<(bool, i64)> = {
        let mut rng = rand::thread_rng();
        (0..200)
            .map(|_| (rng.gen_bool(0.3), rng.gen_range(1..5_000)))
            .collect()
    };

    let handles: Vec<_> = ops
        .into_iter()
        .map(|(is_credit, amount)| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                if is_credit {
                    ledger
                        .credit(user, LedgerEntry::new(amount, TransactionType::Deposit, "load"))
                        .await
                        .map(|r| (true, amount, r.new_balance))
                } else {
                    ledger
                        .debit(user, LedgerEntry::new(amount, TransactionType::Withdrawal, "load"), None)
                        .await
                        .map(|r| (false, amount, r.new_balance))
                }
            })
        })
        .collect();

    let mut credited = 0;
    let mut debited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok((is_credit, amount, new_balance)) => {
                assert!(new_balance >= 0);
                if is_credit {
                    credited += amount;
                } else {
                    debited += amount;
                }
            }
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let balance = ledger.balance(user).await.unwrap();
    assert!(balance >= 0);
    assert_eq!(balance, start + credited - debited);

    let recorded: i64 = store
        .list_transactions(user)
        .await
        .unwrap()
        .iter()
        .map(|tx| match tx.kind {
            TransactionType::Deposit => tx.amount_minor,
            _ => -tx.amount_minor,
        })
        .sum();
    assert_eq!(recorded, credited - debited);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_purchases_see_each_other() {
    let config = PricingConfig {
        available_periods: vec![30],
        period_prices: BTreeMap::from([(30, 6_000)]),
        traffic_mode: TrafficMode::Fixed,
        traffic_packages: vec![],
        ..PricingConfig::default()
    };
    let store = MemoryStore::new();
    let platform = Arc::new(BillingPlatform::builder(config).store(store.clone()).build().unwrap());
    let account = platform.create_user(Default::default()).await.unwrap();
    platform
        .ledger
        .credit(account.id, LedgerEntry::new(10_000, TransactionType::Deposit, "top-up"))
        .await
        .unwrap();

    let request = SelectionRequest {
        period_days: Some(30),
        ..Default::default()
    };
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let platform = platform.clone();
            let request = request.clone();
            tokio::spawn(async move { platform.submit_purchase(account.id, &request).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    let missing: Vec<i64> = outcomes
        .iter()
        .filter_map(|o| match o {
            Err(PurchaseError::InsufficientFunds { missing }) => Some(*missing),
            _ => None,
        })
        .collect();

    assert_eq!(succeeded, 1);
    assert_eq!(missing, vec![2_000]);
    assert_eq!(platform.ledger.balance(account.id).await.unwrap(), 4_000);
}
