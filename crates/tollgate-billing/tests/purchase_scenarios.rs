//! End-to-end purchase flows against the in-memory store

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tollgate_billing::model::PromoOfferEventKind;
use tollgate_billing::store::AccountStore;
use tollgate_billing::{
    BillingPlatform, FailureKind, MemoryStore, PromoGroup, PurchaseError, RecordingProvisioner, RegisterUser,
    SelectionRequest, ServerListing, StaticDirectory, SubscriptionStore, TransactionType, ValidationCode,
};
use tollgate_billing::ledger::LedgerEntry;
use tollgate_common::{PricingConfig, TrafficMode, UserId};

fn flat_config(price: i64) -> PricingConfig {
    PricingConfig {
        available_periods: vec![30],
        period_prices: BTreeMap::from([(30, price)]),
        traffic_mode: TrafficMode::Fixed,
        traffic_packages: vec![],
        price_per_device: 0,
        ..PricingConfig::default()
    }
}

fn directory() -> StaticDirectory {
    let directory = StaticDirectory::new();
    directory.add_server(ServerListing {
        id: 1,
        uuid: "nl-1".into(),
        name: "Netherlands".into(),
        price_minor: 0,
        is_available: true,
        is_full: false,
        trial_only: false,
        allowed_promo_groups: vec![],
    });
    directory.add_promo_group(PromoGroup {
        id: 1,
        name: "Regulars".into(),
        server_discount_percent: 0,
        traffic_discount_percent: 0,
        device_discount_percent: 0,
        period_discounts: BTreeMap::from([(30, 10)]),
        is_default: false,
    });
    directory
}

struct Setup {
    platform: BillingPlatform,
    store: MemoryStore,
    provisioner: Arc<RecordingProvisioner>,
}

fn setup(config: PricingConfig) -> Setup {
    let store = MemoryStore::new();
    let provisioner = Arc::new(RecordingProvisioner::new());
    let platform = BillingPlatform::builder(config)
        .store(store.clone())
        .directory(Arc::new(directory()))
        .provisioning(provisioner.clone())
        .build()
        .unwrap();
    Setup {
        platform,
        store,
        provisioner,
    }
}

async fn funded_user(setup: &Setup, balance: i64, promo_group_id: Option<i64>) -> UserId {
    let account = setup
        .platform
        .create_user(RegisterUser {
            promo_group_id,
            ..Default::default()
        })
        .await
        .unwrap();
    setup
        .platform
        .ledger
        .credit(account.id, LedgerEntry::new(balance, TransactionType::Deposit, "top-up"))
        .await
        .unwrap();
    account.id
}

fn month() -> SelectionRequest {
    SelectionRequest {
        period_id: Some("days:30".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn simple_purchase_charges_base_price() {
    let setup = setup(flat_config(29_900));
    let user = funded_user(&setup, 100_000, None).await;

    let preview = setup.platform.preview_purchase(user, &month(), None).await.unwrap();
    assert_eq!(preview.quote.final_total, 29_900);
    assert_eq!(preview.missing_amount, 0);

    let receipt = setup.platform.submit_purchase(user, &month()).await.unwrap();
    assert_eq!(receipt.final_total, 29_900);
    assert_eq!(receipt.new_balance, 70_100);
    assert!(!receipt.was_trial_conversion);
    assert!(receipt.receipt_message.starts_with("Subscription purchased successfully!"));

    let payments: Vec<_> = setup
        .store
        .list_transactions(user)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.kind == TransactionType::SubscriptionPayment)
        .collect();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount_minor, 29_900);
    assert_eq!(Some(payments[0].id), receipt.transaction_id);

    let subscription = setup.store.subscription_for_user(user).await.unwrap().unwrap();
    assert_eq!(subscription.id, receipt.subscription_id);
    assert_eq!(subscription.connected_servers, vec!["nl-1"]);
    assert_eq!(subscription.end_date - subscription.start_date, Duration::days(30));
    assert_eq!(setup.provisioner.applied().len(), 1);
}

#[tokio::test]
async fn stacked_discounts_consume_promo_offer() {
    let setup = setup(flat_config(10_000));
    let user = funded_user(&setup, 50_000, Some(1)).await;
    setup
        .platform
        .promo_offers
        .grant_offer(user, 20, Some("autumn".into()), Some(Duration::days(3)))
        .await
        .unwrap();

    let preview = setup.platform.preview_purchase(user, &month(), None).await.unwrap();
    assert_eq!(preview.quote.base.discounted, 9_000);
    assert_eq!(preview.quote.subtotal, 9_000);
    assert_eq!(preview.quote.promo_discount_value, 1_800);
    assert_eq!(preview.quote.final_total, 7_200);

    let receipt = setup.platform.submit_purchase(user, &month()).await.unwrap();
    assert_eq!(receipt.final_total, 7_200);
    assert_eq!(receipt.new_balance, 42_800);
    assert!(receipt.receipt_message.contains("Extra discount 20%"));

    let account = setup.store.get_account(user).await.unwrap();
    assert!(account.promo_offer.is_none());
    let events = setup.store.promo_offer_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, PromoOfferEventKind::Consumed);
    assert_eq!(events[0].percent, 20);

    // The next purchase pays the group price only
    let second = setup.platform.preview_purchase(user, &month(), None).await.unwrap();
    assert_eq!(second.quote.final_total, 9_000);
}

#[tokio::test]
async fn failed_promo_event_log_does_not_undo_purchase() {
    let setup = setup(flat_config(10_000));
    let user = funded_user(&setup, 50_000, None).await;
    setup
        .platform
        .promo_offers
        .grant_offer(user, 50, None, None)
        .await
        .unwrap();
    setup.store.fail_promo_offer_events(true);

    let receipt = setup.platform.submit_purchase(user, &month()).await.unwrap();
    assert_eq!(receipt.final_total, 5_000);
    assert!(setup.store.get_account(user).await.unwrap().promo_offer.is_none());
}

#[tokio::test]
async fn provisioning_failure_keeps_charge() {
    let setup = setup(flat_config(29_900));
    let user = funded_user(&setup, 100_000, None).await;
    setup.provisioner.set_failing(true);

    let receipt = setup.platform.submit_purchase(user, &month()).await.unwrap();
    assert_eq!(receipt.new_balance, 70_100);
    assert!(setup.store.subscription_for_user(user).await.unwrap().is_some());
    assert!(setup.provisioner.applied().is_empty());
}

#[tokio::test]
async fn trial_activation_refunded_when_provisioning_fails() {
    let mut config = flat_config(29_900);
    config.trial_activation_price = 5_000;
    let setup = setup(config);
    let user = funded_user(&setup, 10_000, None).await;
    setup.provisioner.set_failing(true);

    let err = setup.platform.activate_trial(user).await.unwrap_err();
    assert!(matches!(err, PurchaseError::Provisioning(_)));
    assert_eq!(err.kind(), FailureKind::ConfigurationError);

    assert_eq!(setup.platform.ledger.balance(user).await.unwrap(), 10_000);
    assert!(setup.store.subscription_for_user(user).await.unwrap().is_none());
    let kinds: Vec<_> = setup
        .store
        .list_transactions(user)
        .await
        .unwrap()
        .into_iter()
        .map(|tx| tx.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![TransactionType::Deposit, TransactionType::SubscriptionPayment, TransactionType::Refund]
    );

    // With provisioning back the trial goes through
    setup.provisioner.set_failing(false);
    let trial = setup.platform.activate_trial(user).await.unwrap();
    assert_eq!(trial.charged_minor, 5_000);
    assert_eq!(trial.new_balance, 5_000);
    assert!(trial.subscription.is_trial);
}

#[tokio::test]
async fn invalid_selection_rejected_before_charge() {
    let setup = setup(flat_config(29_900));
    let user = funded_user(&setup, 100_000, None).await;

    let err = setup
        .platform
        .submit_purchase(
            user,
            &SelectionRequest {
                period_id: Some("days:365".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::InvalidSelection);
    assert_eq!(err.code(), Some(ValidationCode::InvalidPeriod));

    let err = setup
        .platform
        .submit_purchase(
            user,
            &SelectionRequest {
                period_id: Some("days:30".into()),
                devices: Some(json!({"count": 2})),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ValidationCode::InvalidDevices));

    assert_eq!(setup.platform.ledger.balance(user).await.unwrap(), 100_000);
    assert!(setup.store.subscription_for_user(user).await.unwrap().is_none());
}

#[tokio::test]
async fn insufficient_funds_reports_missing_amount() {
    let setup = setup(flat_config(29_900));
    let user = funded_user(&setup, 20_000, None).await;

    let err = setup.platform.submit_purchase(user, &month()).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::InsufficientFunds);
    assert!(matches!(err, PurchaseError::InsufficientFunds { missing: 9_900 }));
}

#[tokio::test]
async fn request_json_from_caller() {
    let setup = setup(flat_config(29_900));
    let user = funded_user(&setup, 100_000, None).await;

    let request: SelectionRequest = serde_json::from_value(json!({
        "period": "days:30",
        "serverUuids": ["nl-1"],
        "device_limit": "1"
    }))
    .unwrap();
    let receipt = setup.platform.submit_purchase(user, &request).await.unwrap();
    assert_eq!(receipt.final_total, 29_900);
}
