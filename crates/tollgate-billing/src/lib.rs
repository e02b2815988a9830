//! Tollgate Billing
//!
//! Prepaid balance ledger, pricing and purchase flow for subscription access.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          BILLING PLATFORM                               │
//! │                                                                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                 │
//! │  │   Catalog    │──►│   Pricing    │──►│   Purchase   │──► provisioning │
//! │  │   Builder    │   │   Engine     │   │ Orchestrator │──► notifier     │
//! │  └──────┬───────┘   └──────────────┘   └──────┬───────┘                 │
//! │         │ directory, rates, promo groups      │ debit / credit          │
//! │         ▼                                     ▼                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                 │
//! │  │ User Registry│   │ Promo Offers │   │    Ledger    │                 │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘                 │
//! │         └──────────────────┼──────────────────┘                         │
//! │                            ▼                                            │
//! │            AccountStore / SubscriptionStore (memory, postgres)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Catalog building and pricing are pure reads. The ledger is the only
//! writer of balances and serializes mutations per account.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod directory;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod model;
pub mod pricing;
pub mod promo;
pub mod purchase;
pub mod store;
pub mod subscriptions;
pub mod users;

use std::sync::Arc;
use tollgate_common::{ConfigError, PricingConfig, UserId};

pub use catalog::{Catalog, CatalogBuilder, PeriodOption, PriceTag};
pub use directory::{RateSource, ServerListing, StaticDirectory, StaticRateSource, TariffDirectory};
pub use error::{FailureKind, LedgerError, PurchaseError, RegistrationError, StoreError, ValidationCode};
pub use hooks::{BalanceObserver, Noop, ProvisioningSync, PurchaseNotifier, RecordingProvisioner};
pub use ledger::{BalanceReceipt, Ledger, LedgerEntry};
pub use model::{Account, Subscription, SubscriptionStatus, Transaction, TransactionType};
pub use pricing::{PricingEngine, PricingQuote, Selection, SelectionRequest};
pub use promo::{PromoGroup, PromoOffers};
pub use purchase::{
    DeviceAddonQuote, DeviceAddonReceipt, ProvisioningFailurePolicy, PurchasePreview, PurchaseReceipt,
    PurchaseService, TrialActivation,
};
pub use store::{AccountStore, MemoryStore, PgStore, SubscriptionStore};
pub use users::{ReferralCodeSource, RegisterUser, UserRegistry};

/// Billing platform
pub struct BillingPlatform {
    /// Pricing configuration
    pub config: Arc<PricingConfig>,
    /// Balance ledger
    pub ledger: Arc<Ledger>,
    /// User registry
    pub users: Arc<UserRegistry>,
    /// Promo offers
    pub promo_offers: Arc<PromoOffers>,
    /// Purchase orchestrator
    pub purchases: Arc<PurchaseService>,
}

impl BillingPlatform {
    /// Start building a platform around a configuration
    pub fn builder(config: PricingConfig) -> BillingPlatformBuilder {
        BillingPlatformBuilder::new(config)
    }

    /// Register a user
    pub async fn create_user(&self, request: RegisterUser) -> Result<Account, RegistrationError> {
        self.users.create_user(request).await
    }

    /// Purchase options for a user
    pub async fn get_purchase_options(&self, user_id: UserId, currency: Option<&str>) -> Result<Catalog, PurchaseError> {
        self.purchases.get_purchase_options(user_id, currency).await
    }

    /// Price a selection without charging
    pub async fn preview_purchase(
        &self,
        user_id: UserId,
        request: &SelectionRequest,
        currency: Option<&str>,
    ) -> Result<PurchasePreview, PurchaseError> {
        self.purchases.preview_purchase(user_id, request, currency).await
    }

    /// Charge and apply a selection
    pub async fn submit_purchase(&self, user_id: UserId, request: &SelectionRequest) -> Result<PurchaseReceipt, PurchaseError> {
        self.purchases.submit_purchase(user_id, request).await
    }

    /// Start a trial
    pub async fn activate_trial(&self, user_id: UserId) -> Result<TrialActivation, PurchaseError> {
        self.purchases.activate_trial(user_id).await
    }

    /// Price extra devices for the rest of the current term
    pub async fn quote_device_addon(&self, user_id: UserId, additional: u32) -> Result<DeviceAddonQuote, PurchaseError> {
        self.purchases.quote_device_addon(user_id, additional).await
    }

    /// Charge and apply extra devices
    pub async fn purchase_device_addon(&self, user_id: UserId, additional: u32) -> Result<DeviceAddonReceipt, PurchaseError> {
        self.purchases.purchase_device_addon(user_id, additional).await
    }
}

/// Builder for [`BillingPlatform`]; every collaborator has an in-memory or no-op default
pub struct BillingPlatformBuilder {
    config: PricingConfig,
    accounts: Option<Arc<dyn AccountStore>>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    directory: Arc<dyn TariffDirectory>,
    rates: Arc<dyn RateSource>,
    provisioning: Arc<dyn ProvisioningSync>,
    notifier: Arc<dyn PurchaseNotifier>,
    observer: Arc<dyn BalanceObserver>,
    referral_codes: Option<Arc<dyn ReferralCodeSource>>,
    policies: Option<(ProvisioningFailurePolicy, ProvisioningFailurePolicy)>,
}

impl BillingPlatformBuilder {
    fn new(config: PricingConfig) -> Self {
        Self {
            config,
            accounts: None,
            subscriptions: None,
            directory: Arc::new(StaticDirectory::new()),
            rates: Arc::new(StaticRateSource::new()),
            provisioning: Arc::new(Noop),
            notifier: Arc::new(Noop),
            observer: Arc::new(Noop),
            referral_codes: None,
            policies: None,
        }
    }

    /// Use one store for accounts and subscriptions
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: AccountStore + SubscriptionStore + Clone + 'static,
    {
        self.accounts = Some(Arc::new(store.clone()));
        self.subscriptions = Some(Arc::new(store));
        self
    }

    /// Tariff directory
    pub fn directory(mut self, directory: Arc<dyn TariffDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Currency rate source
    pub fn rates(mut self, rates: Arc<dyn RateSource>) -> Self {
        self.rates = rates;
        self
    }

    /// Provisioning endpoint
    pub fn provisioning(mut self, provisioning: Arc<dyn ProvisioningSync>) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Purchase notifier
    pub fn notifier(mut self, notifier: Arc<dyn PurchaseNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Follow-up after qualifying credits
    pub fn balance_observer(mut self, observer: Arc<dyn BalanceObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Referral code generator
    pub fn referral_codes(mut self, codes: Arc<dyn ReferralCodeSource>) -> Self {
        self.referral_codes = Some(codes);
        self
    }

    /// Provisioning failure policies for purchases and trials
    pub fn failure_policies(mut self, purchase: ProvisioningFailurePolicy, trial: ProvisioningFailurePolicy) -> Self {
        self.policies = Some((purchase, trial));
        self
    }

    /// Validate the configuration and wire the services
    pub fn build(self) -> Result<BillingPlatform, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let (accounts, subscriptions) = match (self.accounts, self.subscriptions) {
            (Some(accounts), Some(subscriptions)) => (accounts, subscriptions),
            _ => {
                let store = MemoryStore::new();
                let accounts: Arc<dyn AccountStore> = Arc::new(store.clone());
                let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(store);
                (accounts, subscriptions)
            }
        };

        let ledger = Arc::new(Ledger::new(accounts.clone()).with_observer(self.observer));

        let mut users = UserRegistry::new(accounts.clone(), &config.base_currency);
        if let Some(codes) = self.referral_codes {
            users = users.with_code_source(codes);
        }

        let mut purchases = PurchaseService::new(
            config.clone(),
            accounts.clone(),
            subscriptions,
            self.directory,
            self.rates,
            ledger.clone(),
        )
        .with_provisioning(self.provisioning)
        .with_notifier(self.notifier);
        if let Some((purchase, trial)) = self.policies {
            purchases = purchases.with_failure_policies(purchase, trial);
        }

        Ok(BillingPlatform {
            config,
            ledger,
            users: Arc::new(users),
            promo_offers: Arc::new(PromoOffers::new(accounts)),
            purchases: Arc::new(purchases),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_platform() {
        let platform = BillingPlatform::builder(PricingConfig::default()).build().unwrap();
        let account = platform.create_user(RegisterUser::default()).await.unwrap();
        assert_eq!(account.currency, "RUB");

        let catalog = platform.get_purchase_options(account.id, None).await.unwrap();
        assert_eq!(catalog.periods.len(), 6);
        assert_eq!(catalog.balance_minor, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PricingConfig::default();
        config.available_periods.clear();
        assert!(BillingPlatform::builder(config).build().is_err());
    }
}
