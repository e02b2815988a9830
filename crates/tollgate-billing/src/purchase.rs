//! Purchase Orchestrator
//!
//! Purchases run inside a [`LedgerSession`](crate::ledger::LedgerSession):
//! the account row is locked while the subscription is read, priced and
//! written, and released by the debit. A failed debit restores the previous
//! subscription. After the debit the purchase is committed; what happens on
//! a provisioning failure is decided by the flow's
//! [`ProvisioningFailurePolicy`].
//!
//! ```text
//!   lock ─► catalog ─► validate ─► price ─► subscription ─► debit ─► provisioning ─► receipt
//!                                    │                        │           │
//!                           insufficient funds          revert on     KeepCharge: log
//!                           (nothing changed)             failure     RefundAndRevoke: restore + refund
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tollgate_common::money::{convert_minor, format_minor, normalize_currency};
use tollgate_common::{remaining_months, PricingConfig, SubscriptionId, TransactionId, UserId};
use tracing::{error, info, warn};

use crate::catalog::{Catalog, CatalogBuilder, CatalogInputs, PriceTag};
use crate::directory::{resolve_rate, RateSource, ServerListing, TariffDirectory};
use crate::error::{PurchaseError, StoreError, ValidationCode};
use crate::hooks::{Noop, ProvisioningSync, PurchaseNotifier};
use crate::ledger::{Ledger, LedgerEntry};
use crate::model::{Account, Subscription, TransactionType, TrialConversion};
use crate::pricing::{rounding_step, validate_selection, PricingEngine, PricingQuote, SelectionRequest};
use crate::promo::{group_discount, DiscountCategory, PromoGroup};
use crate::store::{AccountStore, SubscriptionStore};
use crate::subscriptions::{
    apply_paid_period, new_paid_subscription, new_trial_subscription, remaining_days, Extension, PaidTerms,
};

/// Payment method recorded on trial conversions paid from the balance
pub const BALANCE_PAYMENT_METHOD: &str = "balance";

/// What to do when entitlements cannot be applied after a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningFailurePolicy {
    /// Log and keep the charge; provisioning catches up later
    KeepCharge,
    /// Restore the previous subscription and refund the charge
    RefundAndRevoke,
}

/// Result of [`PurchaseService::preview_purchase`]
#[derive(Debug, Clone, Serialize)]
pub struct PurchasePreview {
    /// Priced selection
    pub quote: PricingQuote,
    /// Balance in the quote currency
    pub balance_minor: i64,
    /// Top-up needed: `max(0, final_total - balance)`
    pub missing_amount: i64,
    /// Balance covers the total
    pub can_purchase: bool,
}

/// Result of [`PurchaseService::submit_purchase`]
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseReceipt {
    /// Balance after the charge
    pub new_balance: i64,
    /// Charged amount
    pub final_total: i64,
    /// Account currency
    pub currency: String,
    /// Subscription created or extended
    pub subscription_id: SubscriptionId,
    /// Subscription as stored
    pub subscription: Subscription,
    /// Audit transaction
    pub transaction_id: Option<TransactionId>,
    /// Human-readable summary
    pub receipt_message: String,
    /// A trial was converted to a paid subscription
    pub was_trial_conversion: bool,
}

/// Result of [`PurchaseService::activate_trial`]
#[derive(Debug, Clone, Serialize)]
pub struct TrialActivation {
    /// The trial subscription
    pub subscription: Subscription,
    /// Activation fee charged
    pub charged_minor: i64,
    /// Balance afterwards
    pub new_balance: i64,
}

/// Price of extra devices for the rest of the current term
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAddonQuote {
    /// Devices added
    pub additional: u32,
    /// Device limit after the purchase
    pub new_device_limit: u32,
    /// Days left on the subscription
    pub remaining_days: u32,
    /// Months billed
    pub months: u32,
    /// Monthly price per device
    pub unit_price: PriceTag,
    /// Amount to charge
    pub total: i64,
    /// Account currency
    pub currency: String,
}

/// Result of [`PurchaseService::purchase_device_addon`]
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAddonReceipt {
    /// The priced add-on
    pub quote: DeviceAddonQuote,
    /// Balance after the charge
    pub new_balance: i64,
    /// Audit transaction
    pub transaction_id: Option<TransactionId>,
}

/// Subscription written for a purchase, before the charge commits
struct StoredPeriod {
    subscription: Subscription,
    previous: Option<Subscription>,
    extension: Option<Extension>,
}

/// Purchase orchestrator
pub struct PurchaseService {
    config: Arc<PricingConfig>,
    accounts: Arc<dyn AccountStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    directory: Arc<dyn TariffDirectory>,
    rates: Arc<dyn RateSource>,
    ledger: Arc<Ledger>,
    provisioning: Arc<dyn ProvisioningSync>,
    notifier: Arc<dyn PurchaseNotifier>,
    purchase_policy: ProvisioningFailurePolicy,
    trial_policy: ProvisioningFailurePolicy,
}

impl PurchaseService {
    /// Create a service with no-op provisioning and notification
    pub fn new(
        config: Arc<PricingConfig>,
        accounts: Arc<dyn AccountStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        directory: Arc<dyn TariffDirectory>,
        rates: Arc<dyn RateSource>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            config,
            accounts,
            subscriptions,
            directory,
            rates,
            ledger,
            provisioning: Arc::new(Noop),
            notifier: Arc::new(Noop),
            purchase_policy: ProvisioningFailurePolicy::KeepCharge,
            trial_policy: ProvisioningFailurePolicy::RefundAndRevoke,
        }
    }

    /// Set the provisioning endpoint
    pub fn with_provisioning(mut self, provisioning: Arc<dyn ProvisioningSync>) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Set the purchase notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn PurchaseNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the provisioning failure policies
    pub fn with_failure_policies(
        mut self,
        purchase: ProvisioningFailurePolicy,
        trial: ProvisioningFailurePolicy,
    ) -> Self {
        self.purchase_policy = purchase;
        self.trial_policy = trial;
        self
    }

    /// Catalog snapshot; `currency` defaults to the account currency
    pub async fn get_purchase_options(&self, user_id: UserId, currency: Option<&str>) -> Result<Catalog, PurchaseError> {
        let account = self.account(user_id).await?;
        let subscription = self.subscriptions.subscription_for_user(user_id).await?;
        let currency = currency
            .map(|c| normalize_currency(Some(c)))
            .unwrap_or_else(|| account.currency.clone());
        self.catalog_for(&account, subscription.as_ref(), &currency, Utc::now())
            .await
    }

    /// Price a selection without charging
    pub async fn preview_purchase(
        &self,
        user_id: UserId,
        request: &SelectionRequest,
        currency: Option<&str>,
    ) -> Result<PurchasePreview, PurchaseError> {
        let catalog = self.get_purchase_options(user_id, currency).await?;
        let selection = validate_selection(&catalog, request)?;
        let quote = PricingEngine::price(&catalog, &selection)?;

        let missing_amount = (quote.final_total - catalog.balance_minor).max(0);
        Ok(PurchasePreview {
            quote,
            balance_minor: catalog.balance_minor,
            missing_amount,
            can_purchase: missing_amount == 0,
        })
    }

    /// Recompute the price, charge the balance and create or extend the subscription.
    ///
    /// The account row stays locked from pricing to the charge: a concurrent
    /// purchase for the same user waits and then sees this one's subscription
    /// and promo offer.
    pub async fn submit_purchase(&self, user_id: UserId, request: &SelectionRequest) -> Result<PurchaseReceipt, PurchaseError> {
        let now = Utc::now();
        let session = self.ledger.begin(user_id).await?;
        let account = session.account().clone();
        let currency = account.currency.clone();

        let prepared = async {
            let current = self.subscriptions.subscription_for_user(user_id).await?;
            let catalog = self.catalog_for(&account, current.as_ref(), &currency, now).await?;
            let selection = validate_selection(&catalog, request)?;
            let quote = PricingEngine::price(&catalog, &selection)?;
            if quote.final_total <= 0 {
                return Err(PurchaseError::Calculation(format!(
                    "non-positive total {} for {}",
                    quote.final_total, selection.period_id
                )));
            }
            session.check_funds(quote.final_total)?;

            let terms = PaidTerms {
                period_days: selection.period_days,
                traffic_limit_gb: selection.traffic_value,
                device_limit: selection.devices,
                servers: selection.servers.clone(),
            };
            let stored = self.store_paid_period(user_id, current, &terms, now).await?;
            Ok::<_, PurchaseError>((selection, quote, stored))
        }
        .await;
        let (selection, quote, stored) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                session.release().await;
                return Err(e);
            }
        };

        let entry = LedgerEntry::new(
            quote.final_total,
            TransactionType::SubscriptionPayment,
            format!("Subscription for {} days ({} mo)", selection.period_days, quote.months),
        );
        let charge = match session.debit(entry, quote.priced_promo_offer()).await {
            Ok(charge) => charge,
            Err(e) => {
                self.revert_subscription(user_id, stored.previous.as_ref(), &stored.subscription)
                    .await;
                return Err(e.into());
            }
        };
        let transaction_id = charge.transaction.as_ref().map(|t| t.id);

        if let Some(extension) = stored.extension {
            let conversion = TrialConversion {
                user_id,
                trial_duration_days: extension.trial_duration_days,
                payment_method: BALANCE_PAYMENT_METHOD.into(),
                first_payment_minor: quote.final_total,
                first_paid_period_days: selection.period_days,
                converted_at: now,
            };
            if let Err(e) = self.subscriptions.record_conversion(conversion).await {
                warn!(user_id = %user_id, error = %e, "Failed to record trial conversion");
            }
        }

        let subscription = stored.subscription;
        self.settle_provisioning(
            self.purchase_policy,
            &charge.account,
            &subscription,
            stored.previous.as_ref(),
            quote.final_total,
        )
        .await?;

        let receipt = PurchaseReceipt {
            new_balance: charge.new_balance,
            final_total: quote.final_total,
            receipt_message: receipt_message(&quote, &subscription),
            currency,
            subscription_id: subscription.id,
            subscription,
            transaction_id,
            was_trial_conversion: stored.extension.is_some(),
        };

        info!(
            user_id = %user_id,
            subscription_id = %receipt.subscription_id,
            period_days = selection.period_days,
            amount = %format_minor(receipt.final_total, &receipt.currency, None),
            promo_discount = quote.promo_discount_value,
            "Subscription purchased"
        );

        if let Err(e) = self.notifier.purchase_completed(&charge.account, &receipt).await {
            warn!(user_id = %user_id, error = %e, "Purchase notification failed");
        }
        Ok(receipt)
    }

    async fn store_paid_period(
        &self,
        user_id: UserId,
        current: Option<Subscription>,
        terms: &PaidTerms,
        now: DateTime<Utc>,
    ) -> Result<StoredPeriod, PurchaseError> {
        let mut subscription = match current {
            Some(existing) => existing,
            None => match self
                .subscriptions
                .create_subscription(new_paid_subscription(user_id, terms, now))
                .await
            {
                Ok(created) => {
                    return Ok(StoredPeriod {
                        subscription: created,
                        previous: None,
                        extension: None,
                    })
                }
                // A trial was activated since the read
                Err(StoreError::UniqueViolation { constraint }) => {
                    warn!(user_id = %user_id, constraint = %constraint, "Subscription created concurrently, extending it");
                    self.subscriptions
                        .subscription_for_user(user_id)
                        .await?
                        .ok_or(PurchaseError::Store(StoreError::UniqueViolation { constraint }))?
                }
                Err(e) => return Err(e.into()),
            },
        };

        let previous = subscription.clone();
        let extension = apply_paid_period(
            &mut subscription,
            terms,
            now,
            self.config.trial_add_remaining_days_to_paid,
        );
        self.subscriptions.update_subscription(&subscription).await?;

        if extension.converted_trial && !extension.carried_over.is_zero() {
            info!(user_id = %user_id, carried_hours = extension.carried_over.num_hours(), "Unused trial time carried over");
        }
        Ok(StoredPeriod {
            subscription,
            previous: Some(previous),
            extension: extension.converted_trial.then_some(extension),
        })
    }

    /// Start a trial; the activation fee is refunded if provisioning fails
    pub async fn activate_trial(&self, user_id: UserId) -> Result<TrialActivation, PurchaseError> {
        let now = Utc::now();
        let account = self.account(user_id).await?;
        if self.subscriptions.subscription_for_user(user_id).await?.is_some() {
            return Err(PurchaseError::validation(
                ValidationCode::TrialUnavailable,
                "account already has a subscription",
            ));
        }

        let servers: Vec<String> = self
            .directory
            .trial_servers()
            .await?
            .into_iter()
            .map(|s| s.uuid)
            .collect();
        let price = self.from_base(self.config.trial_activation_price, &account.currency).await?;

        let mut new_balance = account.balance_minor;
        if price > 0 {
            let entry = LedgerEntry::new(
                price,
                TransactionType::SubscriptionPayment,
                format!("Trial activation ({} days)", self.config.trial_duration_days),
            );
            new_balance = self.ledger.debit(user_id, entry, None).await?.new_balance;
        }

        let created = self
            .subscriptions
            .create_subscription(new_trial_subscription(user_id, &self.config, servers, now))
            .await;
        let subscription = match created {
            Ok(subscription) => subscription,
            Err(e) => {
                self.refund(user_id, price, "Refund: trial activation failed").await;
                return Err(match e {
                    StoreError::UniqueViolation { .. } => PurchaseError::validation(
                        ValidationCode::TrialUnavailable,
                        "account already has a subscription",
                    ),
                    other => other.into(),
                });
            }
        };

        self.settle_provisioning(self.trial_policy, &account, &subscription, None, price)
            .await?;

        info!(user_id = %user_id, subscription_id = %subscription.id, charged = price, "Trial activated");
        Ok(TrialActivation {
            subscription,
            charged_minor: price,
            new_balance,
        })
    }

    /// Price extra devices for the remainder of the current paid term
    pub async fn quote_device_addon(&self, user_id: UserId, additional: u32) -> Result<DeviceAddonQuote, PurchaseError> {
        let now = Utc::now();
        let account = self.account(user_id).await?;
        let subscription = self.active_paid_subscription(user_id, now).await?;
        self.price_device_addon(&account, &subscription, additional, now)
            .await
    }

    /// Charge for extra devices and raise the device limit
    pub async fn purchase_device_addon(&self, user_id: UserId, additional: u32) -> Result<DeviceAddonReceipt, PurchaseError> {
        let now = Utc::now();
        let session = self.ledger.begin(user_id).await?;
        let account = session.account().clone();

        let prepared = async {
            let previous = self.active_paid_subscription(user_id, now).await?;
            let quote = self
                .price_device_addon(&account, &previous, additional, now)
                .await?;
            session.check_funds(quote.total)?;

            let mut subscription = previous.clone();
            subscription.device_limit = quote.new_device_limit;
            subscription.updated_at = now;
            self.subscriptions.update_subscription(&subscription).await?;
            Ok::<_, PurchaseError>((previous, subscription, quote))
        }
        .await;
        let (previous, subscription, quote) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                session.release().await;
                return Err(e);
            }
        };

        let (charged_account, new_balance, transaction_id) = if quote.total > 0 {
            let entry = LedgerEntry::new(
                quote.total,
                TransactionType::SubscriptionPayment,
                format!("Extra devices +{} for {} days", additional, quote.remaining_days),
            );
            match session.debit(entry, None).await {
                Ok(charge) => {
                    let tx = charge.transaction.as_ref().map(|t| t.id);
                    (charge.account, charge.new_balance, tx)
                }
                Err(e) => {
                    self.revert_subscription(user_id, Some(&previous), &subscription)
                        .await;
                    return Err(e.into());
                }
            }
        } else {
            session.release().await;
            let balance = account.balance_minor;
            (account, balance, None)
        };

        self.settle_provisioning(
            self.purchase_policy,
            &charged_account,
            &subscription,
            Some(&previous),
            quote.total,
        )
        .await?;

        info!(
            user_id = %user_id,
            device_limit = quote.new_device_limit,
            amount = %format_minor(quote.total, &quote.currency, None),
            "Device add-on purchased"
        );
        Ok(DeviceAddonReceipt {
            quote,
            new_balance,
            transaction_id,
        })
    }

    async fn price_device_addon(
        &self,
        account: &Account,
        subscription: &Subscription,
        additional: u32,
        now: DateTime<Utc>,
    ) -> Result<DeviceAddonQuote, PurchaseError> {
        if additional == 0 {
            return Err(PurchaseError::validation(
                ValidationCode::InvalidDevices,
                "add at least one device",
            ));
        }
        let new_device_limit = subscription.device_limit.saturating_add(additional);
        if self.config.max_devices_limit > 0 && new_device_limit > self.config.max_devices_limit {
            return Err(PurchaseError::validation(
                ValidationCode::InvalidDevices,
                format!("device limit is {}", self.config.max_devices_limit),
            ));
        }

        let group = self.promo_group(account).await?;
        let days = remaining_days(subscription, now);
        let months = remaining_months(days);
        let percent = group_discount(group.as_ref(), DiscountCategory::Devices, days, &self.config);
        let unit_price = PriceTag::new(
            self.from_base(self.config.price_per_device, &account.currency).await?,
            percent,
            rounding_step(&account.currency),
        );

        let total = unit_price
            .discounted
            .checked_mul(i64::from(additional))
            .and_then(|v| v.checked_mul(i64::from(months)))
            .ok_or_else(|| PurchaseError::Calculation("amount overflow".into()))?;

        Ok(DeviceAddonQuote {
            additional,
            new_device_limit,
            remaining_days: days,
            months,
            unit_price,
            total,
            currency: account.currency.clone(),
        })
    }

    async fn active_paid_subscription(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Subscription, PurchaseError> {
        self.subscriptions
            .subscription_for_user(user_id)
            .await?
            .filter(|s| !s.is_trial && s.is_active_at(now))
            .ok_or_else(|| {
                PurchaseError::validation(
                    ValidationCode::AddonUnavailable,
                    "an active paid subscription is required",
                )
            })
    }

    async fn settle_provisioning(
        &self,
        policy: ProvisioningFailurePolicy,
        account: &Account,
        subscription: &Subscription,
        previous: Option<&Subscription>,
        charged: i64,
    ) -> Result<(), PurchaseError> {
        let Err(e) = self.provisioning.apply_entitlements(account, subscription).await else {
            return Ok(());
        };

        match policy {
            ProvisioningFailurePolicy::KeepCharge => {
                warn!(user_id = %account.id, subscription_id = %subscription.id, error = %e, "Provisioning sync failed, charge kept");
                Ok(())
            }
            ProvisioningFailurePolicy::RefundAndRevoke => {
                warn!(user_id = %account.id, subscription_id = %subscription.id, error = %e, "Provisioning sync failed, reverting");
                self.revert_subscription(account.id, previous, subscription).await;
                self.refund(account.id, charged, "Refund: provisioning failed").await;
                Err(PurchaseError::Provisioning(e.to_string()))
            }
        }
    }

    async fn revert_subscription(&self, user_id: UserId, previous: Option<&Subscription>, current: &Subscription) {
        let restored = match previous {
            Some(prev) => self.subscriptions.update_subscription(prev).await,
            None => self.subscriptions.delete_subscription(current.id).await,
        };
        if let Err(e) = restored {
            error!(user_id = %user_id, subscription_id = %current.id, error = %e, "Failed to revert subscription");
        }
    }

    async fn refund(&self, user_id: UserId, amount: i64, description: &str) {
        if amount <= 0 {
            return;
        }
        if let Err(e) = self
            .ledger
            .credit(user_id, LedgerEntry::new(amount, TransactionType::Refund, description))
            .await
        {
            error!(user_id = %user_id, amount_minor = amount, error = %e, "Refund failed");
        }
    }

    async fn account(&self, user_id: UserId) -> Result<Account, PurchaseError> {
        self.accounts.get_account(user_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => PurchaseError::AccountNotFound(user_id.get()),
            other => other.into(),
        })
    }

    async fn promo_group(&self, account: &Account) -> Result<Option<PromoGroup>, PurchaseError> {
        match account.promo_group_id {
            Some(id) => Ok(self.directory.promo_group(id).await?),
            None => Ok(None),
        }
    }

    async fn from_base(&self, amount: i64, currency: &str) -> Result<i64, PurchaseError> {
        let base = self.config.base_currency();
        let rate = resolve_rate(self.rates.as_ref(), &base, currency).await?;
        Ok(convert_minor(amount, &base, currency, rate)?)
    }

    async fn purchasable_servers(
        &self,
        promo_group_id: Option<i64>,
        subscription: Option<&Subscription>,
    ) -> Result<Vec<ServerListing>, PurchaseError> {
        let mut servers: Vec<ServerListing> = self
            .directory
            .available_servers(promo_group_id)
            .await?
            .into_iter()
            .filter(|s| !s.trial_only)
            .collect();

        for uuid in subscription.map(|s| s.connected_servers.as_slice()).unwrap_or_default() {
            if servers.iter().any(|s| &s.uuid == uuid) {
                continue;
            }
            if let Some(server) = self.directory.server_by_uuid(uuid).await? {
                servers.push(server);
            }
        }
        Ok(servers)
    }

    async fn catalog_for(
        &self,
        account: &Account,
        subscription: Option<&Subscription>,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Result<Catalog, PurchaseError> {
        let base = self.config.base_currency();
        let rate_from_base = resolve_rate(self.rates.as_ref(), &base, currency).await?;
        let balance_minor = if account.currency == currency {
            account.balance_minor
        } else {
            let rate = resolve_rate(self.rates.as_ref(), &account.currency, currency).await?;
            convert_minor(account.balance_minor, &account.currency, currency, rate)?
        };

        let group = self.promo_group(account).await?;
        let servers = self
            .purchasable_servers(account.promo_group_id, subscription)
            .await?;
        let (period_overrides, traffic_overrides) = if self.config.multi_currency_enabled {
            (
                self.directory.period_price_overrides(currency).await?,
                self.directory.traffic_price_overrides(currency).await?,
            )
        } else {
            Default::default()
        };

        CatalogBuilder::build(
            &self.config,
            CatalogInputs {
                currency: currency.to_string(),
                rate_from_base,
                balance_minor,
                promo_offer_percent: account.promo_offer_percent(now),
                promo_group: group.as_ref(),
                subscription,
                servers,
                period_overrides,
                traffic_overrides,
            },
        )
    }
}

fn receipt_message(quote: &PricingQuote, subscription: &Subscription) -> String {
    let mut message = format!(
        "Subscription purchased successfully!\nPeriod: {} days\nPaid: {}\nValid until: {}",
        quote.selection.period_days,
        format_minor(quote.final_total, &quote.currency, None),
        subscription.end_date.format("%Y-%m-%d %H:%M UTC"),
    );
    if quote.promo_discount_value > 0 {
        message.push_str(&format!(
            "\nExtra discount {}%: -{}",
            quote.promo_discount_percent,
            format_minor(quote.promo_discount_value, &quote.currency, None),
        ));
    }
    message
}
