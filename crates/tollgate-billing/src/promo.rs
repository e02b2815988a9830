//! Promo groups and promo offers
//!
//! A promo group is a standing discount per (dimension, period). A promo
//! offer is a single time-limited percent on the account, consumed by the
//! first discounted purchase or cleared by the expiry sweep, whichever
//! takes the row lock first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tollgate_common::{PricingConfig, UserId};
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::model::{ExpiredPromoOffer, PromoOffer, PromoOfferEvent, PromoOfferEventKind};
use crate::store::{AccountStore, BalanceChange, PromoOfferChange, StoreError};

/// Reason logged when the sweep clears an offer
pub const OFFER_EXPIRED_REASON: &str = "offer_expired";

/// Priced dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountCategory {
    /// Base period price
    Period,
    /// Traffic package
    Traffic,
    /// Server add-ons
    Servers,
    /// Extra devices
    Devices,
}

/// Promo group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoGroup {
    /// Group id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Flat server discount percent
    pub server_discount_percent: i32,
    /// Flat traffic discount percent
    pub traffic_discount_percent: i32,
    /// Flat device discount percent
    pub device_discount_percent: i32,
    /// Period discounts keyed by days
    #[serde(default)]
    pub period_discounts: BTreeMap<u32, i32>,
    /// The group new accounts land in
    #[serde(default)]
    pub is_default: bool,
}

impl PromoGroup {
    fn period_discount(&self, period_days: u32, config: &PricingConfig) -> i32 {
        if period_days == 0 {
            return 0;
        }
        if let Some(percent) = self.period_discounts.get(&period_days) {
            return *percent;
        }
        if self.is_default {
            return config
                .base_promo_group_period_discounts
                .get(&period_days)
                .copied()
                .unwrap_or(0);
        }
        0
    }

    /// Discount percent for a dimension in a given period, clamped to 0..=100
    pub fn discount_percent(&self, category: DiscountCategory, period_days: u32, config: &PricingConfig) -> i32 {
        let flat = match category {
            DiscountCategory::Period => return self.period_discount(period_days, config).clamp(0, 100),
            DiscountCategory::Servers => self.server_discount_percent,
            DiscountCategory::Traffic => self.traffic_discount_percent,
            DiscountCategory::Devices => self.device_discount_percent,
        };

        let percent = if flat == 0 && self.is_default {
            self.period_discount(period_days, config)
        } else {
            flat
        };
        percent.clamp(0, 100)
    }
}

/// Discount lookup for an optional group; no group means no discount
pub fn group_discount(
    group: Option<&PromoGroup>,
    category: DiscountCategory,
    period_days: u32,
    config: &PricingConfig,
) -> i32 {
    group
        .map(|g| g.discount_percent(category, period_days, config))
        .unwrap_or(0)
}

/// Promo-offer lifecycle
pub struct PromoOffers {
    accounts: Arc<dyn AccountStore>,
}

impl PromoOffers {
    /// Create the service
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    /// Attach an offer, replacing any current one
    pub async fn grant_offer(
        &self,
        user_id: UserId,
        percent: i32,
        source: Option<String>,
        valid_for: Option<Duration>,
    ) -> Result<PromoOffer, LedgerError> {
        if !(1..=100).contains(&percent) {
            return Err(LedgerError::InvalidAmount(percent.into()));
        }

        let guard = self.accounts.lock_account(user_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => LedgerError::AccountNotFound(user_id.get()),
            other => LedgerError::Store(other),
        })?;

        let offer = PromoOffer {
            percent,
            source,
            expires_at: valid_for.map(|d| Utc::now() + d),
        };
        let balance = guard.account().balance_minor;
        guard
            .commit(BalanceChange {
                new_balance: balance,
                promo_offer: PromoOfferChange::Set(offer.clone()),
                transaction: None,
            })
            .await?;

        info!(user_id = %user_id, percent, expires_at = ?offer.expires_at, "Promo offer granted");
        Ok(offer)
    }

    /// Percent in force for an account at `now`
    pub async fn active_percent(&self, user_id: UserId, now: DateTime<Utc>) -> Result<i32, LedgerError> {
        let account = self.accounts.get_account(user_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => LedgerError::AccountNotFound(user_id.get()),
            other => LedgerError::Store(other),
        })?;
        Ok(account.promo_offer_percent(now))
    }

    /// Clear every offer expired at `now` and log a `disabled` event for each
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredPromoOffer>, StoreError> {
        let cleared = self.accounts.clear_expired_promo_offers(now).await?;

        for expired in &cleared {
            let event = PromoOfferEvent {
                user_id: expired.user_id,
                kind: PromoOfferEventKind::Disabled,
                percent: expired.offer.percent,
                source: expired.offer.source.clone(),
                reason: Some(OFFER_EXPIRED_REASON.into()),
                at: now,
            };
            if let Err(e) = self.accounts.record_promo_offer_event(event).await {
                warn!(user_id = %expired.user_id, error = %e, "Failed to log promo offer expiry");
            }
        }

        if !cleared.is_empty() {
            info!(count = cleared.len(), "Expired promo offers cleared");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewAccount;
    use crate::store::MemoryStore;

    fn group(is_default: bool) -> PromoGroup {
        PromoGroup {
            id: 1,
            name: "Regulars".into(),
            server_discount_percent: 0,
            traffic_discount_percent: 15,
            device_discount_percent: 0,
            period_discounts: BTreeMap::from([(30, 10), (90, 130)]),
            is_default,
        }
    }

    #[test]
    fn test_period_discount_lookup() {
        let config = PricingConfig::default();
        let g = group(false);
        assert_eq!(g.discount_percent(DiscountCategory::Period, 30, &config), 10);
        assert_eq!(g.discount_percent(DiscountCategory::Period, 90, &config), 100);
        assert_eq!(g.discount_percent(DiscountCategory::Period, 60, &config), 0);
        assert_eq!(g.discount_percent(DiscountCategory::Traffic, 60, &config), 15);
        assert_eq!(g.discount_percent(DiscountCategory::Servers, 30, &config), 0);
    }

    #[test]
    fn test_default_group_inherits_period_discount() {
        let mut config = PricingConfig::default();
        config.base_promo_group_period_discounts.insert(180, 20);
        let g = group(true);

        // Period map wins, config fills the gaps
        assert_eq!(g.discount_percent(DiscountCategory::Period, 30, &config), 10);
        assert_eq!(g.discount_percent(DiscountCategory::Period, 180, &config), 20);
        // Zero flat percent inherits the period discount
        assert_eq!(g.discount_percent(DiscountCategory::Servers, 30, &config), 10);
        assert_eq!(g.discount_percent(DiscountCategory::Devices, 180, &config), 20);
        assert_eq!(g.discount_percent(DiscountCategory::Traffic, 180, &config), 15);
        assert_eq!(group_discount(None, DiscountCategory::Period, 30, &config), 0);
    }

    #[tokio::test]
    async fn test_grant_and_sweep() {
        let store = MemoryStore::new();
        let account = store
            .insert_account(NewAccount {
                external_id: None,
                username: None,
                referral_code: "refPROMO".into(),
                referred_by: None,
                currency: "RUB".into(),
                promo_group_id: None,
            })
            .await
            .unwrap();
        let offers = PromoOffers::new(Arc::new(store.clone()));

        offers
            .grant_offer(account.id, 20, Some("spring".into()), Some(Duration::hours(1)))
            .await
            .unwrap();
        let now = Utc::now();
        assert_eq!(offers.active_percent(account.id, now).await.unwrap(), 20);

        assert!(offers.sweep_expired(now).await.unwrap().is_empty());
        let later = now + Duration::hours(2);
        assert_eq!(offers.active_percent(account.id, later).await.unwrap(), 0);

        let cleared = offers.sweep_expired(later).await.unwrap();
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].offer.percent, 20);
        assert!(store.get_account(account.id).await.unwrap().promo_offer.is_none());

        let events = store.promo_offer_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PromoOfferEventKind::Disabled);
        assert_eq!(events[0].reason.as_deref(), Some(OFFER_EXPIRED_REASON));

        // Second sweep finds nothing
        assert!(offers.sweep_expired(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_grant_rejects_bad_percent() {
        let offers = PromoOffers::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            offers.grant_offer(UserId::new(1), 0, None, None).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            offers.grant_offer(UserId::new(1), 10, None, None).await,
            Err(LedgerError::AccountNotFound(1))
        ));
    }
}
