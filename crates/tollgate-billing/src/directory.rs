//! Tariff directory and currency rates
//!
//! Read-only collaborators maintained by administrative tooling. The billing
//! core only queries them.

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tollgate_common::money::{fixed_rate, normalize_currency};

use crate::error::{PurchaseError, StoreResult};
use crate::promo::PromoGroup;

/// Purchasable server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListing {
    /// Internal id
    pub id: i64,
    /// Public uuid used in selections
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Monthly price (minor units)
    pub price_minor: i64,
    /// Accepting customers
    pub is_available: bool,
    /// At capacity
    pub is_full: bool,
    /// Only offered to trial subscriptions
    pub trial_only: bool,
    /// Promo groups allowed to buy it; empty means everyone
    pub allowed_promo_groups: Vec<i64>,
}

impl ServerListing {
    /// Can be selected for a new purchase
    pub fn is_selectable(&self) -> bool {
        self.is_available && !self.is_full
    }

    fn visible_to(&self, promo_group_id: Option<i64>) -> bool {
        self.allowed_promo_groups.is_empty()
            || promo_group_id.is_some_and(|id| self.allowed_promo_groups.contains(&id))
    }
}

/// Server and tariff directory
#[async_trait]
pub trait TariffDirectory: Send + Sync {
    /// Servers visible to a promo group, trial-only ones included
    async fn available_servers(&self, promo_group_id: Option<i64>) -> StoreResult<Vec<ServerListing>>;

    /// Any server by uuid, regardless of availability
    async fn server_by_uuid(&self, uuid: &str) -> StoreResult<Option<ServerListing>>;

    /// Servers handed to new trials
    async fn trial_servers(&self) -> StoreResult<Vec<ServerListing>>;

    /// Active per-currency period prices, keyed by days
    async fn period_price_overrides(&self, currency: &str) -> StoreResult<HashMap<u32, i64>>;

    /// Active per-currency traffic prices, keyed by GB
    async fn traffic_price_overrides(&self, currency: &str) -> StoreResult<HashMap<u32, i64>>;

    /// Promo group by id
    async fn promo_group(&self, id: i64) -> StoreResult<Option<PromoGroup>>;
}

/// Directory held in memory
#[derive(Default)]
pub struct StaticDirectory {
    servers: RwLock<Vec<ServerListing>>,
    promo_groups: RwLock<HashMap<i64, PromoGroup>>,
    period_overrides: RwLock<HashMap<String, HashMap<u32, i64>>>,
    traffic_overrides: RwLock<HashMap<String, HashMap<u32, i64>>>,
}

impl StaticDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a server
    pub fn add_server(&self, server: ServerListing) {
        let mut servers = self.servers.write();
        servers.retain(|s| s.uuid != server.uuid);
        servers.push(server);
    }

    /// Add or replace a promo group
    pub fn add_promo_group(&self, group: PromoGroup) {
        self.promo_groups.write().insert(group.id, group);
    }

    /// Set a period price for a currency
    pub fn set_period_price(&self, currency: &str, days: u32, price_minor: i64) {
        self.period_overrides
            .write()
            .entry(normalize_currency(Some(currency)))
            .or_default()
            .insert(days, price_minor);
    }

    /// Set a traffic package price for a currency
    pub fn set_traffic_price(&self, currency: &str, gb: u32, price_minor: i64) {
        self.traffic_overrides
            .write()
            .entry(normalize_currency(Some(currency)))
            .or_default()
            .insert(gb, price_minor);
    }
}

#[async_trait]
impl TariffDirectory for StaticDirectory {
    async fn available_servers(&self, promo_group_id: Option<i64>) -> StoreResult<Vec<ServerListing>> {
        Ok(self
            .servers
            .read()
            .iter()
            .filter(|s| s.is_available && s.visible_to(promo_group_id))
            .cloned()
            .collect())
    }

    async fn server_by_uuid(&self, uuid: &str) -> StoreResult<Option<ServerListing>> {
        Ok(self.servers.read().iter().find(|s| s.uuid == uuid).cloned())
    }

    async fn trial_servers(&self) -> StoreResult<Vec<ServerListing>> {
        let servers = self.servers.read();
        let trial: Vec<_> = servers
            .iter()
            .filter(|s| s.trial_only && s.is_selectable())
            .cloned()
            .collect();
        if !trial.is_empty() {
            return Ok(trial);
        }
        Ok(servers.iter().find(|s| s.is_selectable()).cloned().into_iter().collect())
    }

    async fn period_price_overrides(&self, currency: &str) -> StoreResult<HashMap<u32, i64>> {
        Ok(self
            .period_overrides
            .read()
            .get(&normalize_currency(Some(currency)))
            .cloned()
            .unwrap_or_default())
    }

    async fn traffic_price_overrides(&self, currency: &str) -> StoreResult<HashMap<u32, i64>> {
        Ok(self
            .traffic_overrides
            .read()
            .get(&normalize_currency(Some(currency)))
            .cloned()
            .unwrap_or_default())
    }

    async fn promo_group(&self, id: i64) -> StoreResult<Option<PromoGroup>> {
        Ok(self.promo_groups.read().get(&id).cloned())
    }
}

/// Currency rate source
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Target major units per source major unit
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal>;
}

/// Fixed rate table; answers direct and reverse pairs
#[derive(Debug, Default)]
pub struct StaticRateSource {
    rates: RwLock<HashMap<(String, String), Decimal>>,
}

impl StaticRateSource {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rate, builder style
    pub fn with_rate(self, from: &str, to: &str, rate: Decimal) -> Self {
        self.set_rate(from, to, rate);
        self
    }

    /// Add or replace a rate
    pub fn set_rate(&self, from: &str, to: &str, rate: Decimal) {
        self.rates.write().insert(
            (normalize_currency(Some(from)), normalize_currency(Some(to))),
            rate,
        );
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn rate(&self, from: &str, to: &str) -> Option<Decimal> {
        let from = normalize_currency(Some(from));
        let to = normalize_currency(Some(to));
        let rates = self.rates.read();

        if let Some(rate) = rates.get(&(from.clone(), to.clone())) {
            return Some(*rate);
        }
        rates
            .get(&(to, from))
            .filter(|r| !r.is_zero())
            .map(|r| Decimal::ONE / *r)
    }
}

/// Rate between two currencies; fixed pairs bypass the source
pub async fn resolve_rate(source: &dyn RateSource, from: &str, to: &str) -> Result<Decimal, PurchaseError> {
    if let Some(rate) = fixed_rate(from, to) {
        return Ok(rate);
    }
    source
        .rate(from, to)
        .await
        .filter(|r| *r > Decimal::ZERO)
        .ok_or_else(|| PurchaseError::Rate {
            from: normalize_currency(Some(from)),
            to: normalize_currency(Some(to)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_rates_direct_and_reverse() {
        let rates = StaticRateSource::new().with_rate("usd", "RUB", dec!(80));
        assert_eq!(rates.rate("USD", "RUB").await, Some(dec!(80)));
        assert_eq!(rates.rate("RUB", "USD").await, Some(dec!(0.0125)));
        assert_eq!(rates.rate("EUR", "RUB").await, None);
    }

    #[tokio::test]
    async fn test_resolve_rate_fixed_pairs_bypass_source() {
        let rates = StaticRateSource::new();
        assert_eq!(resolve_rate(&rates, "IRR", "TMN").await.unwrap(), dec!(0.1));
        assert_eq!(resolve_rate(&rates, "rub", "RUB").await.unwrap(), Decimal::ONE);
        assert!(matches!(
            resolve_rate(&rates, "RUB", "USD").await,
            Err(PurchaseError::Rate { .. })
        ));
    }

    #[tokio::test]
    async fn test_trial_servers_fall_back_to_first_selectable() {
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
        let trial = directory.trial_servers().await.unwrap();
        assert_eq!(trial.len(), 1);
        assert_eq!(trial[0].uuid, "nl-1");
    }
}
