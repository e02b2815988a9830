//! Pricing Catalog Builder
//!
//! Builds the read-only snapshot of everything a user can buy, one entry per
//! configured period. Every price is kept as an original/discounted pair so
//! callers can render savings without recomputing.
//!
//! ```text
//!   PricingConfig ─┐
//!   promo group ───┤
//!   servers ───────┼──► CatalogBuilder::build ──► Catalog { periods: [PeriodOption] }
//!   overrides ─────┤                                   │
//!   subscription ──┘                        base / traffic / servers / devices
//! ```
//!
//! The builder is pure. Everything it needs is collected by the caller into
//! [`CatalogInputs`] first.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tollgate_common::money::convert_minor;
use tollgate_common::{months_in_period, PricingConfig, SubscriptionId, TrafficMode};

use crate::directory::ServerListing;
use crate::error::PurchaseError;
use crate::model::Subscription;
use crate::pricing::{apply_percentage_discount, rounding_step};
use crate::promo::{group_discount, DiscountCategory, PromoGroup};

/// Original and discounted price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PriceTag {
    /// Before discount
    pub original: i64,
    /// After discount
    pub discounted: i64,
    /// Percent applied
    pub discount_percent: i32,
}

impl PriceTag {
    /// Discount `original` by `percent`, rounding in `step` units
    pub fn new(original: i64, percent: i32, step: i64) -> Self {
        let (discounted, _) = apply_percentage_discount(original, percent, step);
        Self {
            original,
            discounted,
            discount_percent: percent.clamp(0, 100),
        }
    }

    /// Amount saved
    pub fn discount(&self) -> i64 {
        self.original - self.discounted
    }
}

/// Traffic package on offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficOption {
    /// GB, 0 is unlimited
    pub value: u32,
    /// Monthly price
    pub price: PriceTag,
    /// Preselected
    pub is_default: bool,
}

/// Traffic dimension of a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficConfig {
    /// Customer may choose
    pub selectable: bool,
    /// Deployment traffic mode
    pub mode: TrafficMode,
    /// Packages; a single entry when not selectable
    pub options: Vec<TrafficOption>,
    /// Value used when the request names none
    pub default_value: u32,
    /// Discount percent for this period
    pub discount_percent: i32,
}

/// Server on offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerOption {
    /// Public uuid
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Monthly price
    pub price: PriceTag,
    /// Can be newly selected
    pub is_available: bool,
}

/// Server dimension of a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServersConfig {
    /// Servers on offer
    pub options: Vec<ServerOption>,
    /// Fewest servers a selection may hold
    pub min: usize,
    /// Most servers a selection may hold; extra ones are dropped
    pub max: usize,
    /// Used when the request names none
    pub default_selection: Vec<String>,
    /// Discount percent for this period
    pub discount_percent: i32,
}

/// Device dimension of a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicesConfig {
    /// Devices included in the base price
    pub included: u32,
    /// Lowest selectable count
    pub minimum: u32,
    /// Highest selectable count
    pub maximum: u32,
    /// Used when the request names none
    pub default: u32,
    /// Limit on the current subscription
    pub current: u32,
    /// Monthly price per device above `included`
    pub unit_price: PriceTag,
    /// Discount percent for this period
    pub discount_percent: i32,
}

/// One purchasable period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodOption {
    /// `days:<n>`
    pub id: String,
    /// Length in days
    pub days: u32,
    /// Billing months
    pub months: u32,
    /// Base price for the whole period
    pub base: PriceTag,
    /// Discounted base price per month
    pub per_month_price: i64,
    /// Traffic
    pub traffic: TrafficConfig,
    /// Servers
    pub servers: ServersConfig,
    /// Devices
    pub devices: DevicesConfig,
}

/// Purchase options for one user in one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalog {
    /// Currency of every price
    pub currency: String,
    /// Account balance converted into `currency`
    pub balance_minor: i64,
    /// Current subscription, if any
    pub subscription_id: Option<SubscriptionId>,
    /// Promo offer percent active when the catalog was built
    pub promo_offer_percent: i32,
    /// Periods in configured order
    pub periods: Vec<PeriodOption>,
    /// Preselected period
    pub default_period_id: String,
    /// Server uuid to internal id
    #[serde(skip)]
    pub server_ids: HashMap<String, i64>,
}

impl Catalog {
    /// Period by id
    pub fn period(&self, id: &str) -> Option<&PeriodOption> {
        self.periods.iter().find(|p| p.id == id)
    }

    /// The preselected period
    pub fn default_period(&self) -> Option<&PeriodOption> {
        self.period(&self.default_period_id)
    }
}

/// Period id for a length in days
pub fn period_id(days: u32) -> String {
    format!("days:{}", days)
}

/// Everything the builder reads
#[derive(Debug, Clone)]
pub struct CatalogInputs<'a> {
    /// Currency to price in
    pub currency: String,
    /// Catalog-currency major units per base-currency major unit
    pub rate_from_base: Decimal,
    /// Balance already converted into `currency`
    pub balance_minor: i64,
    /// Active promo offer percent
    pub promo_offer_percent: i32,
    /// Promo group of the account
    pub promo_group: Option<&'a PromoGroup>,
    /// Current subscription
    pub subscription: Option<&'a Subscription>,
    /// Purchasable servers plus the ones the subscription is connected to
    pub servers: Vec<ServerListing>,
    /// Period prices in `currency`, keyed by days
    pub period_overrides: HashMap<u32, i64>,
    /// Traffic prices in `currency`, keyed by GB
    pub traffic_overrides: HashMap<u32, i64>,
}

/// Catalog builder
pub struct CatalogBuilder<'a> {
    config: &'a PricingConfig,
    inputs: CatalogInputs<'a>,
    base_currency: String,
    step: i64,
}

impl<'a> CatalogBuilder<'a> {
    /// Build the catalog
    pub fn build(config: &'a PricingConfig, inputs: CatalogInputs<'a>) -> Result<Catalog, PurchaseError> {
        if config.available_periods.is_empty() {
            return Err(PurchaseError::Configuration("no subscription periods configured".into()));
        }
        let builder = Self {
            config,
            step: rounding_step(&inputs.currency),
            base_currency: config.base_currency(),
            inputs,
        };
        builder.assemble()
    }

    fn assemble(&self) -> Result<Catalog, PurchaseError> {
        let subscription = self.inputs.subscription;
        let paid = subscription.filter(|s| !s.is_trial);

        let default_devices = self
            .config
            .default_device_limit
            .max(paid.map(|s| s.device_limit).unwrap_or(0));
        let fixed_traffic_value = if self.config.is_traffic_fixed() {
            Some(self.config.fixed_traffic_limit_gb)
        } else {
            paid.map(|s| s.traffic_limit_gb)
        };
        let default_servers = self.default_servers();

        let mut periods = Vec::with_capacity(self.config.available_periods.len());
        for &days in &self.config.available_periods {
            let months = months_in_period(days);
            let original = match self.inputs.period_overrides.get(&days) {
                Some(price) => *price,
                None => {
                    let price = self.config.period_price(days).ok_or_else(|| {
                        PurchaseError::Configuration(format!("period {} days has no price", days))
                    })?;
                    self.from_base(price)?
                }
            };
            let base = PriceTag::new(original, self.discount(DiscountCategory::Period, days), self.step);

            periods.push(PeriodOption {
                id: period_id(days),
                days,
                months,
                base,
                per_month_price: base.discounted / i64::from(months),
                traffic: self.traffic(days, fixed_traffic_value)?,
                servers: self.servers(days, &default_servers)?,
                devices: self.devices(days, default_devices, subscription)?,
            });
        }

        let default_period_id = period_id(self.config.available_periods[0]);
        let server_ids = self
            .inputs
            .servers
            .iter()
            .map(|s| (s.uuid.clone(), s.id))
            .collect();

        Ok(Catalog {
            currency: self.inputs.currency.clone(),
            balance_minor: self.inputs.balance_minor,
            subscription_id: subscription.map(|s| s.id),
            promo_offer_percent: self.inputs.promo_offer_percent.clamp(0, 100),
            periods,
            default_period_id,
            server_ids,
        })
    }

    fn discount(&self, category: DiscountCategory, days: u32) -> i32 {
        group_discount(self.inputs.promo_group, category, days, self.config)
    }

    fn from_base(&self, amount: i64) -> Result<i64, PurchaseError> {
        Ok(convert_minor(
            amount,
            &self.base_currency,
            &self.inputs.currency,
            self.inputs.rate_from_base,
        )?)
    }

    fn traffic_price(&self, gb: u32) -> Result<i64, PurchaseError> {
        match self.inputs.traffic_overrides.get(&gb) {
            Some(price) => Ok(*price),
            None => self.from_base(self.config.traffic_price(gb)),
        }
    }

    fn traffic(&self, days: u32, fixed_value: Option<u32>) -> Result<TrafficConfig, PurchaseError> {
        let percent = self.discount(DiscountCategory::Traffic, days);
        let packages = self.config.enabled_traffic_packages();

        if self.config.is_traffic_fixed() || packages.is_empty() {
            let value = fixed_value.unwrap_or(self.config.fixed_traffic_limit_gb);
            return Ok(TrafficConfig {
                selectable: false,
                mode: self.config.traffic_mode,
                options: vec![TrafficOption {
                    value,
                    price: PriceTag::new(self.traffic_price(value)?, percent, self.step),
                    is_default: true,
                }],
                default_value: value,
                discount_percent: percent,
            });
        }

        let default_value = fixed_value
            .filter(|v| packages.iter().any(|p| p.gb == *v))
            .unwrap_or(packages[0].gb);
        let options = packages
            .iter()
            .map(|p| {
                let original = match self.inputs.traffic_overrides.get(&p.gb) {
                    Some(price) => *price,
                    None => self.from_base(p.price)?,
                };
                Ok(TrafficOption {
                    value: p.gb,
                    price: PriceTag::new(original, percent, self.step),
                    is_default: p.gb == default_value,
                })
            })
            .collect::<Result<Vec<_>, PurchaseError>>()?;

        Ok(TrafficConfig {
            selectable: true,
            mode: TrafficMode::Selectable,
            options,
            default_value,
            discount_percent: percent,
        })
    }

    fn default_servers(&self) -> Vec<String> {
        let listed = |uuid: &String| self.inputs.servers.iter().any(|s| &s.uuid == uuid);
        let connected: Vec<String> = self
            .inputs
            .subscription
            .map(|s| s.connected_servers.iter().filter(|u| listed(*u)).cloned().collect())
            .unwrap_or_default();
        if !connected.is_empty() {
            return connected;
        }
        self.inputs
            .servers
            .iter()
            .find(|s| s.is_selectable())
            .map(|s| vec![s.uuid.clone()])
            .unwrap_or_default()
    }

    fn servers(&self, days: u32, default_selection: &[String]) -> Result<ServersConfig, PurchaseError> {
        let percent = self.discount(DiscountCategory::Servers, days);
        let options = self
            .inputs
            .servers
            .iter()
            .map(|s| {
                Ok(ServerOption {
                    uuid: s.uuid.clone(),
                    name: s.name.clone(),
                    price: PriceTag::new(self.from_base(s.price_minor)?, percent, self.step),
                    is_available: s.is_selectable(),
                })
            })
            .collect::<Result<Vec<_>, PurchaseError>>()?;

        let mut default_selection = default_selection.to_vec();
        if default_selection.is_empty() {
            default_selection.extend(options.first().map(|o| o.uuid.clone()));
        }

        Ok(ServersConfig {
            min: usize::from(!options.is_empty()),
            max: options.len(),
            options,
            default_selection,
            discount_percent: percent,
        })
    }

    fn devices(
        &self,
        days: u32,
        default_devices: u32,
        subscription: Option<&Subscription>,
    ) -> Result<DevicesConfig, PurchaseError> {
        let percent = self.discount(DiscountCategory::Devices, days);
        let unit = self.from_base(self.config.price_per_device)?;
        let minimum = self.config.default_device_limit;

        Ok(DevicesConfig {
            included: self.config.default_device_limit,
            minimum,
            maximum: self.config.max_devices(default_devices).max(minimum),
            default: default_devices,
            current: subscription.map(|s| s.device_limit).unwrap_or(default_devices),
            unit_price: PriceTag::new(unit, percent, self.step),
            discount_percent: percent,
        })
    }
}
