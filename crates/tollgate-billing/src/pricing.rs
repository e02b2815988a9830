//! Pricing Engine
//!
//! Turns a validated [`Selection`] and the matching catalog period into a
//! [`PricingQuote`]. Pure computation: no I/O, no locks, safe to call from
//! any number of tasks.
//!
//! ```text
//!   base ──┐
//!   traffic┼─ per-dimension discount ─► monthly × months ─► subtotal ─► promo offer ─► final total
//!   servers┤                                                   │
//!   devices┘                                        reconciliation check
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tollgate_common::money::CurrencyMeta;
use tracing::{debug, error};

use crate::catalog::{Catalog, PeriodOption, PriceTag};
use crate::error::{PurchaseError, ValidationCode};

/// Granularity discounted prices are rounded to: one major unit
pub fn rounding_step(currency: &str) -> i64 {
    CurrencyMeta::lookup(currency).minor_per_major()
}

/// Apply a percent discount to a minor amount.
///
/// Returns `(discounted, discount)`. The percent is clamped to `0..=100` and
/// the raw discount is `floor(amount * percent / 100)`. When the discount is
/// at least one `step` and the amount is a whole number of steps, the
/// discounted price is rounded up to a whole number of steps, never above
/// the original amount.
pub fn apply_percentage_discount(amount: i64, percent: i32, step: i64) -> (i64, i64) {
    let percent = percent.clamp(0, 100);
    if amount <= 0 || percent == 0 {
        return (amount, 0);
    }

    let discount = (i128::from(amount) * i128::from(percent) / 100) as i64;
    let discounted = if step > 1 && discount >= step && amount % step == 0 {
        amount - discount / step * step
    } else {
        amount - discount
    };
    (discounted, amount - discounted)
}

/// Raw purchase request as sent by a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    /// Catalog period id, e.g. `days:30`
    #[serde(default, alias = "periodId", alias = "period", alias = "code")]
    pub period_id: Option<String>,
    /// Period length, used when no id is given
    #[serde(default, alias = "periodDays")]
    pub period_days: Option<u32>,
    /// Traffic package in GB
    #[serde(default, alias = "trafficValue", alias = "traffic", alias = "traffic_gb")]
    pub traffic_value: Option<u32>,
    /// Server uuids
    #[serde(default, alias = "countries", alias = "server_uuids", alias = "serverUuids")]
    pub servers: Vec<String>,
    /// Device count; a number or a numeric string
    #[serde(default, alias = "device_limit", alias = "deviceLimit")]
    pub devices: Option<serde_json::Value>,
}

/// Validated selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    /// Catalog period id
    pub period_id: String,
    /// Period length in days
    pub period_days: u32,
    /// Traffic limit in GB
    pub traffic_value: u32,
    /// Server uuids, in request order
    pub servers: Vec<String>,
    /// Device limit
    pub devices: u32,
}

/// Check a request against the catalog and fill in defaults
pub fn validate_selection(catalog: &Catalog, request: &SelectionRequest) -> Result<Selection, PurchaseError> {
    let period_id = request
        .period_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| request.period_days.map(|days| format!("days:{}", days)))
        .ok_or_else(|| PurchaseError::validation(ValidationCode::InvalidPeriod, "period is required"))?;
    let period = catalog.period(&period_id).ok_or_else(|| {
        PurchaseError::validation(ValidationCode::InvalidPeriod, format!("unknown period {}", period_id))
    })?;

    let traffic_value = select_traffic(period, request.traffic_value)?;
    let servers = select_servers(catalog, period, &request.servers)?;
    let devices = select_devices(period, request.devices.as_ref())?;

    Ok(Selection {
        period_id: period.id.clone(),
        period_days: period.days,
        traffic_value,
        servers,
        devices,
    })
}

fn select_traffic(period: &PeriodOption, requested: Option<u32>) -> Result<u32, PurchaseError> {
    let traffic = &period.traffic;
    if !traffic.selectable {
        return Ok(traffic.default_value);
    }
    match requested {
        None => Ok(traffic.default_value),
        Some(value) if traffic.options.iter().any(|o| o.value == value) => Ok(value),
        Some(value) => Err(PurchaseError::validation(
            ValidationCode::InvalidTraffic,
            format!("traffic package {} GB is not offered", value),
        )),
    }
}

fn select_servers(catalog: &Catalog, period: &PeriodOption, requested: &[String]) -> Result<Vec<String>, PurchaseError> {
    let config = &period.servers;

    let mut seen = HashSet::new();
    let mut servers: Vec<String> = requested
        .iter()
        .map(|uuid| uuid.trim())
        .filter(|uuid| !uuid.is_empty() && seen.insert(*uuid))
        .map(str::to_string)
        .collect();
    if servers.is_empty() {
        servers = config.default_selection.clone();
    }

    if servers.len() < config.min {
        return Err(PurchaseError::validation(
            ValidationCode::InvalidServers,
            format!("select at least {} server(s)", config.min),
        ));
    }
    servers.truncate(config.max);

    for uuid in &servers {
        let option = config.options.iter().find(|o| &o.uuid == uuid);
        let resolvable = catalog.server_ids.contains_key(uuid);
        match option {
            Some(o) if resolvable && (o.is_available || config.default_selection.contains(uuid)) => {}
            Some(_) if resolvable => {
                return Err(PurchaseError::validation(
                    ValidationCode::InvalidServers,
                    format!("server {} is not available", uuid),
                ))
            }
            _ => {
                return Err(PurchaseError::validation(
                    ValidationCode::InvalidServers,
                    format!("unknown server {}", uuid),
                ))
            }
        }
    }
    Ok(servers)
}

fn select_devices(period: &PeriodOption, requested: Option<&serde_json::Value>) -> Result<u32, PurchaseError> {
    let config = &period.devices;
    let invalid = || PurchaseError::validation(ValidationCode::InvalidDevices, "device count must be a number");

    let value: i64 = match requested {
        None | Some(serde_json::Value::Null) => return Ok(config.default),
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(v) => v,
            None => n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64).ok_or_else(invalid)?,
        },
        Some(serde_json::Value::String(s)) => s.trim().parse().map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };

    let clamped = value.clamp(i64::from(config.minimum), i64::from(config.maximum));
    Ok(clamped as u32)
}

/// One monthly-priced dimension of a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ComponentPrice {
    /// Undiscounted monthly price
    pub original_per_month: i64,
    /// Discount applied per month
    pub discount_per_month: i64,
    /// Discounted monthly price
    pub discounted_per_month: i64,
    /// Discount percent in force
    pub discount_percent: i32,
    /// Discounted price over the whole period
    pub total: i64,
    /// Discount over the whole period
    pub discount_total: i64,
}

impl ComponentPrice {
    fn monthly(original_per_month: i64, percent: i32, months: i64, step: i64) -> Result<Self, PurchaseError> {
        let (discounted_per_month, discount_per_month) = apply_percentage_discount(original_per_month, percent, step);
        Ok(Self {
            original_per_month,
            discount_per_month,
            discounted_per_month,
            discount_percent: percent.clamp(0, 100),
            total: checked_mul(discounted_per_month, months)?,
            discount_total: checked_mul(discount_per_month, months)?,
        })
    }
}

/// Priced selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricingQuote {
    /// The selection that was priced
    pub selection: Selection,
    /// Currency of every amount
    pub currency: String,
    /// Internal ids of the selected servers, in selection order
    pub server_ids: Vec<i64>,
    /// Billing months in the period
    pub months: u32,
    /// Base period price
    pub base: PriceTag,
    /// Traffic package
    pub traffic: ComponentPrice,
    /// Selected servers
    pub servers: ComponentPrice,
    /// Devices above the included quota
    pub devices: ComponentPrice,
    /// Extra devices billed
    pub additional_devices: u32,
    /// Per-server discounted price for the whole period, in selection order
    pub server_prices_for_period: Vec<i64>,
    /// Price before any discount
    pub base_original_total: i64,
    /// Price after promo-group discounts
    pub subtotal: i64,
    /// Amount taken off by the promo offer
    pub promo_discount_value: i64,
    /// Promo offer percent applied
    pub promo_discount_percent: i32,
    /// Amount to charge
    pub final_total: i64,
}

impl PricingQuote {
    /// Everything taken off the undiscounted price
    pub fn total_discount(&self) -> i64 {
        (self.base_original_total - self.final_total).max(0)
    }

    /// Uses up the account's promo offer when charged
    pub fn consumes_promo_offer(&self) -> bool {
        self.promo_discount_value > 0
    }

    /// Offer percent the total was priced with, when it uses the offer
    pub fn priced_promo_offer(&self) -> Option<i32> {
        self.consumes_promo_offer().then_some(self.promo_discount_percent)
    }
}

/// Stateless pricing calculator
#[derive(Debug, Default, Clone, Copy)]
pub struct PricingEngine;

impl PricingEngine {
    /// Price a selection against its catalog
    pub fn price(catalog: &Catalog, selection: &Selection) -> Result<PricingQuote, PurchaseError> {
        let period = catalog.period(&selection.period_id).ok_or_else(|| {
            PurchaseError::validation(
                ValidationCode::InvalidPeriod,
                format!("unknown period {}", selection.period_id),
            )
        })?;
        let server_ids = resolve_server_ids(catalog, &selection.servers)?;
        let step = rounding_step(&catalog.currency);
        let months = i64::from(period.months);

        let traffic_original = period
            .traffic
            .options
            .iter()
            .find(|o| o.value == selection.traffic_value)
            .map(|o| o.price.original)
            .unwrap_or(0);
        let traffic = ComponentPrice::monthly(traffic_original, period.traffic.discount_percent, months, step)?;

        let mut server_monthly = Vec::with_capacity(selection.servers.len());
        for uuid in &selection.servers {
            let price = period
                .servers
                .options
                .iter()
                .find(|o| &o.uuid == uuid)
                .map(|o| o.price.original)
                .unwrap_or(0);
            server_monthly.push(price);
        }
        let servers_original = server_monthly
            .iter()
            .try_fold(0i64, |acc, p| acc.checked_add(*p))
            .ok_or_else(overflow)?;
        let servers = ComponentPrice::monthly(servers_original, period.servers.discount_percent, months, step)?;
        let server_prices_for_period = server_monthly
            .iter()
            .map(|price| {
                let (discounted, _) = apply_percentage_discount(*price, period.servers.discount_percent, step);
                checked_mul(discounted, months)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let additional_devices = selection.devices.saturating_sub(period.devices.included);
        let devices_original = checked_mul(period.devices.unit_price.original, i64::from(additional_devices))?;
        let devices = ComponentPrice::monthly(devices_original, period.devices.discount_percent, months, step)?;

        let base = period.base;
        let subtotal = [base.discounted, traffic.total, servers.total, devices.total]
            .iter()
            .try_fold(0i64, |acc, v| acc.checked_add(*v))
            .ok_or_else(overflow)?;

        let monthly_originals = traffic.original_per_month + servers.original_per_month + devices.original_per_month;
        let base_original_total = base.original + checked_mul(monthly_originals, months)?;

        reconcile(&base, &[&traffic, &servers, &devices], months, step, subtotal)?;

        let promo_discount_percent = catalog.promo_offer_percent.clamp(0, 100);
        let (final_total, promo_discount_value) = apply_percentage_discount(subtotal, promo_discount_percent, step);

        debug!(
            period = %period.id,
            currency = %catalog.currency,
            subtotal,
            promo_discount_value,
            final_total,
            "Selection priced"
        );

        Ok(PricingQuote {
            selection: selection.clone(),
            currency: catalog.currency.clone(),
            server_ids,
            months: period.months,
            base,
            traffic,
            servers,
            devices,
            additional_devices,
            server_prices_for_period,
            base_original_total,
            subtotal,
            promo_discount_value,
            promo_discount_percent: if promo_discount_value > 0 { promo_discount_percent } else { 0 },
            final_total,
        })
    }
}

fn resolve_server_ids(catalog: &Catalog, servers: &[String]) -> Result<Vec<i64>, PurchaseError> {
    servers
        .iter()
        .map(|uuid| {
            catalog.server_ids.get(uuid).copied().ok_or_else(|| {
                PurchaseError::validation(ValidationCode::InvalidServers, format!("unknown server {}", uuid))
            })
        })
        .collect()
}

/// Recompute the subtotal from original prices and net discount percents.
///
/// Stored discounted amounts and totals are not read; a component whose
/// recorded total disagrees with its original price and percent fails the
/// check.
fn reconcile(
    base: &PriceTag,
    components: &[&ComponentPrice],
    months: i64,
    step: i64,
    subtotal: i64,
) -> Result<(), PurchaseError> {
    let (base_net, _) = apply_percentage_discount(base.original, base.discount_percent, step);
    let mut expected = i128::from(base_net);
    let mut recorded = i128::from(base.discounted);
    for c in components {
        let (net_per_month, _) = apply_percentage_discount(c.original_per_month, c.discount_percent, step);
        expected += i128::from(net_per_month) * i128::from(months);
        recorded += i128::from(c.total);
    }

    if expected != i128::from(subtotal) || recorded != i128::from(subtotal) {
        error!(expected = %expected, recorded = %recorded, subtotal, "Price reconciliation failed");
        return Err(PurchaseError::Calculation(format!(
            "subtotal {} does not match recomputed {}",
            subtotal, expected
        )));
    }
    Ok(())
}

fn checked_mul(amount: i64, factor: i64) -> Result<i64, PurchaseError> {
    amount.checked_mul(factor).ok_or_else(overflow)
}

fn overflow() -> PurchaseError {
    PurchaseError::Calculation("amount overflow".into())
}
