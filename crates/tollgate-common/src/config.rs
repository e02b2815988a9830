//! Pricing Configuration
//!
//! One immutable value carries every deployment knob the catalog builder and
//! pricing engine read. Services receive it as `Arc<PricingConfig>`; nothing
//! reads configuration from globals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::ConfigError;
use crate::money::{normalize_currency, DEFAULT_CURRENCY};

/// Days per billing month
pub const DAYS_PER_MONTH: u32 = 30;

/// Headroom added to the device cap when no explicit cap is configured
pub const UNCAPPED_DEVICE_HEADROOM: u32 = 10;

/// How traffic is sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficMode {
    /// Customer picks one of the enabled packages
    #[default]
    Selectable,
    /// Every subscription gets the fixed limit
    Fixed,
    /// Fixed limit, extra traffic bought separately
    FixedWithTopup,
}

/// Traffic package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficPackage {
    /// Package size in GB; 0 is unlimited
    pub gb: u32,
    /// Monthly price in minor units
    pub price: i64,
    /// Offered to customers
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TrafficPackage {
    fn new(gb: u32, price: i64) -> Self {
        Self {
            gb,
            price,
            enabled: true,
        }
    }

    /// Whether this is the unlimited package
    pub fn is_unlimited(&self) -> bool {
        self.gb == 0
    }
}

/// Pricing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Currency balances are held in
    pub base_currency: String,
    /// Use per-currency price overrides from the tariff directory
    pub multi_currency_enabled: bool,
    /// Purchasable period lengths in days
    pub available_periods: Vec<u32>,
    /// Base price per period (minor units), keyed by days
    pub period_prices: BTreeMap<u32, i64>,
    /// Traffic sale mode
    pub traffic_mode: TrafficMode,
    /// Traffic limit used in fixed modes
    pub fixed_traffic_limit_gb: u32,
    /// Traffic packages
    pub traffic_packages: Vec<TrafficPackage>,
    /// Devices included in every subscription
    pub default_device_limit: u32,
    /// Device cap; 0 means uncapped
    pub max_devices_limit: u32,
    /// Monthly price per device above the included quota
    pub price_per_device: i64,
    /// Period discounts for the default promo group, keyed by days
    pub base_promo_group_period_discounts: BTreeMap<u32, i32>,
    /// Trial length in days
    pub trial_duration_days: u32,
    /// Trial traffic limit in GB
    pub trial_traffic_limit_gb: u32,
    /// Trial device limit
    pub trial_device_limit: u32,
    /// Price charged to activate a trial (minor units)
    pub trial_activation_price: i64,
    /// Carry unused trial days over to the first paid period
    pub trial_add_remaining_days_to_paid: bool,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let periods = [
            (14, 50_000),
            (30, 99_000),
            (60, 189_000),
            (90, 269_000),
            (180, 499_000),
            (360, 899_000),
        ];

        Self {
            base_currency: DEFAULT_CURRENCY.into(),
            multi_currency_enabled: false,
            available_periods: periods.iter().map(|(d, _)| *d).collect(),
            period_prices: periods.into_iter().collect(),
            traffic_mode: TrafficMode::Selectable,
            fixed_traffic_limit_gb: 100,
            traffic_packages: vec![
                TrafficPackage::new(5, 2_000),
                TrafficPackage::new(10, 3_500),
                TrafficPackage::new(25, 7_000),
                TrafficPackage::new(50, 11_000),
                TrafficPackage::new(100, 15_000),
                TrafficPackage::new(250, 17_000),
                TrafficPackage::new(500, 19_000),
                TrafficPackage::new(1000, 19_500),
                TrafficPackage::new(0, 20_000),
            ],
            default_device_limit: 1,
            max_devices_limit: 20,
            price_per_device: 5_000,
            base_promo_group_period_discounts: BTreeMap::new(),
            trial_duration_days: 3,
            trial_traffic_limit_gb: 10,
            trial_device_limit: 2,
            trial_activation_price: 0,
            trial_add_remaining_days_to_paid: false,
        }
    }
}

impl PricingConfig {
    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!(
            path = %path.display(),
            base_currency = %config.base_currency,
            periods = config.available_periods.len(),
            "Pricing configuration loaded"
        );
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.available_periods.is_empty() {
            return Err(ConfigError::Invalid("no subscription periods configured".into()));
        }
        for days in &self.available_periods {
            if *days == 0 {
                return Err(ConfigError::Invalid("period of 0 days".into()));
            }
            match self.period_prices.get(days) {
                None => {
                    return Err(ConfigError::Invalid(format!("period {} days has no price", days)))
                }
                Some(price) if *price < 0 => {
                    return Err(ConfigError::Invalid(format!("period {} days has negative price", days)))
                }
                Some(_) => {}
            }
        }
        if let Some(pkg) = self.traffic_packages.iter().find(|p| p.price < 0) {
            return Err(ConfigError::Invalid(format!("traffic package {} GB has negative price", pkg.gb)));
        }
        if self.price_per_device < 0 || self.trial_activation_price < 0 {
            return Err(ConfigError::Invalid("negative device or trial price".into()));
        }
        if let Some((days, pct)) = self
            .base_promo_group_period_discounts
            .iter()
            .find(|(_, pct)| !(0..=100).contains(*pct))
        {
            return Err(ConfigError::Invalid(format!(
                "period {} days discount {}% out of range",
                days, pct
            )));
        }
        Ok(())
    }

    /// Normalized base currency code
    pub fn base_currency(&self) -> String {
        normalize_currency(Some(&self.base_currency))
    }

    /// Static price for a period
    pub fn period_price(&self, days: u32) -> Option<i64> {
        self.period_prices.get(&days).copied()
    }

    /// Enabled traffic packages in configured order
    pub fn enabled_traffic_packages(&self) -> Vec<&TrafficPackage> {
        self.traffic_packages.iter().filter(|p| p.enabled).collect()
    }

    /// Monthly price for a traffic limit.
    ///
    /// An exact package match wins; otherwise the smallest enabled limited
    /// package that covers `gb`. Unknown sizes cost nothing.
    pub fn traffic_price(&self, gb: u32) -> i64 {
        let enabled = self.enabled_traffic_packages();
        if let Some(pkg) = enabled.iter().find(|p| p.gb == gb) {
            return pkg.price;
        }
        if gb == 0 {
            return 0;
        }
        enabled
            .iter()
            .filter(|p| !p.is_unlimited() && p.gb >= gb)
            .min_by_key(|p| p.gb)
            .map(|p| p.price)
            .unwrap_or(0)
    }

    /// Traffic is not chosen by the customer
    pub fn is_traffic_fixed(&self) -> bool {
        matches!(self.traffic_mode, TrafficMode::Fixed | TrafficMode::FixedWithTopup)
    }

    /// Highest selectable device count given the subscription's current limit
    pub fn max_devices(&self, current_limit: u32) -> u32 {
        if self.max_devices_limit == 0 {
            self.default_device_limit.max(current_limit) + UNCAPPED_DEVICE_HEADROOM
        } else {
            self.max_devices_limit.max(current_limit)
        }
    }
}

/// Whole months covered by a period: `max(1, round(days / 30))`
pub fn months_in_period(days: u32) -> u32 {
    let months = (days + DAYS_PER_MONTH / 2) / DAYS_PER_MONTH;
    months.max(1)
}

/// Months still to pay for when prorating: `max(1, ceil(days / 30))`
pub fn remaining_months(remaining_days: u32) -> u32 {
    remaining_days.div_ceil(DAYS_PER_MONTH).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PricingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.period_price(30), Some(99_000));
        assert_eq!(config.base_currency(), "RUB");
    }

    #[test]
    fn test_validate_rejects_missing_price() {
        let mut config = PricingConfig::default();
        config.available_periods.push(45);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PricingConfig::default();
        config.available_periods.clear();
        assert!(config.validate().is_err());

        let mut config = PricingConfig::default();
        config.base_promo_group_period_discounts.insert(30, 120);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "available_periods": [30],
            "period_prices": {"30": 29900},
            "traffic_mode": "fixed_with_topup"
        }"#;
        let config: PricingConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.period_price(30), Some(29_900));
        assert!(config.is_traffic_fixed());
        assert_eq!(config.price_per_device, 5_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("tollgate-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("pricing.json");
        std::fs::write(&good, r#"{"available_periods": [30], "period_prices": {"30": 15000}}"#).unwrap();
        let config = PricingConfig::load(&good).unwrap();
        assert_eq!(config.period_price(30), Some(15_000));

        let bad = dir.join("broken.json");
        std::fs::write(&bad, r#"{"available_periods": [30], "period_prices": {}}"#).unwrap();
        assert!(matches!(PricingConfig::load(&bad), Err(ConfigError::Invalid(_))));

        assert!(matches!(PricingConfig::load(dir.join("missing.json")), Err(ConfigError::Io(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_traffic_price_lookup() {
        let config = PricingConfig::default();
        assert_eq!(config.traffic_price(50), 11_000);
        assert_eq!(config.traffic_price(0), 20_000);
        // No 40 GB package: the 50 GB one covers it
        assert_eq!(config.traffic_price(40), 11_000);
        assert_eq!(config.traffic_price(5000), 0);
    }

    #[test]
    fn test_max_devices() {
        let mut config = PricingConfig::default();
        assert_eq!(config.max_devices(3), 20);
        assert_eq!(config.max_devices(25), 25);
        config.max_devices_limit = 0;
        assert_eq!(config.max_devices(3), 13);
        assert_eq!(config.max_devices(0), 11);
    }

    #[test]
    fn test_months() {
        assert_eq!(months_in_period(14), 1);
        assert_eq!(months_in_period(30), 1);
        assert_eq!(months_in_period(45), 2);
        assert_eq!(months_in_period(90), 3);
        assert_eq!(months_in_period(360), 12);
        assert_eq!(remaining_months(0), 1);
        assert_eq!(remaining_months(31), 2);
        assert_eq!(remaining_months(60), 2);
    }
}
