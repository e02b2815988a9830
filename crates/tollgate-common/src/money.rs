//! Currency Model
//!
//! Amounts are always integers in the currency's minor unit. Conversion to
//! major units divides by `10^exponent`; the reverse multiplies and rounds
//! half-up (away from zero).
//!
//! `TMN` is a display-only alias over `IRR`: one TMN is exactly ten IRR. The
//! ratio is fixed and never persisted; balances are always stored in IRR.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MoneyError;

/// Currency used when none is given
pub const DEFAULT_CURRENCY: &str = "RUB";

/// Storage currency of the display alias pair
pub const ALIAS_BASE: &str = "IRR";
/// Display currency of the alias pair
pub const ALIAS_DISPLAY: &str = "TMN";
/// `ALIAS_BASE` minor units per `ALIAS_DISPLAY` unit
pub const ALIAS_RATIO: i64 = 10;

/// Currency metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyMeta {
    /// ISO-like code, upper case
    pub code: String,
    /// Number of minor-unit digits (0 or 2)
    pub exponent: u32,
    /// Display symbol
    pub symbol: String,
}

impl CurrencyMeta {
    fn known(code: &str, exponent: u32, symbol: &str) -> Self {
        Self {
            code: code.into(),
            exponent,
            symbol: symbol.into(),
        }
    }

    /// Look up metadata for a code; unknown codes get exponent 2 and their
    /// own code as symbol.
    pub fn lookup(code: &str) -> Self {
        let code = normalize_currency(Some(code));
        match code.as_str() {
            "RUB" => Self::known("RUB", 2, "₽"),
            "USD" => Self::known("USD", 2, "USD"),
            "EUR" => Self::known("EUR", 2, "EUR"),
            "IRR" => Self::known("IRR", 0, "IRR"),
            "TMN" => Self::known("TMN", 0, "TMN"),
            _ => Self {
                symbol: code.clone(),
                code,
                exponent: 2,
            },
        }
    }

    /// Minor units in one major unit
    pub fn minor_per_major(&self) -> i64 {
        10i64.pow(self.exponent)
    }
}

/// Trim and upper-case a currency code, falling back to [`DEFAULT_CURRENCY`]
pub fn normalize_currency(code: Option<&str>) -> String {
    match code.map(str::trim) {
        Some(c) if !c.is_empty() => c.to_uppercase(),
        _ => DEFAULT_CURRENCY.to_string(),
    }
}

/// Minor units to a major-unit decimal (exact)
pub fn minor_to_major(amount_minor: i64, currency: &CurrencyMeta) -> Decimal {
    Decimal::new(amount_minor, currency.exponent)
}

/// Major-unit decimal to minor units, rounding half-up at the currency's exponent
pub fn major_to_minor(amount_major: Decimal, currency: &CurrencyMeta) -> Result<i64, MoneyError> {
    let scaled = amount_major
        .checked_mul(Decimal::from(currency.minor_per_major()))
        .ok_or_else(|| MoneyError::Overflow(amount_major.to_string()))?;

    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| MoneyError::Overflow(scaled.to_string()))
}

/// Fixed rate that bypasses any rate source: identity and the display alias
pub fn fixed_rate(from: &str, to: &str) -> Option<Decimal> {
    let from = normalize_currency(Some(from));
    let to = normalize_currency(Some(to));

    if from == to {
        return Some(Decimal::ONE);
    }
    if from == ALIAS_BASE && to == ALIAS_DISPLAY {
        return Some(Decimal::ONE / Decimal::from(ALIAS_RATIO));
    }
    if from == ALIAS_DISPLAY && to == ALIAS_BASE {
        return Some(Decimal::from(ALIAS_RATIO));
    }
    None
}

/// Convert a minor amount between currencies at `rate` (target major per source major)
pub fn convert_minor(
    amount_minor: i64,
    from: &str,
    to: &str,
    rate: Decimal,
) -> Result<i64, MoneyError> {
    let source = CurrencyMeta::lookup(from);
    let target = CurrencyMeta::lookup(to);
    if source.code == target.code {
        return Ok(amount_minor);
    }
    if rate <= Decimal::ZERO {
        return Err(MoneyError::InvalidRate(rate.to_string()));
    }

    let target_major = minor_to_major(amount_minor, &source)
        .checked_mul(rate)
        .ok_or_else(|| MoneyError::Overflow(amount_minor.to_string()))?;
    major_to_minor(target_major, &target)
}

/// Render a minor amount, optionally in a display currency.
///
/// When `display_currency` is the alias of `currency` the amount is divided by
/// the fixed ratio and rendered exactly: one IRR is a tenth of a TMN, so the
/// result never has more than one fractional digit. Otherwise the target
/// currency's own exponent applies and trailing zero digits are trimmed.
pub fn format_minor(amount_minor: i64, currency: &str, display_currency: Option<&str>) -> String {
    let base = normalize_currency(Some(currency));
    let target = match display_currency.map(str::trim) {
        Some(d) if !d.is_empty() => d.to_uppercase(),
        _ => base.clone(),
    };

    if base == ALIAS_BASE && target == ALIAS_DISPLAY {
        let value = (Decimal::from(amount_minor) / Decimal::from(ALIAS_RATIO)).normalize();
        return format!("{} {}", value, ALIAS_DISPLAY);
    }

    let meta = CurrencyMeta::lookup(&target);
    let major = minor_to_major(amount_minor, &meta).normalize();
    format!("{} {}", major, meta.symbol)
}

/// Money value object: a minor-unit amount tagged with its currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount_minor: i64,
    currency: String,
}

impl Money {
    /// Create money from minor units
    pub fn from_minor(amount_minor: i64, currency: &str) -> Self {
        Self {
            amount_minor,
            currency: normalize_currency(Some(currency)),
        }
    }

    /// Amount in minor units
    pub fn amount_minor(&self) -> i64 {
        self.amount_minor
    }

    /// Currency code
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Amount in major units
    pub fn to_major(&self) -> Decimal {
        minor_to_major(self.amount_minor, &CurrencyMeta::lookup(&self.currency))
    }

    /// Render in another currency's display rules (see [`format_minor`])
    pub fn display_as(&self, display_currency: &str) -> String {
        format_minor(self.amount_minor, &self.currency, Some(display_currency))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_minor(self.amount_minor, &self.currency, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lookup_known_and_unknown() {
        assert_eq!(CurrencyMeta::lookup("rub").exponent, 2);
        assert_eq!(CurrencyMeta::lookup("IRR").exponent, 0);
        let unknown = CurrencyMeta::lookup(" gbp ");
        assert_eq!(unknown.code, "GBP");
        assert_eq!(unknown.exponent, 2);
        assert_eq!(unknown.symbol, "GBP");
    }

    #[test]
    fn test_normalize_currency_default() {
        assert_eq!(normalize_currency(None), "RUB");
        assert_eq!(normalize_currency(Some("  ")), "RUB");
        assert_eq!(normalize_currency(Some("usd")), "USD");
    }

    #[test]
    fn test_major_to_minor_rounds_half_up() {
        let rub = CurrencyMeta::lookup("RUB");
        assert_eq!(major_to_minor(dec!(10.005), &rub).unwrap(), 1001);
        assert_eq!(major_to_minor(dec!(10.004), &rub).unwrap(), 1000);

        let irr = CurrencyMeta::lookup("IRR");
        assert_eq!(major_to_minor(dec!(2.5), &irr).unwrap(), 3);
        assert_eq!(major_to_minor(dec!(2.4), &irr).unwrap(), 2);
    }

    #[test]
    fn test_format_trims_trailing_zeros() {
        assert_eq!(format_minor(29900, "RUB", None), "299 ₽");
        assert_eq!(format_minor(29950, "RUB", None), "299.5 ₽");
        assert_eq!(format_minor(5, "USD", None), "0.05 USD");
        assert_eq!(format_minor(1500, "IRR", None), "1500 IRR");
    }

    #[test]
    fn test_format_display_alias() {
        assert_eq!(format_minor(1500, "IRR", Some("TMN")), "150 TMN");
        assert_eq!(format_minor(1505, "IRR", Some("tmn")), "150.5 TMN");
        assert_eq!(format_minor(1, "IRR", Some("TMN")), "0.1 TMN");
        assert_eq!(format_minor(-1509, "IRR", Some("TMN")), "-150.9 TMN");
    }

    #[test]
    fn test_fixed_rates() {
        assert_eq!(fixed_rate("RUB", "rub"), Some(Decimal::ONE));
        assert_eq!(fixed_rate("IRR", "TMN"), Some(dec!(0.1)));
        assert_eq!(fixed_rate("TMN", "IRR"), Some(dec!(10)));
        assert_eq!(fixed_rate("RUB", "USD"), None);
    }

    #[test]
    fn test_convert_minor() {
        assert_eq!(convert_minor(12345, "RUB", "RUB", dec!(3)).unwrap(), 12345);
        // 100.00 RUB at 0.011 USD/RUB = 1.10 USD
        assert_eq!(convert_minor(10000, "RUB", "USD", dec!(0.011)).unwrap(), 110);
        assert_eq!(convert_minor(15, "IRR", "TMN", dec!(0.1)).unwrap(), 2);
        assert!(convert_minor(100, "RUB", "USD", Decimal::ZERO).is_err());
    }

    #[test]
    fn test_money_display() {
        let money = Money::from_minor(7200, "rub");
        assert_eq!(money.to_string(), "72 ₽");
        assert_eq!(money.to_major(), dec!(72));
        assert_eq!(Money::from_minor(2000, "IRR").display_as("TMN"), "200 TMN");
    }

    proptest! {
        #[test]
        fn prop_minor_major_round_trip(
            amount in -1_000_000_000_000_000i64..1_000_000_000_000_000i64,
            code in prop::sample::select(vec!["RUB", "USD", "EUR", "IRR", "TMN"]),
        ) {
            let meta = CurrencyMeta::lookup(code);
            let major = minor_to_major(amount, &meta);
            prop_assert_eq!(major_to_minor(major, &meta).unwrap(), amount);
        }
    }
}
