//! Persisted records
//!
//! Plain data shared by the stores and services. Balances are integers in the
//! account currency's minor unit and are only ever written by the ledger.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tollgate_common::{SubscriptionId, TransactionId, UserId};

/// Time-limited discount attached to an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoOffer {
    /// Discount percent (0-100)
    pub percent: i32,
    /// Offer that granted it
    pub source: Option<String>,
    /// End of validity; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoOffer {
    /// Percent in force at `now`, zero once expired
    pub fn active_percent(&self, now: DateTime<Utc>) -> i32 {
        if self.percent <= 0 {
            return 0;
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => 0,
            _ => self.percent.min(100),
        }
    }
}

/// User account with its balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account id
    pub id: UserId,
    /// Chat-platform id, if any
    pub external_id: Option<i64>,
    /// Username
    pub username: Option<String>,
    /// Unique referral code
    pub referral_code: String,
    /// Referring account
    pub referred_by: Option<UserId>,
    /// Balance in minor units, never negative
    pub balance_minor: i64,
    /// Balance currency
    pub currency: String,
    /// Promo group
    pub promo_group_id: Option<i64>,
    /// Active promo-offer discount
    pub promo_offer: Option<PromoOffer>,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Last modified
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Promo-offer percent in force at `now`
    pub fn promo_offer_percent(&self, now: DateTime<Utc>) -> i32 {
        self.promo_offer
            .as_ref()
            .map(|offer| offer.active_percent(now))
            .unwrap_or(0)
    }
}

/// Account insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    /// Chat-platform id
    pub external_id: Option<i64>,
    /// Username
    pub username: Option<String>,
    /// Referral code, already checked for uniqueness
    pub referral_code: String,
    /// Referring account
    pub referred_by: Option<UserId>,
    /// Balance currency
    pub currency: String,
    /// Promo group
    pub promo_group_id: Option<i64>,
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Top-up
    Deposit,
    /// Manual debit
    Withdrawal,
    /// Subscription purchase or add-on
    SubscriptionPayment,
    /// Money returned
    Refund,
    /// Referral bonus
    ReferralReward,
    /// Poll reward
    PollReward,
}

impl TransactionType {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::SubscriptionPayment => "subscription_payment",
            TransactionType::Refund => "refund",
            TransactionType::ReferralReward => "referral_reward",
            TransactionType::PollReward => "poll_reward",
        }
    }

    /// Credits of this type may unblock a paused plan
    pub fn triggers_balance_followup(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit | TransactionType::Refund | TransactionType::ReferralReward
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "subscription_payment" => Ok(TransactionType::SubscriptionPayment),
            "refund" => Ok(TransactionType::Refund),
            "referral_reward" => Ok(TransactionType::ReferralReward),
            "poll_reward" => Ok(TransactionType::PollReward),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// Audit record of one balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub id: TransactionId,
    /// Account
    pub user_id: UserId,
    /// Type
    pub kind: TransactionType,
    /// Amount in minor units, always positive; direction follows `kind`
    pub amount_minor: i64,
    /// Description
    pub description: String,
    /// Payment method tag
    pub payment_method: Option<String>,
    /// Completed
    pub is_completed: bool,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Completed at
    pub completed_at: Option<DateTime<Utc>>,
}

/// Transaction insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    /// Account
    pub user_id: UserId,
    /// Type
    pub kind: TransactionType,
    /// Amount in minor units
    pub amount_minor: i64,
    /// Description
    pub description: String,
    /// Payment method tag
    pub payment_method: Option<String>,
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Trial period
    Trial,
    /// Paid and running
    Active,
    /// Past its end date
    Expired,
    /// Switched off
    Disabled,
}

impl SubscriptionStatus {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "disabled" => Ok(SubscriptionStatus::Disabled),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// Subscription entitlements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription id
    pub id: SubscriptionId,
    /// Owner
    pub user_id: UserId,
    /// Status
    pub status: SubscriptionStatus,
    /// Trial flag
    pub is_trial: bool,
    /// Current term start
    pub start_date: DateTime<Utc>,
    /// Expiry
    pub end_date: DateTime<Utc>,
    /// Traffic limit in GB, 0 is unlimited
    pub traffic_limit_gb: u32,
    /// Traffic used in the current term
    pub traffic_used_gb: f64,
    /// Device limit
    pub device_limit: u32,
    /// Connected server uuids
    pub connected_servers: Vec<String>,
    /// Last modified
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Still running at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date > now
            && matches!(self.status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
    }

    /// Time left at `now`, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.end_date - now).max(Duration::zero())
    }
}

/// Subscription insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    /// Owner
    pub user_id: UserId,
    /// Status
    pub status: SubscriptionStatus,
    /// Trial flag
    pub is_trial: bool,
    /// Term start
    pub start_date: DateTime<Utc>,
    /// Expiry
    pub end_date: DateTime<Utc>,
    /// Traffic limit in GB
    pub traffic_limit_gb: u32,
    /// Device limit
    pub device_limit: u32,
    /// Connected server uuids
    pub connected_servers: Vec<String>,
}

/// Trial to paid conversion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialConversion {
    /// Account
    pub user_id: UserId,
    /// Days the trial ran before converting
    pub trial_duration_days: i64,
    /// Payment method of the first charge
    pub payment_method: String,
    /// First paid amount (minor units)
    pub first_payment_minor: i64,
    /// First paid period
    pub first_paid_period_days: u32,
    /// When
    pub converted_at: DateTime<Utc>,
}

/// Promo-offer lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoOfferEventKind {
    /// Used by a purchase
    Consumed,
    /// Switched off, e.g. expired
    Disabled,
}

impl PromoOfferEventKind {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoOfferEventKind::Consumed => "consumed",
            PromoOfferEventKind::Disabled => "disabled",
        }
    }
}

/// Promo-offer event log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoOfferEvent {
    /// Account
    pub user_id: UserId,
    /// Event
    pub kind: PromoOfferEventKind,
    /// Percent at the time of the event
    pub percent: i32,
    /// Offer source
    pub source: Option<String>,
    /// Why, e.g. `offer_expired`
    pub reason: Option<String>,
    /// When
    pub at: DateTime<Utc>,
}

/// Offer removed by the expiry sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredPromoOffer {
    /// Account
    pub user_id: UserId,
    /// Offer as it was before clearing
    pub offer: PromoOffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promo_offer_expiry() {
        let now = Utc::now();
        let offer = PromoOffer {
            percent: 20,
            source: Some("spring".into()),
            expires_at: Some(now + Duration::hours(1)),
        };
        assert_eq!(offer.active_percent(now), 20);
        assert_eq!(offer.active_percent(now + Duration::hours(1)), 0);

        let forever = PromoOffer {
            percent: 150,
            source: None,
            expires_at: None,
        };
        assert_eq!(forever.active_percent(now), 100);
    }

    #[test]
    fn test_transaction_type_names() {
        for kind in [
            TransactionType::Deposit,
            TransactionType::Withdrawal,
            TransactionType::SubscriptionPayment,
            TransactionType::Refund,
            TransactionType::ReferralReward,
            TransactionType::PollReward,
        ] {
            assert_eq!(kind.as_str().parse::<TransactionType>(), Ok(kind));
        }
        assert!(TransactionType::Deposit.triggers_balance_followup());
        assert!(!TransactionType::SubscriptionPayment.triggers_balance_followup());
    }
}
