//! Subscription lifecycle rules
//!
//! Pure functions over [`Subscription`] values; the purchase service persists
//! the result. A paid period always extends from the later of now and the
//! current end date, so time already paid for is never lost.

use chrono::{DateTime, Duration, Utc};
use tollgate_common::{PricingConfig, UserId};

use crate::model::{NewSubscription, Subscription, SubscriptionStatus};

/// Entitlements bought with one paid period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidTerms {
    /// Period length in days
    pub period_days: u32,
    /// Traffic limit in GB
    pub traffic_limit_gb: u32,
    /// Device limit
    pub device_limit: u32,
    /// Server uuids
    pub servers: Vec<String>,
}

/// What [`apply_paid_period`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// The subscription was a trial before
    pub converted_trial: bool,
    /// Whole days the trial ran, when converted
    pub trial_duration_days: i64,
    /// Unused trial time carried over
    pub carried_over: Duration,
    /// End date before the extension
    pub previous_end: DateTime<Utc>,
}

/// Extend `subscription` by a paid period and switch it to the new terms.
///
/// An expired subscription restarts at `now`. A trial becomes a paid
/// subscription starting at `now`; with `carry_trial_remaining` its unused
/// time is added on top.
pub fn apply_paid_period(
    subscription: &mut Subscription,
    terms: &PaidTerms,
    now: DateTime<Utc>,
    carry_trial_remaining: bool,
) -> Extension {
    let previous_end = subscription.end_date;
    let converted_trial = subscription.is_trial;
    let trial_duration_days = if converted_trial {
        (now - subscription.start_date).num_days()
    } else {
        0
    };
    let carried_over = if converted_trial && carry_trial_remaining {
        subscription.remaining(now)
    } else {
        Duration::zero()
    };

    let from = if subscription.end_date > now && !converted_trial {
        subscription.end_date
    } else {
        subscription.start_date = now;
        now
    };

    subscription.end_date = from + Duration::days(i64::from(terms.period_days)) + carried_over;
    subscription.is_trial = false;
    subscription.status = SubscriptionStatus::Active;
    subscription.traffic_limit_gb = terms.traffic_limit_gb;
    subscription.traffic_used_gb = 0.0;
    subscription.device_limit = terms.device_limit;
    subscription.connected_servers = terms.servers.clone();
    subscription.updated_at = now;

    Extension {
        converted_trial,
        trial_duration_days,
        carried_over,
        previous_end,
    }
}

/// First paid subscription for an account
pub fn new_paid_subscription(user_id: UserId, terms: &PaidTerms, now: DateTime<Utc>) -> NewSubscription {
    NewSubscription {
        user_id,
        status: SubscriptionStatus::Active,
        is_trial: false,
        start_date: now,
        end_date: now + Duration::days(i64::from(terms.period_days)),
        traffic_limit_gb: terms.traffic_limit_gb,
        device_limit: terms.device_limit,
        connected_servers: terms.servers.clone(),
    }
}

/// Trial subscription with the configured limits
pub fn new_trial_subscription(
    user_id: UserId,
    config: &PricingConfig,
    servers: Vec<String>,
    now: DateTime<Utc>,
) -> NewSubscription {
    NewSubscription {
        user_id,
        status: SubscriptionStatus::Trial,
        is_trial: true,
        start_date: now,
        end_date: now + Duration::days(i64::from(config.trial_duration_days)),
        traffic_limit_gb: config.trial_traffic_limit_gb,
        device_limit: config.trial_device_limit,
        connected_servers: servers,
    }
}

/// Days left, partial days rounded up
pub fn remaining_days(subscription: &Subscription, now: DateTime<Utc>) -> u32 {
    let seconds = subscription.remaining(now).num_seconds();
    let days = (seconds + 86_399) / 86_400;
    u32::try_from(days).unwrap_or(u32::MAX)
}
