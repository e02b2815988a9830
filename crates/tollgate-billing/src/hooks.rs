//! Best-effort collaborators
//!
//! Everything here runs after money has moved. Failures are logged by the
//! caller and never reverse a committed balance change.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::HookError;
use crate::model::{Account, Subscription, TransactionType};
use crate::purchase::PurchaseReceipt;

/// Applies entitlements to the delivery system
#[async_trait]
pub trait ProvisioningSync: Send + Sync {
    /// Push the subscription's limits and servers for the account
    async fn apply_entitlements(&self, account: &Account, subscription: &Subscription) -> Result<(), HookError>;
}

/// Notified after a purchase completes
#[async_trait]
pub trait PurchaseNotifier: Send + Sync {
    /// Purchase committed
    async fn purchase_completed(&self, account: &Account, receipt: &PurchaseReceipt) -> Result<(), HookError>;
}

/// Follow-up after a balance credit, e.g. resuming a paused plan
#[async_trait]
pub trait BalanceObserver: Send + Sync {
    /// Balance credited
    async fn balance_credited(&self, account: &Account, kind: TransactionType, amount_minor: i64) -> Result<(), HookError>;
}

/// Collaborator that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl ProvisioningSync for Noop {
    async fn apply_entitlements(&self, _: &Account, _: &Subscription) -> Result<(), HookError> {
        Ok(())
    }
}

#[async_trait]
impl PurchaseNotifier for Noop {
    async fn purchase_completed(&self, _: &Account, _: &PurchaseReceipt) -> Result<(), HookError> {
        Ok(())
    }
}

#[async_trait]
impl BalanceObserver for Noop {
    async fn balance_credited(&self, _: &Account, _: TransactionType, _: i64) -> Result<(), HookError> {
        Ok(())
    }
}

/// Provisioning endpoint that records calls and can be switched to fail
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    failing: AtomicBool,
    applied: Mutex<Vec<Subscription>>,
}

impl RecordingProvisioner {
    /// Create a working recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Subscriptions applied so far
    pub fn applied(&self) -> Vec<Subscription> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl ProvisioningSync for RecordingProvisioner {
    async fn apply_entitlements(&self, _account: &Account, subscription: &Subscription) -> Result<(), HookError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HookError("provisioning endpoint unavailable".into()));
        }
        self.applied.lock().push(subscription.clone());
        Ok(())
    }
}
