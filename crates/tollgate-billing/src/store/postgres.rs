//! PostgreSQL store
//!
//! Row locks are `SELECT ... FOR NO KEY UPDATE` inside a transaction that
//! lives as long as the [`AccountGuard`]. Dropping the guard drops the
//! transaction, which rolls it back. Rows referencing a locked account
//! (subscriptions) stay writable from other connections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tollgate_common::{SubscriptionId, TransactionId, UserId};
use tracing::{debug, warn};

use super::{
    AccountGuard, AccountStore, BalanceChange, CommittedChange, PromoOfferChange, StoreError,
    StoreResult, SubscriptionStore,
};
use crate::model::{
    Account, ExpiredPromoOffer, NewAccount, NewSubscription, PromoOffer, PromoOfferEvent,
    Subscription, Transaction, TrialConversion,
};

const ACCOUNT_COLUMNS: &str = "id, external_id, username, referral_code, referred_by, balance_minor, \
     currency, promo_group_id, promo_offer_percent, promo_offer_source, promo_offer_expires_at, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, kind, amount_minor, description, payment_method, is_completed, created_at, completed_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, status, is_trial, start_date, end_date, traffic_limit_gb, \
     traffic_used_gb, device_limit, connected_servers, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or_default().to_string(),
            },
            sqlx::Error::Io(e) => StoreError::Connection(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Connection("connection pool unavailable".into())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|_| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("negative value {}", value).into(),
    })
}

fn to_i32(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Query(format!("value {} out of range", value)))
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    let percent: i32 = row.try_get("promo_offer_percent")?;
    let promo_offer = (percent > 0).then(|| -> Result<PromoOffer, sqlx::Error> {
        Ok(PromoOffer {
            percent,
            source: row.try_get("promo_offer_source")?,
            expires_at: row.try_get("promo_offer_expires_at")?,
        })
    });

    Ok(Account {
        id: UserId::new(row.try_get("id")?),
        external_id: row.try_get("external_id")?,
        username: row.try_get("username")?,
        referral_code: row.try_get("referral_code")?,
        referred_by: row.try_get::<Option<i64>, _>("referred_by")?.map(UserId::new),
        balance_minor: row.try_get("balance_minor")?,
        currency: row.try_get("currency")?,
        promo_group_id: row.try_get("promo_group_id")?,
        promo_offer: promo_offer.transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    Ok(Transaction {
        id: TransactionId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        kind: kind.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "kind".into(),
            source: e.into(),
        })?,
        amount_minor: row.try_get("amount_minor")?,
        description: row.try_get("description")?,
        payment_method: row.try_get("payment_method")?,
        is_completed: row.try_get("is_completed")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Subscription {
        id: SubscriptionId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        status: status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: e.into(),
        })?,
        is_trial: row.try_get("is_trial")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        traffic_limit_gb: to_u32(row.try_get("traffic_limit_gb")?, "traffic_limit_gb")?,
        traffic_used_gb: row.try_get("traffic_used_gb")?,
        device_limit: to_u32(row.try_get("device_limit")?, "device_limit")?,
        connected_servers: row.try_get("connected_servers")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL implementation of both store ports
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a small pool
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PgAccountGuard {
    tx: sqlx::Transaction<'static, Postgres>,
    account: Account,
}

#[async_trait]
impl AccountGuard for PgAccountGuard {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn commit(self: Box<Self>, change: BalanceChange) -> StoreResult<CommittedChange> {
        let PgAccountGuard { mut tx, account } = *self;

        let (percent, source, expires_at) = match &change.promo_offer {
            PromoOfferChange::Keep => account
                .promo_offer
                .as_ref()
                .map(|o| (o.percent, o.source.clone(), o.expires_at))
                .unwrap_or((0, None, None)),
            PromoOfferChange::Clear => (0, None, None),
            PromoOfferChange::Set(o) => (o.percent, o.source.clone(), o.expires_at),
        };

        let row = sqlx::query(&format!(
            "UPDATE accounts
             SET balance_minor = $2, promo_offer_percent = $3, promo_offer_source = $4,
                 promo_offer_expires_at = $5, updated_at = now()
             WHERE id = $1
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account.id.get())
        .bind(change.new_balance)
        .bind(percent)
        .bind(source)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;
        let updated = account_from_row(&row)?;

        let transaction = match change.transaction {
            Some(new) => {
                let row = sqlx::query(&format!(
                    "INSERT INTO transactions (user_id, kind, amount_minor, description, payment_method, is_completed, completed_at)
                     VALUES ($1, $2, $3, $4, $5, true, now())
                     RETURNING {TRANSACTION_COLUMNS}"
                ))
                .bind(new.user_id.get())
                .bind(new.kind.as_str())
                .bind(new.amount_minor)
                .bind(&new.description)
                .bind(&new.payment_method)
                .fetch_one(&mut *tx)
                .await?;
                Some(transaction_from_row(&row)?)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(CommittedChange {
            account: updated,
            transaction,
        })
    }

    async fn rollback(self: Box<Self>) {
        let PgAccountGuard { tx, account } = *self;
        if let Err(e) = tx.rollback().await {
            warn!(user_id = %account.id, error = %e, "Rollback failed");
        }
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn lock_account(&self, id: UserId) -> StoreResult<Box<dyn AccountGuard>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => Ok(Box::new(PgAccountGuard {
                account: account_from_row(&row)?,
                tx,
            })),
            None => Err(StoreError::NotFound(format!("account {}", id))),
        }
    }

    async fn get_account(&self, id: UserId) -> StoreResult<Account> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        Ok(account_from_row(&row)?)
    }

    async fn insert_account(&self, account: NewAccount) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (external_id, username, referral_code, referred_by, currency, promo_group_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account.external_id)
        .bind(&account.username)
        .bind(&account.referral_code)
        .bind(account.referred_by.map(|id| id.get()))
        .bind(&account.currency)
        .bind(account.promo_group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(account_from_row(&row)?)
    }

    async fn referral_code_taken(&self, code: &str) -> StoreResult<bool> {
        let taken: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM accounts WHERE referral_code = $1)")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(taken)
    }

    async fn resync_account_sequence(&self) -> StoreResult<i64> {
        let next: i64 = sqlx::query_scalar(
            "SELECT setval(pg_get_serial_sequence('accounts', 'id'),
                           COALESCE((SELECT MAX(id) FROM accounts), 0) + 1, false)",
        )
        .fetch_one(&self.pool)
        .await?;
        debug!(next_id = next, "Account sequence resynchronised");
        Ok(next)
    }

    async fn clear_expired_promo_offers(&self, now: DateTime<Utc>) -> StoreResult<Vec<ExpiredPromoOffer>> {
        // Each row is cleared by its own UPDATE; the CTE captures the old values.
        let rows = sqlx::query(
            "WITH expired AS (
                 SELECT id, promo_offer_percent, promo_offer_source, promo_offer_expires_at
                 FROM accounts
                 WHERE promo_offer_percent > 0 AND promo_offer_expires_at <= $1
                 FOR NO KEY UPDATE
             )
             UPDATE accounts a
             SET promo_offer_percent = 0, promo_offer_source = NULL,
                 promo_offer_expires_at = NULL, updated_at = now()
             FROM expired e
             WHERE a.id = e.id
             RETURNING e.id, e.promo_offer_percent, e.promo_offer_source, e.promo_offer_expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExpiredPromoOffer {
                    user_id: UserId::new(row.try_get("id")?),
                    offer: PromoOffer {
                        percent: row.try_get("promo_offer_percent")?,
                        source: row.try_get("promo_offer_source")?,
                        expires_at: row.try_get("promo_offer_expires_at")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn record_promo_offer_event(&self, event: PromoOfferEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO promo_offer_events (user_id, kind, percent, source, reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.user_id.get())
        .bind(event.kind.as_str())
        .bind(event.percent)
        .bind(&event.source)
        .bind(&event.reason)
        .bind(event.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transactions(&self, user_id: UserId) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = $1 ORDER BY id"
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn subscription_for_user(&self, user_id: UserId) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1"
        ))
        .bind(user_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(subscription_from_row).transpose()?)
    }

    async fn create_subscription(&self, new: NewSubscription) -> StoreResult<Subscription> {
        let row = sqlx::query(&format!(
            "INSERT INTO subscriptions (user_id, status, is_trial, start_date, end_date, traffic_limit_gb, device_limit, connected_servers)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(new.user_id.get())
        .bind(new.status.as_str())
        .bind(new.is_trial)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(to_i32(new.traffic_limit_gb)?)
        .bind(to_i32(new.device_limit)?)
        .bind(&new.connected_servers)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription_from_row(&row)?)
    }

    async fn update_subscription(&self, s: &Subscription) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET status = $2, is_trial = $3, start_date = $4, end_date = $5, traffic_limit_gb = $6,
                 traffic_used_gb = $7, device_limit = $8, connected_servers = $9, updated_at = $10
             WHERE id = $1",
        )
        .bind(s.id.get())
        .bind(s.status.as_str())
        .bind(s.is_trial)
        .bind(s.start_date)
        .bind(s.end_date)
        .bind(to_i32(s.traffic_limit_gb)?)
        .bind(s.traffic_used_gb)
        .bind(to_i32(s.device_limit)?)
        .bind(&s.connected_servers)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription {}", s.id)));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription {}", id)));
        }
        Ok(())
    }

    async fn record_conversion(&self, c: TrialConversion) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO subscription_conversions
                 (user_id, trial_duration_days, payment_method, first_payment_minor, first_paid_period_days, converted_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(c.user_id.get())
        .bind(c.trial_duration_days)
        .bind(&c.payment_method)
        .bind(c.first_payment_minor)
        .bind(to_i32(c.first_paid_period_days)?)
        .bind(c.converted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
