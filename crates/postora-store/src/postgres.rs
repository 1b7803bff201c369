//! PostgreSQL storage implementation.
//!
//! `apply_delta` runs in one database transaction: claim the idempotency key
//! with `INSERT ... ON CONFLICT DO NOTHING`, lock the account row with
//! `SELECT ... FOR UPDATE`, then update the counters and append the ledger
//! row. Any failure rolls the whole unit back, including the key claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use postora_core::{
    CreditAccount, CreditTransaction, LedgerEntry, Metadata, SubscriptionRecord, TransactionId,
    UserId,
};

use crate::error::{Result, StoreError};
use crate::{check_seed, stage_delta, AppliedDelta, LedgerAudit, LedgerStore};

const MAX_CONNECTIONS: u32 = 10;

const ACCOUNT_COLUMNS: &str =
    "user_id, available_credits, total_credits_received, credits_used, created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, transaction_type, balance_after, metadata, idempotency_key, created_at";

#[derive(Debug, FromRow)]
struct AccountRow {
    user_id: Uuid,
    available_credits: i64,
    total_credits_received: i64,
    credits_used: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for CreditAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            available_credits: row.available_credits,
            total_credits_received: row.total_credits_received,
            credits_used: row.credits_used,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: String,
    user_id: Uuid,
    amount: i64,
    transaction_type: String,
    balance_after: i64,
    metadata: Json<Metadata>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let id: TransactionId = row
            .id
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad transaction id: {}", row.id)))?;
        let transaction_type = row.transaction_type.parse().map_err(StoreError::Corrupt)?;
        Ok(Self {
            id,
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            transaction_type,
            balance_after: row.balance_after,
            metadata: row.metadata.0,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    subscription_id: String,
    plan_id: String,
    status: String,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Self {
            user_id: UserId::from_uuid(row.user_id),
            subscription_id: row.subscription_id,
            plan_id: row.plan_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// PostgreSQL-backed [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to `database_url` with a small pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        tracing::info!("Ledger migrations applied");
        Ok(())
    }

    async fn insert_transaction(
        conn: &mut sqlx::PgConnection,
        tx: &CreditTransaction,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_transactions \
             (id, user_id, amount, transaction_type, balance_after, metadata, idempotency_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(tx.id.to_string())
        .bind(tx.user_id.as_uuid())
        .bind(tx.amount)
        .bind(tx.transaction_type.as_str())
        .bind(tx.balance_after)
        .bind(Json(&tx.metadata))
        .bind(tx.idempotency_key.as_deref())
        .bind(tx.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM user_credits WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CreditAccount::from))
    }

    async fn create_account(
        &self,
        user_id: &UserId,
        initial_credits: i64,
    ) -> Result<CreditAccount> {
        check_seed(initial_credits)?;
        let account = CreditAccount::new(*user_id, initial_credits);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO user_credits \
             (user_id, available_credits, total_credits_received, credits_used, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .bind(account.available_credits)
        .bind(account.total_credits_received)
        .bind(account.credits_used)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                user_id: user_id.to_string(),
            });
        }

        if initial_credits > 0 {
            let seed = CreditTransaction::initial(*user_id, initial_credits);
            Self::insert_transaction(&mut tx, &seed).await?;
        }
        tx.commit().await?;

        tracing::debug!(user_id = %user_id, initial_credits, "Account created");
        Ok(account)
    }

    async fn delete_account(&self, user_id: &UserId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        // credit_transactions rows go with the account via ON DELETE CASCADE.
        let deleted = sqlx::query("DELETE FROM user_credits WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::AccountNotFound {
                user_id: user_id.to_string(),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_delta(&self, entry: &LedgerEntry) -> Result<AppliedDelta> {
        if entry.amount == 0 {
            return Err(StoreError::InvalidAmount("amount must be non-zero".into()));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(key) = &entry.idempotency_key {
            let claimed = sqlx::query(
                "INSERT INTO credit_idempotency_keys (key) VALUES ($1) ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if claimed == 0 {
                return Err(StoreError::DuplicateEvent { key: key.clone() });
            }
        }

        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM user_credits WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(entry.user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let account = row
            .map(CreditAccount::from)
            .ok_or_else(|| StoreError::AccountNotFound {
                user_id: entry.user_id.to_string(),
            })?;

        let applied = stage_delta(account, entry)?;

        sqlx::query(
            "UPDATE user_credits \
             SET available_credits = $2, total_credits_received = $3, credits_used = $4, updated_at = $5 \
             WHERE user_id = $1",
        )
        .bind(entry.user_id.as_uuid())
        .bind(applied.account.available_credits)
        .bind(applied.account.total_credits_received)
        .bind(applied.account.credits_used)
        .bind(applied.account.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_transaction(&mut tx, &applied.transaction).await?;
        tx.commit().await?;

        Ok(applied)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.as_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn has_applied_idempotency_key(&self, key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM credit_idempotency_keys WHERE key = $1)",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_idempotency_key(&self, key: &str) -> Result<()> {
        let claimed = sqlx::query(
            "INSERT INTO credit_idempotency_keys (key) VALUES ($1) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Err(StoreError::DuplicateEvent {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT user_id, subscription_id, plan_id, status, current_period_start, \
             current_period_end, cancel_at_period_end, created_at, updated_at \
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn put_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions \
             (user_id, subscription_id, plan_id, status, current_period_start, current_period_end, \
              cancel_at_period_end, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (user_id) DO UPDATE SET \
               subscription_id = EXCLUDED.subscription_id, \
               plan_id = EXCLUDED.plan_id, \
               status = EXCLUDED.status, \
               current_period_start = EXCLUDED.current_period_start, \
               current_period_end = EXCLUDED.current_period_end, \
               cancel_at_period_end = EXCLUDED.cancel_at_period_end, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(record.user_id.as_uuid())
        .bind(&record.subscription_id)
        .bind(&record.plan_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn verify_account(&self, user_id: &UserId) -> Result<LedgerAudit> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM user_credits WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let (count, sum): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT, COALESCE(SUM(amount), 0)::BIGINT \
             FROM credit_transactions WHERE user_id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(LedgerAudit {
            user_id: *user_id,
            account: row.map(CreditAccount::from),
            transaction_count: usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative row count for {user_id}")))?,
            ledger_sum: sum,
        })
    }
}
