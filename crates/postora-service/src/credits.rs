//! Credit business logic.
//!
//! [`CreditService`] is the only caller of [`LedgerStore`] mutations. It
//! validates amounts and transaction types, creates accounts lazily, and
//! retries transient write conflicts with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use postora_core::{
    CreditAccount, CreditError, CreditTransaction, LedgerEntry, Metadata, Result,
    SubscriptionRecord, TransactionType, UserId,
};
use postora_store::{AppliedDelta, LedgerAudit, LedgerStore, StoreError};

/// Default page size for history listings.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Largest page a history listing returns.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Maximum attempts for a ledger write, including the first.
const LEDGER_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts (doubles with each retry).
const LEDGER_INITIAL_BACKOFF_MS: u64 = 50;

/// Maximum backoff between attempts.
const LEDGER_MAX_BACKOFF_MS: u64 = 1000;

/// How transient write conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Sleep before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: LEDGER_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(LEDGER_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(LEDGER_MAX_BACKOFF_MS),
        }
    }
}

/// Balance and history operations for every caller of the ledger.
#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CreditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditService")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CreditService {
    /// Create a service over `store` with the default retry policy.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Return the user's account, creating it with `default_credits` if missing.
    ///
    /// Concurrent first calls race on `create_account`; the losers read the
    /// winner's account, so at most one account and one seed transaction exist.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for a negative seed, `Storage` on backend failure.
    pub async fn ensure_account(
        &self,
        user_id: &UserId,
        default_credits: i64,
    ) -> Result<CreditAccount> {
        if let Some(account) = self.store.get_account(user_id).await? {
            return Ok(account);
        }

        match self.store.create_account(user_id, default_credits).await {
            Ok(account) => {
                tracing::info!(
                    user_id = %user_id,
                    initial_credits = default_credits,
                    "Credit account created"
                );
                Ok(account)
            }
            Err(StoreError::AlreadyExists { .. }) => self.existing_account(user_id).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the user can currently afford `required` credits.
    ///
    /// A missing account counts as a zero balance. This is a fast-fail check
    /// only; [`Self::deduct`] re-checks inside the store's atomic unit.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` when `required < 1`, `Storage` on backend failure.
    pub async fn has_sufficient_credits(&self, user_id: &UserId, required: i64) -> Result<bool> {
        require_positive(required)?;
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .is_some_and(|account| account.has_sufficient_credits(required)))
    }

    /// Spend `amount` credits.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for `amount < 1` or a non-debit `reason`.
    /// - `AccountNotFound` if the user has no account.
    /// - `InsufficientCredits` if the balance does not cover `amount`.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: TransactionType,
        metadata: Metadata,
    ) -> Result<AppliedDelta> {
        self.apply(debit_entry(*user_id, amount, reason, metadata)?)
            .await
    }

    /// Spend `amount` credits at most once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// As [`Self::deduct`], plus `DuplicateEvent` if the key was applied.
    pub async fn deduct_idempotent(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: TransactionType,
        metadata: Metadata,
        idempotency_key: impl Into<String>,
    ) -> Result<AppliedDelta> {
        let entry =
            debit_entry(*user_id, amount, reason, metadata)?.with_idempotency_key(idempotency_key);
        self.apply(entry).await
    }

    /// Add `amount` credits, creating a zero-seeded account when missing.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for `amount < 1`, a non-credit `reason` or counter
    /// overflow; `Storage` on backend failure.
    pub async fn grant(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: TransactionType,
        metadata: Metadata,
    ) -> Result<AppliedDelta> {
        let entry = credit_entry(*user_id, amount, reason, metadata)?;
        self.ensure_account(user_id, 0).await?;
        self.apply(entry).await
    }

    /// Add `amount` credits at most once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// As [`Self::grant`], plus `DuplicateEvent` if the key was applied.
    pub async fn grant_idempotent(
        &self,
        user_id: &UserId,
        amount: i64,
        reason: TransactionType,
        metadata: Metadata,
        idempotency_key: impl Into<String>,
    ) -> Result<AppliedDelta> {
        let entry =
            credit_entry(*user_id, amount, reason, metadata)?.with_idempotency_key(idempotency_key);
        self.ensure_account(user_id, 0).await?;
        self.apply(entry).await
    }

    /// Hand back credits charged for work that failed.
    ///
    /// # Errors
    ///
    /// `InvalidAmount` for `amount < 1`, `AccountNotFound` if the user has no
    /// account.
    pub async fn refund(
        &self,
        user_id: &UserId,
        amount: i64,
        original_transaction_id: Option<&str>,
        note: Option<&str>,
    ) -> Result<AppliedDelta> {
        let mut metadata = Metadata::new();
        if let Some(id) = original_transaction_id {
            metadata.insert("originalTransactionId".into(), id.into());
        }
        if let Some(note) = note {
            metadata.insert("reason".into(), note.into());
        }
        let entry = credit_entry(*user_id, amount, TransactionType::Refund, metadata)?;
        self.apply(entry).await
    }

    /// The user's account, or a zeroed unsaved view if there is none.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<CreditAccount> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| CreditAccount::empty(*user_id)))
    }

    /// Transactions newest first. `limit` is clamped to `1..=100`.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn get_history(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.list_transactions(user_id, limit, offset).await?)
    }

    /// Whether `key` has already been applied.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn has_applied(&self, key: &str) -> Result<bool> {
        Ok(self.store.has_applied_idempotency_key(key).await?)
    }

    /// Record `key` without touching any balance.
    ///
    /// Returns `false` if the key was already recorded.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn mark_applied(&self, key: &str) -> Result<bool> {
        match self.store.record_idempotency_key(key).await {
            Ok(()) => Ok(true),
            Err(StoreError::DuplicateEvent { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare the account with the sum of its transactions.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn audit(&self, user_id: &UserId) -> Result<LedgerAudit> {
        let audit = self.store.verify_account(user_id).await?;
        if !audit.is_consistent() {
            tracing::error!(
                user_id = %user_id,
                ledger_sum = audit.ledger_sum,
                transaction_count = audit.transaction_count,
                "Ledger does not match account balance"
            );
        }
        Ok(audit)
    }

    /// The user's subscription mirror.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn subscription(&self, user_id: &UserId) -> Result<Option<SubscriptionRecord>> {
        Ok(self.store.get_subscription(user_id).await?)
    }

    /// Insert or replace the user's subscription mirror.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    pub async fn save_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        Ok(self.store.put_subscription(record).await?)
    }

    async fn existing_account(&self, user_id: &UserId) -> Result<CreditAccount> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| CreditError::AccountNotFound {
                user_id: user_id.to_string(),
            })
    }

    /// Apply `entry`, retrying transient write conflicts.
    async fn apply(&self, entry: LedgerEntry) -> Result<AppliedDelta> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.store.apply_delta(&entry).await {
                Ok(applied) => {
                    tracing::info!(
                        user_id = %entry.user_id,
                        amount = entry.amount,
                        transaction_type = %entry.transaction_type,
                        transaction_id = %applied.transaction.id,
                        idempotency_key = ?entry.idempotency_key,
                        balance_after = applied.transaction.balance_after,
                        "Ledger entry applied"
                    );
                    return Ok(applied);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        user_id = %entry.user_id,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Ledger write conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::debug!(user_id = %entry.user_id, error = %e, "Ledger entry rejected");
                    return Err(e.into());
                }
            }
        }
    }
}

fn require_positive(amount: i64) -> Result<()> {
    if amount < 1 {
        return Err(CreditError::InvalidAmount(format!(
            "amount must be at least 1, got {amount}"
        )));
    }
    Ok(())
}

fn debit_entry(
    user_id: UserId,
    amount: i64,
    reason: TransactionType,
    metadata: Metadata,
) -> Result<LedgerEntry> {
    require_positive(amount)?;
    if !reason.is_debit() {
        return Err(CreditError::InvalidAmount(format!(
            "{reason} cannot be used for a deduction"
        )));
    }
    Ok(LedgerEntry::debit(user_id, amount, reason).with_metadata(metadata))
}

fn credit_entry(
    user_id: UserId,
    amount: i64,
    reason: TransactionType,
    metadata: Metadata,
) -> Result<LedgerEntry> {
    require_positive(amount)?;
    if !reason.is_credit() {
        return Err(CreditError::InvalidAmount(format!(
            "{reason} cannot be used for a grant"
        )));
    }
    Ok(LedgerEntry::credit(user_id, amount, reason).with_metadata(metadata))
}
