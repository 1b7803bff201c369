//! Storage layer for the PostoraAI credit ledger.
//!
//! The [`LedgerStore`] trait is the only way balances change. Its central
//! contract is [`LedgerStore::apply_delta`]: the balance update, the
//! transaction row and the idempotency key are written as one atomic unit,
//! and concurrent calls for the same user are serialized.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, for tests and embedding.
//! - `RocksStore` (feature `rocksdb-backend`): column families
//!   `accounts`, `transactions`, `transactions_by_user`, `idempotency_keys`,
//!   `subscriptions`, CBOR-encoded values.
//! - [`PgStore`]: PostgreSQL tables `user_credits`, `credit_transactions`,
//!   `credit_idempotency_keys`, `subscriptions`.
//!
//! # Example
//!
//! ```no_run
//! use postora_core::{LedgerEntry, TransactionType, UserId};
//! use postora_store::{LedgerStore, MemoryStore};
//!
//! # async fn demo() -> postora_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//! store.create_account(&user_id, 3).await?;
//!
//! let applied = store
//!     .apply_delta(&LedgerEntry::debit(user_id, 2, TransactionType::ImageGeneration))
//!     .await?;
//! assert_eq!(applied.account.available_credits, 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use postora_core::{CreditAccount, CreditTransaction, LedgerEntry, SubscriptionRecord, UserId};

/// Page size used when walking a full history for an audit.
const AUDIT_PAGE_SIZE: usize = 500;

/// The result of a successful [`LedgerStore::apply_delta`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDelta {
    /// The account after the change.
    pub account: CreditAccount,
    /// The transaction that recorded it.
    pub transaction: CreditTransaction,
}

/// Self-check comparing an account against its own transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAudit {
    /// The audited user.
    pub user_id: UserId,
    /// The stored account, if any.
    pub account: Option<CreditAccount>,
    /// Number of transactions in the log.
    pub transaction_count: usize,
    /// Sum of all transaction amounts.
    pub ledger_sum: i64,
}

impl LedgerAudit {
    /// Whether the counters hold their invariant and agree with the log.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match &self.account {
            Some(account) => account.is_consistent() && account.available_credits == self.ledger_sum,
            None => self.transaction_count == 0,
        }
    }
}

/// Durable storage for credit accounts, transactions, idempotency keys and
/// subscription records.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Get an account by user ID. `None` means the user has no account yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>>;

    /// Create an account seeded with `initial_credits`.
    ///
    /// A positive seed is logged as one `initial_credits` transaction in the
    /// same atomic unit.
    ///
    /// # Errors
    ///
    /// - `StoreError::AlreadyExists` if the user already has an account.
    /// - `StoreError::InvalidAmount` for a negative seed.
    async fn create_account(&self, user_id: &UserId, initial_credits: i64)
        -> Result<CreditAccount>;

    /// Delete an account together with its transactions and subscription.
    ///
    /// Only used for full user erasure.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AccountNotFound` if the account doesn't exist.
    async fn delete_account(&self, user_id: &UserId) -> Result<()>;

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Apply a signed change and append its transaction atomically.
    ///
    /// Calls for the same user are serialized; the balance check happens
    /// inside the atomic unit, so two deductions can never both spend the
    /// same credits.
    ///
    /// # Errors
    ///
    /// - `StoreError::InvalidAmount` for a zero amount or counter overflow.
    /// - `StoreError::AccountNotFound` if the account doesn't exist.
    /// - `StoreError::InsufficientCredits` if a debit exceeds the balance.
    /// - `StoreError::DuplicateEvent` if the entry's idempotency key was seen.
    /// - `StoreError::WriteConflict` on transient contention.
    async fn apply_delta(&self, entry: &LedgerEntry) -> Result<AppliedDelta>;

    /// List transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Idempotency
    // =========================================================================

    /// Whether `key` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn has_applied_idempotency_key(&self, key: &str) -> Result<bool>;

    /// Record `key` without any balance change.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateEvent` if the key was already recorded.
    async fn record_idempotency_key(&self, key: &str) -> Result<()>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Get the subscription mirror for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<SubscriptionRecord>>;

    /// Insert or replace the subscription mirror for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn put_subscription(&self, record: &SubscriptionRecord) -> Result<()>;

    // =========================================================================
    // Audit
    // =========================================================================

    /// Compare an account with the sum of its transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn verify_account(&self, user_id: &UserId) -> Result<LedgerAudit> {
        let account = self.get_account(user_id).await?;

        let mut transaction_count = 0;
        let mut ledger_sum: i64 = 0;
        loop {
            let page = self
                .list_transactions(user_id, AUDIT_PAGE_SIZE, transaction_count)
                .await?;
            let fetched = page.len();
            for tx in page {
                ledger_sum = ledger_sum.checked_add(tx.amount).ok_or_else(|| {
                    StoreError::Corrupt(format!("ledger sum overflows for {user_id}"))
                })?;
            }
            transaction_count += fetched;
            if fetched < AUDIT_PAGE_SIZE {
                break;
            }
        }

        Ok(LedgerAudit {
            user_id: *user_id,
            account,
            transaction_count,
            ledger_sum,
        })
    }
}

/// Reject a negative account seed.
pub(crate) fn check_seed(initial_credits: i64) -> Result<()> {
    if initial_credits < 0 {
        return Err(StoreError::InvalidAmount(format!(
            "initial credits must not be negative, got {initial_credits}"
        )));
    }
    Ok(())
}

/// Apply `entry` to `account` in memory and build the matching transaction.
///
/// Shared by the backends that do their own locking.
pub(crate) fn stage_delta(
    mut account: CreditAccount,
    entry: &LedgerEntry,
) -> Result<AppliedDelta> {
    account.apply(entry.amount)?;
    if !account.is_consistent() {
        return Err(StoreError::Corrupt(format!(
            "account {} violates available = received - used",
            account.user_id
        )));
    }
    let transaction = CreditTransaction::from_entry(entry, account.available_credits);
    Ok(AppliedDelta {
        account,
        transaction,
    })
}
