//! In-memory storage implementation.
//!
//! Everything lives behind one mutex, which makes every operation trivially
//! linearizable. Data is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use postora_core::{CreditAccount, CreditTransaction, LedgerEntry, SubscriptionRecord, UserId};

use crate::error::{Result, StoreError};
use crate::{check_seed, stage_delta, AppliedDelta, LedgerAudit, LedgerStore};

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<UserId, CreditAccount>,
    /// Per-user log in insertion (oldest first) order.
    transactions: HashMap<UserId, Vec<CreditTransaction>>,
    idempotency_keys: HashSet<String>,
    subscriptions: HashMap<UserId, SubscriptionRecord>,
}

/// Process-local [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        Ok(self.lock()?.accounts.get(user_id).cloned())
    }

    async fn create_account(
        &self,
        user_id: &UserId,
        initial_credits: i64,
    ) -> Result<CreditAccount> {
        check_seed(initial_credits)?;
        let mut inner = self.lock()?;

        if inner.accounts.contains_key(user_id) {
            return Err(StoreError::AlreadyExists {
                user_id: user_id.to_string(),
            });
        }

        let account = CreditAccount::new(*user_id, initial_credits);
        inner.accounts.insert(*user_id, account.clone());
        if initial_credits > 0 {
            inner
                .transactions
                .entry(*user_id)
                .or_default()
                .push(CreditTransaction::initial(*user_id, initial_credits));
        }

        Ok(account)
    }

    async fn delete_account(&self, user_id: &UserId) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.accounts.remove(user_id).is_none() {
            return Err(StoreError::AccountNotFound {
                user_id: user_id.to_string(),
            });
        }
        inner.transactions.remove(user_id);
        inner.subscriptions.remove(user_id);
        Ok(())
    }

    async fn apply_delta(&self, entry: &LedgerEntry) -> Result<AppliedDelta> {
        if entry.amount == 0 {
            return Err(StoreError::InvalidAmount("amount must be non-zero".into()));
        }

        let mut inner = self.lock()?;

        if let Some(key) = &entry.idempotency_key {
            if inner.idempotency_keys.contains(key) {
                return Err(StoreError::DuplicateEvent { key: key.clone() });
            }
        }

        let account = inner
            .accounts
            .get(&entry.user_id)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound {
                user_id: entry.user_id.to_string(),
            })?;

        let applied = stage_delta(account, entry)?;

        // Nothing below can fail, so the unit stays all-or-nothing.
        inner.accounts.insert(entry.user_id, applied.account.clone());
        inner
            .transactions
            .entry(entry.user_id)
            .or_default()
            .push(applied.transaction.clone());
        if let Some(key) = &entry.idempotency_key {
            inner.idempotency_keys.insert(key.clone());
        }

        Ok(applied)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let inner = self.lock()?;
        Ok(inner
            .transactions
            .get(user_id)
            .map(|log| log.iter().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn has_applied_idempotency_key(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.idempotency_keys.contains(key))
    }

    async fn record_idempotency_key(&self, key: &str) -> Result<()> {
        if self.lock()?.idempotency_keys.insert(key.to_string()) {
            Ok(())
        } else {
            Err(StoreError::DuplicateEvent {
                key: key.to_string(),
            })
        }
    }

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<SubscriptionRecord>> {
        Ok(self.lock()?.subscriptions.get(user_id).cloned())
    }

    async fn put_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        self.lock()?
            .subscriptions
            .insert(record.user_id, record.clone());
        Ok(())
    }

    async fn verify_account(&self, user_id: &UserId) -> Result<LedgerAudit> {
        let inner = self.lock()?;
        let log = inner.transactions.get(user_id).map_or(&[][..], Vec::as_slice);
        let ledger_sum = log
            .iter()
            .try_fold(0_i64, |sum, tx| sum.checked_add(tx.amount))
            .ok_or_else(|| StoreError::Corrupt(format!("ledger sum overflows for {user_id}")))?;

        Ok(LedgerAudit {
            user_id: *user_id,
            account: inner.accounts.get(user_id).cloned(),
            transaction_count: log.len(),
            ledger_sum,
        })
    }
}
