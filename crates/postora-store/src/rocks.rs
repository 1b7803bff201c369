//! `RocksDB` storage implementation.
//!
//! Every mutation is a read-modify-write done under a single writer lock and
//! committed with one `WriteBatch`, so the account row, the transaction, its
//! index entry and the idempotency key land together or not at all.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use postora_core::{CreditAccount, CreditTransaction, LedgerEntry, SubscriptionRecord, UserId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{check_seed, stage_delta, AppliedDelta, LedgerAudit, LedgerStore};

/// RocksDB-backed [`LedgerStore`].
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("rocks write lock poisoned".into()))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn read<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn key_exists(&self, key: &str) -> Result<bool> {
        let cf = self.cf(cf::IDEMPOTENCY_KEYS)?;
        Ok(self
            .db
            .get_cf(&cf, keys::idempotency_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Add a transaction and its user index entry to `batch`.
    fn stage_transaction(&self, batch: &mut WriteBatch, tx: &CreditTransaction) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        batch.put_cf(&cf_tx, keys::transaction_key(&tx.id), Self::serialize(tx)?);
        batch.put_cf(&cf_by_user, keys::user_transaction_key(&tx.user_id, &tx.id), b"");
        Ok(())
    }

    /// Index keys of one user, newest first.
    fn user_index_keys(&self, user_id: &UserId) -> Result<Vec<Box<[u8]>>> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);
        let upper = keys::user_transactions_upper_bound(user_id);

        let mut found = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&upper, Direction::Reverse))
        {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            found.push(key);
        }
        Ok(found)
    }
}

#[async_trait]
impl LedgerStore for RocksStore {
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.read(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    async fn create_account(
        &self,
        user_id: &UserId,
        initial_credits: i64,
    ) -> Result<CreditAccount> {
        check_seed(initial_credits)?;
        let _guard = self.lock_writes()?;

        let account_key = keys::account_key(user_id);
        if self.read::<CreditAccount>(cf::ACCOUNTS, &account_key)?.is_some() {
            return Err(StoreError::AlreadyExists {
                user_id: user_id.to_string(),
            });
        }

        let account = CreditAccount::new(*user_id, initial_credits);
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(cf::ACCOUNTS)?, &account_key, Self::serialize(&account)?);
        if initial_credits > 0 {
            self.stage_transaction(
                &mut batch,
                &CreditTransaction::initial(*user_id, initial_credits),
            )?;
        }
        self.write(batch)?;

        tracing::debug!(user_id = %user_id, initial_credits, "Account created");
        Ok(account)
    }

    async fn delete_account(&self, user_id: &UserId) -> Result<()> {
        let _guard = self.lock_writes()?;

        let account_key = keys::account_key(user_id);
        if self.read::<CreditAccount>(cf::ACCOUNTS, &account_key)?.is_none() {
            return Err(StoreError::AccountNotFound {
                user_id: user_id.to_string(),
            });
        }

        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let mut batch = WriteBatch::default();
        for index_key in self.user_index_keys(user_id)? {
            if let Some(tx_id) = keys::extract_transaction_id_from_user_key(&index_key) {
                batch.delete_cf(&cf_tx, keys::transaction_key(&tx_id));
            }
            batch.delete_cf(&cf_by_user, &index_key);
        }
        batch.delete_cf(&self.cf(cf::ACCOUNTS)?, &account_key);
        batch.delete_cf(&self.cf(cf::SUBSCRIPTIONS)?, keys::subscription_key(user_id));
        self.write(batch)
    }

    async fn apply_delta(&self, entry: &LedgerEntry) -> Result<AppliedDelta> {
        if entry.amount == 0 {
            return Err(StoreError::InvalidAmount("amount must be non-zero".into()));
        }

        let _guard = self.lock_writes()?;

        if let Some(key) = &entry.idempotency_key {
            if self.key_exists(key)? {
                return Err(StoreError::DuplicateEvent { key: key.clone() });
            }
        }

        let account_key = keys::account_key(&entry.user_id);
        let account: CreditAccount =
            self.read(cf::ACCOUNTS, &account_key)?
                .ok_or_else(|| StoreError::AccountNotFound {
                    user_id: entry.user_id.to_string(),
                })?;

        let applied = stage_delta(account, entry)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(cf::ACCOUNTS)?,
            &account_key,
            Self::serialize(&applied.account)?,
        );
        self.stage_transaction(&mut batch, &applied.transaction)?;
        if let Some(key) = &entry.idempotency_key {
            batch.put_cf(
                &self.cf(cf::IDEMPOTENCY_KEYS)?,
                keys::idempotency_key(key),
                applied.transaction.created_at.to_rfc3339(),
            );
        }
        self.write(batch)?;

        Ok(applied)
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let mut transactions = Vec::new();
        for index_key in self
            .user_index_keys(user_id)?
            .into_iter()
            .skip(offset)
            .take(limit)
        {
            let tx_id = keys::extract_transaction_id_from_user_key(&index_key).ok_or_else(|| {
                StoreError::Corrupt(format!("malformed index key for {user_id}"))
            })?;
            if let Some(tx) = self.read(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    async fn has_applied_idempotency_key(&self, key: &str) -> Result<bool> {
        self.key_exists(key)
    }

    async fn record_idempotency_key(&self, key: &str) -> Result<()> {
        let _guard = self.lock_writes()?;
        if self.key_exists(key)? {
            return Err(StoreError::DuplicateEvent {
                key: key.to_string(),
            });
        }

        let cf = self.cf(cf::IDEMPOTENCY_KEYS)?;
        self.db
            .put_cf(&cf, keys::idempotency_key(key), chrono::Utc::now().to_rfc3339())
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<SubscriptionRecord>> {
        self.read(cf::SUBSCRIPTIONS, &keys::subscription_key(user_id))
    }

    async fn put_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
        let cf = self.cf(cf::SUBSCRIPTIONS)?;
        self.db
            .put_cf(
                &cf,
                keys::subscription_key(&record.user_id),
                Self::serialize(record)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn verify_account(&self, user_id: &UserId) -> Result<LedgerAudit> {
        // Hold the writer lock so the account and its log are read as one snapshot.
        let _guard = self.lock_writes()?;

        let account = self.read(cf::ACCOUNTS, &keys::account_key(user_id))?;
        let index_keys = self.user_index_keys(user_id)?;

        let mut ledger_sum: i64 = 0;
        for index_key in &index_keys {
            let Some(tx_id) = keys::extract_transaction_id_from_user_key(index_key) else {
                return Err(StoreError::Corrupt(format!("malformed index key for {user_id}")));
            };
            let tx: CreditTransaction = self
                .read(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))?
                .ok_or_else(|| StoreError::Corrupt(format!("dangling index entry {tx_id}")))?;
            ledger_sum = ledger_sum
                .checked_add(tx.amount)
                .ok_or_else(|| StoreError::Corrupt(format!("ledger sum overflows for {user_id}")))?;
        }

        Ok(LedgerAudit {
            user_id: *user_id,
            account,
            transaction_count: index_keys.len(),
            ledger_sum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postora_core::{BillingPeriod, SubscriptionStatus, TransactionType};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn scenario_new_user_spends_free_credits() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();

        store.create_account(&user_id, 3).await.unwrap();

        let applied = store
            .apply_delta(&LedgerEntry::debit(user_id, 2, TransactionType::ImageGeneration))
            .await
            .unwrap();
        assert_eq!(applied.transaction.balance_after, 1);
        let a = &applied.account;
        assert_eq!((a.available_credits, a.total_credits_received, a.credits_used), (1, 3, 2));

        let result = store
            .apply_delta(&LedgerEntry::debit(user_id, 2, TransactionType::ImageGeneration))
            .await;
        assert!(matches!(result, Err(StoreError::InsufficientCredits { .. })));

        let a = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!((a.available_credits, a.total_credits_received, a.credits_used), (1, 3, 2));
    }

    #[tokio::test]
    async fn history_survives_reopen_newest_first() {
        let dir = TempDir::new().unwrap();
        let user_id = UserId::generate();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.create_account(&user_id, 10).await.unwrap();
            store
                .apply_delta(&LedgerEntry::debit(user_id, 4, TransactionType::SocialPostGeneration))
                .await
                .unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        let history = store.list_transactions(&user_id, 10, 0).await.unwrap();
        assert_eq!(history.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![-4, 10]);

        let page2 = store.list_transactions(&user_id, 1, 1).await.unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].transaction_type, TransactionType::InitialCredits);
    }

    #[tokio::test]
    async fn back_to_back_writes_list_newest_first() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store.create_account(&user_id, 0).await.unwrap();

        for amount in 1..=50 {
            store
                .apply_delta(&LedgerEntry::credit(user_id, amount, TransactionType::Purchase))
                .await
                .unwrap();
            store
                .apply_delta(&LedgerEntry::debit(user_id, 1, TransactionType::ImageGeneration))
                .await
                .unwrap();
        }

        let history = store.list_transactions(&user_id, 100, 0).await.unwrap();
        assert_eq!(history.len(), 100);
        let amounts: Vec<i64> = history.iter().map(|t| t.amount).collect();
        let expected: Vec<i64> = (1..=50).rev().flat_map(|amount| [-1, amount]).collect();
        assert_eq!(amounts, expected);
    }

    #[tokio::test]
    async fn histories_do_not_leak_between_users() {
        let (store, _dir) = create_test_store();
        let alice = UserId::generate();
        let bob = UserId::generate();
        store.create_account(&alice, 3).await.unwrap();
        store.create_account(&bob, 7).await.unwrap();

        let history = store.list_transactions(&alice, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 3);
    }

    #[tokio::test]
    async fn idempotency_key_recorded_with_grant() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store.create_account(&user_id, 5).await.unwrap();

        let entry = LedgerEntry::credit(user_id, 200, TransactionType::SubscriptionRenewal)
            .with_idempotency_key("invoice:in_42");
        let applied = store.apply_delta(&entry).await.unwrap();
        assert_eq!(applied.account.available_credits, 205);
        assert_eq!(applied.account.total_credits_received, 205);

        let replay = store.apply_delta(&entry).await;
        assert!(matches!(replay, Err(StoreError::DuplicateEvent { .. })));
        assert!(store.has_applied_idempotency_key("invoice:in_42").await.unwrap());

        let audit = store.verify_account(&user_id).await.unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.transaction_count, 2);
        assert_eq!(audit.ledger_sum, 205);
    }

    #[tokio::test]
    async fn subscription_round_trip() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        let mut record =
            SubscriptionRecord::active(user_id, "sub_1", "starter", BillingPeriod::default());
        store.put_subscription(&record).await.unwrap();

        record.status = SubscriptionStatus::Canceled;
        store.put_subscription(&record).await.unwrap();

        let stored = store.get_subscription(&user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn delete_account_removes_history() {
        let (store, _dir) = create_test_store();
        let user_id = UserId::generate();
        store.create_account(&user_id, 3).await.unwrap();
        store
            .apply_delta(&LedgerEntry::debit(user_id, 1, TransactionType::ImageGeneration))
            .await
            .unwrap();

        store.delete_account(&user_id).await.unwrap();
        assert!(store.get_account(&user_id).await.unwrap().is_none());
        assert!(store.list_transactions(&user_id, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_serialize() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let user_id = UserId::generate();
        store.create_account(&user_id, 4).await.unwrap();

        let tasks = (0..12).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .apply_delta(&LedgerEntry::debit(user_id, 1, TransactionType::ImageGeneration))
                    .await
            })
        });
        let results = futures::future::join_all(tasks).await;
        let successes = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(successes, 4);

        let account = store.get_account(&user_id).await.unwrap().unwrap();
        assert_eq!(account.available_credits, 0);
        assert_eq!(account.credits_used, 4);
    }
}
