//! Column families used by the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit accounts, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Credit transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Applied idempotency keys. Value is the RFC 3339 time of first use.
    pub const IDEMPOTENCY_KEYS: &str = "idempotency_keys";

    /// Subscription mirrors, keyed by `user_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::IDEMPOTENCY_KEYS,
        cf::SUBSCRIPTIONS,
    ]
}
