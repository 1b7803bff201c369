//! Key encoding for the `RocksDB` column families.

use postora_core::{TransactionId, UserId};

/// Length of an encoded user id.
const USER_LEN: usize = 16;

/// Length of a user-transaction index key.
const USER_TX_LEN: usize = 32;

/// Account key: the 16 user id bytes.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Subscription key: the 16 user id bytes.
#[must_use]
pub fn subscription_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Transaction key: the 16 ULID bytes.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// User-transaction index key.
///
/// Format: `user_id (16 bytes) || transaction_id (16 bytes)`. Transaction ids
/// are monotonic, so a user's index entries sort oldest to newest.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(USER_TX_LEN);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Prefix shared by all index entries of one user.
#[must_use]
pub fn user_transactions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Greatest possible index key of one user, used to start a reverse scan.
#[must_use]
pub fn user_transactions_upper_bound(user_id: &UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(USER_TX_LEN);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&[0xFF; USER_TX_LEN - USER_LEN]);
    key
}

/// Extract the transaction id from a user-transaction index key.
///
/// Returns `None` if the key is not exactly 32 bytes long.
#[must_use]
pub fn extract_transaction_id_from_user_key(key: &[u8]) -> Option<TransactionId> {
    if key.len() != USER_TX_LEN {
        return None;
    }
    let bytes: [u8; 16] = key.get(USER_LEN..)?.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Idempotency index key: the raw key bytes.
#[must_use]
pub fn idempotency_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}
