//! Error types for the credit ledger.

use crate::ids::IdError;

/// Result type for credit operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors that can occur in credit operations.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// The balance does not cover the requested deduction.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Balance at the time of the check.
        available: i64,
        /// Credits the operation needed.
        required: i64,
    },

    /// No account exists for the user.
    #[error("account not found: {user_id}")]
    AccountNotFound {
        /// The user without an account.
        user_id: String,
    },

    /// An account already exists for the user.
    #[error("account already exists: {user_id}")]
    AccountAlreadyExists {
        /// The user that already has an account.
        user_id: String,
    },

    /// The idempotency key was already applied.
    #[error("duplicate event: {key}")]
    DuplicateEvent {
        /// The key that was seen before.
        key: String,
    },

    /// Amount or transaction type rejected.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Concurrent writers kept colliding and retries ran out.
    #[error("ledger write conflict: {0}")]
    WriteConflict(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
