//! Error types for ledger storage.

use postora_core::CreditError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No account for the user.
    #[error("account not found: {user_id}")]
    AccountNotFound {
        /// The user without an account.
        user_id: String,
    },

    /// The user already has an account.
    #[error("account already exists: {user_id}")]
    AlreadyExists {
        /// The user with an existing account.
        user_id: String,
    },

    /// Insufficient credits for deduction.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Balance inside the atomic unit.
        available: i64,
        /// Credits the deduction needed.
        required: i64,
    },

    /// Duplicate event (idempotency check failed).
    #[error("duplicate event: {key}")]
    DuplicateEvent {
        /// The key that was already recorded.
        key: String,
    },

    /// Amount rejected before touching storage.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Transient contention (lock timeout, serialization failure). Safe to retry.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// A stored row violates the balance invariant.
    #[error("corrupt ledger state: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

impl From<CreditError> for StoreError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::InsufficientCredits {
                available,
                required,
            } => Self::InsufficientCredits {
                available,
                required,
            },
            CreditError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            CreditError::AccountNotFound { user_id } => Self::AccountNotFound { user_id },
            CreditError::AccountAlreadyExists { user_id } => Self::AlreadyExists { user_id },
            CreditError::DuplicateEvent { key } => Self::DuplicateEvent { key },
            CreditError::WriteConflict(msg) => Self::WriteConflict(msg),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for CreditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound { user_id } => Self::AccountNotFound { user_id },
            StoreError::AlreadyExists { user_id } => Self::AccountAlreadyExists { user_id },
            StoreError::InsufficientCredits {
                available,
                required,
            } => Self::InsufficientCredits {
                available,
                required,
            },
            StoreError::DuplicateEvent { key } => Self::DuplicateEvent { key },
            StoreError::InvalidAmount(msg) => Self::InvalidAmount(msg),
            StoreError::WriteConflict(msg) => Self::WriteConflict(msg),
            StoreError::Database(msg)
            | StoreError::Serialization(msg)
            | StoreError::Corrupt(msg) => Self::Storage(msg),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // serialization_failure, deadlock_detected, lock_not_available
            if matches!(db.code().as_deref(), Some("40001" | "40P01" | "55P03")) {
                return Self::WriteConflict(db.message().to_string());
            }
        }
        Self::Database(err.to_string())
    }
}
