//! Credit transaction types.
//!
//! Every balance change is recorded as an immutable [`CreditTransaction`].
//! Callers describe the change they want with a [`LedgerEntry`]; the store
//! turns it into a transaction inside the same atomic unit that updates the
//! account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TransactionId, UserId};

/// Open key-value payload attached to a transaction for auditing.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A recorded balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Time-ordered identifier.
    pub id: TransactionId,

    /// The account that changed.
    pub user_id: UserId,

    /// Signed amount. Positive for grants, negative for deductions.
    pub amount: i64,

    /// What caused the change.
    pub transaction_type: TransactionType,

    /// Available balance right after this transaction.
    pub balance_after: i64,

    /// Audit payload (plan id, request id, ...).
    #[serde(default)]
    pub metadata: Metadata,

    /// External event or request key that produced this transaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// When the transaction was recorded.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Build the transaction that records `entry` landing at `balance_after`.
    #[must_use]
    pub fn from_entry(entry: &LedgerEntry, balance_after: i64) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id: entry.user_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            balance_after,
            metadata: entry.metadata.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            created_at: Utc::now(),
        }
    }

    /// The seed transaction written when an account is created with credits.
    #[must_use]
    pub fn initial(user_id: UserId, amount: i64) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            transaction_type: TransactionType::InitialCredits,
            balance_after: amount,
            metadata: Metadata::new(),
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }
}

/// A requested balance change, prior to being applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// The account to change.
    pub user_id: UserId,
    /// Signed amount. Must be non-zero.
    pub amount: i64,
    /// What causes the change.
    pub transaction_type: TransactionType,
    /// Audit payload.
    pub metadata: Metadata,
    /// At-most-once key checked and recorded atomically with the change.
    pub idempotency_key: Option<String>,
}

impl LedgerEntry {
    /// A positive change of `amount` credits.
    #[must_use]
    pub fn credit(user_id: UserId, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            transaction_type,
            metadata: Metadata::new(),
            idempotency_key: None,
        }
    }

    /// A negative change of `amount` credits (`amount` given as a positive number).
    #[must_use]
    pub fn debit(user_id: UserId, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount: -amount,
            transaction_type,
            metadata: Metadata::new(),
            idempotency_key: None,
        }
    }

    /// Attach audit metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Seed credits written when the account is created.
    InitialCredits,

    /// Promotional trial credits.
    FreeTrial,

    /// One-time credit pack purchase.
    Purchase,

    /// Recurring credits from a paid subscription invoice.
    SubscriptionRenewal,

    /// Credits spent generating ad images.
    ImageGeneration,

    /// Credits spent generating social post copy.
    SocialPostGeneration,

    /// Credits added by an operator.
    ManualAddition,

    /// Charged credits handed back for failed work.
    Refund,

    /// Unused part of an upfront reservation handed back.
    Release,
}

impl TransactionType {
    /// Whether this type adds credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        !self.is_debit()
    }

    /// Whether this type removes credits.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::ImageGeneration | Self::SocialPostGeneration)
    }

    /// Stable snake_case tag, as stored and serialized.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InitialCredits => "initial_credits",
            Self::FreeTrial => "free_trial",
            Self::Purchase => "purchase",
            Self::SubscriptionRenewal => "subscription_renewal",
            Self::ImageGeneration => "image_generation",
            Self::SocialPostGeneration => "social_post_generation",
            Self::ManualAddition => "manual_addition",
            Self::Refund => "refund",
            Self::Release => "release",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "initial_credits" => Self::InitialCredits,
            "free_trial" => Self::FreeTrial,
            "purchase" => Self::Purchase,
            "subscription_renewal" => Self::SubscriptionRenewal,
            "image_generation" => Self::ImageGeneration,
            "social_post_generation" => Self::SocialPostGeneration,
            "manual_addition" => Self::ManualAddition,
            "refund" => Self::Refund,
            "release" => Self::Release,
            other => return Err(format!("unknown transaction type: {other}")),
        })
    }
}
