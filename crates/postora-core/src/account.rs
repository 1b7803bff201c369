//! Credit account types.
//!
//! Each user owns exactly one [`CreditAccount`]. Its three counters are tied
//! together by a single invariant: `available = total_received - used`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::UserId;

/// Free credits given to a brand new user when nothing else is configured.
pub const DEFAULT_FREE_CREDITS: i64 = 3;

/// A user's credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// The owning user.
    pub user_id: UserId,

    /// Spendable balance.
    pub available_credits: i64,

    /// Lifetime credits granted. Never decreases.
    pub total_credits_received: i64,

    /// Lifetime credits consumed. Never decreases.
    pub credits_used: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When any counter last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create an account holding `initial_credits`, all counted as received.
    #[must_use]
    pub fn new(user_id: UserId, initial_credits: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            available_credits: initial_credits,
            total_credits_received: initial_credits,
            credits_used: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A zeroed view for a user that has no persisted account yet.
    #[must_use]
    pub fn empty(user_id: UserId) -> Self {
        Self::new(user_id, 0)
    }

    /// Whether the balance covers `required` credits.
    #[must_use]
    pub fn has_sufficient_credits(&self, required: i64) -> bool {
        self.available_credits >= required
    }

    /// Credits missing to cover `required` (zero when the balance suffices).
    #[must_use]
    pub fn shortfall(&self, required: i64) -> i64 {
        (required - self.available_credits).max(0)
    }

    /// Check the balance invariant and non-negativity of every counter.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.available_credits >= 0
            && self.total_credits_received >= 0
            && self.credits_used >= 0
            && self.total_credits_received.checked_sub(self.credits_used)
                == Some(self.available_credits)
    }

    /// Apply a signed delta to the counters in memory.
    ///
    /// Positive amounts count as received, negative amounts as used.
    /// The account is left untouched on error.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for a zero delta or on counter overflow.
    /// - `InsufficientCredits` when a debit would take the balance below zero.
    pub fn apply(&mut self, amount: i64) -> Result<()> {
        if amount == 0 {
            return Err(CreditError::InvalidAmount("amount must be non-zero".into()));
        }

        let overflow = || CreditError::InvalidAmount(format!("amount {amount} overflows balance"));

        let available = self.available_credits.checked_add(amount).ok_or_else(overflow)?;
        if available < 0 {
            return Err(CreditError::InsufficientCredits {
                available: self.available_credits,
                required: -amount,
            });
        }

        if amount > 0 {
            self.total_credits_received = self
                .total_credits_received
                .checked_add(amount)
                .ok_or_else(overflow)?;
        } else {
            self.credits_used = self.credits_used.checked_add(-amount).ok_or_else(overflow)?;
        }

        self.available_credits = available;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_counts_seed_as_received() {
        let account = CreditAccount::new(UserId::generate(), 3);
        assert_eq!(account.available_credits, 3);
        assert_eq!(account.total_credits_received, 3);
        assert_eq!(account.credits_used, 0);
        assert!(account.is_consistent());
    }

    #[test]
    fn debit_moves_credits_to_used() {
        let mut account = CreditAccount::new(UserId::generate(), 3);
        account.apply(-2).unwrap();
        assert_eq!(
            (account.available_credits, account.total_credits_received, account.credits_used),
            (1, 3, 2)
        );
        assert!(account.is_consistent());
    }

    #[test]
    fn overdraw_is_rejected_without_mutation() {
        let mut account = CreditAccount::new(UserId::generate(), 1);
        let before = account.clone();

        let err = account.apply(-2).unwrap_err();
        assert!(matches!(
            err,
            CreditError::InsufficientCredits { available: 1, required: 2 }
        ));
        assert_eq!(account, before);
    }

    #[test]
    fn zero_delta_is_invalid() {
        let mut account = CreditAccount::empty(UserId::generate());
        assert!(matches!(account.apply(0), Err(CreditError::InvalidAmount(_))));
    }

    #[test]
    fn overflow_is_invalid() {
        let mut account = CreditAccount::new(UserId::generate(), i64::MAX);
        assert!(matches!(account.apply(1), Err(CreditError::InvalidAmount(_))));
        assert_eq!(account.available_credits, i64::MAX);
    }

    #[test]
    fn shortfall_never_negative() {
        let account = CreditAccount::new(UserId::generate(), 10);
        assert_eq!(account.shortfall(4), 0);
        assert_eq!(account.shortfall(13), 3);
    }

    #[test]
    fn tampered_counters_are_inconsistent() {
        let mut account = CreditAccount::new(UserId::generate(), 5);
        account.available_credits = 6;
        assert!(!account.is_consistent());
    }
}
