//! Subscription mirror kept for status display.
//!
//! The billing provider owns the real subscription lifecycle. This record
//! only mirrors what its events told us.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Local view of a user's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// The subscribed user.
    pub user_id: UserId,

    /// Provider subscription id (e.g. `sub_...`).
    pub subscription_id: String,

    /// Plan the subscription is on.
    pub plan_id: String,

    /// Current status.
    pub status: SubscriptionStatus,

    /// Start of the current billing period, when known.
    pub current_period_start: Option<DateTime<Utc>>,

    /// End of the current billing period, when known.
    pub current_period_end: Option<DateTime<Utc>>,

    /// Whether the subscription ends at the close of the current period.
    pub cancel_at_period_end: bool,

    /// When the record was first written.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// A freshly activated subscription.
    #[must_use]
    pub fn active(
        user_id: UserId,
        subscription_id: impl Into<String>,
        plan_id: impl Into<String>,
        period: BillingPeriod,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            subscription_id: subscription_id.into(),
            plan_id: plan_id.into(),
            status: SubscriptionStatus::Active,
            current_period_start: period.start,
            current_period_end: period.end,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the period bounds that are present in `period`.
    pub fn set_period(&mut self, period: BillingPeriod) {
        if period.start.is_some() {
            self.current_period_start = period.start;
        }
        if period.end.is_some() {
            self.current_period_end = period.end;
        }
    }

    /// Set the cancel flag and move between `Active` and `CancelPending` to match.
    ///
    /// A canceled subscription stays canceled.
    pub fn set_cancel_at_period_end(&mut self, cancel: bool) {
        self.cancel_at_period_end = cancel;
        self.status = match (self.status, cancel) {
            (SubscriptionStatus::Canceled, _) => SubscriptionStatus::Canceled,
            (_, true) => SubscriptionStatus::CancelPending,
            (_, false) => SubscriptionStatus::Active,
        };
    }

    /// Whether the user currently has paid access.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::CancelPending
        )
    }
}

/// Subscription lifecycle: `Active -> (CancelPending) -> Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and renewing.
    Active,

    /// Still paid, ends at period end.
    CancelPending,

    /// Ended.
    Canceled,
}

impl SubscriptionStatus {
    /// Stable snake_case tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CancelPending => "cancel_pending",
            Self::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancel_pending" => Ok(Self::CancelPending),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Billing period bounds carried by an event. Either side may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    /// Period start.
    pub start: Option<DateTime<Utc>>,
    /// Period end.
    pub end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> SubscriptionRecord {
        SubscriptionRecord::active(UserId::generate(), "sub_1", "pro", BillingPeriod::default())
    }

    #[test]
    fn cancel_flag_toggles_pending() {
        let mut sub = record();
        sub.set_cancel_at_period_end(true);
        assert_eq!(sub.status, SubscriptionStatus::CancelPending);
        assert!(sub.is_entitled());

        sub.set_cancel_at_period_end(false);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn canceled_is_terminal() {
        let mut sub = record();
        sub.status = SubscriptionStatus::Canceled;
        sub.set_cancel_at_period_end(false);
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(!sub.is_entitled());
    }

    #[test]
    fn partial_period_keeps_known_bound() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let mut sub = record();
        sub.set_period(BillingPeriod { start: Some(start), end: Some(end) });
        sub.set_period(BillingPeriod { start: None, end: None });
        assert_eq!(sub.current_period_start, Some(start));
        assert_eq!(sub.current_period_end, Some(end));
    }
}
