//! Provider-neutral billing events.
//!
//! Webhook payloads are decoded into [`BillingEvent`] before they reach the
//! reconciler, so nothing downstream depends on the payment provider's JSON.

use serde::{Deserialize, Serialize};

use crate::subscription::BillingPeriod;
use crate::UserId;

/// A billing fact the ledger must react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingEvent {
    /// First successful checkout for a subscription plan.
    SubscriptionStarted {
        /// The subscriber.
        user_id: UserId,
        /// Subscribed plan.
        plan_id: String,
        /// Provider subscription id.
        subscription_id: String,
        /// Checkout session id.
        session_id: String,
        /// First invoice id, when the provider includes it.
        invoice_id: Option<String>,
        /// Period bounds, when present.
        #[serde(default)]
        period: BillingPeriod,
    },

    /// A subscription invoice was paid (first or recurring cycle).
    InvoicePaid {
        /// The subscriber.
        user_id: UserId,
        /// Plan the invoice is for.
        plan_id: String,
        /// Provider subscription id.
        subscription_id: String,
        /// Provider invoice id.
        invoice_id: String,
        /// Period covered by the invoice.
        #[serde(default)]
        period: BillingPeriod,
    },

    /// Subscription flags or period changed. No credit effect.
    SubscriptionUpdated {
        /// The subscriber.
        user_id: UserId,
        /// Provider subscription id.
        subscription_id: String,
        /// Plan after the update, if the event carries it.
        plan_id: Option<String>,
        /// Whether the subscription ends at period end.
        cancel_at_period_end: bool,
        /// Current period bounds.
        #[serde(default)]
        period: BillingPeriod,
    },

    /// Subscription ended. No credit effect.
    SubscriptionCanceled {
        /// The subscriber.
        user_id: UserId,
        /// Provider subscription id.
        subscription_id: String,
    },

    /// A one-time credit pack was paid for.
    OneTimePurchase {
        /// The buyer.
        user_id: UserId,
        /// Purchased pack.
        plan_id: String,
        /// Provider payment intent id.
        payment_intent_id: String,
    },
}

impl BillingEvent {
    /// The user the event belongs to.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        match self {
            Self::SubscriptionStarted { user_id, .. }
            | Self::InvoicePaid { user_id, .. }
            | Self::SubscriptionUpdated { user_id, .. }
            | Self::SubscriptionCanceled { user_id, .. }
            | Self::OneTimePurchase { user_id, .. } => *user_id,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionStarted { .. } => "subscription_started",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
            Self::OneTimePurchase { .. } => "one_time_purchase",
        }
    }

    /// Key guarding the credit grant of this event, if it grants credits.
    ///
    /// A subscription checkout and the `invoice paid` event for its first
    /// invoice share the `invoice:` key, so the first cycle is granted once.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Self::SubscriptionStarted {
                invoice_id: Some(invoice_id),
                ..
            }
            | Self::InvoicePaid { invoice_id, .. } => Some(format!("invoice:{invoice_id}")),
            Self::SubscriptionStarted { session_id, .. } => Some(format!("checkout:{session_id}")),
            Self::OneTimePurchase {
                payment_intent_id, ..
            } => Some(format!("payment_intent:{payment_intent_id}")),
            Self::SubscriptionUpdated { .. } | Self::SubscriptionCanceled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_first_invoice_share_a_key() {
        let user_id = UserId::generate();
        let started = BillingEvent::SubscriptionStarted {
            user_id,
            plan_id: "pro".into(),
            subscription_id: "sub_1".into(),
            session_id: "cs_1".into(),
            invoice_id: Some("in_1".into()),
            period: BillingPeriod::default(),
        };
        let paid = BillingEvent::InvoicePaid {
            user_id,
            plan_id: "pro".into(),
            subscription_id: "sub_1".into(),
            invoice_id: "in_1".into(),
            period: BillingPeriod::default(),
        };
        assert_eq!(started.idempotency_key(), paid.idempotency_key());
    }

    #[test]
    fn checkout_without_invoice_uses_session() {
        let event = BillingEvent::SubscriptionStarted {
            user_id: UserId::generate(),
            plan_id: "starter".into(),
            subscription_id: "sub_1".into(),
            session_id: "cs_9".into(),
            invoice_id: None,
            period: BillingPeriod::default(),
        };
        assert_eq!(event.idempotency_key().as_deref(), Some("checkout:cs_9"));
    }

    #[test]
    fn status_events_have_no_key() {
        let event = BillingEvent::SubscriptionCanceled {
            user_id: UserId::generate(),
            subscription_id: "sub_1".into(),
        };
        assert_eq!(event.idempotency_key(), None);
        assert_eq!(event.kind(), "subscription_canceled");
    }
}
