//! Billing events to ledger grants.
//!
//! Subscription lifecycle per user: `none -> active -> (cancel_pending) ->
//! canceled`, with `active` re-entered on every paid invoice. Every grant is
//! keyed by the provider id that identifies it, so a redelivered event never
//! grants twice.

use std::sync::Arc;

use postora_core::{
    BillingEvent, BillingPeriod, CreditAccount, CreditError, Metadata, PlanCatalog, Result,
    SubscriptionRecord, SubscriptionStatus, TransactionType, UserId,
};

use crate::credits::CreditService;

/// What reconciling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Credits were added.
    Granted {
        /// Credits added.
        credits: i64,
        /// Account after the grant.
        account: CreditAccount,
    },
    /// The grant for this key was applied before; nothing was added.
    Duplicate {
        /// The guarding idempotency key.
        key: String,
    },
    /// Only the subscription mirror changed.
    RecordUpdated,
    /// Nothing could be done (unknown plan, unknown subscription).
    Skipped {
        /// Why.
        reason: String,
    },
}

/// Applies billing events to the ledger and the subscription mirror.
#[derive(Debug, Clone)]
pub struct EntitlementReconciler {
    credits: Arc<CreditService>,
    plans: PlanCatalog,
}

impl EntitlementReconciler {
    /// Create a reconciler.
    #[must_use]
    pub const fn new(credits: Arc<CreditService>, plans: PlanCatalog) -> Self {
        Self { credits, plans }
    }

    /// The plan catalog in use.
    #[must_use]
    pub const fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures; duplicates and unknown plans are
    /// reported through [`ReconcileOutcome`].
    pub async fn reconcile(&self, event: &BillingEvent) -> Result<ReconcileOutcome> {
        tracing::debug!(
            kind = event.kind(),
            user_id = %event.user_id(),
            idempotency_key = ?event.idempotency_key(),
            "Reconciling billing event"
        );

        let outcome = match event {
            BillingEvent::SubscriptionStarted {
                user_id,
                plan_id,
                subscription_id,
                period,
                ..
            } => {
                self.activate(user_id, subscription_id, plan_id, *period, true)
                    .await?;
                self.grant_plan(event, plan_id, TransactionType::SubscriptionRenewal, |m| {
                    m.insert("subscriptionId".into(), subscription_id.as_str().into());
                })
                .await?
            }

            BillingEvent::InvoicePaid {
                user_id,
                plan_id,
                subscription_id,
                invoice_id,
                period,
            } => {
                self.activate(user_id, subscription_id, plan_id, *period, false)
                    .await?;
                self.grant_plan(event, plan_id, TransactionType::SubscriptionRenewal, |m| {
                    m.insert("subscriptionId".into(), subscription_id.as_str().into());
                    m.insert("invoiceId".into(), invoice_id.as_str().into());
                })
                .await?
            }

            BillingEvent::SubscriptionUpdated {
                user_id,
                subscription_id,
                plan_id,
                cancel_at_period_end,
                period,
            } => {
                self.update(
                    user_id,
                    subscription_id,
                    plan_id.as_deref(),
                    *cancel_at_period_end,
                    *period,
                )
                .await?
            }

            BillingEvent::SubscriptionCanceled {
                user_id,
                subscription_id,
            } => self.cancel(user_id, subscription_id).await?,

            BillingEvent::OneTimePurchase {
                plan_id,
                payment_intent_id,
                ..
            } => {
                self.grant_plan(event, plan_id, TransactionType::Purchase, |m| {
                    m.insert("paymentIntentId".into(), payment_intent_id.as_str().into());
                })
                .await?
            }
        };

        tracing::info!(
            kind = event.kind(),
            user_id = %event.user_id(),
            outcome = outcome_name(&outcome),
            "Billing event reconciled"
        );
        Ok(outcome)
    }

    /// Grant the plan's credits once per event key.
    async fn grant_plan(
        &self,
        event: &BillingEvent,
        plan_id: &str,
        reason: TransactionType,
        extra: impl FnOnce(&mut Metadata),
    ) -> Result<ReconcileOutcome> {
        let user_id = event.user_id();

        let Some(credits) = self.plans.credits_for_plan(plan_id) else {
            tracing::warn!(
                user_id = %user_id,
                plan_id,
                kind = event.kind(),
                "Unknown plan, no credits granted"
            );
            return Ok(ReconcileOutcome::Skipped {
                reason: format!("unknown plan: {plan_id}"),
            });
        };

        let Some(key) = event.idempotency_key() else {
            return Ok(ReconcileOutcome::Skipped {
                reason: format!("{} carries no idempotency key", event.kind()),
            });
        };

        if self.credits.has_applied(&key).await? {
            tracing::info!(user_id = %user_id, idempotency_key = %key, "Grant already applied");
            return Ok(ReconcileOutcome::Duplicate { key });
        }

        let mut metadata = Metadata::new();
        metadata.insert("planId".into(), plan_id.into());
        extra(&mut metadata);

        match self
            .credits
            .grant_idempotent(&user_id, credits, reason, metadata, key.clone())
            .await
        {
            Ok(applied) => Ok(ReconcileOutcome::Granted {
                credits,
                account: applied.account,
            }),
            // Lost a race with a concurrent delivery of the same event.
            Err(CreditError::DuplicateEvent { key }) => Ok(ReconcileOutcome::Duplicate { key }),
            Err(e) => Err(e),
        }
    }

    /// Create or refresh the record as active for a paid subscription.
    async fn activate(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        plan_id: &str,
        period: BillingPeriod,
        started: bool,
    ) -> Result<()> {
        let record = match self.credits.subscription(user_id).await? {
            Some(mut record) if record.subscription_id == subscription_id => {
                record.plan_id = plan_id.to_string();
                record.set_period(period);
                if started && record.status == SubscriptionStatus::Canceled {
                    record.status = SubscriptionStatus::Active;
                    record.cancel_at_period_end = false;
                }
                record.updated_at = chrono::Utc::now();
                record
            }
            _ => SubscriptionRecord::active(*user_id, subscription_id, plan_id, period),
        };
        self.credits.save_subscription(&record).await
    }

    async fn update(
        &self,
        user_id: &UserId,
        subscription_id: &str,
        plan_id: Option<&str>,
        cancel_at_period_end: bool,
        period: BillingPeriod,
    ) -> Result<ReconcileOutcome> {
        let mut record = match self.credits.subscription(user_id).await? {
            Some(record) if record.subscription_id == subscription_id => record,
            _ => match plan_id {
                Some(plan_id) => {
                    SubscriptionRecord::active(*user_id, subscription_id, plan_id, period)
                }
                None => {
                    return Ok(ReconcileOutcome::Skipped {
                        reason: format!("no record for subscription {subscription_id}"),
                    })
                }
            },
        };

        if let Some(plan_id) = plan_id {
            record.plan_id = plan_id.to_string();
        }
        record.set_period(period);
        record.set_cancel_at_period_end(cancel_at_period_end);
        record.updated_at = chrono::Utc::now();
        self.credits.save_subscription(&record).await?;
        Ok(ReconcileOutcome::RecordUpdated)
    }

    async fn cancel(&self, user_id: &UserId, subscription_id: &str) -> Result<ReconcileOutcome> {
        let Some(mut record) = self
            .credits
            .subscription(user_id)
            .await?
            .filter(|r| r.subscription_id == subscription_id)
        else {
            return Ok(ReconcileOutcome::Skipped {
                reason: format!("no record for subscription {subscription_id}"),
            });
        };

        record.status = SubscriptionStatus::Canceled;
        record.updated_at = chrono::Utc::now();
        self.credits.save_subscription(&record).await?;
        Ok(ReconcileOutcome::RecordUpdated)
    }
}

const fn outcome_name(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Granted { .. } => "granted",
        ReconcileOutcome::Duplicate { .. } => "duplicate",
        ReconcileOutcome::RecordUpdated => "record_updated",
        ReconcileOutcome::Skipped { .. } => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use postora_store::MemoryStore;

    use super::*;

    fn reconciler() -> (EntitlementReconciler, Arc<CreditService>) {
        let credits = Arc::new(CreditService::new(Arc::new(MemoryStore::new())));
        (
            EntitlementReconciler::new(Arc::clone(&credits), PlanCatalog::default()),
            credits,
        )
    }

    fn period(start_day: u32, end_day: u32) -> BillingPeriod {
        BillingPeriod {
            start: Utc.with_ymd_and_hms(2026, 1, start_day, 0, 0, 0).single(),
            end: Utc.with_ymd_and_hms(2026, 2, end_day, 0, 0, 0).single(),
        }
    }

    fn invoice_paid(user_id: UserId, invoice_id: &str) -> BillingEvent {
        BillingEvent::InvoicePaid {
            user_id,
            plan_id: "pro".into(),
            subscription_id: "sub_1".into(),
            invoice_id: invoice_id.into(),
            period: period(1, 1),
        }
    }

    #[tokio::test]
    async fn scenario_invoice_paid_grants_plan_once() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();
        credits.ensure_account(&user, 5).await.unwrap();

        let outcome = reconciler
            .reconcile(&invoice_paid(user, "in_1"))
            .await
            .unwrap();
        let ReconcileOutcome::Granted {
            credits: granted,
            account,
        } = &outcome
        else {
            panic!("expected a grant, got {outcome:?}");
        };
        assert_eq!(*granted, 200);
        assert_eq!(
            (
                account.available_credits,
                account.total_credits_received,
                account.credits_used
            ),
            (205, 205, 0)
        );

        let replay = reconciler
            .reconcile(&invoice_paid(user, "in_1"))
            .await
            .unwrap();
        assert_eq!(
            replay,
            ReconcileOutcome::Duplicate {
                key: "invoice:in_1".into()
            }
        );
        assert_eq!(credits.get_balance(&user).await.unwrap().available_credits, 205);

        let renewal = &credits.get_history(&user, 1, 0).await.unwrap()[0];
        assert_eq!(renewal.transaction_type, TransactionType::SubscriptionRenewal);
        assert_eq!(renewal.amount, 200);
        assert_eq!(renewal.metadata["planId"], "pro");
        assert_eq!(renewal.metadata["subscriptionId"], "sub_1");
    }

    #[tokio::test]
    async fn each_invoice_tops_up_again() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();

        reconciler.reconcile(&invoice_paid(user, "in_1")).await.unwrap();
        reconciler.reconcile(&invoice_paid(user, "in_2")).await.unwrap();
        assert_eq!(credits.get_balance(&user).await.unwrap().available_credits, 400);
    }

    #[tokio::test]
    async fn checkout_and_first_invoice_grant_once() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();

        let started = BillingEvent::SubscriptionStarted {
            user_id: user,
            plan_id: "starter".into(),
            subscription_id: "sub_1".into(),
            session_id: "cs_1".into(),
            invoice_id: Some("in_1".into()),
            period: BillingPeriod::default(),
        };
        assert!(matches!(
            reconciler.reconcile(&started).await.unwrap(),
            ReconcileOutcome::Granted { credits: 50, .. }
        ));

        let first_invoice = BillingEvent::InvoicePaid {
            user_id: user,
            plan_id: "starter".into(),
            subscription_id: "sub_1".into(),
            invoice_id: "in_1".into(),
            period: period(3, 3),
        };
        assert!(matches!(
            reconciler.reconcile(&first_invoice).await.unwrap(),
            ReconcileOutcome::Duplicate { .. }
        ));
        assert_eq!(credits.get_balance(&user).await.unwrap().available_credits, 50);

        // The record update still happened.
        let record = credits.subscription(&user).await.unwrap().unwrap();
        assert_eq!(record.current_period_start, period(3, 3).start);
        assert_eq!(record.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn unknown_plan_is_skipped() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();

        let event = BillingEvent::OneTimePurchase {
            user_id: user,
            plan_id: "enterprise".into(),
            payment_intent_id: "pi_1".into(),
        };
        assert!(matches!(
            reconciler.reconcile(&event).await.unwrap(),
            ReconcileOutcome::Skipped { .. }
        ));
        assert!(credits.get_history(&user, 10, 0).await.unwrap().is_empty());
        assert!(!credits.has_applied("payment_intent:pi_1").await.unwrap());
    }

    #[tokio::test]
    async fn one_time_purchase_grants_once() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();
        credits.ensure_account(&user, 3).await.unwrap();

        let event = BillingEvent::OneTimePurchase {
            user_id: user,
            plan_id: "pay-as-you-go".into(),
            payment_intent_id: "pi_1".into(),
        };
        reconciler.reconcile(&event).await.unwrap();
        reconciler.reconcile(&event).await.unwrap();

        let account = credits.get_balance(&user).await.unwrap();
        assert_eq!(account.available_credits, 18);
        let purchase = &credits.get_history(&user, 1, 0).await.unwrap()[0];
        assert_eq!(purchase.transaction_type, TransactionType::Purchase);
        assert_eq!(purchase.metadata["paymentIntentId"], "pi_1");
    }

    #[tokio::test]
    async fn lifecycle_update_and_cancel_have_no_credit_effect() {
        let (reconciler, credits) = reconciler();
        let user = UserId::generate();
        reconciler.reconcile(&invoice_paid(user, "in_1")).await.unwrap();

        let update = BillingEvent::SubscriptionUpdated {
            user_id: user,
            subscription_id: "sub_1".into(),
            plan_id: None,
            cancel_at_period_end: true,
            period: BillingPeriod::default(),
        };
        assert_eq!(
            reconciler.reconcile(&update).await.unwrap(),
            ReconcileOutcome::RecordUpdated
        );
        let record = credits.subscription(&user).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::CancelPending);
        assert!(record.cancel_at_period_end);
        assert_eq!(record.current_period_start, period(1, 1).start);

        let cancel = BillingEvent::SubscriptionCanceled {
            user_id: user,
            subscription_id: "sub_1".into(),
        };
        assert_eq!(
            reconciler.reconcile(&cancel).await.unwrap(),
            ReconcileOutcome::RecordUpdated
        );
        let record = credits.subscription(&user).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert!(!record.is_entitled());

        // No clawback.
        assert_eq!(credits.get_balance(&user).await.unwrap().available_credits, 200);
    }

    #[tokio::test]
    async fn cancel_of_unknown_subscription_is_skipped() {
        let (reconciler, _) = reconciler();
        let cancel = BillingEvent::SubscriptionCanceled {
            user_id: UserId::generate(),
            subscription_id: "sub_missing".into(),
        };
        assert!(matches!(
            reconciler.reconcile(&cancel).await.unwrap(),
            ReconcileOutcome::Skipped { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redeliveries_grant_once() {
        let (reconciler, credits) = reconciler();
        let reconciler = Arc::new(reconciler);
        let user = UserId::generate();

        let tasks = (0..8).map(|_| {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.reconcile(&invoice_paid(user, "in_9")).await })
        });
        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(ReconcileOutcome::Granted { .. }))))
            .count();

        assert_eq!(granted, 1);
        assert_eq!(credits.get_balance(&user).await.unwrap().available_credits, 200);
    }
}
