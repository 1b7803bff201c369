//! Plan to credits mapping.
//!
//! The catalog is the single place that knows how many credits a plan is
//! worth per billing cycle (subscriptions) or per purchase (credit packs).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};

/// Credits granted for the pay-as-you-go pack.
pub const PAY_AS_YOU_GO_CREDITS: i64 = 15;

/// Credits granted per cycle on the starter plan.
pub const STARTER_PLAN_CREDITS: i64 = 50;

/// Credits granted per cycle on the pro plan.
pub const PRO_PLAN_CREDITS: i64 = 200;

/// Credits granted per cycle on the premium plan.
pub const PREMIUM_PLAN_CREDITS: i64 = 500;

/// Static `plan_id -> credits` lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    credits: BTreeMap<String, i64>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::from_pairs([
            ("pay-as-you-go", PAY_AS_YOU_GO_CREDITS),
            ("starter", STARTER_PLAN_CREDITS),
            ("pro", PRO_PLAN_CREDITS),
            ("premium", PREMIUM_PLAN_CREDITS),
        ])
    }
}

impl PlanCatalog {
    /// Build a catalog from `(plan_id, credits)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        Self {
            credits: pairs
                .into_iter()
                .map(|(plan, credits)| (normalize(plan.as_ref()), credits))
                .collect(),
        }
    }

    /// Parse `id=credits` pairs separated by commas, e.g. `starter=50,pro=200`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for malformed pairs or non-positive credit counts.
    pub fn parse(pairs: &str) -> Result<Self> {
        let mut credits = BTreeMap::new();

        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (plan, amount) = pair.split_once('=').ok_or_else(|| {
                CreditError::Configuration(format!("expected plan=credits, got {pair:?}"))
            })?;

            let amount: i64 = amount.trim().parse().map_err(|_| {
                CreditError::Configuration(format!("invalid credit count in {pair:?}"))
            })?;
            if amount <= 0 {
                return Err(CreditError::Configuration(format!(
                    "plan {plan:?} must grant a positive number of credits"
                )));
            }

            credits.insert(normalize(plan), amount);
        }

        if credits.is_empty() {
            return Err(CreditError::Configuration("plan catalog is empty".into()));
        }

        Ok(Self { credits })
    }

    /// Credits for `plan_id`, or `None` if the plan is unknown.
    #[must_use]
    pub fn credits_for_plan(&self, plan_id: &str) -> Option<i64> {
        self.credits.get(&normalize(plan_id)).copied()
    }

    /// Iterate over `(plan_id, credits)` in plan id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.credits.iter().map(|(plan, credits)| (plan.as_str(), *credits))
    }
}

fn normalize(plan_id: &str) -> String {
    plan_id.trim().to_ascii_lowercase()
}
