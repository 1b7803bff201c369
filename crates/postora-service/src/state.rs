//! Application state.

use std::sync::Arc;

use postora_store::LedgerStore;

use crate::config::ServiceConfig;
use crate::credits::CreditService;
use crate::gate::GenerationGate;
use crate::reconciler::EntitlementReconciler;

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: ServiceConfig,

    /// Ledger operations.
    pub credits: Arc<CreditService>,

    /// Billing event handling.
    pub reconciler: EntitlementReconciler,

    /// Generation charging.
    pub gate: GenerationGate,
}

impl AppState {
    /// Wire the services on top of a store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, config: ServiceConfig) -> Self {
        let credits = Arc::new(CreditService::new(store));
        let reconciler = EntitlementReconciler::new(Arc::clone(&credits), config.plans.clone());
        let gate = GenerationGate::new(Arc::clone(&credits), config.gate_mode);

        if config.stripe_webhook_secret.is_none() {
            tracing::warn!("Stripe webhook secret not configured - signatures will not be verified");
        }
        if config.auth_jwt_secret.is_none() {
            tracing::warn!("AUTH_JWT_SECRET not configured - user endpoints will reject all requests");
        }

        Self {
            config,
            credits,
            reconciler,
            gate,
        }
    }
}
