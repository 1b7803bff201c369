//! PostoraAI credit ledger service.
//!
//! This crate provides the credit operations and their HTTP API:
//!
//! - [`CreditService`]: balances, grants, deductions and history
//! - [`EntitlementReconciler`]: Stripe billing events to credit grants
//! - [`GenerationGate`]: charging only for delivered generations
//! - Axum router, auth extractors and the Stripe webhook endpoint
//!
//! # Authentication
//!
//! 1. **User JWTs** (HS256) - dashboard and app requests
//! 2. **Service API key** - the generation pipeline
//! 3. **Admin key** - operator endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Axum handlers must be async

pub mod auth;
pub mod config;
pub mod credits;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod reconciler;
pub mod routes;
pub mod state;
pub mod stripe;

pub use config::{ServiceConfig, StoreBackend};
pub use credits::{CreditService, RetryPolicy};
pub use error::ApiError;
pub use gate::{
    GateMode, GenerationError, GenerationGate, GenerationKind, GenerationReceipt,
    GenerationTicket,
};
pub use reconciler::{EntitlementReconciler, ReconcileOutcome};
pub use routes::create_router;
pub use state::AppState;
pub use stripe::StripeError;
