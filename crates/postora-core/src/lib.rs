//! Core types for the PostoraAI credit ledger.
//!
//! - **Identifiers**: `UserId`, `TransactionId`
//! - **Accounts**: `CreditAccount`
//! - **Ledger**: `CreditTransaction`, `LedgerEntry`, `TransactionType`
//! - **Billing**: `BillingEvent`, `SubscriptionRecord`, `PlanCatalog`
//!
//! # Credit unit
//!
//! One credit pays for one generated image or one generated social post.
//! Credits are whole numbers stored as `i64`; there is no fractional credit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod billing;
pub mod credits;
pub mod error;
pub mod ids;
pub mod plans;
pub mod subscription;

pub use account::{CreditAccount, DEFAULT_FREE_CREDITS};
pub use billing::BillingEvent;
pub use credits::{CreditTransaction, LedgerEntry, Metadata, TransactionType};
pub use error::{CreditError, Result};
pub use ids::{IdError, TransactionId, UserId};
pub use plans::PlanCatalog;
pub use subscription::{BillingPeriod, SubscriptionRecord, SubscriptionStatus};
