//! Credit balance, history and operator handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use postora_core::{
    CreditAccount, CreditError, CreditTransaction, Metadata, SubscriptionRecord, TransactionType,
    UserId,
};
use postora_store::AppliedDelta;

use crate::auth::{AdminAuth, AuthUser};
use crate::credits::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use crate::error::ApiError;
use crate::state::AppState;

/// Account counters.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable credits.
    pub available_credits: i64,
    /// Lifetime credits received.
    pub total_credits_received: i64,
    /// Lifetime credits used.
    pub credits_used: i64,
    /// Last change.
    pub updated_at: String,
}

impl From<&CreditAccount> for BalanceResponse {
    fn from(account: &CreditAccount) -> Self {
        Self {
            user_id: account.user_id.to_string(),
            available_credits: account.available_credits,
            total_credits_received: account.total_credits_received,
            credits_used: account.credits_used,
            updated_at: account.updated_at.to_rfc3339(),
        }
    }
}

/// Get the caller's balance. Users without an account see zeros.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.credits.get_balance(&auth.user_id).await?;
    Ok(Json(BalanceResponse::from(&account)))
}

/// Create the caller's account with the configured free credits.
///
/// Safe to call on every sign-in; an existing account is returned unchanged.
pub async fn init_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .credits
        .ensure_account(&auth.user_id, state.config.default_free_credits)
        .await?;
    Ok(Json(BalanceResponse::from(&account)))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 20, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

const fn default_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<CreditTransaction>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List the caller's transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let transactions = state
        .credits
        .get_history(&auth.user_id, query.limit, query.offset)
        .await?;

    // Peek one row past a full page.
    let page_size = query.limit.clamp(1, MAX_HISTORY_LIMIT);
    let has_more = transactions.len() == page_size
        && !state
            .credits
            .get_history(&auth.user_id, 1, query.offset + transactions.len())
            .await?
            .is_empty();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Affordability check request.
#[derive(Debug, Deserialize)]
pub struct CheckCreditsRequest {
    /// Credits the caller wants to spend.
    pub required: i64,
}

/// Affordability check response.
#[derive(Debug, Serialize)]
pub struct CheckCreditsResponse {
    /// Whether the balance covers `required`.
    pub sufficient: bool,
    /// Current balance.
    pub available: i64,
    /// Requested amount.
    pub required: i64,
    /// Credits missing, 0 when sufficient.
    pub shortfall: i64,
}

/// Check whether the caller can afford `required` credits.
pub async fn check_credits(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CheckCreditsRequest>,
) -> Result<Json<CheckCreditsResponse>, ApiError> {
    let sufficient = state
        .credits
        .has_sufficient_credits(&auth.user_id, body.required)
        .await?;
    let account = state.credits.get_balance(&auth.user_id).await?;

    Ok(Json(CheckCreditsResponse {
        sufficient,
        available: account.available_credits,
        required: body.required,
        shortfall: account.shortfall(body.required),
    }))
}

/// Subscription response.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// The subscription mirror, if the user ever subscribed.
    pub subscription: Option<SubscriptionRecord>,
    /// Whether the subscription currently grants credits.
    pub entitled: bool,
}

/// Get the caller's subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let subscription = state.credits.subscription(&auth.user_id).await?;
    let entitled = subscription
        .as_ref()
        .is_some_and(SubscriptionRecord::is_entitled);
    Ok(Json(SubscriptionResponse {
        subscription,
        entitled,
    }))
}

/// Result of a balance change.
#[derive(Debug, Serialize)]
pub struct LedgerChangeResponse {
    /// Account after the change.
    pub account: BalanceResponse,
    /// The recorded transaction.
    pub transaction: CreditTransaction,
}

impl From<AppliedDelta> for LedgerChangeResponse {
    fn from(applied: AppliedDelta) -> Self {
        Self {
            account: BalanceResponse::from(&applied.account),
            transaction: applied.transaction,
        }
    }
}

/// Admin add credits request.
#[derive(Debug, Deserialize)]
pub struct AddCreditsRequest {
    /// User ID to credit.
    pub user_id: String,
    /// Credits to add.
    pub amount: i64,
    /// Note stored in the transaction metadata.
    #[serde(default)]
    pub reason: Option<String>,
    /// Makes the grant safe to retry. Stored as `admin:<key>`, apart from
    /// billing and generation keys.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Add credits manually (admin only).
pub async fn admin_add_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<AddCreditsRequest>,
) -> Result<Json<LedgerChangeResponse>, ApiError> {
    let user_id = parse_user_id(&body.user_id)?;

    let mut metadata = Metadata::new();
    metadata.insert("adminId".into(), admin.admin_id.clone().into());
    if let Some(reason) = &body.reason {
        metadata.insert("reason".into(), reason.clone().into());
    }

    let applied = match body.idempotency_key {
        Some(key) => {
            state
                .credits
                .grant_idempotent(
                    &user_id,
                    body.amount,
                    TransactionType::ManualAddition,
                    metadata,
                    format!("admin:{key}"),
                )
                .await?
        }
        None => {
            state
                .credits
                .grant(&user_id, body.amount, TransactionType::ManualAddition, metadata)
                .await?
        }
    };

    tracing::info!(
        admin_id = %admin.admin_id,
        user_id = %user_id,
        amount = body.amount,
        transaction_id = %applied.transaction.id,
        "Credits added by admin"
    );

    Ok(Json(applied.into()))
}

/// Admin refund request.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// User ID to refund.
    pub user_id: String,
    /// Credits to hand back.
    pub amount: i64,
    /// Transaction being compensated.
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    /// Free-form note.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Refund credits for failed work (admin only).
pub async fn admin_refund(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<RefundRequest>,
) -> Result<Json<LedgerChangeResponse>, ApiError> {
    let user_id = parse_user_id(&body.user_id)?;

    let applied = state
        .credits
        .refund(
            &user_id,
            body.amount,
            body.original_transaction_id.as_deref(),
            body.reason.as_deref(),
        )
        .await?;

    tracing::info!(
        admin_id = %admin.admin_id,
        user_id = %user_id,
        amount = body.amount,
        transaction_id = %applied.transaction.id,
        "Credits refunded by admin"
    );

    Ok(Json(applied.into()))
}

/// Ledger self-check response.
#[derive(Debug, Serialize)]
pub struct AuditResponse {
    /// Audited user.
    pub user_id: String,
    /// Stored counters, if an account exists.
    pub account: Option<BalanceResponse>,
    /// Transactions in the log.
    pub transaction_count: usize,
    /// Sum of their amounts.
    pub ledger_sum: i64,
    /// Whether counters and log agree.
    pub consistent: bool,
}

/// Compare a user's counters with their transaction log (admin only).
pub async fn admin_audit(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(user_id): Path<String>,
) -> Result<Json<AuditResponse>, ApiError> {
    let user_id = parse_user_id(&user_id)?;
    let audit = state.credits.audit(&user_id).await?;

    Ok(Json(AuditResponse {
        user_id: user_id.to_string(),
        account: audit.account.as_ref().map(BalanceResponse::from),
        transaction_count: audit.transaction_count,
        ledger_sum: audit.ledger_sum,
        consistent: audit.is_consistent(),
    }))
}

pub(crate) fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    raw.parse::<UserId>()
        .map_err(|e| ApiError::from(CreditError::from(e)))
}
