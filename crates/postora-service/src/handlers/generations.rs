//! Generation charging handlers for the generation pipeline.
//!
//! The pipeline calls `begin` before producing anything, keeps the returned
//! ticket while it works, and hands it back to `settle` (or `abandon`) once it
//! knows how many outputs were delivered.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use postora_core::Metadata;

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::gate::{GenerationKind, GenerationReceipt, GenerationTicket};
use crate::handlers::credits::parse_user_id;
use crate::state::AppState;

/// Begin request.
#[derive(Debug, Deserialize)]
pub struct BeginGenerationRequest {
    /// The paying user.
    pub user_id: String,
    /// Attempts to make.
    pub requested_count: i64,
    /// What is generated.
    pub kind: GenerationKind,
    /// Stable across retries of the same request.
    pub request_id: String,
    /// Copied onto the charge.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Check (or reserve) credits for a generation request.
pub async fn begin_generation(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<BeginGenerationRequest>,
) -> Result<Json<GenerationTicket>, ApiError> {
    let user_id = parse_user_id(&body.user_id)?;

    let ticket = state
        .gate
        .begin(
            &user_id,
            body.requested_count,
            body.kind,
            body.request_id,
            body.metadata,
        )
        .await?;

    tracing::debug!(
        service = %service.service_name,
        user_id = %user_id,
        request_id = %ticket.request_id,
        "Generation begun"
    );

    Ok(Json(ticket))
}

/// Settle request.
#[derive(Debug, Deserialize)]
pub struct SettleGenerationRequest {
    /// Ticket returned by `begin`.
    pub ticket: GenerationTicket,
    /// Outputs actually delivered.
    pub successful_count: i64,
    /// Merged into the ticket metadata on the charge.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Charge for delivered generations.
pub async fn settle_generation(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<SettleGenerationRequest>,
) -> Result<Json<GenerationReceipt>, ApiError> {
    let receipt = state
        .gate
        .finalize(&body.ticket, body.successful_count, body.metadata)
        .await?;

    tracing::debug!(
        service = %service.service_name,
        request_id = %receipt.request_id,
        "Settle served"
    );

    Ok(Json(receipt))
}

/// Abandon request.
#[derive(Debug, Deserialize)]
pub struct AbandonGenerationRequest {
    /// Ticket returned by `begin`.
    pub ticket: GenerationTicket,
}

/// Give up on a generation request without charging.
pub async fn abandon_generation(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<AbandonGenerationRequest>,
) -> Result<Json<GenerationReceipt>, ApiError> {
    let receipt = state.gate.abandon(&body.ticket).await?;

    tracing::info!(
        service = %service.service_name,
        user_id = %body.ticket.user_id,
        request_id = %receipt.request_id,
        "Generation abandoned"
    );

    Ok(Json(receipt))
}
