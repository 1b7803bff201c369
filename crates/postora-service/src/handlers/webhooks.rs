//! Stripe webhook handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::ApiError;
use crate::reconciler::ReconcileOutcome;
use crate::state::AppState;
use crate::stripe::{decode_event, parse_event, verify_signature, DecodedEvent, StripeError};

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// What processing did: `granted`, `duplicate`, `record_updated`,
    /// `skipped` or `ignored`.
    pub outcome: &'static str,
    /// Credits added, for `granted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<i64>,
    /// Why nothing happened, for `skipped` and `ignored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WebhookResponse {
    fn new(outcome: &'static str) -> Self {
        Self {
            received: true,
            outcome,
            credits: None,
            detail: None,
        }
    }
}

impl From<ReconcileOutcome> for WebhookResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Granted { credits, .. } => Self {
                credits: Some(credits),
                ..Self::new("granted")
            },
            ReconcileOutcome::Duplicate { .. } => Self::new("duplicate"),
            ReconcileOutcome::RecordUpdated => Self::new("record_updated"),
            ReconcileOutcome::Skipped { reason } => Self {
                detail: Some(reason),
                ..Self::new("skipped")
            },
        }
    }
}

/// Handle Stripe webhooks.
///
/// Only infrastructure failures produce a 5xx, so Stripe retries exactly the
/// deliveries that did not take effect. Events already processed are
/// acknowledged without touching the ledger.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.stripe_webhook_secret {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(StripeError::MissingSignature)?;
        verify_signature(secret, &body, signature, Utc::now())?;
    } else {
        tracing::warn!("Stripe webhook_secret not configured - skipping signature verification");
    }

    let event = parse_event(&body)?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Received Stripe webhook"
    );

    let event_key = format!("stripe_event:{}", event.id);
    if state.credits.has_applied(&event_key).await? {
        tracing::info!(event_id = %event.id, "Stripe event already processed");
        return Ok(Json(WebhookResponse::new("duplicate")));
    }

    let response = match decode_event(&event)? {
        DecodedEvent::Billing(billing_event) => {
            let outcome = state.reconciler.reconcile(&billing_event).await?;
            WebhookResponse::from(outcome)
        }
        DecodedEvent::Ignored(reason) => {
            tracing::debug!(
                event_type = %event.event_type,
                event_id = %event.id,
                reason = %reason,
                "Stripe event ignored"
            );
            WebhookResponse {
                detail: Some(reason),
                ..WebhookResponse::new("ignored")
            }
        }
    };

    state.credits.mark_applied(&event_key).await?;

    Ok(Json(response))
}
