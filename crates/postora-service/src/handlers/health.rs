//! Health check handler.
//!
//! Answers 503 when the ledger store does not respond, so a load balancer
//! stops routing charges to an instance that cannot record them.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::config::StoreBackend;
use crate::gate::GateMode;
use crate::state::AppState;

/// Key looked up to check the store; never recorded.
const STORE_PROBE_KEY: &str = "health:store";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: &'static str,
    /// Ledger backend in use.
    pub store: StoreBackend,
    /// Whether the ledger store answered.
    pub store_reachable: bool,
    /// How generations are charged.
    pub gate_mode: GateMode,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_reachable = match state.credits.has_applied(STORE_PROBE_KEY).await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %e, "Ledger store unreachable");
            false
        }
    };

    let (code, status) = if store_reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            service: "postora-credits",
            version: env!("CARGO_PKG_VERSION"),
            store: state.config.store_backend,
            store_reachable,
            gate_mode: state.gate.mode(),
        }),
    )
}
