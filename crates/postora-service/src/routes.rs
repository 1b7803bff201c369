//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{credits, generations, health, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for generation endpoints.
/// The pipeline calls these for every request it serves.
const GENERATION_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Credits (user JWT auth)
/// - `GET /v1/credits/balance` - Current balance
/// - `GET /v1/credits/transactions` - Transaction history
/// - `POST /v1/credits/init` - Create account with free credits
/// - `POST /v1/credits/check` - Affordability check
/// - `GET /v1/subscription` - Subscription mirror
///
/// ## Admin (`X-Admin-Key`)
/// - `POST /v1/credits/add` - Manual credit addition
/// - `POST /v1/credits/refund` - Refund
/// - `GET /v1/credits/audit/:user_id` - Ledger self-check
///
/// ## Generations (`X-API-Key`, rate-limited)
/// - `POST /v1/generations/begin`
/// - `POST /v1/generations/settle`
/// - `POST /v1/generations/abandon`
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/stripe` - Stripe webhooks
pub fn create_router(state: AppState) -> Router {
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let generation_routes = Router::new()
        .route("/begin", post(generations::begin_generation))
        .route("/settle", post(generations::settle_generation))
        .route("/abandon", post(generations::abandon_generation))
        .layer(ConcurrencyLimitLayer::new(GENERATION_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/init", post(credits::init_account))
        .route("/credits/check", post(credits::check_credits))
        .route("/credits/add", post(credits::admin_add_credits))
        .route("/credits/refund", post(credits::admin_refund))
        .route("/credits/audit/:user_id", get(credits::admin_audit))
        .route("/subscription", get(credits::get_subscription))
        .nest("/generations", generation_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Webhooks are not rate limited; Stripe controls delivery.
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
