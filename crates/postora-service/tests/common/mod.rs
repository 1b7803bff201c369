//! Shared harness for the HTTP integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use postora_core::UserId;
use postora_service::stripe::sign_payload;
use postora_service::{create_router, AppState, GateMode, ServiceConfig};
use postora_store::MemoryStore;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn authorization() -> HeaderName {
    axum::http::header::AUTHORIZATION
}

pub fn api_key() -> HeaderName {
    HeaderName::from_static("x-api-key")
}

pub fn admin_key() -> HeaderName {
    HeaderName::from_static("x-admin-key")
}

pub fn stripe_signature() -> HeaderName {
    HeaderName::from_static("stripe-signature")
}

pub fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("valid header value")
}

/// A router over a fresh in-memory ledger plus credentials for every caller.
pub struct TestHarness {
    pub server: TestServer,
    pub test_user_id: UserId,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_gate_mode(GateMode::ChargeDelivered)
    }

    pub fn with_gate_mode(gate_mode: GateMode) -> Self {
        let config = ServiceConfig {
            auth_jwt_secret: Some(JWT_SECRET.into()),
            service_api_key: Some(SERVICE_API_KEY.into()),
            admin_api_key: Some(ADMIN_API_KEY.into()),
            stripe_webhook_secret: Some(WEBHOOK_SECRET.into()),
            gate_mode,
            ..ServiceConfig::default()
        };
        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        Self {
            server,
            test_user_id: UserId::generate(),
        }
    }

    /// `Bearer <jwt>` for the harness user.
    pub fn user_auth_header(&self) -> HeaderValue {
        Self::auth_header_for(&self.test_user_id)
    }

    /// `Bearer <jwt>` for any user, signed like the identity provider would.
    pub fn auth_header_for(user_id: &UserId) -> HeaderValue {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": user_id.to_string(),
            "aud": "authenticated",
            "role": "authenticated",
            "email": "user@example.com",
            "iat": now,
            "exp": now + 3600,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("sign test token");
        header_value(&format!("Bearer {token}"))
    }

    /// Create the harness user's account with the default free credits.
    pub async fn init_account(&self) {
        self.server
            .post("/v1/credits/init")
            .add_header(authorization(), self.user_auth_header())
            .await
            .assert_status_ok();
    }

    /// Give the harness user `amount` credits through the admin endpoint.
    pub async fn fund(&self, amount: i64) {
        self.server
            .post("/v1/credits/add")
            .add_header(admin_key(), header_value(ADMIN_API_KEY))
            .json(&json!({
                "user_id": self.test_user_id.to_string(),
                "amount": amount,
                "reason": "Test funding"
            }))
            .await
            .assert_status_ok();
    }

    /// The harness user's available credits.
    pub async fn balance(&self) -> i64 {
        let response = self
            .server
            .get("/v1/credits/balance")
            .add_header(authorization(), self.user_auth_header())
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        body["available_credits"].as_i64().expect("numeric balance")
    }

    /// Deliver a signed Stripe event.
    pub async fn deliver(&self, event: &serde_json::Value) -> axum_test::TestResponse {
        let payload = event.to_string();
        let signature = sign_payload(WEBHOOK_SECRET, &payload, Utc::now().timestamp())
            .expect("sign webhook");
        self.server
            .post("/webhooks/stripe")
            .add_header(stripe_signature(), header_value(&signature))
            .text(payload)
            .await
    }
}

/// A Stripe event envelope.
pub fn stripe_event(id: &str, event_type: &str, object: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "type": event_type,
        "data": { "object": object }
    })
}
