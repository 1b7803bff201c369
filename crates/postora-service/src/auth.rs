//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `AuthUser` - End-user authentication via HS256 JWT from the identity provider
//! - `ServiceAuth` - Generation pipeline authentication via API key
//! - `AdminAuth` - Operator authentication for privileged endpoints

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use postora_core::UserId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// An authenticated user extracted from a bearer JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user ID.
    pub user_id: UserId,
    /// Email claim, when present.
    pub email: Option<String>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = validate_jwt(token, state)?;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(Self {
            user_id,
            email: claims.email,
        })
    }
}

/// Service authentication via API key.
///
/// Used by the generation pipeline.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The service name or identifier.
    pub service_name: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let expected_key = state
            .config
            .service_api_key
            .as_deref()
            .ok_or(ApiError::Forbidden)?;

        if !constant_time_eq(api_key, expected_key) {
            return Err(ApiError::Unauthorized);
        }

        let service_name = parts
            .headers
            .get("x-service-name")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self { service_name })
    }
}

/// Admin authentication via the `X-Admin-Key` header.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let admin_key = parts
            .headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let expected_key = state
            .config
            .admin_api_key
            .as_deref()
            .ok_or(ApiError::Forbidden)?;

        if !constant_time_eq(admin_key, expected_key) {
            return Err(ApiError::Unauthorized);
        }

        let admin_id = parts
            .headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("admin")
            .to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(Self { admin_id })
    }
}

/// JWT claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user UUID).
    pub sub: String,
    /// Audience (string or array).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: i64,
    /// User email.
    #[serde(default)]
    pub email: Option<String>,
    /// Role claim (e.g. `authenticated`).
    #[serde(default)]
    pub role: Option<String>,
}

fn validate_jwt(token: &str, state: &AppState) -> Result<JwtClaims, ApiError> {
    let Some(secret) = state.config.auth_jwt_secret.as_deref() else {
        tracing::warn!("AUTH_JWT_SECRET not configured - rejecting user request");
        return Err(ApiError::Unauthorized);
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[&state.config.auth_audience]);

    decode::<JwtClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            ApiError::Unauthorized
        })
}
