//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use postora_core::CreditError;

use crate::gate::GenerationError;
use crate::stripe::StripeError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists or the event was already applied.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("insufficient credits: available={available}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        available: i64,
        /// Required amount.
        required: i64,
        /// `required - available`.
        shortfall: i64,
    },

    /// Writers kept colliding; the client may retry.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits {
                available,
                required,
                shortfall,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "available": available,
                    "required": required,
                    "shortfall": shortfall
                })),
            ),
            Self::ServiceUnavailable(msg) => {
                tracing::warn!(error = %msg, "Ledger contention, asking client to retry");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service_unavailable",
                    "The ledger is busy, retry the request".to_string(),
                    None,
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<CreditError> for ApiError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::InsufficientCredits {
                available,
                required,
            } => Self::InsufficientCredits {
                available,
                required,
                shortfall: required.saturating_sub(available),
            },
            CreditError::AccountNotFound { user_id } => {
                Self::NotFound(format!("credit account not found for user {user_id}"))
            }
            CreditError::AccountAlreadyExists { user_id } => {
                Self::Conflict(format!("credit account already exists for user {user_id}"))
            }
            CreditError::DuplicateEvent { key } => {
                Self::Conflict(format!("event {key} already processed"))
            }
            CreditError::InvalidAmount(msg) => Self::BadRequest(msg),
            CreditError::InvalidId(e) => Self::BadRequest(e.to_string()),
            CreditError::WriteConflict(msg) => Self::ServiceUnavailable(msg),
            CreditError::Storage(msg) | CreditError::Configuration(msg) => Self::Internal(msg),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::InsufficientCredits {
                required,
                available,
                shortfall,
            } => Self::InsufficientCredits {
                available,
                required,
                shortfall,
            },
            GenerationError::InvalidRequest(msg) => Self::BadRequest(msg),
            GenerationError::Credit(e) => e.into(),
        }
    }
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        tracing::warn!(error = %err, "Rejected Stripe webhook");
        match err {
            StripeError::Payload(msg) => Self::BadRequest(msg),
            StripeError::MissingSignature
            | StripeError::MalformedSignature(_)
            | StripeError::InvalidSignature
            | StripeError::StaleTimestamp { .. } => {
                Self::BadRequest("Invalid webhook signature".into())
            }
        }
    }
}
