//! Credit gate around external generation work.
//!
//! A request for N generations goes through [`GenerationGate::begin`] before
//! any external call is made, and through [`GenerationGate::finalize`] (or
//! [`GenerationGate::abandon`]) once the attempts are done. Only delivered
//! work is charged. The charge carries the key
//! `generation:<user id>:<request id>`, so retrying a settle never charges
//! twice and two users reusing a request id never share a charge.
//!
//! With [`GateMode::Reserve`] the full amount is deducted up front and the
//! unused part is handed back as a `release` transaction when settling.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postora_core::{
    CreditAccount, CreditError, Metadata, TransactionId, TransactionType, UserId,
};

use crate::credits::CreditService;

/// How the gate charges for generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Check the balance up front, charge successful attempts afterwards.
    #[default]
    ChargeDelivered,
    /// Deduct the requested amount up front, release the unused part afterwards.
    Reserve,
}

impl FromStr for GateMode {
    type Err = CreditError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "charge_delivered" | "default" => Ok(Self::ChargeDelivered),
            "reserve" => Ok(Self::Reserve),
            other => Err(CreditError::Configuration(format!(
                "unknown GATE_MODE: {other}"
            ))),
        }
    }
}

/// What is being generated; decides the transaction type of the charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    /// Ad images.
    ImageGeneration,
    /// Social post copy.
    SocialPostGeneration,
}

impl GenerationKind {
    /// Ledger type used for the charge.
    #[must_use]
    pub const fn transaction_type(self) -> TransactionType {
        match self {
            Self::ImageGeneration => TransactionType::ImageGeneration,
            Self::SocialPostGeneration => TransactionType::SocialPostGeneration,
        }
    }
}

/// Errors returned by the gate.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The user cannot afford the request.
    #[error("insufficient credits: required={required}, available={available}, shortfall={shortfall}")]
    InsufficientCredits {
        /// Credits the request needs.
        required: i64,
        /// Credits the user has.
        available: i64,
        /// `required - available`.
        shortfall: i64,
    },

    /// Counts or identifiers are out of range.
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    /// Ledger failure other than a shortfall.
    #[error(transparent)]
    Credit(CreditError),
}

impl From<CreditError> for GenerationError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::InsufficientCredits {
                available,
                required,
            } => Self::InsufficientCredits {
                required,
                available,
                shortfall: required.saturating_sub(available),
            },
            CreditError::InvalidAmount(msg) => Self::InvalidRequest(msg),
            other => Self::Credit(other),
        }
    }
}

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Permission to attempt `requested_count` generations.
///
/// Serializable so it can be handed to the generation pipeline and returned
/// on settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTicket {
    /// The paying user.
    pub user_id: UserId,
    /// Caller-supplied id, stable across retries.
    pub request_id: String,
    /// What is generated.
    pub kind: GenerationKind,
    /// Attempts the user asked for.
    pub requested_count: i64,
    /// Mode the ticket was issued under.
    pub mode: GateMode,
    /// Credits deducted up front (reserve mode only).
    pub reserved: i64,
    /// Caller metadata, copied onto the charge.
    #[serde(default)]
    pub metadata: Metadata,
    /// When the ticket was issued.
    pub issued_at: DateTime<Utc>,
}

/// Outcome of settling a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    /// The settled request.
    pub request_id: String,
    /// Attempts requested.
    pub requested_count: i64,
    /// Attempts delivered.
    pub successful_count: i64,
    /// Credits the request cost in total.
    pub charged: i64,
    /// Reserved credits handed back.
    pub released: i64,
    /// The request had already been settled; nothing changed.
    pub duplicate: bool,
    /// Ledger row written by this settle, if any.
    pub transaction_id: Option<TransactionId>,
    /// Account after settling.
    pub account: CreditAccount,
}

/// Credits side of "spend N credits to attempt N generations".
#[derive(Debug, Clone)]
pub struct GenerationGate {
    credits: Arc<CreditService>,
    mode: GateMode,
}

impl GenerationGate {
    /// Create a gate.
    #[must_use]
    pub const fn new(credits: Arc<CreditService>, mode: GateMode) -> Self {
        Self { credits, mode }
    }

    /// The configured mode.
    #[must_use]
    pub const fn mode(&self) -> GateMode {
        self.mode
    }

    /// Check (or reserve) credits before external work starts.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for `requested_count < 1` or an empty request id.
    /// - `InsufficientCredits` with the shortfall; nothing is charged.
    pub async fn begin(
        &self,
        user_id: &UserId,
        requested_count: i64,
        kind: GenerationKind,
        request_id: impl Into<String>,
        metadata: Metadata,
    ) -> Result<GenerationTicket> {
        let request_id = request_id.into();
        if requested_count < 1 {
            return Err(GenerationError::InvalidRequest(format!(
                "requested_count must be at least 1, got {requested_count}"
            )));
        }
        if request_id.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "request_id must not be empty".into(),
            ));
        }

        let reserved = match self.mode {
            GateMode::ChargeDelivered => {
                let account = self.credits.get_balance(user_id).await?;
                let shortfall = account.shortfall(requested_count);
                if shortfall > 0 {
                    tracing::info!(
                        user_id = %user_id,
                        request_id = %request_id,
                        requested_count,
                        available = account.available_credits,
                        "Generation refused, insufficient credits"
                    );
                    return Err(GenerationError::InsufficientCredits {
                        required: requested_count,
                        available: account.available_credits,
                        shortfall,
                    });
                }
                0
            }
            GateMode::Reserve => {
                let mut reserve_metadata = metadata.clone();
                reserve_metadata.insert("requestId".into(), request_id.clone().into());
                reserve_metadata.insert("requestedCount".into(), requested_count.into());
                reserve_metadata.insert("phase".into(), "reserve".into());

                match self
                    .credits
                    .deduct_idempotent(
                        user_id,
                        requested_count,
                        kind.transaction_type(),
                        reserve_metadata,
                        reserve_key(user_id, &request_id),
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(CreditError::DuplicateEvent { key }) => {
                        tracing::debug!(idempotency_key = %key, "Reservation already held");
                    }
                    Err(e) => return Err(e.into()),
                }
                requested_count
            }
        };

        tracing::debug!(
            user_id = %user_id,
            request_id = %request_id,
            requested_count,
            reserved,
            "Generation ticket issued"
        );

        Ok(GenerationTicket {
            user_id: *user_id,
            request_id,
            kind,
            requested_count,
            mode: self.mode,
            reserved,
            metadata,
            issued_at: Utc::now(),
        })
    }

    /// Charge for `successful_count` delivered generations.
    ///
    /// Failed attempts are never charged. Settling the same request again
    /// returns a receipt with `duplicate = true` and changes nothing.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` unless `0 <= successful_count <= requested_count`.
    /// - `InsufficientCredits` if the balance was drained after `begin`;
    ///   nothing is charged in that case.
    pub async fn finalize(
        &self,
        ticket: &GenerationTicket,
        successful_count: i64,
        metadata: Metadata,
    ) -> Result<GenerationReceipt> {
        if !(0..=ticket.requested_count).contains(&successful_count) {
            return Err(GenerationError::InvalidRequest(format!(
                "successful_count must be between 0 and {}, got {successful_count}",
                ticket.requested_count
            )));
        }

        let mut settle_metadata = ticket.metadata.clone();
        settle_metadata.extend(metadata);
        settle_metadata.insert("requestId".into(), ticket.request_id.clone().into());
        settle_metadata.insert("requestedCount".into(), ticket.requested_count.into());
        settle_metadata.insert("successfulCount".into(), successful_count.into());

        let receipt = match ticket.mode {
            GateMode::ChargeDelivered => {
                self.settle_delivered(ticket, successful_count, settle_metadata)
                    .await?
            }
            GateMode::Reserve => {
                self.settle_reserved(ticket, successful_count, settle_metadata)
                    .await?
            }
        };

        tracing::info!(
            user_id = %ticket.user_id,
            request_id = %ticket.request_id,
            requested_count = ticket.requested_count,
            successful_count,
            charged = receipt.charged,
            released = receipt.released,
            duplicate = receipt.duplicate,
            "Generation settled"
        );
        Ok(receipt)
    }

    /// Settle a cancelled or timed-out request. Costs nothing.
    ///
    /// # Errors
    ///
    /// Ledger failures only.
    pub async fn abandon(&self, ticket: &GenerationTicket) -> Result<GenerationReceipt> {
        self.finalize(ticket, 0, Metadata::new()).await
    }

    async fn settle_delivered(
        &self,
        ticket: &GenerationTicket,
        successful_count: i64,
        metadata: Metadata,
    ) -> Result<GenerationReceipt> {
        if successful_count == 0 {
            let account = self.credits.get_balance(&ticket.user_id).await?;
            return Ok(receipt(ticket, 0, 0, 0, false, None, account));
        }

        match self
            .credits
            .deduct_idempotent(
                &ticket.user_id,
                successful_count,
                ticket.kind.transaction_type(),
                metadata,
                charge_key(&ticket.user_id, &ticket.request_id),
            )
            .await
        {
            Ok(applied) => Ok(receipt(
                ticket,
                successful_count,
                successful_count,
                0,
                false,
                Some(applied.transaction.id),
                applied.account,
            )),
            Err(CreditError::DuplicateEvent { .. }) => {
                let account = self.credits.get_balance(&ticket.user_id).await?;
                Ok(receipt(ticket, successful_count, 0, 0, true, None, account))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_reserved(
        &self,
        ticket: &GenerationTicket,
        successful_count: i64,
        mut metadata: Metadata,
    ) -> Result<GenerationReceipt> {
        let unused = ticket.reserved - successful_count;
        if unused <= 0 {
            let account = self.credits.get_balance(&ticket.user_id).await?;
            return Ok(receipt(
                ticket,
                successful_count,
                ticket.reserved,
                0,
                false,
                None,
                account,
            ));
        }

        metadata.insert("phase".into(), "release".into());
        match self
            .credits
            .grant_idempotent(
                &ticket.user_id,
                unused,
                TransactionType::Release,
                metadata,
                release_key(&ticket.user_id, &ticket.request_id),
            )
            .await
        {
            Ok(applied) => Ok(receipt(
                ticket,
                successful_count,
                successful_count,
                unused,
                false,
                Some(applied.transaction.id),
                applied.account,
            )),
            Err(CreditError::DuplicateEvent { .. }) => {
                let account = self.credits.get_balance(&ticket.user_id).await?;
                Ok(receipt(
                    ticket,
                    successful_count,
                    successful_count,
                    0,
                    true,
                    None,
                    account,
                ))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// Request ids come from the pipeline, so keys are scoped to the paying user.
fn charge_key(user_id: &UserId, request_id: &str) -> String {
    format!("generation:{user_id}:{request_id}")
}

fn reserve_key(user_id: &UserId, request_id: &str) -> String {
    format!("{}:reserve", charge_key(user_id, request_id))
}

fn release_key(user_id: &UserId, request_id: &str) -> String {
    format!("{}:release", charge_key(user_id, request_id))
}

fn receipt(
    ticket: &GenerationTicket,
    successful_count: i64,
    charged: i64,
    released: i64,
    duplicate: bool,
    transaction_id: Option<TransactionId>,
    account: CreditAccount,
) -> GenerationReceipt {
    GenerationReceipt {
        request_id: ticket.request_id.clone(),
        requested_count: ticket.requested_count,
        successful_count,
        charged,
        released,
        duplicate,
        transaction_id,
        account,
    }
}
