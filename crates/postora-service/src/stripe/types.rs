//! Stripe webhook payload types.
//!
//! Only the fields the ledger needs are modeled; everything else is ignored.

use std::collections::HashMap;

use serde::Deserialize;

/// Stripe metadata: string keys, string values.
pub type StripeMetadata = HashMap<String, String>;

/// Webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    /// Event ID (`evt_...`).
    pub id: String,
    /// Event type, e.g. `invoice.paid`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: StripeEventData,
}

/// Event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    /// The object the event is about; decoded per event type.
    pub object: serde_json::Value,
}

/// Stripe Checkout session object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    /// Session ID.
    pub id: String,
    /// `payment`, `subscription` or `setup`.
    #[serde(default)]
    pub mode: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`.
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Client reference ID (our `user_id`).
    #[serde(default)]
    pub client_reference_id: Option<String>,
    /// Subscription created by the session.
    #[serde(default)]
    pub subscription: Option<String>,
    /// First invoice of the subscription.
    #[serde(default)]
    pub invoice: Option<String>,
    /// Payment intent ID (payment mode).
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Metadata.
    #[serde(default)]
    pub metadata: StripeMetadata,
}

/// Stripe `PaymentIntent` object.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID.
    pub id: String,
    /// Status (succeeded, processing, ...).
    #[serde(default)]
    pub status: String,
    /// Metadata.
    #[serde(default)]
    pub metadata: StripeMetadata,
}

/// Stripe invoice object.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    /// Invoice ID.
    pub id: String,
    /// Subscription the invoice belongs to.
    #[serde(default)]
    pub subscription: Option<String>,
    /// Snapshot of the subscription's details at invoice time.
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    /// Metadata.
    #[serde(default)]
    pub metadata: StripeMetadata,
    /// Line items.
    #[serde(default)]
    pub lines: InvoiceLines,
}

/// Subscription snapshot on an invoice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    /// Subscription metadata at invoice time.
    #[serde(default)]
    pub metadata: StripeMetadata,
}

/// Invoice line item list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    /// Line items.
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

/// A single invoice line.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    /// Billed period.
    #[serde(default)]
    pub period: Option<Period>,
    /// Metadata.
    #[serde(default)]
    pub metadata: StripeMetadata,
}

/// Unix-timestamp period bounds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Period {
    /// Period start (Unix seconds).
    pub start: Option<i64>,
    /// Period end (Unix seconds).
    pub end: Option<i64>,
}

/// Stripe subscription object.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    /// Subscription ID.
    pub id: String,
    /// Status (active, past_due, canceled, ...).
    #[serde(default)]
    pub status: String,
    /// Whether the subscription ends at period end.
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Current period start (Unix seconds).
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Current period end (Unix seconds).
    #[serde(default)]
    pub current_period_end: Option<i64>,
    /// Metadata.
    #[serde(default)]
    pub metadata: StripeMetadata,
}
