//! Stripe webhook verification and decoding.
//!
//! Stripe is the only payment provider. Webhook bodies are verified against the
//! `Stripe-Signature` header and then decoded into provider-neutral
//! [`BillingEvent`]s; the rest of the service never sees Stripe JSON.

mod types;

pub use types::{
    CheckoutSession, Invoice, InvoiceLine, InvoiceLines, PaymentIntent, Period, StripeEvent,
    StripeEventData, StripeMetadata, Subscription, SubscriptionDetails,
};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use postora_core::{BillingEvent, BillingPeriod, UserId};

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Maximum age of a signed webhook before it is rejected as a replay.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Stripe webhook errors.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// No `Stripe-Signature` header was sent.
    #[error("missing Stripe-Signature header")]
    MissingSignature,

    /// The header could not be parsed.
    #[error("malformed Stripe-Signature header: {0}")]
    MalformedSignature(String),

    /// No `v1` signature matched the payload.
    #[error("webhook signature mismatch")]
    InvalidSignature,

    /// The signed timestamp is outside the tolerance window.
    #[error("webhook timestamp outside tolerance: age={age_secs}s")]
    StaleTimestamp {
        /// Seconds between the signed timestamp and now.
        age_secs: i64,
    },

    /// The body is not a valid event.
    #[error("invalid webhook payload: {0}")]
    Payload(String),
}

/// Result of decoding a webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// The event maps to a billing fact.
    Billing(BillingEvent),
    /// The event is acknowledged but has no effect on the ledger.
    Ignored(String),
}

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// The header has the form `t=<unix>,v1=<hex>[,v1=<hex>...]`. The signed
/// message is `"{t}.{payload}"`. Any matching `v1` entry is accepted.
///
/// # Errors
///
/// Returns an error if the header is malformed, the timestamp is older (or
/// newer) than [`SIGNATURE_TOLERANCE_SECS`], or no signature matches.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: DateTime<Utc>,
) -> Result<(), StripeError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                let parsed = value
                    .parse::<i64>()
                    .map_err(|_| StripeError::MalformedSignature("bad timestamp".into()))?;
                timestamp = Some(parsed);
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| StripeError::MalformedSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(StripeError::MalformedSignature("missing v1 signature".into()));
    }

    let age_secs = now.timestamp() - timestamp;
    if age_secs.abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(StripeError::StaleTimestamp { age_secs });
    }

    let expected = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))
        .map_err(|_| StripeError::InvalidSignature)?;

    if signatures
        .iter()
        .any(|candidate| constant_time_eq(&expected, candidate))
    {
        Ok(())
    } else {
        Err(StripeError::InvalidSignature)
    }
}

/// Build a `Stripe-Signature` header value for `payload` signed at `timestamp`.
///
/// Used by tests and local tooling to produce deliveries the service accepts.
///
/// # Errors
///
/// Returns [`StripeError::InvalidSignature`] if the HMAC key is rejected.
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> Result<String, StripeError> {
    let signature = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))
        .map_err(|_| StripeError::InvalidSignature)?;
    Ok(format!("t={timestamp},v1={signature}"))
}

/// Parse a raw webhook body into the event envelope.
///
/// # Errors
///
/// Returns [`StripeError::Payload`] if the body is not a Stripe event.
pub fn parse_event(payload: &str) -> Result<StripeEvent, StripeError> {
    serde_json::from_str(payload).map_err(|e| StripeError::Payload(e.to_string()))
}

/// Map a Stripe event onto a [`BillingEvent`].
///
/// Unknown event types, unpaid sessions and objects without a usable user id
/// decode to [`DecodedEvent::Ignored`].
///
/// # Errors
///
/// Returns [`StripeError::Payload`] if the event object does not have the
/// shape its type promises.
pub fn decode_event(event: &StripeEvent) -> Result<DecodedEvent, StripeError> {
    match event.event_type.as_str() {
        "checkout.session.completed" => decode_checkout(&object(event)?),
        "payment_intent.succeeded" => Ok(decode_payment_intent(&object(event)?)),
        "invoice.paid" | "invoice.payment_succeeded" => Ok(decode_invoice(&object(event)?)),
        "customer.subscription.updated" => Ok(decode_subscription(&object(event)?, false)),
        "customer.subscription.deleted" => Ok(decode_subscription(&object(event)?, true)),
        other => Ok(ignored(format!("unhandled event type {other}"))),
    }
}

fn object<T: DeserializeOwned>(event: &StripeEvent) -> Result<T, StripeError> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        StripeError::Payload(format!("{} object: {e}", event.event_type))
    })
}

fn decode_checkout(session: &CheckoutSession) -> Result<DecodedEvent, StripeError> {
    let user = session
        .client_reference_id
        .as_deref()
        .or_else(|| metadata_value(&session.metadata, "user_id"));
    let Some(user_id) = parse_user(user) else {
        return Ok(ignored("checkout session without a valid user id"));
    };
    let plan_id = metadata_value(&session.metadata, "plan_id").map(str::to_string);
    let paid = matches!(
        session.payment_status.as_deref(),
        Some("paid" | "no_payment_required")
    );

    match session.mode.as_deref() {
        Some("subscription") => {
            if !paid {
                return Ok(ignored("subscription checkout not paid"));
            }
            let (Some(plan_id), Some(subscription_id)) = (plan_id, session.subscription.clone())
            else {
                return Ok(ignored("subscription checkout without plan or subscription"));
            };
            Ok(DecodedEvent::Billing(BillingEvent::SubscriptionStarted {
                user_id,
                plan_id,
                subscription_id,
                session_id: session.id.clone(),
                invoice_id: session.invoice.clone(),
                period: BillingPeriod::default(),
            }))
        }
        Some("payment") => {
            if session.payment_status.as_deref() != Some("paid") {
                return Ok(ignored("payment checkout not paid"));
            }
            let (Some(plan_id), Some(payment_intent_id)) =
                (plan_id, session.payment_intent.clone())
            else {
                return Ok(ignored("payment checkout without plan or payment intent"));
            };
            Ok(DecodedEvent::Billing(BillingEvent::OneTimePurchase {
                user_id,
                plan_id,
                payment_intent_id,
            }))
        }
        other => Ok(ignored(format!(
            "checkout mode {} has no credit effect",
            other.unwrap_or("unknown")
        ))),
    }
}

fn decode_payment_intent(intent: &PaymentIntent) -> DecodedEvent {
    let Some(user_id) = parse_user(metadata_value(&intent.metadata, "user_id")) else {
        return ignored("payment intent without a valid user id");
    };
    let Some(plan_id) = metadata_value(&intent.metadata, "plan_id") else {
        return ignored("payment intent without a plan");
    };
    DecodedEvent::Billing(BillingEvent::OneTimePurchase {
        user_id,
        plan_id: plan_id.to_string(),
        payment_intent_id: intent.id.clone(),
    })
}

fn decode_invoice(invoice: &Invoice) -> DecodedEvent {
    let Some(user_id) = parse_user(invoice_metadata(invoice, "user_id")) else {
        return ignored("invoice without a valid user id");
    };
    let Some(plan_id) = invoice_metadata(invoice, "plan_id") else {
        return ignored("invoice without a plan");
    };
    let Some(subscription_id) = invoice.subscription.clone() else {
        return ignored("invoice is not for a subscription");
    };
    let period = invoice
        .lines
        .data
        .first()
        .and_then(|line| line.period)
        .map(|p| billing_period(p.start, p.end))
        .unwrap_or_default();

    DecodedEvent::Billing(BillingEvent::InvoicePaid {
        user_id,
        plan_id: plan_id.to_string(),
        subscription_id,
        invoice_id: invoice.id.clone(),
        period,
    })
}

/// Invoice metadata, then the subscription snapshot, then the first line.
fn invoice_metadata<'a>(invoice: &'a Invoice, key: &str) -> Option<&'a str> {
    metadata_value(&invoice.metadata, key)
        .or_else(|| {
            invoice
                .subscription_details
                .as_ref()
                .and_then(|details| metadata_value(&details.metadata, key))
        })
        .or_else(|| {
            invoice
                .lines
                .data
                .first()
                .and_then(|line| metadata_value(&line.metadata, key))
        })
}

fn decode_subscription(subscription: &Subscription, deleted: bool) -> DecodedEvent {
    let Some(user_id) = parse_user(metadata_value(&subscription.metadata, "user_id")) else {
        return ignored("subscription without a valid user id");
    };

    if deleted || subscription.status == "canceled" {
        return DecodedEvent::Billing(BillingEvent::SubscriptionCanceled {
            user_id,
            subscription_id: subscription.id.clone(),
        });
    }

    DecodedEvent::Billing(BillingEvent::SubscriptionUpdated {
        user_id,
        subscription_id: subscription.id.clone(),
        plan_id: metadata_value(&subscription.metadata, "plan_id").map(str::to_string),
        cancel_at_period_end: subscription.cancel_at_period_end,
        period: billing_period(
            subscription.current_period_start,
            subscription.current_period_end,
        ),
    })
}

fn metadata_value<'a>(metadata: &'a StripeMetadata, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_user(value: Option<&str>) -> Option<UserId> {
    value.and_then(|v| v.parse().ok())
}

fn billing_period(start: Option<i64>, end: Option<i64>) -> BillingPeriod {
    BillingPeriod {
        start: start.and_then(|s| DateTime::from_timestamp(s, 0)),
        end: end.and_then(|e| DateTime::from_timestamp(e, 0)),
    }
}

fn ignored(reason: impl Into<String>) -> DecodedEvent {
    DecodedEvent::Ignored(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn event(event_type: &str, object: serde_json::Value) -> StripeEvent {
        parse_event(
            &json!({ "id": "evt_1", "type": event_type, "data": { "object": object } })
                .to_string(),
        )
        .unwrap()
    }

    fn billing(decoded: DecodedEvent) -> BillingEvent {
        match decoded {
            DecodedEvent::Billing(event) => event,
            DecodedEvent::Ignored(reason) => panic!("event ignored: {reason}"),
        }
    }

    #[test]
    fn signed_payload_verifies() {
        let now = Utc::now();
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, payload, now.timestamp()).unwrap();
        verify_signature(SECRET, payload, &header, now).unwrap();
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let now = Utc::now();
        let header = sign_payload(SECRET, r#"{"id":"evt_1"}"#, now.timestamp()).unwrap();
        let err = verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, now).unwrap_err();
        assert!(matches!(err, StripeError::InvalidSignature));

        let err = verify_signature("whsec_other", r#"{"id":"evt_1"}"#, &header, now).unwrap_err();
        assert!(matches!(err, StripeError::InvalidSignature));
    }

    #[test]
    fn any_v1_entry_may_match() {
        let now = Utc::now();
        let payload = "{}";
        let valid = sign_payload(SECRET, payload, now.timestamp()).unwrap();
        let signature = valid.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1=deadbeef,v0=abc,v1={signature}", now.timestamp());
        verify_signature(SECRET, payload, &header, now).unwrap();
    }

    #[test]
    fn old_timestamp_is_rejected() {
        let now = Utc::now();
        let signed_at = now.timestamp() - SIGNATURE_TOLERANCE_SECS - 1;
        let header = sign_payload(SECRET, "{}", signed_at).unwrap();
        let err = verify_signature(SECRET, "{}", &header, now).unwrap_err();
        assert!(matches!(err, StripeError::StaleTimestamp { .. }));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let now = Utc::now();
        let no_signature = format!("t={}", now.timestamp());
        for header in ["", "v1=abc", "t=abc,v1=abc", no_signature.as_str()] {
            let err = verify_signature(SECRET, "{}", header, now).unwrap_err();
            assert!(
                matches!(err, StripeError::MalformedSignature(_)),
                "header {header:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn subscription_checkout_decodes_with_first_invoice() {
        let user = UserId::generate();
        let decoded = decode_event(&event(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "mode": "subscription",
                "payment_status": "paid",
                "client_reference_id": user.to_string(),
                "subscription": "sub_1",
                "invoice": "in_1",
                "metadata": { "plan_id": "pro" }
            }),
        ))
        .unwrap();

        assert_eq!(
            billing(decoded),
            BillingEvent::SubscriptionStarted {
                user_id: user,
                plan_id: "pro".into(),
                subscription_id: "sub_1".into(),
                session_id: "cs_1".into(),
                invoice_id: Some("in_1".into()),
                period: BillingPeriod::default(),
            }
        );
    }

    #[test]
    fn payment_checkout_requires_paid_status() {
        let user = UserId::generate();
        let object = |status: &str| {
            json!({
                "id": "cs_2",
                "mode": "payment",
                "payment_status": status,
                "payment_intent": "pi_1",
                "metadata": { "user_id": user.to_string(), "plan_id": "pay-as-you-go" }
            })
        };

        let unpaid = decode_event(&event("checkout.session.completed", object("unpaid"))).unwrap();
        assert!(matches!(unpaid, DecodedEvent::Ignored(_)));

        let paid = decode_event(&event("checkout.session.completed", object("paid"))).unwrap();
        assert_eq!(
            billing(paid),
            BillingEvent::OneTimePurchase {
                user_id: user,
                plan_id: "pay-as-you-go".into(),
                payment_intent_id: "pi_1".into(),
            }
        );
    }

    #[test]
    fn payment_intent_needs_user_and_plan() {
        let user = UserId::generate();
        let missing = decode_event(&event(
            "payment_intent.succeeded",
            json!({ "id": "pi_1", "status": "succeeded", "metadata": { "user_id": user.to_string() } }),
        ))
        .unwrap();
        assert!(matches!(missing, DecodedEvent::Ignored(_)));

        let decoded = decode_event(&event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_1",
                "status": "succeeded",
                "metadata": { "user_id": user.to_string(), "plan_id": "pay-as-you-go" }
            }),
        ))
        .unwrap();
        assert!(matches!(
            billing(decoded),
            BillingEvent::OneTimePurchase { payment_intent_id, .. } if payment_intent_id == "pi_1"
        ));
    }

    #[test]
    fn invoice_reads_subscription_details_and_line_period() {
        let user = UserId::generate();
        let decoded = decode_event(&event(
            "invoice.paid",
            json!({
                "id": "in_7",
                "subscription": "sub_1",
                "subscription_details": {
                    "metadata": { "user_id": user.to_string(), "plan_id": "starter" }
                },
                "lines": { "data": [ { "period": { "start": 1_700_000_000, "end": 1_702_592_000 } } ] }
            }),
        ))
        .unwrap();

        let BillingEvent::InvoicePaid {
            user_id,
            plan_id,
            invoice_id,
            period,
            ..
        } = billing(decoded)
        else {
            panic!("expected invoice paid");
        };
        assert_eq!(user_id, user);
        assert_eq!(plan_id, "starter");
        assert_eq!(invoice_id, "in_7");
        assert_eq!(period.start.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(period.end.map(|t| t.timestamp()), Some(1_702_592_000));
    }

    #[test]
    fn invoice_without_subscription_is_ignored() {
        let user = UserId::generate();
        let decoded = decode_event(&event(
            "invoice.payment_succeeded",
            json!({
                "id": "in_8",
                "metadata": { "user_id": user.to_string(), "plan_id": "starter" }
            }),
        ))
        .unwrap();
        assert!(matches!(decoded, DecodedEvent::Ignored(_)));
    }

    #[test]
    fn subscription_events_map_to_lifecycle() {
        let user = UserId::generate();
        let object = |status: &str| {
            json!({
                "id": "sub_1",
                "status": status,
                "cancel_at_period_end": true,
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "metadata": { "user_id": user.to_string(), "plan_id": "pro" }
            })
        };

        let updated =
            billing(decode_event(&event("customer.subscription.updated", object("active"))).unwrap());
        assert!(matches!(
            updated,
            BillingEvent::SubscriptionUpdated { cancel_at_period_end: true, plan_id: Some(ref p), .. } if p == "pro"
        ));

        let canceled = billing(
            decode_event(&event("customer.subscription.updated", object("canceled"))).unwrap(),
        );
        assert!(matches!(canceled, BillingEvent::SubscriptionCanceled { .. }));

        let deleted =
            billing(decode_event(&event("customer.subscription.deleted", object("active"))).unwrap());
        assert!(matches!(deleted, BillingEvent::SubscriptionCanceled { .. }));
    }

    #[test]
    fn unusable_events_are_ignored() {
        let unknown = decode_event(&event("charge.refunded", json!({ "id": "ch_1" }))).unwrap();
        assert!(matches!(unknown, DecodedEvent::Ignored(_)));

        let bad_user = decode_event(&event(
            "payment_intent.succeeded",
            json!({ "id": "pi_1", "metadata": { "user_id": "not-a-uuid", "plan_id": "pro" } }),
        ))
        .unwrap();
        assert!(matches!(bad_user, DecodedEvent::Ignored(_)));
    }

    #[test]
    fn wrong_object_shape_is_a_payload_error() {
        let err = decode_event(&event("invoice.paid", json!({ "amount": 5 }))).unwrap_err();
        assert!(matches!(err, StripeError::Payload(_)));
    }
}
