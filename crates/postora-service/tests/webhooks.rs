//! Stripe webhook tests: signature checks, decoding and exactly-once grants.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{
    admin_key, authorization, header_value, stripe_event, stripe_signature, TestHarness,
    ADMIN_API_KEY, WEBHOOK_SECRET,
};
use postora_service::stripe::{sign_payload, SIGNATURE_TOLERANCE_SECS};
use serde_json::{json, Value};

fn invoice_paid(harness: &TestHarness, event_id: &str, invoice_id: &str, plan: &str) -> Value {
    stripe_event(
        event_id,
        "invoice.paid",
        json!({
            "id": invoice_id,
            "subscription": "sub_1",
            "subscription_details": {
                "metadata": { "user_id": harness.test_user_id.to_string(), "plan_id": plan }
            },
            "lines": { "data": [ { "period": { "start": 1_700_000_000, "end": 1_702_592_000 } } ] }
        }),
    )
}

fn subscription_checkout(harness: &TestHarness, event_id: &str) -> Value {
    stripe_event(
        event_id,
        "checkout.session.completed",
        json!({
            "id": "cs_1",
            "mode": "subscription",
            "payment_status": "paid",
            "client_reference_id": harness.test_user_id.to_string(),
            "subscription": "sub_1",
            "invoice": "in_1",
            "metadata": { "plan_id": "pro" }
        }),
    )
}

fn subscription_object(harness: &TestHarness, status: &str, cancel_at_period_end: bool) -> Value {
    json!({
        "id": "sub_1",
        "status": status,
        "cancel_at_period_end": cancel_at_period_end,
        "current_period_start": 1_700_000_000,
        "current_period_end": 1_702_592_000,
        "metadata": { "user_id": harness.test_user_id.to_string(), "plan_id": "pro" }
    })
}

async fn subscription(harness: &TestHarness) -> Value {
    let response = harness
        .server
        .get("/v1/subscription")
        .add_header(authorization(), harness.user_auth_header())
        .await;
    response.assert_status_ok();
    response.json()
}

// ============================================================================
// Grants
// ============================================================================

#[tokio::test]
async fn invoice_paid_grants_plan_credits_once() {
    let harness = TestHarness::new();
    harness.init_account().await;

    let response = harness
        .deliver(&invoice_paid(&harness, "evt_1", "in_1", "pro"))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "granted");
    assert_eq!(body["credits"], 200);
    assert_eq!(harness.balance().await, 203);

    // Stripe redelivers the same event.
    let body: Value = harness
        .deliver(&invoice_paid(&harness, "evt_1", "in_1", "pro"))
        .await
        .json();
    assert_eq!(body["outcome"], "duplicate");

    // A different event about the same invoice.
    let body: Value = harness
        .deliver(&invoice_paid(&harness, "evt_2", "in_1", "pro"))
        .await
        .json();
    assert_eq!(body["outcome"], "duplicate");

    assert_eq!(harness.balance().await, 203);
}

#[tokio::test]
async fn each_billing_cycle_grants_again() {
    let harness = TestHarness::new();

    harness
        .deliver(&invoice_paid(&harness, "evt_1", "in_1", "pro"))
        .await
        .assert_status_ok();
    harness
        .deliver(&invoice_paid(&harness, "evt_2", "in_2", "pro"))
        .await
        .assert_status_ok();

    assert_eq!(harness.balance().await, 400);
}

#[tokio::test]
async fn checkout_and_first_invoice_grant_once() {
    let harness = TestHarness::new();

    let body: Value = harness
        .deliver(&subscription_checkout(&harness, "evt_1"))
        .await
        .json();
    assert_eq!(body["outcome"], "granted");

    let body: Value = harness
        .deliver(&invoice_paid(&harness, "evt_2", "in_1", "pro"))
        .await
        .json();
    assert_eq!(body["outcome"], "duplicate");
    assert_eq!(harness.balance().await, 200);

    let body = subscription(&harness).await;
    assert_eq!(body["entitled"], true);
    assert_eq!(body["subscription"]["plan_id"], "pro");
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["subscription"]["subscription_id"], "sub_1");
}

#[tokio::test]
async fn one_time_purchase_grants_pack_credits() {
    let harness = TestHarness::new();
    harness.init_account().await;
    let event = stripe_event(
        "evt_1",
        "checkout.session.completed",
        json!({
            "id": "cs_2",
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": "pi_1",
            "metadata": {
                "user_id": harness.test_user_id.to_string(),
                "plan_id": "pay-as-you-go"
            }
        }),
    );

    let body: Value = harness.deliver(&event).await.json();

    assert_eq!(body["outcome"], "granted");
    assert_eq!(body["credits"], 15);
    assert_eq!(harness.balance().await, 18);
}

#[tokio::test]
async fn unknown_plan_is_acknowledged_without_credits() {
    let harness = TestHarness::new();

    let response = harness
        .deliver(&invoice_paid(&harness, "evt_1", "in_1", "enterprise"))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["outcome"], "skipped");
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn admin_grant_key_does_not_block_invoice_grant() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/credits/add")
        .add_header(admin_key(), header_value(ADMIN_API_KEY))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 5,
            "idempotency_key": "invoice:in_1"
        }))
        .await;
    response.assert_status_ok();
    let applied: Value = response.json();
    assert_eq!(applied["transaction"]["idempotency_key"], "admin:invoice:in_1");

    let body: Value = harness
        .deliver(&invoice_paid(&harness, "evt_1", "in_1", "pro"))
        .await
        .json();
    assert_eq!(body["outcome"], "granted");
    assert_eq!(harness.balance().await, 205);
}

#[tokio::test]
async fn unhandled_event_types_are_ignored() {
    let harness = TestHarness::new();

    let response = harness
        .deliver(&stripe_event("evt_1", "charge.refunded", json!({ "id": "ch_1" })))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "ignored");
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test]
async fn cancellation_keeps_credits() {
    let harness = TestHarness::new();
    harness
        .deliver(&subscription_checkout(&harness, "evt_1"))
        .await
        .assert_status_ok();

    let body: Value = harness
        .deliver(&stripe_event(
            "evt_2",
            "customer.subscription.updated",
            subscription_object(&harness, "active", true),
        ))
        .await
        .json();
    assert_eq!(body["outcome"], "record_updated");
    let body = subscription(&harness).await;
    assert_eq!(body["subscription"]["status"], "cancel_pending");
    assert_eq!(body["entitled"], true);

    let body: Value = harness
        .deliver(&stripe_event(
            "evt_3",
            "customer.subscription.deleted",
            subscription_object(&harness, "canceled", true),
        ))
        .await
        .json();
    assert_eq!(body["outcome"], "record_updated");
    let body = subscription(&harness).await;
    assert_eq!(body["subscription"]["status"], "canceled");
    assert_eq!(body["entitled"], false);

    assert_eq!(harness.balance().await, 200);
}

// ============================================================================
// Signature verification
// ============================================================================

#[tokio::test]
async fn unsigned_delivery_is_rejected() {
    let harness = TestHarness::new();
    let payload = invoice_paid(&harness, "evt_1", "in_1", "pro").to_string();

    let response = harness.server.post("/webhooks/stripe").text(payload).await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn forged_signature_is_rejected() {
    let harness = TestHarness::new();
    let payload = invoice_paid(&harness, "evt_1", "in_1", "pro").to_string();
    let signature = sign_payload("whsec_attacker", &payload, Utc::now().timestamp()).unwrap();

    let response = harness
        .server
        .post("/webhooks/stripe")
        .add_header(stripe_signature(), header_value(&signature))
        .text(payload)
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn replayed_old_delivery_is_rejected() {
    let harness = TestHarness::new();
    let payload = invoice_paid(&harness, "evt_1", "in_1", "pro").to_string();
    let signed_at = Utc::now().timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
    let signature = sign_payload(WEBHOOK_SECRET, &payload, signed_at).unwrap();

    let response = harness
        .server
        .post("/webhooks/stripe")
        .add_header(stripe_signature(), header_value(&signature))
        .text(payload)
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let harness = TestHarness::new();
    let payload = "{not json".to_string();
    let signature = sign_payload(WEBHOOK_SECRET, &payload, Utc::now().timestamp()).unwrap();

    let response = harness
        .server
        .post("/webhooks/stripe")
        .add_header(stripe_signature(), header_value(&signature))
        .text(payload)
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}
