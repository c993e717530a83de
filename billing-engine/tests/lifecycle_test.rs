//! Subscription lifecycle, refund and webhook tests for billing-engine.

mod common;

use billing_engine::gateway::{GatewayCall, StubBehavior};
use billing_engine::ledger::Ledger;
use billing_engine::lifecycle::{ItemResolution, WebhookOutcome};
use billing_engine::models::{
    BatchItemStatus, PaymentTransaction, Subscription, SubscriptionStatus, TransactionStatus,
    TransactionType,
};
use common::{monthly, TestApp, WEBHOOK_SECRET};
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::sign_payload;

/// Run once and return the charge recorded for `subscription`.
async fn charged(app: &TestApp, subscription: &Subscription) -> PaymentTransaction {
    app.engine.run(false).await.unwrap();
    app.ledger
        .transactions_for(subscription.subscription_id)
        .into_iter()
        .find(|t| t.transaction_type() == TransactionType::Charge)
        .expect("charge recorded")
}

fn signed(event: serde_json::Value) -> (Vec<u8>, String) {
    let payload = serde_json::to_vec(&event).unwrap();
    let signature = sign_payload(WEBHOOK_SECRET, &payload).unwrap();
    (payload, signature)
}

// =============================================================================
// Cancellation and reactivation
// =============================================================================

#[tokio::test]
async fn cancel_keeps_access_until_period_end() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe("a@example.com", &basic, app.now() + chrono::Duration::days(10));

    let cancelled = app
        .lifecycle
        .cancel_subscription(subscription.subscription_id)
        .await
        .unwrap();

    assert_eq!(cancelled.status(), SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(app.now()));
    assert_eq!(cancelled.ends_at, subscription.ends_at);
    assert_eq!(
        app.gateway.calls(),
        vec![GatewayCall::Cancel {
            subscription_id: subscription.subscription_id
        }]
    );

    // Never billed again.
    app.clock.advance(chrono::Duration::days(30));
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn cancel_twice_is_a_conflict() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);

    app.lifecycle
        .cancel_subscription(subscription.subscription_id)
        .await
        .unwrap();
    let again = app
        .lifecycle
        .cancel_subscription(subscription.subscription_id)
        .await;

    assert!(matches!(again, Err(AppError::Conflict(_))));
    assert_eq!(app.gateway.calls().len(), 1);
}

#[tokio::test]
async fn cancel_unknown_subscription_is_not_found() {
    let app = TestApp::new();
    let result = app.lifecycle.cancel_subscription(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn reactivated_subscription_is_billed_next_run() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.gateway.script(
        subscription.subscription_id,
        StubBehavior::Decline("card_expired".to_string()),
    );
    app.engine.run(false).await.unwrap();
    assert_eq!(
        app.subscription(&subscription).status(),
        SubscriptionStatus::PastDue
    );

    // Past due stays out of the work list until reactivated.
    app.clock.advance(chrono::Duration::days(1));
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.processed, 0);

    let active = app
        .lifecycle
        .reactivate(subscription.subscription_id)
        .await
        .unwrap();
    assert_eq!(active.status(), SubscriptionStatus::Active);

    app.gateway
        .script(subscription.subscription_id, StubBehavior::Approve);
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.successful, 1);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 2);
}

#[tokio::test]
async fn reactivating_active_subscription_is_a_conflict() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);

    let result = app.lifecycle.reactivate(subscription.subscription_id).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
}

// =============================================================================
// Refunds
// =============================================================================

#[tokio::test]
async fn full_refund_marks_original_refunded() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    let charge = charged(&app, &subscription).await;

    let refund = app
        .lifecycle
        .refund_payment(charge.transaction_id, None)
        .await
        .unwrap();

    assert_eq!(refund.transaction_type(), TransactionType::Refund);
    assert_eq!(refund.status(), TransactionStatus::Succeeded);
    assert_eq!(refund.amount, 1000);
    assert!(refund.external_id.is_some());

    let original = app
        .ledger
        .get_transaction(charge.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status(), TransactionStatus::Refunded);

    assert!(app.gateway.calls().contains(&GatewayCall::Refund {
        transaction_id: charge.external_id.clone().unwrap(),
        amount: None,
    }));

    // A refunded charge cannot be refunded again.
    let again = app
        .lifecycle
        .refund_payment(charge.transaction_id, None)
        .await;
    assert!(matches!(again, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn partial_refund_sends_amount_to_gateway() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    let charge = charged(&app, &subscription).await;

    let refund = app
        .lifecycle
        .refund_payment(charge.transaction_id, Some(400))
        .await
        .unwrap();

    assert_eq!(refund.amount, 400);
    assert!(app.gateway.calls().contains(&GatewayCall::Refund {
        transaction_id: charge.external_id.clone().unwrap(),
        amount: Some(400),
    }));
}

#[tokio::test]
async fn refund_amount_must_be_within_original() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    let charge = charged(&app, &subscription).await;

    for amount in [0, -5, 1001] {
        let result = app
            .lifecycle
            .refund_payment(charge.transaction_id, Some(amount))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))), "amount {}", amount);
    }
    assert!(app
        .gateway
        .calls()
        .iter()
        .all(|c| !matches!(c, GatewayCall::Refund { .. })));
}

#[tokio::test]
async fn failed_charge_cannot_be_refunded() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.gateway.script(
        subscription.subscription_id,
        StubBehavior::Decline("do_not_honor".to_string()),
    );
    let charge = charged(&app, &subscription).await;

    let result = app
        .lifecycle
        .refund_payment(charge.transaction_id, None)
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn payment_succeeded_webhook_settles_pending_charge() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.gateway
        .script(subscription.subscription_id, StubBehavior::ApprovePending);
    let charge = charged(&app, &subscription).await;
    assert_eq!(charge.status(), TransactionStatus::Pending);

    let (payload, signature) = signed(json!({
        "type": "payment.succeeded",
        "data": { "transaction_id": charge.external_id }
    }));
    let outcome = app
        .lifecycle
        .apply_webhook(&payload, &signature)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            transaction_id: charge.transaction_id,
            status: TransactionStatus::Succeeded
        }
    );
    let stored = app
        .ledger
        .get_transaction(charge.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status(), TransactionStatus::Succeeded);

    // Redelivery is harmless.
    let replay = app
        .lifecycle
        .apply_webhook(&payload, &signature)
        .await
        .unwrap();
    assert!(matches!(replay, WebhookOutcome::Ignored { .. }));
}

#[tokio::test]
async fn payment_failed_webhook_fails_charge_and_marks_past_due() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.gateway
        .script(subscription.subscription_id, StubBehavior::ApprovePending);
    let charge = charged(&app, &subscription).await;

    let (payload, signature) = signed(json!({
        "type": "payment.failed",
        "data": {
            "id": charge.external_id,
            "failure_reason": "ach_returned"
        }
    }));
    let outcome = app
        .lifecycle
        .apply_webhook(&payload, &signature)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

    let stored = app
        .ledger
        .get_transaction(charge.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status(), TransactionStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("ach_returned"));
    assert_eq!(
        app.subscription(&subscription).status(),
        SubscriptionStatus::PastDue
    );
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let app = TestApp::new();
    let payload = serde_json::to_vec(&json!({
        "type": "payment.succeeded",
        "data": { "transaction_id": "ch_stub_000001" }
    }))
    .unwrap();
    let forged = sign_payload("not-the-secret", &payload).unwrap();

    let result = app.lifecycle.apply_webhook(&payload, &forged).await;
    assert!(matches!(result, Err(AppError::Unauthorized(_))));
}

#[tokio::test]
async fn unknown_events_and_transactions_are_ignored() {
    let app = TestApp::new();

    let (payload, signature) = signed(json!({
        "type": "customer.updated",
        "data": { "id": "cus_1" }
    }));
    let outcome = app
        .lifecycle
        .apply_webhook(&payload, &signature)
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

    let (payload, signature) = signed(json!({
        "type": "payment.succeeded",
        "data": { "transaction_id": "ch_unknown" }
    }));
    let outcome = app
        .lifecycle
        .apply_webhook(&payload, &signature)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            reason: "unknown transaction".to_string()
        }
    );
}

#[tokio::test]
async fn malformed_webhook_payload_is_a_bad_request() {
    let app = TestApp::new();
    let payload = b"not json";
    let signature = sign_payload(WEBHOOK_SECRET, payload).unwrap();

    let result = app.lifecycle.apply_webhook(payload, &signature).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

// =============================================================================
// Manual reconciliation
// =============================================================================

#[tokio::test]
async fn resolving_unknown_item_is_not_found() {
    let app = TestApp::new();
    let result = app
        .lifecycle
        .resolve_pending_item(uuid::Uuid::new_v4(), ItemResolution::NotCharged, "no-op")
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn resolved_item_carries_operator_note() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_settlements(true);
    assert!(app.engine.run(false).await.is_err());
    app.ledger.fail_settlements(false);

    let item = app.ledger.items_for_subscription(subscription.subscription_id)[0].clone();
    app.lifecycle
        .resolve_pending_item(item.item_id, ItemResolution::NotCharged, "charge never captured")
        .await
        .unwrap();

    let items = app.ledger.items_for_subscription(subscription.subscription_id);
    assert_eq!(items[0].status(), BatchItemStatus::Failed);
    assert_eq!(
        items[0].error_message.as_deref(),
        Some("Resolved manually: charge never captured")
    );
    assert!(app.ledger.transactions_for(subscription.subscription_id).is_empty());
    let stored = app.subscription(&subscription);
    assert_eq!(stored.next_billing_date, subscription.next_billing_date);
}

#[tokio::test]
async fn charged_resolution_records_charge_and_advances_subscription() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_settlements(true);
    assert!(app.engine.run(false).await.is_err());
    app.ledger.fail_settlements(false);

    let item = app.ledger.items_for_subscription(subscription.subscription_id)[0].clone();
    app.lifecycle
        .resolve_pending_item(
            item.item_id,
            ItemResolution::Charged {
                external_id: "ch_stub_000001".to_string(),
            },
            "captured per gateway dashboard",
        )
        .await
        .unwrap();

    let charges = app.ledger.transactions_for(subscription.subscription_id);
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].transaction_type(), TransactionType::Charge);
    assert_eq!(charges[0].status(), TransactionStatus::Succeeded);
    assert_eq!(charges[0].amount, 1000);
    assert_eq!(charges[0].external_id.as_deref(), Some("ch_stub_000001"));
    assert_eq!(charges[0].batch_item_id, Some(item.item_id));

    let resolved = app.ledger.get_batch_item(item.item_id).await.unwrap().unwrap();
    assert_eq!(resolved.status(), BatchItemStatus::Succeeded);
    assert_eq!(resolved.transaction_id, Some(charges[0].transaction_id));

    let expected_next = subscription
        .next_billing_date
        .and_then(|d| d.checked_add_months(chrono::Months::new(1)));
    let stored = app.subscription(&subscription);
    assert_eq!(stored.status(), SubscriptionStatus::Active);
    assert_eq!(stored.next_billing_date, expected_next);
    assert_eq!(stored.ends_at, expected_next);
}

#[tokio::test]
async fn charged_resolution_requires_gateway_reference() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_settlements(true);
    assert!(app.engine.run(false).await.is_err());
    app.ledger.fail_settlements(false);

    let item = app.ledger.items_for_subscription(subscription.subscription_id)[0].clone();
    let result = app
        .lifecycle
        .resolve_pending_item(
            item.item_id,
            ItemResolution::Charged {
                external_id: "  ".to_string(),
            },
            "forgot the id",
        )
        .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
    let stored = app.ledger.get_batch_item(item.item_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), BatchItemStatus::Pending);
}

#[tokio::test]
async fn settled_item_cannot_be_resolved() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();

    let item = app.ledger.items_for_subscription(subscription.subscription_id)[0].clone();
    assert_eq!(item.status(), BatchItemStatus::Succeeded);

    let result = app
        .lifecycle
        .resolve_pending_item(item.item_id, ItemResolution::NotCharged, "oops")
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let stored = app.ledger.get_batch_item(item.item_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), BatchItemStatus::Succeeded);
    assert!(stored.error_message.is_none());

    // Batch aggregates still agree with the items.
    let batch = app.ledger.get_batch(summary.batch_id).await.unwrap().unwrap();
    let items = app.ledger.list_batch_items(summary.batch_id).await.unwrap();
    let succeeded = items
        .iter()
        .filter(|i| i.status() == BatchItemStatus::Succeeded)
        .count() as i32;
    assert_eq!(batch.total_successful, succeeded);
}
