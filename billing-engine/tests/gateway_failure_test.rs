//! Failure isolation tests for billing-engine: gateway outages are per
//! subscription, ledger outages abort the run.

mod common;

use billing_engine::gateway::StubBehavior;
use billing_engine::ledger::Ledger;
use billing_engine::lifecycle::ItemResolution;
use billing_engine::models::{BatchItemStatus, BatchStatus, SubscriptionStatus};
use chrono::Duration;
use common::{monthly, TestApp};
use service_core::error::AppError;

#[tokio::test]
async fn gateway_error_fails_item_and_leaves_subscription_untouched() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let broken = app.subscribe("broken@example.com", &basic, app.now() - Duration::days(2));
    let healthy = app.subscribe_due("healthy@example.com", &basic);
    app.gateway.script(
        broken.subscription_id,
        StubBehavior::Fail("connection reset".to_string()),
    );

    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.amount_successful, 1000);

    let items = app.ledger.items_for_subscription(broken.subscription_id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status(), BatchItemStatus::Failed);
    assert!(items[0].transaction_id.is_none());
    assert!(items[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("connection reset"));

    // No transaction, still active, date unchanged, nobody notified.
    assert!(app.ledger.transactions_for(broken.subscription_id).is_empty());
    let stored = app.subscription(&broken);
    assert_eq!(stored.status(), SubscriptionStatus::Active);
    assert_eq!(stored.next_billing_date, broken.next_billing_date);
    assert!(app
        .notifier
        .notifications()
        .iter()
        .all(|n| n.subscription_id != broken.subscription_id));

    // The outage did not stop the next subscription.
    assert_eq!(app.ledger.transactions_for(healthy.subscription_id).len(), 1);
}

#[tokio::test]
async fn gateway_error_subscription_is_retried_next_run() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("flaky@example.com", &basic);
    app.gateway.script(
        subscription.subscription_id,
        StubBehavior::Fail("timeout".to_string()),
    );

    app.engine.run(false).await.unwrap();
    app.gateway
        .script(subscription.subscription_id, StubBehavior::Approve);
    app.clock.advance(Duration::days(1));

    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.successful, 1);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 2);
    assert_eq!(app.ledger.transactions_for(subscription.subscription_id).len(), 1);
}

#[tokio::test]
async fn batch_creation_failure_aborts_before_any_charge() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_batch_writes(true);

    let result = app.engine.run(false).await;

    assert!(matches!(result, Err(AppError::DatabaseError(_))));
    assert!(app.ledger.batches().is_empty());
    assert!(app.gateway.charges().is_empty());
}

#[tokio::test]
async fn item_write_failure_aborts_run_and_leaves_batch_running() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_item_writes(true);

    let result = app.engine.run(false).await;

    assert!(result.is_err());
    let batches = app.ledger.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status(), BatchStatus::Running);
    // The pending item is written before the gateway is called.
    assert!(app.gateway.charges().is_empty());
}

#[tokio::test]
async fn settlement_failure_keeps_item_pending_and_blocks_recharge() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);
    app.ledger.fail_settlements(true);

    let result = app.engine.run(false).await;

    // Money moved at the gateway but nothing was recorded.
    assert!(result.is_err());
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 1);
    assert!(app.ledger.transactions().is_empty());
    let items = app.ledger.items_for_subscription(subscription.subscription_id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status(), BatchItemStatus::Pending);
    let stored = app.subscription(&subscription);
    assert_eq!(stored.next_billing_date, subscription.next_billing_date);

    let interrupted = app.ledger.batches()[0].clone();
    assert_eq!(interrupted.status(), BatchStatus::Running);

    // Same day: the interrupted batch still counts as in flight.
    app.ledger.fail_settlements(false);
    assert!(app.engine.run(false).await.unwrap().is_skipped());

    // Past the stale threshold: recovered, but the subscription with the
    // unresolved item is not charged again.
    app.clock.advance(Duration::hours(7));
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 1);

    let recovered = app
        .ledger
        .get_batch(interrupted.batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.status(), BatchStatus::Failed);

    // Operator confirms the capture; the period counts as paid.
    app.lifecycle
        .resolve_pending_item(
            items[0].item_id,
            ItemResolution::Charged {
                external_id: "ch_stub_000001".to_string(),
            },
            "gateway shows ch_stub_000001 settled",
        )
        .await
        .unwrap();
    assert!(app.ledger.unresolved_items().await.unwrap().is_empty());

    // Next day: nothing is due, so no second charge for the same period.
    app.clock.advance(Duration::days(1));
    let summary = app.engine.run(false).await.unwrap().summary().cloned().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 1);
    assert_eq!(app.ledger.transactions_for(subscription.subscription_id).len(), 1);
}
