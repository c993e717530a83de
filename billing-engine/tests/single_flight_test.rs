//! Single-flight and stale-run recovery tests for billing-engine.

mod common;

use billing_engine::engine::SkipReason;
use billing_engine::ledger::{Ledger, RunLease};
use billing_engine::models::{BatchStatus, NewBatch};
use chrono::Duration;
use common::{monthly, TestApp};

#[tokio::test]
async fn run_is_skipped_while_lock_is_held() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);

    let lease = app
        .ledger
        .try_acquire_run_lock()
        .await
        .unwrap()
        .expect("lock is free");

    let outcome = app.engine.run(false).await.unwrap();
    assert!(outcome.is_skipped());
    assert_eq!(
        outcome,
        billing_engine::engine::RunOutcome::Skipped {
            reason: SkipReason::LockHeld
        }
    );
    assert!(app.ledger.batches().is_empty());
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 0);

    lease.release().await.unwrap();

    let outcome = app.engine.run(false).await.unwrap();
    assert_eq!(outcome.summary().unwrap().processed, 1);
}

#[tokio::test]
async fn lock_is_released_after_every_run() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    app.subscribe_due("a@example.com", &basic);

    app.engine.run(false).await.unwrap();
    assert!(!app.ledger.is_run_locked());

    // Also after an aborted run.
    app.ledger.fail_batch_writes(true);
    assert!(app.engine.run(false).await.is_err());
    assert!(!app.ledger.is_run_locked());
}

#[tokio::test]
async fn run_is_skipped_while_a_fresh_batch_is_running() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);

    let running = app
        .ledger
        .create_batch(&NewBatch {
            batch_code: "BATCH-IN-FLIGHT".to_string(),
            run_date: app.now().date_naive(),
            dry_run: false,
        })
        .await
        .unwrap();
    app.ledger
        .mark_batch_running(running.batch_id, app.now() - Duration::minutes(30))
        .await
        .unwrap();

    let outcome = app.engine.run(false).await.unwrap();

    assert_eq!(
        outcome,
        billing_engine::engine::RunOutcome::Skipped {
            reason: SkipReason::BatchRunning {
                batch_code: "BATCH-IN-FLIGHT".to_string()
            }
        }
    );
    assert_eq!(app.ledger.batches().len(), 1);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 0);
}

#[tokio::test]
async fn stale_running_batch_is_failed_and_run_proceeds() {
    let app = TestApp::new();
    let basic = app.seed_plan(&monthly("Basic", 1000));
    let subscription = app.subscribe_due("a@example.com", &basic);

    let abandoned = app
        .ledger
        .create_batch(&NewBatch {
            batch_code: "BATCH-ABANDONED".to_string(),
            run_date: app.now().date_naive(),
            dry_run: false,
        })
        .await
        .unwrap();
    app.ledger
        .mark_batch_running(abandoned.batch_id, app.now() - Duration::hours(7))
        .await
        .unwrap();

    let outcome = app.engine.run(false).await.unwrap();
    assert_eq!(outcome.summary().unwrap().processed, 1);
    assert_eq!(app.gateway.charge_count_for(subscription.subscription_id), 1);

    let recovered = app
        .ledger
        .get_batch(abandoned.batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.status(), BatchStatus::Failed);
    assert!(recovered
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("Abandoned"));
    assert_eq!(recovered.completed_at, Some(app.now()));
}
