//! Billing run orchestration.
//!
//! One run: take the cluster-wide run lock, open a batch, charge every due
//! subscription in order, then close the batch with totals recomputed from
//! the persisted items.

mod recorder;

pub use recorder::BatchRecorder;

use crate::clock::Clock;
use crate::gateway::{ChargeRequest, ChargeResult, PaymentGateway};
use crate::ledger::{Ledger, Settlement};
use crate::models::{
    advance_billing_date, BatchItemStatus, BatchSummary, DueSubscription, NewTransaction,
    PaymentBatchItem, SubscriptionUpdate, TransactionStatus, TransactionType,
};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::services::{record_billing_run, record_charge, record_error, set_last_run_failure_ratio};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// A `running` batch older than this is treated as abandoned.
    pub stale_run_after: Duration,
    /// Failure ratio above which a completed run raises an alert.
    pub failure_alert_ratio: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stale_run_after: Duration::hours(6),
            failure_alert_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another process holds the run lock.
    LockHeld,
    /// A batch is still marked `running` and is not stale yet.
    BatchRunning { batch_code: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LockHeld => write!(f, "run lock held by another process"),
            SkipReason::BatchRunning { batch_code } => {
                write!(f, "batch {} is still running", batch_code)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(BatchSummary),
    Skipped { reason: SkipReason },
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&BatchSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            RunOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }
}

/// Terminal state of one subscription within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    DryRunSucceeded,
    ChargeSucceeded { settlement_pending: bool },
    ChargeFailed { reason: String },
    GatewayError { message: String },
}

pub struct BillingEngine {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl BillingEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Execute one billing run. Skipped, not queued, when another run is
    /// in progress.
    #[instrument(skip(self), fields(gateway = self.gateway.name()))]
    pub async fn run(&self, dry_run: bool) -> Result<RunOutcome, AppError> {
        let Some(lease) = self.ledger.try_acquire_run_lock().await? else {
            info!(reason = %SkipReason::LockHeld, "Billing run skipped");
            record_billing_run("skipped", dry_run);
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::LockHeld,
            });
        };

        let result = self.run_locked(dry_run).await;

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release run lock");
        }

        match &result {
            Ok(RunOutcome::Completed(_)) => record_billing_run("completed", dry_run),
            Ok(RunOutcome::Skipped { .. }) => record_billing_run("skipped", dry_run),
            Err(e) => {
                error!(error = %e, "Billing run aborted");
                record_billing_run("failed", dry_run);
                record_error(e.kind(), "billing_run");
            }
        }

        result
    }

    async fn run_locked(&self, dry_run: bool) -> Result<RunOutcome, AppError> {
        let now = self.clock.now();

        if let Some(reason) = self.recover_running_batches(now).await? {
            info!(reason = %reason, "Billing run skipped");
            return Ok(RunOutcome::Skipped { reason });
        }

        let blocked = self.unresolved_subscriptions().await?;

        let mut recorder = BatchRecorder::open(self.ledger.clone(), now, dry_run).await?;

        let due: Vec<DueSubscription> = self
            .ledger
            .due_subscriptions(now)
            .await?
            .into_iter()
            .filter(|due| {
                let is_blocked = blocked.contains(&due.subscription_id);
                if is_blocked && !dry_run {
                    warn!(
                        subscription_id = %due.subscription_id,
                        "Skipping subscription with an unresolved pending item"
                    );
                }
                !is_blocked || dry_run
            })
            .collect();

        if due.is_empty() {
            let summary = recorder.finalize(self.clock.now()).await?;
            info!(batch_code = %summary.batch_code, "No subscriptions due");
            return Ok(RunOutcome::Completed(summary));
        }

        recorder.start(self.clock.now()).await?;
        info!(
            batch_id = %recorder.batch_id(),
            due = due.len(),
            dry_run = dry_run,
            "Billing run started"
        );

        for subscription in &due {
            self.process_one(&recorder, subscription).await?;
        }

        let summary = recorder.finalize(self.clock.now()).await?;
        self.report(&summary);

        Ok(RunOutcome::Completed(summary))
    }

    /// Fail stale `running` batches; return a skip reason if a fresh one remains.
    async fn recover_running_batches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<SkipReason>, AppError> {
        for batch in self.ledger.list_running_batches().await? {
            let started = batch.started_at.unwrap_or(batch.created_at);
            if now - started < self.settings.stale_run_after {
                return Ok(Some(SkipReason::BatchRunning {
                    batch_code: batch.batch_code,
                }));
            }

            let message = format!(
                "Abandoned: still running {} hours after start at {}",
                (now - started).num_hours(),
                started.to_rfc3339()
            );
            warn!(
                batch_id = %batch.batch_id,
                batch_code = %batch.batch_code,
                started_at = %started,
                "Marking stale batch as failed"
            );
            self.ledger.fail_batch(batch.batch_id, &message, now).await?;
        }

        Ok(None)
    }

    /// Subscriptions with a `pending` item left by an earlier run.
    async fn unresolved_subscriptions(&self) -> Result<HashSet<Uuid>, AppError> {
        let unresolved = self.ledger.unresolved_items().await?;
        if !unresolved.is_empty() {
            warn!(
                count = unresolved.len(),
                "Unresolved pending batch items need reconciliation"
            );
        }
        Ok(unresolved.into_iter().map(|i| i.subscription_id).collect())
    }

    /// Drive one subscription from `pending` to a terminal state.
    ///
    /// Gateway trouble becomes a failed item; ledger errors propagate.
    #[instrument(
        skip(self, recorder, due),
        fields(batch_id = %recorder.batch_id(), subscription_id = %due.subscription_id, amount = due.price)
    )]
    pub async fn process_one(
        &self,
        recorder: &BatchRecorder,
        due: &DueSubscription,
    ) -> Result<ItemOutcome, AppError> {
        let item = recorder.record_pending(due).await?;

        if recorder.dry_run() {
            recorder.mark_succeeded(item.item_id).await?;
            info!(user_email = %due.user_email, "Dry run: charge skipped");
            return Ok(ItemOutcome::DryRunSucceeded);
        }

        let request = ChargeRequest {
            subscription_id: due.subscription_id,
            user_id: due.user_id,
            customer_email: due.user_email.clone(),
            amount: due.price,
            currency: due.currency.clone(),
            description: format!("{} renewal", due.plan_name),
            idempotency_key: item.item_id.to_string(),
        };

        match self.gateway.charge(&request).await {
            Ok(result) if result.success => self.settle_success(recorder, due, &item, result).await,
            Ok(result) => self.settle_decline(recorder, due, &item, result).await,
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Gateway error, subscription left untouched");
                record_charge("error", &due.currency, due.price);
                recorder.mark_failed(item.item_id, &message).await?;
                Ok(ItemOutcome::GatewayError { message })
            }
        }
    }

    async fn settle_success(
        &self,
        recorder: &BatchRecorder,
        due: &DueSubscription,
        item: &PaymentBatchItem,
        result: ChargeResult,
    ) -> Result<ItemOutcome, AppError> {
        // Money has moved; without a next date the item stays pending for
        // manual reconciliation.
        let next_billing_date = advance_billing_date(
            due.next_billing_date,
            &due.billing_interval,
            due.interval_count,
        )
        .ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Cannot advance billing date of subscription {}",
                due.subscription_id
            ))
        })?;

        let settlement_pending = result.settlement_pending;
        let status = if settlement_pending {
            TransactionStatus::Pending
        } else {
            TransactionStatus::Succeeded
        };

        let settlement = Settlement {
            item_id: item.item_id,
            item_status: BatchItemStatus::Succeeded,
            item_error: None,
            transaction: NewTransaction {
                user_id: due.user_id,
                subscription_id: due.subscription_id,
                batch_item_id: Some(item.item_id),
                transaction_type: TransactionType::Charge,
                amount: due.price,
                currency: due.currency.clone(),
                status,
                external_id: result.transaction_id,
                failure_reason: None,
                gateway_response: Some(result.raw_response),
            },
            subscription_update: SubscriptionUpdate::Advance { next_billing_date },
        };
        let transaction = recorder.settle(&settlement).await?;

        info!(
            transaction_id = %transaction.transaction_id,
            next_billing_date = %next_billing_date,
            settlement_pending = settlement_pending,
            "Charge succeeded"
        );
        record_charge("succeeded", &due.currency, due.price);

        self.notifier.notify(self.notification(
            NotificationKind::PaymentSucceeded,
            recorder,
            due,
            None,
            Some(next_billing_date),
        ));

        Ok(ItemOutcome::ChargeSucceeded { settlement_pending })
    }

    async fn settle_decline(
        &self,
        recorder: &BatchRecorder,
        due: &DueSubscription,
        item: &PaymentBatchItem,
        result: ChargeResult,
    ) -> Result<ItemOutcome, AppError> {
        let reason = result
            .error
            .unwrap_or_else(|| "Payment declined".to_string());

        let settlement = Settlement {
            item_id: item.item_id,
            item_status: BatchItemStatus::Failed,
            item_error: Some(reason.clone()),
            transaction: NewTransaction {
                user_id: due.user_id,
                subscription_id: due.subscription_id,
                batch_item_id: Some(item.item_id),
                transaction_type: TransactionType::Charge,
                amount: due.price,
                currency: due.currency.clone(),
                status: TransactionStatus::Failed,
                external_id: result.transaction_id,
                failure_reason: Some(reason.clone()),
                gateway_response: Some(result.raw_response),
            },
            subscription_update: SubscriptionUpdate::PastDue,
        };
        let transaction = recorder.settle(&settlement).await?;

        warn!(
            transaction_id = %transaction.transaction_id,
            reason = %reason,
            "Charge declined, subscription past due"
        );
        record_charge("declined", &due.currency, due.price);

        self.notifier.notify(self.notification(
            NotificationKind::PaymentFailed,
            recorder,
            due,
            Some(reason.clone()),
            None,
        ));

        Ok(ItemOutcome::ChargeFailed { reason })
    }

    fn notification(
        &self,
        kind: NotificationKind,
        recorder: &BatchRecorder,
        due: &DueSubscription,
        reason: Option<String>,
        next_billing_date: Option<DateTime<Utc>>,
    ) -> Notification {
        Notification {
            kind,
            user_id: due.user_id,
            email: due.user_email.clone(),
            name: due.user_name.clone(),
            subscription_id: due.subscription_id,
            plan_name: due.plan_name.clone(),
            amount: due.price,
            currency: due.currency.clone(),
            batch_code: recorder.batch().batch_code.clone(),
            reason,
            next_billing_date,
        }
    }

    fn report(&self, summary: &BatchSummary) {
        info!(
            batch_id = %summary.batch_id,
            batch_code = %summary.batch_code,
            dry_run = summary.dry_run,
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            amount_processed = summary.amount_processed,
            amount_successful = summary.amount_successful,
            "Billing run completed"
        );

        if summary.dry_run {
            return;
        }

        let ratio = summary.failure_ratio();
        set_last_run_failure_ratio(ratio);

        if ratio > self.settings.failure_alert_ratio {
            warn!(
                alert = true,
                batch_code = %summary.batch_code,
                failure_ratio = ratio,
                threshold = self.settings.failure_alert_ratio,
                failed = summary.failed,
                processed = summary.processed,
                "Billing failure rate above threshold"
            );
        }
    }
}
