//! In-process ledger for tests and local dry runs.

use super::{Ledger, RunLease, Settlement};
use crate::models::{
    BatchItemStatus, BatchStatus, BatchTotals, CreatePlan, DueSubscription, NewBatch,
    NewBatchItem, NewTransaction, PaymentBatch, PaymentBatchItem, PaymentTransaction,
    Subscription, SubscriptionPlan, SubscriptionStatus, SubscriptionUpdate, TransactionStatus,
    TransactionType, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    plans: HashMap<Uuid, SubscriptionPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    batches: Vec<PaymentBatch>,
    items: Vec<PaymentBatchItem>,
    transactions: Vec<PaymentTransaction>,
}

#[derive(Default)]
struct Faults {
    batch_writes: AtomicBool,
    item_writes: AtomicBool,
    settlements: AtomicBool,
}

/// Mutex-guarded tables with a process-wide run flag.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    run_flag: Arc<AtomicBool>,
    faults: Faults,
}

struct MemoryRunLease {
    flag: Arc<AtomicBool>,
}

impl Drop for MemoryRunLease {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunLease for MemoryRunLease {
    async fn release(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}

fn injected(what: &str) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Injected failure: {}", what))
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn insert_user(&self, email: &str, name: Option<&str>) -> User {
        let user = User {
            user_id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
        };
        self.state().users.insert(user.user_id, user.clone());
        user
    }

    pub fn insert_plan(&self, input: &CreatePlan) -> SubscriptionPlan {
        let now = Utc::now();
        let plan = SubscriptionPlan {
            plan_id: Uuid::new_v4(),
            name: input.name.clone(),
            price: input.price,
            currency: input.currency.clone(),
            billing_interval: input.billing_interval.as_str().to_string(),
            interval_count: input.interval_count,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.state().plans.insert(plan.plan_id, plan.clone());
        plan
    }

    pub fn insert_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
        next_billing_date: Option<DateTime<Utc>>,
    ) -> Subscription {
        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            user_id,
            plan_id,
            status: status.as_str().to_string(),
            next_billing_date,
            ends_at: next_billing_date,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state()
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        subscription
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.state().subscriptions.get(&subscription_id).cloned()
    }

    pub fn batches(&self) -> Vec<PaymentBatch> {
        self.state().batches.clone()
    }

    pub fn items_for_subscription(&self, subscription_id: Uuid) -> Vec<PaymentBatchItem> {
        self.state()
            .items
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn transactions(&self) -> Vec<PaymentTransaction> {
        self.state().transactions.clone()
    }

    pub fn transactions_for(&self, subscription_id: Uuid) -> Vec<PaymentTransaction> {
        self.state()
            .transactions
            .iter()
            .filter(|t| t.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn is_run_locked(&self) -> bool {
        self.run_flag.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Batch create/update calls fail while set.
    pub fn fail_batch_writes(&self, fail: bool) {
        self.faults.batch_writes.store(fail, Ordering::SeqCst);
    }

    /// Batch item create/finalize calls fail while set.
    pub fn fail_item_writes(&self, fail: bool) {
        self.faults.item_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_settlements(&self, fail: bool) {
        self.faults.settlements.store(fail, Ordering::SeqCst);
    }

    fn check(&self, fault: &AtomicBool, what: &str) -> Result<(), AppError> {
        if fault.load(Ordering::SeqCst) {
            Err(injected(what))
        } else {
            Ok(())
        }
    }
}

impl MemoryState {
    fn batch_mut(&mut self, batch_id: Uuid) -> Result<&mut PaymentBatch, AppError> {
        self.batches
            .iter_mut()
            .find(|b| b.batch_id == batch_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))
    }

    fn item_mut(&mut self, item_id: Uuid) -> Result<&mut PaymentBatchItem, AppError> {
        self.items
            .iter_mut()
            .find(|i| i.item_id == item_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch item {} not found", item_id)))
    }

    fn pending_item_mut(&mut self, item_id: Uuid) -> Result<&mut PaymentBatchItem, AppError> {
        let item = self.item_mut(item_id)?;
        if item.status() != BatchItemStatus::Pending {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Batch item {} is already {}",
                item_id,
                item.status
            )));
        }
        Ok(item)
    }

    fn transaction_mut(&mut self, transaction_id: Uuid) -> Option<&mut PaymentTransaction> {
        self.transactions
            .iter_mut()
            .find(|t| t.transaction_id == transaction_id)
    }

    fn insert_transaction(&mut self, input: &NewTransaction) -> PaymentTransaction {
        let now = Utc::now();
        let transaction = PaymentTransaction {
            transaction_id: Uuid::new_v4(),
            user_id: input.user_id,
            subscription_id: input.subscription_id,
            batch_item_id: input.batch_item_id,
            transaction_type: input.transaction_type.as_str().to_string(),
            amount: input.amount,
            currency: input.currency.clone(),
            status: input.status.as_str().to_string(),
            external_id: input.external_id.clone(),
            failure_reason: input.failure_reason.clone(),
            gateway_response: input.gateway_response.clone(),
            created_at: now,
            updated_at: now,
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn apply_update(&mut self, subscription_id: Uuid, update: SubscriptionUpdate) {
        let Some(subscription) = self.subscriptions.get_mut(&subscription_id) else {
            return;
        };
        if subscription.status() != SubscriptionStatus::Active {
            return;
        }
        match update {
            SubscriptionUpdate::Advance { next_billing_date } => {
                subscription.next_billing_date = Some(next_billing_date);
                subscription.ends_at = Some(next_billing_date);
            }
            SubscriptionUpdate::PastDue => {
                subscription.status = SubscriptionStatus::PastDue.as_str().to_string();
            }
        }
        subscription.updated_at = Utc::now();
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn try_acquire_run_lock(&self) -> Result<Option<Box<dyn RunLease>>, AppError> {
        if self
            .run_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Some(Box::new(MemoryRunLease {
                flag: self.run_flag.clone(),
            })))
        } else {
            Ok(None)
        }
    }

    async fn list_running_batches(&self) -> Result<Vec<PaymentBatch>, AppError> {
        Ok(self
            .state()
            .batches
            .iter()
            .filter(|b| b.status() == BatchStatus::Running)
            .cloned()
            .collect())
    }

    async fn create_batch(&self, input: &NewBatch) -> Result<PaymentBatch, AppError> {
        self.check(&self.faults.batch_writes, "create_batch")?;
        let mut state = self.state();
        if state.batches.iter().any(|b| b.batch_code == input.batch_code) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Batch code {} already exists",
                input.batch_code
            )));
        }

        let batch = PaymentBatch {
            batch_id: Uuid::new_v4(),
            batch_code: input.batch_code.clone(),
            run_date: input.run_date,
            dry_run: input.dry_run,
            status: BatchStatus::Pending.as_str().to_string(),
            total_processed: 0,
            total_successful: 0,
            total_failed: 0,
            total_amount_processed: 0,
            total_amount_successful: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: Utc::now(),
        };
        state.batches.push(batch.clone());
        Ok(batch)
    }

    async fn mark_batch_running(
        &self,
        batch_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.check(&self.faults.batch_writes, "mark_batch_running")?;
        let mut state = self.state();
        let batch = state.batch_mut(batch_id)?;
        batch.status = BatchStatus::Running.as_str().to_string();
        batch.started_at = Some(started_at);
        Ok(())
    }

    async fn complete_batch(
        &self,
        batch_id: Uuid,
        totals: &BatchTotals,
        completed_at: DateTime<Utc>,
    ) -> Result<PaymentBatch, AppError> {
        self.check(&self.faults.batch_writes, "complete_batch")?;
        let mut state = self.state();
        let batch = state.batch_mut(batch_id)?;
        batch.status = BatchStatus::Completed.as_str().to_string();
        batch.total_processed = totals.processed;
        batch.total_successful = totals.successful;
        batch.total_failed = totals.failed;
        batch.total_amount_processed = totals.amount_processed;
        batch.total_amount_successful = totals.amount_successful;
        batch.completed_at = Some(completed_at);
        Ok(batch.clone())
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.check(&self.faults.batch_writes, "fail_batch")?;
        let mut state = self.state();
        let batch = state.batch_mut(batch_id)?;
        batch.status = BatchStatus::Failed.as_str().to_string();
        batch.error_message = Some(error_message.to_string());
        batch.completed_at = Some(completed_at);
        Ok(())
    }

    async fn batch_totals(&self, batch_id: Uuid) -> Result<BatchTotals, AppError> {
        let state = self.state();
        Ok(BatchTotals::from_items(
            state.items.iter().filter(|i| i.batch_id == batch_id),
        ))
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<PaymentBatch>, AppError> {
        Ok(self
            .state()
            .batches
            .iter()
            .find(|b| b.batch_id == batch_id)
            .cloned())
    }

    async fn list_batch_items(&self, batch_id: Uuid) -> Result<Vec<PaymentBatchItem>, AppError> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn unresolved_items(&self) -> Result<Vec<PaymentBatchItem>, AppError> {
        let state = self.state();
        Ok(state
            .items
            .iter()
            .filter(|i| i.status() == BatchItemStatus::Pending)
            .filter(|i| {
                state
                    .batches
                    .iter()
                    .any(|b| b.batch_id == i.batch_id && !b.dry_run)
            })
            .cloned()
            .collect())
    }

    async fn create_batch_item(&self, input: &NewBatchItem) -> Result<PaymentBatchItem, AppError> {
        self.check(&self.faults.item_writes, "create_batch_item")?;
        let mut state = self.state();
        if state
            .items
            .iter()
            .any(|i| i.batch_id == input.batch_id && i.subscription_id == input.subscription_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} already has an item in batch {}",
                input.subscription_id,
                input.batch_id
            )));
        }

        let now = Utc::now();
        let item = PaymentBatchItem {
            item_id: Uuid::new_v4(),
            batch_id: input.batch_id,
            user_id: input.user_id,
            subscription_id: input.subscription_id,
            transaction_id: None,
            amount: input.amount,
            status: BatchItemStatus::Pending.as_str().to_string(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.items.push(item.clone());
        Ok(item)
    }

    async fn get_batch_item(&self, item_id: Uuid) -> Result<Option<PaymentBatchItem>, AppError> {
        Ok(self
            .state()
            .items
            .iter()
            .find(|i| i.item_id == item_id)
            .cloned())
    }

    async fn finalize_batch_item(
        &self,
        item_id: Uuid,
        status: BatchItemStatus,
        transaction_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        self.check(&self.faults.item_writes, "finalize_batch_item")?;
        let mut state = self.state();
        let item = state.pending_item_mut(item_id)?;
        item.status = status.as_str().to_string();
        item.transaction_id = transaction_id.or(item.transaction_id);
        item.error_message = error_message.map(str::to_string);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn settle_charge(
        &self,
        settlement: &Settlement,
    ) -> Result<PaymentTransaction, AppError> {
        self.check(&self.faults.settlements, "settle_charge")?;
        let mut state = self.state();
        // Check the item first so a missing or settled one leaves nothing behind.
        state.pending_item_mut(settlement.item_id)?;

        let transaction = state.insert_transaction(&settlement.transaction);
        state.apply_update(
            settlement.transaction.subscription_id,
            settlement.subscription_update,
        );

        let item = state.item_mut(settlement.item_id)?;
        item.status = settlement.item_status.as_str().to_string();
        item.transaction_id = Some(transaction.transaction_id);
        item.error_message = settlement.item_error.clone();
        item.updated_at = Utc::now();

        Ok(transaction)
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueSubscription>, AppError> {
        let state = self.state();
        let mut due: Vec<DueSubscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status() == SubscriptionStatus::Active)
            .filter_map(|s| {
                let next_billing_date = s.next_billing_date.filter(|d| *d <= now)?;
                let plan = state.plans.get(&s.plan_id).filter(|p| !p.is_lifetime())?;
                let user = state.users.get(&s.user_id)?;
                Some(DueSubscription {
                    subscription_id: s.subscription_id,
                    user_id: user.user_id,
                    user_email: user.email.clone(),
                    user_name: user.name.clone(),
                    plan_id: plan.plan_id,
                    plan_name: plan.name.clone(),
                    price: plan.price,
                    currency: plan.currency.clone(),
                    billing_interval: plan.billing_interval.clone(),
                    interval_count: plan.interval_count,
                    next_billing_date,
                })
            })
            .collect();

        due.sort_by_key(|d| (d.next_billing_date, d.subscription_id));
        Ok(due)
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.subscription(subscription_id))
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SubscriptionPlan>, AppError> {
        Ok(self.state().plans.get(&plan_id).cloned())
    }

    async fn update_subscription_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state();
        let subscription = state.subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Subscription {} not found", subscription_id))
        })?;
        subscription.status = status.as_str().to_string();
        if cancelled_at.is_some() {
            subscription.cancelled_at = cancelled_at;
        }
        subscription.updated_at = Utc::now();
        Ok(subscription.clone())
    }

    async fn record_transaction(
        &self,
        input: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError> {
        Ok(self.state().insert_transaction(input))
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        Ok(self
            .state()
            .transactions
            .iter()
            .find(|t| t.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_charge_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        Ok(self
            .state()
            .transactions
            .iter()
            .find(|t| {
                t.transaction_type() == TransactionType::Charge
                    && t.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let mut state = self.state();
        let Some(transaction) = state.transaction_mut(transaction_id) else {
            return Ok(None);
        };
        if transaction.status() != expected {
            return Ok(None);
        }
        transaction.status = status.as_str().to_string();
        if let Some(reason) = failure_reason {
            transaction.failure_reason = Some(reason.to_string());
        }
        transaction.updated_at = Utc::now();
        Ok(Some(transaction.clone()))
    }

    async fn fail_pending_charge(
        &self,
        transaction_id: Uuid,
        failure_reason: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let mut state = self.state();
        let Some(transaction) = state.transaction_mut(transaction_id) else {
            return Ok(None);
        };
        if transaction.status() != TransactionStatus::Pending {
            return Ok(None);
        }
        transaction.status = TransactionStatus::Failed.as_str().to_string();
        transaction.failure_reason = Some(failure_reason.to_string());
        transaction.updated_at = Utc::now();
        let transaction = transaction.clone();

        state.apply_update(transaction.subscription_id, SubscriptionUpdate::PastDue);
        Ok(Some(transaction))
    }

    async fn record_refund(
        &self,
        original_id: Uuid,
        refund: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError> {
        let mut state = self.state();
        let original = state.transaction_mut(original_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Transaction {} not found", original_id))
        })?;
        if original.status() != TransactionStatus::Succeeded {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} is {}, not succeeded",
                original_id,
                original.status
            )));
        }
        original.status = TransactionStatus::Refunded.as_str().to_string();
        original.updated_at = Utc::now();

        Ok(state.insert_transaction(refund))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BillingInterval;
    use chrono::{Duration, TimeZone};

    fn plan(interval: BillingInterval) -> CreatePlan {
        CreatePlan {
            name: "Pro".to_string(),
            price: 1000,
            currency: "USD".to_string(),
            billing_interval: interval,
            interval_count: 1,
        }
    }

    #[tokio::test]
    async fn test_due_selection_filters_and_orders() {
        let ledger = MemoryLedger::new();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap();
        let user = ledger.insert_user("a@example.com", None);
        let monthly = ledger.insert_plan(&plan(BillingInterval::Month));
        let lifetime = ledger.insert_plan(&plan(BillingInterval::Lifetime));

        let later = ledger.insert_subscription(
            user.user_id,
            monthly.plan_id,
            SubscriptionStatus::Active,
            Some(now - Duration::hours(1)),
        );
        let earlier = ledger.insert_subscription(
            user.user_id,
            monthly.plan_id,
            SubscriptionStatus::Active,
            Some(now - Duration::days(2)),
        );
        ledger.insert_subscription(
            user.user_id,
            monthly.plan_id,
            SubscriptionStatus::Active,
            Some(now + Duration::hours(1)),
        );
        ledger.insert_subscription(
            user.user_id,
            monthly.plan_id,
            SubscriptionStatus::PastDue,
            Some(now - Duration::days(1)),
        );
        ledger.insert_subscription(
            user.user_id,
            lifetime.plan_id,
            SubscriptionStatus::Active,
            Some(now - Duration::days(1)),
        );

        let due = ledger.due_subscriptions(now).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|d| d.subscription_id).collect();
        assert_eq!(ids, vec![earlier.subscription_id, later.subscription_id]);
    }

    #[tokio::test]
    async fn test_run_lock_is_exclusive_until_dropped() {
        let ledger = MemoryLedger::new();
        let lease = ledger.try_acquire_run_lock().await.unwrap();
        assert!(lease.is_some());
        assert!(ledger.try_acquire_run_lock().await.unwrap().is_none());

        lease.unwrap().release().await.unwrap();
        assert!(!ledger.is_run_locked());
        assert!(ledger.try_acquire_run_lock().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_batch_code_conflicts() {
        let ledger = MemoryLedger::new();
        let input = NewBatch {
            batch_code: "BATCH-20250301030000-AAAAAAAA".to_string(),
            run_date: Utc::now().date_naive(),
            dry_run: false,
        };
        ledger.create_batch(&input).await.unwrap();
        assert!(matches!(
            ledger.create_batch(&input).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_only_pending_items_are_finalized() {
        let ledger = MemoryLedger::new();
        let user = ledger.insert_user("a@example.com", None);
        let monthly = ledger.insert_plan(&plan(BillingInterval::Month));
        let subscription = ledger.insert_subscription(
            user.user_id,
            monthly.plan_id,
            SubscriptionStatus::Active,
            None,
        );
        let batch = ledger
            .create_batch(&NewBatch {
                batch_code: "BATCH-20250301030000-BBBBBBBB".to_string(),
                run_date: Utc::now().date_naive(),
                dry_run: false,
            })
            .await
            .unwrap();
        let item = ledger
            .create_batch_item(&NewBatchItem {
                batch_id: batch.batch_id,
                user_id: user.user_id,
                subscription_id: subscription.subscription_id,
                amount: 1000,
            })
            .await
            .unwrap();

        ledger
            .finalize_batch_item(item.item_id, BatchItemStatus::Succeeded, None, None)
            .await
            .unwrap();
        let again = ledger
            .finalize_batch_item(item.item_id, BatchItemStatus::Failed, None, Some("late"))
            .await;
        assert!(matches!(again, Err(AppError::Conflict(_))));

        let stored = ledger.get_batch_item(item.item_id).await.unwrap().unwrap();
        assert_eq!(stored.status(), BatchItemStatus::Succeeded);
        assert!(stored.error_message.is_none());
    }
}
