//! Persistence boundary for subscriptions, transactions and batch records.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use crate::models::{
    BatchItemStatus, BatchTotals, DueSubscription, NewBatch, NewBatchItem, NewTransaction,
    PaymentBatch, PaymentBatchItem, PaymentTransaction, Subscription, SubscriptionPlan,
    SubscriptionStatus, SubscriptionUpdate, TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Held for the duration of one billing run.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<(), AppError>;
}

/// Everything written when a gateway verdict is recorded, applied atomically.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub item_id: Uuid,
    pub item_status: BatchItemStatus,
    pub item_error: Option<String>,
    pub transaction: NewTransaction,
    pub subscription_update: SubscriptionUpdate,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // =========================================================================
    // Run coordination
    // =========================================================================

    /// `None` when another run holds the lock.
    async fn try_acquire_run_lock(&self) -> Result<Option<Box<dyn RunLease>>, AppError>;

    async fn list_running_batches(&self) -> Result<Vec<PaymentBatch>, AppError>;

    // =========================================================================
    // Batches
    // =========================================================================

    /// Fails with `AppError::Conflict` when the batch code is taken.
    async fn create_batch(&self, input: &NewBatch) -> Result<PaymentBatch, AppError>;

    async fn mark_batch_running(
        &self,
        batch_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn complete_batch(
        &self,
        batch_id: Uuid,
        totals: &BatchTotals,
        completed_at: DateTime<Utc>,
    ) -> Result<PaymentBatch, AppError>;

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Counts and sums over the batch's persisted items.
    async fn batch_totals(&self, batch_id: Uuid) -> Result<BatchTotals, AppError>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<PaymentBatch>, AppError>;

    async fn list_batch_items(&self, batch_id: Uuid) -> Result<Vec<PaymentBatchItem>, AppError>;

    /// Items still `pending` in non-dry-run batches.
    async fn unresolved_items(&self) -> Result<Vec<PaymentBatchItem>, AppError>;

    // =========================================================================
    // Batch items
    // =========================================================================

    async fn create_batch_item(&self, input: &NewBatchItem) -> Result<PaymentBatchItem, AppError>;

    async fn get_batch_item(&self, item_id: Uuid) -> Result<Option<PaymentBatchItem>, AppError>;

    /// Only a `pending` item is finalized; any other fails with
    /// `AppError::Conflict`.
    async fn finalize_batch_item(
        &self,
        item_id: Uuid,
        status: BatchItemStatus,
        transaction_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;

    /// Insert the transaction, update the subscription and finalize the
    /// item in one unit. A subscription that is no longer `active` is left
    /// as is. Nothing is written unless the item is still `pending`.
    async fn settle_charge(&self, settlement: &Settlement)
        -> Result<PaymentTransaction, AppError>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Active, dated, non-lifetime subscriptions with `next_billing_date <= now`,
    /// ordered by date then id.
    async fn due_subscriptions(&self, now: DateTime<Utc>)
        -> Result<Vec<DueSubscription>, AppError>;

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SubscriptionPlan>, AppError>;

    async fn update_subscription_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError>;

    // =========================================================================
    // Transactions
    // =========================================================================

    async fn record_transaction(
        &self,
        input: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError>;

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    /// Charge transaction carrying the gateway's id.
    async fn find_charge_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    /// Move a transaction from `expected` to `status`. `None` when it was
    /// not in `expected`.
    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    /// Pending charge settled as failed: the transaction becomes `failed`
    /// and an active subscription `past_due`, together.
    async fn fail_pending_charge(
        &self,
        transaction_id: Uuid,
        failure_reason: &str,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    /// Insert a refund row and mark the original charge `refunded`.
    async fn record_refund(
        &self,
        original_id: Uuid,
        refund: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError>;
}
