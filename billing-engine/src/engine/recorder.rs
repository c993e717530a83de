//! Audit record of a single billing run.

use crate::ledger::{Ledger, Settlement};
use crate::models::{
    generate_batch_code, BatchItemStatus, BatchSummary, DueSubscription, NewBatch, NewBatchItem,
    PaymentBatch, PaymentBatchItem, PaymentTransaction,
};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MAX_CODE_ATTEMPTS: u32 = 5;

/// Owns the `PaymentBatch` of one run and every write made to it.
pub struct BatchRecorder {
    ledger: Arc<dyn Ledger>,
    batch: PaymentBatch,
}

impl BatchRecorder {
    /// Create the batch in `pending` under a fresh code.
    pub async fn open(
        ledger: Arc<dyn Ledger>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Self, AppError> {
        Self::open_with(ledger, now, dry_run, || generate_batch_code(now)).await
    }

    /// As [`BatchRecorder::open`], drawing codes from `next_code` and
    /// drawing again on a code conflict.
    pub async fn open_with<F>(
        ledger: Arc<dyn Ledger>,
        now: DateTime<Utc>,
        dry_run: bool,
        mut next_code: F,
    ) -> Result<Self, AppError>
    where
        F: FnMut() -> String + Send,
    {
        let mut attempt = 1;
        loop {
            let input = NewBatch {
                batch_code: next_code(),
                run_date: now.date_naive(),
                dry_run,
            };

            match ledger.create_batch(&input).await {
                Ok(batch) => {
                    info!(
                        batch_id = %batch.batch_id,
                        batch_code = %batch.batch_code,
                        dry_run = dry_run,
                        "Batch opened"
                    );
                    return Ok(Self { ledger, batch });
                }
                Err(AppError::Conflict(e)) if attempt < MAX_CODE_ATTEMPTS => {
                    warn!(batch_code = %input.batch_code, error = %e, "Batch code collision, regenerating");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn batch(&self) -> &PaymentBatch {
        &self.batch
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch.batch_id
    }

    pub fn dry_run(&self) -> bool {
        self.batch.dry_run
    }

    #[instrument(skip(self), fields(batch_id = %self.batch.batch_id))]
    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.ledger.mark_batch_running(self.batch.batch_id, now).await?;
        self.batch.status = crate::models::BatchStatus::Running.as_str().to_string();
        self.batch.started_at = Some(now);
        Ok(())
    }

    /// Durable `pending` item, written before any gateway call.
    pub async fn record_pending(&self, due: &DueSubscription) -> Result<PaymentBatchItem, AppError> {
        self.ledger
            .create_batch_item(&NewBatchItem {
                batch_id: self.batch.batch_id,
                user_id: due.user_id,
                subscription_id: due.subscription_id,
                amount: due.price,
            })
            .await
    }

    pub async fn mark_succeeded(&self, item_id: Uuid) -> Result<(), AppError> {
        self.ledger
            .finalize_batch_item(item_id, BatchItemStatus::Succeeded, None, None)
            .await
    }

    pub async fn mark_failed(&self, item_id: Uuid, error_message: &str) -> Result<(), AppError> {
        self.ledger
            .finalize_batch_item(item_id, BatchItemStatus::Failed, None, Some(error_message))
            .await
    }

    pub async fn settle(&self, settlement: &Settlement) -> Result<PaymentTransaction, AppError> {
        self.ledger.settle_charge(settlement).await
    }

    /// Recompute totals from persisted items and close the batch.
    #[instrument(skip(self), fields(batch_id = %self.batch.batch_id))]
    pub async fn finalize(self, now: DateTime<Utc>) -> Result<BatchSummary, AppError> {
        let totals = self.ledger.batch_totals(self.batch.batch_id).await?;
        let batch = self
            .ledger
            .complete_batch(self.batch.batch_id, &totals, now)
            .await?;
        Ok(BatchSummary::new(&batch, totals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::BatchStatus;

    #[tokio::test]
    async fn test_code_collision_is_retried_with_new_code() {
        let memory = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        memory
            .create_batch(&NewBatch {
                batch_code: "BATCH-TAKEN".to_string(),
                run_date: now.date_naive(),
                dry_run: false,
            })
            .await
            .unwrap();

        let mut codes = vec!["BATCH-FRESH".to_string(), "BATCH-TAKEN".to_string()];
        let recorder = BatchRecorder::open_with(memory.clone(), now, false, move || {
            codes.pop().unwrap()
        })
        .await
        .unwrap();

        assert_eq!(recorder.batch().batch_code, "BATCH-FRESH");
        assert_eq!(recorder.batch().status(), BatchStatus::Pending);
        assert_eq!(memory.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_collisions() {
        let memory = Arc::new(MemoryLedger::new());
        let now = Utc::now();
        memory
            .create_batch(&NewBatch {
                batch_code: "BATCH-TAKEN".to_string(),
                run_date: now.date_naive(),
                dry_run: false,
            })
            .await
            .unwrap();

        let result =
            BatchRecorder::open_with(memory.clone(), now, false, || "BATCH-TAKEN".to_string())
                .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_finalize_completes_empty_batch() {
        let memory = Arc::new(MemoryLedger::new());
        let recorder = BatchRecorder::open(memory.clone(), Utc::now(), true)
            .await
            .unwrap();

        let summary = recorder.finalize(Utc::now()).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert!(summary.dry_run);

        let batch = memory.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert!(batch.completed_at.is_some());
    }
}
