//! Payment batch model: the audit record of one billing run.

use chrono::{DateTime, NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

const BATCH_CODE_SUFFIX_LEN: usize = 8;

/// Batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "running" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            _ => BatchStatus::Pending,
        }
    }
}

/// Batch item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Pending,
    Succeeded,
    Failed,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchItemStatus::Pending => "pending",
            BatchItemStatus::Succeeded => "succeeded",
            BatchItemStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "succeeded" => BatchItemStatus::Succeeded,
            "failed" => BatchItemStatus::Failed,
            _ => BatchItemStatus::Pending,
        }
    }
}

/// Payment batch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentBatch {
    pub batch_id: Uuid,
    pub batch_code: String,
    pub run_date: NaiveDate,
    pub dry_run: bool,
    pub status: String,
    pub total_processed: i32,
    pub total_successful: i32,
    pub total_failed: i32,
    pub total_amount_processed: i64,
    pub total_amount_successful: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentBatch {
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_string(&self.status)
    }
}

/// Per-subscription entry of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentBatchItem {
    pub item_id: Uuid,
    pub batch_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub amount: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentBatchItem {
    pub fn status(&self) -> BatchItemStatus {
        BatchItemStatus::from_string(&self.status)
    }
}

/// Input for opening a batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_code: String,
    pub run_date: NaiveDate,
    pub dry_run: bool,
}

/// Input for recording a batch item.
#[derive(Debug, Clone)]
pub struct NewBatchItem {
    pub batch_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub amount: i64,
}

/// Aggregates derived from a batch's persisted items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BatchTotals {
    pub processed: i32,
    pub successful: i32,
    pub failed: i32,
    pub amount_processed: i64,
    pub amount_successful: i64,
}

impl BatchTotals {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a PaymentBatchItem>) -> Self {
        items.into_iter().fold(Self::default(), |mut totals, item| {
            totals.processed += 1;
            totals.amount_processed += item.amount;
            match item.status() {
                BatchItemStatus::Succeeded => {
                    totals.successful += 1;
                    totals.amount_successful += item.amount;
                }
                BatchItemStatus::Failed => totals.failed += 1,
                BatchItemStatus::Pending => {}
            }
            totals
        })
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub batch_code: String,
    pub dry_run: bool,
    pub processed: i32,
    pub successful: i32,
    pub failed: i32,
    pub amount_processed: i64,
    pub amount_successful: i64,
}

impl BatchSummary {
    pub fn new(batch: &PaymentBatch, totals: BatchTotals) -> Self {
        Self {
            batch_id: batch.batch_id,
            batch_code: batch.batch_code.clone(),
            dry_run: batch.dry_run,
            processed: totals.processed,
            successful: totals.successful,
            failed: totals.failed,
            amount_processed: totals.amount_processed,
            amount_successful: totals.amount_successful,
        }
    }

    /// Share of processed items that failed, 0.0 for an empty run.
    pub fn failure_ratio(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failed as f64 / self.processed as f64
        }
    }
}

/// Human-readable batch code: `BATCH-<yyyymmddHHMMSS>-<8 alphanumerics>`.
///
/// 62^8 suffixes per second; the unique index on `batch_code` turns the
/// remaining collision chance into a retryable conflict.
pub fn generate_batch_code(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BATCH_CODE_SUFFIX_LEN)
        .map(char::from)
        .collect::<String>()
        .to_uppercase();

    format!("BATCH-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}
