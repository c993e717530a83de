//! Payment transaction model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Charge,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Charge => "charge",
            TransactionType::Refund => "refund",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "refund" => TransactionType::Refund,
            _ => TransactionType::Charge,
        }
    }
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "succeeded" => TransactionStatus::Succeeded,
            "failed" => TransactionStatus::Failed,
            "refunded" => TransactionStatus::Refunded,
            _ => TransactionStatus::Pending,
        }
    }
}

/// One gateway attempt. Retries create new rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentTransaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub batch_item_id: Option<Uuid>,
    pub transaction_type: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub external_id: Option<String>,
    pub failure_reason: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_string(&self.transaction_type)
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_string(&self.status)
    }
}

/// Input for recording a transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub batch_item_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub external_id: Option<String>,
    pub failure_reason: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
}
