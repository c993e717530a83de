//! Domain models for billing-engine.

mod batch;
mod plan;
mod subscription;
mod transaction;

pub use batch::{
    generate_batch_code, BatchItemStatus, BatchStatus, BatchSummary, BatchTotals, NewBatch,
    NewBatchItem, PaymentBatch, PaymentBatchItem,
};
pub use plan::{advance_billing_date, BillingInterval, CreatePlan, SubscriptionPlan};
pub use subscription::{
    DueSubscription, Subscription, SubscriptionStatus, SubscriptionUpdate, User,
};
pub use transaction::{
    NewTransaction, PaymentTransaction, TransactionStatus, TransactionType,
};
