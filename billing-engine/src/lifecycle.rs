//! Subscription and payment operations outside the daily run.

use crate::clock::Clock;
use crate::gateway::PaymentGateway;
use crate::ledger::{Ledger, Settlement};
use crate::models::{
    advance_billing_date, BatchItemStatus, NewTransaction, PaymentTransaction, Subscription,
    SubscriptionStatus, SubscriptionUpdate, TransactionStatus, TransactionType,
};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What `apply_webhook` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
    Ignored {
        reason: String,
    },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

/// Operator verdict on a batch item an interrupted run left `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResolution {
    /// The gateway captured the charge under `external_id`.
    Charged { external_id: String },
    /// No money moved.
    NotCharged,
}

pub struct LifecycleService {
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl LifecycleService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            clock,
        }
    }

    async fn subscription(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        self.ledger
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Subscription {} not found", subscription_id))
            })
    }

    /// Cancel at the gateway, then locally. Access continues until `ends_at`.
    #[instrument(skip(self))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Subscription, AppError> {
        let subscription = self.subscription(subscription_id).await?;
        if subscription.status().is_terminal() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} is already {}",
                subscription_id,
                subscription.status
            )));
        }

        let result = self
            .gateway
            .cancel_subscription(&subscription)
            .await
            .map_err(|e| AppError::BadGateway(e.to_string()))?;
        if !result.success {
            return Err(AppError::BadGateway(
                result
                    .error
                    .unwrap_or_else(|| "Gateway refused cancellation".to_string()),
            ));
        }

        let cancelled = self
            .ledger
            .update_subscription_status(
                subscription_id,
                SubscriptionStatus::Cancelled,
                Some(self.clock.now()),
            )
            .await?;

        info!(ends_at = ?cancelled.ends_at, "Subscription cancelled");
        Ok(cancelled)
    }

    /// Make a `past_due` subscription eligible for the next run again.
    #[instrument(skip(self))]
    pub async fn reactivate(&self, subscription_id: Uuid) -> Result<Subscription, AppError> {
        let subscription = self.subscription(subscription_id).await?;
        if subscription.status() != SubscriptionStatus::PastDue {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only past_due subscriptions can be reactivated, {} is {}",
                subscription_id,
                subscription.status
            )));
        }

        let active = self
            .ledger
            .update_subscription_status(subscription_id, SubscriptionStatus::Active, None)
            .await?;
        info!("Subscription reactivated");
        Ok(active)
    }

    /// Refund a succeeded charge, fully when `amount` is `None`.
    #[instrument(skip(self))]
    pub async fn refund_payment(
        &self,
        transaction_id: Uuid,
        amount: Option<i64>,
    ) -> Result<PaymentTransaction, AppError> {
        let original = self
            .ledger
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id))
            })?;

        if original.transaction_type() != TransactionType::Charge
            || original.status() != TransactionStatus::Succeeded
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only succeeded charges can be refunded, {} is a {} {}",
                transaction_id,
                original.status,
                original.transaction_type
            )));
        }

        let refund_amount = amount.unwrap_or(original.amount);
        if refund_amount <= 0 || refund_amount > original.amount {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Refund amount {} must be between 1 and {}",
                refund_amount,
                original.amount
            )));
        }

        let external_id = original.external_id.as_deref().ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "Transaction {} has no gateway reference",
                transaction_id
            ))
        })?;

        let partial = (refund_amount < original.amount).then_some(refund_amount);
        let result = self
            .gateway
            .refund_payment(external_id, partial)
            .await
            .map_err(|e| AppError::BadGateway(e.to_string()))?;
        if !result.success {
            return Err(AppError::BadGateway(
                result
                    .error
                    .unwrap_or_else(|| "Gateway refused refund".to_string()),
            ));
        }

        let refund = self
            .ledger
            .record_refund(
                original.transaction_id,
                &NewTransaction {
                    user_id: original.user_id,
                    subscription_id: original.subscription_id,
                    batch_item_id: None,
                    transaction_type: TransactionType::Refund,
                    amount: refund_amount,
                    currency: original.currency.clone(),
                    status: TransactionStatus::Succeeded,
                    external_id: result.refund_id.clone(),
                    failure_reason: None,
                    gateway_response: Some(json!({
                        "refund_id": result.refund_id,
                        "original_external_id": external_id,
                        "amount": refund_amount,
                    })),
                },
            )
            .await?;

        info!(refund_id = %refund.transaction_id, amount = refund_amount, "Payment refunded");
        Ok(refund)
    }

    /// Close out an item an interrupted run left `pending`, after the
    /// operator has checked the gateway.
    ///
    /// A captured charge is settled the way the run would have settled it:
    /// the charge is recorded and the subscription advanced, so the next
    /// run does not bill the same period again.
    #[instrument(skip(self, note))]
    pub async fn resolve_pending_item(
        &self,
        item_id: Uuid,
        resolution: ItemResolution,
        note: &str,
    ) -> Result<(), AppError> {
        let item = self.ledger.get_batch_item(item_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Batch item {} not found", item_id))
        })?;
        if item.status() != BatchItemStatus::Pending {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Batch item {} is already {}",
                item_id,
                item.status
            )));
        }

        let message = format!("Resolved manually: {}", note);
        let external_id = match resolution {
            ItemResolution::NotCharged => {
                self.ledger
                    .finalize_batch_item(item_id, BatchItemStatus::Failed, None, Some(&message))
                    .await?;
                info!("Pending batch item resolved as not charged");
                return Ok(());
            }
            ItemResolution::Charged { external_id } => external_id,
        };

        if external_id.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "A charged item needs the gateway transaction id"
            )));
        }

        let subscription = self.subscription(item.subscription_id).await?;
        let plan = self
            .ledger
            .get_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Plan {} not found", subscription.plan_id))
            })?;

        // The failed settlement never moved the date, so the charge covers
        // the period starting at the stored one.
        let next_billing_date = subscription
            .next_billing_date
            .and_then(|from| {
                advance_billing_date(from, &plan.billing_interval, plan.interval_count)
            })
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "Cannot advance billing date of subscription {}",
                    subscription.subscription_id
                ))
            })?;

        let transaction = self
            .ledger
            .settle_charge(&Settlement {
                item_id,
                item_status: BatchItemStatus::Succeeded,
                item_error: Some(message),
                transaction: NewTransaction {
                    user_id: item.user_id,
                    subscription_id: item.subscription_id,
                    batch_item_id: Some(item_id),
                    transaction_type: TransactionType::Charge,
                    amount: item.amount,
                    currency: plan.currency.clone(),
                    status: TransactionStatus::Succeeded,
                    external_id: Some(external_id.clone()),
                    failure_reason: None,
                    gateway_response: Some(json!({
                        "resolved_manually": true,
                        "transaction_id": external_id,
                        "note": note,
                    })),
                },
                subscription_update: SubscriptionUpdate::Advance { next_billing_date },
            })
            .await?;

        info!(
            transaction_id = %transaction.transaction_id,
            next_billing_date = %next_billing_date,
            "Pending batch item resolved as charged"
        );
        Ok(())
    }

    /// Verify, parse and apply an asynchronous settlement event.
    #[instrument(skip(self, payload, signature))]
    pub async fn apply_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, AppError> {
        if !self.gateway.verify_webhook_signature(payload, signature) {
            warn!("Webhook signature verification failed");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )));
        }

        let event = self
            .gateway
            .parse_webhook_event(payload)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

        let (expected, status) = match event.event_type.as_str() {
            "payment.succeeded" => (TransactionStatus::Pending, TransactionStatus::Succeeded),
            "payment.failed" => (TransactionStatus::Pending, TransactionStatus::Failed),
            "payment.refunded" => (TransactionStatus::Succeeded, TransactionStatus::Refunded),
            other => {
                info!(event_type = other, "Ignoring unhandled webhook event");
                return Ok(WebhookOutcome::ignored(format!("unhandled event type {}", other)));
            }
        };

        let external_id = event.transaction_id().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "{} event without transaction id",
                event.event_type
            ))
        })?;

        let Some(transaction) = self.ledger.find_charge_by_external_id(external_id).await? else {
            warn!(external_id = external_id, "Webhook for unknown transaction");
            return Ok(WebhookOutcome::ignored("unknown transaction"));
        };

        let updated = if status == TransactionStatus::Failed {
            let reason = event.failure_reason().unwrap_or("Payment failed");
            self.ledger
                .fail_pending_charge(transaction.transaction_id, reason)
                .await?
        } else {
            self.ledger
                .update_transaction_status(transaction.transaction_id, expected, status, None)
                .await?
        };

        match updated {
            Some(tx) => {
                info!(
                    transaction_id = %tx.transaction_id,
                    event_type = %event.event_type,
                    status = status.as_str(),
                    "Webhook applied"
                );
                Ok(WebhookOutcome::Applied {
                    transaction_id: tx.transaction_id,
                    status,
                })
            }
            None => Ok(WebhookOutcome::ignored(format!(
                "transaction is {}, expected {}",
                transaction.status,
                expected.as_str()
            ))),
        }
    }
}
