//! In-process gateway with scripted outcomes.

use super::{
    parse_json_event, CancelResult, ChargeRequest, ChargeResult, GatewayError, PaymentGateway,
    RefundResult, WebhookEvent,
};
use crate::models::Subscription;
use async_trait::async_trait;
use serde_json::json;
use service_core::utils::verify_payload;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// What the stub answers for a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubBehavior {
    Approve,
    /// Accepted, settled later by webhook.
    ApprovePending,
    /// Business decline with the given reason.
    Decline(String),
    /// Infrastructure failure with the given message.
    Fail(String),
}

/// One recorded gateway invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Charge(ChargeRequest),
    Cancel { subscription_id: Uuid },
    Refund { transaction_id: String, amount: Option<i64> },
}

#[derive(Default)]
struct StubState {
    default: Option<StubBehavior>,
    scripted: HashMap<Uuid, StubBehavior>,
    calls: Vec<GatewayCall>,
}

/// Approves everything unless told otherwise.
#[derive(Default)]
pub struct StubGateway {
    state: Mutex<StubState>,
    sequence: AtomicU64,
    webhook_secret: Option<String>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fix the outcome for one subscription.
    pub fn script(&self, subscription_id: Uuid, behavior: StubBehavior) {
        self.state().scripted.insert(subscription_id, behavior);
    }

    /// Outcome for subscriptions without a script.
    pub fn set_default(&self, behavior: StubBehavior) {
        self.state().default = Some(behavior);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Charge(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn charge_count_for(&self, subscription_id: Uuid) -> usize {
        self.charges()
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .count()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_stub_{:06}", prefix, n)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, GatewayError> {
        let behavior = {
            let mut state = self.state();
            state.calls.push(GatewayCall::Charge(request.clone()));
            state
                .scripted
                .get(&request.subscription_id)
                .or(state.default.as_ref())
                .cloned()
                .unwrap_or(StubBehavior::Approve)
        };

        let id = self.next_id("ch");
        let raw = |status: &str| {
            json!({
                "id": id,
                "status": status,
                "amount": request.amount,
                "currency": request.currency,
                "gateway": "stub",
            })
        };

        match behavior {
            StubBehavior::Approve => Ok(ChargeResult::approved(id.clone(), raw("succeeded"))),
            StubBehavior::ApprovePending => {
                let mut result = ChargeResult::approved(id.clone(), raw("pending"));
                result.settlement_pending = true;
                Ok(result)
            }
            StubBehavior::Decline(reason) => {
                let mut response = raw("failed");
                response["failure_reason"] = json!(reason);
                Ok(ChargeResult::declined(Some(id.clone()), reason, response))
            }
            StubBehavior::Fail(message) => Err(GatewayError::Network(message)),
        }
    }

    async fn cancel_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<CancelResult, GatewayError> {
        self.state().calls.push(GatewayCall::Cancel {
            subscription_id: subscription.subscription_id,
        });
        Ok(CancelResult {
            success: true,
            error: None,
        })
    }

    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
    ) -> Result<RefundResult, GatewayError> {
        self.state().calls.push(GatewayCall::Refund {
            transaction_id: transaction_id.to_string(),
            amount,
        });
        Ok(RefundResult {
            success: true,
            refund_id: Some(self.next_id("re")),
            error: None,
        })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        match &self.webhook_secret {
            Some(secret) => verify_payload(secret, payload, signature).unwrap_or(false),
            None => false,
        }
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
        parse_json_event(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(subscription_id: Uuid) -> ChargeRequest {
        ChargeRequest {
            subscription_id,
            user_id: Uuid::new_v4(),
            customer_email: "angler@example.com".to_string(),
            amount: 1500,
            currency: "USD".to_string(),
            description: "renewal".to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripts_take_precedence_over_default() {
        let gateway = StubGateway::new();
        let declined = Uuid::new_v4();
        let broken = Uuid::new_v4();
        gateway.script(declined, StubBehavior::Decline("insufficient_funds".into()));
        gateway.script(broken, StubBehavior::Fail("connection reset".into()));

        let ok = gateway.charge(&request(Uuid::new_v4())).await.unwrap();
        assert!(ok.success);
        assert!(ok.transaction_id.is_some());

        let decline = gateway.charge(&request(declined)).await.unwrap();
        assert!(!decline.success);
        assert_eq!(decline.error.as_deref(), Some("insufficient_funds"));

        assert!(gateway.charge(&request(broken)).await.is_err());
        assert_eq!(gateway.charges().len(), 3);
        assert_eq!(gateway.charge_count_for(declined), 1);
    }

    #[tokio::test]
    async fn test_default_behavior_applies_to_unscripted() {
        let gateway = StubGateway::new();
        gateway.set_default(StubBehavior::ApprovePending);

        let result = gateway.charge(&request(Uuid::new_v4())).await.unwrap();
        assert!(result.success);
        assert!(result.settlement_pending);
    }

    #[test]
    fn test_webhooks_rejected_without_secret() {
        let gateway = StubGateway::new();
        assert!(!gateway.verify_webhook_signature(b"{}", "anything"));
    }
}
