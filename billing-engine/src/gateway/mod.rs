//! Payment gateway contract.
//!
//! Every money movement goes through [`PaymentGateway`]. Business outcomes
//! (declines, refusals) come back as `Ok` results with `success: false`;
//! `Err(GatewayError)` is reserved for infrastructure failures where the
//! gateway's verdict is unknown.

mod http;
mod stub;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use stub::{GatewayCall, StubBehavior, StubGateway};

use crate::models::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Infrastructure failure talking to the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Network(String),

    #[error("gateway timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),

    #[error("gateway not configured: {0}")]
    NotConfigured(String),
}

impl GatewayError {
    /// Errors worth another attempt inside a single gateway call.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout(_) => true,
            GatewayError::Upstream { status, .. } => *status == 429 || *status >= 500,
            GatewayError::MalformedResponse(_) | GatewayError::NotConfigured(_) => false,
        }
    }
}

/// A single renewal charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub customer_email: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub description: String,
    /// Stable per batch item, so a resent request cannot charge twice.
    pub idempotency_key: String,
}

/// Gateway verdict on a charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeResult {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    /// Accepted but not yet settled (e.g. bank transfer); settlement
    /// arrives later as a webhook event.
    #[serde(default)]
    pub settlement_pending: bool,
    pub raw_response: serde_json::Value,
}

impl ChargeResult {
    pub fn approved(transaction_id: impl Into<String>, raw_response: serde_json::Value) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            error: None,
            settlement_pending: false,
            raw_response,
        }
    }

    pub fn declined(
        transaction_id: Option<String>,
        error: impl Into<String>,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            success: false,
            transaction_id,
            error: Some(error.into()),
            settlement_pending: false,
            raw_response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResult {
    pub success: bool,
    pub refund_id: Option<String>,
    pub error: Option<String>,
}

/// Asynchronous notification from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// Gateway transaction id the event refers to, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        self.data
            .get("transaction_id")
            .or_else(|| self.data.get("id"))
            .and_then(|v| v.as_str())
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.data.get("failure_reason").and_then(|v| v.as_str())
    }
}

/// Capability set of a payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short identifier for logs and stored responses.
    fn name(&self) -> &'static str;

    /// Attempt one charge. Returns exactly one outcome.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, GatewayError>;

    async fn cancel_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<CancelResult, GatewayError>;

    /// Refund a gateway transaction, fully when `amount` is `None`.
    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
    ) -> Result<RefundResult, GatewayError>;

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError>;
}

/// Shared webhook body parsing for gateways that send `{type, data}` JSON.
pub(crate) fn parse_json_event(payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
    serde_json::from_slice(payload)
        .map_err(|e| GatewayError::MalformedResponse(format!("invalid webhook payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Network("reset".into()).is_transient());
        assert!(GatewayError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(GatewayError::Upstream {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(GatewayError::Upstream {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Upstream {
            status: 401,
            body: String::new()
        }
        .is_transient());
        assert!(!GatewayError::MalformedResponse("x".into()).is_transient());
    }

    #[test]
    fn test_webhook_event_accessors() {
        let event = parse_json_event(
            br#"{"type":"payment.failed","data":{"transaction_id":"ch_1","failure_reason":"insufficient_funds"}}"#,
        )
        .unwrap();

        assert_eq!(event.event_type, "payment.failed");
        assert_eq!(event.transaction_id(), Some("ch_1"));
        assert_eq!(event.failure_reason(), Some("insufficient_funds"));
    }

    #[test]
    fn test_webhook_event_falls_back_to_id() {
        let event = WebhookEvent {
            event_type: "payment.succeeded".into(),
            data: json!({"id": "ch_2"}),
        };
        assert_eq!(event.transaction_id(), Some("ch_2"));
    }

    #[test]
    fn test_malformed_webhook_is_rejected() {
        assert!(matches!(
            parse_json_event(b"not json"),
            Err(GatewayError::MalformedResponse(_))
        ));
    }
}
