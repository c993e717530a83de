//! JSON-over-HTTP payment processor client.
//!
//! Charges are sent with the batch item id as `Idempotency-Key`, so the
//! bounded network retries below can never produce a second charge.

use super::{
    parse_json_event, CancelResult, ChargeRequest, ChargeResult, GatewayError, PaymentGateway,
    RefundResult, WebhookEvent,
};
use crate::models::Subscription;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde_json::{json, Value};
use service_core::retry::{retry_with_backoff, RetryConfig};
use service_core::utils::verify_payload;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Connection settings for [`HttpGateway`].
#[derive(Clone, Debug)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub timeout: Duration,
    pub max_network_retries: u32,
}

/// Status and decoded body of a non-retryable reply.
struct Reply {
    status: StatusCode,
    body: Value,
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
    retry: RetryConfig,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        if config.base_url.trim().is_empty() {
            return Err(GatewayError::NotConfigured("base URL is empty".to_string()));
        }
        if config.api_key.expose_secret().is_empty() {
            return Err(GatewayError::NotConfigured("API key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::NotConfigured(format!("HTTP client: {}", e)))?;

        let retry = RetryConfig {
            max_retries: config.max_network_retries,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        };

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// One POST. Transport failures, 429 and 5xx come back as errors so the
    /// retry loop can see them; every other status is a reply.
    async fn post_once(
        &self,
        url: &str,
        idempotency_key: &str,
        body: &Value,
    ) -> Result<Reply, GatewayError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.config.api_key.expose_secret())
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        debug!(status = %status, url = %url, "Gateway response");

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                GatewayError::MalformedResponse(format!("status {}: {}", status, e))
            })?
        };

        Ok(Reply { status, body })
    }

    async fn post(
        &self,
        operation: &str,
        path: &str,
        idempotency_key: &str,
        body: Value,
    ) -> Result<Reply, GatewayError> {
        let url = self.url(path);
        let reply = retry_with_backoff(&self.retry, operation, GatewayError::is_transient, || {
            self.post_once(&url, idempotency_key, &body)
        })
        .await?;

        // Credentials problems are ours, not the customer's.
        if reply.status == StatusCode::UNAUTHORIZED || reply.status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Upstream {
                status: reply.status.as_u16(),
                body: reply.body.to_string(),
            });
        }

        Ok(reply)
    }

    fn transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.config.timeout)
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

/// Best-effort human-readable reason from an error body.
fn error_message(body: &Value, status: StatusCode) -> String {
    body.pointer("/error/message")
        .or_else(|| body.get("failure_reason"))
        .or_else(|| body.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

fn string_field(body: &Value, field: &str) -> Option<String> {
    body.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, request), fields(subscription_id = %request.subscription_id, amount = request.amount))]
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, GatewayError> {
        let body = json!({
            "amount": request.amount,
            "currency": request.currency,
            "customer_email": request.customer_email,
            "description": request.description,
            "metadata": {
                "subscription_id": request.subscription_id,
                "user_id": request.user_id,
            }
        });

        let reply = self
            .post("gateway_charge", "/charges", &request.idempotency_key, body)
            .await?;

        if !reply.status.is_success() {
            let reason = error_message(&reply.body, reply.status);
            info!(status = %reply.status, reason = %reason, "Charge declined");
            return Ok(ChargeResult::declined(
                string_field(&reply.body, "id"),
                reason,
                reply.body,
            ));
        }

        let transaction_id = string_field(&reply.body, "id").ok_or_else(|| {
            GatewayError::MalformedResponse("charge response without id".to_string())
        })?;

        let status = string_field(&reply.body, "status");
        match status.as_deref() {
            Some("succeeded") | Some("paid") => Ok(ChargeResult::approved(transaction_id, reply.body)),
            Some("pending") | Some("processing") => {
                let mut result = ChargeResult::approved(transaction_id, reply.body);
                result.settlement_pending = true;
                Ok(result)
            }
            Some("failed") | Some("declined") => {
                let reason = string_field(&reply.body, "failure_reason")
                    .unwrap_or_else(|| "declined".to_string());
                Ok(ChargeResult::declined(Some(transaction_id), reason, reply.body))
            }
            other => Err(GatewayError::MalformedResponse(format!(
                "unknown charge status {:?}",
                other
            ))),
        }
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn cancel_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<CancelResult, GatewayError> {
        let key = format!("cancel-{}", subscription.subscription_id);
        let path = format!("/subscriptions/{}/cancel", subscription.subscription_id);
        let reply = self.post("gateway_cancel", &path, &key, json!({})).await?;

        if reply.status.is_success() {
            Ok(CancelResult {
                success: true,
                error: None,
            })
        } else {
            Ok(CancelResult {
                success: false,
                error: Some(error_message(&reply.body, reply.status)),
            })
        }
    }

    #[instrument(skip(self))]
    async fn refund_payment(
        &self,
        transaction_id: &str,
        amount: Option<i64>,
    ) -> Result<RefundResult, GatewayError> {
        // Fresh per call; reused across the retries of this call only.
        let key = format!("refund-{}", Uuid::new_v4());
        let mut body = json!({ "transaction_id": transaction_id });
        if let Some(amount) = amount {
            body["amount"] = json!(amount);
        }

        let reply = self.post("gateway_refund", "/refunds", &key, body).await?;

        if reply.status.is_success() {
            let refund_id = string_field(&reply.body, "id").ok_or_else(|| {
                GatewayError::MalformedResponse("refund response without id".to_string())
            })?;
            Ok(RefundResult {
                success: true,
                refund_id: Some(refund_id),
                error: None,
            })
        } else {
            Ok(RefundResult {
                success: false,
                refund_id: None,
                error: Some(error_message(&reply.body, reply.status)),
            })
        }
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        let secret = self.config.webhook_secret.expose_secret();
        if secret.is_empty() {
            warn!("Webhook secret not configured, rejecting event");
            return false;
        }
        verify_payload(secret, payload, signature).unwrap_or(false)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
        parse_json_event(payload)
    }
}
