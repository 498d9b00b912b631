//! Stripe payment intents over the REST API.

use super::{ensure_success, http_client, transport_error};
use crate::config::StripeConfig;
use crate::domain::gateway::{
    GatewayAdapter, GatewayEvent, GatewayIntent, GatewayRefund, IntentRequest, PaymentGateway,
    RefundRequest, TransactionVerification, VerificationStatus,
};
use crate::domain::money::{from_minor_units, to_minor_units};
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Signatures older than this are treated as replays.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeGateway {
    http: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripeErrorDetails>,
    #[serde(default)]
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StripeErrorDetails {
    fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "payment failed".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    type_: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.secret_key)
    }
}

fn map_intent_status(intent: &StripePaymentIntent) -> VerificationStatus {
    match intent.status.as_str() {
        "succeeded" => VerificationStatus::Succeeded,
        "canceled" => VerificationStatus::Failed {
            reason: intent
                .cancellation_reason
                .clone()
                .unwrap_or_else(|| "canceled".to_string()),
        },
        // A returned intent with an error attached means the last attempt was declined.
        "requires_payment_method" if intent.last_payment_error.is_some() => {
            VerificationStatus::Failed {
                reason: intent
                    .last_payment_error
                    .as_ref()
                    .map(StripeErrorDetails::describe)
                    .unwrap_or_default(),
            }
        }
        _ => VerificationStatus::Pending,
    }
}

/// Checks a `Stripe-Signature` header of the form `t=<ts>,v1=<hex>` signed
/// no more than `SIGNATURE_TOLERANCE_SECS` before `now` (unix seconds).
fn verify_signature(secret: &str, payload: &[u8], header: &str, now: i64) -> bool {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("t=") {
            timestamp = Some(rest);
        } else if let Some(rest) = part.strip_prefix("v1=") {
            signatures.push(rest);
        }
    }
    let Some(timestamp) = timestamp else {
        return false;
    };
    let Ok(signed_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if now.saturating_sub(signed_at) > SIGNATURE_TOLERANCE_SECS {
        return false;
    }

    signatures.into_iter().any(|signature| {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&provided).is_ok()
    })
}

fn object_field(object: &serde_json::Value, field: &str) -> Option<String> {
    object.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_event(payload: &[u8]) -> Result<GatewayEvent> {
    let event: StripeEvent = serde_json::from_slice(payload)?;
    let object = &event.data.object;
    let missing = || {
        BookpayError::ValidationError(format!("stripe event {} has no payment intent", event.type_))
    };

    Ok(match event.type_.as_str() {
        "payment_intent.succeeded" => GatewayEvent::PaymentSucceeded {
            transaction_id: object_field(object, "id").ok_or_else(missing)?,
        },
        "payment_intent.payment_failed" => GatewayEvent::PaymentFailed {
            transaction_id: object_field(object, "id").ok_or_else(missing)?,
            reason: object
                .get("last_payment_error")
                .and_then(|err| object_field(err, "message"))
                .unwrap_or_else(|| "payment failed".to_string()),
        },
        "charge.dispute.created" => GatewayEvent::DisputeCreated {
            transaction_id: object_field(object, "payment_intent").ok_or_else(missing)?,
            reason: object_field(object, "reason").unwrap_or_else(|| "general".to_string()),
        },
        _ => GatewayEvent::Unsupported {
            event_type: event.type_.clone(),
        },
    })
}

#[async_trait]
impl GatewayAdapter for StripeGateway {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::Stripe
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent> {
        // https://stripe.com/docs/api/payment_intents/create
        let mut body = vec![
            ("amount".to_string(), to_minor_units(request.amount)?.to_string()),
            (
                "currency".to_string(),
                request.currency.code().to_ascii_lowercase(),
            ),
            ("metadata[payment_id]".to_string(), request.payment_id.to_string()),
            ("metadata[booking_id]".to_string(), request.booking_id.to_string()),
            (
                "metadata[transaction_id]".to_string(),
                request.transaction_id.clone(),
            ),
        ];
        if let Some(email) = &request.customer_email {
            body.push(("receipt_email".to_string(), email.clone()));
        }

        let resp = self
            .http
            .post(self.url("/v1/payment_intents"))
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("Idempotency-Key", request.transaction_id.as_str())
            .form(&body)
            .send()
            .await
            .map_err(|err| transport_error(PaymentGateway::Stripe, "create payment intent", err))?;
        let resp = ensure_success(PaymentGateway::Stripe, resp, "create payment intent").await?;
        let intent: StripePaymentIntent = resp
            .json()
            .await
            .map_err(|err| transport_error(PaymentGateway::Stripe, "decode payment intent", err))?;

        debug!(intent_id = %intent.id, "stripe payment intent created");
        Ok(GatewayIntent {
            client_reference: intent.client_secret.clone().unwrap_or_default(),
            transaction_id: intent.id,
        })
    }

    async fn verify_transaction(&self, transaction_id: &str) -> Result<TransactionVerification> {
        // https://stripe.com/docs/api/payment_intents/retrieve
        let resp = self
            .http
            .get(self.url(&format!("/v1/payment_intents/{}", transaction_id)))
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|err| {
                transport_error(PaymentGateway::Stripe, "retrieve payment intent", err)
            })?;
        let resp = ensure_success(PaymentGateway::Stripe, resp, "retrieve payment intent").await?;
        let intent: StripePaymentIntent = resp
            .json()
            .await
            .map_err(|err| transport_error(PaymentGateway::Stripe, "decode payment intent", err))?;

        Ok(TransactionVerification {
            status: map_intent_status(&intent),
            amount: intent.amount_received.filter(|v| *v > 0).map(from_minor_units),
            transaction_id: intent.id,
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<GatewayRefund> {
        // https://stripe.com/docs/api/refunds/create
        let body = [
            ("payment_intent", request.transaction_id.clone()),
            ("amount", to_minor_units(request.amount)?.to_string()),
            ("metadata[payment_id]", request.payment_id.to_string()),
            ("metadata[reason]", request.reason.clone()),
        ];
        let resp = self
            .http
            .post(self.url("/v1/refunds"))
            .header(AUTHORIZATION, self.bearer())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .form(&body)
            .send()
            .await
            .map_err(|err| transport_error(PaymentGateway::Stripe, "create refund", err))?;
        let resp = ensure_success(PaymentGateway::Stripe, resp, "create refund").await?;
        let refund: StripeRefund = resp
            .json()
            .await
            .map_err(|err| transport_error(PaymentGateway::Stripe, "decode refund", err))?;
        Ok(GatewayRefund {
            refund_id: refund.id,
        })
    }

    fn validate_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(&self.webhook_secret, payload, signature, Utc::now().timestamp())
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<GatewayEvent> {
        parse_event(payload)
    }
}
