//! Paystack transactions over the REST API.

use super::{ensure_success, http_client, transport_error};
use crate::config::PaystackConfig;
use crate::domain::gateway::{
    GatewayAdapter, GatewayEvent, GatewayIntent, GatewayRefund, IntentRequest, PaymentGateway,
    RefundRequest, TransactionVerification, VerificationStatus,
};
use crate::domain::money::{from_minor_units, to_minor_units};
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::Sha512;
use std::time::Duration;
use tracing::debug;

type HmacSha512 = Hmac<Sha512>;

pub struct PaystackGateway {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

/// Every Paystack response wraps its payload the same way.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    reference: String,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    gateway_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PaystackEvent {
    event: String,
    data: serde_json::Value,
}

impl PaystackGateway {
    pub fn new(config: &PaystackConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            secret_key: config.secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.secret_key)
    }

    async fn read<T: DeserializeOwned>(resp: reqwest::Response, context: &str) -> Result<T> {
        let resp = ensure_success(PaymentGateway::Paystack, resp, context).await?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|err| transport_error(PaymentGateway::Paystack, context, err))?;
        match envelope.data {
            Some(data) if envelope.status => Ok(data),
            _ => Err(BookpayError::GatewayRejected(format!(
                "paystack {}: {}",
                context,
                envelope.message.unwrap_or_else(|| "no data returned".to_string())
            ))),
        }
    }
}

fn map_transaction_status(data: &VerifyData) -> VerificationStatus {
    match data.status.as_str() {
        "success" => VerificationStatus::Succeeded,
        "failed" | "abandoned" | "reversed" => VerificationStatus::Failed {
            reason: data
                .gateway_response
                .clone()
                .unwrap_or_else(|| data.status.clone()),
        },
        _ => VerificationStatus::Pending,
    }
}

/// `x-paystack-signature` is the hex HMAC-SHA512 of the raw body keyed by the secret key.
fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

fn parse_event(payload: &[u8]) -> Result<GatewayEvent> {
    let event: PaystackEvent = serde_json::from_slice(payload)?;
    let reference = |value: &serde_json::Value| {
        value
            .get("reference")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BookpayError::ValidationError(format!(
                    "paystack event {} has no reference",
                    event.event
                ))
            })
    };

    Ok(match event.event.as_str() {
        "charge.success" => GatewayEvent::PaymentSucceeded {
            transaction_id: reference(&event.data)?,
        },
        "charge.failed" => GatewayEvent::PaymentFailed {
            transaction_id: reference(&event.data)?,
            reason: event
                .data
                .get("gateway_response")
                .and_then(|r| r.as_str())
                .unwrap_or("charge failed")
                .to_string(),
        },
        "charge.dispute.create" => GatewayEvent::DisputeCreated {
            transaction_id: reference(event.data.get("transaction").unwrap_or(&event.data))?,
            reason: event
                .data
                .get("category")
                .and_then(|r| r.as_str())
                .unwrap_or("chargeback")
                .to_string(),
        },
        other => GatewayEvent::Unsupported {
            event_type: other.to_string(),
        },
    })
}

#[async_trait]
impl GatewayAdapter for PaystackGateway {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::Paystack
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent> {
        let email = request.customer_email.as_deref().ok_or_else(|| {
            BookpayError::ValidationError("Paystack requires a customer email".to_string())
        })?;
        let body = json!({
            "email": email,
            "amount": to_minor_units(request.amount)?,
            "currency": request.currency.code(),
            "reference": request.transaction_id,
            "metadata": {
                "payment_id": request.payment_id,
                "booking_id": request.booking_id,
            },
        });

        let resp = self
            .http
            .post(self.url("/transaction/initialize"))
            .header(AUTHORIZATION, self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                transport_error(PaymentGateway::Paystack, "initialize transaction", err)
            })?;
        let data: InitializeData = Self::read(resp, "initialize transaction").await?;

        debug!(reference = %data.reference, "paystack transaction initialized");
        Ok(GatewayIntent {
            transaction_id: data.reference,
            client_reference: data.authorization_url,
        })
    }

    async fn verify_transaction(&self, transaction_id: &str) -> Result<TransactionVerification> {
        let resp = self
            .http
            .get(self.url(&format!("/transaction/verify/{}", transaction_id)))
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(|err| transport_error(PaymentGateway::Paystack, "verify transaction", err))?;
        let data: VerifyData = Self::read(resp, "verify transaction").await?;

        Ok(TransactionVerification {
            status: map_transaction_status(&data),
            amount: data.amount.map(from_minor_units),
            transaction_id: data.reference,
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<GatewayRefund> {
        let body = json!({
            "transaction": request.transaction_id,
            "amount": to_minor_units(request.amount)?,
            "merchant_note": request.reason,
        });
        let resp = self
            .http
            .post(self.url("/refund"))
            .header(AUTHORIZATION, self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(PaymentGateway::Paystack, "create refund", err))?;
        let data: RefundData = Self::read(resp, "create refund").await?;

        let refund_id = match data.id {
            serde_json::Value::String(id) => id,
            other => other.to_string(),
        };
        Ok(GatewayRefund { refund_id })
    }

    fn validate_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(&self.secret_key, payload, signature)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<GatewayEvent> {
        parse_event(payload)
    }
}
