use crate::domain::money::Currency;
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentGateway {
    Stripe,
    Paystack,
    Sandbox,
}

impl PaymentGateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paystack => "paystack",
            Self::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for PaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentGateway {
    type Err = BookpayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "paystack" => Ok(Self::Paystack),
            "sandbox" => Ok(Self::Sandbox),
            other => Err(BookpayError::ValidationError(format!(
                "Unsupported payment gateway '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    MobileMoney,
    Wallet,
}

/// What the core asks a provider for when a requester starts paying.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRequest {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub method: PaymentMethod,
    pub customer_email: Option<String>,
}

/// Provider-side handle for a created intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIntent {
    /// Identifier the provider reports back in verifications and webhooks.
    pub transaction_id: String,
    /// Opaque value handed to the client (client secret, checkout URL).
    pub client_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Succeeded,
    Pending,
    Failed { reason: String },
}

/// Server-side view of a transaction, as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionVerification {
    pub transaction_id: String,
    pub status: VerificationStatus,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: String,
    /// Stable per reservation; a resent request must not refund twice.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRefund {
    pub refund_id: String,
}

/// Provider-neutral view of an inbound webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    PaymentSucceeded { transaction_id: String },
    PaymentFailed { transaction_id: String, reason: String },
    DisputeCreated { transaction_id: String, reason: String },
    Unsupported { event_type: String },
}

impl GatewayEvent {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::PaymentSucceeded { transaction_id }
            | Self::PaymentFailed { transaction_id, .. }
            | Self::DisputeCreated { transaction_id, .. } => Some(transaction_id),
            Self::Unsupported { .. } => None,
        }
    }
}

/// Uniform contract over payment providers.
///
/// Business logic only ever holds a `dyn GatewayAdapter`; the concrete provider
/// is chosen through [`GatewayRegistry`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn gateway(&self) -> PaymentGateway;

    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent>;

    async fn verify_transaction(&self, transaction_id: &str) -> Result<TransactionVerification>;

    async fn create_refund(&self, request: &RefundRequest) -> Result<GatewayRefund>;

    /// Must be checked before anything in `payload` is trusted.
    fn validate_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<GatewayEvent>;
}

pub type GatewayAdapterRef = Arc<dyn GatewayAdapter>;

/// Adapter lookup keyed by provider.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    adapters: HashMap<PaymentGateway, GatewayAdapterRef>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: GatewayAdapterRef) -> Self {
        self.adapters.insert(adapter.gateway(), adapter);
        self
    }

    pub fn get(&self, gateway: PaymentGateway) -> Option<GatewayAdapterRef> {
        self.adapters.get(&gateway).cloned()
    }

    pub fn require(&self, gateway: PaymentGateway) -> Result<GatewayAdapterRef> {
        self.get(gateway).ok_or_else(|| {
            BookpayError::ValidationError(format!(
                "Payment gateway '{}' is not configured",
                gateway
            ))
        })
    }
}
