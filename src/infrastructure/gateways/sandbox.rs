//! Deterministic in-process provider used by the replay tool and tests.

use crate::domain::gateway::{
    GatewayAdapter, GatewayEvent, GatewayIntent, GatewayRefund, IntentRequest, PaymentGateway,
    RefundRequest, TransactionVerification, VerificationStatus,
};
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_SUCCEEDED: &str = "payment.succeeded";
pub const EVENT_FAILED: &str = "payment.failed";
pub const EVENT_DISPUTE: &str = "dispute.created";

/// What the next verification reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Succeed,
    Decline(String),
    Pending,
    Unavailable,
    /// Sleeps before succeeding, to exercise caller timeouts.
    Stall(Duration),
    /// Succeeds but reports a different captured amount.
    WrongAmount(Decimal),
}

#[derive(Debug, Serialize, Deserialize)]
struct SandboxEvent {
    #[serde(rename = "type")]
    event_type: String,
    transaction_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Default)]
struct SandboxState {
    intents: HashMap<String, Decimal>,
    outcomes: VecDeque<SandboxOutcome>,
    refunds: Vec<RefundRequest>,
    fail_intents: bool,
    fail_refunds: bool,
    refund_delay: Option<Duration>,
}

#[derive(Clone)]
pub struct SandboxGateway {
    webhook_secret: String,
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            state: Arc::new(Mutex::new(SandboxState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues the outcome of a future verification; unqueued verifications succeed.
    pub fn push_outcome(&self, outcome: SandboxOutcome) {
        self.state().outcomes.push_back(outcome);
    }

    pub fn fail_intents(&self, fail: bool) {
        self.state().fail_intents = fail;
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.state().fail_refunds = fail;
    }

    /// Holds every refund for `delay` before executing it.
    pub fn delay_refunds(&self, delay: Duration) {
        self.state().refund_delay = Some(delay);
    }

    /// Refunds executed so far; a replayed idempotency key is executed once.
    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.state().refunds.clone()
    }

    /// Hex HMAC-SHA256 of the payload, as the sandbox sends it.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn event_payload(event_type: &str, transaction_id: &str, reason: Option<&str>) -> Vec<u8> {
        let event = SandboxEvent {
            event_type: event_type.to_string(),
            transaction_id: transaction_id.to_string(),
            reason: reason.map(str::to_string),
        };
        serde_json::to_vec(&event).unwrap_or_default()
    }

    pub fn transaction_id_for(request_transaction_id: &str) -> String {
        format!("sbx_{}", request_transaction_id)
    }
}

#[async_trait]
impl GatewayAdapter for SandboxGateway {
    fn gateway(&self) -> PaymentGateway {
        PaymentGateway::Sandbox
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<GatewayIntent> {
        let mut state = self.state();
        if state.fail_intents {
            return Err(BookpayError::GatewayUnavailable(
                "sandbox intent creation disabled".to_string(),
            ));
        }
        let transaction_id = Self::transaction_id_for(&request.transaction_id);
        state.intents.insert(transaction_id.clone(), request.amount);
        Ok(GatewayIntent {
            transaction_id,
            client_reference: format!("sbx_secret_{}", request.payment_id.simple()),
        })
    }

    async fn verify_transaction(&self, transaction_id: &str) -> Result<TransactionVerification> {
        let (amount, outcome) = {
            let mut state = self.state();
            let amount = state.intents.get(transaction_id).copied();
            (amount, state.outcomes.pop_front().unwrap_or(SandboxOutcome::Succeed))
        };
        let Some(amount) = amount else {
            return Ok(TransactionVerification {
                transaction_id: transaction_id.to_string(),
                status: VerificationStatus::Failed {
                    reason: "unknown transaction".to_string(),
                },
                amount: None,
            });
        };

        let (status, amount) = match outcome {
            SandboxOutcome::Succeed => (VerificationStatus::Succeeded, Some(amount)),
            SandboxOutcome::Decline(reason) => (VerificationStatus::Failed { reason }, None),
            SandboxOutcome::Pending => (VerificationStatus::Pending, None),
            SandboxOutcome::Unavailable => {
                return Err(BookpayError::GatewayUnavailable(
                    "sandbox verification unavailable".to_string(),
                ));
            }
            SandboxOutcome::Stall(delay) => {
                tokio::time::sleep(delay).await;
                (VerificationStatus::Succeeded, Some(amount))
            }
            SandboxOutcome::WrongAmount(reported) => {
                (VerificationStatus::Succeeded, Some(reported))
            }
        };
        Ok(TransactionVerification {
            transaction_id: transaction_id.to_string(),
            status,
            amount,
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<GatewayRefund> {
        let delay = self.state().refund_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_refunds {
            return Err(BookpayError::GatewayRejected(
                "sandbox refunds disabled".to_string(),
            ));
        }
        let position = state
            .refunds
            .iter()
            .position(|done| done.idempotency_key == request.idempotency_key);
        let position = match position {
            Some(existing) => existing,
            None => {
                state.refunds.push(request.clone());
                state.refunds.len() - 1
            }
        };
        Ok(GatewayRefund {
            refund_id: format!("sbx_re_{}", position + 1),
        })
    }

    fn validate_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&provided).is_ok()
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> Result<GatewayEvent> {
        let event: SandboxEvent = serde_json::from_slice(payload)?;
        let reason = event.reason.unwrap_or_else(|| "unspecified".to_string());
        Ok(match event.event_type.as_str() {
            EVENT_SUCCEEDED => GatewayEvent::PaymentSucceeded {
                transaction_id: event.transaction_id,
            },
            EVENT_FAILED => GatewayEvent::PaymentFailed {
                transaction_id: event.transaction_id,
                reason,
            },
            EVENT_DISPUTE => GatewayEvent::DisputeCreated {
                transaction_id: event.transaction_id,
                reason,
            },
            _ => GatewayEvent::Unsupported {
                event_type: event.event_type,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway::PaymentMethod;
    use crate::domain::money::Currency;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn request() -> IntentRequest {
        IntentRequest {
            payment_id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            transaction_id: "TXN-1".to_string(),
            amount: dec!(102.50),
            currency: Currency::new("USD").unwrap(),
            method: PaymentMethod::Card,
            customer_email: None,
        }
    }

    #[tokio::test]
    async fn test_sandbox_scripted_outcomes() {
        let gateway = SandboxGateway::new("whsec");
        let intent = gateway.create_intent(&request()).await.unwrap();
        assert_eq!(intent.transaction_id, "sbx_TXN-1");

        gateway.push_outcome(SandboxOutcome::Decline("insufficient funds".into()));
        let declined = gateway.verify_transaction(&intent.transaction_id).await.unwrap();
        assert_eq!(
            declined.status,
            VerificationStatus::Failed {
                reason: "insufficient funds".into()
            }
        );

        let ok = gateway.verify_transaction(&intent.transaction_id).await.unwrap();
        assert_eq!(ok.status, VerificationStatus::Succeeded);
        assert_eq!(ok.amount, Some(dec!(102.50)));
    }

    #[tokio::test]
    async fn test_sandbox_unknown_transaction_fails() {
        let gateway = SandboxGateway::new("whsec");
        let result = gateway.verify_transaction("sbx_missing").await.unwrap();
        assert!(matches!(result.status, VerificationStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_sandbox_refund_key_executes_once() {
        let gateway = SandboxGateway::new("whsec");
        let refund = |key: &str| RefundRequest {
            payment_id: Uuid::nil(),
            transaction_id: "sbx_TXN-1".to_string(),
            amount: dec!(10),
            currency: Currency::new("USD").unwrap(),
            reason: "goodwill".to_string(),
            idempotency_key: key.to_string(),
        };

        let first = gateway.create_refund(&refund("p-refund-1")).await.unwrap();
        let replayed = gateway.create_refund(&refund("p-refund-1")).await.unwrap();
        let second = gateway.create_refund(&refund("p-refund-2")).await.unwrap();
        assert_eq!(first, replayed);
        assert_ne!(first, second);
        assert_eq!(gateway.refunds().len(), 2);
    }

    #[test]
    fn test_sandbox_signature_round_trip() {
        let gateway = SandboxGateway::new("whsec");
        let payload = SandboxGateway::event_payload(EVENT_SUCCEEDED, "sbx_TXN-1", None);
        let signature = gateway.sign(&payload);
        assert!(gateway.validate_webhook_signature(&payload, &signature));
        assert!(!gateway.validate_webhook_signature(b"tampered", &signature));
        assert!(!gateway.validate_webhook_signature(&payload, "not-hex"));

        let other = SandboxGateway::new("different");
        assert!(!other.validate_webhook_signature(&payload, &signature));
    }

    #[test]
    fn test_sandbox_event_parsing() {
        let gateway = SandboxGateway::new("whsec");
        let payload = SandboxGateway::event_payload(EVENT_DISPUTE, "sbx_1", Some("fraud"));
        assert_eq!(
            gateway.parse_webhook_event(&payload).unwrap(),
            GatewayEvent::DisputeCreated {
                transaction_id: "sbx_1".into(),
                reason: "fraud".into()
            }
        );
        let payload = SandboxGateway::event_payload("payout.paid", "sbx_1", None);
        assert!(matches!(
            gateway.parse_webhook_event(&payload).unwrap(),
            GatewayEvent::Unsupported { .. }
        ));
        assert!(gateway.parse_webhook_event(b"{not json").is_err());
    }
}
