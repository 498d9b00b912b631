//! Inbound provider webhooks.
//!
//! Signatures are checked before anything in the payload is read. Past that
//! point every outcome is acknowledged, so providers stop redelivering events
//! that can never apply.

use super::payments::{PaymentService, ProviderOutcome};
use crate::domain::gateway::{GatewayEvent, GatewayRegistry, PaymentGateway};
use crate::domain::payment::PaymentStatus;
use crate::domain::ports::PaymentStoreRef;
use crate::error::{BookpayError, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Applied { payment_id: Uuid, status: PaymentStatus },
    Ignored { reason: String },
}

impl WebhookAck {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

pub struct WebhookHandler {
    gateways: GatewayRegistry,
    payments: PaymentStoreRef,
    service: Arc<PaymentService>,
}

impl WebhookHandler {
    pub fn new(
        gateways: GatewayRegistry,
        payments: PaymentStoreRef,
        service: Arc<PaymentService>,
    ) -> Self {
        Self {
            gateways,
            payments,
            service,
        }
    }

    pub async fn handle_gateway_webhook(
        &self,
        gateway: PaymentGateway,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookAck> {
        let Some(adapter) = self.gateways.get(gateway) else {
            warn!(%gateway, "webhook for an unconfigured gateway rejected");
            return Err(BookpayError::SignatureInvalid(format!(
                "no adapter configured for {}",
                gateway
            )));
        };
        if !adapter.validate_webhook_signature(payload, signature) {
            warn!(%gateway, payload_len = payload.len(), "webhook signature rejected");
            return Err(BookpayError::SignatureInvalid(format!(
                "{} webhook signature does not match",
                gateway
            )));
        }

        let event = match adapter.parse_webhook_event(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%gateway, error = %err, "unparseable webhook acknowledged");
                return Ok(WebhookAck::ignored(format!("unparseable payload: {}", err)));
            }
        };

        let (transaction_id, outcome) = match event {
            GatewayEvent::PaymentSucceeded { transaction_id } => {
                (transaction_id, ProviderOutcome::Succeeded)
            }
            GatewayEvent::PaymentFailed {
                transaction_id,
                reason,
            } => (transaction_id, ProviderOutcome::Failed { reason }),
            GatewayEvent::DisputeCreated {
                transaction_id,
                reason,
            } => (transaction_id, ProviderOutcome::Disputed { reason }),
            GatewayEvent::Unsupported { event_type } => {
                debug!(%gateway, %event_type, "unsupported webhook event");
                return Ok(WebhookAck::ignored(format!("unsupported event {}", event_type)));
            }
        };

        let found = self
            .payments
            .find_by_gateway_transaction(gateway, &transaction_id)
            .await;
        let payment = match found {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                warn!(%gateway, %transaction_id, "webhook for an unknown transaction");
                return Ok(WebhookAck::ignored(format!(
                    "unknown transaction {}",
                    transaction_id
                )));
            }
            Err(err) => {
                error!(
                    %gateway,
                    %transaction_id,
                    error = %err,
                    "payment lookup failed for webhook"
                );
                return Ok(WebhookAck::ignored(format!("lookup failed: {}", err)));
            }
        };
        // The index is keyed by gateway already; this guards a misrouted record.
        if payment.payment_gateway != gateway {
            warn!(
                %gateway,
                payment_id = %payment.id,
                payment_gateway = %payment.payment_gateway,
                "webhook provider does not match payment"
            );
            return Ok(WebhookAck::ignored("provider mismatch"));
        }

        match self.service.apply_provider_outcome(payment.id, outcome).await {
            Ok(Some(updated)) => {
                info!(
                    %gateway,
                    payment_id = %updated.id,
                    status = %updated.status,
                    "webhook applied"
                );
                Ok(WebhookAck::Applied {
                    payment_id: updated.id,
                    status: updated.status,
                })
            }
            Ok(None) => Ok(WebhookAck::ignored(format!(
                "payment {} already {}",
                payment.transaction_id, payment.status
            ))),
            Err(err) => {
                error!(
                    %gateway,
                    payment_id = %payment.id,
                    error = %err,
                    "webhook could not be applied"
                );
                Ok(WebhookAck::ignored(format!("not applied: {}", err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::propagation::BookingPropagator;
    use crate::domain::gateway::MockGatewayAdapter;
    use crate::domain::payment::PaymentPolicy;
    use crate::domain::ports::MockPaymentStore;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::in_memory::{
        InMemoryBookingStore, InMemoryCatalog, InMemoryPaymentStore, RecordingNotifier,
    };
    use std::time::Duration;

    fn handler(adapter: MockGatewayAdapter) -> WebhookHandler {
        handler_with_store(adapter, Arc::new(InMemoryPaymentStore::new()))
    }

    fn handler_with_store(
        adapter: MockGatewayAdapter,
        payments: PaymentStoreRef,
    ) -> WebhookHandler {
        let bookings = Arc::new(InMemoryBookingStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(SystemClock);
        let gateways = GatewayRegistry::new().register(Arc::new(adapter));
        let service = Arc::new(PaymentService::new(
            payments.clone(),
            bookings.clone(),
            Arc::new(InMemoryCatalog::new()),
            gateways.clone(),
            notifier.clone(),
            clock.clone(),
            BookingPropagator::new(bookings, notifier, clock),
            PaymentPolicy::default(),
            Duration::from_secs(1),
        ));
        WebhookHandler::new(gateways, payments, service)
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_before_parsing() {
        let mut adapter = MockGatewayAdapter::new();
        adapter.expect_gateway().return_const(PaymentGateway::Paystack);
        adapter.expect_validate_webhook_signature().return_const(false);
        adapter.expect_parse_webhook_event().never();
        let handler = handler(adapter);

        let result = handler
            .handle_gateway_webhook(PaymentGateway::Paystack, b"{}", "deadbeef")
            .await;
        assert!(matches!(result, Err(BookpayError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_is_rejected() {
        let mut adapter = MockGatewayAdapter::new();
        adapter.expect_gateway().return_const(PaymentGateway::Paystack);
        let handler = handler(adapter);

        let result = handler
            .handle_gateway_webhook(PaymentGateway::Stripe, b"{}", "sig")
            .await;
        assert!(matches!(result, Err(BookpayError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn test_unsupported_and_unknown_events_are_acknowledged() {
        let mut adapter = MockGatewayAdapter::new();
        adapter.expect_gateway().return_const(PaymentGateway::Paystack);
        adapter.expect_validate_webhook_signature().return_const(true);
        let mut deliveries = 0;
        adapter.expect_parse_webhook_event().returning(move |_| {
            deliveries += 1;
            Ok(if deliveries == 1 {
                GatewayEvent::Unsupported {
                    event_type: "transfer.success".to_string(),
                }
            } else {
                GatewayEvent::PaymentSucceeded {
                    transaction_id: "ref_missing".to_string(),
                }
            })
        });
        let handler = handler(adapter);

        for _ in 0..2 {
            let ack = handler
                .handle_gateway_webhook(PaymentGateway::Paystack, b"{}", "sig")
                .await
                .unwrap();
            assert!(matches!(ack, WebhookAck::Ignored { .. }));
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_acknowledged() {
        let mut adapter = MockGatewayAdapter::new();
        adapter.expect_gateway().return_const(PaymentGateway::Paystack);
        adapter.expect_validate_webhook_signature().return_const(true);
        adapter.expect_parse_webhook_event().returning(|_| {
            Ok(GatewayEvent::PaymentSucceeded {
                transaction_id: "ref_1".to_string(),
            })
        });
        let mut store = MockPaymentStore::new();
        store
            .expect_find_by_gateway_transaction()
            .times(1)
            .returning(|_, _| Err(BookpayError::InternalError("store offline".into())));
        let handler = handler_with_store(adapter, Arc::new(store));

        let ack = handler
            .handle_gateway_webhook(PaymentGateway::Paystack, b"{}", "sig")
            .await
            .unwrap();
        assert!(matches!(
            ack,
            WebhookAck::Ignored { ref reason } if reason.contains("store offline")
        ));
    }
}
