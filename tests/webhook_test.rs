mod common;

use bookpay::application::reconciliation::WebhookAck;
use bookpay::domain::booking::{BookingPaymentStatus, BookingStatus};
use bookpay::domain::gateway::PaymentGateway;
use bookpay::domain::payment::PaymentStatus;
use bookpay::domain::ports::NotificationEvent;
use bookpay::error::BookpayError;
use bookpay::infrastructure::gateways::sandbox::{EVENT_DISPUTE, EVENT_FAILED, EVENT_SUCCEEDED};
use chrono::Duration;
use common::{Harness, settle};
use rust_decimal_macros::dec;

async fn deliver(h: &Harness, payload: &[u8], signature: &str) -> Result<WebhookAck, BookpayError> {
    h.services
        .webhooks
        .handle_gateway_webhook(PaymentGateway::Sandbox, payload, signature)
        .await
}

#[tokio::test]
async fn test_signed_success_completes_payment() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;
    let intent = h.pay(&booking).await;

    let (payload, signature) = h.webhook(EVENT_SUCCEEDED, &intent.gateway_transaction_id, None);
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert_eq!(
        ack,
        WebhookAck::Applied {
            payment_id: intent.payment_id,
            status: PaymentStatus::Completed,
        }
    );

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, BookingPaymentStatus::Paid);

    // Redelivery is acknowledged and changes nothing.
    let before = h.payment(intent.payment_id).await;
    let replayed = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(replayed, WebhookAck::Ignored { .. }));
    assert_eq!(h.payment(intent.payment_id).await, before);
}

#[tokio::test]
async fn test_bad_signature_leaves_payment_untouched() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;
    let intent = h.pay(&booking).await;
    let before = h.payment(intent.payment_id).await;

    let (payload, _) = h.webhook(EVENT_SUCCEEDED, &intent.gateway_transaction_id, None);
    let forged = bookpay::infrastructure::gateways::sandbox::SandboxGateway::new("not-the-secret")
        .sign(&payload);

    for signature in [forged.as_str(), "", "zz-not-hex"] {
        let err = deliver(&h, &payload, signature).await.unwrap_err();
        assert!(matches!(err, BookpayError::SignatureInvalid(_)));
    }
    assert_eq!(h.payment(intent.payment_id).await, before);
    assert_eq!(h.booking(booking.id).await.status, BookingStatus::Pending);
}

#[tokio::test]
async fn test_failed_webhook_schedules_retry() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;
    let intent = h.pay(&booking).await;

    let (payload, signature) =
        h.webhook(EVENT_FAILED, &intent.gateway_transaction_id, Some("card expired"));
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Applied { status: PaymentStatus::Failed, .. }));

    let payment = h.payment(intent.payment_id).await;
    assert_eq!(payment.attempts, 1);
    assert_eq!(payment.failure_reason.as_deref(), Some("card expired"));
    assert_eq!(payment.next_retry_at, Some(h.now() + Duration::minutes(2)));
    assert_eq!(
        h.booking(booking.id).await.payment_status,
        BookingPaymentStatus::Failed
    );

    settle().await;
    assert!(h.notifier.sent().await.iter().any(|n| {
        n.event == NotificationEvent::PaymentFailed && n.recipient == booking.requester_id
    }));
}

#[tokio::test]
async fn test_dispute_moves_payment_and_booking() {
    let h = Harness::new();
    let (_, booking, payment) = h.paid_booking(dec!(100), Duration::days(3)).await;
    let transaction_id = payment.gateway_transaction_id.clone().unwrap();

    let (payload, signature) = h.webhook(EVENT_DISPUTE, &transaction_id, Some("fraudulent"));
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Applied { status: PaymentStatus::Disputed, .. }));

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.status, BookingStatus::Disputed);
    assert_eq!(booking.payment_status, BookingPaymentStatus::Disputed);

    settle().await;
    let disputed = h
        .notifier
        .sent()
        .await
        .into_iter()
        .filter(|n| n.event == NotificationEvent::BookingDisputed)
        .count();
    assert_eq!(disputed, 2);
}

#[tokio::test]
async fn test_dispute_on_pending_payment_is_ignored() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;
    let intent = h.pay(&booking).await;

    let (payload, signature) =
        h.webhook(EVENT_DISPUTE, &intent.gateway_transaction_id, Some("too early"));
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Ignored { .. }));
    assert_eq!(h.payment(intent.payment_id).await.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_unknown_transaction_and_unsupported_events_are_acknowledged() {
    let h = Harness::new();

    let (payload, signature) = h.webhook(EVENT_SUCCEEDED, "sbx_missing", None);
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Ignored { ref reason } if reason.contains("sbx_missing")));

    let (payload, signature) = h.webhook("payout.paid", "sbx_missing", None);
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Ignored { ref reason } if reason.contains("payout.paid")));

    let garbage = b"not json".to_vec();
    let signature = h.sandbox.sign(&garbage);
    let ack = deliver(&h, &garbage, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Ignored { .. }));
}

#[tokio::test]
async fn test_late_failure_after_confirmation_is_ignored() {
    let h = Harness::new();
    let (_, booking, payment) = h.paid_booking(dec!(100), Duration::days(3)).await;
    let transaction_id = payment.gateway_transaction_id.clone().unwrap();

    let (payload, signature) = h.webhook(EVENT_FAILED, &transaction_id, Some("late decline"));
    let ack = deliver(&h, &payload, &signature).await.unwrap();
    assert!(matches!(ack, WebhookAck::Ignored { .. }));

    assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Completed);
    assert_eq!(h.booking(booking.id).await.status, BookingStatus::Confirmed);
}
