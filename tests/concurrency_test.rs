mod common;

use bookpay::application::bookings::CreateBooking;
use bookpay::application::reconciliation::WebhookAck;
use bookpay::domain::booking::TimelineEvent;
use bookpay::domain::gateway::PaymentGateway;
use bookpay::domain::payment::PaymentStatus;
use bookpay::error::BookpayError;
use bookpay::infrastructure::gateways::sandbox::EVENT_SUCCEEDED;
use chrono::Duration;
use common::Harness;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_intents_reserve_one_payment() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let h = h.clone();
        let request = h.intent_request(&booking);
        handles.push(tokio::spawn(async move {
            h.services.payments.create_payment_intent(request).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(BookpayError::DuplicatePayment { booking_id }) => {
                assert_eq!(booking_id, booking.id);
                duplicates += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((created, duplicates), (1, 1));

    let active = h
        .services
        .payments
        .payments_for_booking(booking.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.is_active())
        .count();
    assert_eq!(active, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_success_webhooks_apply_once() {
    let h = Harness::new();
    let parties = h.listing(dec!(100)).await;
    let booking = h.book(&parties, Duration::days(3)).await;
    let intent = h.pay(&booking).await;
    let (payload, signature) = h.webhook(EVENT_SUCCEEDED, &intent.gateway_transaction_id, None);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let webhooks = h.services.webhooks.clone();
        let payload = payload.clone();
        let signature = signature.clone();
        handles.push(tokio::spawn(async move {
            webhooks
                .handle_gateway_webhook(PaymentGateway::Sandbox, &payload, &signature)
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            WebhookAck::Applied { status, .. } => {
                assert_eq!(status, PaymentStatus::Completed);
                applied += 1;
            }
            WebhookAck::Ignored { .. } => {}
        }
    }
    assert_eq!(applied, 1);

    let booking = h.booking(booking.id).await;
    assert_eq!(booking.timeline.count(TimelineEvent::Confirmed), 1);
    assert_eq!(booking.timeline.count(TimelineEvent::PaymentReceived), 1);
    assert_eq!(h.payment(intent.payment_id).await.status, PaymentStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_for_one_slot() {
    let h = Harness::new();
    let parties = h.listing(dec!(60)).await;
    let starts_at = h.now() + Duration::days(2);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let h = h.clone();
        let request = CreateBooking {
            service_id: parties.service_id,
            requester_id: parties.requester_id,
            scheduled_date: starts_at.date_naive(),
            scheduled_time: starts_at.time(),
            location: "Dock 4".to_string(),
            estimated_duration_minutes: None,
        };
        handles.push(tokio::spawn(async move {
            h.services.bookings.create_booking(request).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert!(matches!(err, BookpayError::Conflict(_))),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refunds_stay_within_the_payment() {
    let h = Harness::new();
    let (_, _, payment) = h.paid_booking(dec!(100), Duration::days(4)).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let payments = h.services.payments.clone();
        handles.push(tokio::spawn(async move {
            payments
                .refund_payment(payment.id, Some(dec!(30)), "service credit")
                .await
        }));
    }

    let mut recorded = Decimal::ZERO;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => recorded += result.amount,
            Err(err) => assert!(matches!(
                err,
                BookpayError::NotRefundable(_) | BookpayError::Conflict(_)
            )),
        }
    }

    let stored = h.payment(payment.id).await;
    assert_eq!(stored.refunded_amount, recorded);
    // An executed refund that lost every write race stays reserved.
    let executed: Decimal = h.sandbox.refunds().iter().map(|r| r.amount).sum();
    assert_eq!(executed, stored.refunded_amount + stored.refund_in_flight);
    assert!(executed <= stored.amount);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_full_refunds_execute_once_at_the_provider() {
    let h = Harness::new();
    let (_, _, payment) = h.paid_booking(dec!(100), Duration::days(4)).await;
    h.sandbox.delay_refunds(std::time::Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let payments = h.services.payments.clone();
        handles.push(tokio::spawn(async move {
            payments.refund_payment(payment.id, None, "full").await
        }));
    }

    let mut refunded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.amount, dec!(102.50));
                refunded += 1;
            }
            Err(err) => assert!(matches!(
                err,
                BookpayError::NotRefundable(_) | BookpayError::Conflict(_)
            )),
        }
    }
    assert_eq!(refunded, 1);

    let executed: Decimal = h.sandbox.refunds().iter().map(|r| r.amount).sum();
    assert_eq!(executed, dec!(102.50));
    let stored = h.payment(payment.id).await;
    assert_eq!(stored.refunded_amount, executed);
    assert_eq!(stored.refund_in_flight, dec!(0));
    assert_eq!(stored.status, PaymentStatus::Refunded);
}
