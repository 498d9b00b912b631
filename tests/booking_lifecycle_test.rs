mod common;

use bookpay::domain::booking::{
    Actor, BookingPaymentStatus, BookingStatus, TimelineEvent,
};
use bookpay::domain::ports::NotificationEvent;
use bookpay::error::BookpayError;
use chrono::Duration;
use common::{Harness, settle};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_full_lifecycle_from_payment_to_archive() {
    let h = Harness::new();
    let (parties, booking, _) = h.paid_booking(dec!(100), Duration::days(3)).await;
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, BookingPaymentStatus::Paid);

    let bookings = &h.services.bookings;
    let started = bookings
        .update_booking_status(booking.id, BookingStatus::InProgress, parties.provider_id, None)
        .await
        .unwrap();
    assert_eq!(started.actual_start_time, Some(h.now()));

    h.clock.advance(Duration::minutes(75));
    let completed = bookings
        .update_booking_status(booking.id, BookingStatus::Completed, parties.provider_id, None)
        .await
        .unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);
    assert_eq!(completed.actual_end_time, Some(h.now()));
    assert_eq!(h.catalog.completed_count(parties.service_id).await, 1);

    let archived = bookings
        .archive_booking(booking.id, Actor::User(parties.requester_id))
        .await
        .unwrap();
    assert_eq!(archived.archived_at, Some(h.now()));

    let events: Vec<TimelineEvent> = archived.timeline.entries().iter().map(|e| e.event).collect();
    assert_eq!(
        events,
        vec![
            TimelineEvent::Created,
            TimelineEvent::PaymentReceived,
            TimelineEvent::Confirmed,
            TimelineEvent::Started,
            TimelineEvent::Completed,
            TimelineEvent::Archived,
        ]
    );
}

#[tokio::test]
async fn test_active_booking_cannot_be_archived() {
    let h = Harness::new();
    let parties = h.listing(dec!(80)).await;
    let booking = h.book(&parties, Duration::days(2)).await;

    let err = h
        .services
        .bookings
        .archive_booking(booking.id, Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, BookpayError::InvalidTransition { .. }));
    assert_eq!(h.booking(booking.id).await.archived_at, None);
}

#[tokio::test]
async fn test_parties_are_notified() {
    let h = Harness::new();
    let parties = h.listing(dec!(60)).await;
    let booking = h.book(&parties, Duration::days(2)).await;
    h.services
        .bookings
        .update_booking_status(booking.id, BookingStatus::Confirmed, parties.provider_id, None)
        .await
        .unwrap();
    settle().await;

    let sent = h.notifier.sent().await;
    assert!(sent.iter().any(|n| n.event == NotificationEvent::BookingCreated
        && n.recipient == parties.provider_id));
    assert!(sent.iter().any(|n| n.event == NotificationEvent::BookingConfirmed
        && n.recipient == parties.requester_id));
}

#[tokio::test]
async fn test_expired_booking_cannot_be_confirmed_or_paid() {
    let h = Harness::new();
    let parties = h.listing(dec!(40)).await;
    let booking = h.book(&parties, Duration::days(5)).await;
    h.clock.advance(Duration::hours(24));

    let confirm = h
        .services
        .bookings
        .update_booking_status(booking.id, BookingStatus::Confirmed, parties.provider_id, None)
        .await;
    assert!(matches!(confirm, Err(BookpayError::BookingExpired(id)) if id == booking.id));

    let pay = h
        .services
        .payments
        .create_payment_intent(h.intent_request(&booking))
        .await;
    assert!(matches!(pay, Err(BookpayError::BookingExpired(_))));

    // The expired slot no longer blocks the provider's calendar.
    let rebooked = h.book(&parties, Duration::days(4)).await;
    assert_eq!(rebooked.status, BookingStatus::Pending);
}

#[tokio::test]
async fn test_reschedule_cap_and_rejection() {
    let h = Harness::new();
    let parties = h.listing(dec!(70)).await;
    let booking = h.book(&parties, Duration::days(2)).await;
    let bookings = &h.services.bookings;

    for day in 3..6 {
        let slot = h.now() + Duration::days(day);
        bookings
            .request_reschedule(
                booking.id,
                bookpay::application::bookings::RescheduleInput {
                    requested_date: slot.date_naive(),
                    requested_time: slot.time(),
                    reason: "conflict".to_string(),
                },
                parties.provider_id,
            )
            .await
            .unwrap();
        bookings
            .approve_reschedule(booking.id, parties.requester_id)
            .await
            .unwrap();
    }

    let slot = h.now() + Duration::days(9);
    let over_cap = bookings
        .request_reschedule(
            booking.id,
            bookpay::application::bookings::RescheduleInput {
                requested_date: slot.date_naive(),
                requested_time: slot.time(),
                reason: "again".to_string(),
            },
            parties.requester_id,
        )
        .await;
    assert!(matches!(over_cap, Err(BookpayError::ValidationError(_))));

    let current = h.booking(booking.id).await;
    assert_eq!(current.reschedule_count, 3);
    assert_eq!(current.timeline.count(TimelineEvent::RescheduleApproved), 3);
}

#[tokio::test]
async fn test_reschedule_rejected_by_counterparty_keeps_schedule() {
    let h = Harness::new();
    let parties = h.listing(dec!(70)).await;
    let booking = h.book(&parties, Duration::days(2)).await;
    let slot = h.now() + Duration::days(3);

    h.services
        .bookings
        .request_reschedule(
            booking.id,
            bookpay::application::bookings::RescheduleInput {
                requested_date: slot.date_naive(),
                requested_time: slot.time(),
                reason: "sick".to_string(),
            },
            parties.requester_id,
        )
        .await
        .unwrap();
    let rejected = h
        .services
        .bookings
        .reject_reschedule(booking.id, parties.provider_id, "fully booked")
        .await
        .unwrap();

    assert_eq!(rejected.schedule, booking.schedule);
    assert_eq!(rejected.reschedule_count, 0);
    assert!(rejected.pending_reschedule().is_none());
}

#[tokio::test]
async fn test_random_status_requests_follow_the_lifecycle_graph() {
    let h = Harness::new();
    let targets = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::InProgress,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Disputed,
        BookingStatus::Refunded,
    ];
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    for _ in 0..20 {
        let parties = h.listing(dec!(50)).await;
        let booking = h.book(&parties, Duration::days(3)).await;

        for _ in 0..6 {
            let target = *targets.choose(&mut rng).unwrap();
            let actor = if rng.gen_bool(0.7) {
                parties.provider_id
            } else {
                parties.requester_id
            };
            let before = h.booking(booking.id).await;

            let result = h
                .services
                .bookings
                .update_booking_status(booking.id, target, actor, Some("requested".to_string()))
                .await;
            let after = h.booking(booking.id).await;

            match result {
                Ok(updated) => {
                    assert_eq!(updated.status, target);
                    assert!(
                        before.status.can_transition_to(target),
                        "{} -> {} should have been refused",
                        before.status,
                        target
                    );
                }
                Err(err) => {
                    assert!(matches!(
                        err,
                        BookpayError::InvalidTransition { .. } | BookpayError::AuthorizationError(_)
                    ));
                    assert_eq!(after, before);
                }
            }
        }
    }
}
