//! Applies payment outcomes to the booking they fund.
//!
//! Propagation is derived from the payment's current state, not from the event
//! that changed it, so running it twice is harmless and a missed run can be
//! repeated later (see `PaymentService::sync_booking`).

use super::notify_all;
use crate::domain::booking::{Actor, Booking, BookingPaymentStatus, BookingStatus};
use crate::domain::money::round_money;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{BookingStoreRef, ClockRef, NotificationEvent, NotifierRef};
use crate::error::{BookpayError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts made against a booking that keeps losing the version race.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Loads a booking, lets `change` mutate it and writes it back, reloading and
/// re-running `change` when a concurrent writer wins. `change` returns whether
/// anything changed; unchanged bookings are not written.
pub(crate) async fn update_booking_with<F>(
    store: &BookingStoreRef,
    clock: &ClockRef,
    booking_id: Uuid,
    mut change: F,
) -> Result<Booking>
where
    F: FnMut(&mut Booking, DateTime<Utc>) -> Result<bool>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut booking = store
            .get(booking_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("booking", booking_id))?;
        if !change(&mut booking, clock.now())? {
            return Ok(booking);
        }
        match store.update(booking).await {
            Err(BookpayError::Conflict(reason)) if attempt < MAX_WRITE_ATTEMPTS => {
                debug!(%booking_id, %reason, attempt, "booking write conflict, reloading");
            }
            other => return other,
        }
    }
}

/// Booking payment status implied by a payment in its current state.
fn mirrored_status(payment: &Payment) -> Option<BookingPaymentStatus> {
    match payment.status {
        PaymentStatus::Pending => Some(BookingPaymentStatus::Pending),
        PaymentStatus::Completed if payment.refunded_amount > Decimal::ZERO => {
            Some(BookingPaymentStatus::Partial)
        }
        PaymentStatus::Completed => Some(BookingPaymentStatus::Paid),
        PaymentStatus::Failed => Some(BookingPaymentStatus::Failed),
        PaymentStatus::Refunded => Some(BookingPaymentStatus::Refunded),
        PaymentStatus::Disputed => Some(BookingPaymentStatus::Disputed),
        PaymentStatus::Processing | PaymentStatus::Cancelled | PaymentStatus::Expired => None,
    }
}

#[derive(Clone)]
pub struct BookingPropagator {
    bookings: BookingStoreRef,
    notifier: NotifierRef,
    clock: ClockRef,
}

impl BookingPropagator {
    pub fn new(bookings: BookingStoreRef, notifier: NotifierRef, clock: ClockRef) -> Self {
        Self {
            bookings,
            notifier,
            clock,
        }
    }

    /// Brings the booking in line with `payment`.
    pub async fn apply(&self, payment: &Payment) -> Result<Booking> {
        let actor = Actor::Gateway(payment.payment_gateway);
        let mut confirmed = false;

        let booking = update_booking_with(
            &self.bookings,
            &self.clock,
            payment.booking_id,
            |booking, now| {
                confirmed = false;
                let mut changed = false;

                if let Some(next) = mirrored_status(payment)
                    && booking.payment_status != next
                {
                    if booking.payment_status.can_transition_to(next) {
                        booking.record_payment_status(
                            next,
                            actor,
                            now,
                            format!("Payment {} is {}", payment.transaction_id, payment.status),
                        )?;
                        changed = true;
                    } else {
                        debug!(
                            booking_id = %booking.id,
                            from = %booking.payment_status,
                            to = %next,
                            "booking payment status not propagated"
                        );
                    }
                }

                match payment.status {
                    PaymentStatus::Completed if booking.status == BookingStatus::Pending => {
                        match booking.confirm(actor, now) {
                            Ok(()) => {
                                confirmed = true;
                                changed = true;
                            }
                            Err(BookpayError::BookingExpired(_)) => {
                                warn!(
                                    booking_id = %booking.id,
                                    payment_id = %payment.id,
                                    "payment completed after the booking expired; \
                                     booking left pending"
                                );
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    PaymentStatus::Disputed
                        if booking.status.can_transition_to(BookingStatus::Disputed) =>
                    {
                        booking.mark_disputed(actor, "Payment disputed with the provider", now)?;
                        changed = true;
                    }
                    PaymentStatus::Refunded if booking.status == BookingStatus::Completed => {
                        booking.mark_refunded(actor, now)?;
                        changed = true;
                    }
                    _ => {}
                }
                Ok(changed)
            },
        )
        .await?;

        if confirmed {
            info!(
                booking_id = %booking.id,
                booking_number = %booking.booking_number,
                payment_id = %payment.id,
                "booking confirmed by payment"
            );
            notify_all(
                &self.notifier,
                NotificationEvent::BookingConfirmed,
                &[booking.provider_id, booking.requester_id],
                json!({
                    "booking_id": booking.id,
                    "booking_number": booking.booking_number,
                    "payment_id": payment.id,
                }),
            );
        }
        Ok(booking)
    }

    /// Records one refund against the booking; every partial refund leaves its
    /// own timeline entry.
    pub async fn record_refund(&self, payment: &Payment, amount: Decimal) -> Result<Booking> {
        let actor = Actor::Gateway(payment.payment_gateway);
        update_booking_with(&self.bookings, &self.clock, payment.booking_id, |booking, now| {
            let next = if payment.is_fully_refunded() {
                BookingPaymentStatus::Refunded
            } else {
                BookingPaymentStatus::Partial
            };
            let recorded = booking.record_payment_status(
                next,
                actor,
                now,
                format!(
                    "Refunded {} {} of payment {}",
                    round_money(amount),
                    payment.currency,
                    payment.transaction_id
                ),
            )?;
            let mut changed = recorded;
            if next == BookingPaymentStatus::Refunded
                && booking.status == BookingStatus::Completed
            {
                booking.mark_refunded(actor, now)?;
                changed = true;
            }
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::booking::{NewBooking, Schedule};
    use crate::domain::gateway::{GatewayIntent, PaymentGateway, PaymentMethod};
    use crate::domain::money::{Amount, Currency};
    use crate::domain::payment::{NewPayment, PaymentPolicy};
    use crate::domain::fees::compute_fees;
    use crate::domain::ports::{BookingStore, Clock, MockNotifier};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryBookingStore;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryBookingStore>,
        clock: Arc<ManualClock>,
        propagator: BookingPropagator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBookingStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));
        let propagator = BookingPropagator::new(store.clone(), Arc::new(notifier), clock.clone());
        Fixture {
            store,
            clock,
            propagator,
        }
    }

    async fn seed_booking(fixture: &Fixture) -> Booking {
        let now = fixture.clock.now();
        let start = now + Duration::days(3);
        let booking = Booking::new(
            NewBooking {
                service_id: Uuid::new_v4(),
                provider_id: Uuid::new_v4(),
                requester_id: Uuid::new_v4(),
                schedule: Schedule {
                    scheduled_date: start.date_naive(),
                    scheduled_time: start.time(),
                    estimated_duration_minutes: 60,
                },
                location: "12 Main St".to_string(),
                base_amount: Amount::new(dec!(100)).unwrap(),
                currency: Currency::new("USD").unwrap(),
            },
            &Default::default(),
            now,
        )
        .unwrap();
        fixture.store.insert(booking).await.unwrap()
    }

    fn completed_payment(booking: &Booking, now: DateTime<Utc>) -> Payment {
        let mut payment = Payment::new(
            NewPayment {
                booking_id: booking.id,
                payer_id: booking.requester_id,
                payee_id: booking.provider_id,
                amount: Amount::new(booking.total_amount).unwrap(),
                currency: booking.currency.clone(),
                exchange_rate: dec!(1),
                method: PaymentMethod::Card,
                gateway: PaymentGateway::Sandbox,
            },
            &PaymentPolicy::default(),
            now,
        )
        .unwrap();
        payment
            .bind_gateway(
                &GatewayIntent {
                    transaction_id: "sbx_1".into(),
                    client_reference: "secret".into(),
                },
                now,
            )
            .unwrap();
        payment
            .complete(
                compute_fees(booking.base_amount, payment.amount, PaymentGateway::Sandbox, dec!(0)),
                now,
            )
            .unwrap();
        payment
    }

    #[tokio::test]
    async fn test_completed_payment_confirms_booking_once() {
        let fixture = fixture();
        let booking = seed_booking(&fixture).await;
        let payment = completed_payment(&booking, fixture.clock.now());

        let first = fixture.propagator.apply(&payment).await.unwrap();
        assert_eq!(first.status, BookingStatus::Confirmed);
        assert_eq!(first.payment_status, BookingPaymentStatus::Paid);
        let entries = first.timeline.len();

        let second = fixture.propagator.apply(&payment).await.unwrap();
        assert_eq!(second.timeline.len(), entries);
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn test_expired_booking_is_left_pending() {
        let fixture = fixture();
        let booking = seed_booking(&fixture).await;
        fixture.clock.advance(Duration::hours(25));
        let payment = completed_payment(&booking, fixture.clock.now());

        let updated = fixture.propagator.apply(&payment).await.unwrap();
        assert_eq!(updated.status, BookingStatus::Pending);
        assert_eq!(updated.payment_status, BookingPaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_partial_refunds_each_leave_an_entry() {
        let fixture = fixture();
        let booking = seed_booking(&fixture).await;
        let mut payment = completed_payment(&booking, fixture.clock.now());
        fixture.propagator.apply(&payment).await.unwrap();

        let now = fixture.clock.now();
        payment.record_refund(dec!(10), "goodwill", "re_1".into(), now).unwrap();
        fixture.propagator.record_refund(&payment, dec!(10)).await.unwrap();
        payment.record_refund(dec!(5), "goodwill", "re_2".into(), now).unwrap();
        let updated = fixture.propagator.record_refund(&payment, dec!(5)).await.unwrap();

        assert_eq!(updated.payment_status, BookingPaymentStatus::Partial);
        assert_eq!(
            updated
                .timeline
                .count(crate::domain::booking::TimelineEvent::PaymentPartiallyRefunded),
            2
        );
    }
}
