use super::notify_all;
use super::payments::PaymentService;
use super::propagation::update_booking_with;
use crate::domain::booking::{
    Actor, Booking, BookingPolicy, BookingStatus, NewBooking, PartyRole, RefundStatus, Schedule,
};
use crate::domain::money::Amount;
use crate::domain::ports::{
    BookingStoreRef, ClockRef, NotificationEvent, NotifierRef, ServiceCatalogRef,
};
use crate::error::{BookpayError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateBooking {
    pub service_id: Uuid,
    pub requester_id: Uuid,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub location: String,
    /// Falls back to the listing's duration.
    pub estimated_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RescheduleInput {
    pub requested_date: NaiveDate,
    pub requested_time: NaiveTime,
    pub reason: String,
}

pub struct BookingService {
    bookings: BookingStoreRef,
    payments: Arc<PaymentService>,
    catalog: ServiceCatalogRef,
    notifier: NotifierRef,
    clock: ClockRef,
    policy: BookingPolicy,
    /// Serializes calendar checks against the provider's active bookings.
    calendar_lock: Mutex<()>,
}

fn event_for(target: BookingStatus) -> Option<NotificationEvent> {
    match target {
        BookingStatus::Confirmed => Some(NotificationEvent::BookingConfirmed),
        BookingStatus::InProgress => Some(NotificationEvent::BookingStarted),
        BookingStatus::Completed => Some(NotificationEvent::BookingCompleted),
        BookingStatus::Cancelled => Some(NotificationEvent::BookingCancelled),
        BookingStatus::Disputed => Some(NotificationEvent::BookingDisputed),
        BookingStatus::Pending | BookingStatus::Refunded => None,
    }
}

fn counterparty(booking: &Booking, user_id: Uuid) -> Uuid {
    if user_id == booking.provider_id {
        booking.requester_id
    } else {
        booking.provider_id
    }
}

impl BookingService {
    pub fn new(
        bookings: BookingStoreRef,
        payments: Arc<PaymentService>,
        catalog: ServiceCatalogRef,
        notifier: NotifierRef,
        clock: ClockRef,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            bookings,
            payments,
            catalog,
            notifier,
            clock,
            policy,
            calendar_lock: Mutex::new(()),
        }
    }

    /// Creates a pending booking priced from the catalog listing.
    pub async fn create_booking(&self, request: CreateBooking) -> Result<Booking> {
        let service = self
            .catalog
            .find_service(request.service_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("service", request.service_id))?;
        if !service.is_active {
            return Err(BookpayError::ValidationError(format!(
                "Service {} is not available for booking",
                service.id
            )));
        }
        let requester = self
            .catalog
            .find_user(request.requester_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("user", request.requester_id))?;
        if !requester.is_active {
            return Err(BookpayError::ValidationError(format!(
                "User {} is not active",
                requester.id
            )));
        }

        let booking = Booking::new(
            NewBooking {
                service_id: service.id,
                provider_id: service.provider_id,
                requester_id: requester.id,
                schedule: Schedule {
                    scheduled_date: request.scheduled_date,
                    scheduled_time: request.scheduled_time,
                    estimated_duration_minutes: request
                        .estimated_duration_minutes
                        .unwrap_or(service.duration_minutes),
                },
                location: request.location,
                base_amount: Amount::new(service.base_price)?,
                currency: service.currency,
            },
            &self.policy,
            self.clock.now(),
        )?;

        let booking = {
            let _guard = self.calendar_lock.lock().await;
            self.ensure_slot_free(&booking, &booking.schedule, self.clock.now())
                .await?;
            self.bookings.insert(booking).await?
        };

        info!(
            booking_id = %booking.id,
            booking_number = %booking.booking_number,
            provider_id = %booking.provider_id,
            total_amount = %booking.total_amount,
            starts_at = %booking.schedule.starts_at(),
            "booking created"
        );
        notify_all(
            &self.notifier,
            NotificationEvent::BookingCreated,
            &[booking.provider_id],
            json!({
                "booking_id": booking.id,
                "booking_number": booking.booking_number,
                "scheduled_at": booking.schedule.starts_at(),
            }),
        );
        Ok(booking)
    }

    /// Moves a booking along its lifecycle on behalf of one of its parties.
    ///
    /// Confirming, starting and completing are the provider's; either party
    /// may cancel (with `notes` as the reason) or raise a dispute.
    pub async fn update_booking_status(
        &self,
        booking_id: Uuid,
        target: BookingStatus,
        actor_id: Uuid,
        notes: Option<String>,
    ) -> Result<Booking> {
        let booking = self.get_booking(booking_id).await?;
        let role = self.require_party(&booking, actor_id)?;
        match target {
            BookingStatus::Confirmed | BookingStatus::InProgress | BookingStatus::Completed
                if role != PartyRole::Provider =>
            {
                return Err(BookpayError::AuthorizationError(format!(
                    "only the provider can move booking {} to {}",
                    booking.booking_number, target
                )));
            }
            BookingStatus::Pending | BookingStatus::Refunded => {
                return Err(BookpayError::invalid_transition(
                    "booking",
                    booking.status,
                    "manually set the status of",
                ));
            }
            _ => {}
        }

        let notes = notes
            .map(|notes| notes.trim().to_string())
            .filter(|notes| !notes.is_empty());
        let actor = Actor::User(actor_id);
        let policy = &self.policy;
        let mut refund_owed = Decimal::ZERO;

        let updated = update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            match target {
                BookingStatus::Confirmed => booking.confirm(actor, now)?,
                BookingStatus::InProgress => booking.start(actor, now)?,
                BookingStatus::Completed => booking.complete(actor, now)?,
                BookingStatus::Cancelled => {
                    let reason = notes.as_deref().unwrap_or_default();
                    refund_owed = booking.cancel(actor_id, reason, policy, now)?;
                }
                BookingStatus::Disputed => booking.mark_disputed(
                    actor,
                    notes.as_deref().unwrap_or("Raised by a party"),
                    now,
                )?,
                BookingStatus::Pending | BookingStatus::Refunded => {
                    return Err(BookpayError::invalid_transition(
                        "booking",
                        booking.status,
                        "manually set the status of",
                    ));
                }
            }
            Ok(true)
        })
        .await?;

        info!(
            %booking_id,
            booking_number = %updated.booking_number,
            status = %updated.status,
            %actor,
            "booking status updated"
        );

        let updated = match target {
            BookingStatus::Completed => {
                self.after_completion(&updated).await;
                updated
            }
            BookingStatus::Cancelled => {
                let reason = notes.unwrap_or_default();
                self.after_cancellation(&updated, refund_owed, &reason).await?
            }
            _ => updated,
        };

        if let Some(event) = event_for(target) {
            notify_all(
                &self.notifier,
                event,
                &[counterparty(&updated, actor_id)],
                json!({
                    "booking_id": updated.id,
                    "booking_number": updated.booking_number,
                    "status": updated.status,
                    "refund_amount": updated.cancellation.as_ref().map(|c| c.refund_amount),
                }),
            );
        }
        Ok(updated)
    }

    pub async fn request_reschedule(
        &self,
        booking_id: Uuid,
        request: RescheduleInput,
        requested_by: Uuid,
    ) -> Result<Booking> {
        let booking = self.get_booking(booking_id).await?;
        self.require_party(&booking, requested_by)?;
        let policy = &self.policy;

        let updated = update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            booking.request_reschedule(
                request.requested_date,
                request.requested_time,
                &request.reason,
                requested_by,
                policy,
                now,
            )?;
            Ok(true)
        })
        .await?;

        info!(%booking_id, %requested_by, "reschedule requested");
        notify_all(
            &self.notifier,
            NotificationEvent::RescheduleRequested,
            &[counterparty(&updated, requested_by)],
            json!({
                "booking_id": updated.id,
                "requested_date": request.requested_date,
                "requested_time": request.requested_time,
            }),
        );
        Ok(updated)
    }

    /// The counterparty of the requester accepts the new slot.
    pub async fn approve_reschedule(&self, booking_id: Uuid, actor_id: Uuid) -> Result<Booking> {
        let booking = self.get_booking(booking_id).await?;
        self.require_party(&booking, actor_id)?;
        let requested_by = self.require_counterparty_of_request(&booking, actor_id)?;

        let updated = {
            let _guard = self.calendar_lock.lock().await;
            if let Some(request) = booking.pending_reschedule() {
                let proposed = Schedule {
                    scheduled_date: request.requested_date,
                    scheduled_time: request.requested_time,
                    estimated_duration_minutes: booking.schedule.estimated_duration_minutes,
                };
                self.ensure_slot_free(&booking, &proposed, self.clock.now())
                    .await?;
            }
            update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
                if booking
                    .pending_reschedule()
                    .is_some_and(|request| request.requested_by == actor_id)
                {
                    return Err(BookpayError::AuthorizationError(
                        "a reschedule cannot be approved by its requester".to_string(),
                    ));
                }
                booking.approve_reschedule(actor_id, now)?;
                Ok(true)
            })
            .await?
        };

        info!(
            %booking_id,
            starts_at = %updated.schedule.starts_at(),
            reschedule_count = updated.reschedule_count,
            "reschedule approved"
        );
        notify_all(
            &self.notifier,
            NotificationEvent::RescheduleApproved,
            &[requested_by],
            json!({ "booking_id": updated.id, "scheduled_at": updated.schedule.starts_at() }),
        );
        Ok(updated)
    }

    pub async fn reject_reschedule(
        &self,
        booking_id: Uuid,
        actor_id: Uuid,
        reason: &str,
    ) -> Result<Booking> {
        let booking = self.get_booking(booking_id).await?;
        self.require_party(&booking, actor_id)?;
        let requested_by = self.require_counterparty_of_request(&booking, actor_id)?;

        let updated = update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            if booking
                .pending_reschedule()
                .is_some_and(|request| request.requested_by == actor_id)
            {
                return Err(BookpayError::AuthorizationError(
                    "a reschedule cannot be rejected by its requester".to_string(),
                ));
            }
            booking.reject_reschedule(actor_id, reason, now)?;
            Ok(true)
        })
        .await?;

        info!(%booking_id, "reschedule rejected");
        notify_all(
            &self.notifier,
            NotificationEvent::RescheduleRejected,
            &[requested_by],
            json!({ "booking_id": updated.id, "reason": reason.trim() }),
        );
        Ok(updated)
    }

    /// Soft-deletes a booking that has reached a terminal state.
    pub async fn archive_booking(&self, booking_id: Uuid, actor: Actor) -> Result<Booking> {
        let archived = update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            booking.archive(actor, now)?;
            Ok(true)
        })
        .await?;
        info!(%booking_id, %actor, "booking archived");
        Ok(archived)
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> Result<Booking> {
        self.bookings
            .get(booking_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("booking", booking_id))
    }

    fn require_party(&self, booking: &Booking, user_id: Uuid) -> Result<PartyRole> {
        booking.party_role(user_id).ok_or_else(|| {
            BookpayError::AuthorizationError(format!(
                "user {} is not a party to booking {}",
                user_id, booking.booking_number
            ))
        })
    }

    fn require_counterparty_of_request(&self, booking: &Booking, actor_id: Uuid) -> Result<Uuid> {
        let request = booking.pending_reschedule().ok_or_else(|| {
            BookpayError::ValidationError("No pending reschedule request".to_string())
        })?;
        if request.requested_by == actor_id {
            return Err(BookpayError::AuthorizationError(
                "only the other party can answer a reschedule request".to_string(),
            ));
        }
        Ok(request.requested_by)
    }

    async fn ensure_slot_free(
        &self,
        booking: &Booking,
        slot: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let clash = self
            .bookings
            .find_by_provider(booking.provider_id)
            .await?
            .into_iter()
            .find(|other| {
                other.id != booking.id
                    && other.status.is_active()
                    && !other.is_expired(now)
                    && other.schedule.overlaps(slot)
            });
        match clash {
            Some(other) => Err(BookpayError::Conflict(format!(
                "provider already has booking {} at {}",
                other.booking_number,
                other.schedule.starts_at()
            ))),
            None => Ok(()),
        }
    }

    /// Escrow release and catalog counters; failures are logged and the
    /// completion stands.
    async fn after_completion(&self, booking: &Booking) {
        match self.payments.release_escrow_for_booking(booking.id).await {
            Ok(Some(payment)) => {
                info!(
                    booking_id = %booking.id,
                    payment_id = %payment.id,
                    "escrow released on completion"
                );
            }
            Ok(None) => {}
            Err(err) => {
                error!(booking_id = %booking.id, error = %err, "escrow release failed");
            }
        }
        if let Err(err) = self.catalog.record_completed_booking(booking.service_id).await {
            warn!(
                service_id = %booking.service_id,
                error = %err,
                "completion not recorded on catalog"
            );
        }
    }

    /// Settles money after a cancellation: withdraws pending payments and
    /// refunds what the cancellation owes.
    async fn after_cancellation(
        &self,
        booking: &Booking,
        refund_owed: Decimal,
        reason: &str,
    ) -> Result<Booking> {
        if let Err(err) = self
            .payments
            .cancel_pending_for_booking(booking.id, "Booking cancelled")
            .await
        {
            error!(booking_id = %booking.id, error = %err, "pending payments not withdrawn");
        }
        if refund_owed <= Decimal::ZERO {
            return Ok(booking.clone());
        }

        match self.payments.completed_payment_for(booking.id).await {
            Ok(Some(payment)) => {
                return self
                    .payments
                    .refund_cancellation(booking.id, payment.id, refund_owed, reason)
                    .await;
            }
            Ok(None) => {
                warn!(
                    booking_id = %booking.id,
                    amount = %refund_owed,
                    "refund owed but no completed payment found"
                );
            }
            Err(err) => {
                error!(
                    booking_id = %booking.id,
                    error = %err,
                    "payment lookup failed during cancellation"
                );
            }
        }
        update_booking_with(&self.bookings, &self.clock, booking.id, |booking, now| {
            booking.record_refund_outcome(RefundStatus::Failed, Decimal::ZERO, now)?;
            Ok(true)
        })
        .await
    }
}
