use super::notify_all;
use super::propagation::{BookingPropagator, update_booking_with};
use crate::domain::booking::{Booking, BookingStatus, RefundStatus};
use crate::domain::fees::compute_fees;
use crate::domain::gateway::{
    GatewayRegistry, IntentRequest, PaymentGateway, PaymentMethod, RefundRequest,
    VerificationStatus,
};
use crate::domain::money::{Amount, Currency, round_money};
use crate::domain::payment::{NewPayment, Payment, PaymentPolicy, PaymentStatus, ReleaseCondition};
use crate::domain::ports::{
    BookingStoreRef, ClockRef, NotificationEvent, NotifierRef, PaymentStoreRef, ServiceCatalogRef,
};
use crate::error::{BookpayError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePaymentIntent {
    pub booking_id: Uuid,
    pub payer_id: Uuid,
    pub method: PaymentMethod,
    pub gateway: PaymentGateway,
    /// Defaults to 1 when the payment is in the base currency.
    pub exchange_rate: Option<Decimal>,
}

/// What the client needs to complete payment with the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub gateway_transaction_id: String,
    pub gateway_intent_ref: String,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    pub payment_id: Uuid,
    pub refund_id: String,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    pub remaining: Decimal,
    pub status: PaymentStatus,
}

/// A provider-reported result, from a verification or a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Succeeded,
    Failed { reason: String },
    Disputed { reason: String },
}

/// Owns the payment lifecycle: intents, verification, retries, refunds and escrow.
pub struct PaymentService {
    payments: PaymentStoreRef,
    bookings: BookingStoreRef,
    catalog: ServiceCatalogRef,
    gateways: GatewayRegistry,
    notifier: NotifierRef,
    clock: ClockRef,
    propagator: BookingPropagator,
    policy: PaymentPolicy,
    gateway_timeout: Duration,
}

fn ensure_payable(booking: &Booking, now: DateTime<Utc>) -> Result<()> {
    if booking.archived_at.is_some()
        || !matches!(booking.status, BookingStatus::Pending | BookingStatus::Confirmed)
    {
        return Err(BookpayError::ValidationError(format!(
            "Booking {} is {} and cannot be paid",
            booking.booking_number, booking.status
        )));
    }
    if booking.payment_status.is_paid() {
        return Err(BookpayError::ValidationError(format!(
            "Booking {} is already paid",
            booking.booking_number
        )));
    }
    if booking.is_expired(now) {
        return Err(BookpayError::BookingExpired(booking.id));
    }
    Ok(())
}

impl PaymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: PaymentStoreRef,
        bookings: BookingStoreRef,
        catalog: ServiceCatalogRef,
        gateways: GatewayRegistry,
        notifier: NotifierRef,
        clock: ClockRef,
        propagator: BookingPropagator,
        policy: PaymentPolicy,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            payments,
            bookings,
            catalog,
            gateways,
            notifier,
            clock,
            propagator,
            policy,
            gateway_timeout,
        }
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Reserves a pending payment for the booking and opens the provider intent.
    pub async fn create_payment_intent(
        &self,
        request: CreatePaymentIntent,
    ) -> Result<PaymentIntent> {
        let now = self.clock.now();
        let booking = self.load_booking(request.booking_id).await?;
        if booking.requester_id != request.payer_id {
            return Err(BookpayError::AuthorizationError(format!(
                "only the requester can pay for booking {}",
                booking.booking_number
            )));
        }
        ensure_payable(&booking, now)?;
        let adapter = self.gateways.require(request.gateway)?;

        for existing in self.payments.find_by_booking(booking.id).await? {
            if existing.is_stale(now) {
                self.expire_if_stale(existing.id).await?;
            }
        }

        let payment = Payment::new(
            NewPayment {
                booking_id: booking.id,
                payer_id: request.payer_id,
                payee_id: booking.provider_id,
                amount: Amount::new(booking.total_amount)?,
                currency: booking.currency.clone(),
                exchange_rate: request.exchange_rate.unwrap_or(Decimal::ONE),
                method: request.method,
                gateway: request.gateway,
            },
            &self.policy,
            now,
        )?;
        // Conditional insert: this is where a concurrent second payment loses.
        let payment = self.payments.insert(payment).await?;

        let customer_email = match self.catalog.find_user(request.payer_id).await {
            Ok(user) => user.and_then(|user| user.email),
            Err(err) => {
                warn!(payer_id = %request.payer_id, error = %err, "payer lookup failed");
                None
            }
        };
        let intent_request = IntentRequest {
            payment_id: payment.id,
            booking_id: booking.id,
            transaction_id: payment.transaction_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            method: payment.payment_method,
            customer_email,
        };

        let intent = match self
            .call_gateway(request.gateway, "create intent", adapter.create_intent(&intent_request))
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                warn!(
                    payment_id = %payment.id,
                    gateway = %request.gateway,
                    error = %err,
                    "intent creation failed, releasing reservation"
                );
                let reason = format!("Intent creation failed: {}", err);
                let released = self
                    .update_payment_with(payment.id, |payment, now| {
                        if payment.status != PaymentStatus::Pending {
                            return Ok(false);
                        }
                        payment.cancel(&reason, now)?;
                        Ok(true)
                    })
                    .await;
                if let Err(release_err) = released {
                    error!(
                        payment_id = %payment.id,
                        error = %release_err,
                        "failed to release payment reservation"
                    );
                }
                return Err(err);
            }
        };

        let (payment, _) = self
            .update_payment_with(payment.id, |payment, now| {
                payment.bind_gateway(&intent, now)?;
                Ok(true)
            })
            .await?;
        info!(
            payment_id = %payment.id,
            transaction_id = %payment.transaction_id,
            booking_id = %booking.id,
            gateway = %payment.payment_gateway,
            amount = %payment.amount,
            "payment intent created"
        );

        Ok(PaymentIntent {
            payment_id: payment.id,
            transaction_id: payment.transaction_id.clone(),
            gateway_transaction_id: intent.transaction_id,
            gateway_intent_ref: intent.client_reference,
            amount: payment.amount,
            currency: payment.currency,
        })
    }

    /// Verifies a payment with its provider and applies the result.
    ///
    /// Calling it again on a completed payment returns the payment unchanged;
    /// a payment the provider still reports as pending stays in processing
    /// and can be confirmed again later.
    pub async fn confirm_payment(
        &self,
        payment_id: Uuid,
        gateway_transaction_id: &str,
    ) -> Result<Payment> {
        let payment = self.load_payment(payment_id).await?;
        if payment.gateway_transaction_id.as_deref() != Some(gateway_transaction_id) {
            return Err(BookpayError::VerificationFailed(format!(
                "transaction {} does not belong to payment {}",
                gateway_transaction_id, payment.transaction_id
            )));
        }
        if payment.status == PaymentStatus::Completed {
            return Ok(payment);
        }

        let now = self.clock.now();
        if payment.is_stale(now) {
            self.expire_if_stale(payment.id).await?;
            return Err(BookpayError::invalid_transition(
                "payment",
                PaymentStatus::Expired,
                "confirm",
            ));
        }
        let adapter = self.gateways.require(payment.payment_gateway)?;

        // A webhook may settle the payment between the read above and this write.
        let (payment, started) = self
            .update_payment_with(payment_id, |payment, now| match payment.status {
                PaymentStatus::Pending => {
                    payment.begin_processing(now)?;
                    Ok(true)
                }
                PaymentStatus::Processing | PaymentStatus::Completed => Ok(false),
                other => Err(BookpayError::invalid_transition("payment", other, "confirm")),
            })
            .await?;
        if payment.status == PaymentStatus::Completed {
            return Ok(payment);
        }
        if started {
            info!(payment_id = %payment.id, "payment processing");
        }

        let verification = self
            .call_gateway(
                payment.payment_gateway,
                "verify transaction",
                adapter.verify_transaction(gateway_transaction_id),
            )
            .await;

        let failure = match verification {
            Ok(verification) => match verification.status {
                VerificationStatus::Succeeded => match verification.amount {
                    Some(reported) if round_money(reported) != payment.amount => {
                        BookpayError::VerificationFailed(format!(
                            "provider captured {} but {} was expected",
                            reported, payment.amount
                        ))
                    }
                    _ => {
                        let applied = self
                            .apply_provider_outcome(payment.id, ProviderOutcome::Succeeded)
                            .await?;
                        return match applied {
                            Some(payment) => Ok(payment),
                            None => self.load_payment(payment.id).await,
                        };
                    }
                },
                VerificationStatus::Pending => {
                    info!(payment_id = %payment.id, "provider still processing payment");
                    return Ok(payment);
                }
                VerificationStatus::Failed { reason } => BookpayError::VerificationFailed(reason),
            },
            Err(err) => err,
        };

        let reason = match &failure {
            BookpayError::VerificationFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        self.apply_provider_outcome(payment.id, ProviderOutcome::Failed { reason })
            .await?;
        Err(failure)
    }

    /// Applies an outcome if it is legal from the payment's current state.
    ///
    /// Returns `None` when the outcome was already applied or no longer
    /// applies; version conflicts reload and re-evaluate.
    pub async fn apply_provider_outcome(
        &self,
        payment_id: Uuid,
        outcome: ProviderOutcome,
    ) -> Result<Option<Payment>> {
        let current = self.load_payment(payment_id).await?;
        let base_amount = match outcome {
            ProviderOutcome::Succeeded => self.load_booking(current.booking_id).await?.base_amount,
            _ => Decimal::ZERO,
        };
        let processing_fee = self.policy.processing_fee;
        let escrow_hours = self.policy.escrow_hold_hours;

        let (payment, changed) = self
            .update_payment_with(payment_id, |payment, now| {
                let settling = matches!(
                    payment.status,
                    PaymentStatus::Pending | PaymentStatus::Processing
                );
                match &outcome {
                    ProviderOutcome::Succeeded if settling => {
                        let fees = compute_fees(
                            base_amount,
                            payment.amount,
                            payment.payment_gateway,
                            processing_fee,
                        );
                        payment.complete(fees, now)?;
                        if let Some(hours) = escrow_hours {
                            payment.hold_in_escrow(
                                hours,
                                ReleaseCondition::HoldPeriodElapsed,
                                now,
                            )?;
                        }
                        Ok(true)
                    }
                    ProviderOutcome::Failed { reason } if settling => {
                        payment.fail(reason, now)?;
                        Ok(true)
                    }
                    ProviderOutcome::Disputed { .. }
                        if payment.status == PaymentStatus::Completed =>
                    {
                        payment.dispute(now)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await?;

        if !changed {
            debug!(
                %payment_id,
                status = %payment.status,
                ?outcome,
                "provider outcome not applicable"
            );
            return Ok(None);
        }
        info!(
            %payment_id,
            status = %payment.status,
            attempts = payment.attempts,
            next_retry_at = ?payment.next_retry_at,
            "payment transition applied"
        );
        self.after_transition(&payment, &outcome).await;
        Ok(Some(payment))
    }

    /// Moves a failed payment back to pending once its retry is due.
    pub async fn retry_payment(&self, payment_id: Uuid) -> Result<Payment> {
        let payment = self.load_payment(payment_id).await?;
        let booking = self.load_booking(payment.booking_id).await?;
        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(BookpayError::ValidationError(format!(
                "Booking {} is {}; payment can no longer be retried",
                booking.booking_number, booking.status
            )));
        }

        let policy = &self.policy;
        let (payment, _) = self
            .update_payment_with(payment_id, |payment, now| {
                payment.reenter_pending(policy, now)?;
                Ok(true)
            })
            .await?;
        info!(%payment_id, attempts = payment.attempts, "payment re-entered pending");
        self.propagate(&payment).await;
        Ok(payment)
    }

    /// Failed payments whose retry time has come; polled by an external scheduler.
    pub async fn payments_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        self.payments.due_for_retry(now).await
    }

    /// Refunds `amount` (or everything that remains) through the provider.
    ///
    /// The amount is reserved on the payment before the provider is called,
    /// so concurrent refunds never claim more than was captured.
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        amount: Option<Decimal>,
        reason: &str,
    ) -> Result<RefundResult> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BookpayError::ValidationError(
                "Refund reason is required".to_string(),
            ));
        }
        let payment = self.load_payment(payment_id).await?;
        payment.refundable_amount(amount)?;
        let transaction_id = payment.gateway_transaction_id.clone().ok_or_else(|| {
            BookpayError::NotRefundable(format!(
                "payment {} has no provider transaction",
                payment.transaction_id
            ))
        })?;
        let adapter = self.gateways.require(payment.payment_gateway)?;

        let mut reservation = None;
        self.update_payment_with(payment_id, |payment, now| {
            reservation = Some(payment.reserve_refund(amount, now)?);
            Ok(true)
        })
        .await?;
        let Some(reservation) = reservation else {
            return Err(BookpayError::Conflict(format!(
                "refund of payment {} was not reserved",
                payment.transaction_id
            )));
        };
        let refund_amount = reservation.amount;
        debug!(
            %payment_id,
            amount = %refund_amount,
            key = %reservation.idempotency_key,
            "refund reserved"
        );

        let executed = self
            .call_gateway(
                payment.payment_gateway,
                "create refund",
                adapter.create_refund(&RefundRequest {
                    payment_id,
                    transaction_id,
                    amount: refund_amount,
                    currency: payment.currency.clone(),
                    reason: reason.to_string(),
                    idempotency_key: reservation.idempotency_key.clone(),
                }),
            )
            .await;
        let refund = match executed {
            Ok(refund) => refund,
            Err(err) => {
                let released = self
                    .update_payment_with(payment_id, |payment, now| {
                        payment.release_refund(refund_amount, now);
                        Ok(true)
                    })
                    .await;
                if let Err(release_err) = released {
                    error!(
                        %payment_id,
                        amount = %refund_amount,
                        error = %release_err,
                        "refund reservation not released"
                    );
                }
                return Err(err);
            }
        };

        let recorded = self
            .update_payment_with(payment_id, |payment, now| {
                payment.record_refund(refund_amount, reason, refund.refund_id.clone(), now)?;
                Ok(true)
            })
            .await;
        let (payment, _) = match recorded {
            Ok(recorded) => recorded,
            Err(err) => {
                error!(
                    %payment_id,
                    refund_id = %refund.refund_id,
                    amount = %refund_amount,
                    error = %err,
                    "provider refund executed but not recorded; amount stays reserved"
                );
                return Err(err);
            }
        };

        info!(
            %payment_id,
            refund_id = %refund.refund_id,
            amount = %refund_amount,
            refunded_amount = %payment.refunded_amount,
            status = %payment.status,
            "payment refunded"
        );
        if let Err(err) = self.propagator.record_refund(&payment, refund_amount).await {
            warn!(%payment_id, error = %err, "refund not propagated to booking");
        }
        notify_all(
            &self.notifier,
            NotificationEvent::PaymentRefunded,
            &[payment.payer_id],
            json!({
                "payment_id": payment.id,
                "amount": refund_amount,
                "currency": payment.currency,
                "refund_id": refund.refund_id,
            }),
        );

        Ok(RefundResult {
            payment_id,
            refund_id: refund.refund_id,
            amount: refund_amount,
            refunded_amount: payment.refunded_amount,
            remaining: payment.remaining_refundable(),
            status: payment.status,
        })
    }

    /// Executes a cancellation refund and records its outcome on the booking.
    /// A provider failure is recorded as a failed refund, not returned.
    pub async fn refund_cancellation(
        &self,
        booking_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> Result<Booking> {
        let (status, refunded) = match self.refund_payment(payment_id, Some(amount), reason).await {
            Ok(refund) => (RefundStatus::Processed, refund.amount),
            Err(err) => {
                error!(
                    %booking_id,
                    %payment_id,
                    %amount,
                    error = %err,
                    "cancellation refund failed"
                );
                (RefundStatus::Failed, Decimal::ZERO)
            }
        };
        update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            booking.record_refund_outcome(status, refunded, now)?;
            Ok(true)
        })
        .await
    }

    pub async fn hold_in_escrow(
        &self,
        payment_id: Uuid,
        hold_period_hours: u32,
        condition: ReleaseCondition,
    ) -> Result<Payment> {
        let (payment, _) = self
            .update_payment_with(payment_id, |payment, now| {
                payment.hold_in_escrow(hold_period_hours, condition, now)?;
                Ok(true)
            })
            .await?;
        info!(%payment_id, hold_period_hours, ?condition, "payment held in escrow");
        Ok(payment)
    }

    /// Releases escrowed funds; releasing twice is a no-op.
    pub async fn release_from_escrow(&self, payment_id: Uuid) -> Result<Payment> {
        let (payment, released) = self
            .update_payment_with(payment_id, |payment, now| payment.release_from_escrow(now))
            .await?;
        if released {
            info!(%payment_id, "escrow released");
            notify_all(
                &self.notifier,
                NotificationEvent::EscrowReleased,
                &[payment.payee_id],
                json!({ "payment_id": payment.id, "amount": payment.amount }),
            );
        }
        Ok(payment)
    }

    /// Releases whatever the booking's payment still holds in escrow.
    pub async fn release_escrow_for_booking(&self, booking_id: Uuid) -> Result<Option<Payment>> {
        let escrowed = self
            .payments
            .find_by_booking(booking_id)
            .await?
            .into_iter()
            .find(Payment::is_escrowed);
        match escrowed {
            Some(payment) => Ok(Some(self.release_from_escrow(payment.id).await?)),
            None => Ok(None),
        }
    }

    /// Escrows whose hold period has elapsed; polled by an external scheduler.
    pub async fn escrows_due_for_release(&self, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        Ok(self
            .payments
            .get_all()
            .await?
            .into_iter()
            .filter(|payment| payment.escrow_release_due(now))
            .collect())
    }

    /// Withdraws any pending payment of a booking that is going away.
    pub async fn cancel_pending_for_booking(
        &self,
        booking_id: Uuid,
        reason: &str,
    ) -> Result<Vec<Payment>> {
        let mut withdrawn = Vec::new();
        for payment in self.payments.find_by_booking(booking_id).await? {
            if payment.status != PaymentStatus::Pending {
                continue;
            }
            let (payment, changed) = self
                .update_payment_with(payment.id, |payment, now| {
                    if payment.is_stale(now) {
                        payment.expire(now)?;
                    } else if payment.status == PaymentStatus::Pending {
                        payment.cancel(reason, now)?;
                    } else {
                        return Ok(false);
                    }
                    Ok(true)
                })
                .await?;
            if changed {
                info!(
                    payment_id = %payment.id,
                    %booking_id,
                    status = %payment.status,
                    "pending payment withdrawn"
                );
                withdrawn.push(payment);
            }
        }
        Ok(withdrawn)
    }

    /// Re-applies a payment's current state to its booking.
    pub async fn sync_booking(&self, payment_id: Uuid) -> Result<Booking> {
        let payment = self.load_payment(payment_id).await?;
        self.propagator.apply(&payment).await
    }

    /// Reads a payment, expiring it first when its pending window has closed.
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<Payment> {
        let payment = self.load_payment(payment_id).await?;
        if payment.is_stale(self.clock.now()) {
            return self.expire_if_stale(payment_id).await;
        }
        Ok(payment)
    }

    pub async fn payments_for_booking(&self, booking_id: Uuid) -> Result<Vec<Payment>> {
        self.payments.find_by_booking(booking_id).await
    }

    /// The booking's completed payment, if any.
    pub async fn completed_payment_for(&self, booking_id: Uuid) -> Result<Option<Payment>> {
        Ok(self
            .payments
            .find_by_booking(booking_id)
            .await?
            .into_iter()
            .find(|payment| payment.status == PaymentStatus::Completed))
    }

    async fn after_transition(&self, payment: &Payment, outcome: &ProviderOutcome) {
        let booking = self.propagate(payment).await;
        if matches!(outcome, ProviderOutcome::Succeeded)
            && let Some(booking) = &booking
            && booking.status == BookingStatus::Cancelled
        {
            self.refund_late_payment(payment, booking.id).await;
        }
        let payload = json!({
            "payment_id": payment.id,
            "booking_id": payment.booking_id,
            "transaction_id": payment.transaction_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "status": payment.status,
        });
        match outcome {
            ProviderOutcome::Succeeded => notify_all(
                &self.notifier,
                NotificationEvent::PaymentCompleted,
                &[payment.payer_id, payment.payee_id],
                payload,
            ),
            ProviderOutcome::Failed { .. } => notify_all(
                &self.notifier,
                NotificationEvent::PaymentFailed,
                &[payment.payer_id],
                payload,
            ),
            ProviderOutcome::Disputed { reason } => {
                warn!(payment_id = %payment.id, %reason, "payment disputed");
                if booking.is_some_and(|b| b.status == BookingStatus::Disputed) {
                    notify_all(
                        &self.notifier,
                        NotificationEvent::BookingDisputed,
                        &[payment.payer_id, payment.payee_id],
                        payload,
                    );
                }
            }
        }
    }

    /// Refunds a payment that settled after its booking was cancelled, by the
    /// tier in force when the booking was cancelled.
    async fn refund_late_payment(&self, payment: &Payment, booking_id: Uuid) {
        let mut owed = Decimal::ZERO;
        let mut reason = String::new();
        let marked = update_booking_with(&self.bookings, &self.clock, booking_id, |booking, now| {
            owed = booking.owe_refund_for_late_payment(now)?;
            reason = booking
                .cancellation
                .as_ref()
                .map(|cancellation| cancellation.reason.clone())
                .unwrap_or_default();
            Ok(owed > Decimal::ZERO)
        })
        .await;

        match marked {
            Ok(_) if owed > Decimal::ZERO => {
                warn!(
                    payment_id = %payment.id,
                    %booking_id,
                    amount = %owed,
                    "payment settled after cancellation, refunding"
                );
                if let Err(err) = self
                    .refund_cancellation(booking_id, payment.id, owed, &reason)
                    .await
                {
                    error!(
                        payment_id = %payment.id,
                        %booking_id,
                        error = %err,
                        "late refund not recorded"
                    );
                }
            }
            Ok(_) => {
                info!(
                    payment_id = %payment.id,
                    %booking_id,
                    "payment settled after cancellation, nothing owed"
                );
            }
            Err(err) => {
                error!(
                    payment_id = %payment.id,
                    %booking_id,
                    error = %err,
                    "late refund not scheduled"
                );
            }
        }
    }

    /// Booking propagation failures are logged; `sync_booking` repeats it.
    async fn propagate(&self, payment: &Payment) -> Option<Booking> {
        match self.propagator.apply(payment).await {
            Ok(booking) => Some(booking),
            Err(err) => {
                warn!(
                    payment_id = %payment.id,
                    booking_id = %payment.booking_id,
                    error = %err,
                    "booking propagation failed"
                );
                None
            }
        }
    }

    async fn expire_if_stale(&self, payment_id: Uuid) -> Result<Payment> {
        let (payment, expired) = self
            .update_payment_with(payment_id, |payment, now| {
                if !payment.is_stale(now) {
                    return Ok(false);
                }
                payment.expire(now)?;
                Ok(true)
            })
            .await?;
        if expired {
            info!(%payment_id, "pending payment expired");
        }
        Ok(payment)
    }

    async fn call_gateway<T, F>(
        &self,
        gateway: PaymentGateway,
        operation: &'static str,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    %gateway,
                    operation,
                    timeout = ?self.gateway_timeout,
                    "gateway call timed out"
                );
                Err(BookpayError::GatewayUnavailable(format!(
                    "{} {} timed out after {:?}",
                    gateway, operation, self.gateway_timeout
                )))
            }
        }
    }

    /// Load, change, compare-and-swap; reloads on a lost race. The flag
    /// reports whether `change` modified (and so wrote) the payment.
    async fn update_payment_with<F>(
        &self,
        payment_id: Uuid,
        mut change: F,
    ) -> Result<(Payment, bool)>
    where
        F: FnMut(&mut Payment, DateTime<Utc>) -> Result<bool>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut payment = self.load_payment(payment_id).await?;
            if !change(&mut payment, self.clock.now())? {
                return Ok((payment, false));
            }
            match self.payments.update(payment).await {
                Ok(payment) => return Ok((payment, true)),
                Err(BookpayError::Conflict(reason)) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(%payment_id, %reason, attempt, "payment write conflict, reloading");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn load_payment(&self, payment_id: Uuid) -> Result<Payment> {
        self.payments
            .get(payment_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("payment", payment_id))
    }

    async fn load_booking(&self, booking_id: Uuid) -> Result<Booking> {
        self.bookings
            .get(booking_id)
            .await?
            .ok_or_else(|| BookpayError::not_found("booking", booking_id))
    }
}
