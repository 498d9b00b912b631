use crate::domain::fees;
use crate::domain::gateway::PaymentGateway;
use crate::domain::money::{Amount, Currency, round_money};
use crate::error::{BookpayError, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Disputed,
    Refunded,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        Self::Pending,
        Self::Confirmed,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
        Self::Disputed,
        Self::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
            Self::Refunded => "refunded",
        }
    }

    /// Edges of the booking lifecycle graph.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InProgress)
                | (Confirmed, Cancelled)
                | (Confirmed, Disputed)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Disputed)
                | (Completed, Disputed)
                | (Completed, Refunded)
        )
    }

    /// Bookings in these states hold the provider's calendar slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Disputed | Self::Refunded
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment progress as seen from the booking; tracked separately from the
/// payment record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPaymentStatus {
    Pending,
    /// Paid, then partially refunded.
    Partial,
    Paid,
    Refunded,
    Disputed,
    Failed,
}

impl BookingPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: BookingPaymentStatus) -> bool {
        use BookingPaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Failed, Paid)
                | (Paid, Partial)
                | (Paid, Refunded)
                | (Paid, Disputed)
                | (Partial, Partial)
                | (Partial, Refunded)
                | (Partial, Disputed)
        )
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid | Self::Partial)
    }
}

impl fmt::Display for BookingPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    User(Uuid),
    Gateway(PaymentGateway),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Gateway(gateway) => write!(f, "gateway:{}", gateway),
            Self::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    Created,
    Confirmed,
    Started,
    Completed,
    Cancelled,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleRejected,
    PaymentPending,
    PaymentReceived,
    PaymentFailed,
    PaymentPartiallyRefunded,
    PaymentRefunded,
    PaymentDisputed,
    RefundRecorded,
    Disputed,
    Refunded,
    Archived,
}

impl From<BookingPaymentStatus> for TimelineEvent {
    fn from(status: BookingPaymentStatus) -> Self {
        match status {
            BookingPaymentStatus::Pending => Self::PaymentPending,
            BookingPaymentStatus::Partial => Self::PaymentPartiallyRefunded,
            BookingPaymentStatus::Paid => Self::PaymentReceived,
            BookingPaymentStatus::Refunded => Self::PaymentRefunded,
            BookingPaymentStatus::Disputed => Self::PaymentDisputed,
            BookingPaymentStatus::Failed => Self::PaymentFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub event: TimelineEvent,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub description: String,
}

/// Append-only audit trail of a booking.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline(Vec<TimelineEntry>);

impl Timeline {
    fn push(
        &mut self,
        event: TimelineEvent,
        actor: Actor,
        now: DateTime<Utc>,
        description: String,
    ) {
        self.0.push(TimelineEntry {
            event,
            timestamp: now,
            actor,
            description,
        });
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&TimelineEntry> {
        self.0.last()
    }

    pub fn count(&self, event: TimelineEvent) -> usize {
        self.0.iter().filter(|entry| entry.event == event).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub estimated_duration_minutes: u32,
}

impl Schedule {
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.scheduled_date.and_time(self.scheduled_time).and_utc()
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at() + Duration::minutes(i64::from(self.estimated_duration_minutes))
    }

    pub fn overlaps(&self, other: &Schedule) -> bool {
        self.starts_at() < other.ends_at() && other.starts_at() < self.ends_at()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub requested_date: NaiveDate,
    pub requested_time: NaiveTime,
    pub reason: String,
    pub requested_by: Uuid,
    pub requested_at: DateTime<Utc>,
    pub status: RescheduleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    NotApplicable,
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub cancelled_by: Uuid,
    pub cancelled_at: DateTime<Utc>,
    pub reason: String,
    pub refund_amount: Decimal,
    pub refund_status: RefundStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Provider,
    Requester,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingPolicy {
    /// How long a pending booking waits for confirmation.
    pub booking_ttl: Duration,
    pub max_reschedules: u8,
    pub allow_cancel_in_progress: bool,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            booking_ttl: Duration::hours(24),
            max_reschedules: 3,
            allow_cancel_in_progress: true,
        }
    }
}

/// Input for a new booking; prices come from the catalog, never the requester.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub requester_id: Uuid,
    pub schedule: Schedule,
    pub location: String,
    pub base_amount: Amount,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub booking_number: String,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub requester_id: Uuid,
    pub schedule: Schedule,
    pub location: String,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub base_amount: Decimal,
    pub platform_fee: Decimal,
    pub total_amount: Decimal,
    pub currency: Currency,
    pub status: BookingStatus,
    pub payment_status: BookingPaymentStatus,
    pub timeline: Timeline,
    pub reschedule: Option<RescheduleRequest>,
    pub reschedule_count: u8,
    pub cancellation: Option<Cancellation>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Booking {
    pub fn new(input: NewBooking, policy: &BookingPolicy, now: DateTime<Utc>) -> Result<Self> {
        if input.provider_id == input.requester_id {
            return Err(BookpayError::ValidationError(
                "Provider cannot book their own service".to_string(),
            ));
        }
        if input.schedule.estimated_duration_minutes == 0 {
            return Err(BookpayError::ValidationError(
                "Estimated duration must be positive".to_string(),
            ));
        }
        if input.schedule.starts_at() <= now {
            return Err(BookpayError::ValidationError(
                "Scheduled time must be in the future".to_string(),
            ));
        }
        let location = input.location.trim().to_string();
        if location.is_empty() {
            return Err(BookpayError::ValidationError(
                "Location is required".to_string(),
            ));
        }

        let base = input.base_amount.value();
        let platform_fee = fees::platform_fee(base);
        let id = Uuid::new_v4();

        let mut booking = Self {
            id,
            booking_number: booking_number(id, now),
            service_id: input.service_id,
            provider_id: input.provider_id,
            requester_id: input.requester_id,
            schedule: input.schedule,
            location,
            actual_start_time: None,
            actual_end_time: None,
            base_amount: round_money(base),
            platform_fee: round_money(platform_fee),
            total_amount: round_money(base + platform_fee),
            currency: input.currency,
            status: BookingStatus::Pending,
            payment_status: BookingPaymentStatus::Pending,
            timeline: Timeline::default(),
            reschedule: None,
            reschedule_count: 0,
            cancellation: None,
            expires_at: Some(now + policy.booking_ttl),
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        };
        booking.record(
            TimelineEvent::Created,
            Actor::User(input.requester_id),
            now,
            format!("Booking requested for {}", booking.schedule.starts_at()),
        );
        Ok(booking)
    }

    pub fn party_role(&self, user_id: Uuid) -> Option<PartyRole> {
        if user_id == self.provider_id {
            Some(PartyRole::Provider)
        } else if user_id == self.requester_id {
            Some(PartyRole::Requester)
        } else {
            None
        }
    }

    /// Lazily evaluated: nothing sweeps expired bookings.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending && self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn pending_reschedule(&self) -> Option<&RescheduleRequest> {
        self.reschedule
            .as_ref()
            .filter(|request| request.status == RescheduleStatus::Pending)
    }

    pub fn hours_until_service(&self, now: DateTime<Utc>) -> Decimal {
        fees::hours_until(now, self.schedule.starts_at())
    }

    pub fn confirm(&mut self, actor: Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_status(&[BookingStatus::Pending], "confirm")?;
        if self.is_expired(now) {
            return Err(BookpayError::BookingExpired(self.id));
        }
        self.status = BookingStatus::Confirmed;
        self.expires_at = None;
        self.record(TimelineEvent::Confirmed, actor, now, "Booking confirmed".to_string());
        Ok(())
    }

    pub fn start(&mut self, actor: Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_status(&[BookingStatus::Confirmed], "start")?;
        self.status = BookingStatus::InProgress;
        self.actual_start_time = Some(now);
        self.record(TimelineEvent::Started, actor, now, "Service started".to_string());
        Ok(())
    }

    pub fn complete(&mut self, actor: Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_status(&[BookingStatus::InProgress], "complete")?;
        self.status = BookingStatus::Completed;
        self.actual_end_time = Some(now);
        self.record(TimelineEvent::Completed, actor, now, "Service completed".to_string());
        Ok(())
    }

    /// Cancels the booking and returns the refund owed to the requester.
    ///
    /// No money moves here; the amount is recorded with a pending refund
    /// status for the payment side to execute.
    pub fn cancel(
        &mut self,
        cancelled_by: Uuid,
        reason: &str,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let allowed: &[BookingStatus] = if policy.allow_cancel_in_progress {
            &[
                BookingStatus::Pending,
                BookingStatus::Confirmed,
                BookingStatus::InProgress,
            ]
        } else {
            &[BookingStatus::Pending, BookingStatus::Confirmed]
        };
        self.ensure_status(allowed, "cancel")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BookpayError::ValidationError(
                "Cancellation reason is required".to_string(),
            ));
        }

        let refund = if self.payment_status.is_paid() {
            self.refund_owed(cancelled_by, now)
        } else {
            Decimal::ZERO
        };
        let refund_status = if refund > Decimal::ZERO {
            RefundStatus::Pending
        } else {
            RefundStatus::NotApplicable
        };

        self.status = BookingStatus::Cancelled;
        self.expires_at = None;
        if let Some(request) = self.reschedule.as_mut()
            && request.status == RescheduleStatus::Pending
        {
            request.status = RescheduleStatus::Rejected;
        }
        self.cancellation = Some(Cancellation {
            cancelled_by,
            cancelled_at: now,
            reason: reason.to_string(),
            refund_amount: refund,
            refund_status,
        });
        self.record(
            TimelineEvent::Cancelled,
            Actor::User(cancelled_by),
            now,
            format!("Cancelled: {} (refund owed {} {})", reason, refund, self.currency),
        );
        Ok(refund)
    }

    /// Refund the requester is owed for a cancellation by `cancelled_by` at `at`.
    fn refund_owed(&self, cancelled_by: Uuid, at: DateTime<Utc>) -> Decimal {
        let refund = if cancelled_by == self.provider_id {
            self.total_amount
        } else {
            fees::refund_amount(self.total_amount, self.hours_until_service(at))
        };
        round_money(refund)
    }

    /// A payment that settles after the booking was cancelled unpaid owes
    /// what the cancellation would have owed had it been paid then.
    ///
    /// Returns zero, changing nothing, when a refund was already settled.
    pub fn owe_refund_for_late_payment(&mut self, now: DateTime<Utc>) -> Result<Decimal> {
        let current = self.status;
        let (cancelled_by, cancelled_at) = match &self.cancellation {
            Some(cancellation) if current == BookingStatus::Cancelled => {
                if cancellation.refund_status != RefundStatus::NotApplicable {
                    return Ok(Decimal::ZERO);
                }
                (cancellation.cancelled_by, cancellation.cancelled_at)
            }
            _ => {
                return Err(BookpayError::invalid_transition(
                    "booking",
                    current,
                    "owe a cancellation refund for",
                ));
            }
        };
        let refund = self.refund_owed(cancelled_by, cancelled_at);
        if refund <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        if let Some(cancellation) = self.cancellation.as_mut() {
            cancellation.refund_amount = refund;
            cancellation.refund_status = RefundStatus::Pending;
        }
        self.updated_at = now;
        Ok(refund)
    }

    pub fn request_reschedule(
        &mut self,
        requested_date: NaiveDate,
        requested_time: NaiveTime,
        reason: &str,
        requested_by: Uuid,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_status(
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            "reschedule",
        )?;
        if self.pending_reschedule().is_some() {
            return Err(BookpayError::ValidationError(
                "A reschedule request is already pending".to_string(),
            ));
        }
        if self.reschedule_count >= policy.max_reschedules {
            return Err(BookpayError::ValidationError(format!(
                "Reschedule limit of {} reached",
                policy.max_reschedules
            )));
        }
        if requested_date.and_time(requested_time).and_utc() <= now {
            return Err(BookpayError::ValidationError(
                "Requested time must be in the future".to_string(),
            ));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BookpayError::ValidationError(
                "Reschedule reason is required".to_string(),
            ));
        }

        self.reschedule = Some(RescheduleRequest {
            requested_date,
            requested_time,
            reason: reason.to_string(),
            requested_by,
            requested_at: now,
            status: RescheduleStatus::Pending,
        });
        self.record(
            TimelineEvent::RescheduleRequested,
            Actor::User(requested_by),
            now,
            format!("Reschedule to {} {} requested: {}", requested_date, requested_time, reason),
        );
        Ok(())
    }

    pub fn approve_reschedule(&mut self, actor: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.ensure_status(
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            "approve a reschedule for",
        )?;
        let (date, time) = match self.pending_reschedule() {
            Some(request) => (request.requested_date, request.requested_time),
            None => {
                return Err(BookpayError::ValidationError(
                    "No pending reschedule request".to_string(),
                ));
            }
        };
        if date.and_time(time).and_utc() <= now {
            return Err(BookpayError::ValidationError(
                "Requested time has already passed".to_string(),
            ));
        }

        self.schedule.scheduled_date = date;
        self.schedule.scheduled_time = time;
        self.reschedule_count += 1;
        if let Some(request) = self.reschedule.as_mut() {
            request.status = RescheduleStatus::Approved;
        }
        self.record(
            TimelineEvent::RescheduleApproved,
            Actor::User(actor),
            now,
            format!("Rescheduled to {} {}", date, time),
        );
        Ok(())
    }

    pub fn reject_reschedule(
        &mut self,
        actor: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_status(
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            "reject a reschedule for",
        )?;
        if self.pending_reschedule().is_none() {
            return Err(BookpayError::ValidationError(
                "No pending reschedule request".to_string(),
            ));
        }
        if let Some(request) = self.reschedule.as_mut() {
            request.status = RescheduleStatus::Rejected;
        }
        self.record(
            TimelineEvent::RescheduleRejected,
            Actor::User(actor),
            now,
            format!("Reschedule rejected: {}", reason.trim()),
        );
        Ok(())
    }

    pub fn mark_disputed(&mut self, actor: Actor, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(BookingStatus::Disputed, "dispute")?;
        self.status = BookingStatus::Disputed;
        self.record(TimelineEvent::Disputed, actor, now, format!("Disputed: {}", reason));
        Ok(())
    }

    /// A completed booking whose payment was returned in full.
    pub fn mark_refunded(&mut self, actor: Actor, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(BookingStatus::Refunded, "refund")?;
        self.status = BookingStatus::Refunded;
        self.record(TimelineEvent::Refunded, actor, now, "Booking refunded".to_string());
        Ok(())
    }

    /// Moves the payment mirror; returns `false` when already in `next`.
    pub fn record_payment_status(
        &mut self,
        next: BookingPaymentStatus,
        actor: Actor,
        now: DateTime<Utc>,
        description: String,
    ) -> Result<bool> {
        if self.payment_status == next && next != BookingPaymentStatus::Partial {
            return Ok(false);
        }
        if !self.payment_status.can_transition_to(next) {
            return Err(BookpayError::invalid_transition(
                "booking payment",
                self.payment_status,
                "update payment status of",
            ));
        }
        self.payment_status = next;
        self.record(next.into(), actor, now, description);
        Ok(true)
    }

    pub fn record_refund_outcome(
        &mut self,
        status: RefundStatus,
        refunded: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = self.status;
        match self.cancellation.as_mut() {
            Some(cancellation) => cancellation.refund_status = status,
            None => {
                return Err(BookpayError::invalid_transition(
                    "booking",
                    current,
                    "record a refund for",
                ));
            }
        }
        let currency = self.currency.clone();
        self.record(
            TimelineEvent::RefundRecorded,
            Actor::System,
            now,
            format!("Cancellation refund {:?}: {} {}", status, refunded, currency),
        );
        Ok(())
    }

    /// Soft delete; terminal bookings only.
    pub fn archive(&mut self, actor: Actor, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_terminal() || self.archived_at.is_some() {
            return Err(BookpayError::invalid_transition("booking", self.status, "archive"));
        }
        self.archived_at = Some(now);
        self.record(TimelineEvent::Archived, actor, now, "Booking archived".to_string());
        Ok(())
    }

    fn ensure_status(&self, allowed: &[BookingStatus], action: &'static str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(BookpayError::invalid_transition("booking", self.status, action))
        }
    }

    fn ensure_transition(&self, next: BookingStatus, action: &'static str) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(BookpayError::invalid_transition("booking", self.status, action))
        }
    }

    fn record(
        &mut self,
        event: TimelineEvent,
        actor: Actor,
        now: DateTime<Utc>,
        description: String,
    ) {
        self.timeline.push(event, actor, now, description);
        self.updated_at = now;
    }
}

fn booking_number(id: Uuid, now: DateTime<Utc>) -> String {
    let suffix = id.simple().to_string()[..8].to_ascii_uppercase();
    format!("BK-{}-{}", now.format("%Y%m%d"), suffix)
}
