use crate::domain::fees::PaymentFees;
use crate::domain::gateway::{GatewayIntent, PaymentGateway, PaymentMethod};
use crate::domain::money::{Amount, Currency, round_money};
use crate::error::{BookpayError, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Disputed,
    Expired,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 8] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Refunded,
        Self::Disputed,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
            Self::Expired => "expired",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Refunded)
                | (Completed, Disputed)
                | (Failed, Pending)
        )
    }

    /// At most one payment per booking may be in one of these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Completed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCondition {
    /// Released when the provider completes the booking.
    ServiceCompleted,
    /// Released by an external sweep once the hold period has elapsed.
    HoldPeriodElapsed,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowDetails {
    pub escrowed_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub hold_period_hours: u32,
    pub release_condition: ReleaseCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub amount: Decimal,
    pub reason: String,
    pub refunded_at: DateTime<Utc>,
    pub gateway_refund_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReservation {
    pub amount: Decimal,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPolicy {
    pub payment_ttl: Duration,
    pub max_attempts: u32,
    pub processing_fee: Decimal,
    /// Completed payments are held automatically when set.
    pub escrow_hold_hours: Option<u32>,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            payment_ttl: Duration::minutes(30),
            max_attempts: 3,
            processing_fee: Decimal::ZERO,
            escrow_hold_hours: None,
        }
    }
}

/// Largest accepted `max_attempts`; the last backoff is then about 45 days.
pub const MAX_PAYMENT_ATTEMPTS: u32 = 16;

/// Delay before the next attempt after `attempts` failures: 2^attempts minutes.
/// `None` once the delay no longer fits in a `Duration`.
pub fn retry_delay(attempts: u32) -> Option<Duration> {
    2_i64.checked_pow(attempts).and_then(Duration::try_minutes)
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub booking_id: Uuid,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub amount: Amount,
    pub currency: Currency,
    pub exchange_rate: Decimal,
    pub method: PaymentMethod,
    pub gateway: PaymentGateway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub transaction_id: String,
    pub booking_id: Uuid,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
    pub exchange_rate: Decimal,
    pub amount_in_base_currency: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_gateway: PaymentGateway,
    pub gateway_transaction_id: Option<String>,
    pub gateway_reference: Option<String>,
    pub status: PaymentStatus,
    pub fees: Option<PaymentFees>,
    pub refund_details: Vec<RefundRecord>,
    pub refunded_amount: Decimal,
    /// Reserved for refunds the provider has not confirmed yet.
    #[serde(default)]
    pub refund_in_flight: Decimal,
    /// Number of refund reservations taken; keys provider refund requests.
    #[serde(default)]
    pub refund_sequence: u32,
    pub escrow: Option<EscrowDetails>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl Payment {
    pub fn new(input: NewPayment, policy: &PaymentPolicy, now: DateTime<Utc>) -> Result<Self> {
        if input.exchange_rate <= Decimal::ZERO {
            return Err(BookpayError::ValidationError(
                "Exchange rate must be positive".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        let amount = round_money(input.amount.value());

        Ok(Self {
            id,
            transaction_id: transaction_id(id, now),
            booking_id: input.booking_id,
            payer_id: input.payer_id,
            payee_id: input.payee_id,
            amount,
            currency: input.currency,
            exchange_rate: input.exchange_rate,
            amount_in_base_currency: round_money(input.amount.value() * input.exchange_rate),
            payment_method: input.method,
            payment_gateway: input.gateway,
            gateway_transaction_id: None,
            gateway_reference: None,
            status: PaymentStatus::Pending,
            fees: None,
            refund_details: Vec::new(),
            refunded_amount: Decimal::ZERO,
            refund_in_flight: Decimal::ZERO,
            refund_sequence: 0,
            escrow: None,
            attempts: 0,
            max_attempts: policy.max_attempts,
            next_retry_at: None,
            failure_reason: None,
            expires_at: now + policy.payment_ttl,
            completed_at: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
            version: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// A pending payment past its deadline; evaluated lazily.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && now >= self.expires_at
    }

    pub fn remaining_refundable(&self) -> Decimal {
        self.amount - self.refunded_amount
    }

    pub fn is_escrowed(&self) -> bool {
        self.escrow
            .as_ref()
            .is_some_and(|escrow| escrow.released_at.is_none())
    }

    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_stale(now) {
            return Err(BookpayError::invalid_transition("payment", self.status, "expire"));
        }
        self.transition(PaymentStatus::Expired, now);
        Ok(())
    }

    pub fn bind_gateway(&mut self, intent: &GatewayIntent, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Pending], "bind a gateway intent to")?;
        self.gateway_transaction_id = Some(intent.transaction_id.clone());
        self.gateway_reference = Some(intent.client_reference.clone());
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Pending], "process")?;
        if self.is_stale(now) {
            return Err(BookpayError::invalid_transition("payment", "expired", "process"));
        }
        self.transition(PaymentStatus::Processing, now);
        Ok(())
    }

    /// Fees are fixed here and never recomputed.
    pub fn complete(&mut self, fees: PaymentFees, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Pending, PaymentStatus::Processing], "complete")?;
        self.fees = Some(fees.rounded());
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.failure_reason = None;
        self.transition(PaymentStatus::Completed, now);
        Ok(())
    }

    /// Records a failed attempt and schedules the next one while attempts remain.
    /// A backoff that overflows the calendar counts as exhausted.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Pending, PaymentStatus::Processing], "fail")?;
        self.attempts = self.attempts.saturating_add(1);
        self.next_retry_at = if self.attempts < self.max_attempts {
            retry_delay(self.attempts).and_then(|delay| now.checked_add_signed(delay))
        } else {
            None
        };
        self.failure_reason = Some(reason.to_string());
        self.transition(PaymentStatus::Failed, now);
        Ok(())
    }

    pub fn reenter_pending(&mut self, policy: &PaymentPolicy, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Failed], "retry")?;
        match self.next_retry_at {
            None => Err(BookpayError::invalid_transition(
                "payment",
                "failed (attempts exhausted)",
                "retry",
            )),
            Some(at) if at > now => Err(BookpayError::ValidationError(format!(
                "Retry not due until {}",
                at
            ))),
            Some(_) => {
                self.next_retry_at = None;
                self.expires_at = now + policy.payment_ttl;
                self.transition(PaymentStatus::Pending, now);
                Ok(())
            }
        }
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Pending], "cancel")?;
        self.failure_reason = Some(reason.to_string());
        self.transition(PaymentStatus::Cancelled, now);
        Ok(())
    }

    /// The amount a refund request resolves to: the lesser of the requested
    /// amount and what remains unreserved, or everything that does.
    pub fn refundable_amount(&self, requested: Option<Decimal>) -> Result<Decimal> {
        if self.status != PaymentStatus::Completed {
            return Err(BookpayError::NotRefundable(format!(
                "payment {} is {}",
                self.id, self.status
            )));
        }
        let remaining = self.remaining_refundable() - self.refund_in_flight;
        let amount = match requested {
            Some(value) if value <= Decimal::ZERO => {
                return Err(BookpayError::ValidationError(
                    "Refund amount must be positive".to_string(),
                ));
            }
            Some(value) => value.min(remaining),
            None => remaining,
        };
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(BookpayError::NotRefundable(format!(
                "payment {} has nothing left to refund",
                self.id
            )));
        }
        Ok(amount)
    }

    /// Sets aside the refund before the provider is asked to execute it, so
    /// concurrent requests cannot both claim the same funds.
    pub fn reserve_refund(
        &mut self,
        requested: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<RefundReservation> {
        let amount = self.refundable_amount(requested)?;
        self.refund_in_flight += amount;
        self.refund_sequence = self.refund_sequence.saturating_add(1);
        self.updated_at = now;
        Ok(RefundReservation {
            amount,
            idempotency_key: format!("{}-refund-{}", self.id, self.refund_sequence),
        })
    }

    /// Returns a reservation the provider did not execute.
    pub fn release_refund(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.refund_in_flight = (self.refund_in_flight - amount).max(Decimal::ZERO);
        self.updated_at = now;
    }

    pub fn record_refund(
        &mut self,
        amount: Decimal,
        reason: &str,
        gateway_refund_id: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(&[PaymentStatus::Completed], "refund")?;
        if amount <= Decimal::ZERO || amount > self.remaining_refundable() {
            return Err(BookpayError::NotRefundable(format!(
                "refund of {} exceeds the remaining {}",
                amount,
                self.remaining_refundable()
            )));
        }
        self.refund_details.push(RefundRecord {
            amount,
            reason: reason.to_string(),
            refunded_at: now,
            gateway_refund_id,
        });
        self.refunded_amount += amount;
        self.refund_in_flight = (self.refund_in_flight - amount).max(Decimal::ZERO);
        if self.refunded_amount >= self.amount {
            self.transition(PaymentStatus::Refunded, now);
        } else {
            self.updated_at = now;
        }
        Ok(())
    }

    pub fn is_fully_refunded(&self) -> bool {
        self.refunded_amount >= self.amount
    }

    pub fn dispute(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[PaymentStatus::Completed], "dispute")?;
        self.transition(PaymentStatus::Disputed, now);
        Ok(())
    }

    pub fn hold_in_escrow(
        &mut self,
        hold_period_hours: u32,
        release_condition: ReleaseCondition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(&[PaymentStatus::Completed], "hold in escrow")?;
        if self.escrow.is_some() {
            return Err(BookpayError::ValidationError(format!(
                "Payment {} has already been escrowed",
                self.id
            )));
        }
        self.escrow = Some(EscrowDetails {
            escrowed_at: now,
            released_at: None,
            hold_period_hours,
            release_condition,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Returns `false` when the funds were already released.
    pub fn release_from_escrow(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let status = self.status;
        let escrow = self.escrow.as_mut().ok_or_else(|| {
            BookpayError::ValidationError("Payment is not held in escrow".to_string())
        })?;
        if escrow.released_at.is_some() {
            return Ok(false);
        }
        if status != PaymentStatus::Completed {
            return Err(BookpayError::invalid_transition(
                "payment",
                status,
                "release from escrow",
            ));
        }
        escrow.released_at = Some(now);
        self.updated_at = now;
        Ok(true)
    }

    pub fn escrow_release_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Completed
            && self.escrow.as_ref().is_some_and(|escrow| {
                escrow.released_at.is_none()
                    && escrow.release_condition == ReleaseCondition::HoldPeriodElapsed
                    && escrow.escrowed_at + Duration::hours(i64::from(escrow.hold_period_hours))
                        <= now
            })
    }

    /// Soft delete; active payments stay visible.
    pub fn archive(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_active() || self.archived_at.is_some() {
            return Err(BookpayError::invalid_transition("payment", self.status, "archive"));
        }
        self.archived_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn ensure(&self, allowed: &[PaymentStatus], action: &'static str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(BookpayError::invalid_transition("payment", self.status, action))
        }
    }

    fn transition(&mut self, next: PaymentStatus, now: DateTime<Utc>) {
        debug_assert!(self.status.can_transition_to(next));
        self.status = next;
        self.updated_at = now;
    }
}

fn transaction_id(id: Uuid, now: DateTime<Utc>) -> String {
    let suffix = id.simple().to_string()[..8].to_ascii_uppercase();
    format!("TXN-{}-{}", now.timestamp_millis(), suffix)
}
