//! Deterministic replay of an operation log against the core.
//!
//! Each row moves a manual clock to `start + minute` and drives one service
//! call through the sandbox provider. Parties and catalog listings are
//! synthesized per booking label.

use crate::application::bookings::CreateBooking;
use crate::application::payments::CreatePaymentIntent;
use crate::application::{Collaborators, Services};
use crate::config::Settings;
use crate::domain::booking::BookingStatus;
use crate::domain::gateway::{GatewayRegistry, PaymentGateway, PaymentMethod};
use crate::domain::money::Currency;
use crate::domain::ports::{BookingStoreRef, Clock, PaymentStoreRef, ServiceListing, UserProfile};
use crate::error::{BookpayError, Result};
use crate::infrastructure::clock::ManualClock;
use crate::infrastructure::gateways::sandbox::{
    EVENT_DISPUTE, EVENT_FAILED, EVENT_SUCCEEDED, SandboxGateway, SandboxOutcome,
};
use crate::infrastructure::in_memory::InMemoryCatalog;
use crate::infrastructure::notifier::LogNotifier;
use crate::interfaces::csv::replay_reader::{ReplayOp, ReplayRecord};
use crate::interfaces::csv::report_writer::ReportRow;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_LEAD_HOURS: u32 = 72;
const DEFAULT_DURATION_MINUTES: u32 = 60;
const REPLAY_CURRENCY: &str = "USD";

#[derive(Debug, Clone)]
struct ReplayedBooking {
    booking_id: Uuid,
    provider_id: Uuid,
    requester_id: Uuid,
    payment_id: Option<Uuid>,
}

pub struct ReplayRunner {
    services: Services,
    catalog: Arc<InMemoryCatalog>,
    sandbox: Arc<SandboxGateway>,
    clock: Arc<ManualClock>,
    start: DateTime<Utc>,
    bookings: BTreeMap<String, ReplayedBooking>,
}

impl ReplayRunner {
    /// `gateways` must contain `sandbox`; rows naming another provider are rejected.
    pub fn new(
        bookings: BookingStoreRef,
        payments: PaymentStoreRef,
        gateways: GatewayRegistry,
        sandbox: Arc<SandboxGateway>,
        settings: &Settings,
        start: DateTime<Utc>,
    ) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let clock = Arc::new(ManualClock::new(start));
        let services = Services::new(
            Collaborators {
                bookings,
                payments,
                catalog: catalog.clone(),
                notifier: Arc::new(LogNotifier),
                clock: clock.clone(),
                gateways,
            },
            settings,
        );
        Self {
            services,
            catalog,
            sandbox,
            clock,
            start,
            bookings: BTreeMap::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Applies one row. Rejected rows change nothing but the clock.
    pub async fn apply(&mut self, record: &ReplayRecord) -> Result<()> {
        self.clock.set(self.start + Duration::minutes(record.minute));
        debug!(op = ?record.op, booking = %record.booking, minute = record.minute, "replaying row");

        if record.op == ReplayOp::Book {
            return self.book(record).await;
        }
        let entry = self.entry(&record.booking)?.clone();
        let reason = record.reason.clone();

        match record.op {
            ReplayOp::Book => Ok(()),
            ReplayOp::Pay => {
                let gateway = match record.gateway.as_deref() {
                    Some(name) => name.parse::<PaymentGateway>()?,
                    None => PaymentGateway::Sandbox,
                };
                if gateway != PaymentGateway::Sandbox {
                    return Err(BookpayError::ValidationError(format!(
                        "replay only drives the sandbox gateway, not {}",
                        gateway
                    )));
                }
                let intent = self
                    .services
                    .payments
                    .create_payment_intent(CreatePaymentIntent {
                        booking_id: entry.booking_id,
                        payer_id: entry.requester_id,
                        method: PaymentMethod::Card,
                        gateway,
                        exchange_rate: None,
                    })
                    .await?;
                self.set_payment(&record.booking, intent.payment_id);
                Ok(())
            }
            ReplayOp::Confirm => {
                let (payment_id, transaction_id) = self.gateway_transaction(&entry).await?;
                self.services
                    .payments
                    .confirm_payment(payment_id, &transaction_id)
                    .await?;
                Ok(())
            }
            ReplayOp::Decline => {
                let (payment_id, transaction_id) = self.gateway_transaction(&entry).await?;
                self.sandbox.push_outcome(SandboxOutcome::Decline(
                    reason.unwrap_or_else(|| "card declined".to_string()),
                ));
                match self
                    .services
                    .payments
                    .confirm_payment(payment_id, &transaction_id)
                    .await
                {
                    Err(BookpayError::VerificationFailed(reason)) => {
                        info!(booking = %record.booking, %reason, "payment declined");
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            ReplayOp::Retry => {
                let payment_id = self.payment_id(&entry)?;
                self.services.payments.retry_payment(payment_id).await?;
                Ok(())
            }
            ReplayOp::Webhook => self.deliver(&entry, EVENT_SUCCEEDED, None).await,
            ReplayOp::WebhookFailed => {
                let reason = reason.unwrap_or_else(|| "card declined".to_string());
                self.deliver(&entry, EVENT_FAILED, Some(&reason)).await
            }
            ReplayOp::Dispute => {
                let reason = reason.unwrap_or_else(|| "fraudulent".to_string());
                self.deliver(&entry, EVENT_DISPUTE, Some(&reason)).await
            }
            ReplayOp::Refund => {
                let payment_id = self.payment_id(&entry)?;
                self.services
                    .payments
                    .refund_payment(
                        payment_id,
                        record.amount,
                        reason.as_deref().unwrap_or("requested by customer"),
                    )
                    .await?;
                Ok(())
            }
            ReplayOp::Cancel => {
                self.services
                    .bookings
                    .update_booking_status(
                        entry.booking_id,
                        BookingStatus::Cancelled,
                        entry.requester_id,
                        Some(reason.unwrap_or_else(|| "cancelled by requester".to_string())),
                    )
                    .await?;
                Ok(())
            }
            ReplayOp::Start => {
                self.services
                    .bookings
                    .update_booking_status(
                        entry.booking_id,
                        BookingStatus::InProgress,
                        entry.provider_id,
                        None,
                    )
                    .await?;
                Ok(())
            }
            ReplayOp::Complete => {
                self.services
                    .bookings
                    .update_booking_status(
                        entry.booking_id,
                        BookingStatus::Completed,
                        entry.provider_id,
                        None,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// One row per booking label, in label order.
    pub async fn report(&self) -> Result<Vec<ReportRow>> {
        let mut rows = Vec::with_capacity(self.bookings.len());
        for (label, entry) in &self.bookings {
            let booking = self.services.bookings.get_booking(entry.booking_id).await?;
            let latest = self
                .services
                .payments
                .payments_for_booking(entry.booking_id)
                .await?
                .into_iter()
                .max_by_key(|payment| payment.created_at);
            let fees = latest.as_ref().and_then(|payment| payment.fees).unwrap_or_default();
            rows.push(ReportRow {
                booking: label.clone(),
                booking_status: booking.status.to_string(),
                payment_status: booking.payment_status.to_string(),
                payment: latest
                    .as_ref()
                    .map(|payment| payment.status.to_string())
                    .unwrap_or_default(),
                amount: booking.total_amount,
                refunded: latest
                    .as_ref()
                    .map(|payment| payment.refunded_amount)
                    .unwrap_or(Decimal::ZERO),
                platform_fee: fees.platform_fee,
                gateway_fee: fees.gateway_fee,
                attempts: latest.as_ref().map(|payment| payment.attempts).unwrap_or_default(),
            });
        }
        Ok(rows)
    }

    async fn book(&mut self, record: &ReplayRecord) -> Result<()> {
        if self.bookings.contains_key(&record.booking) {
            return Err(BookpayError::ValidationError(format!(
                "booking label '{}' is already in use",
                record.booking
            )));
        }
        let price = record.amount.ok_or_else(|| {
            BookpayError::ValidationError("book rows need an amount".to_string())
        })?;

        let provider_id = Uuid::new_v4();
        let requester_id = Uuid::new_v4();
        let service_id = Uuid::new_v4();
        self.catalog
            .add_service(ServiceListing {
                id: service_id,
                provider_id,
                base_price: price,
                currency: Currency::new(REPLAY_CURRENCY)?,
                duration_minutes: DEFAULT_DURATION_MINUTES,
                is_active: true,
            })
            .await;
        for (id, role) in [(provider_id, "provider"), (requester_id, "requester")] {
            self.catalog
                .add_user(UserProfile {
                    id,
                    email: Some(format!("{}+{}@replay.invalid", role, record.booking)),
                    is_active: true,
                })
                .await;
        }

        let starts_at = self.clock.now()
            + Duration::hours(i64::from(record.hours.unwrap_or(DEFAULT_LEAD_HOURS)));
        let booking = self
            .services
            .bookings
            .create_booking(CreateBooking {
                service_id,
                requester_id,
                scheduled_date: starts_at.date_naive(),
                scheduled_time: starts_at.time(),
                location: format!("Replay location {}", record.booking),
                estimated_duration_minutes: None,
            })
            .await?;

        self.bookings.insert(
            record.booking.clone(),
            ReplayedBooking {
                booking_id: booking.id,
                provider_id,
                requester_id,
                payment_id: None,
            },
        );
        Ok(())
    }

    async fn deliver(
        &self,
        entry: &ReplayedBooking,
        event_type: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let (_, transaction_id) = self.gateway_transaction(entry).await?;
        let payload = SandboxGateway::event_payload(event_type, &transaction_id, reason);
        let signature = self.sandbox.sign(&payload);
        let ack = self
            .services
            .webhooks
            .handle_gateway_webhook(PaymentGateway::Sandbox, &payload, &signature)
            .await?;
        debug!(?ack, "webhook delivered");
        Ok(())
    }

    async fn gateway_transaction(&self, entry: &ReplayedBooking) -> Result<(Uuid, String)> {
        let payment_id = self.payment_id(entry)?;
        let payment = self.services.payments.get_payment(payment_id).await?;
        let transaction_id = payment.gateway_transaction_id.ok_or_else(|| {
            BookpayError::ValidationError(format!(
                "payment {} has no provider transaction",
                payment.transaction_id
            ))
        })?;
        Ok((payment_id, transaction_id))
    }

    fn entry(&self, label: &str) -> Result<&ReplayedBooking> {
        self.bookings
            .get(label)
            .ok_or_else(|| BookpayError::not_found("booking label", label))
    }

    fn payment_id(&self, entry: &ReplayedBooking) -> Result<Uuid> {
        entry.payment_id.ok_or_else(|| {
            BookpayError::ValidationError(format!(
                "booking {} has no payment yet",
                entry.booking_id
            ))
        })
    }

    fn set_payment(&mut self, label: &str, payment_id: Uuid) {
        if let Some(entry) = self.bookings.get_mut(label) {
            entry.payment_id = Some(payment_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::{InMemoryBookingStore, InMemoryPaymentStore};
    use crate::interfaces::csv::replay_reader::ReplayReader;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn replay(log: &str) -> Vec<ReportRow> {
        let sandbox = Arc::new(SandboxGateway::new("whsec"));
        let mut runner = ReplayRunner::new(
            Arc::new(InMemoryBookingStore::new()),
            Arc::new(InMemoryPaymentStore::new()),
            GatewayRegistry::new().register(sandbox.clone()),
            sandbox,
            &Settings::default(),
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        );
        for record in ReplayReader::new(log.as_bytes()).records() {
            let record = record.unwrap();
            let _ = runner.apply(&record).await;
        }
        runner.report().await.unwrap()
    }

    #[tokio::test]
    async fn test_pay_and_confirm() {
        let rows = replay(
            "type,booking,minute,amount,hours,gateway,reason\n\
             book,b1,0,100,,,\n\
             pay,b1,1,,,sandbox,\n\
             confirm,b1,2,,,,",
        )
        .await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].booking_status, "confirmed");
        assert_eq!(rows[0].payment_status, "paid");
        assert_eq!(rows[0].payment, "completed");
        assert_eq!(rows[0].amount, dec!(102.50));
        assert_eq!(rows[0].platform_fee, dec!(2.50));
    }

    #[tokio::test]
    async fn test_rejected_rows_do_not_stop_the_replay() {
        let rows = replay(
            "type,booking,minute,amount,hours,gateway,reason\n\
             confirm,ghost,0,,,,\n\
             book,b2,0,50,,,\n\
             pay,b2,1,,,stripe,\n\
             pay,b2,2,,,,\n\
             decline,b2,3,,,,insufficient funds",
        )
        .await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].booking, "b2");
        assert_eq!(rows[0].payment, "failed");
        assert_eq!(rows[0].payment_status, "failed");
        assert_eq!(rows[0].attempts, 1);
    }
}
