#![allow(dead_code)]

use bookpay::application::bookings::CreateBooking;
use bookpay::application::payments::{CreatePaymentIntent, PaymentIntent};
use bookpay::application::{Collaborators, Services};
use bookpay::config::Settings;
use bookpay::domain::booking::Booking;
use bookpay::domain::gateway::{GatewayRegistry, PaymentGateway, PaymentMethod};
use bookpay::domain::money::Currency;
use bookpay::domain::payment::Payment;
use bookpay::domain::ports::{BookingStoreRef, Clock, PaymentStoreRef, ServiceListing, UserProfile};
use bookpay::infrastructure::clock::ManualClock;
use bookpay::infrastructure::gateways::sandbox::SandboxGateway;
use bookpay::infrastructure::in_memory::{
    InMemoryBookingStore, InMemoryCatalog, InMemoryPaymentStore, RecordingNotifier,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// A listing with its provider and one requester.
#[derive(Debug, Clone, Copy)]
pub struct Parties {
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub requester_id: Uuid,
}

/// Services wired over in-memory collaborators, a manual clock and the sandbox.
#[derive(Clone)]
pub struct Harness {
    pub services: Services,
    pub bookings: BookingStoreRef,
    pub payments: PaymentStoreRef,
    pub catalog: Arc<InMemoryCatalog>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub sandbox: Arc<SandboxGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::with_stores(
            Arc::new(InMemoryBookingStore::new()),
            Arc::new(InMemoryPaymentStore::new()),
            settings,
        )
    }

    pub fn with_stores(
        bookings: BookingStoreRef,
        payments: PaymentStoreRef,
        settings: Settings,
    ) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(start()));
        let sandbox = Arc::new(SandboxGateway::new(WEBHOOK_SECRET));
        let services = Services::new(
            Collaborators {
                bookings: bookings.clone(),
                payments: payments.clone(),
                catalog: catalog.clone(),
                notifier: notifier.clone(),
                clock: clock.clone(),
                gateways: GatewayRegistry::new().register(sandbox.clone()),
            },
            &settings,
        );
        Self {
            services,
            bookings,
            payments,
            catalog,
            notifier,
            clock,
            sandbox,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn listing(&self, base_price: Decimal) -> Parties {
        let parties = Parties {
            service_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            requester_id: Uuid::new_v4(),
        };
        self.catalog
            .add_service(ServiceListing {
                id: parties.service_id,
                provider_id: parties.provider_id,
                base_price,
                currency: Currency::new("USD").unwrap(),
                duration_minutes: 60,
                is_active: true,
            })
            .await;
        for id in [parties.provider_id, parties.requester_id] {
            self.catalog
                .add_user(UserProfile {
                    id,
                    email: Some(format!("{}@example.com", id.simple())),
                    is_active: true,
                })
                .await;
        }
        parties
    }

    /// Books the listing `lead` from now.
    pub async fn book(&self, parties: &Parties, lead: Duration) -> Booking {
        let starts_at = self.now() + lead;
        self.services
            .bookings
            .create_booking(CreateBooking {
                service_id: parties.service_id,
                requester_id: parties.requester_id,
                scheduled_date: starts_at.date_naive(),
                scheduled_time: starts_at.time(),
                location: "221B Baker St".to_string(),
                estimated_duration_minutes: None,
            })
            .await
            .unwrap()
    }

    pub fn intent_request(&self, booking: &Booking) -> CreatePaymentIntent {
        CreatePaymentIntent {
            booking_id: booking.id,
            payer_id: booking.requester_id,
            method: PaymentMethod::Card,
            gateway: PaymentGateway::Sandbox,
            exchange_rate: None,
        }
    }

    pub async fn pay(&self, booking: &Booking) -> PaymentIntent {
        self.services
            .payments
            .create_payment_intent(self.intent_request(booking))
            .await
            .unwrap()
    }

    /// A booking whose payment has been confirmed synchronously.
    pub async fn paid_booking(
        &self,
        base_price: Decimal,
        lead: Duration,
    ) -> (Parties, Booking, Payment) {
        let parties = self.listing(base_price).await;
        let booking = self.book(&parties, lead).await;
        let intent = self.pay(&booking).await;
        let payment = self
            .services
            .payments
            .confirm_payment(intent.payment_id, &intent.gateway_transaction_id)
            .await
            .unwrap();
        let booking = self.booking(booking.id).await;
        (parties, booking, payment)
    }

    pub async fn booking(&self, booking_id: Uuid) -> Booking {
        self.services.bookings.get_booking(booking_id).await.unwrap()
    }

    pub async fn payment(&self, payment_id: Uuid) -> Payment {
        self.services.payments.get_payment(payment_id).await.unwrap()
    }

    /// Signed sandbox webhook body and signature.
    pub fn webhook(
        &self,
        event_type: &str,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> (Vec<u8>, String) {
        let payload = SandboxGateway::event_payload(event_type, transaction_id, reason);
        let signature = self.sandbox.sign(&payload);
        (payload, signature)
    }
}

/// Lets detached notification tasks run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
