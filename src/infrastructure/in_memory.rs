use crate::domain::booking::Booking;
use crate::domain::gateway::PaymentGateway;
use crate::domain::payment::Payment;
use crate::domain::ports::{
    BookingStore, Notification, Notifier, PaymentStore, ServiceCatalog, ServiceListing,
    UserProfile,
};
use crate::error::{BookpayError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory store for bookings.
///
/// Uses `Arc<RwLock<HashMap<Uuid, Booking>>>`; every write holds the write
/// guard across its checks, which makes inserts and version checks atomic.
#[derive(Default, Clone)]
pub struct InMemoryBookingStore {
    bookings: Arc<RwLock<HashMap<Uuid, Booking>>>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert(&self, mut booking: Booking) -> Result<Booking> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id)
            || bookings
                .values()
                .any(|existing| existing.booking_number == booking.booking_number)
        {
            return Err(BookpayError::Conflict(format!(
                "booking {} already exists",
                booking.booking_number
            )));
        }
        booking.version = 1;
        bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn update(&self, mut booking: Booking) -> Result<Booking> {
        let mut bookings = self.bookings.write().await;
        let stored = bookings
            .get(&booking.id)
            .ok_or_else(|| BookpayError::not_found("booking", booking.id))?;
        if stored.version != booking.version {
            return Err(BookpayError::Conflict(format!(
                "booking {} was modified concurrently",
                booking.id
            )));
        }
        booking.version += 1;
        bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn get(&self, booking_id: Uuid) -> Result<Option<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings.get(&booking_id).cloned())
    }

    async fn find_by_provider(&self, provider_id: Uuid) -> Result<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|booking| booking.provider_id == provider_id)
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory store for payments.
///
/// The active-payment check and the write happen under one write guard, so two
/// concurrent creations for the same booking cannot both succeed.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<Uuid, Payment>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn has_other_active(payments: &HashMap<Uuid, Payment>, payment: &Payment) -> bool {
    payments.values().any(|existing| {
        existing.id != payment.id
            && existing.booking_id == payment.booking_id
            && existing.is_active()
    })
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, mut payment: Payment) -> Result<Payment> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id)
            || payments
                .values()
                .any(|existing| existing.transaction_id == payment.transaction_id)
        {
            return Err(BookpayError::Conflict(format!(
                "payment {} already exists",
                payment.transaction_id
            )));
        }
        if payment.is_active() && has_other_active(&payments, &payment) {
            return Err(BookpayError::DuplicatePayment {
                booking_id: payment.booking_id,
            });
        }
        payment.version = 1;
        payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn update(&self, mut payment: Payment) -> Result<Payment> {
        let mut payments = self.payments.write().await;
        let stored = payments
            .get(&payment.id)
            .ok_or_else(|| BookpayError::not_found("payment", payment.id))?;
        if stored.version != payment.version {
            return Err(BookpayError::Conflict(format!(
                "payment {} was modified concurrently",
                payment.id
            )));
        }
        if payment.is_active() && !stored.is_active() && has_other_active(&payments, &payment) {
            return Err(BookpayError::DuplicatePayment {
                booking_id: payment.booking_id,
            });
        }
        payment.version += 1;
        payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&payment_id).cloned())
    }

    async fn find_by_gateway_transaction(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|payment| {
                payment.payment_gateway == gateway
                    && payment.gateway_transaction_id.as_deref() == Some(transaction_id)
            })
            .cloned())
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut found: Vec<Payment> = payments
            .values()
            .filter(|payment| payment.booking_id == booking_id)
            .cloned()
            .collect();
        found.sort_by_key(|payment| payment.created_at);
        Ok(found)
    }

    async fn get_all(&self) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.values().cloned().collect())
    }
}

/// Catalog double seeded by tests and the replay tool.
#[derive(Default, Clone)]
pub struct InMemoryCatalog {
    services: Arc<RwLock<HashMap<Uuid, ServiceListing>>>,
    users: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
    completed: Arc<RwLock<HashMap<Uuid, u32>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_service(&self, listing: ServiceListing) {
        self.services.write().await.insert(listing.id, listing);
    }

    pub async fn add_user(&self, user: UserProfile) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn completed_count(&self, service_id: Uuid) -> u32 {
        self.completed
            .read()
            .await
            .get(&service_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryCatalog {
    async fn find_service(&self, service_id: Uuid) -> Result<Option<ServiceListing>> {
        Ok(self.services.read().await.get(&service_id).cloned())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn record_completed_booking(&self, service_id: Uuid) -> Result<()> {
        *self.completed.write().await.entry(service_id).or_default() += 1;
        Ok(())
    }
}

/// Keeps every notification it is handed.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent.write().await.push(notification);
        Ok(())
    }
}
