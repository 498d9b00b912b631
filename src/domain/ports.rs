use super::booking::Booking;
use super::gateway::PaymentGateway;
use super::money::Currency;
use super::payment::Payment;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Persistence for bookings.
///
/// `update` is a compare-and-swap on `version`: a stale copy fails with
/// `Conflict` and the stored booking is left untouched.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: Booking) -> Result<Booking>;
    async fn update(&self, booking: Booking) -> Result<Booking>;
    async fn get(&self, booking_id: Uuid) -> Result<Option<Booking>>;
    async fn find_by_provider(&self, provider_id: Uuid) -> Result<Vec<Booking>>;
}

/// Persistence for payments.
///
/// Both writes enforce the one-active-payment-per-booking rule atomically
/// with the write itself and fail with `DuplicatePayment` otherwise.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert(&self, payment: Payment) -> Result<Payment>;
    async fn update(&self, payment: Payment) -> Result<Payment>;
    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_gateway_transaction(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> Result<Option<Payment>>;
    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Vec<Payment>>;
    async fn get_all(&self) -> Result<Vec<Payment>>;

    /// Failed payments whose retry time has come.
    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Payment>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|payment| payment.is_due_for_retry(now))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub base_price: Decimal,
    pub currency: Currency,
    pub duration_minutes: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: Option<String>,
    pub is_active: bool,
}

/// Read access to the externally owned user and service catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn find_service(&self, service_id: Uuid) -> Result<Option<ServiceListing>>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserProfile>>;
    async fn record_completed_booking(&self, service_id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    BookingCreated,
    BookingConfirmed,
    BookingStarted,
    BookingCompleted,
    BookingCancelled,
    BookingDisputed,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleRejected,
    PaymentCompleted,
    PaymentFailed,
    PaymentRefunded,
    EscrowReleased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub recipient: Uuid,
    pub payload: serde_json::Value,
}

/// Outbound email/SMS/push delivery. Failures never affect the transition
/// that produced the notification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type BookingStoreRef = Arc<dyn BookingStore>;
pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type ServiceCatalogRef = Arc<dyn ServiceCatalog>;
pub type NotifierRef = Arc<dyn Notifier>;
pub type ClockRef = Arc<dyn Clock>;
