//! Application layer orchestrating the booking and payment lifecycles.
//!
//! Services own no state of their own: entities live behind the store ports,
//! and every transition is a load, a domain method and a compare-and-swap
//! write. Collaborator side effects (notifications, catalog counters) run after
//! the write and never undo it.

pub mod bookings;
pub mod payments;
pub mod propagation;
pub mod reconciliation;

use crate::config::Settings;
use crate::domain::gateway::GatewayRegistry;
use crate::domain::ports::{
    BookingStoreRef, ClockRef, Notification, NotificationEvent, NotifierRef, PaymentStoreRef,
    ServiceCatalogRef,
};
use bookings::BookingService;
use payments::PaymentService;
use propagation::BookingPropagator;
use reconciliation::WebhookHandler;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Hands a notification to the notifier without waiting for delivery.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn notify_detached(notifier: &NotifierRef, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let event = notification.event;
        let recipient = notification.recipient;
        if let Err(err) = notifier.notify(notification).await {
            warn!(?event, %recipient, error = %err, "notification delivery failed");
        }
    });
}

pub(crate) fn notify_all(
    notifier: &NotifierRef,
    event: NotificationEvent,
    recipients: &[Uuid],
    payload: serde_json::Value,
) {
    for recipient in recipients {
        notify_detached(
            notifier,
            Notification {
                event,
                recipient: *recipient,
                payload: payload.clone(),
            },
        );
    }
}

/// Everything the services need from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub bookings: BookingStoreRef,
    pub payments: PaymentStoreRef,
    pub catalog: ServiceCatalogRef,
    pub notifier: NotifierRef,
    pub clock: ClockRef,
    pub gateways: GatewayRegistry,
}

/// The three entry points wired over one set of collaborators.
#[derive(Clone)]
pub struct Services {
    pub bookings: Arc<BookingService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookHandler>,
}

impl Services {
    pub fn new(collaborators: Collaborators, settings: &Settings) -> Self {
        let propagator = BookingPropagator::new(
            collaborators.bookings.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
        );
        let payments = Arc::new(PaymentService::new(
            collaborators.payments.clone(),
            collaborators.bookings.clone(),
            collaborators.catalog.clone(),
            collaborators.gateways.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
            propagator.clone(),
            settings.payment.clone(),
            settings.gateway_timeout,
        ));
        let bookings = Arc::new(BookingService::new(
            collaborators.bookings.clone(),
            Arc::clone(&payments),
            collaborators.catalog.clone(),
            collaborators.notifier.clone(),
            collaborators.clock.clone(),
            settings.booking.clone(),
        ));
        let webhooks = Arc::new(WebhookHandler::new(
            collaborators.gateways,
            collaborators.payments,
            Arc::clone(&payments),
        ));
        Self {
            bookings,
            payments,
            webhooks,
        }
    }
}
