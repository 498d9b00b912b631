use crate::domain::ports::{Notification, Notifier};
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            event = ?notification.event,
            recipient = %notification.recipient,
            payload = %notification.payload,
            "notification"
        );
        Ok(())
    }
}
