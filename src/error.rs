use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the booking/payment coordination core.
#[derive(Error, Debug)]
pub enum BookpayError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid transition: cannot {action} {entity} in state '{from}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("Booking {0} expired before it was confirmed")]
    BookingExpired(Uuid),

    #[error("Booking {booking_id} already has an active payment")]
    DuplicatePayment { booking_id: Uuid },

    #[error("Payment verification failed: {0}")]
    VerificationFailed(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Payment is not refundable: {0}")]
    NotRefundable(String),

    #[error("Not authorized: {0}")]
    AuthorizationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl BookpayError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    /// Errors worth retrying later: the provider was unreachable or a
    /// concurrent writer won the compare-and-swap.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::Conflict(_))
    }
}

impl From<serde_json::Error> for BookpayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, BookpayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = BookpayError::invalid_transition("booking", "completed", "confirm");
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot confirm booking in state 'completed'"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(BookpayError::GatewayUnavailable("timeout".into()).is_transient());
        assert!(BookpayError::Conflict("stale version".into()).is_transient());
        assert!(!BookpayError::ValidationError("bad".into()).is_transient());
        assert!(!BookpayError::SignatureInvalid("bad".into()).is_transient());
    }
}
