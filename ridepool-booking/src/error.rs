use ridepool_core::audit::AuditError;
use ridepool_core::{
    BookingError, BookingId, BookingStatus, ErrorKind, LedgerError, StoreError, TripId, TripStatus,
};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Booking not found: {0}")]
    NotFound(BookingId),

    #[error("Trip not found: {0}")]
    TripNotFound(TripId),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },

    #[error("Passenger already has active booking {existing} on this trip")]
    DuplicateActiveBooking { existing: BookingId },

    #[error("Trip {trip_id} is {status} and not accepting bookings")]
    TripNotAcceptingBookings { trip_id: TripId, status: TripStatus },

    #[error("Trip {trip_id} is {status}, cascade requires canceled")]
    TripNotCanceled { trip_id: TripId, status: TripStatus },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Trip {trip_id} is fully booked: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        trip_id: TripId,
        requested: u32,
        remaining: u32,
    },

    #[error("Payment changes require an accepted booking, current status is {current}")]
    PaymentRequiresAccepted { current: BookingStatus },

    #[error("Data integrity violation: {0}")]
    InvariantViolation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Trip {trip_id} cascade lost {attempts} consecutive write races")]
    Contention { trip_id: TripId, attempts: u32 },

    #[error("Booking {booking_id} lost {attempts} consecutive write races")]
    BookingContention { booking_id: BookingId, attempts: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Audit log unavailable: {0}")]
    AuditUnavailable(String),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotFound(_) | LifecycleError::TripNotFound(_) => ErrorKind::NotFound,
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::DuplicateActiveBooking { .. }
            | LifecycleError::TripNotAcceptingBookings { .. }
            | LifecycleError::TripNotCanceled { .. }
            | LifecycleError::Forbidden(_)
            | LifecycleError::PaymentRequiresAccepted { .. }
            | LifecycleError::Contention { .. }
            | LifecycleError::BookingContention { .. } => ErrorKind::GuardViolation,
            LifecycleError::CapacityExceeded { .. } => ErrorKind::ResourceExhausted,
            LifecycleError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            LifecycleError::Validation(_) => ErrorKind::SchemaViolation,
            LifecycleError::Store(_) | LifecycleError::AuditUnavailable(_) => ErrorKind::Unavailable,
        }
    }
}

impl From<BookingError> for LifecycleError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::InvalidTransition { from, to } => LifecycleError::InvalidTransition { from, to },
            BookingError::PaymentRequiresAccepted { current } => LifecycleError::PaymentRequiresAccepted { current },
            other @ (BookingError::InvalidSeats(_) | BookingError::NoteTooLong { .. }) => {
                LifecycleError::Validation(other.to_string())
            }
        }
    }
}

impl From<LedgerError> for LifecycleError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::CapacityExceeded { trip_id, requested, remaining } => {
                LifecycleError::CapacityExceeded { trip_id, requested, remaining }
            }
            LedgerError::InvariantViolation { .. } => {
                error!(error = %err, "Ledger invariant violated, refusing operation");
                LifecycleError::InvariantViolation(err.to_string())
            }
            LedgerError::ZeroSeats => LifecycleError::Validation(err.to_string()),
            LedgerError::Store(msg) => LifecycleError::Store(msg),
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::DuplicateActiveBooking { existing, .. } => LifecycleError::DuplicateActiveBooking { existing },
            StoreError::StaleWrite { expected, actual, .. } => LifecycleError::InvalidTransition {
                from: actual,
                to: expected,
            },
            StoreError::CascadeOutdated { trip_id, .. } => LifecycleError::Contention { trip_id, attempts: 1 },
            StoreError::LedgerMismatch { .. } => {
                error!(error = %err, "Ledger disagrees with accepted bookings");
                LifecycleError::InvariantViolation(err.to_string())
            }
            StoreError::Ledger(inner) => inner.into(),
            StoreError::Backend(msg) => LifecycleError::Store(msg),
        }
    }
}

impl From<AuditError> for LifecycleError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Schema(msg) => LifecycleError::Validation(msg),
            other => LifecycleError::AuditUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_capacity_is_distinct_from_guard() {
        let trip_id = Uuid::new_v4();
        let err: LifecycleError = StoreError::Ledger(LedgerError::CapacityExceeded {
            trip_id,
            requested: 1,
            remaining: 0,
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let guard: LifecycleError = BookingError::InvalidTransition {
            from: BookingStatus::Declined,
            to: BookingStatus::Accepted,
        }
        .into();
        assert_eq!(guard.kind(), ErrorKind::GuardViolation);
    }

    #[test]
    fn test_underflow_is_not_recoverable() {
        let err: LifecycleError = LedgerError::InvariantViolation {
            trip_id: Uuid::new_v4(),
            allocated: 0,
            requested: 2,
        }
        .into();
        assert!(!err.kind().is_recoverable());
    }
}
