use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::booking::{BookingRequest, BookingStatus, SideEffect, Transition};
use crate::ledger::{LedgerEntry, LedgerError};
use crate::{BookingId, ErrorKind, TripId, UserId};

/// Ledger half of a guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Allocate { trip_id: TripId, total_seats: u32, seats: u32 },
    Release { trip_id: TripId, seats: u32 },
}

/// A booking write guarded on the status and row version it was read in,
/// plus the ledger change that must land in the same transaction. Stores
/// persist `booking` with `version + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedWrite {
    pub booking: BookingRequest,
    pub expected: BookingStatus,
    pub ledger: Option<LedgerOp>,
}

impl GuardedWrite {
    /// Guarded write without ledger work (payment updates, declines).
    pub fn status_only(booking: BookingRequest, expected: BookingStatus) -> Self {
        Self { booking, expected, ledger: None }
    }

    /// Build the write for a transition. `total_seats` is only read when the
    /// transition allocates.
    pub fn from_transition(transition: &Transition, total_seats: u32) -> Self {
        let ledger = transition.effects.iter().find_map(|effect| match *effect {
            SideEffect::AllocateSeats { trip_id, seats } => Some(LedgerOp::Allocate { trip_id, total_seats, seats }),
            SideEffect::ReleaseSeats { trip_id, seats } => Some(LedgerOp::Release { trip_id, seats }),
            _ => None,
        });
        Self {
            booking: transition.booking.clone(),
            expected: transition.from,
            ledger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub booking: BookingRequest,
    pub ledger: Option<LedgerEntry>,
}

/// Everything a trip cancellation writes, applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    pub trip_id: TripId,
    /// Already transitioned to `declined_auto`; guarded on `pending` and version.
    pub auto_declined: Vec<BookingRequest>,
    /// Already transitioned to `canceled_by_platform`; guarded on `accepted` and version.
    pub platform_canceled: Vec<BookingRequest>,
    /// Sum of seats across `platform_canceled`.
    pub seats_to_release: u32,
}

impl CascadePlan {
    pub fn is_empty(&self) -> bool {
        self.auto_declined.is_empty() && self.platform_canceled.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReceipt {
    pub declined_auto: usize,
    pub canceled_by_platform: usize,
    pub seats_released: u32,
    pub ledger: Option<LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Booking not found: {0}")]
    NotFound(BookingId),

    #[error("Passenger {passenger_id} already holds active booking {existing} on trip {trip_id}")]
    DuplicateActiveBooking {
        passenger_id: UserId,
        trip_id: TripId,
        existing: BookingId,
    },

    /// The row moved since it was read. `actual == expected` means only the
    /// version changed, for example a payment landed.
    #[error("Booking {id} changed underneath the write: expected {expected}, found {actual}")]
    StaleWrite {
        id: BookingId,
        expected: BookingStatus,
        actual: BookingStatus,
    },

    #[error("Booking {unplanned} on trip {trip_id} became active after the cascade was planned")]
    CascadeOutdated { trip_id: TripId, unplanned: BookingId },

    #[error("Ledger for trip {trip_id} holds {actual} seats but accepted bookings sum to {expected}")]
    LedgerMismatch {
        trip_id: TripId,
        expected: u32,
        actual: u32,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::DuplicateActiveBooking { .. }
            | StoreError::StaleWrite { .. }
            | StoreError::CascadeOutdated { .. } => ErrorKind::GuardViolation,
            StoreError::LedgerMismatch { .. } => ErrorKind::InvariantViolation,
            StoreError::Ledger(err) => err.kind(),
            StoreError::Backend(_) => ErrorKind::Unavailable,
        }
    }
}

/// Persistence for booking requests. Every write goes through a
/// compare-and-swap on the stored status and version; ledger work rides in
/// the same transaction.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Fails with `DuplicateActiveBooking` if the pair already has a pending
    /// or accepted booking.
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<(), StoreError>;

    async fn find_booking(&self, id: BookingId) -> Result<Option<BookingRequest>, StoreError>;

    async fn find_active_booking(
        &self,
        passenger_id: UserId,
        trip_id: TripId,
    ) -> Result<Option<BookingRequest>, StoreError>;

    /// Bookings on a trip in any of `statuses`; empty means all.
    async fn bookings_for_trip(
        &self,
        trip_id: TripId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingRequest>, StoreError>;

    async fn bookings_for_passenger(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, StoreError>;

    /// Oldest first.
    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    async fn commit(&self, write: GuardedWrite) -> Result<CommitReceipt, StoreError>;

    /// Apply a whole cascade or nothing. Returns `StaleWrite` or
    /// `CascadeOutdated` when the trip's active set moved since the plan was
    /// built and `LedgerMismatch` when the ledger disagrees with the accepted
    /// seats. An empty plan still reconciles, against zero.
    async fn commit_cascade(&self, plan: &CascadePlan) -> Result<CascadeReceipt, StoreError>;
}
