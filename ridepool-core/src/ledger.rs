use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, TripId};

/// Seats allocated on one trip. One row per trip, created by the first
/// successful allocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub trip_id: TripId,
    pub allocated_seats: u32,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(trip_id: TripId, now: DateTime<Utc>) -> Self {
        Self {
            trip_id,
            allocated_seats: 0,
            updated_at: now,
        }
    }

    pub fn has_capacity(&self, total_seats: u32, requested: u32) -> bool {
        self.allocated_seats
            .checked_add(requested)
            .is_some_and(|after| after <= total_seats)
    }

    pub fn remaining_seats(&self, total_seats: u32) -> u32 {
        total_seats.saturating_sub(self.allocated_seats)
    }

    pub fn is_fully_booked(&self, total_seats: u32) -> bool {
        self.allocated_seats >= total_seats
    }

    /// Rounded share of seats taken, 0..=100.
    pub fn utilization_percent(&self, total_seats: u32) -> u32 {
        if total_seats == 0 {
            return 0;
        }
        let pct = (u64::from(self.allocated_seats) * 100 + u64::from(total_seats) / 2) / u64::from(total_seats);
        pct.min(100) as u32
    }

    /// Allocated count after taking `requested` seats, if it fits.
    pub fn checked_allocate(&self, total_seats: u32, requested: u32) -> Result<u32, LedgerError> {
        if requested == 0 {
            return Err(LedgerError::ZeroSeats);
        }
        if !self.has_capacity(total_seats, requested) {
            return Err(LedgerError::CapacityExceeded {
                trip_id: self.trip_id,
                requested,
                remaining: self.remaining_seats(total_seats),
            });
        }
        Ok(self.allocated_seats + requested)
    }

    /// Allocated count after returning `requested` seats. Never clamps.
    pub fn checked_release(&self, requested: u32) -> Result<u32, LedgerError> {
        if requested == 0 {
            return Err(LedgerError::ZeroSeats);
        }
        self.allocated_seats
            .checked_sub(requested)
            .ok_or(LedgerError::InvariantViolation {
                trip_id: self.trip_id,
                allocated: self.allocated_seats,
                requested,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub trip_id: TripId,
    pub allocated_seats: u32,
    pub remaining_seats: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub trip_id: TripId,
    pub allocated_seats: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Capacity exceeded on trip {trip_id}: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        trip_id: TripId,
        requested: u32,
        remaining: u32,
    },

    #[error("Ledger invariant violated on trip {trip_id}: cannot release {requested} of {allocated} allocated seats")]
    InvariantViolation {
        trip_id: TripId,
        allocated: u32,
        requested: u32,
    },

    #[error("Seat count must be positive")]
    ZeroSeats,

    #[error("Ledger store failure: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::CapacityExceeded { .. } => ErrorKind::ResourceExhausted,
            LedgerError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            LedgerError::ZeroSeats => ErrorKind::SchemaViolation,
            LedgerError::Store(_) => ErrorKind::Unavailable,
        }
    }
}

/// Per-trip seat counter. Implementations must make the check and the update
/// one conditional write; callers retry after a lost race.
#[async_trait]
pub trait CapacityLedger: Send + Sync {
    async fn allocate(&self, trip_id: TripId, total_seats: u32, seats: u32) -> Result<Allocation, LedgerError>;

    async fn release(&self, trip_id: TripId, seats: u32) -> Result<Release, LedgerError>;

    async fn entry(&self, trip_id: TripId) -> Result<Option<LedgerEntry>, LedgerError>;
}
