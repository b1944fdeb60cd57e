use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::repository::StoreError;
use crate::{TripId, UnknownStatus, UserId};

/// Trip lifecycle as published by the trip-offer subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Draft,
    Published,
    InProgress,
    Canceled,
    Completed,
}

impl TripStatus {
    pub const ALL: [TripStatus; 5] = [
        TripStatus::Draft,
        TripStatus::Published,
        TripStatus::InProgress,
        TripStatus::Canceled,
        TripStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Draft => "draft",
            TripStatus::Published => "published",
            TripStatus::InProgress => "in_progress",
            TripStatus::Canceled => "canceled",
            TripStatus::Completed => "completed",
        }
    }

    /// Legal next states.
    pub fn allowed_next(&self) -> &'static [TripStatus] {
        match self {
            TripStatus::Draft => &[TripStatus::Published, TripStatus::Canceled],
            TripStatus::Published => &[TripStatus::Canceled, TripStatus::InProgress],
            TripStatus::InProgress => &[TripStatus::Completed],
            TripStatus::Canceled | TripStatus::Completed => &[],
        }
    }

    pub fn can_transition_to(&self, next: TripStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_cancelable(&self) -> bool {
        self.can_transition_to(TripStatus::Canceled)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TripStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus { kind: "trip", value: s.to_string() })
    }
}

/// Read model of a trip offer; only what the booking core needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trip {
    pub id: TripId,
    pub driver_id: UserId,
    pub total_seats: u32,
    pub status: TripStatus,
    pub departure_at: DateTime<Utc>,
}

impl Trip {
    /// Only published trips that have not departed take new passengers.
    pub fn accepts_bookings(&self, now: DateTime<Utc>) -> bool {
        self.status == TripStatus::Published && self.departure_at > now
    }

    pub fn is_driven_by(&self, driver_id: UserId) -> bool {
        self.driver_id == driver_id
    }
}

/// Lookup into the trip-offer subsystem.
#[async_trait]
pub trait TripLookup: Send + Sync {
    async fn find_trip(&self, id: TripId) -> Result<Option<Trip>, StoreError>;
}
