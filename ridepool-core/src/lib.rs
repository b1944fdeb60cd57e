pub mod audit;
pub mod booking;
pub mod ledger;
pub mod payment;
pub mod policy;
pub mod repository;
pub mod trip;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TripId = Uuid;
pub type BookingId = Uuid;
pub type UserId = Uuid;

pub use booking::{BookingCommand, BookingError, BookingRequest, BookingStatus, BookingView, SideEffect, Transition};
pub use ledger::{Allocation, CapacityLedger, LedgerEntry, LedgerError, Release};
pub use payment::{PaymentMethod, PaymentStatus};
pub use policy::{CancelInitiator, Notifier, NotifyError, RefundPolicy};
pub use repository::{BookingStore, CascadePlan, CascadeReceipt, CommitReceipt, GuardedWrite, LedgerOp, StoreError};
pub use trip::{Trip, TripLookup, TripStatus};

/// Coarse classification shared by every error type in the workspace.
///
/// Guard and capacity failures are expected outcomes the caller turns into a
/// user-facing message; invariant violations point at corrupted data or a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GuardViolation,
    ResourceExhausted,
    InvariantViolation,
    SchemaViolation,
    NotFound,
    Unavailable,
}

impl ErrorKind {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::InvariantViolation | ErrorKind::Unavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}
