pub mod cascade;
pub mod error;
pub mod expiry;
pub mod lifecycle;

pub use cascade::{CascadeCoordinator, CascadeRequest, TripCancellation};
pub use error::LifecycleError;
pub use expiry::{ExpirySweep, SweepReport};
pub use lifecycle::{BookingCancellation, BookingLifecycle, SeatSummary};
