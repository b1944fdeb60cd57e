pub mod models;
pub mod pii;

pub use models::events::{BookingStatusChangedEvent, NotificationEvent, TripCanceledEvent};
pub use pii::Masked;
