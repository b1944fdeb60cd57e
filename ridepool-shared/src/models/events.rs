use uuid::Uuid;

/// Emitted after a booking reaches a new status (terminal or `accepted`).
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct BookingStatusChangedEvent {
    pub booking_id: Uuid,
    pub trip_id: Uuid,
    pub passenger_id: Uuid,
    pub status: String,
    pub seats: u32,
    pub timestamp: i64,
}

/// Emitted once per cascade run that actually changed something.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct TripCanceledEvent {
    pub trip_id: Uuid,
    pub declined_auto: u32,
    pub canceled_by_platform: u32,
    pub refunds_flagged: u32,
    pub seats_released: u32,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    BookingStatusChanged(BookingStatusChangedEvent),
    TripCanceled(TripCanceledEvent),
}

impl NotificationEvent {
    /// Routing key for downstream delivery (one stream per trip).
    pub fn key(&self) -> String {
        match self {
            NotificationEvent::BookingStatusChanged(e) => e.trip_id.to_string(),
            NotificationEvent::TripCanceled(e) => e.trip_id.to_string(),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            NotificationEvent::BookingStatusChanged(_) => "booking.status_changed",
            NotificationEvent::TripCanceled(_) => "trip.canceled",
        }
    }
}
