use async_trait::async_trait;
use ridepool_shared::NotificationEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::booking::BookingRequest;

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CancelInitiator {
    Passenger,
    Driver,
    Platform,
    Admin,
}

impl CancelInitiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelInitiator::Passenger => "passenger",
            CancelInitiator::Driver => "driver",
            CancelInitiator::Platform => "platform",
            CancelInitiator::Admin => "admin",
        }
    }
}

impl fmt::Display for CancelInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refund eligibility, decided by the payments side.
#[async_trait]
pub trait RefundPolicy: Send + Sync {
    async fn is_eligible(&self, booking: &BookingRequest, initiator: CancelInitiator) -> bool;
}

/// Every cancellation is refundable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullRefundPolicy;

#[async_trait]
impl RefundPolicy for FullRefundPolicy {
    async fn is_eligible(&self, _booking: &BookingRequest, _initiator: CancelInitiator) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget hook invoked after a committed transition. Failures are
/// logged by the caller and never undo the transition.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError>;
}
