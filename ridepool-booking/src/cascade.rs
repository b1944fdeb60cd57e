use chrono::Utc;
use ridepool_core::audit::{Actor, ActorKind, AuditRecord, AuditSink, EntityRef};
use ridepool_core::booking::{transition, BookingCommand, BookingRequest, BookingStatus};
use ridepool_core::{BookingStore, CancelInitiator, CascadePlan, Notifier, StoreError, TripId, TripLookup, TripStatus, UserId};
use ridepool_shared::{NotificationEvent, TripCanceledEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::LifecycleError;
use crate::lifecycle::status_event;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Who is withdrawing the trip, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeRequest {
    pub trip_id: TripId,
    pub initiator: CancelInitiator,
    pub actor_id: Option<UserId>,
    pub reason: Option<String>,
    pub correlation_id: Option<String>,
}

impl CascadeRequest {
    pub fn driver(trip_id: TripId, driver_id: UserId) -> Self {
        Self {
            trip_id,
            initiator: CancelInitiator::Driver,
            actor_id: Some(driver_id),
            reason: None,
            correlation_id: None,
        }
    }

    pub fn admin(trip_id: TripId, admin_id: UserId, reason: impl Into<String>) -> Self {
        Self {
            trip_id,
            initiator: CancelInitiator::Admin,
            actor_id: Some(admin_id),
            reason: Some(reason.into()),
            correlation_id: None,
        }
    }

    pub fn platform(trip_id: TripId) -> Self {
        Self {
            trip_id,
            initiator: CancelInitiator::Platform,
            actor_id: None,
            reason: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripCancellation {
    pub declined_auto: u32,
    pub canceled_by_platform: u32,
    pub refunds_flagged: u32,
    pub seats_released: u32,
}

impl TripCancellation {
    pub fn is_noop(&self) -> bool {
        self.declined_auto == 0 && self.canceled_by_platform == 0
    }
}

/// Propagates a trip cancellation to every active booking and the ledger in
/// one store transaction.
pub struct CascadeCoordinator {
    bookings: Arc<dyn BookingStore>,
    trips: Arc<dyn TripLookup>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    max_attempts: u32,
}

impl CascadeCoordinator {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        trips: Arc<dyn TripLookup>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            bookings,
            trips,
            notifier,
            audit,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn cancel_trip(&self, request: CascadeRequest) -> Result<TripCancellation, LifecycleError> {
        let trip_id = request.trip_id;

        // 1. Admin actions are rejected before any write if the reason is missing
        let audit_reason = match request.initiator {
            CancelInitiator::Admin => {
                let reason = request.reason.as_deref().map(str::trim).unwrap_or_default();
                if reason.is_empty() {
                    return Err(LifecycleError::Validation("reason is required for admin actions".to_string()));
                }
                Some(reason.to_string())
            }
            _ => None,
        };

        // 2. Trip must already be withdrawn, by someone allowed to
        let trip = self
            .trips
            .find_trip(trip_id)
            .await?
            .ok_or(LifecycleError::TripNotFound(trip_id))?;
        if trip.status != TripStatus::Canceled {
            return Err(LifecycleError::TripNotCanceled { trip_id, status: trip.status });
        }
        match request.initiator {
            CancelInitiator::Driver if request.actor_id.is_some_and(|id| trip.is_driven_by(id)) => {}
            CancelInitiator::Driver => {
                return Err(LifecycleError::Forbidden("only the trip's driver can cancel it".to_string()))
            }
            CancelInitiator::Passenger => {
                return Err(LifecycleError::Forbidden("passengers cannot cancel a trip".to_string()))
            }
            CancelInitiator::Platform | CancelInitiator::Admin => {}
        }

        // 3. Plan and commit, replanning when a concurrent write moved a booking
        let (plan, outcome) = self.commit_with_retry(trip_id).await?;

        // 4. Admin cascades are acknowledged only once the audit entry is durable
        if let Some(reason) = audit_reason {
            let record = AuditRecord {
                actor: Actor {
                    kind: ActorKind::Admin,
                    id: request.actor_id.map(|id| id.to_string()),
                },
                action: "trip.cancel_cascade".to_string(),
                entity: EntityRef::new("trip", trip_id),
                delta: json!({
                    "declined_auto": outcome.declined_auto,
                    "canceled_by_platform": outcome.canceled_by_platform,
                    "refunds_flagged": outcome.refunds_flagged,
                    "seats_released": outcome.seats_released,
                }),
                reason: Some(reason),
                correlation_id: request.correlation_id.clone(),
            };
            if let Err(e) = self.audit.record(record).await {
                error!(trip_id = %trip_id, error = %e, "Cascade committed but audit append failed");
                return Err(LifecycleError::AuditUnavailable(e.to_string()));
            }
        }

        if !outcome.is_noop() {
            info!(
                trip_id = %trip_id,
                initiator = %request.initiator,
                declined_auto = outcome.declined_auto,
                canceled_by_platform = outcome.canceled_by_platform,
                seats_released = outcome.seats_released,
                "Trip cancellation cascaded"
            );
            self.announce(trip_id, &plan, outcome).await;
        }
        Ok(outcome)
    }

    async fn commit_with_retry(&self, trip_id: TripId) -> Result<(CascadePlan, TripCancellation), LifecycleError> {
        for attempt in 1..=self.max_attempts {
            // An empty plan still goes through the store so the ledger is reconciled
            let plan = self.plan(trip_id).await?;
            match self.bookings.commit_cascade(&plan).await {
                Ok(receipt) => {
                    let outcome = TripCancellation {
                        declined_auto: receipt.declined_auto as u32,
                        canceled_by_platform: receipt.canceled_by_platform as u32,
                        refunds_flagged: plan.platform_canceled.iter().filter(|b| b.refund_needed).count() as u32,
                        seats_released: receipt.seats_released,
                    };
                    return Ok((plan, outcome));
                }
                Err(StoreError::StaleWrite { id, expected, actual }) => {
                    warn!(trip_id = %trip_id, booking_id = %id, %expected, %actual, attempt, "Cascade plan went stale, replanning");
                }
                Err(StoreError::CascadeOutdated { unplanned, .. }) => {
                    warn!(trip_id = %trip_id, booking_id = %unplanned, attempt, "Booking joined trip during cascade, replanning");
                }
                Err(err @ StoreError::LedgerMismatch { .. }) => {
                    error!(trip_id = %trip_id, error = %err, "Cascade refused, ledger out of sync with bookings");
                    return Err(LifecycleError::InvariantViolation(err.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LifecycleError::Contention {
            trip_id,
            attempts: self.max_attempts,
        })
    }

    async fn plan(&self, trip_id: TripId) -> Result<CascadePlan, LifecycleError> {
        let now = Utc::now();
        let active = self.bookings.bookings_for_trip(trip_id, &BookingStatus::ACTIVE).await?;

        let mut plan = CascadePlan {
            trip_id,
            auto_declined: Vec::new(),
            platform_canceled: Vec::new(),
            seats_to_release: 0,
        };
        for booking in active {
            let command = match booking.status {
                BookingStatus::Pending => BookingCommand::AutoDecline,
                _ => BookingCommand::CancelByPlatform,
            };
            let step = transition(&booking, command, now)?;
            plan.seats_to_release += step.seats_released();
            match step.booking.status {
                BookingStatus::DeclinedAuto => plan.auto_declined.push(step.booking),
                _ => plan.platform_canceled.push(step.booking),
            }
        }
        Ok(plan)
    }

    async fn announce(&self, trip_id: TripId, plan: &CascadePlan, outcome: TripCancellation) {
        let now = Utc::now();
        let summary = NotificationEvent::TripCanceled(TripCanceledEvent {
            trip_id,
            declined_auto: outcome.declined_auto,
            canceled_by_platform: outcome.canceled_by_platform,
            refunds_flagged: outcome.refunds_flagged,
            seats_released: outcome.seats_released,
            timestamp: now.timestamp(),
        });
        let bookings: Vec<&BookingRequest> = plan.auto_declined.iter().chain(&plan.platform_canceled).collect();

        for event in std::iter::once(summary).chain(bookings.into_iter().map(|b| status_event(b, now))) {
            if let Err(e) = self.notifier.notify(event).await {
                warn!(trip_id = %trip_id, error = %e, "Failed to publish cascade notification");
            }
        }
    }
}
