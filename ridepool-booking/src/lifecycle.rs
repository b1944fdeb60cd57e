use chrono::{DateTime, Utc};
use ridepool_core::booking::{transition, BookingCommand, BookingRequest, BookingStatus, Transition};
use ridepool_core::{
    BookingError, BookingId, BookingStore, CancelInitiator, CapacityLedger, GuardedWrite, Notifier, PaymentMethod, RefundPolicy,
    StoreError, Trip, TripId, TripLookup, UserId,
};
use ridepool_shared::{BookingStatusChangedEvent, NotificationEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;

/// Attempts for a write that races another writer on the same booking.
const WRITE_ATTEMPTS: u32 = 3;

/// Outcome of a passenger cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingCancellation {
    pub booking: BookingRequest,
    pub seats_released: u32,
    pub refund_flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatSummary {
    pub total_seats: u32,
    pub allocated_seats: u32,
    pub remaining_seats: u32,
    pub utilization_percent: u32,
    pub fully_booked: bool,
}

/// Drives one booking request from creation to a terminal state.
pub struct BookingLifecycle {
    bookings: Arc<dyn BookingStore>,
    ledger: Arc<dyn CapacityLedger>,
    trips: Arc<dyn TripLookup>,
    refunds: Arc<dyn RefundPolicy>,
    notifier: Arc<dyn Notifier>,
}

impl BookingLifecycle {
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        ledger: Arc<dyn CapacityLedger>,
        trips: Arc<dyn TripLookup>,
        refunds: Arc<dyn RefundPolicy>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            bookings,
            ledger,
            trips,
            refunds,
            notifier,
        }
    }

    /// Passenger request for seats. Capacity is not consumed until accept.
    pub async fn create(
        &self,
        trip_id: TripId,
        passenger_id: UserId,
        seats: u32,
        note: Option<String>,
    ) -> Result<BookingRequest, LifecycleError> {
        let now = Utc::now();
        let trip = self.load_trip(trip_id).await?;

        // 1. Trip gate
        if !trip.accepts_bookings(now) {
            return Err(LifecycleError::TripNotAcceptingBookings { trip_id, status: trip.status });
        }
        if trip.is_driven_by(passenger_id) {
            return Err(LifecycleError::Forbidden("drivers cannot book their own trip".to_string()));
        }
        if seats > trip.total_seats {
            return Err(LifecycleError::Validation(format!(
                "requested {} seats, trip has {}",
                seats, trip.total_seats
            )));
        }

        // 2. Shape checks, then insert under the active-pair constraint
        let booking = BookingRequest::new(trip_id, passenger_id, seats, note, now)?;
        self.bookings.insert_booking(&booking).await?;

        info!(booking_id = %booking.id, trip_id = %trip_id, seats, "Booking request created");
        Ok(booking)
    }

    /// Driver accepts a pending request: seats are allocated in the same write
    /// as the status change.
    pub async fn accept(&self, booking_id: BookingId, driver_id: UserId) -> Result<BookingRequest, LifecycleError> {
        let now = Utc::now();
        let booking = self.get(booking_id).await?;
        let trip = self.load_trip(booking.trip_id).await?;

        if !trip.is_driven_by(driver_id) {
            return Err(LifecycleError::Forbidden("only the trip's driver can accept".to_string()));
        }
        if !trip.accepts_bookings(now) {
            return Err(LifecycleError::TripNotAcceptingBookings {
                trip_id: trip.id,
                status: trip.status,
            });
        }

        let committed = match self.apply(booking, BookingCommand::Accept { driver_id }, trip.total_seats, now).await {
            Err(LifecycleError::CapacityExceeded { trip_id, requested, remaining }) => {
                info!(booking_id = %booking_id, trip_id = %trip_id, requested, remaining, "Accept refused, trip is full");
                return Err(LifecycleError::CapacityExceeded { trip_id, requested, remaining });
            }
            other => other?.booking,
        };

        info!(booking_id = %booking_id, driver_id = %driver_id, "Booking accepted");
        self.announce(&committed, now).await;
        Ok(committed)
    }

    pub async fn decline(
        &self,
        booking_id: BookingId,
        driver_id: UserId,
        reason: Option<String>,
    ) -> Result<BookingRequest, LifecycleError> {
        let now = Utc::now();
        let booking = self.get(booking_id).await?;
        let trip = self.load_trip(booking.trip_id).await?;

        if !trip.is_driven_by(driver_id) {
            return Err(LifecycleError::Forbidden("only the trip's driver can decline".to_string()));
        }

        let step = self
            .apply(booking, BookingCommand::Decline { driver_id, reason }, trip.total_seats, now)
            .await?;
        if step.replayed {
            return Ok(step.booking);
        }
        let committed = step.booking;

        info!(booking_id = %booking_id, driver_id = %driver_id, "Booking declined");
        self.announce(&committed, now).await;
        Ok(committed)
    }

    /// Passenger withdraws. From `accepted` the seats go back to the ledger in
    /// the same write. Repeating the call returns the canceled booking.
    pub async fn cancel_by_passenger(
        &self,
        booking_id: BookingId,
        passenger_id: UserId,
        reason: Option<String>,
    ) -> Result<BookingCancellation, LifecycleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = Utc::now();
            let booking = self.get(booking_id).await?;
            if !booking.belongs_to(passenger_id) {
                return Err(LifecycleError::Forbidden("booking belongs to another passenger".to_string()));
            }

            let refund_eligible =
                booking.is_paid && self.refunds.is_eligible(&booking, CancelInitiator::Passenger).await;
            let command = BookingCommand::CancelByPassenger {
                reason: reason.clone(),
                refund_eligible,
            };
            let step = transition(&booking, command, now)?;
            if step.replayed {
                debug!(booking_id = %booking_id, "Cancel replayed on canceled booking");
                return Ok(BookingCancellation {
                    refund_flagged: step.booking.refund_needed,
                    seats_released: 0,
                    booking: step.booking,
                });
            }

            let write = GuardedWrite::from_transition(&step, 0);
            match self.bookings.commit(write).await {
                Ok(receipt) => {
                    let cancellation = BookingCancellation {
                        seats_released: step.seats_released(),
                        refund_flagged: receipt.booking.refund_needed,
                        booking: receipt.booking,
                    };
                    info!(
                        booking_id = %booking_id,
                        seats_released = cancellation.seats_released,
                        refund_flagged = cancellation.refund_flagged,
                        "Booking canceled by passenger"
                    );
                    self.announce(&cancellation.booking, now).await;
                    return Ok(cancellation);
                }
                Err(StoreError::StaleWrite { actual, .. }) if attempt < WRITE_ATTEMPTS => {
                    debug!(booking_id = %booking_id, %actual, attempt, "Cancel raced another write, retrying");
                }
                Err(StoreError::StaleWrite { actual, .. }) if actual == step.from => {
                    return Err(LifecycleError::BookingContention { booking_id, attempts: attempt });
                }
                Err(err) => return Err(stale_as_transition(err, step.booking.status)),
            }
        }
    }

    /// Pending-only timeout transition used by the sweep.
    pub async fn expire(&self, booking_id: BookingId) -> Result<BookingRequest, LifecycleError> {
        let now = Utc::now();
        let booking = self.get(booking_id).await?;
        let committed = self.apply(booking, BookingCommand::Expire, 0, now).await?.booking;

        debug!(booking_id = %booking_id, "Booking expired");
        self.announce(&committed, now).await;
        Ok(committed)
    }

    // Payment sub-transitions. They never change `status`.

    pub async fn initialize_payment(
        &self,
        booking_id: BookingId,
        passenger_id: UserId,
        method: PaymentMethod,
        reference: Option<String>,
    ) -> Result<BookingRequest, LifecycleError> {
        let booking = self.owned_by(booking_id, passenger_id).await?;
        self.commit_payment(booking, |b| b.initialize_payment(method, reference.clone(), Utc::now()))
            .await
    }

    pub async fn set_payment_method(
        &self,
        booking_id: BookingId,
        passenger_id: UserId,
        method: PaymentMethod,
    ) -> Result<BookingRequest, LifecycleError> {
        let booking = self.owned_by(booking_id, passenger_id).await?;
        self.commit_payment(booking, |b| b.set_payment_method(method, Utc::now())).await
    }

    /// Payment confirmation from the processor side. Idempotent.
    pub async fn mark_payment_completed(
        &self,
        booking_id: BookingId,
        reference: Option<String>,
    ) -> Result<BookingRequest, LifecycleError> {
        let booking = self.get(booking_id).await?;
        if booking.is_paid && booking.status == BookingStatus::Accepted {
            return Ok(booking);
        }
        let committed = self
            .commit_payment(booking, |b| b.mark_payment_completed(reference.clone(), Utc::now()))
            .await?;
        info!(booking_id = %booking_id, "Payment completed");
        Ok(committed)
    }

    // Queries

    pub async fn get(&self, booking_id: BookingId) -> Result<BookingRequest, LifecycleError> {
        self.bookings
            .find_booking(booking_id)
            .await?
            .ok_or(LifecycleError::NotFound(booking_id))
    }

    pub async fn for_trip(
        &self,
        trip_id: TripId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingRequest>, LifecycleError> {
        Ok(self.bookings.bookings_for_trip(trip_id, statuses).await?)
    }

    pub async fn for_passenger(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, LifecycleError> {
        Ok(self.bookings.bookings_for_passenger(passenger_id).await?)
    }

    /// Accepted bookings still waiting on payment.
    pub async fn accepted_unpaid(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, LifecycleError> {
        let mut bookings = self.bookings.bookings_for_passenger(passenger_id).await?;
        bookings.retain(|b| b.status == BookingStatus::Accepted && !b.is_paid);
        Ok(bookings)
    }

    pub async fn pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, LifecycleError> {
        Ok(self.bookings.pending_created_before(cutoff, limit).await?)
    }

    pub async fn seat_summary(&self, trip_id: TripId) -> Result<SeatSummary, LifecycleError> {
        let trip = self.load_trip(trip_id).await?;
        let entry = self.ledger.entry(trip_id).await?;
        let total = trip.total_seats;

        Ok(match entry {
            Some(entry) => SeatSummary {
                total_seats: total,
                allocated_seats: entry.allocated_seats,
                remaining_seats: entry.remaining_seats(total),
                utilization_percent: entry.utilization_percent(total),
                fully_booked: entry.is_fully_booked(total),
            },
            None => SeatSummary {
                total_seats: total,
                allocated_seats: 0,
                remaining_seats: total,
                utilization_percent: 0,
                fully_booked: total == 0,
            },
        })
    }

    async fn load_trip(&self, trip_id: TripId) -> Result<Trip, LifecycleError> {
        self.trips
            .find_trip(trip_id)
            .await?
            .ok_or(LifecycleError::TripNotFound(trip_id))
    }

    async fn owned_by(&self, booking_id: BookingId, passenger_id: UserId) -> Result<BookingRequest, LifecycleError> {
        let booking = self.get(booking_id).await?;
        if !booking.belongs_to(passenger_id) {
            return Err(LifecycleError::Forbidden("booking belongs to another passenger".to_string()));
        }
        Ok(booking)
    }

    /// Transition and write. A write that lost only to a same-status change,
    /// such as a payment update, is recomputed from a fresh read. The returned
    /// step carries the booking as stored.
    async fn apply(
        &self,
        mut booking: BookingRequest,
        command: BookingCommand,
        total_seats: u32,
        at: DateTime<Utc>,
    ) -> Result<Transition, LifecycleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut step = transition(&booking, command.clone(), at)?;
            if step.replayed {
                return Ok(step);
            }
            match self.bookings.commit(GuardedWrite::from_transition(&step, total_seats)).await {
                Ok(receipt) => {
                    step.booking = receipt.booking;
                    return Ok(step);
                }
                Err(StoreError::StaleWrite { actual, .. }) if actual == step.from && attempt < WRITE_ATTEMPTS => {
                    debug!(booking_id = %booking.id, %actual, attempt, "Booking changed under the write, retrying");
                    booking = self.get(booking.id).await?;
                }
                Err(StoreError::StaleWrite { actual, .. }) if actual == step.from => {
                    return Err(LifecycleError::BookingContention {
                        booking_id: booking.id,
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(stale_as_transition(err, command.target())),
            }
        }
    }

    /// Status-preserving payment write, reapplied on a fresh read when another
    /// payment update lands first.
    async fn commit_payment<F>(&self, mut booking: BookingRequest, change: F) -> Result<BookingRequest, LifecycleError>
    where
        F: Fn(&BookingRequest) -> Result<BookingRequest, BookingError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let next = change(&booking)?;
            if next == booking {
                return Ok(booking);
            }
            match self.bookings.commit(GuardedWrite::status_only(next, BookingStatus::Accepted)).await {
                Ok(receipt) => return Ok(receipt.booking),
                Err(StoreError::StaleWrite { actual: BookingStatus::Accepted, .. }) if attempt < WRITE_ATTEMPTS => {
                    debug!(booking_id = %booking.id, attempt, "Payment write raced another update, retrying");
                    booking = self.get(booking.id).await?;
                }
                Err(StoreError::StaleWrite { actual: BookingStatus::Accepted, .. }) => {
                    return Err(LifecycleError::BookingContention {
                        booking_id: booking.id,
                        attempts: attempt,
                    });
                }
                Err(StoreError::StaleWrite { actual, .. }) => {
                    return Err(LifecycleError::PaymentRequiresAccepted { current: actual })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Notification failures are logged and otherwise ignored.
    async fn announce(&self, booking: &BookingRequest, at: DateTime<Utc>) {
        let event = status_event(booking, at);
        if let Err(e) = self.notifier.notify(event).await {
            warn!(booking_id = %booking.id, error = %e, "Failed to publish booking notification");
        }
    }
}

pub(crate) fn status_event(booking: &BookingRequest, at: DateTime<Utc>) -> NotificationEvent {
    NotificationEvent::BookingStatusChanged(BookingStatusChangedEvent {
        booking_id: booking.id,
        trip_id: booking.trip_id,
        passenger_id: booking.passenger_id,
        status: booking.status.to_string(),
        seats: booking.seats,
        timestamp: at.timestamp(),
    })
}

/// A lost compare-and-swap means another writer moved the booking first.
fn stale_as_transition(err: StoreError, target: BookingStatus) -> LifecycleError {
    match err {
        StoreError::StaleWrite { actual, .. } => LifecycleError::InvalidTransition { from: actual, to: target },
        other => other.into(),
    }
}
