#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ridepool_booking::{BookingLifecycle, CascadeCoordinator};
use ridepool_core::audit::{AuditEntry, AuditError, AuditRecord, AuditSink};
use ridepool_core::policy::FullRefundPolicy;
use ridepool_core::{
    BookingId, BookingRequest, BookingStatus, BookingStore, CancelInitiator, CascadePlan, CascadeReceipt,
    CommitReceipt, GuardedWrite, Notifier, NotifyError, RefundPolicy, StoreError, Trip, TripId, TripStatus, UserId,
};
use ridepool_shared::NotificationEvent;
use ridepool_store::{BroadcastNotifier, MemoryStore, MemoryTrips};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub trips: Arc<MemoryTrips>,
    pub notifier: BroadcastNotifier,
    pub lifecycle: Arc<BookingLifecycle>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(FullRefundPolicy), None)
    }

    pub fn with(refunds: Arc<dyn RefundPolicy>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(store.clone(), store, refunds, notifier)
    }

    /// Lifecycle and cascade write through a store where an armed payment
    /// lands just ahead of the next guarded write.
    pub fn with_payment_race() -> (Self, Arc<PaymentLandsFirst>) {
        let store = Arc::new(MemoryStore::new());
        let race = PaymentLandsFirst::new(store.clone());
        (Self::build(store, race.clone(), Arc::new(FullRefundPolicy), None), race)
    }

    fn build(
        store: Arc<MemoryStore>,
        bookings: Arc<dyn BookingStore>,
        refunds: Arc<dyn RefundPolicy>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let trips = Arc::new(MemoryTrips::new());
        let broadcast = BroadcastNotifier::new(256);
        let notify: Arc<dyn Notifier> = match notifier {
            Some(notifier) => notifier,
            None => Arc::new(broadcast.clone()),
        };
        let lifecycle = Arc::new(BookingLifecycle::new(
            bookings.clone(),
            store.clone(),
            trips.clone(),
            refunds,
            notify,
        ));
        Self {
            store,
            bookings,
            trips,
            notifier: broadcast,
            lifecycle,
        }
    }

    pub fn coordinator(&self, audit: Arc<dyn AuditSink>) -> CascadeCoordinator {
        CascadeCoordinator::new(self.bookings.clone(), self.trips.clone(), Arc::new(self.notifier.clone()), audit)
    }

    /// Published trip departing tomorrow.
    pub fn trip(&self, total_seats: u32) -> Trip {
        let trip = Trip {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            total_seats,
            status: TripStatus::Published,
            departure_at: Utc::now() + Duration::days(1),
        };
        self.trips.insert(trip.clone()).unwrap();
        trip
    }

    pub async fn request(&self, trip_id: TripId, seats: u32) -> BookingRequest {
        self.lifecycle.create(trip_id, Uuid::new_v4(), seats, None).await.unwrap()
    }

    pub async fn accepted(&self, trip: &Trip, seats: u32) -> BookingRequest {
        let booking = self.request(trip.id, seats).await;
        self.lifecycle.accept(booking.id, trip.driver_id).await.unwrap()
    }

    pub async fn allocated(&self, trip_id: TripId) -> u32 {
        use ridepool_core::CapacityLedger;
        self.store.entry(trip_id).await.unwrap().map(|e| e.allocated_seats).unwrap_or(0)
    }
}

pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _event: NotificationEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("gateway down".to_string()))
    }
}

pub struct NoRefunds;

#[async_trait]
impl RefundPolicy for NoRefunds {
    async fn is_eligible(&self, _booking: &BookingRequest, _initiator: CancelInitiator) -> bool {
        false
    }
}

pub struct UnavailableAudit;

#[async_trait]
impl AuditSink for UnavailableAudit {
    async fn record(&self, _record: AuditRecord) -> Result<AuditEntry, AuditError> {
        Err(AuditError::Store("connection refused".to_string()))
    }
}

/// Completes the payment on an armed booking right before the next guarded
/// write reaches the store, the way a processor callback lands between a
/// read and a write.
pub struct PaymentLandsFirst {
    inner: Arc<MemoryStore>,
    armed: Mutex<Option<BookingId>>,
}

impl PaymentLandsFirst {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: Mutex::new(None),
        })
    }

    pub fn arm(&self, booking_id: BookingId) {
        *self.armed.lock().unwrap() = Some(booking_id);
    }

    async fn land_payment(&self) {
        let armed = self.armed.lock().unwrap().take();
        if let Some(id) = armed {
            let booking = self.inner.find_booking(id).await.unwrap().unwrap();
            let paid = booking.mark_payment_completed(Some("pi_race".into()), Utc::now()).unwrap();
            self.inner
                .commit(GuardedWrite::status_only(paid, BookingStatus::Accepted))
                .await
                .unwrap();
        }
    }
}

#[async_trait]
impl BookingStore for PaymentLandsFirst {
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<(), StoreError> {
        self.inner.insert_booking(booking).await
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<BookingRequest>, StoreError> {
        self.inner.find_booking(id).await
    }

    async fn find_active_booking(
        &self,
        passenger_id: UserId,
        trip_id: TripId,
    ) -> Result<Option<BookingRequest>, StoreError> {
        self.inner.find_active_booking(passenger_id, trip_id).await
    }

    async fn bookings_for_trip(
        &self,
        trip_id: TripId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingRequest>, StoreError> {
        self.inner.bookings_for_trip(trip_id, statuses).await
    }

    async fn bookings_for_passenger(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, StoreError> {
        self.inner.bookings_for_passenger(passenger_id).await
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        self.inner.pending_created_before(cutoff, limit).await
    }

    async fn commit(&self, write: GuardedWrite) -> Result<CommitReceipt, StoreError> {
        self.land_payment().await;
        self.inner.commit(write).await
    }

    async fn commit_cascade(&self, plan: &CascadePlan) -> Result<CascadeReceipt, StoreError> {
        self.land_payment().await;
        self.inner.commit_cascade(plan).await
    }
}
