use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use ridepool_core::audit::{previous_day, AuditAnchor, AuditDraft, AuditEntry, AuditError, AuditStore, ChainSealer};
use ridepool_core::{
    Allocation, BookingId, BookingRequest, BookingStatus, BookingStore, CapacityLedger, CascadePlan, CascadeReceipt,
    CommitReceipt, GuardedWrite, LedgerEntry, LedgerError, LedgerOp, Release, StoreError, Trip, TripId, TripLookup,
    TripStatus, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::error;

#[derive(Default)]
struct Inner {
    bookings: HashMap<BookingId, BookingRequest>,
    ledger: HashMap<TripId, LedgerEntry>,
    audit: Vec<AuditEntry>,
    anchors: BTreeMap<NaiveDate, AuditAnchor>,
}

impl Inner {
    fn apply_ledger(&self, op: LedgerOp, now: DateTime<Utc>) -> Result<LedgerEntry, LedgerError> {
        match op {
            LedgerOp::Allocate { trip_id, total_seats, seats } => {
                let mut entry = self.ledger.get(&trip_id).cloned().unwrap_or_else(|| LedgerEntry::new(trip_id, now));
                entry.allocated_seats = entry.checked_allocate(total_seats, seats)?;
                entry.updated_at = now;
                Ok(entry)
            }
            LedgerOp::Release { trip_id, seats } => {
                let mut entry = self.ledger.get(&trip_id).cloned().unwrap_or_else(|| LedgerEntry::new(trip_id, now));
                entry.allocated_seats = entry.checked_release(seats)?;
                entry.updated_at = now;
                Ok(entry)
            }
        }
    }

    fn active_for(&self, passenger_id: UserId, trip_id: TripId) -> Option<&BookingRequest> {
        self.bookings
            .values()
            .find(|b| b.passenger_id == passenger_id && b.trip_id == trip_id && b.status.is_active())
    }

    /// Compare-and-swap guard: stored status and version must match the copy
    /// the write was built from.
    fn expect_unchanged(&self, booking: &BookingRequest, expected: BookingStatus) -> Result<(), StoreError> {
        let current = self.bookings.get(&booking.id).ok_or(StoreError::NotFound(booking.id))?;
        if current.status != expected || current.version != booking.version {
            return Err(StoreError::StaleWrite {
                id: booking.id,
                expected,
                actual: current.status,
            });
        }
        Ok(())
    }

    fn store_next(&mut self, booking: &BookingRequest) -> BookingRequest {
        let mut next = booking.clone();
        next.version += 1;
        self.bookings.insert(next.id, next.clone());
        next
    }
}

/// Whole-state store behind one mutex. Every operation is a critical section,
/// which gives the same all-or-nothing guarantees as a database transaction.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, String> {
        self.inner.lock().map_err(|_| "memory store lock poisoned".to_string())
    }

    /// Overwrite a stored audit entry, bypassing the append-only path.
    /// Simulates storage-level tampering.
    pub fn overwrite_audit_entry(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut inner = self.lock().map_err(AuditError::Store)?;
        match inner.audit.iter_mut().find(|e| e.seq == entry.seq) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(AuditError::Store(format!("no audit entry with seq {}", entry.seq))),
        }
    }

    /// Overwrite a ledger row, bypassing the guards. Simulates corruption.
    pub fn overwrite_ledger(&self, entry: LedgerEntry) -> Result<(), StoreError> {
        let mut inner = self.lock().map_err(StoreError::Backend)?;
        inner.ledger.insert(entry.trip_id, entry);
        Ok(())
    }
}

#[async_trait]
impl CapacityLedger for MemoryStore {
    async fn allocate(&self, trip_id: TripId, total_seats: u32, seats: u32) -> Result<Allocation, LedgerError> {
        let mut inner = self.lock().map_err(LedgerError::Store)?;
        let entry = inner.apply_ledger(LedgerOp::Allocate { trip_id, total_seats, seats }, Utc::now())?;
        let allocation = Allocation {
            trip_id,
            allocated_seats: entry.allocated_seats,
            remaining_seats: entry.remaining_seats(total_seats),
        };
        inner.ledger.insert(trip_id, entry);
        Ok(allocation)
    }

    async fn release(&self, trip_id: TripId, seats: u32) -> Result<Release, LedgerError> {
        let mut inner = self.lock().map_err(LedgerError::Store)?;
        let entry = inner
            .apply_ledger(LedgerOp::Release { trip_id, seats }, Utc::now())
            .inspect_err(|e| {
                if matches!(e, LedgerError::InvariantViolation { .. }) {
                    error!(trip_id = %trip_id, error = %e, "Refusing ledger release");
                }
            })?;
        let release = Release {
            trip_id,
            allocated_seats: entry.allocated_seats,
        };
        inner.ledger.insert(trip_id, entry);
        Ok(release)
    }

    async fn entry(&self, trip_id: TripId) -> Result<Option<LedgerEntry>, LedgerError> {
        let inner = self.lock().map_err(LedgerError::Store)?;
        Ok(inner.ledger.get(&trip_id).cloned())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<(), StoreError> {
        let mut inner = self.lock().map_err(StoreError::Backend)?;
        if booking.status.is_active() {
            if let Some(existing) = inner.active_for(booking.passenger_id, booking.trip_id) {
                return Err(StoreError::DuplicateActiveBooking {
                    passenger_id: booking.passenger_id,
                    trip_id: booking.trip_id,
                    existing: existing.id,
                });
            }
        }
        if inner.bookings.contains_key(&booking.id) {
            return Err(StoreError::Backend(format!("booking {} already exists", booking.id)));
        }
        inner.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<BookingRequest>, StoreError> {
        let inner = self.lock().map_err(StoreError::Backend)?;
        Ok(inner.bookings.get(&id).cloned())
    }

    async fn find_active_booking(
        &self,
        passenger_id: UserId,
        trip_id: TripId,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let inner = self.lock().map_err(StoreError::Backend)?;
        Ok(inner.active_for(passenger_id, trip_id).cloned())
    }

    async fn bookings_for_trip(
        &self,
        trip_id: TripId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let inner = self.lock().map_err(StoreError::Backend)?;
        let mut found: Vec<BookingRequest> = inner
            .bookings
            .values()
            .filter(|b| b.trip_id == trip_id && (statuses.is_empty() || statuses.contains(&b.status)))
            .cloned()
            .collect();
        found.sort_by_key(|b| b.created_at);
        Ok(found)
    }

    async fn bookings_for_passenger(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, StoreError> {
        let inner = self.lock().map_err(StoreError::Backend)?;
        let mut found: Vec<BookingRequest> =
            inner.bookings.values().filter(|b| b.passenger_id == passenger_id).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let inner = self.lock().map_err(StoreError::Backend)?;
        let mut found: Vec<BookingRequest> = inner
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at < cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|b| b.created_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn commit(&self, write: GuardedWrite) -> Result<CommitReceipt, StoreError> {
        let mut inner = self.lock().map_err(StoreError::Backend)?;
        let now = Utc::now();

        // 1. Compare-and-swap guard on the stored status and version
        inner.expect_unchanged(&write.booking, write.expected)?;

        // 2. Ledger change, computed before anything is written
        let ledger = match write.ledger {
            Some(op) => Some(inner.apply_ledger(op, now).inspect_err(|e| {
                if matches!(e, LedgerError::InvariantViolation { .. }) {
                    error!(booking_id = %write.booking.id, error = %e, "Refusing ledger release");
                }
            })?),
            None => None,
        };

        // 3. Both halves land together
        if let Some(entry) = &ledger {
            inner.ledger.insert(entry.trip_id, entry.clone());
        }
        let booking = inner.store_next(&write.booking);

        Ok(CommitReceipt { booking, ledger })
    }

    async fn commit_cascade(&self, plan: &CascadePlan) -> Result<CascadeReceipt, StoreError> {
        let mut inner = self.lock().map_err(StoreError::Backend)?;
        let now = Utc::now();

        // 1. Every planned booking must still be where the plan found it
        for booking in &plan.auto_declined {
            inner.expect_unchanged(booking, BookingStatus::Pending)?;
        }
        for booking in &plan.platform_canceled {
            inner.expect_unchanged(booking, BookingStatus::Accepted)?;
        }

        // 2. No active booking may escape the plan
        let planned = |id: &BookingId| {
            plan.auto_declined.iter().chain(&plan.platform_canceled).any(|b| &b.id == id)
        };
        if let Some(unplanned) = inner
            .bookings
            .values()
            .find(|b| b.trip_id == plan.trip_id && b.status.is_active() && !planned(&b.id))
        {
            return Err(StoreError::CascadeOutdated {
                trip_id: plan.trip_id,
                unplanned: unplanned.id,
            });
        }

        // 3. Ledger must agree with the accepted seats being released
        let allocated = inner.ledger.get(&plan.trip_id).map(|e| e.allocated_seats).unwrap_or(0);
        if allocated != plan.seats_to_release {
            return Err(StoreError::LedgerMismatch {
                trip_id: plan.trip_id,
                expected: plan.seats_to_release,
                actual: allocated,
            });
        }
        let ledger = if plan.seats_to_release > 0 {
            Some(inner.apply_ledger(
                LedgerOp::Release {
                    trip_id: plan.trip_id,
                    seats: plan.seats_to_release,
                },
                now,
            )?)
        } else {
            inner.ledger.get(&plan.trip_id).cloned()
        };

        // 4. Apply
        if let Some(entry) = &ledger {
            inner.ledger.insert(entry.trip_id, entry.clone());
        }
        for booking in plan.auto_declined.iter().chain(&plan.platform_canceled) {
            inner.store_next(booking);
        }

        Ok(CascadeReceipt {
            declined_auto: plan.auto_declined.len(),
            canceled_by_platform: plan.platform_canceled.len(),
            seats_released: plan.seats_to_release,
            ledger,
        })
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_sealed(
        &self,
        mut draft: AuditDraft,
        sealer: &dyn ChainSealer,
    ) -> Result<(AuditEntry, AuditAnchor), AuditError> {
        let mut inner = self.lock().map_err(AuditError::Store)?;

        // Chain order and time order must agree.
        if let Some(last) = inner.audit.last() {
            if draft.at < last.at {
                draft.at = last.at;
            }
        }
        let prev_hash = inner.audit.last().map(|e| e.hash.clone());
        let seq = inner.audit.last().map(|e| e.seq + 1).unwrap_or(1);
        let hash = sealer.seal(&draft, prev_hash.as_deref())?;

        let day = draft.day();
        let (running, count) = match inner.anchors.get(&day) {
            Some(anchor) => (anchor.hmac.clone(), anchor.entries),
            None => {
                let seed = previous_day(day)
                    .and_then(|prev| inner.anchors.get(&prev))
                    .map(|a| a.hmac.clone())
                    .unwrap_or_default();
                (seed, 0)
            }
        };
        let anchor = AuditAnchor {
            date: day,
            hmac: sealer.fold(&running, &hash)?,
            entries: count + 1,
            key_version: sealer.key_version().to_string(),
            updated_at: Utc::now().trunc_subsecs(6),
        };

        let entry = AuditEntry::sealed(draft, seq, prev_hash, hash);
        inner.audit.push(entry.clone());
        inner.anchors.insert(day, anchor.clone());
        Ok((entry, anchor))
    }

    async fn entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditError> {
        let inner = self.lock().map_err(AuditError::Store)?;
        Ok(inner.audit.iter().filter(|e| e.at >= from && e.at < to).cloned().collect())
    }

    async fn entry_before(&self, seq: i64) -> Result<Option<AuditEntry>, AuditError> {
        let inner = self.lock().map_err(AuditError::Store)?;
        Ok(inner.audit.iter().rev().find(|e| e.seq < seq).cloned())
    }

    async fn anchor(&self, date: NaiveDate) -> Result<Option<AuditAnchor>, AuditError> {
        let inner = self.lock().map_err(AuditError::Store)?;
        Ok(inner.anchors.get(&date).cloned())
    }

    async fn replace_anchor(&self, anchor: &AuditAnchor) -> Result<(), AuditError> {
        let mut inner = self.lock().map_err(AuditError::Store)?;
        inner.anchors.insert(anchor.date, anchor.clone());
        Ok(())
    }

    async fn chain_head(&self) -> Result<Option<String>, AuditError> {
        let inner = self.lock().map_err(AuditError::Store)?;
        Ok(inner.audit.last().map(|e| e.hash.clone()))
    }
}

/// Trip directory for tests and embedded use.
#[derive(Default)]
pub struct MemoryTrips {
    trips: Mutex<HashMap<TripId, Trip>>,
}

impl MemoryTrips {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, trip: Trip) -> Result<(), StoreError> {
        let mut trips = self.trips.lock().map_err(|_| StoreError::Backend("trip lock poisoned".to_string()))?;
        trips.insert(trip.id, trip);
        Ok(())
    }

    /// Move a trip through its status machine.
    pub fn set_status(&self, trip_id: TripId, status: TripStatus) -> Result<Trip, StoreError> {
        let mut trips = self.trips.lock().map_err(|_| StoreError::Backend("trip lock poisoned".to_string()))?;
        let trip = trips
            .get_mut(&trip_id)
            .ok_or_else(|| StoreError::Backend(format!("trip {trip_id} not found")))?;
        if !trip.status.can_transition_to(status) {
            return Err(StoreError::Backend(format!(
                "trip {trip_id} cannot move from {} to {}",
                trip.status, status
            )));
        }
        trip.status = status;
        Ok(trip.clone())
    }
}

#[async_trait]
impl TripLookup for MemoryTrips {
    async fn find_trip(&self, id: TripId) -> Result<Option<Trip>, StoreError> {
        let trips = self.trips.lock().map_err(|_| StoreError::Backend("trip lock poisoned".to_string()))?;
        Ok(trips.get(&id).cloned())
    }
}
