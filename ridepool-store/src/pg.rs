use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use ridepool_core::audit::{
    previous_day, Actor, AuditAnchor, AuditDraft, AuditEntry, AuditError, AuditStore, ChainSealer, EntityRef,
};
use ridepool_core::{
    Allocation, BookingId, BookingRequest, BookingStatus, BookingStore, CapacityLedger, CascadePlan, CascadeReceipt,
    CommitReceipt, GuardedWrite, LedgerEntry, LedgerError, LedgerOp, Release, StoreError, Trip, TripId, TripLookup,
    UserId,
};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

const BOOKING_COLUMNS: &str = "id, trip_id, passenger_id, status, seats, note, payment_method, payment_status, \
     payment_reference, is_paid, paid_at, refund_needed, accepted_at, accepted_by, declined_at, declined_by, \
     decline_reason, canceled_at, cancellation_reason, created_at, updated_at, version";

const AUDIT_COLUMNS: &str = "id, seq, at, actor_type, actor_id, action, entity_type, entity_id, delta, reason, \
     correlation_id, prev_hash, hash";

const ACTIVE_BOOKING_INDEX: &str = "booking_requests_one_active";

/// Postgres implementation of every storage port. Each guarded operation runs
/// in one transaction; row-level conditional updates provide the
/// compare-and-swap. Ledger rows are always locked before booking rows.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn ledger_backend(e: sqlx::Error) -> LedgerError {
    LedgerError::Store(e.to_string())
}

fn audit_backend(e: sqlx::Error) -> AuditError {
    AuditError::Store(e.to_string())
}

fn to_i32(value: u32) -> Result<i32, LedgerError> {
    i32::try_from(value).map_err(|_| LedgerError::Store(format!("seat count {value} out of range")))
}

fn to_u32(value: i32) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("negative seat count {value} in store"))
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    trip_id: Uuid,
    passenger_id: Uuid,
    status: String,
    seats: i32,
    note: Option<String>,
    payment_method: Option<String>,
    payment_status: Option<String>,
    payment_reference: Option<String>,
    is_paid: bool,
    paid_at: Option<DateTime<Utc>>,
    refund_needed: bool,
    accepted_at: Option<DateTime<Utc>>,
    accepted_by: Option<Uuid>,
    declined_at: Option<DateTime<Utc>>,
    declined_by: Option<Uuid>,
    decline_reason: Option<String>,
    canceled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<BookingRow> for BookingRequest {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let invalid = |e: ridepool_core::UnknownStatus| StoreError::Backend(e.to_string());
        Ok(BookingRequest {
            id: row.id,
            trip_id: row.trip_id,
            passenger_id: row.passenger_id,
            status: row.status.parse().map_err(invalid)?,
            seats: to_u32(row.seats).map_err(StoreError::Backend)?,
            note: row.note,
            payment_method: row.payment_method.map(|m| m.parse()).transpose().map_err(invalid)?,
            payment_status: row.payment_status.map(|s| s.parse()).transpose().map_err(invalid)?,
            payment_reference: row.payment_reference,
            is_paid: row.is_paid,
            paid_at: row.paid_at,
            refund_needed: row.refund_needed,
            accepted_at: row.accepted_at,
            accepted_by: row.accepted_by,
            declined_at: row.declined_at,
            declined_by: row.declined_by,
            decline_reason: row.decline_reason,
            canceled_at: row.canceled_at,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    trip_id: Uuid,
    allocated_seats: i32,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            trip_id: row.trip_id,
            allocated_seats: to_u32(row.allocated_seats).map_err(LedgerError::Store)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TripRow {
    id: Uuid,
    driver_id: Uuid,
    total_seats: i32,
    status: String,
    departure_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    seq: i64,
    at: DateTime<Utc>,
    actor_type: String,
    actor_id: Option<String>,
    action: String,
    entity_type: String,
    entity_id: String,
    delta: Value,
    reason: Option<String>,
    correlation_id: Option<String>,
    prev_hash: Option<String>,
    hash: String,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: row.id,
            seq: row.seq,
            at: row.at,
            actor: Actor {
                kind: row.actor_type.parse().map_err(|e| AuditError::Store(format!("{e}")))?,
                id: row.actor_id,
            },
            action: row.action,
            entity: EntityRef {
                kind: row.entity_type,
                id: row.entity_id,
            },
            delta: row.delta,
            reason: row.reason,
            correlation_id: row.correlation_id,
            prev_hash: row.prev_hash,
            hash: row.hash,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnchorRow {
    day: NaiveDate,
    hmac: String,
    entries: i64,
    key_version: String,
    updated_at: DateTime<Utc>,
}

impl From<AnchorRow> for AuditAnchor {
    fn from(row: AnchorRow) -> Self {
        AuditAnchor {
            date: row.day,
            hmac: row.hmac,
            entries: row.entries.max(0) as u64,
            key_version: row.key_version,
            updated_at: row.updated_at,
        }
    }
}

/// Binds the booking in `BOOKING_COLUMNS` order as `$1..$22`.
fn bind_booking<'q>(
    query: Query<'q, Postgres, PgArguments>,
    b: &'q BookingRequest,
    seats: i32,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(b.id)
        .bind(b.trip_id)
        .bind(b.passenger_id)
        .bind(b.status.as_str())
        .bind(seats)
        .bind(b.note.as_deref())
        .bind(b.payment_method.map(|m| m.as_str()))
        .bind(b.payment_status.map(|s| s.as_str()))
        .bind(b.payment_reference.as_deref())
        .bind(b.is_paid)
        .bind(b.paid_at)
        .bind(b.refund_needed)
        .bind(b.accepted_at)
        .bind(b.accepted_by)
        .bind(b.declined_at)
        .bind(b.declined_by)
        .bind(b.decline_reason.as_deref())
        .bind(b.canceled_at)
        .bind(b.cancellation_reason.as_deref())
        .bind(b.created_at)
        .bind(b.updated_at)
        .bind(b.version)
}

/// Write `booking` only if its stored status is still `expected` and its row
/// version is the one it was read at. Returns the booking at its new version.
async fn guarded_update(
    tx: &mut Transaction<'_, Postgres>,
    booking: &BookingRequest,
    expected: BookingStatus,
) -> Result<BookingRequest, StoreError> {
    let seats = to_i32(booking.seats)?;
    let sql = "UPDATE booking_requests SET trip_id = $2, passenger_id = $3, status = $4, seats = $5, note = $6, \
               payment_method = $7, payment_status = $8, payment_reference = $9, is_paid = $10, paid_at = $11, \
               refund_needed = $12, accepted_at = $13, accepted_by = $14, declined_at = $15, declined_by = $16, \
               decline_reason = $17, canceled_at = $18, cancellation_reason = $19, created_at = $20, \
               updated_at = $21, version = $22 + 1 \
               WHERE id = $1 AND version = $22 AND status = $23";
    let result = bind_booking(sqlx::query(sql), booking, seats)
        .bind(expected.as_str())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    if result.rows_affected() == 1 {
        let mut next = booking.clone();
        next.version += 1;
        return Ok(next);
    }

    let actual: Option<String> = sqlx::query_scalar("SELECT status FROM booking_requests WHERE id = $1")
        .bind(booking.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?;
    match actual {
        None => Err(StoreError::NotFound(booking.id)),
        Some(actual) => Err(StoreError::StaleWrite {
            id: booking.id,
            expected,
            actual: actual.parse().map_err(|e: ridepool_core::UnknownStatus| StoreError::Backend(e.to_string()))?,
        }),
    }
}

async fn current_allocation(tx: &mut Transaction<'_, Postgres>, trip_id: TripId) -> Result<u32, LedgerError> {
    let allocated: Option<i32> = sqlx::query_scalar("SELECT allocated_seats FROM capacity_ledger WHERE trip_id = $1")
        .bind(trip_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(ledger_backend)?;
    to_u32(allocated.unwrap_or(0)).map_err(LedgerError::Store)
}

/// Guarded increment or decrement of one ledger row.
async fn apply_ledger(tx: &mut Transaction<'_, Postgres>, op: LedgerOp) -> Result<LedgerEntry, LedgerError> {
    match op {
        LedgerOp::Allocate { trip_id, total_seats, seats } => {
            if seats == 0 {
                return Err(LedgerError::ZeroSeats);
            }
            sqlx::query(
                "INSERT INTO capacity_ledger (trip_id, allocated_seats, updated_at) VALUES ($1, 0, NOW()) \
                 ON CONFLICT (trip_id) DO NOTHING",
            )
            .bind(trip_id)
            .execute(&mut **tx)
            .await
            .map_err(ledger_backend)?;

            let row: Option<LedgerRow> = sqlx::query_as(
                "UPDATE capacity_ledger SET allocated_seats = allocated_seats + $2, updated_at = NOW() \
                 WHERE trip_id = $1 AND allocated_seats + $2 <= $3 \
                 RETURNING trip_id, allocated_seats, updated_at",
            )
            .bind(trip_id)
            .bind(to_i32(seats)?)
            .bind(to_i32(total_seats)?)
            .fetch_optional(&mut **tx)
            .await
            .map_err(ledger_backend)?;

            match row {
                Some(row) => row.try_into(),
                None => {
                    let allocated = current_allocation(tx, trip_id).await?;
                    Err(LedgerError::CapacityExceeded {
                        trip_id,
                        requested: seats,
                        remaining: total_seats.saturating_sub(allocated),
                    })
                }
            }
        }
        LedgerOp::Release { trip_id, seats } => {
            if seats == 0 {
                return Err(LedgerError::ZeroSeats);
            }
            let row: Option<LedgerRow> = sqlx::query_as(
                "UPDATE capacity_ledger SET allocated_seats = allocated_seats - $2, updated_at = NOW() \
                 WHERE trip_id = $1 AND allocated_seats >= $2 \
                 RETURNING trip_id, allocated_seats, updated_at",
            )
            .bind(trip_id)
            .bind(to_i32(seats)?)
            .fetch_optional(&mut **tx)
            .await
            .map_err(ledger_backend)?;

            match row {
                Some(row) => row.try_into(),
                None => {
                    let allocated = current_allocation(tx, trip_id).await?;
                    let err = LedgerError::InvariantViolation { trip_id, allocated, requested: seats };
                    error!(trip_id = %trip_id, error = %err, "Refusing ledger release");
                    Err(err)
                }
            }
        }
    }
}

#[async_trait]
impl CapacityLedger for PgStore {
    async fn allocate(&self, trip_id: TripId, total_seats: u32, seats: u32) -> Result<Allocation, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;
        let entry = apply_ledger(&mut tx, LedgerOp::Allocate { trip_id, total_seats, seats }).await?;
        tx.commit().await.map_err(ledger_backend)?;

        Ok(Allocation {
            trip_id,
            allocated_seats: entry.allocated_seats,
            remaining_seats: entry.remaining_seats(total_seats),
        })
    }

    async fn release(&self, trip_id: TripId, seats: u32) -> Result<Release, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(ledger_backend)?;
        let entry = apply_ledger(&mut tx, LedgerOp::Release { trip_id, seats }).await?;
        tx.commit().await.map_err(ledger_backend)?;

        Ok(Release {
            trip_id,
            allocated_seats: entry.allocated_seats,
        })
    }

    async fn entry(&self, trip_id: TripId) -> Result<Option<LedgerEntry>, LedgerError> {
        let row: Option<LedgerRow> =
            sqlx::query_as("SELECT trip_id, allocated_seats, updated_at FROM capacity_ledger WHERE trip_id = $1")
                .bind(trip_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(ledger_backend)?;
        row.map(LedgerEntry::try_from).transpose()
    }
}

impl PgStore {
    async fn fetch_bookings(&self, sql: &str, key: Uuid) -> Result<Vec<BookingRequest>, StoreError> {
        let rows: Vec<BookingRow> = sqlx::query_as(sql).bind(key).fetch_all(&self.pool).await.map_err(backend)?;
        rows.into_iter().map(BookingRequest::try_from).collect()
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<(), StoreError> {
        let seats = to_i32(booking.seats)?;
        let sql = format!(
            "INSERT INTO booking_requests ({BOOKING_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        );
        let result = bind_booking(sqlx::query(&sql), booking, seats).execute(&self.pool).await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(ACTIVE_BOOKING_INDEX) => {
                let existing = self
                    .find_active_booking(booking.passenger_id, booking.trip_id)
                    .await?
                    .map(|b| b.id)
                    .unwrap_or_default();
                Err(StoreError::DuplicateActiveBooking {
                    passenger_id: booking.passenger_id,
                    trip_id: booking.trip_id,
                    existing,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<BookingRequest>, StoreError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM booking_requests WHERE id = $1");
        let row: Option<BookingRow> =
            sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await.map_err(backend)?;
        row.map(BookingRequest::try_from).transpose()
    }

    async fn find_active_booking(
        &self,
        passenger_id: UserId,
        trip_id: TripId,
    ) -> Result<Option<BookingRequest>, StoreError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM booking_requests \
             WHERE passenger_id = $1 AND trip_id = $2 AND status IN ('pending', 'accepted')"
        );
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(passenger_id)
            .bind(trip_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(BookingRequest::try_from).transpose()
    }

    async fn bookings_for_trip(
        &self,
        trip_id: TripId,
        statuses: &[BookingStatus],
    ) -> Result<Vec<BookingRequest>, StoreError> {
        if statuses.is_empty() {
            let sql = format!("SELECT {BOOKING_COLUMNS} FROM booking_requests WHERE trip_id = $1 ORDER BY created_at");
            return self.fetch_bookings(&sql, trip_id).await;
        }

        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM booking_requests WHERE trip_id = $1 AND status = ANY($2) ORDER BY created_at"
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql)
            .bind(trip_id)
            .bind(wanted)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(BookingRequest::try_from).collect()
    }

    async fn bookings_for_passenger(&self, passenger_id: UserId) -> Result<Vec<BookingRequest>, StoreError> {
        let sql =
            format!("SELECT {BOOKING_COLUMNS} FROM booking_requests WHERE passenger_id = $1 ORDER BY created_at DESC");
        self.fetch_bookings(&sql, passenger_id).await
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM booking_requests \
             WHERE status = 'pending' AND created_at < $1 ORDER BY created_at LIMIT $2"
        );
        let rows: Vec<BookingRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(BookingRequest::try_from).collect()
    }

    async fn commit(&self, write: GuardedWrite) -> Result<CommitReceipt, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // 1. Ledger row first, so lock order matches the cascade
        let ledger = match write.ledger {
            Some(op) => Some(apply_ledger(&mut tx, op).await?),
            None => None,
        };

        // 2. Booking compare-and-swap; any failure rolls the ledger back
        let booking = guarded_update(&mut tx, &write.booking, write.expected).await?;

        tx.commit().await.map_err(backend)?;
        Ok(CommitReceipt { booking, ledger })
    }

    async fn commit_cascade(&self, plan: &CascadePlan) -> Result<CascadeReceipt, StoreError> {
        let trip_id = plan.trip_id;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // 1. Lock the ledger row for the whole cascade
        let allocated: Option<i32> =
            sqlx::query_scalar("SELECT allocated_seats FROM capacity_ledger WHERE trip_id = $1 FOR UPDATE")
                .bind(trip_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
        let allocated = to_u32(allocated.unwrap_or(0)).map_err(StoreError::Backend)?;

        // 2. Guarded transitions for every planned booking
        for booking in &plan.auto_declined {
            guarded_update(&mut tx, booking, BookingStatus::Pending).await?;
        }
        for booking in &plan.platform_canceled {
            guarded_update(&mut tx, booking, BookingStatus::Accepted).await?;
        }

        // 3. Nothing active may be left behind
        let unplanned: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM booking_requests WHERE trip_id = $1 AND status IN ('pending', 'accepted') LIMIT 1",
        )
        .bind(trip_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if let Some(unplanned) = unplanned {
            return Err(StoreError::CascadeOutdated { trip_id, unplanned });
        }

        // 4. Reconcile, then release
        if allocated != plan.seats_to_release {
            return Err(StoreError::LedgerMismatch {
                trip_id,
                expected: plan.seats_to_release,
                actual: allocated,
            });
        }
        let ledger = if plan.seats_to_release > 0 {
            Some(apply_ledger(&mut tx, LedgerOp::Release { trip_id, seats: plan.seats_to_release }).await?)
        } else {
            None
        };

        tx.commit().await.map_err(backend)?;
        Ok(CascadeReceipt {
            declined_auto: plan.auto_declined.len(),
            canceled_by_platform: plan.platform_canceled.len(),
            seats_released: plan.seats_to_release,
            ledger,
        })
    }
}

#[async_trait]
impl TripLookup for PgStore {
    async fn find_trip(&self, id: TripId) -> Result<Option<Trip>, StoreError> {
        let row: Option<TripRow> =
            sqlx::query_as("SELECT id, driver_id, total_seats, status, departure_at FROM trips WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        row.map(|row| {
            Ok(Trip {
                id: row.id,
                driver_id: row.driver_id,
                total_seats: to_u32(row.total_seats).map_err(StoreError::Backend)?,
                status: row.status.parse().map_err(|e: ridepool_core::UnknownStatus| StoreError::Backend(e.to_string()))?,
                departure_at: row.departure_at,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_sealed(
        &self,
        mut draft: AuditDraft,
        sealer: &dyn ChainSealer,
    ) -> Result<(AuditEntry, AuditAnchor), AuditError> {
        let mut tx = self.pool.begin().await.map_err(audit_backend)?;

        // 1. Take the chain head; concurrent appends queue here
        let (last_seq, last_hash, last_at): (i64, Option<String>, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT last_seq, last_hash, last_at FROM audit_chain_head WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await
                .map_err(audit_backend)?;
        if let Some(last_at) = last_at {
            if draft.at < last_at {
                draft.at = last_at;
            }
        }

        // 2. Seal and insert
        let hash = sealer.seal(&draft, last_hash.as_deref())?;
        let entry = AuditEntry::sealed(draft, last_seq + 1, last_hash, hash);
        let sql = format!(
            "INSERT INTO audit_entries ({AUDIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        sqlx::query(&sql)
            .bind(entry.id)
            .bind(entry.seq)
            .bind(entry.at)
            .bind(entry.actor.kind.as_str())
            .bind(entry.actor.id.as_deref())
            .bind(&entry.action)
            .bind(&entry.entity.kind)
            .bind(&entry.entity.id)
            .bind(&entry.delta)
            .bind(entry.reason.as_deref())
            .bind(entry.correlation_id.as_deref())
            .bind(entry.prev_hash.as_deref())
            .bind(&entry.hash)
            .execute(&mut *tx)
            .await
            .map_err(audit_backend)?;

        sqlx::query("UPDATE audit_chain_head SET last_seq = $1, last_hash = $2, last_at = $3 WHERE id = 1")
            .bind(entry.seq)
            .bind(&entry.hash)
            .bind(entry.at)
            .execute(&mut *tx)
            .await
            .map_err(audit_backend)?;

        // 3. Fold into the day's anchor
        let day = entry.day();
        let current: Option<(String, i64)> = sqlx::query_as("SELECT hmac, entries FROM audit_anchors WHERE day = $1")
            .bind(day)
            .fetch_optional(&mut *tx)
            .await
            .map_err(audit_backend)?;
        let (running, count) = match current {
            Some((hmac, entries)) => (hmac, entries),
            None => {
                let seed: Option<String> = match previous_day(day) {
                    Some(prev) => sqlx::query_scalar("SELECT hmac FROM audit_anchors WHERE day = $1")
                        .bind(prev)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(audit_backend)?,
                    None => None,
                };
                (seed.unwrap_or_default(), 0)
            }
        };
        let anchor = AuditAnchor {
            date: day,
            hmac: sealer.fold(&running, &entry.hash)?,
            entries: (count + 1).max(0) as u64,
            key_version: sealer.key_version().to_string(),
            updated_at: Utc::now().trunc_subsecs(6),
        };
        upsert_anchor(&mut tx, &anchor).await?;

        tx.commit().await.map_err(audit_backend)?;
        Ok((entry, anchor))
    }

    async fn entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditError> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE at >= $1 AND at < $2 ORDER BY seq");
        let rows: Vec<AuditRow> = sqlx::query_as(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(audit_backend)?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn entry_before(&self, seq: i64) -> Result<Option<AuditEntry>, AuditError> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE seq < $1 ORDER BY seq DESC LIMIT 1");
        let row: Option<AuditRow> =
            sqlx::query_as(&sql).bind(seq).fetch_optional(&self.pool).await.map_err(audit_backend)?;
        row.map(AuditEntry::try_from).transpose()
    }

    async fn anchor(&self, date: NaiveDate) -> Result<Option<AuditAnchor>, AuditError> {
        let row: Option<AnchorRow> =
            sqlx::query_as("SELECT day, hmac, entries, key_version, updated_at FROM audit_anchors WHERE day = $1")
                .bind(date)
                .fetch_optional(&self.pool)
                .await
                .map_err(audit_backend)?;
        Ok(row.map(AuditAnchor::from))
    }

    async fn replace_anchor(&self, anchor: &AuditAnchor) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await.map_err(audit_backend)?;
        upsert_anchor(&mut tx, anchor).await?;
        tx.commit().await.map_err(audit_backend)
    }

    async fn chain_head(&self) -> Result<Option<String>, AuditError> {
        let head: Option<Option<String>> = sqlx::query_scalar("SELECT last_hash FROM audit_chain_head WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(audit_backend)?;
        Ok(head.flatten())
    }
}

async fn upsert_anchor(tx: &mut Transaction<'_, Postgres>, anchor: &AuditAnchor) -> Result<(), AuditError> {
    sqlx::query(
        "INSERT INTO audit_anchors (day, hmac, entries, key_version, updated_at) VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (day) DO UPDATE SET hmac = EXCLUDED.hmac, entries = EXCLUDED.entries, \
         key_version = EXCLUDED.key_version, updated_at = EXCLUDED.updated_at",
    )
    .bind(anchor.date)
    .bind(&anchor.hmac)
    .bind(i64::try_from(anchor.entries).unwrap_or(i64::MAX))
    .bind(&anchor.key_version)
    .bind(anchor.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(audit_backend)?;
    Ok(())
}
