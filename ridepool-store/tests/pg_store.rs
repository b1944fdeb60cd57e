//! Postgres-backed checks. Run with `DATABASE_URL=... cargo test -- --ignored`.

use chrono::{Duration, Utc};
use ridepool_core::audit::{Actor, AuditDraft, AuditError, AuditRecord, AuditStore, ChainSealer, EntityRef};
use ridepool_core::booking::{transition, BookingCommand};
use ridepool_core::{
    BookingRequest, BookingStatus, BookingStore, CapacityLedger, GuardedWrite, LedgerError, StoreError, TripLookup,
    TripStatus,
};
use ridepool_shared::Masked;
use ridepool_store::app_config::DatabaseConfig;
use ridepool_store::{DbClient, PgStore};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

async fn store() -> (DbClient, PgStore) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
    let config = DatabaseConfig {
        url: Masked(url),
        max_connections: 10,
        acquire_timeout_seconds: 5,
    };
    let db = DbClient::new(&config).await.unwrap();
    db.migrate().await.unwrap();
    let store = PgStore::new(db.pool.clone());
    (db, store)
}

async fn published_trip(db: &DbClient, total_seats: i32) -> (Uuid, Uuid) {
    let (trip_id, driver_id) = (Uuid::new_v4(), Uuid::new_v4());
    sqlx::query("INSERT INTO trips (id, driver_id, total_seats, status, departure_at) VALUES ($1, $2, $3, 'published', $4)")
        .bind(trip_id)
        .bind(driver_id)
        .bind(total_seats)
        .bind(Utc::now() + Duration::days(1))
        .execute(&db.pool)
        .await
        .unwrap();
    (trip_id, driver_id)
}

#[tokio::test]
#[ignore]
async fn test_trip_lookup_reads_status() {
    let (db, store) = store().await;
    let (trip_id, driver_id) = published_trip(&db, 3).await;

    let trip = store.find_trip(trip_id).await.unwrap().unwrap();
    assert_eq!(trip.driver_id, driver_id);
    assert_eq!(trip.status, TripStatus::Published);
    assert!(store.find_trip(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_concurrent_allocations_never_overbook() {
    let (_db, store) = store().await;
    let store = Arc::new(store);
    let trip_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.allocate(trip_id, 5, 1).await }));
    }
    let mut granted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(e) => assert!(matches!(e, LedgerError::CapacityExceeded { .. }), "{e}"),
        }
    }

    assert_eq!(granted, 5);
    assert_eq!(store.entry(trip_id).await.unwrap().unwrap().allocated_seats, 5);
    assert!(matches!(
        store.release(trip_id, 6).await,
        Err(LedgerError::InvariantViolation { allocated: 5, .. })
    ));
}

#[tokio::test]
#[ignore]
async fn test_partial_index_blocks_second_active_booking() {
    let (db, store) = store().await;
    let (trip_id, _) = published_trip(&db, 3).await;
    let first = BookingRequest::new(trip_id, Uuid::new_v4(), 1, None, Utc::now()).unwrap();
    store.insert_booking(&first).await.unwrap();

    let second = BookingRequest::new(trip_id, first.passenger_id, 2, None, Utc::now()).unwrap();
    match store.insert_booking(&second).await {
        Err(StoreError::DuplicateActiveBooking { existing, .. }) => assert_eq!(existing, first.id),
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_guarded_commit_rolls_back_ledger_on_stale_status() {
    let (db, store) = store().await;
    let (trip_id, driver_id) = published_trip(&db, 4).await;
    let booking = BookingRequest::new(trip_id, Uuid::new_v4(), 2, None, Utc::now()).unwrap();
    store.insert_booking(&booking).await.unwrap();

    let accept = transition(&booking, BookingCommand::Accept { driver_id }, Utc::now()).unwrap();
    store.commit(GuardedWrite::from_transition(&accept, 4)).await.unwrap();

    let err = store.commit(GuardedWrite::from_transition(&accept, 4)).await.unwrap_err();
    assert!(matches!(err, StoreError::StaleWrite { actual: BookingStatus::Accepted, .. }));
    assert_eq!(store.entry(trip_id).await.unwrap().unwrap().allocated_seats, 2);
}

#[tokio::test]
#[ignore]
async fn test_commit_from_copy_read_before_payment_is_stale() {
    let (db, store) = store().await;
    let (trip_id, driver_id) = published_trip(&db, 3).await;
    let booking = BookingRequest::new(trip_id, Uuid::new_v4(), 1, None, Utc::now()).unwrap();
    store.insert_booking(&booking).await.unwrap();
    let accept = transition(&booking, BookingCommand::Accept { driver_id }, Utc::now()).unwrap();
    let accepted = store.commit(GuardedWrite::from_transition(&accept, 3)).await.unwrap().booking;

    let cancel = transition(
        &accepted,
        BookingCommand::CancelByPassenger { reason: None, refund_eligible: true },
        Utc::now(),
    )
    .unwrap();
    let paid = accepted.mark_payment_completed(None, Utc::now()).unwrap();
    store.commit(GuardedWrite::status_only(paid, BookingStatus::Accepted)).await.unwrap();

    let err = store.commit(GuardedWrite::from_transition(&cancel, 3)).await.unwrap_err();
    assert!(matches!(err, StoreError::StaleWrite { actual: BookingStatus::Accepted, .. }));
    let stored = store.find_booking(booking.id).await.unwrap().unwrap();
    assert!(stored.is_paid);
    assert_eq!(stored.version, 2);
    assert_eq!(store.entry(trip_id).await.unwrap().unwrap().allocated_seats, 1);
}

struct PlainSealer;

impl ChainSealer for PlainSealer {
    fn key_version(&self) -> &str {
        "test"
    }

    fn seal(&self, draft: &AuditDraft, prev_hash: Option<&str>) -> Result<String, AuditError> {
        Ok(format!("{}:{}", prev_hash.unwrap_or("-"), draft.id.simple()))
    }

    fn fold(&self, running: &str, hash: &str) -> Result<String, AuditError> {
        Ok(format!("{}{}", running.len(), hash.len()))
    }
}

#[tokio::test]
#[ignore]
async fn test_audit_appends_link_to_chain_head() {
    let (_db, store) = store().await;
    let record = AuditRecord {
        actor: Actor::admin("ops-1"),
        action: "user.suspend".into(),
        entity: EntityRef::new("user", Uuid::new_v4()),
        delta: json!({"suspended": true}),
        reason: Some("fraud".into()),
        correlation_id: None,
    };

    let (first, _) = store.append_sealed(AuditDraft::new(record.clone(), Utc::now()), &PlainSealer).await.unwrap();
    let (second, anchor) = store.append_sealed(AuditDraft::new(record, Utc::now()), &PlainSealer).await.unwrap();

    assert_eq!(second.seq, first.seq + 1);
    assert_eq!(second.prev_hash.as_deref(), Some(first.hash.as_str()));
    assert_eq!(store.chain_head().await.unwrap(), Some(second.hash.clone()));
    assert_eq!(store.anchor(anchor.date).await.unwrap().unwrap(), anchor);

    let before = store.entry_before(second.seq).await.unwrap().unwrap();
    assert_eq!(before.id, first.id);
}
