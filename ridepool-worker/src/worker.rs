use chrono::{DateTime, NaiveDate, Utc};
use ridepool_audit::IntegrityLog;
use ridepool_booking::ExpirySweep;
use ridepool_core::audit::{previous_day, AuditError, BreakKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Periodically expire stale pending requests until `shutdown` flips.
pub async fn run_expiry_job(sweep: Arc<ExpirySweep>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = every.as_secs(), ttl_hours = sweep.ttl().num_hours(), "Expiry sweep started");
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match sweep.run(Utc::now()).await {
            Ok(report) => debug!(expired = report.expired, "Expiry tick done"),
            Err(e) => error!(error = %e, "Expiry sweep failed"),
        }
    }
    info!("Expiry sweep stopped");
}

/// What one anchor pass did with the day it checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorPass {
    Clean,
    Repaired,
    /// The anchor disagrees with intact entries under the current key. Left
    /// for an operator.
    Disputed(usize),
    /// Entry hashes no longer verify. The anchor is left alone for investigation.
    Tampered(usize),
}

/// Verify a closed day and rebuild its anchor when it is missing or was
/// signed with a retired key. Any other disagreement is reported, not
/// overwritten, and anchors are never rebuilt over a broken entry chain.
pub async fn anchor_pass(log: &IntegrityLog, date: NaiveDate) -> Result<AnchorPass, AuditError> {
    let report = log.verify(date, date).await?;
    if report.verified {
        return Ok(AnchorPass::Clean);
    }

    let tampered = report.breaks.iter().filter(|b| b.kind == BreakKind::HashMismatch).count();
    if tampered > 0 {
        for found in &report.breaks {
            error!(%date, kind = ?found.kind, entry_id = ?found.entry_id, detail = %found.detail, "Audit chain break");
        }
        return Ok(AnchorPass::Tampered(tampered));
    }

    let rotated = log
        .anchor(date)
        .await?
        .is_some_and(|anchor| anchor.key_version != log.key_version());
    let repairable = report.breaks.iter().all(|b| match b.kind {
        BreakKind::MissingAnchor => true,
        BreakKind::AnchorMismatch => rotated,
        BreakKind::HashMismatch => false,
    });
    if !repairable {
        for found in &report.breaks {
            error!(%date, kind = ?found.kind, detail = %found.detail, "Audit anchor disputed, needs operator review");
        }
        return Ok(AnchorPass::Disputed(report.breaks.len()));
    }

    warn!(%date, breaks = report.breaks.len(), rotated, "Audit anchor missing or stale, regenerating");
    log.regenerate_anchor(date).await?;
    Ok(AnchorPass::Repaired)
}

/// Daily check of yesterday's anchor until `shutdown` flips.
pub async fn run_anchor_job(log: Arc<IntegrityLog>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = every.as_secs(), "Anchor job started");
    let mut interval = tokio::time::interval(every);
    let mut last_checked: Option<NaiveDate> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(day) = closed_day(Utc::now()) else {
            continue;
        };
        if last_checked == Some(day) {
            continue;
        }
        match anchor_pass(&log, day).await {
            Ok(pass) => {
                info!(date = %day, outcome = ?pass, "Anchor check finished");
                last_checked = Some(day);
            }
            Err(e) => error!(date = %day, error = %e, "Anchor check failed"),
        }
    }
    info!("Anchor job stopped");
}

fn closed_day(now: DateTime<Utc>) -> Option<NaiveDate> {
    previous_day(now.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ridepool_audit::{entry_hash, HmacSealer};
    use ridepool_booking::BookingLifecycle;
    use ridepool_core::audit::{Actor, AuditAnchor, AuditRecord, AuditStore, EntityRef};
    use ridepool_core::policy::FullRefundPolicy;
    use ridepool_store::{BroadcastNotifier, MemoryStore, MemoryTrips};
    use serde_json::json;

    fn log_over(store: Arc<MemoryStore>) -> IntegrityLog {
        let sealer = HmacSealer::new(b"worker-secret".to_vec(), "kv1").unwrap();
        IntegrityLog::new(store, Arc::new(sealer))
    }

    fn record() -> AuditRecord {
        AuditRecord {
            actor: Actor::admin("ops"),
            action: "trip.cancel_cascade".into(),
            entity: EntityRef::new("trip", "t-1"),
            delta: json!({"seats_released": 2}),
            reason: Some("weather".into()),
            correlation_id: None,
        }
    }

    #[test]
    fn test_closed_day_is_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 5, 0).unwrap();
        assert_eq!(closed_day(now), NaiveDate::from_ymd_opt(2024, 2, 29));
    }

    #[tokio::test]
    async fn test_anchor_pass_reports_forged_anchor_without_rewriting() {
        let store = Arc::new(MemoryStore::new());
        let log = log_over(store.clone());
        let day = log.append(record()).await.unwrap().day();
        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Clean);

        let forged = AuditAnchor {
            date: day,
            hmac: "ab".repeat(32),
            entries: 1,
            key_version: "kv1".into(),
            updated_at: Utc::now(),
        };
        store.replace_anchor(&forged).await.unwrap();

        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Disputed(1));
        assert_eq!(store.anchor(day).await.unwrap().unwrap().hmac, forged.hmac);
        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Disputed(1));
    }

    #[tokio::test]
    async fn test_anchor_pass_resigns_after_key_rotation() {
        let store = Arc::new(MemoryStore::new());
        let day = log_over(store.clone()).append(record()).await.unwrap().day();

        let rotated = IntegrityLog::new(
            store.clone(),
            Arc::new(HmacSealer::new(b"rotated-secret".to_vec(), "kv2").unwrap()),
        );
        assert_eq!(anchor_pass(&rotated, day).await.unwrap(), AnchorPass::Repaired);
        assert_eq!(store.anchor(day).await.unwrap().unwrap().key_version, "kv2");
        assert_eq!(anchor_pass(&rotated, day).await.unwrap(), AnchorPass::Clean);
    }

    #[tokio::test]
    async fn test_anchor_pass_rebuilds_missing_anchor() {
        let store = Arc::new(MemoryStore::new());
        let log = log_over(store.clone());
        let mut entry = log.append(record()).await.unwrap();

        // Backdate the only entry to a day that never got an anchor
        entry.at -= chrono::Duration::days(1);
        entry.hash = entry_hash(&entry.to_draft(), None).unwrap();
        let day = entry.day();
        store.overwrite_audit_entry(entry).unwrap();
        assert!(store.anchor(day).await.unwrap().is_none());

        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Repaired);
        assert_eq!(store.anchor(day).await.unwrap().unwrap().entries, 1);
        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Clean);
    }

    #[tokio::test]
    async fn test_anchor_pass_leaves_tampered_day() {
        let store = Arc::new(MemoryStore::new());
        let log = log_over(store.clone());
        let mut entry = log.append(record()).await.unwrap();
        let day = entry.day();
        let before = store.anchor(day).await.unwrap().unwrap();

        entry.reason = Some("edited".into());
        store.overwrite_audit_entry(entry).unwrap();

        assert_eq!(anchor_pass(&log, day).await.unwrap(), AnchorPass::Tampered(1));
        assert_eq!(store.anchor(day).await.unwrap().unwrap().hmac, before.hmac);
    }

    #[tokio::test]
    async fn test_expiry_job_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = Arc::new(BookingLifecycle::new(
            store.clone(),
            store,
            Arc::new(MemoryTrips::new()),
            Arc::new(FullRefundPolicy),
            Arc::new(BroadcastNotifier::new(8)),
        ));
        let sweep = Arc::new(ExpirySweep::new(lifecycle, chrono::Duration::hours(48), 10));
        let (tx, rx) = watch::channel(false);

        let job = tokio::spawn(run_expiry_job(sweep, Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), job).await.unwrap().unwrap();
    }
}
