use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::lifecycle::BookingLifecycle;

pub const DEFAULT_PENDING_TTL_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub skipped: usize,
}

/// Expires pending requests older than the TTL. Safe to run alongside
/// driver and passenger actions and to re-run over the same window.
pub struct ExpirySweep {
    lifecycle: Arc<BookingLifecycle>,
    ttl: Duration,
    batch_size: usize,
}

impl ExpirySweep {
    pub fn new(lifecycle: Arc<BookingLifecycle>, ttl: Duration, batch_size: usize) -> Self {
        Self {
            lifecycle,
            ttl,
            batch_size: batch_size.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let cutoff = now - self.ttl;
        let mut report = SweepReport::default();

        loop {
            let batch = self.lifecycle.pending_older_than(cutoff, self.batch_size).await?;
            let fetched = batch.len();
            let mut progressed = 0;

            for booking in batch {
                report.examined += 1;
                match self.lifecycle.expire(booking.id).await {
                    Ok(_) => {
                        report.expired += 1;
                        progressed += 1;
                    }
                    // Someone else moved it first.
                    Err(LifecycleError::InvalidTransition { from, .. }) => {
                        debug!(booking_id = %booking.id, %from, "Skipping booking no longer pending");
                        report.skipped += 1;
                    }
                    Err(LifecycleError::NotFound(_)) => report.skipped += 1,
                    Err(e) => {
                        warn!(booking_id = %booking.id, error = %e, "Expiry sweep aborted");
                        return Err(e);
                    }
                }
            }

            if fetched < self.batch_size || progressed == 0 {
                break;
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }
}
