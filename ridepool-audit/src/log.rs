use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ridepool_core::audit::{
    day_bounds, fold_day, previous_anchor_hmac, AuditAnchor, AuditDraft, AuditEntry, AuditError, AuditRecord,
    AuditSink, AuditStore, BreakKind, ChainSealer, IntegrityBreak, VerificationReport,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::anchor::anchors_match;

/// Append-only, hash-chained log of privileged actions with daily anchors.
pub struct IntegrityLog {
    store: Arc<dyn AuditStore>,
    sealer: Arc<dyn ChainSealer>,
}

impl IntegrityLog {
    pub fn new(store: Arc<dyn AuditStore>, sealer: Arc<dyn ChainSealer>) -> Self {
        Self { store, sealer }
    }

    /// Validate, seal onto the chain head, and fold into today's anchor.
    /// The entry is durable when this returns.
    pub async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        record.validate()?;
        let draft = AuditDraft::new(record, Utc::now());
        let (entry, anchor) = self.store.append_sealed(draft, self.sealer.as_ref()).await?;

        debug!(
            seq = entry.seq,
            action = %entry.action,
            actor = %entry.actor.kind,
            anchor_entries = anchor.entries,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Recompute every hash and anchor in `[from, to]`. Findings are returned
    /// in the report; only storage failures are errors.
    pub async fn verify(&self, from: NaiveDate, to: NaiveDate) -> Result<VerificationReport, AuditError> {
        if from > to {
            return Err(AuditError::Schema(format!("range start {from} is after end {to}")));
        }
        let (start, _) = day_bounds(from);
        let (_, end) = day_bounds(to);
        let entries = self.store.entries_between(start, end).await?;

        let mut report = VerificationReport::default();
        let mut expected_prev = match entries.first() {
            Some(first) => self.store.entry_before(first.seq).await?.map(|e| e.hash),
            None => None,
        };
        let mut seen_days = BTreeSet::new();
        let mut day: Option<(NaiveDate, String, u64)> = None;
        let mut broken = false;

        for (position, entry) in entries.iter().enumerate() {
            let recomputed = self.sealer.seal(&entry.to_draft(), entry.prev_hash.as_deref())?;
            report.entries_checked += 1;

            let detail = if recomputed != entry.hash {
                Some(format!("stored hash {} does not match recomputed {}", entry.hash, recomputed))
            } else if entry.prev_hash != expected_prev {
                Some(format!(
                    "prev_hash {:?} does not link to preceding entry {:?}",
                    entry.prev_hash, expected_prev
                ))
            } else {
                None
            };
            if let Some(detail) = detail {
                warn!(entry_id = %entry.id, seq = entry.seq, position, "Audit chain hash mismatch");
                report.breaks.push(IntegrityBreak {
                    kind: BreakKind::HashMismatch,
                    date: entry.day(),
                    entry_id: Some(entry.id),
                    position: Some(position),
                    detail,
                });
                broken = true;
                break;
            }

            // Day boundary: settle the finished day before starting the next
            let entry_day = entry.day();
            if day.as_ref().map(|(d, _, _)| *d) != Some(entry_day) {
                if let Some((finished, running, count)) = day.take() {
                    self.check_anchor(finished, &running, count, &mut report).await?;
                }
                let seed = previous_anchor_hmac(self.store.as_ref(), entry_day).await?;
                day = Some((entry_day, seed, 0));
                seen_days.insert(entry_day);
            }
            if let Some((_, running, count)) = day.as_mut() {
                *running = self.sealer.fold(running, &recomputed)?;
                *count += 1;
            }
            expected_prev = Some(entry.hash.clone());
        }

        if !broken {
            if let Some((finished, running, count)) = day.take() {
                self.check_anchor(finished, &running, count, &mut report).await?;
            }
            // Anchors claiming entries on days where none remain
            for date in from.iter_days().take_while(|d| *d <= to) {
                if seen_days.contains(&date) {
                    continue;
                }
                if let Some(anchor) = self.store.anchor(date).await? {
                    if anchor.entries > 0 {
                        report.breaks.push(IntegrityBreak {
                            kind: BreakKind::AnchorMismatch,
                            date,
                            entry_id: None,
                            position: None,
                            detail: format!("anchor covers {} entries but none were found", anchor.entries),
                        });
                    }
                }
            }
        }

        report.verified = report.breaks.is_empty();
        info!(
            %from,
            %to,
            verified = report.verified,
            entries = report.entries_checked,
            breaks = report.breaks.len(),
            "Audit verification finished"
        );
        Ok(report)
    }

    async fn check_anchor(
        &self,
        date: NaiveDate,
        running: &str,
        count: u64,
        report: &mut VerificationReport,
    ) -> Result<(), AuditError> {
        let detail = match self.store.anchor(date).await? {
            None => {
                report.breaks.push(IntegrityBreak {
                    kind: BreakKind::MissingAnchor,
                    date,
                    entry_id: None,
                    position: None,
                    detail: format!("no anchor stored for a day with {count} entries"),
                });
                return Ok(());
            }
            Some(anchor) if anchor.key_version != self.sealer.key_version() => format!(
                "anchor signed with key {} but current key is {}",
                anchor.key_version,
                self.sealer.key_version()
            ),
            Some(anchor) if !anchors_match(&anchor.hmac, running) => {
                "stored anchor does not match recomputed anchor".to_string()
            }
            Some(anchor) if anchor.entries != count => {
                format!("anchor counts {} entries, found {}", anchor.entries, count)
            }
            Some(_) => return Ok(()),
        };
        warn!(%date, %detail, "Audit anchor mismatch");
        report.breaks.push(IntegrityBreak {
            kind: BreakKind::AnchorMismatch,
            date,
            entry_id: None,
            position: None,
            detail,
        });
        Ok(())
    }

    /// Rebuild one day's anchor from stored entries, seeded by the previous
    /// day's anchor. Returns `None` for a day without entries.
    pub async fn regenerate_anchor(&self, date: NaiveDate) -> Result<Option<AuditAnchor>, AuditError> {
        let (start, end) = day_bounds(date);
        let entries = self.store.entries_between(start, end).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let seed = previous_anchor_hmac(self.store.as_ref(), date).await?;
        let hmac = fold_day(self.sealer.as_ref(), &seed, entries.iter().map(|e| e.hash.as_str()))?;
        let anchor = AuditAnchor {
            date,
            hmac,
            entries: entries.len() as u64,
            key_version: self.sealer.key_version().to_string(),
            updated_at: Utc::now(),
        };
        self.store.replace_anchor(&anchor).await?;

        info!(%date, entries = anchor.entries, "Audit anchor regenerated");
        Ok(Some(anchor))
    }

    pub async fn chain_head(&self) -> Result<Option<String>, AuditError> {
        self.store.chain_head().await
    }

    pub async fn anchor(&self, date: NaiveDate) -> Result<Option<AuditAnchor>, AuditError> {
        self.store.anchor(date).await
    }

    /// Key version new anchors are signed with.
    pub fn key_version(&self) -> &str {
        self.sealer.key_version()
    }
}

#[async_trait]
impl AuditSink for IntegrityLog {
    async fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        self.append(record).await
    }
}
