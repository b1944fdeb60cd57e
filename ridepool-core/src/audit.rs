//! Types and ports for the hash-chained audit log.
//!
//! Hashing and keyed folding live behind [`ChainSealer`] so stores can run
//! the whole append (chain head, entry, anchor) inside their own transaction
//! without knowing the key.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{ErrorKind, UnknownStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Admin,
    Driver,
    Passenger,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Admin => "admin",
            ActorKind::Driver => "driver",
            ActorKind::Passenger => "passenger",
            ActorKind::System => "system",
        }
    }
}

impl FromStr for ActorKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [ActorKind::Admin, ActorKind::Driver, ActorKind::Passenger, ActorKind::System]
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownStatus { kind: "actor", value: s.to_string() })
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    #[serde(rename = "type")]
    pub kind: ActorKind,
    pub id: Option<String>,
}

impl Actor {
    pub fn admin(id: impl Into<String>) -> Self {
        Self { kind: ActorKind::Admin, id: Some(id.into()) }
    }

    pub fn system() -> Self {
        Self { kind: ActorKind::System, id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self { kind: kind.into(), id: id.to_string() }
    }
}

/// A privileged action as reported by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub actor: Actor,
    pub action: String,
    pub entity: EntityRef,
    pub delta: Value,
    pub reason: Option<String>,
    pub correlation_id: Option<String>,
}

impl AuditRecord {
    /// Schema checks that must pass before anything is written.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.action.trim().is_empty() {
            return Err(AuditError::Schema("action is required".to_string()));
        }
        if self.entity.kind.trim().is_empty() || self.entity.id.trim().is_empty() {
            return Err(AuditError::Schema("entity type and id are required".to_string()));
        }
        let has_reason = self.reason.as_deref().is_some_and(|r| !r.trim().is_empty());
        if self.actor.kind == ActorKind::Admin && !has_reason {
            return Err(AuditError::Schema("reason is required for admin actions".to_string()));
        }
        Ok(())
    }
}

/// A validated record with its id and timestamp fixed, ready to be sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub id: Uuid,
    /// Microsecond precision so the stored value hashes the same after a round trip.
    pub at: DateTime<Utc>,
    pub record: AuditRecord,
}

impl AuditDraft {
    pub fn new(record: AuditRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: now.trunc_subsecs(6),
            record,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.at.date_naive()
    }
}

/// Immutable, sealed log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Position in the global chain, assigned at append.
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub action: String,
    pub entity: EntityRef,
    pub delta: Value,
    pub reason: Option<String>,
    pub correlation_id: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    pub fn sealed(draft: AuditDraft, seq: i64, prev_hash: Option<String>, hash: String) -> Self {
        let AuditDraft { id, at, record } = draft;
        Self {
            id,
            seq,
            at,
            actor: record.actor,
            action: record.action,
            entity: record.entity,
            delta: record.delta,
            reason: record.reason,
            correlation_id: record.correlation_id,
            prev_hash,
            hash,
        }
    }

    /// Stored content as a draft, for recomputing the hash.
    pub fn to_draft(&self) -> AuditDraft {
        AuditDraft {
            id: self.id,
            at: self.at,
            record: AuditRecord {
                actor: self.actor.clone(),
                action: self.action.clone(),
                entity: self.entity.clone(),
                delta: self.delta.clone(),
                reason: self.reason.clone(),
                correlation_id: self.correlation_id.clone(),
            },
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.at.date_naive()
    }
}

/// Daily keyed digest over that day's entry hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditAnchor {
    pub date: NaiveDate,
    pub hmac: String,
    pub entries: u64,
    pub key_version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    HashMismatch,
    AnchorMismatch,
    MissingAnchor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityBreak {
    #[serde(rename = "type")]
    pub kind: BreakKind,
    pub date: NaiveDate,
    pub entry_id: Option<Uuid>,
    /// Zero-based index of the entry within the verified range.
    pub position: Option<usize>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub verified: bool,
    pub breaks: Vec<IntegrityBreak>,
    pub entries_checked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("Audit schema violation: {0}")]
    Schema(String),

    #[error("Audit store error: {0}")]
    Store(String),

    #[error("Audit key error: {0}")]
    Key(String),
}

impl AuditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Schema(_) => ErrorKind::SchemaViolation,
            AuditError::Store(_) | AuditError::Key(_) => ErrorKind::Unavailable,
        }
    }
}

/// Content hashing and keyed anchor folding.
pub trait ChainSealer: Send + Sync {
    fn key_version(&self) -> &str;

    /// Hex digest of the draft's canonical content chained to `prev_hash`.
    fn seal(&self, draft: &AuditDraft, prev_hash: Option<&str>) -> Result<String, AuditError>;

    /// Next running anchor value after folding `hash` into `running`.
    fn fold(&self, running: &str, hash: &str) -> Result<String, AuditError>;
}

/// Fold a day's hashes in chain order, starting from `seed`.
pub fn fold_day<'a>(
    sealer: &dyn ChainSealer,
    seed: &str,
    hashes: impl IntoIterator<Item = &'a str>,
) -> Result<String, AuditError> {
    hashes
        .into_iter()
        .try_fold(seed.to_string(), |running, hash| sealer.fold(&running, hash))
}

/// `[date 00:00, next day 00:00)` in UTC.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
    (start, next.and_time(chrono::NaiveTime::MIN).and_utc())
}

pub fn previous_day(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(1))
}

/// Append-only storage for the chain. `append_sealed` reads and advances the
/// chain head, inserts the entry, and folds it into the day's anchor as one
/// atomic step.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_sealed(
        &self,
        draft: AuditDraft,
        sealer: &dyn ChainSealer,
    ) -> Result<(AuditEntry, AuditAnchor), AuditError>;

    /// Entries with `from <= at < to`, in chain order.
    async fn entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditError>;

    /// The entry immediately preceding `seq` in the chain.
    async fn entry_before(&self, seq: i64) -> Result<Option<AuditEntry>, AuditError>;

    async fn anchor(&self, date: NaiveDate) -> Result<Option<AuditAnchor>, AuditError>;

    /// Overwrite one day's anchor. Only the repair routine calls this.
    async fn replace_anchor(&self, anchor: &AuditAnchor) -> Result<(), AuditError>;

    async fn chain_head(&self) -> Result<Option<String>, AuditError>;
}

/// Where privileged actions get recorded.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError>;
}

/// The previous calendar day's stored anchor, or empty.
pub async fn previous_anchor_hmac(store: &dyn AuditStore, day: NaiveDate) -> Result<String, AuditError> {
    match previous_day(day) {
        Some(prev) => Ok(store.anchor(prev).await?.map(|a| a.hmac).unwrap_or_default()),
        None => Ok(String::new()),
    }
}
