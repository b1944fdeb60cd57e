use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::payment::{PaymentMethod, PaymentStatus};
use crate::{BookingId, ErrorKind, TripId, UnknownStatus, UserId};

pub const MAX_NOTE_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Declined,
    DeclinedAuto,
    CanceledByPassenger,
    CanceledByPlatform,
    Expired,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::Accepted,
        BookingStatus::Declined,
        BookingStatus::DeclinedAuto,
        BookingStatus::CanceledByPassenger,
        BookingStatus::CanceledByPlatform,
        BookingStatus::Expired,
    ];

    /// Statuses that hold a claim on the trip.
    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Accepted];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Declined => "declined",
            BookingStatus::DeclinedAuto => "declined_auto",
            BookingStatus::CanceledByPassenger => "canceled_by_passenger",
            BookingStatus::CanceledByPlatform => "canceled_by_platform",
            BookingStatus::Expired => "expired",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// The transition table. Everything not listed here is illegal.
    pub fn allowed_next(&self) -> &'static [BookingStatus] {
        match self {
            BookingStatus::Pending => &[
                BookingStatus::Accepted,
                BookingStatus::Declined,
                BookingStatus::DeclinedAuto,
                BookingStatus::Expired,
                BookingStatus::CanceledByPassenger,
            ],
            BookingStatus::Accepted => &[
                BookingStatus::CanceledByPassenger,
                BookingStatus::CanceledByPlatform,
            ],
            _ => &[],
        }
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus { kind: "booking", value: s.to_string() })
    }
}

/// One passenger's claim on seats of one trip. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: BookingId,
    pub trip_id: TripId,
    pub passenger_id: UserId,
    pub status: BookingStatus,
    pub seats: u32,
    pub note: Option<String>,

    pub payment_method: Option<PaymentMethod>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_reference: Option<String>,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    /// Internal refund flag, never part of the external view.
    #[serde(skip_serializing, default)]
    pub refund_needed: bool,

    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<UserId>,
    pub declined_at: Option<DateTime<Utc>>,
    pub declined_by: Option<UserId>,
    pub decline_reason: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row version this copy was read at. Bumped by the store on every write.
    #[serde(skip_serializing, default)]
    pub version: i64,
}

impl BookingRequest {
    /// Validate and build a fresh `pending` request.
    pub fn new(
        trip_id: TripId,
        passenger_id: UserId,
        seats: u32,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, BookingError> {
        if seats == 0 {
            return Err(BookingError::InvalidSeats(seats));
        }
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        if let Some(n) = &note {
            let len = n.chars().count();
            if len > MAX_NOTE_CHARS {
                return Err(BookingError::NoteTooLong { len });
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            trip_id,
            passenger_id,
            status: BookingStatus::Pending,
            seats,
            note,
            payment_method: None,
            payment_status: None,
            payment_reference: None,
            is_paid: false,
            paid_at: None,
            refund_needed: false,
            accepted_at: None,
            accepted_by: None,
            declined_at: None,
            declined_by: None,
            decline_reason: None,
            canceled_at: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    pub fn belongs_to(&self, passenger_id: UserId) -> bool {
        self.passenger_id == passenger_id
    }

    /// Record the payment attempt. Only while accepted.
    pub fn initialize_payment(
        &self,
        method: PaymentMethod,
        reference: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Self, BookingError> {
        self.require_accepted()?;
        let mut next = self.clone();
        next.payment_method = Some(method);
        next.payment_status = Some(PaymentStatus::Pending);
        next.payment_reference = reference;
        next.updated_at = at;
        Ok(next)
    }

    pub fn set_payment_method(&self, method: PaymentMethod, at: DateTime<Utc>) -> Result<Self, BookingError> {
        self.require_accepted()?;
        let mut next = self.clone();
        next.payment_method = Some(method);
        next.updated_at = at;
        Ok(next)
    }

    /// Mark paid. Replaying on a paid booking returns it unchanged.
    pub fn mark_payment_completed(&self, reference: Option<String>, at: DateTime<Utc>) -> Result<Self, BookingError> {
        self.require_accepted()?;
        if self.is_paid {
            return Ok(self.clone());
        }
        let mut next = self.clone();
        next.is_paid = true;
        next.paid_at = Some(at);
        next.payment_status = Some(PaymentStatus::Completed);
        if reference.is_some() {
            next.payment_reference = reference;
        }
        next.updated_at = at;
        Ok(next)
    }

    fn require_accepted(&self) -> Result<(), BookingError> {
        if self.status != BookingStatus::Accepted {
            return Err(BookingError::PaymentRequiresAccepted { current: self.status });
        }
        Ok(())
    }

    pub fn view(&self) -> BookingView {
        BookingView {
            id: self.id,
            trip_id: self.trip_id,
            passenger_id: self.passenger_id,
            status: self.status,
            seats: self.seats,
            note: self.note.clone(),
            payment_method: self.payment_method,
            payment_status: self.payment_status,
            is_paid: self.is_paid,
            paid_at: self.paid_at,
            accepted_at: self.accepted_at,
            declined_at: self.declined_at,
            decline_reason: self.decline_reason.clone(),
            canceled_at: self.canceled_at,
            cancellation_reason: self.cancellation_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a booking looks like to passengers and drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingView {
    pub id: BookingId,
    pub trip_id: TripId,
    pub passenger_id: UserId,
    pub status: BookingStatus,
    pub seats: u32,
    pub note: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_status: Option<PaymentStatus>,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingCommand {
    Accept { driver_id: UserId },
    Decline { driver_id: UserId, reason: Option<String> },
    CancelByPassenger { reason: Option<String>, refund_eligible: bool },
    Expire,
    AutoDecline,
    CancelByPlatform,
}

impl BookingCommand {
    pub fn target(&self) -> BookingStatus {
        match self {
            BookingCommand::Accept { .. } => BookingStatus::Accepted,
            BookingCommand::Decline { .. } => BookingStatus::Declined,
            BookingCommand::CancelByPassenger { .. } => BookingStatus::CanceledByPassenger,
            BookingCommand::Expire => BookingStatus::Expired,
            BookingCommand::AutoDecline => BookingStatus::DeclinedAuto,
            BookingCommand::CancelByPlatform => BookingStatus::CanceledByPlatform,
        }
    }

    /// Decline and cancel handlers succeed again once their target is reached.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, BookingCommand::Accept { .. } | BookingCommand::Expire)
    }
}

/// Work the caller must carry out in the same unit as the status write,
/// except `Notify`, which runs after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    AllocateSeats { trip_id: TripId, seats: u32 },
    ReleaseSeats { trip_id: TripId, seats: u32 },
    FlagRefund,
    Notify { status: BookingStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: BookingStatus,
    pub booking: BookingRequest,
    pub effects: Vec<SideEffect>,
    /// The booking was already in the target state; nothing to write.
    pub replayed: bool,
}

impl Transition {
    pub fn seats_released(&self) -> u32 {
        self.effects
            .iter()
            .map(|effect| match effect {
                SideEffect::ReleaseSeats { seats, .. } => *seats,
                _ => 0,
            })
            .sum()
    }
}

/// Apply `command` to `current` without touching any store.
pub fn transition(
    current: &BookingRequest,
    command: BookingCommand,
    at: DateTime<Utc>,
) -> Result<Transition, BookingError> {
    let from = current.status;
    let to = command.target();

    if from == to && command.is_idempotent() {
        return Ok(Transition {
            from,
            booking: current.clone(),
            effects: Vec::new(),
            replayed: true,
        });
    }
    if !from.can_transition_to(to) {
        return Err(BookingError::InvalidTransition { from, to });
    }

    let mut next = current.clone();
    next.status = to;
    next.updated_at = at;
    let mut effects = Vec::new();

    match command {
        BookingCommand::Accept { driver_id } => {
            next.accepted_at = Some(at);
            next.accepted_by = Some(driver_id);
            effects.push(SideEffect::AllocateSeats { trip_id: current.trip_id, seats: current.seats });
        }
        BookingCommand::Decline { driver_id, reason } => {
            next.declined_at = Some(at);
            next.declined_by = Some(driver_id);
            next.decline_reason = reason;
        }
        BookingCommand::CancelByPassenger { reason, refund_eligible } => {
            next.canceled_at = Some(at);
            next.cancellation_reason = reason;
            next.refund_needed = current.is_paid && refund_eligible;
            if from == BookingStatus::Accepted {
                effects.push(SideEffect::ReleaseSeats { trip_id: current.trip_id, seats: current.seats });
            }
        }
        BookingCommand::Expire => {}
        BookingCommand::AutoDecline => {
            next.declined_at = Some(at);
        }
        BookingCommand::CancelByPlatform => {
            next.canceled_at = Some(at);
            next.refund_needed = current.is_paid;
            effects.push(SideEffect::ReleaseSeats { trip_id: current.trip_id, seats: current.seats });
        }
    }

    if next.refund_needed {
        effects.push(SideEffect::FlagRefund);
    }
    effects.push(SideEffect::Notify { status: to });

    Ok(Transition {
        from,
        booking: next,
        effects,
        replayed: false,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },

    #[error("Payment changes require an accepted booking, current status is {current}")]
    PaymentRequiresAccepted { current: BookingStatus },

    #[error("Seats must be at least 1, got {0}")]
    InvalidSeats(u32),

    #[error("Note is {len} characters, maximum is {max}", max = MAX_NOTE_CHARS)]
    NoteTooLong { len: usize },
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::InvalidTransition { .. } | BookingError::PaymentRequiresAccepted { .. } => {
                ErrorKind::GuardViolation
            }
            BookingError::InvalidSeats(_) | BookingError::NoteTooLong { .. } => ErrorKind::SchemaViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pending(seats: u32) -> BookingRequest {
        BookingRequest::new(Uuid::new_v4(), Uuid::new_v4(), seats, None, Utc::now()).unwrap()
    }

    fn accepted(seats: u32, paid: bool) -> BookingRequest {
        let booking = pending(seats);
        let mut booking = transition(&booking, BookingCommand::Accept { driver_id: Uuid::new_v4() }, Utc::now())
            .unwrap()
            .booking;
        booking.is_paid = paid;
        booking
    }

    #[test]
    fn test_new_validates_input() {
        assert_eq!(
            BookingRequest::new(Uuid::new_v4(), Uuid::new_v4(), 0, None, Utc::now()).unwrap_err(),
            BookingError::InvalidSeats(0)
        );
        let long = "x".repeat(MAX_NOTE_CHARS + 1);
        assert!(matches!(
            BookingRequest::new(Uuid::new_v4(), Uuid::new_v4(), 1, Some(long), Utc::now()),
            Err(BookingError::NoteTooLong { len: 301 })
        ));
        let blank = BookingRequest::new(Uuid::new_v4(), Uuid::new_v4(), 1, Some("  ".into()), Utc::now()).unwrap();
        assert_eq!(blank.note, None);
        assert_eq!(blank.status, BookingStatus::Pending);
    }

    #[test]
    fn test_accept_allocates_seats() {
        let booking = pending(2);
        let driver = Uuid::new_v4();
        let t = transition(&booking, BookingCommand::Accept { driver_id: driver }, Utc::now()).unwrap();

        assert_eq!(t.booking.status, BookingStatus::Accepted);
        assert_eq!(t.booking.accepted_by, Some(driver));
        assert_eq!(t.effects[0], SideEffect::AllocateSeats { trip_id: booking.trip_id, seats: 2 });
        assert!(!t.replayed);
    }

    #[test]
    fn test_cancel_from_pending_releases_nothing() {
        let t = transition(
            &pending(2),
            BookingCommand::CancelByPassenger { reason: None, refund_eligible: true },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.seats_released(), 0);
        assert!(!t.booking.refund_needed);
    }

    #[test]
    fn test_cancel_from_accepted_releases_and_flags_refund() {
        let booking = accepted(3, true);
        let t = transition(
            &booking,
            BookingCommand::CancelByPassenger { reason: Some("plans changed".into()), refund_eligible: true },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.seats_released(), 3);
        assert!(t.booking.refund_needed);
        assert!(t.effects.contains(&SideEffect::FlagRefund));

        let unpaid = transition(
            &accepted(1, false),
            BookingCommand::CancelByPassenger { reason: None, refund_eligible: true },
            Utc::now(),
        )
        .unwrap();
        assert!(!unpaid.booking.refund_needed);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let booking = accepted(2, false);
        let command = BookingCommand::CancelByPassenger { reason: None, refund_eligible: false };
        let first = transition(&booking, command.clone(), Utc::now()).unwrap();
        let second = transition(&first.booking, command, Utc::now()).unwrap();

        assert!(second.replayed);
        assert!(second.effects.is_empty());
        assert_eq!(second.booking, first.booking);
    }

    #[test]
    fn test_expire_and_accept_are_not_idempotent() {
        let expired = transition(&pending(1), BookingCommand::Expire, Utc::now()).unwrap().booking;
        assert_eq!(
            transition(&expired, BookingCommand::Expire, Utc::now()).unwrap_err(),
            BookingError::InvalidTransition { from: BookingStatus::Expired, to: BookingStatus::Expired }
        );

        let booking = accepted(1, false);
        let err = transition(&booking, BookingCommand::Accept { driver_id: Uuid::new_v4() }, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GuardViolation);
    }

    #[test]
    fn test_platform_cancel_always_refunds_paid() {
        let t = transition(&accepted(2, true), BookingCommand::CancelByPlatform, Utc::now()).unwrap();
        assert_eq!(t.booking.status, BookingStatus::CanceledByPlatform);
        assert!(t.booking.refund_needed);
        assert_eq!(t.seats_released(), 2);

        let err = transition(&pending(1), BookingCommand::CancelByPlatform, Utc::now()).unwrap_err();
        assert!(matches!(err, BookingError::InvalidTransition { from: BookingStatus::Pending, .. }));
    }

    #[test]
    fn test_payment_requires_accepted() {
        let now = Utc::now();
        assert_eq!(
            pending(1).initialize_payment(PaymentMethod::Card, None, now).unwrap_err(),
            BookingError::PaymentRequiresAccepted { current: BookingStatus::Pending }
        );

        let booking = accepted(1, false)
            .initialize_payment(PaymentMethod::Card, Some("pi_1".into()), now)
            .unwrap();
        assert_eq!(booking.payment_status, Some(PaymentStatus::Pending));

        let paid = booking.mark_payment_completed(None, now).unwrap();
        assert!(paid.is_paid);
        assert_eq!(paid.payment_reference.as_deref(), Some("pi_1"));
        assert_eq!(paid.status, BookingStatus::Accepted);
        assert_eq!(paid.mark_payment_completed(Some("other".into()), Utc::now()).unwrap(), paid);
    }

    #[test]
    fn test_refund_flag_hidden_from_json() {
        let mut booking = accepted(1, true);
        booking.refund_needed = true;
        let json = serde_json::to_value(&booking).unwrap();
        assert!(json.get("refund_needed").is_none());
        let view = serde_json::to_value(booking.view()).unwrap();
        assert!(view.get("refund_needed").is_none());
    }

    fn any_status() -> impl Strategy<Value = BookingStatus> {
        prop::sample::select(BookingStatus::ALL.to_vec())
    }

    fn any_command() -> impl Strategy<Value = BookingCommand> {
        prop_oneof![
            Just(BookingCommand::Accept { driver_id: Uuid::nil() }),
            Just(BookingCommand::Decline { driver_id: Uuid::nil(), reason: None }),
            any::<bool>().prop_map(|eligible| BookingCommand::CancelByPassenger { reason: None, refund_eligible: eligible }),
            Just(BookingCommand::Expire),
            Just(BookingCommand::AutoDecline),
            Just(BookingCommand::CancelByPlatform),
        ]
    }

    proptest! {
        #[test]
        fn test_transition_follows_table(status in any_status(), command in any_command(), paid in any::<bool>()) {
            let mut booking = pending(1);
            booking.status = status;
            booking.is_paid = paid;
            let target = command.target();
            let idempotent = command.is_idempotent();

            match transition(&booking, command, Utc::now()) {
                Ok(t) if t.replayed => {
                    prop_assert_eq!(status, target);
                    prop_assert!(idempotent);
                }
                Ok(t) => {
                    prop_assert!(status.can_transition_to(target));
                    prop_assert_eq!(t.booking.status, target);
                    prop_assert!(!status.is_terminal());
                    if t.booking.refund_needed {
                        prop_assert!(paid);
                    }
                }
                Err(BookingError::InvalidTransition { from, to }) => {
                    prop_assert_eq!(from, status);
                    prop_assert_eq!(to, target);
                    prop_assert!(!status.can_transition_to(target));
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
