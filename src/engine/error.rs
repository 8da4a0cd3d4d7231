use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{PaymentStatus, ReservationStatus};

/// Taxonomy bucket of a [`BookingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    AdvanceWindow,
    FairnessViolation,
    Authorization,
    Transient,
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid rental type: {0:?}")]
    InvalidRentalType(String),
    #[error("invalid start date: {0:?}")]
    InvalidDate(String),
    #[error("{0}")]
    LimitExceeded(&'static str),

    #[error("unit not found: {0}")]
    UnitNotFound(Ulid),
    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),
    #[error("payment not found: {0}")]
    PaymentNotFound(Ulid),

    #[error("unit already exists: {0}")]
    UnitAlreadyExists(Ulid),
    #[error("unit is under maintenance")]
    UnderMaintenance,
    #[error("unit is already booked or rented today")]
    AlreadyTakenToday,
    #[error("requested dates conflict with reservation {0}")]
    DateRangeConflict(Ulid),
    #[error("you already hold a reservation on this unit")]
    DuplicateBooking,
    #[error("cannot cancel a reservation in status {}", .0.as_str())]
    NotCancellable(ReservationStatus),
    #[error("rental has already started")]
    AlreadyStarted,
    #[error("reservation is {}, expected pending_payment", .0.as_str())]
    NotAwaitingPayment(ReservationStatus),
    #[error("payment was already {0:?}")]
    PaymentAlreadyVerified(PaymentStatus),
    #[error("payment deadline has passed")]
    PaymentDeadlinePassed,

    #[error("bookings open at most {max_days} days ahead")]
    AdvanceLimitExceeded { max_days: u32 },
    #[error("cannot book a past date: {0}")]
    DateInPast(NaiveDate),

    #[error(
        "consecutive stay of {max_stay_days} days reached; take a cool-down of at least {cool_down_days} days or pick another unit"
    )]
    CoolDownRequired { max_stay_days: u32, cool_down_days: u32 },

    #[error("queue priority for this unit is held by another user")]
    QueuePriorityHeld,
    #[error("your queue priority has expired")]
    QueueGrantExpired,
    #[error("insufficient permissions")]
    Forbidden,

    #[error("store error: {0}")]
    Transient(String),
}

impl BookingError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::MissingField(_) => "missing_field",
            BookingError::InvalidRentalType(_) => "invalid_rental_type",
            BookingError::InvalidDate(_) => "invalid_date",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::UnitNotFound(_) => "unit_not_found",
            BookingError::ReservationNotFound(_) => "reservation_not_found",
            BookingError::PaymentNotFound(_) => "payment_not_found",
            BookingError::UnitAlreadyExists(_) => "unit_already_exists",
            BookingError::UnderMaintenance => "under_maintenance",
            BookingError::AlreadyTakenToday => "already_taken_today",
            BookingError::DateRangeConflict(_) => "date_range_conflict",
            BookingError::DuplicateBooking => "duplicate_booking",
            BookingError::NotCancellable(_) => "not_cancellable",
            BookingError::AlreadyStarted => "already_started",
            BookingError::NotAwaitingPayment(_) => "not_awaiting_payment",
            BookingError::PaymentAlreadyVerified(_) => "payment_already_verified",
            BookingError::PaymentDeadlinePassed => "payment_deadline_passed",
            BookingError::AdvanceLimitExceeded { .. } => "advance_limit_exceeded",
            BookingError::DateInPast(_) => "date_in_past",
            BookingError::CoolDownRequired { .. } => "cool_down_required",
            BookingError::QueuePriorityHeld => "queue_priority_held",
            BookingError::QueueGrantExpired => "queue_grant_expired",
            BookingError::Forbidden => "forbidden",
            BookingError::Transient(_) => "transient",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::MissingField(_)
            | BookingError::InvalidRentalType(_)
            | BookingError::InvalidDate(_)
            | BookingError::LimitExceeded(_) => ErrorKind::Validation,
            BookingError::UnitNotFound(_)
            | BookingError::ReservationNotFound(_)
            | BookingError::PaymentNotFound(_) => ErrorKind::NotFound,
            BookingError::UnitAlreadyExists(_)
            | BookingError::UnderMaintenance
            | BookingError::AlreadyTakenToday
            | BookingError::DateRangeConflict(_)
            | BookingError::DuplicateBooking
            | BookingError::NotCancellable(_)
            | BookingError::AlreadyStarted
            | BookingError::NotAwaitingPayment(_)
            | BookingError::PaymentAlreadyVerified(_)
            | BookingError::PaymentDeadlinePassed => ErrorKind::StateConflict,
            BookingError::AdvanceLimitExceeded { .. } | BookingError::DateInPast(_) => {
                ErrorKind::AdvanceWindow
            }
            BookingError::CoolDownRequired { .. } => ErrorKind::FairnessViolation,
            BookingError::QueuePriorityHeld
            | BookingError::QueueGrantExpired
            | BookingError::Forbidden => ErrorKind::Authorization,
            BookingError::Transient(_) => ErrorKind::Transient,
        }
    }

    /// HTTP-style status for frontends.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation
            | ErrorKind::StateConflict
            | ErrorKind::AdvanceWindow
            | ErrorKind::FairnessViolation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Authorization => 403,
            ErrorKind::Transient => 503,
        }
    }

    /// Safe to resend the whole request unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
