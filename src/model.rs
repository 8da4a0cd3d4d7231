use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Whole currency units. Rates and totals never carry fractions.
pub type Amount = u64;

pub type Timestamp = DateTime<Utc>;

/// Inclusive range of local calendar days `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Inclusive on both ends: ranges touching on the same day overlap.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whole days from start to end. A single-day range has length 0.
    pub fn length_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

pub fn add_days(day: NaiveDate, n: u64) -> NaiveDate {
    day.checked_add_days(Days::new(n)).unwrap_or(NaiveDate::MAX)
}

pub fn sub_days(day: NaiveDate, n: u64) -> NaiveDate {
    day.checked_sub_days(Days::new(n)).unwrap_or(NaiveDate::MIN)
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub daily: Amount,
    #[serde(default)]
    pub weekly: Option<Amount>,
    #[serde(default)]
    pub monthly: Option<Amount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Reserved,
    Booked,
    Rented,
    Maintenance,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Reserved => "reserved",
            UnitStatus::Booked => "booked",
            UnitStatus::Rented => "rented",
            UnitStatus::Maintenance => "maintenance",
        }
    }
}

/// A rentable stall ("lock") within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalUnit {
    pub id: Ulid,
    pub zone_id: Ulid,
    pub lock_number: String,
    pub rates: Rates,
    pub is_active: bool,
    pub status: UnitStatus,
    /// Holder of the queue-promotion grant while `status == Reserved`.
    pub reserved_to: Option<Ulid>,
    pub reservation_expires_at: Option<Timestamp>,
}

impl RentalUnit {
    pub fn new(id: Ulid, zone_id: Ulid, lock_number: impl Into<String>, rates: Rates) -> Self {
        Self {
            id,
            zone_id,
            lock_number: lock_number.into(),
            rates,
            is_active: true,
            status: UnitStatus::Available,
            reserved_to: None,
            reservation_expires_at: None,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalType {
    Daily,
    Weekly,
    Monthly,
}

impl RentalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RentalType::Daily => "daily",
            RentalType::Weekly => "weekly",
            RentalType::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for RentalType {
    type Err = crate::engine::BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(RentalType::Daily),
            "weekly" => Ok(RentalType::Weekly),
            "monthly" => Ok(RentalType::Monthly),
            other => Err(crate::engine::BookingError::InvalidRentalType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    PendingPayment,
    PendingVerification,
    Active,
    Cancelled,
}

impl ReservationStatus {
    /// Statuses that hold the unit for their date range.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            ReservationStatus::PendingPayment
                | ReservationStatus::PendingVerification
                | ReservationStatus::Active
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::PendingPayment => "pending_payment",
            ReservationStatus::PendingVerification => "pending_verification",
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub unit_id: Ulid,
    pub range: DateRange,
    pub rental_type: RentalType,
    pub total_amount: Amount,
    pub status: ReservationStatus,
    pub payment_deadline: Timestamp,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub unit_id: Ulid,
    pub user_id: Ulid,
    pub joined_at: Timestamp,
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

/// Admin decision on a submitted payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// Fields read off a transfer slip. Advisory only: nothing in the engine
/// decides on these values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrHint {
    #[serde(default)]
    pub amount: Option<f64>,
    pub confidence: f64,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

impl OcrHint {
    /// `None` when the slip had no readable amount.
    pub fn amount_matches(&self, expected: Amount) -> Option<bool> {
        self.amount.map(|a| (a - expected as f64).abs() < 0.01)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub user_id: Ulid,
    pub amount: Amount,
    pub slip_ref: String,
    pub ocr: Option<OcrHint>,
    pub status: PaymentStatus,
    pub verified_by: Option<Ulid>,
    pub verified_at: Option<Timestamp>,
    pub rejection_reason: Option<String>,
    pub submitted_at: Timestamp,
}

// ── Audit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UnitRegistered,
    MaintenanceChanged,
    QueuePromoted,
    BookingCreated,
    PaymentSubmitted,
    PaymentApproved,
    PaymentRejected,
    BookingCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub action: AuditAction,
    pub actor_id: Ulid,
    pub target_id: Ulid,
    /// JSON snapshot of the decision inputs/outputs. Kept as text: bincode
    /// cannot decode `serde_json::Value`.
    pub details: String,
    pub recorded_at: Timestamp,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        actor_id: Ulid,
        target_id: Ulid,
        details: serde_json::Value,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            id: Ulid::new(),
            action,
            actor_id,
            target_id,
            details: details.to_string(),
            recorded_at,
        }
    }

    pub fn details_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.details).unwrap_or(serde_json::Value::Null)
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Document mutations, flat. Every event belongs to exactly one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UnitRegistered {
        unit: RentalUnit,
    },
    UnitStatusChanged {
        unit_id: Ulid,
        status: UnitStatus,
        reserved_to: Option<Ulid>,
        reservation_expires_at: Option<Timestamp>,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: Ulid,
        unit_id: Ulid,
        status: ReservationStatus,
    },
    QueueJoined {
        entry: QueueEntry,
    },
    QueueLeft {
        unit_id: Ulid,
        user_id: Ulid,
    },
    PaymentSubmitted {
        unit_id: Ulid,
        payment: Payment,
    },
    PaymentVerified {
        id: Ulid,
        unit_id: Ulid,
        status: PaymentStatus,
        verified_by: Ulid,
        verified_at: Timestamp,
        rejection_reason: Option<String>,
    },
    AuditRecorded {
        unit_id: Ulid,
        entry: AuditEntry,
    },
}

impl Event {
    pub fn unit_id(&self) -> Ulid {
        match self {
            Event::UnitRegistered { unit } => unit.id,
            Event::ReservationCreated { reservation } => reservation.unit_id,
            Event::QueueJoined { entry } => entry.unit_id,
            Event::UnitStatusChanged { unit_id, .. }
            | Event::ReservationStatusChanged { unit_id, .. }
            | Event::QueueLeft { unit_id, .. }
            | Event::PaymentSubmitted { unit_id, .. }
            | Event::PaymentVerified { unit_id, .. }
            | Event::AuditRecorded { unit_id, .. } => *unit_id,
        }
    }
}

/// One transaction: applied entirely on replay or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

// ── Admission outcome ────────────────────────────────────────────

/// Successful result of `create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Confirmed { reservation: Reservation },
    /// Lost the same-day race; the requester now waits in the unit's queue.
    Queued { unit_id: Ulid, position: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn ranges_touching_on_a_day_overlap() {
        let a = DateRange::new(d(2026, 1, 20), d(2026, 1, 26));
        let b = DateRange::new(d(2026, 1, 26), d(2026, 1, 27));
        let c = DateRange::new(d(2026, 1, 27), d(2026, 1, 27));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn single_day_has_zero_length() {
        assert_eq!(DateRange::single(d(2026, 3, 1)).length_days(), 0);
        assert_eq!(DateRange::new(d(2026, 1, 20), d(2026, 2, 18)).length_days(), 29);
    }

    #[test]
    fn blocking_statuses() {
        assert!(ReservationStatus::PendingPayment.is_blocking());
        assert!(ReservationStatus::PendingVerification.is_blocking());
        assert!(ReservationStatus::Active.is_blocking());
        assert!(!ReservationStatus::Cancelled.is_blocking());
    }

    #[test]
    fn ocr_amount_match_is_advisory() {
        let hint = OcrHint { amount: Some(600.0), confidence: 81.5, ..Default::default() };
        assert_eq!(hint.amount_matches(600), Some(true));
        assert_eq!(hint.amount_matches(700), Some(false));
        assert_eq!(OcrHint::default().amount_matches(600), None);
    }

    #[test]
    fn commit_survives_bincode() {
        let unit = RentalUnit::new(Ulid::new(), Ulid::new(), "A-01", Rates { daily: 100, weekly: None, monthly: Some(2500) });
        let commit = Commit {
            events: vec![
                Event::UnitRegistered { unit: unit.clone() },
                Event::UnitStatusChanged {
                    unit_id: unit.id,
                    status: UnitStatus::Booked,
                    reserved_to: None,
                    reservation_expires_at: None,
                },
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let back: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, commit);
    }
}
