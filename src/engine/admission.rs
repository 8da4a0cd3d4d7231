//! Reservation admission: validate against a snapshot of the unit, then
//! commit under the unit's write lock with a compare-and-swap on its status.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::Identity;
use crate::clock::Clock;
use crate::limits::MAX_RESERVATIONS_PER_UNIT;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::pricing::{calculate_booking_details, BookingDetails};

use super::fairness::check_cool_down;
use super::overlap::{find_overlap, holds_blocking};
use super::{BookingError, Engine};

/// Raw request as received from a caller. Every field is optional so a
/// missing one is reported as such rather than as a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationRequest {
    #[serde(default)]
    pub unit_id: Option<Ulid>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub rental_type: Option<String>,
}

impl ReservationRequest {
    pub fn new(unit_id: Ulid, start_date: impl Into<String>, rental_type: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id),
            start_date: Some(start_date.into()),
            rental_type: Some(rental_type.into()),
        }
    }
}

/// A request that passed validation and awaits commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub user_id: Ulid,
    pub unit_id: Ulid,
    pub rental_type: RentalType,
    pub details: BookingDetails,
    /// Start day equals the local day at validation time.
    pub same_day: bool,
    pub payment_deadline: Timestamp,
}

/// Resolve a start date to a local calendar day. A bare `YYYY-MM-DD` is that
/// exact day in any time zone; a zoned timestamp is converted to local time
/// first; a naive timestamp is already local.
pub(crate) fn parse_start_day(raw: &str, clock: &dyn Clock) -> Result<NaiveDate, BookingError> {
    let raw = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(day);
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(clock.local_day(instant.to_utc()));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.date());
    }
    Err(BookingError::InvalidDate(raw.to_string()))
}

fn required<'a>(field: &'a Option<String>, name: &'static str) -> Result<&'a str, BookingError> {
    match field.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(BookingError::MissingField(name)),
    }
}

impl Engine {
    /// Admit and commit in one call.
    pub async fn create_reservation(
        &self,
        identity: &Identity,
        request: &ReservationRequest,
    ) -> Result<AdmissionOutcome, BookingError> {
        let result = match self.admit(identity, request).await {
            Ok(admission) => self.commit_admission(admission).await,
            Err(e) => Err(e),
        };
        let outcome = match &result {
            Ok(AdmissionOutcome::Confirmed { .. }) => "confirmed",
            Ok(AdmissionOutcome::Queued { .. }) => "queued",
            Err(e) => {
                metrics::counter!(crate::observability::REJECTIONS_TOTAL, "op" => "create_reservation", "code" => e.code())
                    .increment(1);
                debug!("reservation by {} rejected: {e}", identity.user_id);
                "rejected"
            }
        };
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    /// Run every admission rule against the unit's current state. Nothing is
    /// written; the returned ticket is handed to [`Engine::commit_admission`].
    pub async fn admit(
        &self,
        identity: &Identity,
        request: &ReservationRequest,
    ) -> Result<Admission, BookingError> {
        let unit_id = request.unit_id.ok_or(BookingError::MissingField("unit_id"))?;
        let raw_start = required(&request.start_date, "start_date")?;
        let raw_type = required(&request.rental_type, "rental_type")?;
        let user_id = identity.user_id;

        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let us = shared.read().await;
        if !us.unit.is_active {
            return Err(BookingError::UnitNotFound(unit_id));
        }

        let start = parse_start_day(raw_start, self.clock())?;
        let now = self.clock.now();
        let today = self.clock.local_day(now);

        let diff_days = (start - today).num_days();
        if diff_days > i64::from(self.policy.max_advance_days) {
            return Err(BookingError::AdvanceLimitExceeded {
                max_days: self.policy.max_advance_days,
            });
        }
        if diff_days < 0 {
            return Err(BookingError::DateInPast(start));
        }

        if us.unit.status == UnitStatus::Maintenance {
            return Err(BookingError::UnderMaintenance);
        }
        let same_day = start == today;
        if same_day && matches!(us.unit.status, UnitStatus::Booked | UnitStatus::Rented) {
            return Err(BookingError::AlreadyTakenToday);
        }

        let rental_type: RentalType = raw_type.parse()?;
        let details = calculate_booking_details(&us.unit.rates, start, rental_type)?;
        if let Some(existing) = find_overlap(&us, &details.range) {
            return Err(BookingError::DateRangeConflict(existing.id));
        }

        check_cool_down(&us, user_id, start, &self.policy)?;

        if same_day && us.unit.status == UnitStatus::Reserved {
            if us.unit.reserved_to != Some(user_id) {
                return Err(BookingError::QueuePriorityHeld);
            }
            if us.unit.reservation_expires_at.is_some_and(|exp| now > exp) {
                return Err(BookingError::QueueGrantExpired);
            }
        }

        let payment_deadline =
            now + chrono::Duration::minutes(i64::from(self.policy.payment_deadline_minutes));

        Ok(Admission {
            user_id,
            unit_id,
            rental_type,
            details,
            same_day,
            payment_deadline,
        })
    }

    /// Commit an admitted request. Same-day requests swap the unit from
    /// available (or reserved for this user) to booked; if that swap finds
    /// the unit in any other state the race is lost and the requester is
    /// queued instead.
    pub async fn commit_admission(&self, admission: Admission) -> Result<AdmissionOutcome, BookingError> {
        let shared = self
            .get_unit_state(&admission.unit_id)
            .ok_or(BookingError::UnitNotFound(admission.unit_id))?;
        let mut us = shared.write().await;
        let started = std::time::Instant::now();
        let user_id = admission.user_id;
        let prev_status = us.unit.status;

        if admission.same_day {
            let swappable = match us.unit.status {
                UnitStatus::Available => true,
                UnitStatus::Reserved => us.unit.reserved_to == Some(user_id),
                _ => false,
            };
            if !swappable {
                return self.enqueue_race_loser(&mut us, user_id).await;
            }
        }

        // Re-check under the write lock: another booking may have committed
        // since validation.
        if let Some(existing) = find_overlap(&us, &admission.details.range) {
            return Err(BookingError::DateRangeConflict(existing.id));
        }
        if us.reservations.len() >= MAX_RESERVATIONS_PER_UNIT {
            return Err(BookingError::LimitExceeded("too many reservations on unit"));
        }

        let now = self.clock.now();
        let reservation = Reservation {
            id: Ulid::new(),
            user_id,
            unit_id: admission.unit_id,
            range: admission.details.range,
            rental_type: admission.rental_type,
            total_amount: admission.details.total_amount,
            status: ReservationStatus::PendingPayment,
            payment_deadline: admission.payment_deadline,
            created_at: now,
        };

        let mut events = vec![Event::ReservationCreated {
            reservation: reservation.clone(),
        }];
        if admission.same_day {
            events.push(Event::UnitStatusChanged {
                unit_id: admission.unit_id,
                status: UnitStatus::Booked,
                reserved_to: None,
                reservation_expires_at: None,
            });
        }
        events.push(Event::AuditRecorded {
            unit_id: admission.unit_id,
            entry: AuditEntry::new(
                AuditAction::BookingCreated,
                user_id,
                admission.unit_id,
                json!({
                    "reservation_id": reservation.id,
                    "start_date": reservation.range.start,
                    "end_date": reservation.range.end,
                    "rental_type": reservation.rental_type.as_str(),
                    "amount": reservation.total_amount,
                    "prev_status": prev_status.as_str(),
                }),
                now,
            ),
        });

        self.commit(&mut us, events).await?;
        metrics::histogram!(crate::observability::COMMIT_DURATION_SECONDS, "op" => "create_reservation")
            .record(started.elapsed().as_secs_f64());
        let lock_number = us.unit.lock_number.clone();
        drop(us);

        info!(
            "reservation {} on unit {} by {user_id}: {} → {}",
            reservation.id, reservation.unit_id, reservation.range.start, reservation.range.end
        );
        self.notifier.send(
            user_id,
            NotificationKind::BookingCreated,
            json!({
                "reservation_id": reservation.id,
                "lock_number": lock_number,
                "total_amount": reservation.total_amount,
                "payment_deadline": reservation.payment_deadline,
            }),
        );
        Ok(AdmissionOutcome::Confirmed { reservation })
    }

    async fn enqueue_race_loser(
        &self,
        us: &mut super::UnitState,
        user_id: Ulid,
    ) -> Result<AdmissionOutcome, BookingError> {
        metrics::counter!(crate::observability::RACES_LOST_TOTAL).increment(1);
        if holds_blocking(us, &user_id) {
            return Err(BookingError::DuplicateBooking);
        }
        let unit_id = us.unit.id;
        if us.queue_position(&user_id).is_none() {
            let entry = QueueEntry {
                unit_id,
                user_id,
                joined_at: self.clock.now(),
            };
            self.commit(us, vec![Event::QueueJoined { entry }]).await?;
        }
        let position = us.queue_position(&user_id).unwrap_or(1);
        info!("same-day race on unit {unit_id} lost by {user_id}, queued at {position}");
        Ok(AdmissionOutcome::Queued { unit_id, position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::FixedOffset;

    #[test]
    fn bare_date_is_that_local_day() {
        let clock = ManualClock::new(
            DateTime::parse_from_rfc3339("2026-01-27T23:30:00Z").unwrap().to_utc(),
            FixedOffset::west_opt(10 * 3600).unwrap(),
        );
        let day = parse_start_day("2026-01-28", &clock).unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2026, 1, 28).unwrap());
    }

    #[test]
    fn zoned_timestamp_moves_to_local_day() {
        let clock = ManualClock::new(
            DateTime::parse_from_rfc3339("2026-01-27T00:00:00Z").unwrap().to_utc(),
            FixedOffset::east_opt(7 * 3600).unwrap(),
        );
        // 18:00 UTC is 01:00 the next day in UTC+7.
        let day = parse_start_day("2026-01-27T18:00:00Z", &clock).unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2026, 1, 28).unwrap());
        let naive = parse_start_day("2026-01-27T18:00:00", &clock).unwrap();
        assert_eq!(naive, NaiveDate::from_ymd_opt(2026, 1, 27).unwrap());
    }

    #[test]
    fn garbage_date_is_invalid() {
        let clock = ManualClock::at_noon(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        let err = parse_start_day("next tuesday", &clock).unwrap_err();
        assert_eq!(err.code(), "invalid_date");
    }
}
