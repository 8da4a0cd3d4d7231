use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::auth::Identity;
use crate::model::*;
use crate::notify::NotificationKind;

use super::{BookingError, Engine, UnitState};

impl Engine {
    /// Cancel an active reservation that has not started yet and release
    /// the unit, unless something else currently holds it.
    pub async fn cancel_reservation(&self, identity: &Identity, reservation_id: Ulid) -> Result<(), BookingError> {
        let not_found = || BookingError::ReservationNotFound(reservation_id);
        let mut us = self.resolve_entity_write(&reservation_id, not_found).await?;

        // Someone else's reservation looks the same as a missing one.
        let reservation = us
            .reservation(&reservation_id)
            .filter(|r| r.user_id == identity.user_id)
            .cloned()
            .ok_or_else(not_found)?;
        if reservation.status != ReservationStatus::Active {
            return Err(BookingError::NotCancellable(reservation.status));
        }
        let now = self.clock.now();
        let today = self.clock.local_day(now);
        if reservation.range.start <= today {
            return Err(BookingError::AlreadyStarted);
        }

        let unit_id = us.unit.id;
        let release_unit = !unit_held_elsewhere(&us, reservation_id, today, now);
        let mut events = vec![Event::ReservationStatusChanged {
            id: reservation_id,
            unit_id,
            status: ReservationStatus::Cancelled,
        }];
        if release_unit {
            events.push(Event::UnitStatusChanged {
                unit_id,
                status: UnitStatus::Available,
                reserved_to: None,
                reservation_expires_at: None,
            });
        }
        events.push(Event::AuditRecorded {
            unit_id,
            entry: AuditEntry::new(
                AuditAction::BookingCancelled,
                identity.user_id,
                reservation_id,
                json!({
                    "prev_status": reservation.status.as_str(),
                    "prev_unit_status": us.unit.status.as_str(),
                    "unit_released": release_unit,
                    "start_date": reservation.range.start,
                }),
                now,
            ),
        });
        self.commit(&mut us, events).await?;
        let lock_number = us.unit.lock_number.clone();
        drop(us);

        info!("reservation {reservation_id} cancelled by {}", identity.user_id);
        self.notifier.send(
            identity.user_id,
            NotificationKind::BookingCancelled,
            json!({
                "reservation_id": reservation_id,
                "lock_number": lock_number,
            }),
        );
        Ok(())
    }
}

/// The unit's current status belongs to someone other than `cancelled`:
/// maintenance, an unexpired queue grant, or another blocking reservation
/// covering today.
fn unit_held_elsewhere(us: &UnitState, cancelled: Ulid, today: NaiveDate, now: DateTime<Utc>) -> bool {
    match us.unit.status {
        UnitStatus::Maintenance => true,
        UnitStatus::Reserved if us.unit.reservation_expires_at.is_some_and(|exp| now <= exp) => true,
        _ => us
            .overlapping(&DateRange::single(today))
            .any(|r| r.id != cancelled && r.status.is_blocking()),
    }
}
