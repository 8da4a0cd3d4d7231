use ulid::Ulid;

use crate::model::*;

use super::{BookingError, Engine};

impl Engine {
    pub async fn unit(&self, unit_id: Ulid) -> Result<RentalUnit, BookingError> {
        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let us = shared.read().await;
        Ok(us.unit.clone())
    }

    pub async fn reservation(&self, reservation_id: Ulid) -> Result<Reservation, BookingError> {
        let not_found = BookingError::ReservationNotFound(reservation_id);
        let Some(shared) = self
            .get_unit_for_entity(&reservation_id)
            .and_then(|unit_id| self.get_unit_state(&unit_id))
        else {
            return Err(not_found);
        };
        let us = shared.read().await;
        us.reservation(&reservation_id).cloned().ok_or(not_found)
    }

    /// Every reservation the user holds across all units, newest first.
    pub async fn reservations_for_user(&self, user_id: Ulid) -> Vec<Reservation> {
        let mut out = Vec::new();
        for shared in self.all_units() {
            let us = shared.read().await;
            out.extend(us.reservations.iter().filter(|r| r.user_id == user_id).cloned());
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Payments in `status` across all units, oldest submission first.
    pub async fn payments_by_status(&self, status: PaymentStatus) -> Vec<Payment> {
        let mut out = Vec::new();
        for shared in self.all_units() {
            let us = shared.read().await;
            out.extend(us.payments.iter().filter(|p| p.status == status).cloned());
        }
        out.sort_by_key(|p| p.submitted_at);
        out
    }

    pub async fn queue_for_unit(&self, unit_id: Ulid) -> Result<Vec<QueueEntry>, BookingError> {
        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let us = shared.read().await;
        Ok(us.queue.clone())
    }

    pub async fn audit_entries(&self, unit_id: Ulid) -> Result<Vec<AuditEntry>, BookingError> {
        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let us = shared.read().await;
        Ok(us.audit.clone())
    }

    /// Snapshot of the unit handles. DashMap shard guards must not be held
    /// across an await.
    fn all_units(&self) -> Vec<super::SharedUnitState> {
        self.units.iter().map(|e| e.value().clone()).collect()
    }
}
