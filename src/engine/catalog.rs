use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::auth::{Action, Identity};
use crate::limits::{MAX_LOCK_NUMBER_LEN, MAX_UNITS};
use crate::model::*;
use crate::notify::NotificationKind;
use crate::pricing::validate_rates;

use super::{BookingError, Engine, UnitState};

impl Engine {
    pub async fn register_unit(&self, identity: &Identity, unit: RentalUnit) -> Result<(), BookingError> {
        if !identity.can(Action::ManageLocks) {
            return Err(BookingError::Forbidden);
        }
        if unit.lock_number.trim().is_empty() {
            return Err(BookingError::MissingField("lock_number"));
        }
        if unit.lock_number.len() > MAX_LOCK_NUMBER_LEN {
            return Err(BookingError::LimitExceeded("lock number too long"));
        }
        validate_rates(&unit.rates)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.units.contains_key(&unit.id) {
            return Err(BookingError::UnitAlreadyExists(unit.id));
        }
        if self.units.len() >= MAX_UNITS {
            return Err(BookingError::LimitExceeded("too many units"));
        }

        let id = unit.id;
        let mut state = UnitState::new(unit.clone());
        let audit = AuditEntry::new(
            AuditAction::UnitRegistered,
            identity.user_id,
            id,
            json!({
                "zone_id": unit.zone_id,
                "lock_number": unit.lock_number,
                "daily_rate": unit.rates.daily,
            }),
            self.clock.now(),
        );
        let events = vec![
            Event::UnitRegistered { unit },
            Event::AuditRecorded { unit_id: id, entry: audit },
        ];
        self.commit(&mut state, events).await?;
        self.units.insert(id, Arc::new(RwLock::new(state)));
        info!("unit {id} registered");
        Ok(())
    }

    /// Take a unit out of service, or return it to service as available.
    /// Setting the state it already has is a no-op.
    pub async fn set_maintenance(&self, identity: &Identity, unit_id: Ulid, on: bool) -> Result<(), BookingError> {
        if !identity.can(Action::ManageLocks) {
            return Err(BookingError::Forbidden);
        }
        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let mut us = shared.write().await;

        let in_maintenance = us.unit.status == UnitStatus::Maintenance;
        if in_maintenance == on {
            return Ok(());
        }
        let prev_status = us.unit.status;
        let status = if on { UnitStatus::Maintenance } else { UnitStatus::Available };
        let events = vec![
            Event::UnitStatusChanged {
                unit_id,
                status,
                reserved_to: None,
                reservation_expires_at: None,
            },
            Event::AuditRecorded {
                unit_id,
                entry: AuditEntry::new(
                    AuditAction::MaintenanceChanged,
                    identity.user_id,
                    unit_id,
                    json!({
                        "prev_status": prev_status.as_str(),
                        "status": status.as_str(),
                    }),
                    self.clock.now(),
                ),
            },
        ];
        self.commit(&mut us, events).await?;
        info!("unit {unit_id}: {} → {}", prev_status.as_str(), status.as_str());
        Ok(())
    }

    /// Hand a free unit to the longest-waiting queued user for
    /// `queue_grant_minutes`. A lapsed grant counts as free. Returns the
    /// promoted user, or `None` when the unit is taken or nobody is waiting.
    pub async fn promote_queue(&self, identity: &Identity, unit_id: Ulid) -> Result<Option<Ulid>, BookingError> {
        if !identity.can(Action::ManageLocks) {
            return Err(BookingError::Forbidden);
        }
        let shared = self
            .get_unit_state(&unit_id)
            .ok_or(BookingError::UnitNotFound(unit_id))?;
        let mut us = shared.write().await;

        let now = self.clock.now();
        let grant_lapsed = us.unit.status == UnitStatus::Reserved
            && us.unit.reservation_expires_at.is_some_and(|exp| now > exp);
        if us.unit.status != UnitStatus::Available && !grant_lapsed {
            return Ok(None);
        }
        let Some(next) = us.queue.iter().min_by_key(|q| q.joined_at).cloned() else {
            return Ok(None);
        };

        let expires_at = now + chrono::Duration::minutes(i64::from(self.policy.queue_grant_minutes));
        let events = vec![
            Event::QueueLeft {
                unit_id,
                user_id: next.user_id,
            },
            Event::UnitStatusChanged {
                unit_id,
                status: UnitStatus::Reserved,
                reserved_to: Some(next.user_id),
                reservation_expires_at: Some(expires_at),
            },
            Event::AuditRecorded {
                unit_id,
                entry: AuditEntry::new(
                    AuditAction::QueuePromoted,
                    identity.user_id,
                    unit_id,
                    json!({
                        "promoted_user": next.user_id,
                        "expires_at": expires_at,
                    }),
                    now,
                ),
            },
        ];
        self.commit(&mut us, events).await?;
        let lock_number = us.unit.lock_number.clone();
        drop(us);

        info!("unit {unit_id} reserved for {} until {expires_at}", next.user_id);
        self.notifier.send(
            next.user_id,
            NotificationKind::QueuePromoted,
            json!({
                "unit_id": unit_id,
                "lock_number": lock_number,
                "expires_at": expires_at,
            }),
        );
        Ok(Some(next.user_id))
    }
}
