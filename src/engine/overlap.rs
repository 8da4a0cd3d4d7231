use ulid::Ulid;

use crate::model::*;

use super::UnitState;

/// First blocking reservation on the unit whose range intersects `range`.
pub(crate) fn find_overlap<'a>(us: &'a UnitState, range: &DateRange) -> Option<&'a Reservation> {
    us.overlapping(range).find(|r| r.status.is_blocking())
}

/// Linear variant over an arbitrary slice, independent of sort order.
pub fn first_conflict<'a>(reservations: &'a [Reservation], range: &DateRange) -> Option<&'a Reservation> {
    reservations
        .iter()
        .find(|r| r.status.is_blocking() && r.range.overlaps(range))
}

/// Whether `user_id` already holds any blocking reservation on the unit.
pub(crate) fn holds_blocking(us: &UnitState, user_id: &Ulid) -> bool {
    us.reservations
        .iter()
        .any(|r| r.user_id == *user_id && r.status.is_blocking())
}
