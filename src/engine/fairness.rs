//! Cool-down policy: a user who has held the same unit for `max_stay_days`
//! in a row must leave it free for more than `cool_down_days` before taking
//! it again.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::{Policy, CHAIN_LINK_TOLERANCE_DAYS, MAX_CHAIN_LINKS};
use crate::model::*;

use super::{BookingError, UnitState};

fn owned_blocking<'a>(us: &'a UnitState, user_id: Ulid) -> impl Iterator<Item = &'a Reservation> {
    us.reservations
        .iter()
        .filter(move |r| r.user_id == user_id && r.status.is_blocking())
}

/// The user's blocking reservation on this unit with the latest end before `day`.
fn latest_ending_before(us: &UnitState, user_id: Ulid, day: NaiveDate) -> Option<&Reservation> {
    owned_blocking(us, user_id)
        .filter(|r| r.range.end < day)
        .max_by_key(|r| r.range.end)
}

/// Predecessor that ends within the link tolerance before `cursor` starts.
fn connected_predecessor<'a>(us: &'a UnitState, user_id: Ulid, cursor: &Reservation) -> Option<&'a Reservation> {
    let earliest_end = sub_days(cursor.range.start, CHAIN_LINK_TOLERANCE_DAYS);
    owned_blocking(us, user_id)
        .filter(|r| r.range.end >= earliest_end && r.range.end < cursor.range.start)
        .max_by_key(|r| r.range.end)
}

/// Sum of segment lengths walking back from `last` through connected
/// predecessors. Stops once `cap` is reached, the chain breaks, or after
/// [`MAX_CHAIN_LINKS`] segments.
pub fn consecutive_stay_days(us: &UnitState, user_id: Ulid, last: &Reservation, cap: u32) -> i64 {
    let cap = i64::from(cap);
    let mut total = 0i64;
    let mut cursor = last;
    for _ in 0..MAX_CHAIN_LINKS {
        total += cursor.range.length_days();
        if total >= cap {
            break;
        }
        match connected_predecessor(us, user_id, cursor) {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    total
}

pub(crate) fn check_cool_down(
    us: &UnitState,
    user_id: Ulid,
    candidate_start: NaiveDate,
    policy: &Policy,
) -> Result<(), BookingError> {
    let Some(last) = latest_ending_before(us, user_id, candidate_start) else {
        return Ok(());
    };
    let gap_days = (candidate_start - last.range.end).num_days();
    if gap_days > i64::from(policy.cool_down_days) {
        return Ok(());
    }

    let consecutive = consecutive_stay_days(us, user_id, last, policy.max_stay_days);
    if consecutive >= i64::from(policy.max_stay_days) {
        tracing::debug!(
            "cool-down for user {user_id} on unit {}: {consecutive} consecutive days, gap {gap_days}",
            us.unit.id
        );
        return Err(BookingError::CoolDownRequired {
            max_stay_days: policy.max_stay_days,
            cool_down_days: policy.cool_down_days,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn unit() -> UnitState {
        let rates = Rates { daily: 100, weekly: None, monthly: None };
        UnitState::new(RentalUnit::new(Ulid::new(), Ulid::new(), "C-03", rates))
    }

    fn stay(us: &mut UnitState, user: Ulid, start: NaiveDate, end: NaiveDate, status: ReservationStatus) {
        us.insert_reservation(Reservation {
            id: Ulid::new(),
            user_id: user,
            unit_id: us.unit.id,
            range: DateRange::new(start, end),
            rental_type: RentalType::Weekly,
            total_amount: 600,
            status,
            payment_deadline: Utc::now(),
            created_at: Utc::now(),
        });
    }

    #[test]
    fn no_history_is_allowed() {
        let us = unit();
        assert!(check_cool_down(&us, Ulid::new(), d(2026, 3, 1), &Policy::default()).is_ok());
    }

    #[test]
    fn four_connected_weeks_trigger_cool_down() {
        let mut us = unit();
        let user = Ulid::new();
        // Weekly segments are 6 days long by end − start; five of them with
        // one-day seams add up to 30.
        let mut start = d(2026, 1, 1);
        for _ in 0..5 {
            stay(&mut us, user, start, add_days(start, 6), ReservationStatus::Active);
            start = add_days(start, 7);
        }
        let last_end = d(2026, 2, 4);
        let policy = Policy::default();

        let err = check_cool_down(&us, user, add_days(last_end, 1), &policy).unwrap_err();
        assert!(matches!(err, BookingError::CoolDownRequired { max_stay_days: 28, cool_down_days: 7 }));
        assert!(check_cool_down(&us, user, add_days(last_end, 7), &policy).is_err());
        assert!(check_cool_down(&us, user, add_days(last_end, 8), &policy).is_ok());
    }

    #[test]
    fn broken_chain_does_not_accumulate() {
        let mut us = unit();
        let user = Ulid::new();
        // 3-day hole between segments: not connected.
        stay(&mut us, user, d(2026, 1, 1), d(2026, 1, 20), ReservationStatus::Active);
        stay(&mut us, user, d(2026, 1, 24), d(2026, 2, 5), ReservationStatus::Active);
        let last = us.reservations.last().unwrap().clone();
        assert_eq!(consecutive_stay_days(&us, user, &last, 28), 12);
        assert!(check_cool_down(&us, user, d(2026, 2, 6), &Policy::default()).is_ok());
    }

    #[test]
    fn cancelled_and_foreign_stays_are_ignored() {
        let mut us = unit();
        let user = Ulid::new();
        stay(&mut us, user, d(2026, 1, 1), d(2026, 1, 30), ReservationStatus::Cancelled);
        stay(&mut us, Ulid::new(), d(2026, 1, 1), d(2026, 1, 30), ReservationStatus::Active);
        assert!(check_cool_down(&us, user, d(2026, 2, 1), &Policy::default()).is_ok());
    }

    #[test]
    fn alternate_policy_values_apply() {
        let mut us = unit();
        let user = Ulid::new();
        stay(&mut us, user, d(2026, 1, 1), d(2026, 1, 11), ReservationStatus::PendingPayment);
        let strict = Policy { max_stay_days: 10, cool_down_days: 3, ..Policy::default() };
        assert!(check_cool_down(&us, user, d(2026, 1, 14), &strict).is_err());
        assert!(check_cool_down(&us, user, d(2026, 1, 15), &strict).is_ok());
    }

    #[test]
    fn chain_walk_is_bounded() {
        let mut us = unit();
        let user = Ulid::new();
        // 200 back-to-back two-day stays, each 1 day long.
        let mut start = d(2025, 1, 1);
        for _ in 0..200 {
            stay(&mut us, user, start, add_days(start, 1), ReservationStatus::Active);
            start = add_days(start, 2);
        }
        let last = us.reservations.last().unwrap().clone();
        let total = consecutive_stay_days(&us, user, &last, 1000);
        assert_eq!(total, MAX_CHAIN_LINKS as i64);
    }
}
