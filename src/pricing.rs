use chrono::NaiveDate;

use crate::engine::BookingError;
use crate::model::*;

const WEEK_DAYS: Amount = 7;
const MONTH_DAYS: Amount = 30;

/// Dates and total for one reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingDetails {
    pub range: DateRange,
    pub total_amount: Amount,
}

/// Map rates + start day + rental type to the booked range and its price.
///
/// Weekly and monthly fall back to a multiple of the daily rate when the unit
/// carries no dedicated rate.
pub fn calculate_booking_details(
    rates: &Rates,
    start: NaiveDate,
    rental_type: RentalType,
) -> Result<BookingDetails, BookingError> {
    let (span_days, total_amount) = match rental_type {
        RentalType::Daily => (0, rates.daily),
        RentalType::Weekly => (6, rates.weekly.map_or_else(|| daily_multiple(rates, WEEK_DAYS), Ok)?),
        RentalType::Monthly => (29, rates.monthly.map_or_else(|| daily_multiple(rates, MONTH_DAYS), Ok)?),
    };
    Ok(BookingDetails {
        range: DateRange::new(start, add_days(start, span_days)),
        total_amount,
    })
}

/// Rates whose fallback prices are all representable.
pub fn validate_rates(rates: &Rates) -> Result<(), BookingError> {
    daily_multiple(rates, MONTH_DAYS).map(|_| ())
}

fn daily_multiple(rates: &Rates, days: Amount) -> Result<Amount, BookingError> {
    rates
        .daily
        .checked_mul(days)
        .ok_or(BookingError::LimitExceeded("daily rate too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn daily_only(daily: Amount) -> Rates {
        Rates { daily, weekly: None, monthly: None }
    }

    #[test]
    fn daily_is_a_single_day() {
        let details = calculate_booking_details(&daily_only(100), d(2026, 1, 20), RentalType::Daily).unwrap();
        assert_eq!(details.total_amount, 100);
        assert_eq!(details.range, DateRange::single(d(2026, 1, 20)));
    }

    #[test]
    fn weekly_uses_weekly_rate() {
        let rates = Rates { daily: 100, weekly: Some(600), monthly: None };
        let details = calculate_booking_details(&rates, d(2026, 1, 20), RentalType::Weekly).unwrap();
        assert_eq!(details.total_amount, 600);
        assert_eq!(details.range.end, d(2026, 1, 26));
    }

    #[test]
    fn weekly_falls_back_to_seven_days() {
        let details = calculate_booking_details(&daily_only(100), d(2026, 1, 20), RentalType::Weekly).unwrap();
        assert_eq!(details.total_amount, 700);
    }

    #[test]
    fn monthly_crosses_month_boundary() {
        let details = calculate_booking_details(&daily_only(100), d(2026, 1, 20), RentalType::Monthly).unwrap();
        assert_eq!(details.range.end, d(2026, 2, 18));
        assert_eq!(details.total_amount, 3000);

        let rates = Rates { daily: 100, weekly: None, monthly: Some(2500) };
        let details = calculate_booking_details(&rates, d(2026, 1, 20), RentalType::Monthly).unwrap();
        assert_eq!(details.total_amount, 2500);
    }

    #[test]
    fn monthly_across_leap_day() {
        let details = calculate_booking_details(&daily_only(10), d(2028, 2, 10), RentalType::Monthly).unwrap();
        assert_eq!(details.range.end, d(2028, 3, 10));
    }

    #[test]
    fn oversized_daily_rate_is_rejected_not_wrapped() {
        let rates = daily_only(Amount::MAX / 10);
        let err = calculate_booking_details(&rates, d(2026, 1, 20), RentalType::Monthly).unwrap_err();
        assert_eq!(err.code(), "limit_exceeded");
        assert!(calculate_booking_details(&rates, d(2026, 1, 20), RentalType::Weekly).is_ok());
        assert!(validate_rates(&rates).is_err());

        // A dedicated rate never touches the multiplication.
        let rates = Rates { daily: Amount::MAX / 10, weekly: None, monthly: Some(5000) };
        let details = calculate_booking_details(&rates, d(2026, 1, 20), RentalType::Monthly).unwrap();
        assert_eq!(details.total_amount, 5000);
        assert!(validate_rates(&daily_only(100)).is_ok());
    }

    #[test]
    fn unknown_rental_type_is_rejected() {
        let err = "yearly".parse::<RentalType>().unwrap_err();
        assert_eq!(err.code(), "invalid_rental_type");
    }
}
