use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Utc};

/// Source of "now" and of the local calendar day.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day an instant falls on in the market's local time zone.
    fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate;

    fn today(&self) -> NaiveDate {
        self.local_day(self.now())
    }
}

/// Wall clock in the host's time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&Local).date_naive()
    }
}

/// Settable clock with a fixed UTC offset, for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            millis: AtomicI64::new(now.timestamp_millis()),
            offset,
        }
    }

    /// Clock reading noon on `day`, UTC.
    pub fn at_noon(day: NaiveDate) -> Self {
        let now = day.and_hms_opt(12, 0, 0).unwrap_or_default().and_utc();
        Self::new(now, Utc.fix())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }

    fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}
