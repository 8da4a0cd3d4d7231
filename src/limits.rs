//! Booking policy knobs and hard safety limits.

use serde::{Deserialize, Serialize};

/// Furthest a start day may lie ahead of today.
pub const DEFAULT_MAX_ADVANCE_DAYS: u32 = 14;
/// Longest consecutive stay before a cool-down is required.
pub const DEFAULT_MAX_STAY_DAYS: u32 = 28;
pub const DEFAULT_COOL_DOWN_DAYS: u32 = 7;
pub const DEFAULT_PAYMENT_DEADLINE_MINUTES: u32 = 30;
pub const DEFAULT_QUEUE_GRANT_MINUTES: u32 = 30;

/// A predecessor whose end lies within this many days of the next segment's
/// start counts as the same stay.
pub const CHAIN_LINK_TOLERANCE_DAYS: u64 = 2;
/// Upper bound on predecessor lookups during the fairness walk.
pub const MAX_CHAIN_LINKS: usize = 64;

pub const MAX_LOCK_NUMBER_LEN: usize = 64;
pub const MAX_SLIP_REF_LEN: usize = 2048;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_UNITS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_UNIT: usize = 100_000;
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Rate constants injected into the engine; tests swap in other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub max_advance_days: u32,
    pub max_stay_days: u32,
    pub cool_down_days: u32,
    pub payment_deadline_minutes: u32,
    pub queue_grant_minutes: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_advance_days: DEFAULT_MAX_ADVANCE_DAYS,
            max_stay_days: DEFAULT_MAX_STAY_DAYS,
            cool_down_days: DEFAULT_COOL_DOWN_DAYS,
            payment_deadline_minutes: DEFAULT_PAYMENT_DEADLINE_MINUTES,
            queue_grant_minutes: DEFAULT_QUEUE_GRANT_MINUTES,
        }
    }
}
