//! Errors produced while parsing window specifications.

use thiserror::Error;

/// Grammar of a recurring weekly window clause.
pub const RECURRING_GRAMMAR: &str = "<Day>-<Day> HH:MM-HH:MM <Timezone>";

/// Grammar of an absolute date range clause.
pub const ABSOLUTE_GRAMMAR: &str = "<RFC3339>-<RFC3339>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("empty time window specification")]
    Empty,

    #[error(
        "time window clause {clause:?} matches neither \"<Day>-<Day> HH:MM-HH:MM <Timezone>\" \
         nor \"<RFC3339>-<RFC3339>\""
    )]
    Format { clause: String },

    #[error("invalid weekday {token:?}: expected one of MON, TUE, WED, THU, FRI, SAT, SUN")]
    InvalidWeekday { token: String },

    #[error("invalid time of day {value:?} in clause {clause:?}")]
    InvalidTime { value: String, clause: String },

    #[error("unknown timezone {zone:?}")]
    InvalidTimezone { zone: String },

    #[error("invalid RFC3339 instant {value:?}: {reason}")]
    InvalidInstant { value: String, reason: String },
}
