//! Time-window gate for deployment actions.
//!
//! A time specification is either one of the literals `always` / `never`,
//! or a comma-separated list of window clauses:
//!
//! - recurring weekly windows: `Mon-Fri 06:30-20:30 Europe/Berlin`
//! - absolute ranges: `2024-01-01T00:00:00Z-2024-01-02T00:00:00Z`
//!
//! A specification allows an action when any clause contains the current
//! instant. [`matches`] evaluates leniently: parse errors only surface when
//! no clause matches. [`TimeSpec::from_str`] is the strict parser used to
//! validate specifications up front.

mod error;
mod window;

pub use error::{WindowError, ABSOLUTE_GRAMMAR, RECURRING_GRAMMAR};
pub use window::{AbsoluteWindow, RecurringWindow, Window};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Literal that allows every instant.
pub const ALWAYS: &str = "always";

/// Literal that denies every instant.
pub const NEVER: &str = "never";

/// A parsed time specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSpec {
    Always,
    Never,
    Windows(Vec<Window>),
}

impl TimeSpec {
    /// Whether `now` falls inside this specification.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self {
            TimeSpec::Always => true,
            TimeSpec::Never => false,
            TimeSpec::Windows(windows) => windows.iter().any(|w| w.contains(now)),
        }
    }
}

impl FromStr for TimeSpec {
    type Err = WindowError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let trimmed = spec.trim();
        if trimmed.eq_ignore_ascii_case(ALWAYS) {
            return Ok(TimeSpec::Always);
        }
        if trimmed.eq_ignore_ascii_case(NEVER) {
            return Ok(TimeSpec::Never);
        }
        if trimmed.is_empty() {
            return Err(WindowError::Empty);
        }

        let windows = trimmed
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Window>, _>>()?;
        Ok(TimeSpec::Windows(windows))
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Always => f.write_str(ALWAYS),
            TimeSpec::Never => f.write_str(NEVER),
            TimeSpec::Windows(windows) => {
                for (idx, window) in windows.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{window}")?;
                }
                Ok(())
            }
        }
    }
}

/// Decide whether `now` falls inside the window described by `spec`.
///
/// The first clause that parses and contains `now` wins, even when a later
/// clause is malformed. When no clause matches, the first parse error (if
/// any) is returned; otherwise the result is `Ok(false)`.
pub fn matches(now: DateTime<Utc>, spec: &str) -> Result<bool, WindowError> {
    let trimmed = spec.trim();
    if trimmed.eq_ignore_ascii_case(ALWAYS) {
        return Ok(true);
    }
    if trimmed.eq_ignore_ascii_case(NEVER) {
        return Ok(false);
    }
    if trimmed.is_empty() {
        return Err(WindowError::Empty);
    }

    let mut first_error = None;
    for clause in trimmed.split(',') {
        match clause.parse::<Window>() {
            Ok(window) if window.contains(now) => return Ok(true),
            Ok(_) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(false),
    }
}
