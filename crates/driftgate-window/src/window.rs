//! Single window clauses: recurring weekly windows and absolute ranges.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use chrono_tz::Tz;
use regex_lite::Regex;

use crate::WindowError;

fn recurring_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z]{3})-([A-Za-z]{3})\s+(\d{1,2}:\d{2})-(\d{1,2}:\d{2})\s+(\S+)$")
            .expect("recurring window pattern compiles")
    })
}

fn absolute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let instant = r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[Zz]|[+-]\d{2}:\d{2})";
        Regex::new(&format!(r"^({instant})-({instant})$"))
            .expect("absolute window pattern compiles")
    })
}

/// Weekday tokens, indexed from Sunday.
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn parse_weekday(token: &str) -> Result<u32, WindowError> {
    let upper = token.to_ascii_uppercase();
    WEEKDAYS
        .iter()
        .position(|day| *day == upper)
        .map(|idx| idx as u32)
        .ok_or_else(|| WindowError::InvalidWeekday {
            token: token.to_string(),
        })
}

fn parse_minute_of_day(value: &str, clause: &str) -> Result<u32, WindowError> {
    let invalid = || WindowError::InvalidTime {
        value: value.to_string(),
        clause: clause.to_string(),
    };
    let (hours, minutes) = value.split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}

fn parse_instant(value: &str) -> Result<DateTime<FixedOffset>, WindowError> {
    DateTime::parse_from_rfc3339(value).map_err(|e| WindowError::InvalidInstant {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// A weekly window such as `Mon-Fri 06:30-20:30 Europe/Berlin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringWindow {
    /// First allowed day, 0 = Sunday.
    pub start_day: u32,
    /// Last allowed day, 0 = Sunday. May be smaller than `start_day`.
    pub end_day: u32,
    pub start_minute: u32,
    pub end_minute: u32,
    pub timezone: Tz,
}

impl RecurringWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        let weekday = local.weekday().num_days_from_sunday();

        let day_ok = if self.start_day > self.end_day {
            weekday >= self.start_day || weekday <= self.end_day
        } else {
            weekday >= self.start_day && weekday <= self.end_day
        };
        if !day_ok {
            return false;
        }

        let minute = local.hour() * 60 + local.minute();
        self.start_minute <= minute && minute <= self.end_minute
    }
}

impl fmt::Display for RecurringWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {:02}:{:02}-{:02}:{:02} {}",
            WEEKDAYS[self.start_day as usize],
            WEEKDAYS[self.end_day as usize],
            self.start_minute / 60,
            self.start_minute % 60,
            self.end_minute / 60,
            self.end_minute % 60,
            self.timezone.name()
        )
    }
}

/// An absolute range between two instants, both inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl AbsoluteWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from <= now && now <= self.to
    }
}

impl fmt::Display for AbsoluteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// One comma-separated clause of a time specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    Recurring(RecurringWindow),
    Absolute(AbsoluteWindow),
}

impl Window {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self {
            Window::Recurring(w) => w.contains(now),
            Window::Absolute(w) => w.contains(now),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Recurring(w) => w.fmt(f),
            Window::Absolute(w) => w.fmt(f),
        }
    }
}

impl FromStr for Window {
    type Err = WindowError;

    fn from_str(clause: &str) -> Result<Self, Self::Err> {
        let clause = clause.trim();

        if let Some(caps) = recurring_pattern().captures(clause) {
            let start_day = parse_weekday(&caps[1])?;
            let end_day = parse_weekday(&caps[2])?;
            let start_minute = parse_minute_of_day(&caps[3], clause)?;
            let end_minute = parse_minute_of_day(&caps[4], clause)?;
            let timezone: Tz = caps[5].parse().map_err(|_| WindowError::InvalidTimezone {
                zone: caps[5].to_string(),
            })?;
            return Ok(Window::Recurring(RecurringWindow {
                start_day,
                end_day,
                start_minute,
                end_minute,
                timezone,
            }));
        }

        if let Some(caps) = absolute_pattern().captures(clause) {
            let from = parse_instant(&caps[1])?.with_timezone(&Utc);
            let to = parse_instant(&caps[2])?.with_timezone(&Utc);
            return Ok(Window::Absolute(AbsoluteWindow { from, to }));
        }

        Err(WindowError::Format {
            clause: clause.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_weekday_tokens_are_case_insensitive() {
        assert_eq!(parse_weekday("mon").unwrap(), 1);
        assert_eq!(parse_weekday("SUN").unwrap(), 0);
        assert_eq!(parse_weekday("Sat").unwrap(), 6);
        assert!(matches!(
            parse_weekday("Xyz"),
            Err(WindowError::InvalidWeekday { .. })
        ));
    }

    #[test]
    fn test_minute_of_day_bounds() {
        assert_eq!(parse_minute_of_day("00:00", "c").unwrap(), 0);
        assert_eq!(parse_minute_of_day("23:59", "c").unwrap(), 1439);
        assert!(parse_minute_of_day("24:00", "c").is_err());
        assert!(parse_minute_of_day("12:60", "c").is_err());
    }

    #[test]
    fn test_recurring_clause_parses() {
        let window: Window = "Mon-Fri 06:30-20:30 Europe/Berlin".parse().unwrap();
        match window {
            Window::Recurring(w) => {
                assert_eq!(w.start_day, 1);
                assert_eq!(w.end_day, 5);
                assert_eq!(w.start_minute, 6 * 60 + 30);
                assert_eq!(w.end_minute, 20 * 60 + 30);
                assert_eq!(w.timezone, chrono_tz::Europe::Berlin);
            }
            other => panic!("expected recurring window, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_timezone() {
        let err = "Mon-Fri 06:30-20:30 Mars/Olympus".parse::<Window>().unwrap_err();
        assert_eq!(
            err,
            WindowError::InvalidTimezone {
                zone: "Mars/Olympus".to_string()
            }
        );
    }

    #[test]
    fn test_absolute_clause_parses() {
        let window: Window = "2024-01-01T00:00:00+00:00-2024-01-02T00:00:00+00:00"
            .parse()
            .unwrap();
        let expected = AbsoluteWindow {
            from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        };
        assert_eq!(window, Window::Absolute(expected));
    }

    #[test]
    fn test_absolute_clause_normalizes_offsets() {
        let window: Window = "2024-01-01T02:00:00+02:00-2024-01-01T03:00:00+02:00"
            .parse()
            .unwrap();
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 1, 1, 2, 30, 0).unwrap()));
    }

    #[test]
    fn test_garbage_clause_is_format_error() {
        let err = "whenever".parse::<Window>().unwrap_err();
        assert!(matches!(err, WindowError::Format { .. }));
        let message = err.to_string();
        assert!(message.contains("<Day>-<Day> HH:MM-HH:MM <Timezone>"));
        assert!(message.contains("<RFC3339>-<RFC3339>"));
        assert!(message.contains("whenever"));
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let window: Window = "sat-mon 00:00-23:59 UTC".parse().unwrap();
        assert_eq!(window.to_string(), "SAT-MON 00:00-23:59 UTC");
        let reparsed: Window = window.to_string().parse().unwrap();
        assert_eq!(reparsed, window);
    }
}
