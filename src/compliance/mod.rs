//! Compliance Gate
//!
//! Decides whether a contact may be called right now in the contact's local
//! time. The default windows follow the FZ-230 debt-collection rules:
//!
//! - weekdays: 08:00 to 22:00
//! - weekends: 09:00 to 20:00
//!
//! Window starts are inclusive and ends exclusive. Both windows are engine
//! configuration.

pub mod clock;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use clock::{Clock, ShiftedClock, SystemClock};

/// A local time-of-day range, written `"08:00-22:00"`.
///
/// A range whose end is earlier than its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    fn hours(start: u32, end: u32) -> Self {
        let at = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN);
        Self::new(at(start), at(end))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl FromStr for TimeRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            field: "compliance window".to_string(),
            message: format!("'{}': {}", s, message),
        };
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| invalid("expected HH:MM-HH:MM"))?;
        let parse = |t: &str| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M").map_err(|e| invalid(&e.to_string()))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

impl TryFrom<String> for TimeRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeRange> for String {
    fn from(range: TimeRange) -> Self {
        range.to_string()
    }
}

/// Permitted local calling hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceWindow {
    pub weekday: TimeRange,
    pub weekend: TimeRange,
}

impl Default for ComplianceWindow {
    fn default() -> Self {
        Self {
            weekday: TimeRange::hours(8, 22),
            weekend: TimeRange::hours(9, 20),
        }
    }
}

impl ComplianceWindow {
    /// Whether `now` falls inside the window in `zone`'s local time.
    pub fn allows(&self, zone: &ContactZone, now: DateTime<Utc>) -> bool {
        let (weekday, time) = zone.local_weekday_and_time(now);
        let range = match weekday {
            Weekday::Sat | Weekday::Sun => &self.weekend,
            _ => &self.weekday,
        };
        range.contains(time)
    }
}

/// A contact's time zone: an IANA name or a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl ContactZone {
    fn local_weekday_and_time(&self, now: DateTime<Utc>) -> (Weekday, NaiveTime) {
        match self {
            ContactZone::Named(tz) => {
                let local = tz.from_utc_datetime(&now.naive_utc());
                (local.weekday(), local.time())
            }
            ContactZone::Fixed(offset) => {
                let local = offset.from_utc_datetime(&now.naive_utc());
                (local.weekday(), local.time())
            }
        }
    }
}

impl fmt::Display for ContactZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactZone::Named(tz) => write!(f, "{}", tz.name()),
            ContactZone::Fixed(offset) => write!(f, "UTC{}", offset),
        }
    }
}

impl FromStr for ContactZone {
    type Err = String;

    /// Accepts `Europe/Moscow`, `UTC`, `UTC+3`, `GMT-05:30`, `+03:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Ok(tz) = text.parse::<Tz>() {
            return Ok(ContactZone::Named(tz));
        }

        let offset = text
            .strip_prefix("UTC")
            .or_else(|| text.strip_prefix("GMT"))
            .unwrap_or(text)
            .trim();
        parse_offset(offset)
            .map(ContactZone::Fixed)
            .ok_or_else(|| format!("unknown time zone '{}'", s))
    }
}

fn parse_offset(text: &str) -> Option<FixedOffset> {
    let (sign, rest) = match text.chars().next()? {
        '+' => (1, &text[1..]),
        '-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest.get(..2)?.parse().ok()?, rest.get(2..)?.parse().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Whether calling a contact in `zone` is permitted at `now`.
pub fn is_call_allowed(window: &ComplianceWindow, zone: &ContactZone, now: DateTime<Utc>) -> bool {
    window.allows(zone, now)
}
