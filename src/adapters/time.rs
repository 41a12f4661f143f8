//! Wall-clock adapter.
//!
//! Implements [`ClockPort`] over `chrono`.  Timestamps are milliseconds
//! since the Unix epoch; the local hour uses the host time zone so the
//! warning window follows the household's day.

use chrono::{DateTime, Local, TimeZone, Timelike, Utc};

use crate::Timestamp;
use crate::app::ports::ClockPort;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl ClockPort for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_millis().max(0) as Timestamp
    }

    fn local_hour(&self, at: Timestamp) -> u8 {
        match Local.timestamp_millis_opt(at as i64).single() {
            Some(t) => t.hour() as u8,
            // Ambiguous or out of range: fall back to UTC.
            None => utc_hour(at),
        }
    }
}

/// UTC hour (0-23) of `at`.
pub fn utc_hour(at: Timestamp) -> u8 {
    ((at / 3_600_000) % 24) as u8
}

/// RFC 3339 rendering of a timestamp, as stored remotely.
pub fn to_rfc3339(at: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(at as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
