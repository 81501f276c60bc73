// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconnect pause schedules.
//!
//! A schedule is a comma-separated list of durations: bare decimal
//! seconds (`"0.5"`) or unit-suffixed (`"2s"`, `"1m"`). The permanent
//! message connection pulls one delay per failed attempt; an exhausted
//! schedule means no further attempts. A negative first entry delays the
//! very first attempt by its absolute value.

use crate::error::{Error, Result};

/// Default delay when an empty schedule is given: one minute.
pub const DEFAULT_PAUSE_SECONDS: f64 = 60.0;

/// Hard cap on the number of entries.
pub const MAX_PAUSES: usize = 255;

#[derive(Debug, Clone)]
pub struct PauseSchedule {
    pauses: Vec<f64>,
    position: usize,
}

impl PauseSchedule {
    /// Single-entry schedule from a duration in microseconds (may be
    /// negative to delay the first attempt).
    pub fn from_usec(pause_usec: i64) -> Self {
        let mut schedule = Self {
            pauses: vec![pause_usec as f64 / 1_000_000.0],
            position: 0,
        };
        schedule.restart();
        schedule
    }

    /// Parse a comma-separated list of durations.
    pub fn parse(list: &str) -> Result<Self> {
        let mut pauses = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if pauses.len() >= MAX_PAUSES {
                return Err(Error::InvalidParameter(format!(
                    "too many pause durations, limit is {MAX_PAUSES}"
                )));
            }
            let (negative, body) = match entry.strip_prefix('-') {
                Some(body) => (true, body),
                None => (false, entry),
            };
            let seconds = Self::parse_duration(body)?;
            pauses.push(if negative { -seconds } else { seconds });
        }
        if pauses.is_empty() {
            pauses.push(DEFAULT_PAUSE_SECONDS);
        }
        let mut schedule = Self {
            pauses,
            position: 0,
        };
        schedule.restart();
        Ok(schedule)
    }

    fn parse_duration(text: &str) -> Result<f64> {
        if let Ok(seconds) = text.parse::<f64>() {
            if !seconds.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "pause duration \"{text}\" is not valid"
                )));
            }
            return Ok(seconds);
        }
        match humantime::parse_duration(text) {
            Ok(duration) => Ok(duration.as_secs_f64()),
            Err(_) => Err(Error::InvalidParameter(format!(
                "pause duration \"{text}\" is not valid"
            ))),
        }
    }

    /// Delay before the very first connection attempt, in seconds (0 for
    /// an immediate attempt, the absolute value of a negative first
    /// entry otherwise).
    pub fn initial_delay(&self) -> f64 {
        if self.pauses[0] < 0.0 {
            -self.pauses[0]
        } else {
            0.0
        }
    }

    /// Next delay in seconds, or -1.0 when the schedule is exhausted.
    pub fn next_delay(&mut self) -> f64 {
        if self.position < self.pauses.len() {
            let delay = self.pauses[self.position].abs();
            self.position += 1;
            return delay;
        }
        -1.0
    }

    /// Rewind to the start. A negative first entry is skipped: it only
    /// delays the very first attempt.
    pub fn restart(&mut self) {
        if self.pauses.len() == 1 || self.pauses[0] > 0.0 {
            self.position = 0;
        } else {
            self.position = 1;
        }
    }

    pub fn len(&self) -> usize {
        self.pauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pauses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_units() {
        let mut schedule = PauseSchedule::parse("0.5,2s,1m").unwrap();
        assert_eq!(schedule.next_delay(), 0.5);
        assert_eq!(schedule.next_delay(), 2.0);
        assert_eq!(schedule.next_delay(), 60.0);
        assert_eq!(schedule.next_delay(), -1.0);
        assert_eq!(schedule.next_delay(), -1.0);
    }

    #[test]
    fn test_exhaustion_yields_exactly_one_minus_one_per_pass() {
        // property: N entries yield N non-negative values then -1
        let mut schedule = PauseSchedule::parse("1,2,4").unwrap();
        let mut values = Vec::new();
        for _ in 0..4 {
            values.push(schedule.next_delay());
        }
        assert_eq!(values, vec![1.0, 2.0, 4.0, -1.0]);
    }

    #[test]
    fn test_empty_list_defaults_to_one_minute() {
        let mut schedule = PauseSchedule::parse("").unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule.initial_delay(), 0.0);
        assert_eq!(schedule.next_delay(), 60.0);
        assert_eq!(schedule.next_delay(), -1.0);
    }

    #[test]
    fn test_negative_first_entry() {
        let mut schedule = PauseSchedule::parse("-5,10").unwrap();
        assert_eq!(schedule.initial_delay(), 5.0);
        // a fresh schedule starts past the negative entry
        assert_eq!(schedule.next_delay(), 10.0);
        assert_eq!(schedule.next_delay(), -1.0);
        schedule.restart();
        assert_eq!(schedule.next_delay(), 10.0);
    }

    #[test]
    fn test_single_negative_entry() {
        let mut schedule = PauseSchedule::from_usec(-5_000_000);
        assert_eq!(schedule.initial_delay(), 5.0);
        // single entry: restart keeps it reachable
        assert_eq!(schedule.next_delay(), 5.0);
        assert_eq!(schedule.next_delay(), -1.0);
    }

    #[test]
    fn test_entry_cap() {
        let list = vec!["1"; MAX_PAUSES + 1].join(",");
        let err = PauseSchedule::parse(&list).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        let list = vec!["1"; MAX_PAUSES].join(",");
        assert_eq!(PauseSchedule::parse(&list).unwrap().len(), MAX_PAUSES);
    }

    #[test]
    fn test_invalid_entries() {
        for list in ["abc", "1,,2x", "1;2", "nan"] {
            assert!(PauseSchedule::parse(list).is_err(), "{list:?} should fail");
        }
    }
}
