// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The readiness participant contract.
//!
//! Every object driven by the [`Reactor`](crate::reactor::Reactor)
//! implements [`Connection`]. Instead of the deep virtual hierarchy of
//! classic event dispatchers, capabilities are composed: a connection type
//! embeds a [`ConnectionState`] for the bookkeeping the reactor needs and
//! overrides the `process_*` callbacks it cares about. A callback returning
//! an error is treated by the reactor as "connection unusable" and the
//! connection is detached; [`Error::Done`] detaches silently.

use crate::clock;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use std::os::fd::RawFd;

/// Default number of events (e.g. lines) a connection processes per tick.
pub const DEFAULT_EVENT_LIMIT: usize = 5;

/// Default wall-clock budget, in microseconds, a connection may consume per
/// tick.
pub const DEFAULT_PROCESSING_TIME_LIMIT: i64 = 100;

/// Default connection priority; smaller values are dispatched first.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Bookkeeping shared by all connections.
#[derive(Debug)]
pub struct ConnectionState {
    name: String,
    enabled: bool,
    done: bool,
    priority: i32,
    priority_changed: bool,
    reset_tick_on_enable: bool,
    timeout_delay: i64,
    timeout_next_date: i64,
    timeout_date: i64,
    saved_timeout: i64,
    event_limit: usize,
    processing_time_limit: i64,
    pub(crate) fds_position: i32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            done: false,
            priority: DEFAULT_PRIORITY,
            priority_changed: false,
            reset_tick_on_enable: false,
            timeout_delay: -1,
            timeout_next_date: -1,
            timeout_date: -1,
            saved_timeout: -1,
            event_limit: DEFAULT_EVENT_LIMIT,
            processing_time_limit: DEFAULT_PROCESSING_TIME_LIMIT,
            fds_position: -1,
        }
    }
}

impl ConnectionState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Diagnostic name of the connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle participation in the reactor without removing the connection.
    ///
    /// Re-enabling a connection with a timeout delay restarts the tick
    /// phase: the next tick is one full delay after the re-enable.
    pub fn set_enable(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.reset_tick_on_enable = true;
        }
        self.enabled = enabled;
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Change the priority; the reactor re-sorts before its next iteration.
    pub fn set_priority(&mut self, priority: i32) {
        if self.priority != priority {
            self.priority = priority;
            self.priority_changed = true;
        }
    }

    pub(crate) fn take_priority_changed(&mut self) -> bool {
        std::mem::take(&mut self.priority_changed)
    }

    /// The connection finished its work; used by message connections to
    /// drain their output before detaching.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn mark_not_done(&mut self) {
        self.done = false;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn event_limit(&self) -> usize {
        self.event_limit
    }

    pub fn set_event_limit(&mut self, event_limit: usize) {
        self.event_limit = event_limit;
    }

    /// Per-tick wall-clock budget in microseconds.
    pub fn processing_time_limit(&self) -> i64 {
        self.processing_time_limit
    }

    pub fn set_processing_time_limit(&mut self, limit_usec: i64) {
        self.processing_time_limit = limit_usec;
    }

    pub fn timeout_delay(&self) -> i64 {
        self.timeout_delay
    }

    /// Arm a periodic tick every `delay_usec` microseconds (-1 disables).
    /// The first tick happens one delay from now.
    pub fn set_timeout_delay(&mut self, delay_usec: i64) -> Result<()> {
        if delay_usec != -1 && delay_usec < 10 {
            return Err(Error::InvalidParameter(format!(
                "timeout delay must be at least 10 microseconds, got {delay_usec}"
            )));
        }
        self.timeout_delay = delay_usec;
        if delay_usec != -1 {
            self.timeout_next_date = clock::now_usec()? + delay_usec;
        } else {
            self.timeout_next_date = -1;
        }
        Ok(())
    }

    pub fn timeout_date(&self) -> i64 {
        self.timeout_date
    }

    /// Arm a one-shot tick at the absolute date `date_usec` (-1 disables).
    /// The date is consumed when it fires.
    pub fn set_timeout_date(&mut self, date_usec: i64) -> Result<()> {
        if date_usec < -1 {
            return Err(Error::InvalidParameter(format!(
                "invalid absolute timeout date {date_usec}"
            )));
        }
        self.timeout_date = date_usec;
        Ok(())
    }

    /// Advance the delay-based next tick past `now` by whole multiples of
    /// the delay so ticks stay aligned with the original phase.
    pub fn calculate_next_tick(&mut self, now: i64) {
        if self.timeout_delay == -1 || self.timeout_next_date == -1 {
            return;
        }
        if self.timeout_next_date > now {
            return;
        }
        let late = now - self.timeout_next_date;
        let intervals = late / self.timeout_delay + 1;
        self.timeout_next_date += intervals * self.timeout_delay;
    }

    /// Compute and remember the next due date for this iteration: the
    /// nearest of the periodic next tick and the one-shot date, or -1.
    pub(crate) fn save_timeout(&mut self, now: i64) -> i64 {
        if std::mem::take(&mut self.reset_tick_on_enable) && self.timeout_delay != -1 {
            self.timeout_next_date = now + self.timeout_delay;
        }
        let mut timeout = -1;
        if self.timeout_delay != -1 && self.timeout_next_date != -1 {
            timeout = self.timeout_next_date;
        }
        if self.timeout_date != -1 && (timeout == -1 || self.timeout_date < timeout) {
            timeout = self.timeout_date;
        }
        self.saved_timeout = timeout;
        timeout
    }

    pub(crate) fn saved_timeout(&self) -> i64 {
        self.saved_timeout
    }
}

/// A participant in the reactor loop.
///
/// The role predicates decide which readiness flags the reactor requests:
/// listeners and signals ask for input, readers for input and hang-up,
/// writers for output. A connection without a valid descriptor can still
/// receive timeouts.
pub trait Connection {
    fn state(&self) -> &ConnectionState;
    fn state_mut(&mut self) -> &mut ConnectionState;

    /// The OS descriptor to poll, or -1 when there is none.
    fn socket(&self) -> RawFd {
        -1
    }

    fn is_listener(&self) -> bool {
        false
    }

    fn is_signal(&self) -> bool {
        false
    }

    fn is_reader(&self) -> bool {
        false
    }

    fn is_writer(&self) -> bool {
        false
    }

    /// Whether already-buffered input is waiting to be processed; such a
    /// connection is dispatched even when the descriptor is idle.
    fn has_pending_input(&self) -> bool {
        false
    }

    fn process_read(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" received a read event but does not implement process_read()",
            self.state().name()
        );
        Ok(())
    }

    fn process_write(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" received a write event but does not implement process_write()",
            self.state().name()
        );
        Ok(())
    }

    fn process_accept(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" received an accept event but does not implement process_accept()",
            self.state().name()
        );
        Ok(())
    }

    fn process_timeout(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" timed out but does not implement process_timeout()",
            self.state().name()
        );
        Ok(())
    }

    /// An error was reported on the descriptor. The default detaches the
    /// connection.
    fn process_error(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" reported an error, detaching",
            self.state().name()
        );
        Err(Error::Runtime(format!(
            "connection \"{}\" failed",
            self.state().name()
        )))
    }

    /// The peer hung up. The default detaches the connection.
    fn process_hup(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::debug!("connection \"{}\" hung up, detaching", self.state().name());
        Err(Error::Done)
    }

    /// The descriptor is invalid. The default detaches the connection.
    fn process_invalid(&mut self, _reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" has an invalid descriptor, detaching",
            self.state().name()
        );
        Err(Error::Runtime(format!(
            "connection \"{}\" descriptor is invalid",
            self.state().name()
        )))
    }

    /// The outgoing cache was fully drained.
    fn process_empty_buffer(&mut self, _reactor: &mut Reactor) -> Result<()> {
        Ok(())
    }

    /// The connection was attached to a reactor.
    fn connection_added(&mut self, _reactor: &mut Reactor) {}

    /// The connection was detached; called exactly once per removal,
    /// including on reactor teardown.
    fn connection_removed(&mut self, _reactor: &mut Reactor) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_alignment() {
        let mut state = ConnectionState::new("t");
        state.set_timeout_delay(1_000_000).unwrap();
        let start = state.timeout_next_date;

        // not yet due: nothing moves
        state.calculate_next_tick(start - 1);
        assert_eq!(state.timeout_next_date, start);

        // one period late: advance by exactly one period
        state.calculate_next_tick(start);
        assert_eq!(state.timeout_next_date, start + 1_000_000);

        // several periods late: stay phase aligned
        state.calculate_next_tick(start + 3_500_000);
        assert_eq!(state.timeout_next_date, start + 4_000_000);
    }

    #[test]
    fn test_save_timeout_picks_nearest() {
        let mut state = ConnectionState::new("t");
        assert_eq!(state.save_timeout(0), -1);

        state.set_timeout_delay(1_000_000).unwrap();
        let next = state.timeout_next_date;
        assert_eq!(state.save_timeout(0), next);

        state.set_timeout_date(next - 500).unwrap();
        assert_eq!(state.save_timeout(0), next - 500);
        assert_eq!(state.saved_timeout(), next - 500);

        state.set_timeout_date(next + 500).unwrap();
        assert_eq!(state.save_timeout(0), next);
    }

    #[test]
    fn test_enable_resets_tick_phase() {
        let mut state = ConnectionState::new("t");
        state.set_timeout_delay(1_000_000).unwrap();
        state.set_enable(false);
        state.set_enable(true);
        let fake_now = 42_000_000_000;
        assert_eq!(state.save_timeout(fake_now), fake_now + 1_000_000);
    }

    #[test]
    fn test_delay_validation() {
        let mut state = ConnectionState::new("t");
        assert!(state.set_timeout_delay(0).is_err());
        assert!(state.set_timeout_delay(5).is_err());
        state.set_timeout_delay(-1).unwrap();
        assert!(state.set_timeout_date(-2).is_err());
        state.set_timeout_date(-1).unwrap();
    }

    #[test]
    fn test_priority_change_flag() {
        let mut state = ConnectionState::new("t");
        assert!(!state.take_priority_changed());
        state.set_priority(5);
        assert!(state.take_priority_changed());
        assert!(!state.take_priority_changed());
        state.set_priority(5);
        assert!(!state.take_priority_changed());
    }
}
