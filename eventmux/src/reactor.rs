// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reactor: a single-threaded readiness loop over a set of
//! connections.
//!
//! One reactor per process is the intended topology; construct it
//! explicitly at program start and hand it down to the code creating
//! connections. All callbacks run on the thread calling [`Reactor::run`];
//! the only suspension point is the `poll(2)` call. Connection callbacks
//! may add and remove connections freely; each iteration works from a
//! snapshot, and the enabled flag captured at the start of an iteration
//! stays authoritative for that whole iteration.

use crate::clock;
use crate::connection::Connection;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;

/// Shared handle to a connection registered (or registrable) with the
/// reactor.
pub type ConnectionRef = Rc<RefCell<dyn Connection>>;

fn same_connection(a: &ConnectionRef, b: &ConnectionRef) -> bool {
    // compare the data addresses; vtable pointers are not reliable
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct Reactor {
    connections: Vec<ConnectionRef>,
    force_sort: bool,
    /// Connections removed while their callback was running; their
    /// `connection_removed` hook is fired once the callback returns.
    removed_pending: Vec<ConnectionRef>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current set of connections, in priority order as of the last
    /// iteration.
    pub fn connections(&self) -> &[ConnectionRef] {
        &self.connections
    }

    /// Attach a connection.
    ///
    /// Fails on duplicates and on connections that neither expose a valid
    /// descriptor nor have any timer armed; such a connection could never
    /// receive an event.
    pub fn add_connection(&mut self, connection: ConnectionRef) -> Result<()> {
        {
            let conn = connection.borrow();
            let state = conn.state();
            if conn.socket() < 0 && state.timeout_delay() == -1 && state.timeout_date() == -1 {
                return Err(Error::InvalidParameter(format!(
                    "connection \"{}\" has no socket and no timer",
                    state.name()
                )));
            }
        }
        if self
            .connections
            .iter()
            .any(|existing| same_connection(existing, &connection))
        {
            return Err(Error::InvalidParameter(format!(
                "connection \"{}\" is already attached to this reactor",
                connection.borrow().state().name()
            )));
        }

        self.connections.push(connection.clone());
        self.force_sort = true;
        tracing::debug!(
            "added connection \"{}\" ({} total)",
            connection.borrow().state().name(),
            self.connections.len()
        );
        if let Ok(mut conn) = connection.try_borrow_mut() {
            conn.connection_added(self);
        }
        Ok(())
    }

    /// Detach a connection. Returns `false` when it was not attached.
    ///
    /// Safe to call from inside any callback of any connection on the
    /// reactor thread; the change is observed on the next iteration.
    pub fn remove_connection(&mut self, connection: &ConnectionRef) -> bool {
        let position = self
            .connections
            .iter()
            .position(|existing| same_connection(existing, connection));
        let Some(position) = position else {
            return false;
        };
        let removed = self.connections.remove(position);
        self.force_sort = true;
        tracing::debug!(
            "removed connection \"{}\" ({} left)",
            removed.borrow().state().name(),
            self.connections.len()
        );

        // fire connection_removed now unless the connection is currently
        // inside one of its own callbacks; then it runs when the callback
        // returns
        if removed.try_borrow_mut().is_ok() {
            removed.borrow_mut().connection_removed(self);
        } else {
            self.removed_pending.push(removed);
        }
        true
    }

    fn drain_removed(&mut self) {
        while let Some(connection) = self.removed_pending.pop() {
            if connection.try_borrow_mut().is_ok() {
                connection.borrow_mut().connection_removed(self);
            } else {
                // still borrowed; put it back and try again later
                self.removed_pending.push(connection);
                break;
            }
        }
    }

    /// Log and detach a connection whose callback reported failure.
    fn handle_callback_result(
        &mut self,
        connection: &ConnectionRef,
        result: Result<()>,
        what: &str,
    ) {
        match result {
            Ok(()) => {}
            Err(Error::Done) => {
                self.remove_connection(connection);
            }
            Err(e) => {
                let name = match connection.try_borrow() {
                    Ok(conn) => conn.state().name().to_string(),
                    Err(_) => String::from("<borrowed>"),
                };
                tracing::error!("connection \"{name}\" failed in {what}: {e}");
                self.remove_connection(connection);
            }
        }
        self.drain_removed();
    }

    /// Run the loop until no connection is left.
    ///
    /// Returns an error on fatal poll failures and when every remaining
    /// connection is disabled or descriptor-less with no timer (the loop
    /// would block forever).
    pub fn run(&mut self) -> Result<()> {
        self.force_sort = true;
        let mut enabled: Vec<bool> = Vec::new();
        let mut fds: Vec<libc::pollfd> = Vec::new();

        loop {
            if self.connections.is_empty() {
                return Ok(());
            }

            for connection in &self.connections {
                if connection.borrow_mut().state_mut().take_priority_changed() {
                    self.force_sort = true;
                }
            }
            if self.force_sort {
                // stable: ties keep insertion order
                self.connections
                    .sort_by_key(|connection| connection.borrow().state().priority());
                self.force_sort = false;
            }

            // callbacks may mutate the real list; iterate over a snapshot
            let snapshot: Vec<ConnectionRef> = self.connections.clone();

            enabled.clear();
            fds.clear();
            let mut next_timeout = i64::MAX;
            let mut immediate = false;
            let now = clock::now_usec()?;
            for connection in &snapshot {
                let mut conn = connection.borrow_mut();
                conn.state_mut().fds_position = -1;

                // the flag captured here is authoritative for the whole
                // iteration, even if a callback disables the connection
                let is_enabled = conn.state().is_enabled();
                enabled.push(is_enabled);
                if !is_enabled {
                    continue;
                }

                let timestamp = conn.state_mut().save_timeout(now);
                if timestamp != -1 && timestamp < next_timeout {
                    next_timeout = timestamp;
                }
                if conn.is_reader() && conn.has_pending_input() {
                    immediate = true;
                }

                let mut events: libc::c_short = 0;
                if conn.is_listener() || conn.is_signal() {
                    events |= libc::POLLIN;
                }
                if conn.is_reader() {
                    events |= libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP;
                }
                if conn.is_writer() {
                    events |= libc::POLLOUT | libc::POLLRDHUP;
                }
                if events == 0 {
                    // timer-only connection
                    continue;
                }
                let fd = conn.socket();
                if fd < 0 {
                    continue;
                }
                conn.state_mut().fds_position = fds.len() as i32;
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }

            let timeout_ms: libc::c_int = if immediate {
                0
            } else if next_timeout != i64::MAX {
                let now = clock::now_usec()?;
                let diff = next_timeout - now;
                if diff <= 0 {
                    0
                } else {
                    // µs → ms; a positive sub-millisecond wait becomes 1ms
                    // rather than a busy loop
                    let ms = diff / 1_000;
                    if ms == 0 {
                        1
                    } else {
                        ms.min(libc::c_int::MAX as i64) as libc::c_int
                    }
                }
            } else if fds.is_empty() {
                tracing::error!(
                    "nothing to poll on; all {} connections are disabled or timer-less",
                    snapshot.len()
                );
                return Err(Error::Runtime("nothing to poll on".to_string()));
            } else {
                -1
            };

            // Safety: `fds` stays alive and valid for the whole call.
            let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if r < 0 {
                return Err(Self::poll_error());
            }

            for (idx, connection) in snapshot.iter().enumerate() {
                if !enabled[idx] {
                    continue;
                }

                let (position, pending_input) = {
                    let conn = connection.borrow();
                    (
                        conn.state().fds_position,
                        conn.is_reader() && conn.has_pending_input(),
                    )
                };
                let revents = if position >= 0 {
                    fds[position as usize].revents
                } else {
                    0
                };

                if revents != 0 || pending_input {
                    if revents & (libc::POLLIN | libc::POLLPRI) != 0 || pending_input {
                        let is_listener = connection.borrow().is_listener();
                        let result = if is_listener {
                            connection.borrow_mut().process_accept(self)
                        } else {
                            connection.borrow_mut().process_read(self)
                        };
                        let what = if is_listener { "process_accept" } else { "process_read" };
                        self.handle_callback_result(connection, result, what);
                    }
                    if revents & libc::POLLOUT != 0 {
                        let result = connection.borrow_mut().process_write(self);
                        self.handle_callback_result(connection, result, "process_write");
                    }
                    if revents & libc::POLLERR != 0 {
                        let result = connection.borrow_mut().process_error(self);
                        self.handle_callback_result(connection, result, "process_error");
                    }
                    if revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                        let result = connection.borrow_mut().process_hup(self);
                        self.handle_callback_result(connection, result, "process_hup");
                    }
                    if revents & libc::POLLNVAL != 0 {
                        let result = connection.borrow_mut().process_invalid(self);
                        self.handle_callback_result(connection, result, "process_invalid");
                    }
                }

                let timestamp = connection.borrow().state().saved_timeout();
                if timestamp != -1 {
                    let now = clock::now_usec()?;
                    if now >= timestamp {
                        {
                            let mut conn = connection.borrow_mut();
                            // move the next tick first; the callback may
                            // move it again
                            conn.state_mut().calculate_next_tick(now);
                            if conn.state().timeout_date() != -1
                                && now >= conn.state().timeout_date()
                            {
                                // one-shot date consumed
                                let _ = conn.state_mut().set_timeout_date(-1);
                            }
                        }
                        let result = connection.borrow_mut().process_timeout(self);
                        self.handle_callback_result(connection, result, "process_timeout");
                    }
                }
            }
        }
    }

    fn poll_error() -> Error {
        match nix::Error::last_raw() {
            libc::EINTR => Error::Runtime(
                "EINTR occurred while in poll() -- use a signal connection to \
                 handle Unix signals"
                    .to_string(),
            ),
            libc::EFAULT => {
                Error::InvalidParameter("poll() buffer was moved out of our address space".to_string())
            }
            libc::EINVAL => {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                // Safety: `limit` is a valid rlimit out-parameter.
                unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
                Error::InvalidParameter(format!(
                    "too many file descriptors for poll(), limit is currently {}, \
                     your kernel top limit is {}",
                    limit.rlim_cur, limit.rlim_max
                ))
            }
            libc::ENOMEM => Error::Runtime("poll() failed because of memory".to_string()),
            errno => Error::Runtime(format!("poll() failed with errno {errno}")),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // detach everything so connection_removed fires exactly once
        while let Some(connection) = self.connections.pop() {
            if let Ok(mut conn) = connection.try_borrow_mut() {
                conn.connection_removed(self);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.connections.len())
            .field("force_sort", &self.force_sort)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    struct FakeTimer {
        state: ConnectionState,
        ticks: usize,
        max_ticks: usize,
        removed: usize,
    }

    impl FakeTimer {
        fn new(name: &str, delay_usec: i64, max_ticks: usize) -> Rc<RefCell<Self>> {
            let mut state = ConnectionState::new(name);
            state.set_timeout_delay(delay_usec).unwrap();
            Rc::new(RefCell::new(Self {
                state,
                ticks: 0,
                max_ticks,
                removed: 0,
            }))
        }
    }

    impl Connection for FakeTimer {
        fn state(&self) -> &ConnectionState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ConnectionState {
            &mut self.state
        }

        fn process_timeout(&mut self, _reactor: &mut Reactor) -> Result<()> {
            self.ticks += 1;
            if self.ticks >= self.max_ticks {
                return Err(Error::Done);
            }
            Ok(())
        }

        fn connection_removed(&mut self, _reactor: &mut Reactor) {
            self.removed += 1;
        }
    }

    #[test]
    fn test_empty_reactor_exits() {
        let mut reactor = Reactor::new();
        reactor.run().unwrap();
    }

    #[test]
    fn test_timer_ticks_then_detaches() {
        let mut reactor = Reactor::new();
        let timer = FakeTimer::new("ticker", 1_000, 3);
        reactor.add_connection(timer.clone()).unwrap();
        reactor.run().unwrap();
        let timer = timer.borrow();
        assert_eq!(timer.ticks, 3);
        assert_eq!(timer.removed, 1);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut reactor = Reactor::new();
        let timer = FakeTimer::new("dup", 1_000, 1);
        reactor.add_connection(timer.clone()).unwrap();
        let err = reactor.add_connection(timer.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_add_rejects_eventless_connection() {
        struct Inert {
            state: ConnectionState,
        }
        impl Connection for Inert {
            fn state(&self) -> &ConnectionState {
                &self.state
            }
            fn state_mut(&mut self) -> &mut ConnectionState {
                &mut self.state
            }
        }
        let mut reactor = Reactor::new();
        let inert = Rc::new(RefCell::new(Inert {
            state: ConnectionState::new("inert"),
        }));
        let err = reactor.add_connection(inert).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_remove_not_found() {
        let mut reactor = Reactor::new();
        let timer = FakeTimer::new("gone", 1_000, 1);
        assert!(!reactor.remove_connection(&(timer.clone() as ConnectionRef)));
        reactor.add_connection(timer.clone()).unwrap();
        assert!(reactor.remove_connection(&(timer.clone() as ConnectionRef)));
        assert!(!reactor.remove_connection(&(timer as ConnectionRef)));
    }

    #[test]
    fn test_self_removal_from_callback() {
        struct SelfRemover {
            state: ConnectionState,
            me: Option<ConnectionRef>,
            removed: usize,
        }
        impl Connection for SelfRemover {
            fn state(&self) -> &ConnectionState {
                &self.state
            }
            fn state_mut(&mut self) -> &mut ConnectionState {
                &mut self.state
            }
            fn process_timeout(&mut self, reactor: &mut Reactor) -> Result<()> {
                let me = self.me.take().expect("only ticks once");
                assert!(reactor.remove_connection(&me));
                Ok(())
            }
            fn connection_removed(&mut self, _reactor: &mut Reactor) {
                self.removed += 1;
            }
        }

        let mut state = ConnectionState::new("self-remover");
        state.set_timeout_delay(1_000).unwrap();
        let conn = Rc::new(RefCell::new(SelfRemover {
            state,
            me: None,
            removed: 0,
        }));
        conn.borrow_mut().me = Some(conn.clone());
        let mut reactor = Reactor::new();
        reactor.add_connection(conn.clone()).unwrap();
        reactor.run().unwrap();
        assert_eq!(conn.borrow().removed, 1);
    }

    #[test]
    fn test_priority_order() {
        // both timers are due immediately; the lower priority value runs
        // first within the iteration
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEQ: AtomicUsize = AtomicUsize::new(0);

        struct Ordered {
            state: ConnectionState,
            seen: usize,
        }
        impl Connection for Ordered {
            fn state(&self) -> &ConnectionState {
                &self.state
            }
            fn state_mut(&mut self) -> &mut ConnectionState {
                &mut self.state
            }
            fn process_timeout(&mut self, _reactor: &mut Reactor) -> Result<()> {
                self.seen = SEQ.fetch_add(1, Ordering::SeqCst);
                Err(Error::Done)
            }
        }

        let make = |name: &str, priority: i32| {
            let mut state = ConnectionState::new(name);
            state.set_timeout_delay(1_000).unwrap();
            state.set_priority(priority);
            Rc::new(RefCell::new(Ordered { state, seen: 0 }))
        };

        let mut reactor = Reactor::new();
        let low = make("low", 200);
        let high = make("high", 10);
        // insertion order is the reverse of priority order
        reactor.add_connection(low.clone()).unwrap();
        reactor.add_connection(high.clone()).unwrap();
        reactor.run().unwrap();
        assert!(high.borrow().seen < low.borrow().seen);
    }
}
