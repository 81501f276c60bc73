// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timer-only connections.
//!
//! A [`TimerConnection`] has no descriptor (`socket()` returns -1); it
//! exists solely to receive `process_timeout` ticks from the reactor.

use crate::connection::{Connection, ConnectionState};
use crate::error::Result;
use crate::reactor::Reactor;
use std::cell::RefCell;
use std::rc::Rc;

pub type TimeoutCallback = Box<dyn FnMut(&mut Reactor, &mut ConnectionState) -> Result<()>>;

pub struct TimerConnection {
    state: ConnectionState,
    on_timeout: TimeoutCallback,
}

impl TimerConnection {
    /// Create a periodic timer ticking every `delay_usec` microseconds.
    /// A delay of 0 arms a single immediate tick instead.
    pub fn new(name: &str, delay_usec: i64, on_timeout: TimeoutCallback) -> Result<Rc<RefCell<Self>>> {
        let mut state = ConnectionState::new(name);
        if delay_usec == 0 {
            // fire as soon as the loop runs
            state.set_timeout_date(crate::clock::now_usec()?)?;
        } else {
            state.set_timeout_delay(delay_usec)?;
        }
        Ok(Rc::new(RefCell::new(Self { state, on_timeout })))
    }
}

impl Connection for TimerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn process_timeout(&mut self, reactor: &mut Reactor) -> Result<()> {
        (self.on_timeout)(reactor, &mut self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_periodic_timer() {
        let mut reactor = Reactor::new();
        let count = Rc::new(RefCell::new(0));
        let seen = count.clone();
        let timer = TimerConnection::new(
            "periodic",
            5_000,
            Box::new(move |_, _| {
                *seen.borrow_mut() += 1;
                if *seen.borrow() == 4 {
                    return Err(Error::Done);
                }
                Ok(())
            }),
        )
        .unwrap();
        reactor.add_connection(timer).unwrap();
        reactor.run().unwrap();
        assert_eq!(*count.borrow(), 4);
    }

    #[test]
    fn test_immediate_one_shot() {
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(false));
        let seen = fired.clone();
        let timer = TimerConnection::new(
            "one-shot",
            0,
            Box::new(move |_, state| {
                *seen.borrow_mut() = true;
                // the one-shot date was consumed; nothing re-arms, so ask
                // for removal
                assert_eq!(state.timeout_date(), -1);
                Err(Error::Done)
            }),
        )
        .unwrap();
        reactor.add_connection(timer).unwrap();
        reactor.run().unwrap();
        assert!(*fired.borrow());
    }
}
