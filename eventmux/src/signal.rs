// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix signals as reactor connections.
//!
//! A [`SignalConnection`] blocks one signal for the process and receives
//! it through a signalfd instead, so signal handling happens inside the
//! reactor loop like any other readiness event. This is also the supported
//! way to avoid `EINTR` aborts of the poll loop.

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::fd::{AsFd, AsRawFd, RawFd};

pub type SignalCallback = Box<dyn FnMut(&mut Reactor, &libc::signalfd_siginfo) -> Result<()>>;

pub struct SignalConnection {
    state: ConnectionState,
    signal: Signal,
    mask: SigSet,
    signalfd: SignalFd,
    on_signal: SignalCallback,
    unblock_on_drop: bool,
}

impl SignalConnection {
    /// Block `signal` for the calling thread and route it through a
    /// signalfd.
    pub fn new(name: &str, signal: Signal, on_signal: SignalCallback) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(signal);
        mask.thread_block()
            .map_err(|e| Error::Initialization(format!("could not block signal {signal}: {e}")))?;
        let signalfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| Error::Initialization(format!("signalfd() failed: {e}")))?;
        Ok(Self {
            state: ConnectionState::new(name),
            signal,
            mask,
            signalfd,
            on_signal,
            unblock_on_drop: true,
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Keep the signal blocked after this connection goes away (e.g. when
    /// another part of the process takes over the mask).
    pub fn keep_blocked_on_drop(&mut self) {
        self.unblock_on_drop = false;
    }
}

impl Drop for SignalConnection {
    fn drop(&mut self) {
        if self.unblock_on_drop {
            if let Err(e) = self.mask.thread_unblock() {
                tracing::warn!("could not unblock signal {}: {e}", self.signal);
            }
        }
    }
}

impl Connection for SignalConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.signalfd.as_fd().as_raw_fd()
    }

    fn is_signal(&self) -> bool {
        true
    }

    /// Read all pending signal records and invoke the callback for each.
    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            match self.signalfd.read_signal() {
                Ok(Some(info)) => {
                    (self.on_signal)(reactor, &info)?;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        "error reading signalfd on connection \"{}\": {e}",
                        self.state.name()
                    );
                    return self.process_error(reactor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_signal_through_reactor() {
        let fired = Rc::new(RefCell::new(0u32));
        let seen = fired.clone();
        let connection = SignalConnection::new(
            "usr2",
            Signal::SIGUSR2,
            Box::new(move |_, info| {
                assert_eq!(info.ssi_signo, Signal::SIGUSR2 as u32);
                *seen.borrow_mut() += 1;
                Err(Error::Done)
            }),
        )
        .unwrap();

        let mut reactor = Reactor::new();
        reactor
            .add_connection(Rc::new(RefCell::new(connection)))
            .unwrap();
        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        reactor.run().unwrap();
        assert_eq!(*fired.borrow(), 1);
    }
}
