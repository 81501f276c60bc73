// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipes for talking to a process created with `fork()`.
//!
//! A [`PipeConnection`] is created before the fork; afterwards each side
//! calls [`PipeConnection::forked`] to close the end it does not use.
//! Reading the write-only end (or writing the read-only end) fails with a
//! bad-descriptor error, mirroring the underlying `EBADF`.

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// What the pipe is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    /// Two-way channel built on a socket pair.
    Bidirectional,
    /// Parent writes, child reads (a child stdin replacement).
    ChildInput,
    /// Child writes, parent reads (a child stdout/stderr replacement).
    ChildOutput,
}

pub type PipeReadCallback = Box<dyn FnMut(&mut Reactor, &mut PipeConnection) -> Result<()>>;

pub struct PipeConnection {
    state: ConnectionState,
    mode: PipeMode,
    parent: Pid,
    /// `sockets[0]` belongs to the parent, `sockets[1]` to the child.
    sockets: [Option<OwnedFd>; 2],
    on_read: Option<PipeReadCallback>,
}

impl PipeConnection {
    pub fn new(name: &str, mode: PipeMode) -> Result<Self> {
        let sockets = match mode {
            PipeMode::Bidirectional => {
                let (parent_side, child_side) = socketpair(
                    AddressFamily::Unix,
                    SockType::Stream,
                    None,
                    SockFlag::SOCK_NONBLOCK,
                )
                .map_err(|e| {
                    Error::Initialization(format!("socketpair() failed: {e}"))
                })?;
                [Some(parent_side), Some(child_side)]
            }
            PipeMode::ChildInput => {
                let (read_end, write_end) = nix::unistd::pipe()
                    .map_err(|e| Error::Initialization(format!("pipe() failed: {e}")))?;
                crate::fdutil::set_nonblocking(read_end.as_raw_fd())?;
                crate::fdutil::set_nonblocking(write_end.as_raw_fd())?;
                // parent holds the write end
                [Some(write_end), Some(read_end)]
            }
            PipeMode::ChildOutput => {
                let (read_end, write_end) = nix::unistd::pipe()
                    .map_err(|e| Error::Initialization(format!("pipe() failed: {e}")))?;
                crate::fdutil::set_nonblocking(read_end.as_raw_fd())?;
                crate::fdutil::set_nonblocking(write_end.as_raw_fd())?;
                // parent holds the read end
                [Some(read_end), Some(write_end)]
            }
        };
        Ok(Self {
            state: ConnectionState::new(name),
            mode,
            parent: Pid::this(),
            sockets,
            on_read: None,
        })
    }

    pub fn mode(&self) -> PipeMode {
        self.mode
    }

    /// Callback invoked when the pipe becomes readable.
    pub fn set_read_callback(&mut self, on_read: PipeReadCallback) {
        self.on_read = Some(on_read);
    }

    fn in_parent(&self) -> bool {
        self.parent == Pid::this()
    }

    fn own_socket(&self) -> Option<&OwnedFd> {
        let side = if self.in_parent() { 0 } else { 1 };
        self.sockets[side].as_ref()
    }

    /// After `fork()`, close the end this process does not use.
    pub fn forked(&mut self) {
        let foreign = if self.in_parent() { 1 } else { 0 };
        self.sockets[foreign] = None;
    }

    /// Read from the pipe; fails with a bad-descriptor error on the wrong
    /// end of a one-way pipe.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let wrong_end = if self.in_parent() {
            self.mode == PipeMode::ChildInput
        } else {
            self.mode == PipeMode::ChildOutput
        };
        if wrong_end {
            return Err(Error::Runtime("bad file descriptor".to_string()));
        }
        let Some(fd) = self.own_socket() else {
            return Err(Error::Runtime("bad file descriptor".to_string()));
        };
        // Safety: `buf` is valid for `buf.len()` writable bytes.
        let r = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if r < 0 {
            match nix::Error::last_raw() {
                libc::EAGAIN | libc::EWOULDBLOCK => Ok(0),
                errno => Err(Error::Runtime(format!(
                    "error reading from pipe (errno {errno})"
                ))),
            }
        } else {
            Ok(r as usize)
        }
    }

    /// Write to the pipe; fails with a bad-descriptor error on the wrong
    /// end of a one-way pipe.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let wrong_end = if self.in_parent() {
            self.mode == PipeMode::ChildOutput
        } else {
            self.mode == PipeMode::ChildInput
        };
        if wrong_end {
            return Err(Error::Runtime("bad file descriptor".to_string()));
        }
        let Some(fd) = self.own_socket() else {
            return Err(Error::Runtime("bad file descriptor".to_string()));
        };
        // Safety: `data` is valid for `data.len()` readable bytes.
        let r = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
        if r < 0 {
            Err(Error::Runtime(format!(
                "error writing to pipe (errno {})",
                nix::Error::last_raw()
            )))
        } else {
            Ok(r as usize)
        }
    }

    /// Close both ends.
    pub fn close(&mut self) {
        self.sockets = [None, None];
    }
}

impl Connection for PipeConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.own_socket().map_or(-1, |fd| fd.as_raw_fd())
    }

    fn is_reader(&self) -> bool {
        self.own_socket().is_some()
    }

    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(mut on_read) = self.on_read.take() {
            let result = on_read(reactor, self);
            self.on_read = Some(on_read);
            return result;
        }
        tracing::error!(
            "pipe connection \"{}\" is readable but has no read callback",
            self.state.name()
        );
        Ok(())
    }

    fn process_hup(&mut self, _reactor: &mut Reactor) -> Result<()> {
        self.close();
        Err(Error::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bidirectional_round_trip() {
        let parent = PipeConnection::new("pipe", PipeMode::Bidirectional).unwrap();
        // simulate the child side with direct writes on socket 1
        let child_fd = parent.sockets[1].as_ref().unwrap();
        nix::unistd::write(child_fd, b"from child").unwrap();

        let mut buf = [0u8; 64];
        let n = parent.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from child");

        parent.write(b"from parent").unwrap();
        let mut buf = [0u8; 64];
        let n = nix::unistd::read(child_fd.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"from parent");
    }

    #[test]
    fn test_child_input_role_enforcement() {
        // in the parent, a child-input pipe is write-only
        let pipe = PipeConnection::new("stdin-pipe", PipeMode::ChildInput).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(pipe.read(&mut buf), Err(Error::Runtime(_))));
        pipe.write(b"payload").unwrap();
    }

    #[test]
    fn test_child_output_role_enforcement() {
        // in the parent, a child-output pipe is read-only
        let pipe = PipeConnection::new("stdout-pipe", PipeMode::ChildOutput).unwrap();
        assert!(matches!(pipe.write(b"payload"), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_closed_pipe_fails() {
        let mut pipe = PipeConnection::new("pipe", PipeMode::Bidirectional).unwrap();
        pipe.close();
        let mut buf = [0u8; 16];
        assert!(pipe.read(&mut buf).is_err());
        assert!(pipe.write(b"x").is_err());
        assert_eq!(pipe.socket(), -1);
    }

    #[test]
    fn test_forked_closes_foreign_end() {
        let mut pipe = PipeConnection::new("pipe", PipeMode::Bidirectional).unwrap();
        pipe.forked();
        assert!(pipe.sockets[1].is_none());
        assert!(pipe.sockets[0].is_some());
    }
}
