// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thin eventfd wrapper used by the inter-thread connection and the
//! permanent connection's thread-done rendezvous.

use crate::error::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a non-blocking, close-on-exec eventfd in semaphore mode:
    /// each read decrements the counter by one.
    pub(crate) fn new_semaphore() -> Result<Self> {
        // Safety: eventfd has no preconditions.
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if fd < 0 {
            return Err(Error::Initialization(format!(
                "eventfd() failed with errno {}",
                nix::Error::last_raw()
            )));
        }
        // Safety: `fd` was just returned by eventfd and is owned by no one
        // else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Add `value` to the counter, waking up any poller.
    pub(crate) fn post(&self, value: u64) -> Result<()> {
        let bytes = value.to_ne_bytes();
        // Safety: `bytes` is a valid 8 byte buffer.
        let r = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                bytes.as_ptr().cast(),
                bytes.len(),
            )
        };
        if r != bytes.len() as isize {
            return Err(Error::Runtime(format!(
                "error writing to eventfd (errno {})",
                nix::Error::last_raw()
            )));
        }
        Ok(())
    }

    /// Take one count off the counter; `None` when the counter is zero.
    pub(crate) fn take(&self) -> Result<Option<u64>> {
        let mut bytes = [0u8; 8];
        // Safety: `bytes` is a valid 8 byte buffer.
        let r = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                bytes.as_mut_ptr().cast(),
                bytes.len(),
            )
        };
        if r == bytes.len() as isize {
            return Ok(Some(u64::from_ne_bytes(bytes)));
        }
        match nix::Error::last_raw() {
            libc::EAGAIN | libc::EWOULDBLOCK => Ok(None),
            errno => Err(Error::Runtime(format!(
                "error reading from eventfd (errno {errno})"
            ))),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
