// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small descriptor helpers shared by the connection types.

use crate::error::{Error, Result};
use std::os::fd::RawFd;

/// Make a descriptor non-blocking.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    // Safety: fcntl on a descriptor the caller owns has no preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Initialization(format!(
            "F_GETFL failed with errno {}",
            nix::Error::last_raw()
        )));
    }
    // Safety: same as above.
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r < 0 {
        return Err(Error::Initialization(format!(
            "F_SETFL failed with errno {}",
            nix::Error::last_raw()
        )));
    }
    Ok(())
}

/// Set or clear the close-on-exec flag.
pub(crate) fn set_cloexec(fd: RawFd, close_on_exec: bool) -> Result<()> {
    let flags = if close_on_exec { libc::FD_CLOEXEC } else { 0 };
    // Safety: fcntl on a descriptor the caller owns has no preconditions.
    let r = unsafe { libc::fcntl(fd, libc::F_SETFD, flags) };
    if r < 0 {
        return Err(Error::Initialization(format!(
            "F_SETFD failed with errno {}",
            nix::Error::last_raw()
        )));
    }
    Ok(())
}

/// Wait for input readiness on one descriptor.
///
/// `timeout_usec` of -1 blocks, 0 only polls. Returns `true` when the
/// descriptor became readable before the timeout.
pub(crate) fn wait_for_input(fd: RawFd, timeout_usec: i64) -> Result<bool> {
    let timeout_ms: libc::c_int = if timeout_usec < 0 {
        -1
    } else if timeout_usec == 0 {
        0
    } else {
        // sub-millisecond waits round up to 1ms
        (timeout_usec / 1_000).max(1).min(libc::c_int::MAX as i64) as libc::c_int
    };
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    }];
    loop {
        // Safety: `fds` is a valid array of one entry for the whole call.
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if r < 0 {
            match nix::Error::last_raw() {
                libc::EINTR | libc::EAGAIN => continue,
                errno => {
                    return Err(Error::Runtime(format!("poll() failed with errno {errno}")));
                }
            }
        }
        return Ok(r > 0 && fds[0].revents & (libc::POLLIN | libc::POLLPRI) != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_input_timeout() {
        // an unconnected pipe read end never becomes readable
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        let ready = wait_for_input(read_end.as_raw_fd(), 10_000).unwrap();
        assert!(!ready);
    }

    #[test]
    fn test_wait_for_input_ready() {
        use std::os::fd::AsRawFd;
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&write_end, b"x").unwrap();
        let ready = wait_for_input(read_end.as_raw_fd(), 1_000_000).unwrap();
        assert!(ready);
    }
}
