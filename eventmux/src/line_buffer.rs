// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line framing over a non-blocking byte stream.
//!
//! [`LineBuffer`] accumulates incoming bytes until complete `\n`-terminated
//! lines are available (no `\r` handling) and caches outgoing bytes that
//! could not be transmitted immediately. It is embedded by the stream and
//! pipe connections; the fairness limits (events per tick, wall-clock
//! budget) come from the owning connection's state.

use crate::clock;
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Size of one read chunk.
const READ_CHUNK: usize = 1024;

/// Outcome of one [`LineBuffer::read_lines`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// No more input available right now.
    Drained,
    /// One of the fairness limits was reached; more input may be pending.
    LimitReached,
    /// The peer closed its end (read returned zero).
    EndOfFile,
}

#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Incoming bytes not yet handed out as complete lines.
    line: Vec<u8>,
    /// Outgoing bytes not yet transmitted.
    output: Vec<u8>,
    /// Transmit position inside `output`.
    position: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial (or complete, not yet processed) line is buffered.
    pub fn has_input(&self) -> bool {
        !self.line.is_empty()
    }

    /// Whether a complete line is already buffered.
    pub fn has_complete_line(&self) -> bool {
        self.line.contains(&b'\n')
    }

    /// Whether outgoing bytes are waiting for the socket to accept them.
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Append bytes to the outgoing cache.
    pub fn cache_output(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    /// Queue `data` for transmission on `io`.
    ///
    /// When the cache is empty an immediate write is attempted and only the
    /// residue is cached. Returns the full `data` length: the bytes are
    /// either transmitted or cached. A transport failure other than
    /// would-block is returned as a runtime error.
    pub fn write(&mut self, io: &mut impl Write, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.output.is_empty() {
            let mut offset = 0;
            loop {
                match io.write(&data[offset..]) {
                    Ok(n) => {
                        offset += n;
                        if offset >= data.len() {
                            return Ok(data.len());
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(Error::Runtime(format!(
                            "error writing to socket: {e}"
                        )));
                    }
                }
            }
            self.output.extend_from_slice(&data[offset..]);
        } else {
            self.output.extend_from_slice(data);
        }
        Ok(data.len())
    }

    /// Read and split lines from `io`, honoring the per-tick fairness
    /// limits. Complete lines (without their `\n`) are appended to `lines`.
    ///
    /// Lines already sitting in the accumulator are produced first, then up
    /// to 1 KiB is read at a time until would-block, end of file, or a
    /// limit is hit.
    pub fn read_lines(
        &mut self,
        io: &mut impl Read,
        event_limit: usize,
        budget_usec: i64,
        lines: &mut Vec<Vec<u8>>,
    ) -> Result<ReadOutcome> {
        let deadline = clock::now_usec()? + budget_usec;

        self.split_lines(event_limit, lines);
        if lines.len() >= event_limit {
            return Ok(ReadOutcome::LimitReached);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match io.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::EndOfFile),
                Ok(n) => {
                    self.line.extend_from_slice(&chunk[..n]);
                    self.split_lines(event_limit, lines);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained);
                }
                Err(e) => {
                    return Err(Error::Runtime(format!(
                        "error reading from socket: {e}"
                    )));
                }
            }
            if lines.len() >= event_limit || clock::now_usec()? >= deadline {
                return Ok(ReadOutcome::LimitReached);
            }
        }
    }

    fn split_lines(&mut self, event_limit: usize, lines: &mut Vec<Vec<u8>>) {
        while lines.len() < event_limit {
            match self.line.iter().position(|&c| c == b'\n') {
                Some(pos) => {
                    let mut line: Vec<u8> = self.line.drain(..=pos).collect();
                    line.pop(); // drop the '\n'
                    lines.push(line);
                }
                None => break,
            }
        }
    }

    /// Transmit cached output. On full drain the cache is reset and `true`
    /// is returned so the owner can fire its empty-buffer callback.
    /// Would-block leaves the state unchanged.
    pub fn flush_output(&mut self, io: &mut impl Write) -> Result<bool> {
        if self.output.is_empty() {
            return Ok(false);
        }
        match io.write(&self.output[self.position..]) {
            Ok(n) => {
                self.position += n;
                if self.position >= self.output.len() {
                    self.output.clear();
                    self.position = 0;
                    return Ok(true);
                }
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(Error::Runtime(format!("error writing to socket: {e}"))),
        }
    }

    /// Bytes currently cached and not yet transmitted.
    pub fn pending_output(&self) -> usize {
        self.output.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// A reader that turns empty into would-block, like a non-blocking
    /// socket with nothing pending.
    struct NonBlocking<R>(R);

    impl<R: Read> Read for NonBlocking<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf) {
                Ok(0) => Err(io::Error::from(ErrorKind::WouldBlock)),
                other => other,
            }
        }
    }

    /// A writer accepting at most `cap` bytes per call, then would-block.
    struct Throttled {
        accepted: Vec<u8>,
        cap: usize,
        full: bool,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.full {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.cap);
            self.accepted.extend_from_slice(&buf[..n]);
            self.full = true;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_lines_basic() {
        let mut buffer = LineBuffer::new();
        let mut io = NonBlocking(Cursor::new(b"alpha\nbeta\ngam".to_vec()));
        let mut lines = Vec::new();
        let outcome = buffer
            .read_lines(&mut io, 100, 1_000_000, &mut lines)
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Drained);
        assert_eq!(lines, vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert!(buffer.has_input()); // "gam" is buffered
        assert!(!buffer.has_complete_line());
    }

    #[test]
    fn test_event_limit_fairness() {
        // 200 one-byte lines, limit 10: exactly 10 lines per call, rest
        // stays buffered, and repeated calls drain everything.
        let data: Vec<u8> = std::iter::repeat(*b"a\n")
            .take(200)
            .flat_map(|pair| pair)
            .collect();
        let mut buffer = LineBuffer::new();
        let mut io = NonBlocking(Cursor::new(data));

        let mut total = 0;
        let mut calls = 0;
        loop {
            let mut lines = Vec::new();
            let outcome = buffer
                .read_lines(&mut io, 10, 10_000_000, &mut lines)
                .unwrap();
            if lines.is_empty() && outcome == ReadOutcome::Drained {
                break;
            }
            assert!(lines.len() <= 10);
            total += lines.len();
            calls += 1;
            if calls == 1 {
                assert_eq!(lines.len(), 10);
            }
            assert!(calls < 50, "not making progress");
        }
        assert_eq!(total, 200);
        assert!(calls >= 20);
    }

    #[test]
    fn test_empty_lines_are_produced() {
        let mut buffer = LineBuffer::new();
        let mut io = NonBlocking(Cursor::new(b"\n\nx\n".to_vec()));
        let mut lines = Vec::new();
        buffer.read_lines(&mut io, 100, 1_000_000, &mut lines).unwrap();
        assert_eq!(lines, vec![b"".to_vec(), b"".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn test_write_caches_residue() {
        let mut buffer = LineBuffer::new();
        let mut io = Throttled {
            accepted: Vec::new(),
            cap: 4,
            full: false,
        };
        let written = buffer.write(&mut io, b"0123456789").unwrap();
        assert_eq!(written, 10);
        assert_eq!(io.accepted, b"0123");
        assert_eq!(buffer.pending_output(), 6);

        // a second write goes straight to the cache
        buffer.write(&mut io, b"ab").unwrap();
        assert_eq!(buffer.pending_output(), 8);

        // drain through flush_output
        io.full = false;
        assert!(!buffer.flush_output(&mut io).unwrap());
        io.full = false;
        assert!(buffer.flush_output(&mut io).unwrap());
        assert_eq!(io.accepted, b"0123456789ab");
        assert!(!buffer.has_output());
    }

    #[test]
    fn test_write_conservation() {
        // user bytes == transmitted bytes + cached bytes
        let mut buffer = LineBuffer::new();
        let mut io = Throttled {
            accepted: Vec::new(),
            cap: 7,
            full: false,
        };
        let mut sent = 0usize;
        for chunk in [&b"hello\n"[..], b"a much longer line\n", b"x\n"] {
            sent += buffer.write(&mut io, chunk).unwrap();
            io.full = false;
        }
        assert_eq!(sent, io.accepted.len() + buffer.pending_output());
    }
}
