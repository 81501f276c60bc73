// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking client messenger for short-lived request/response exchanges.
//!
//! Unlike the reactor-driven connections, this client owns a blocking
//! socket and a tiny poll loop of its own: [`BlockingMessageConnection::run`]
//! reads messages and hands them to the installed handler until
//! [`BlockingMessageConnection::mark_done`] is called. Useful for
//! lock-style protocols where a process needs one answer before moving on.

use crate::error::{Error, Result};
use crate::fdutil;
use crate::message::Message;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;

pub type BlockingHandler<'a> =
    Box<dyn FnMut(&mut BlockingMessageConnection, &Message) -> Result<()> + 'a>;

pub struct BlockingMessageConnection {
    stream: TcpStream,
    pending: Vec<u8>,
    done: bool,
}

impl BlockingMessageConnection {
    /// Connect to `address` with a blocking socket.
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| Error::Initialization(format!("could not connect: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Initialization(format!("could not set TCP_NODELAY: {e}")))?;
        Ok(Self {
            stream,
            pending: Vec::new(),
            done: false,
        })
    }

    /// Stop [`run`](Self::run) once the current message was handled.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Send one message, writing until the whole line is transmitted.
    pub fn send_message(&mut self, message: &Message) -> Result<bool> {
        let mut line = message.to_line()?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .map_err(|e| Error::Runtime(format!("error writing to socket: {e}")))?;
        Ok(true)
    }

    /// Read and handle messages until the handler calls `mark_done` or the
    /// peer closes the connection.
    ///
    /// Entering `run` resets a previous done flag, so the connection can
    /// be used for several exchanges.
    pub fn run(&mut self, mut handler: BlockingHandler<'_>) -> Result<()> {
        self.done = false;
        while !self.done {
            match self.next_line()? {
                Some(line) => self.handle_line(&line, &mut handler)?,
                None => break, // peer closed
            }
        }
        Ok(())
    }

    /// Drain messages already received without blocking.
    pub fn peek(&mut self, mut handler: BlockingHandler<'_>) -> Result<()> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                self.handle_line(&line, &mut handler)?;
                continue;
            }
            if !fdutil::wait_for_input(self.stream.as_raw_fd(), 0)? {
                return Ok(());
            }
            let mut chunk = [0u8; 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    return Err(Error::Runtime(format!("error reading from socket: {e}")));
                }
            }
        }
    }

    fn handle_line(&mut self, line: &[u8], handler: &mut BlockingHandler<'_>) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(line);
        match Message::from_text(&text) {
            Ok(message) => handler(self, &message),
            Err(e) => {
                tracing::error!("blocking connection received an invalid message ({text}): {e}");
                Ok(())
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&c| c == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    /// Blocking read of the next complete line; `None` on EOF.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(Some(line));
            }
            let mut chunk = [0u8; 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Runtime(format!("error reading from socket: {e}")));
                }
            }
        }
    }
}
