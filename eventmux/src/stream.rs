// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message framing over stream sockets.
//!
//! [`StreamMessageConnection`] turns any non-blocking byte stream into a
//! message connection: incoming bytes are line-framed, each line is parsed
//! as a [`Message`] and routed through the bound [`Dispatcher`] (or the
//! plain message callback), and outgoing messages are serialized followed
//! by a newline. TCP and Unix stream sockets instantiate this one type.

use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{Dispatcher, Handler, MessageSender};
use crate::error::{Error, Result};
use crate::line_buffer::LineBuffer;
use crate::message::Message;
use crate::reactor::Reactor;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

pub struct StreamMessageConnection<S> {
    state: ConnectionState,
    stream: Option<S>,
    buffer: LineBuffer,
    dispatcher: Option<Dispatcher>,
    on_message: Option<Handler>,
}

impl<S> std::fmt::Debug for StreamMessageConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMessageConnection")
            .field("state", &self.state)
            .field("buffer", &self.buffer)
            .field("dispatcher", &self.dispatcher)
            .field("on_message", &self.on_message.as_ref().map(|_| "<handler>"))
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write + AsRawFd> StreamMessageConnection<S> {
    /// Wrap an already connected, non-blocking stream (e.g. obtained from
    /// `accept`).
    pub fn from_stream(name: &str, stream: S) -> Self {
        Self {
            state: ConnectionState::new(name),
            stream: Some(stream),
            buffer: LineBuffer::new(),
            dispatcher: None,
            on_message: None,
        }
    }

    /// Install the dispatcher routing incoming messages.
    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn dispatcher(&self) -> Option<&Dispatcher> {
        self.dispatcher.as_ref()
    }

    /// Install a plain message callback used when no dispatcher is bound.
    pub fn set_message_handler(&mut self, handler: Handler) {
        self.on_message = Some(handler);
    }

    /// Close the socket; the connection stops participating in I/O but can
    /// still receive timeouts.
    pub fn close(&mut self) {
        self.stream = None;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Queue raw bytes on the outgoing cache.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => self.buffer.write(stream, data),
            None => Err(Error::Runtime("bad file descriptor".to_string())),
        }
    }

    pub fn has_input(&self) -> bool {
        self.buffer.has_input()
    }

    pub fn has_output(&self) -> bool {
        self.buffer.has_output()
    }

    fn socket_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    fn process_line(&mut self, reactor: &mut Reactor, line: &[u8]) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(line);
        let message = match Message::from_text(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    "connection \"{}\" received an invalid message ({text}): {e}",
                    self.state.name()
                );
                return Ok(());
            }
        };
        self.dispatch_message(reactor, &message)
    }

    fn dispatch_message(&mut self, reactor: &mut Reactor, message: &Message) -> Result<()> {
        if let Some(mut dispatcher) = self.dispatcher.take() {
            let result = dispatcher.dispatch(reactor, self, message);
            self.dispatcher = Some(dispatcher);
            result?;
        } else if let Some(mut handler) = self.on_message.take() {
            let result = handler(reactor, self, message);
            self.on_message = Some(handler);
            result?;
        } else {
            tracing::warn!(
                "connection \"{}\" received message \"{}\" but has neither a \
                 dispatcher nor a message handler",
                self.state.name(),
                message.command()
            );
        }
        Ok(())
    }
}

impl<S: Read + Write + AsRawFd> MessageSender for StreamMessageConnection<S> {
    /// Serialize and queue one message; transmission is asynchronous.
    fn send_message(&mut self, message: &Message) -> Result<bool> {
        let mut line = message.to_line()?;
        line.push('\n');
        let len = line.len();
        Ok(self.write_bytes(line.as_bytes())? == len)
    }
}

impl<S: Read + Write + AsRawFd + 'static> Connection for StreamMessageConnection<S> {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.socket_fd()
    }

    fn is_reader(&self) -> bool {
        self.stream.is_some()
    }

    fn is_writer(&self) -> bool {
        self.stream.is_some() && self.buffer.has_output()
    }

    fn has_pending_input(&self) -> bool {
        self.buffer.has_complete_line()
    }

    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let mut lines = Vec::new();
            let outcome = self.buffer.read_lines(
                &mut stream,
                self.state.event_limit(),
                self.state.processing_time_limit(),
                &mut lines,
            );
            self.stream = Some(stream);
            match outcome {
                Ok(_) => {
                    for line in &lines {
                        self.process_line(reactor, line)?;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "error while reading from connection \"{}\": {e}",
                        self.state.name()
                    );
                    return self.process_error(reactor);
                }
            }
        }
        Ok(())
    }

    fn process_write(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let drained = self.buffer.flush_output(&mut stream);
            self.stream = Some(stream);
            match drained {
                Ok(true) => return self.process_empty_buffer(reactor),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "error while writing to connection \"{}\": {e}",
                        self.state.name()
                    );
                    return self.process_error(reactor);
                }
            }
        }
        Ok(())
    }

    fn process_empty_buffer(&mut self, _reactor: &mut Reactor) -> Result<()> {
        if self.state.is_done() {
            // requested shutdown finished flushing; detach
            return Err(Error::Done);
        }
        Ok(())
    }

    fn process_hup(&mut self, _reactor: &mut Reactor) -> Result<()> {
        self.close();
        tracing::debug!("connection \"{}\" hung up, detaching", self.state.name());
        Err(Error::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, ErrorKind};

    /// In-memory bidirectional stub standing in for a socket.
    #[derive(Default)]
    struct FakeSocket {
        incoming: Vec<u8>,
        outgoing: Vec<u8>,
    }

    impl Read for FakeSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.incoming.len());
            buf[..n].copy_from_slice(&self.incoming[..n]);
            self.incoming.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakeSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for FakeSocket {
        fn as_raw_fd(&self) -> RawFd {
            99
        }
    }

    #[test]
    fn test_send_message_appends_newline() {
        let mut conn = StreamMessageConnection::from_stream("t", FakeSocket::default());
        let mut msg = Message::new();
        msg.set_command("PING").unwrap();
        assert!(conn.send_message(&msg).unwrap());
        assert_eq!(conn.stream().unwrap().outgoing, b"PING\n");
    }

    #[test]
    fn test_incoming_line_dispatches() {
        let mut conn = StreamMessageConnection::from_stream("t", FakeSocket::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .add_match(
                "PING",
                Box::new(|_, sender, message| {
                    let mut reply = Message::new();
                    reply.set_command("PONG")?;
                    reply.reply_to(message)?;
                    sender.send_message(&reply)?;
                    Ok(())
                }),
            )
            .unwrap();
        conn.set_dispatcher(dispatcher);

        conn.stream = Some(FakeSocket {
            incoming: b"<srv:svc PING\n".to_vec(),
            outgoing: Vec::new(),
        });
        let mut reactor = Reactor::new();
        conn.process_read(&mut reactor).unwrap();
        let sent = String::from_utf8(conn.stream().unwrap().outgoing.clone()).unwrap();
        assert_eq!(sent, "srv:svc/PONG\n");
    }

    #[test]
    fn test_invalid_line_is_logged_not_fatal() {
        let mut conn = StreamMessageConnection::from_stream("t", FakeSocket::default());
        conn.stream = Some(FakeSocket {
            incoming: b"not a : valid / message ==\nPING\n".to_vec(),
            outgoing: Vec::new(),
        });
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let commands = seen.clone();
        conn.set_message_handler(Box::new(move |_, _, message| {
            commands.borrow_mut().push(message.command().to_string());
            Ok(())
        }));
        let mut reactor = Reactor::new();
        conn.process_read(&mut reactor).unwrap();
        assert_eq!(*seen.borrow(), vec!["PING"]);
    }

    #[test]
    fn test_write_on_closed_connection() {
        let mut conn = StreamMessageConnection::from_stream("t", FakeSocket::default());
        conn.close();
        let mut msg = Message::new();
        msg.set_command("PING").unwrap();
        assert!(matches!(conn.send_message(&msg), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_done_detaches_after_drain() {
        let mut conn = StreamMessageConnection::from_stream("t", FakeSocket::default());
        conn.state_mut().mark_done();
        let mut reactor = Reactor::new();
        assert!(matches!(
            conn.process_empty_buffer(&mut reactor),
            Err(Error::Done)
        ));
    }
}
