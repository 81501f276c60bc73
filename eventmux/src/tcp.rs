// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP stream connections: client, server, and server-accepted client.

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::fdutil;
use crate::reactor::Reactor;
use crate::stream::StreamMessageConnection;
use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

/// A message connection over TCP.
///
/// Use [`TcpMessageConnection::connect`] for the client shape and
/// [`TcpMessageConnection::from_stream`] (inherited from the generic
/// stream connection) to wrap a socket returned by `accept`.
pub type TcpMessageConnection = StreamMessageConnection<TcpStream>;

impl TcpMessageConnection {
    /// Connect to `address` and switch the socket to non-blocking mode.
    ///
    /// The connect itself is blocking; the permanent message connection
    /// wraps this call in a worker thread when a non-blocking setup is
    /// required.
    pub fn connect(name: &str, address: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| Error::Initialization(format!("could not connect: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("could not make socket non-blocking: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Initialization(format!("could not set TCP_NODELAY: {e}")))?;
        Ok(Self::from_stream(name, stream))
    }
}

pub type AcceptCallback = Box<dyn FnMut(&mut Reactor, TcpStream, SocketAddr) -> Result<()>>;

/// A TCP listener; each accepted socket is handed to the accept callback,
/// which typically wraps it in a [`TcpMessageConnection`] and attaches it
/// to the reactor.
pub struct TcpServerConnection {
    state: ConnectionState,
    listener: TcpListener,
    close_on_exec: bool,
    on_accept: AcceptCallback,
}

impl TcpServerConnection {
    pub fn new(
        name: &str,
        address: impl ToSocketAddrs,
        close_on_exec: bool,
        on_accept: AcceptCallback,
    ) -> Result<Rc<RefCell<Self>>> {
        let listener = TcpListener::bind(address)
            .map_err(|e| Error::Initialization(format!("could not bind and listen: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("could not make listener non-blocking: {e}")))?;
        Ok(Rc::new(RefCell::new(Self {
            state: ConnectionState::new(name),
            listener,
            close_on_exec,
            on_accept,
        })))
    }

    /// Address the listener is bound to; useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Runtime(format!("could not read listener address: {e}")))
    }
}

impl Connection for TcpServerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn process_accept(&mut self, reactor: &mut Reactor) -> Result<()> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true).map_err(|e| {
                    Error::Runtime(format!("could not make accepted socket non-blocking: {e}"))
                })?;
                fdutil::set_cloexec(stream.as_raw_fd(), self.close_on_exec)?;
                tracing::debug!(
                    "connection \"{}\" accepted a client from {peer}",
                    self.state.name()
                );
                (self.on_accept)(reactor, stream, peer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                tracing::error!(
                    "accept() failed on connection \"{}\": {e}",
                    self.state.name()
                );
                self.process_error(reactor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, MessageSender};
    use crate::message::Message;

    #[test]
    fn test_client_connects_to_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpMessageConnection::connect("client", address).unwrap();
        assert!(client.is_connected());
        let (_server_side, _) = listener.accept().unwrap();
    }

    #[test]
    fn test_accept_through_reactor() {
        let accepted = Rc::new(RefCell::new(0));
        let seen = accepted.clone();
        let server = TcpServerConnection::new(
            "server",
            "127.0.0.1:0",
            true,
            Box::new(move |_, _stream, _peer| {
                *seen.borrow_mut() += 1;
                Err(Error::Done) // detach the listener after one accept
            }),
        )
        .unwrap();
        let address = server.borrow().local_addr().unwrap();

        let mut reactor = Reactor::new();
        reactor.add_connection(server.clone()).unwrap();

        let _client = TcpStream::connect(address).unwrap();
        reactor.run().unwrap();
        assert_eq!(*accepted.borrow(), 1);
    }

    #[test]
    fn test_message_round_trip_over_reactor() {
        // server replies PONG to PING; client sends PING and records the
        // answer, then both sides detach
        let server = TcpServerConnection::new(
            "server",
            "127.0.0.1:0",
            true,
            Box::new(move |reactor, stream, _peer| {
                let mut messenger = TcpMessageConnection::from_stream("server-client", stream);
                let mut dispatcher = Dispatcher::new();
                dispatcher.add_match(
                    "PING",
                    Box::new(|_, sender, message| {
                        let mut reply = Message::new();
                        reply.set_command("PONG")?;
                        reply.reply_to(message)?;
                        sender.send_message(&reply)?;
                        Ok(())
                    }),
                )?;
                messenger.set_dispatcher(dispatcher);
                reactor.add_connection(Rc::new(RefCell::new(messenger)))?;
                Ok(())
            }),
        )
        .unwrap();
        let address = server.borrow().local_addr().unwrap();

        let answers = Rc::new(RefCell::new(Vec::new()));
        let mut client = TcpMessageConnection::connect("client", address).unwrap();
        let seen = answers.clone();
        client.set_message_handler(Box::new(move |reactor, _, message| {
            seen.borrow_mut().push(message.command().to_string());
            // tear the whole reactor down: drop every connection
            let all: Vec<_> = reactor.connections().to_vec();
            for connection in all {
                reactor.remove_connection(&connection);
            }
            Ok(())
        }));
        let mut ping = Message::new();
        ping.set_command("PING").unwrap();
        ping.set_sent_from_server("me").unwrap();
        ping.set_sent_from_service("tester").unwrap();

        let client = Rc::new(RefCell::new(client));
        let mut reactor = Reactor::new();
        reactor.add_connection(server).unwrap();
        reactor.add_connection(client.clone()).unwrap();
        client.borrow_mut().send_message(&ping).unwrap();
        reactor.run().unwrap();
        assert_eq!(*answers.borrow(), vec!["PONG"]);
    }
}
