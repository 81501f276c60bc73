// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datagram connections (UDP and Unix) with the optional secret-code
//! envelope.
//!
//! Datagrams carry one message each, capped at [`DATAGRAM_MAX_SIZE`]
//! bytes. A server configured with a secret code drops incoming messages
//! whose `udp_secret` parameter is wrong or missing; a message carrying a
//! secret when none is configured is accepted with a warning.

use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{Dispatcher, Handler, MessageSender};
use crate::error::{Error, Result};
use crate::fdutil;
use crate::message::Message;
use crate::reactor::Reactor;
use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;

use crate::unix_stream::UnixAddress;

/// Maximum size of one datagram, including the `udp_secret` parameter.
pub const DATAGRAM_MAX_SIZE: usize = 1024;

/// Name of the secret-code parameter.
pub const SECRET_CODE_PARAMETER: &str = "udp_secret";

/// Outcome of the secret-code check on one incoming message.
fn secret_code_accepts(message: &Message, expected: &str) -> Result<bool> {
    if message.has_parameter(SECRET_CODE_PARAMETER)? {
        let secret = message.get_parameter(SECRET_CODE_PARAMETER)?;
        if secret != expected {
            if !expected.is_empty() {
                tracing::error!(
                    "incoming message has an unexpected {SECRET_CODE_PARAMETER} code, \
                     message ignored"
                );
                return Ok(false);
            }
            tracing::warn!(
                "no {SECRET_CODE_PARAMETER} parameter was expected in incoming message \
                 (missing secret code settings for this application?)"
            );
        }
        Ok(true)
    } else if !expected.is_empty() {
        tracing::error!(
            "incoming message is missing the expected {SECRET_CODE_PARAMETER} code, \
             message ignored"
        );
        Ok(false)
    } else {
        Ok(true)
    }
}

/// Serialize `message` for a datagram, appending the secret code when one
/// is configured and enforcing the size cap.
fn datagram_payload(message: &Message, secret_code: &str) -> Result<String> {
    let text = if secret_code.is_empty() {
        message.to_line()?
    } else {
        let mut tagged = message.clone();
        tagged.add_parameter(SECRET_CODE_PARAMETER, secret_code)?;
        tagged.to_line()?
    };
    if text.len() > DATAGRAM_MAX_SIZE {
        return Err(Error::InvalidMessage(format!(
            "message too large for a datagram ({} > {DATAGRAM_MAX_SIZE} bytes)",
            text.len()
        )));
    }
    Ok(text)
}

/// A bound UDP endpoint with blocking, polling, and timed receive
/// primitives. Build on it directly or use [`UdpMessageConnection`].
pub struct UdpServerConnection {
    state: ConnectionState,
    socket: UdpSocket,
    secret_code: String,
}

impl UdpServerConnection {
    pub fn new(name: &str, address: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .map_err(|e| Error::Initialization(format!("could not bind UDP socket: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("could not make socket non-blocking: {e}")))?;
        Ok(Self {
            state: ConnectionState::new(name),
            socket,
            secret_code: String::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::Runtime(format!("could not read socket address: {e}")))
    }

    pub fn set_secret_code(&mut self, secret_code: &str) {
        self.secret_code = secret_code.to_string();
    }

    pub fn secret_code(&self) -> &str {
        &self.secret_code
    }

    /// Non-blocking receive; `None` when no datagram is pending.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, peer)) => Ok(Some((n, peer))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Runtime(format!("recvfrom() failed: {e}"))),
        }
    }

    /// Blocking receive.
    pub fn blocking_recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            fdutil::wait_for_input(self.socket.as_raw_fd(), -1)?;
            if let Some(received) = self.recv(buf)? {
                return Ok(received);
            }
        }
    }

    /// Receive with a timeout in microseconds; `None` on timeout.
    pub fn timed_recv(
        &self,
        buf: &mut [u8],
        timeout_usec: i64,
    ) -> Result<Option<(usize, SocketAddr)>> {
        if !fdutil::wait_for_input(self.socket.as_raw_fd(), timeout_usec)? {
            return Ok(None);
        }
        self.recv(buf)
    }
}

impl Connection for UdpServerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }
}

/// A UDP endpoint parsing each datagram as a message and dispatching it.
pub struct UdpMessageConnection {
    server: UdpServerConnection,
    dispatcher: Option<Dispatcher>,
    on_message: Option<Handler>,
    last_peer: Option<SocketAddr>,
}

impl UdpMessageConnection {
    pub fn new(name: &str, address: impl ToSocketAddrs) -> Result<Rc<RefCell<Self>>> {
        Ok(Rc::new(RefCell::new(Self {
            server: UdpServerConnection::new(name, address)?,
            dispatcher: None,
            on_message: None,
            last_peer: None,
        })))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn set_secret_code(&mut self, secret_code: &str) {
        self.server.set_secret_code(secret_code);
    }

    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn set_message_handler(&mut self, handler: Handler) {
        self.on_message = Some(handler);
    }

    /// One-shot send to `address` through an ephemeral socket.
    pub fn send_message_to(
        address: impl ToSocketAddrs,
        message: &Message,
        secret_code: &str,
    ) -> Result<()> {
        let target = address
            .to_socket_addrs()
            .map_err(|e| Error::InvalidParameter(format!("invalid datagram address: {e}")))?
            .next()
            .ok_or_else(|| {
                Error::InvalidParameter("datagram address did not resolve".to_string())
            })?;
        let bind_any = if target.is_ipv4() {
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_any)
            .map_err(|e| Error::Initialization(format!("could not create UDP socket: {e}")))?;
        let payload = datagram_payload(message, secret_code)?;
        let sent = socket
            .send_to(payload.as_bytes(), target)
            .map_err(|e| Error::Runtime(format!("could not send UDP message: {e}")))?;
        if sent != payload.len() {
            return Err(Error::Runtime(format!(
                "short UDP send ({sent} of {} bytes)",
                payload.len()
            )));
        }
        Ok(())
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
                self.server.state.name(),
                message.command()
            );
        }
        Ok(())
    }
}

impl MessageSender for UdpMessageConnection {
    /// Reply to the sender of the most recently received datagram.
    fn send_message(&mut self, message: &Message) -> Result<bool> {
        let Some(peer) = self.last_peer else {
            tracing::warn!(
                "connection \"{}\" has no datagram peer to reply to",
                self.server.state.name()
            );
            return Ok(false);
        };
        let payload = datagram_payload(message, self.server.secret_code())?;
        let sent = self
            .server
            .socket
            .send_to(payload.as_bytes(), peer)
            .map_err(|e| Error::Runtime(format!("could not send UDP message: {e}")))?;
        Ok(sent == payload.len())
    }
}

impl Connection for UdpMessageConnection {
    fn state(&self) -> &ConnectionState {
        &self.server.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.server.state
    }

    fn socket(&self) -> RawFd {
        self.server.socket.as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    /// Read all pending datagrams.
    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_MAX_SIZE];
        loop {
            let (len, peer) = match self.server.recv(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        "error reading datagram on connection \"{}\": {e}",
                        self.server.state.name()
                    );
                    return self.process_error(reactor);
                }
            };
            self.last_peer = Some(peer);
            let text = String::from_utf8_lossy(&buf[..len]).into_owned();
            match Message::from_text(&text) {
                Ok(message) => {
                    if secret_code_accepts(&message, self.server.secret_code())? {
                        self.dispatch_message(reactor, &message)?;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "connection \"{}\" received an invalid datagram message \
                         ({text}): {e}",
                        self.server.state.name()
                    );
                }
            }
        }
    }
}

/// A bound Unix datagram endpoint.
pub struct UnixDgramServerConnection {
    state: ConnectionState,
    socket: UnixDatagram,
    address: UnixAddress,
    secret_code: String,
}

impl UnixDgramServerConnection {
    pub fn new(name: &str, address: UnixAddress) -> Result<Self> {
        let socket = match &address {
            UnixAddress::File(path) => UnixDatagram::bind(path)
                .map_err(|e| Error::Initialization(format!("could not bind to {address}: {e}")))?,
            UnixAddress::Abstract(abstract_name) => {
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(
                    abstract_name.as_bytes(),
                )
                .map_err(|e| {
                    Error::InvalidParameter(format!(
                        "invalid abstract socket name \"{abstract_name}\": {e}"
                    ))
                })?;
                UnixDatagram::bind_addr(&addr).map_err(|e| {
                    Error::Initialization(format!("could not bind to {address}: {e}"))
                })?
            }
            UnixAddress::Unnamed => UnixDatagram::unbound().map_err(|e| {
                Error::Initialization(format!("could not create unbound datagram socket: {e}"))
            })?,
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("could not make socket non-blocking: {e}")))?;
        Ok(Self {
            state: ConnectionState::new(name),
            socket,
            address,
            secret_code: String::new(),
        })
    }

    pub fn set_secret_code(&mut self, secret_code: &str) {
        self.secret_code = secret_code.to_string();
    }

    pub fn secret_code(&self) -> &str {
        &self.secret_code
    }

    /// Non-blocking receive; `None` when no datagram is pending.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Runtime(format!("recv() failed: {e}"))),
        }
    }

    /// Receive with a timeout in microseconds; `None` on timeout.
    pub fn timed_recv(&self, buf: &mut [u8], timeout_usec: i64) -> Result<Option<usize>> {
        if !fdutil::wait_for_input(self.socket.as_raw_fd(), timeout_usec)? {
            return Ok(None);
        }
        self.recv(buf)
    }

    /// One-shot send to `address` through an unbound socket.
    pub fn send_message_to(
        address: &UnixAddress,
        message: &Message,
        secret_code: &str,
    ) -> Result<()> {
        let socket = UnixDatagram::unbound()
            .map_err(|e| Error::Initialization(format!("could not create datagram socket: {e}")))?;
        let payload = datagram_payload(message, secret_code)?;
        let sent = match address {
            UnixAddress::File(path) => socket.send_to(payload.as_bytes(), path),
            UnixAddress::Abstract(abstract_name) => {
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(
                    abstract_name.as_bytes(),
                )
                .map_err(|e| {
                    Error::InvalidParameter(format!(
                        "invalid abstract socket name \"{abstract_name}\": {e}"
                    ))
                })?;
                socket.send_to_addr(payload.as_bytes(), &addr)
            }
            UnixAddress::Unnamed => {
                return Err(Error::InvalidParameter(
                    "cannot send to an unnamed unix address".to_string(),
                ));
            }
        }
        .map_err(|e| Error::Runtime(format!("could not send datagram: {e}")))?;
        if sent != payload.len() {
            return Err(Error::Runtime(format!(
                "short datagram send ({sent} of {} bytes)",
                payload.len()
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> &UnixAddress {
        &self.address
    }
}

impl Drop for UnixDgramServerConnection {
    fn drop(&mut self) {
        if let UnixAddress::File(path) = &self.address {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "could not remove socket file \"{}\": {e}",
                        path.display()
                    );
                }
            }
        }
    }
}

impl Connection for UnixDgramServerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }
}

/// A Unix datagram endpoint parsing each datagram as a message.
pub struct UnixDgramMessageConnection {
    server: UnixDgramServerConnection,
    dispatcher: Option<Dispatcher>,
    on_message: Option<Handler>,
}

impl UnixDgramMessageConnection {
    pub fn new(name: &str, address: UnixAddress) -> Result<Rc<RefCell<Self>>> {
        Ok(Rc::new(RefCell::new(Self {
            server: UnixDgramServerConnection::new(name, address)?,
            dispatcher: None,
            on_message: None,
        })))
    }

    pub fn set_secret_code(&mut self, secret_code: &str) {
        self.server.set_secret_code(secret_code);
    }

    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn set_message_handler(&mut self, handler: Handler) {
        self.on_message = Some(handler);
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
                self.server.state.name(),
                message.command()
            );
        }
        Ok(())
    }
}

impl MessageSender for UnixDgramMessageConnection {
    /// Datagram sockets cannot reply to unnamed peers; messages are
    /// dropped with a warning.
    fn send_message(&mut self, message: &Message) -> Result<bool> {
        tracing::warn!(
            "connection \"{}\" cannot send message \"{}\" (no datagram peer address)",
            self.server.state.name(),
            message.command()
        );
        Ok(false)
    }
}

impl Connection for UnixDgramMessageConnection {
    fn state(&self) -> &ConnectionState {
        &self.server.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.server.state
    }

    fn socket(&self) -> RawFd {
        self.server.socket.as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    /// Read all pending datagrams.
    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_MAX_SIZE];
        loop {
            let len = match self.server.recv(&mut buf) {
                Ok(Some(len)) => len,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        "error reading datagram on connection \"{}\": {e}",
                        self.server.state.name()
                    );
                    return self.process_error(reactor);
                }
            };
            let text = String::from_utf8_lossy(&buf[..len]).into_owned();
            match Message::from_text(&text) {
                Ok(message) => {
                    if secret_code_accepts(&message, self.server.secret_code())? {
                        self.dispatch_message(reactor, &message)?;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "connection \"{}\" received an invalid datagram message \
                         ({text}): {e}",
                        self.server.state.name()
                    );
                }
            }
        }
    }
}
