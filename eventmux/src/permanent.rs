// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The permanent message connection: a TCP messenger that transparently
//! reconnects.
//!
//! The connection itself is a timer; its ticks drive connection attempts
//! paced by a [`PauseSchedule`]. An attempt either runs inline (blocking
//! the loop briefly) or on a worker thread. The worker is strictly bounded
//! to the blocking `connect` plus a completion post on an eventfd; the
//! reactor observes the eventfd through a small helper connection, joins
//! the thread, and only then touches the result. On success the connected
//! socket becomes a child messenger connection and any cached messages are
//! flushed in order; on failure the timer re-arms with the next pause.
//! When the schedule is exhausted the connection transitions to its
//! terminal Done state and never re-arms.

use crate::clock;
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{Dispatcher, Handler, MessageSender};
use crate::error::{Error, Result};
use crate::eventfd::EventFd;
use crate::line_buffer::LineBuffer;
use crate::message::Message;
use crate::pause::PauseSchedule;
use crate::reactor::{ConnectionRef, Reactor};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type ConnectResult = std::result::Result<TcpStream, String>;

pub type ConnectedCallback = Box<dyn FnMut(&mut Reactor) -> Result<()>>;
pub type ConnectionFailedCallback = Box<dyn FnMut(&mut Reactor, &str) -> Result<()>>;

pub struct TcpPermanentMessageConnection {
    state: ConnectionState,
    address: String,
    use_thread: bool,
    pauses: PauseSchedule,
    cache: VecDeque<Message>,
    messenger: Option<Rc<RefCell<PermanentMessenger>>>,
    worker: Option<JoinHandle<()>>,
    connect_result: Arc<Mutex<Option<ConnectResult>>>,
    thread_done: Option<Rc<RefCell<ThreadDoneSignal>>>,
    connecting: bool,
    dispatcher: Option<Dispatcher>,
    on_message: Option<Handler>,
    on_connected: Option<ConnectedCallback>,
    on_connection_failed: Option<ConnectionFailedCallback>,
    weak_self: Weak<RefCell<Self>>,
}

impl TcpPermanentMessageConnection {
    /// Create the connection; the first attempt happens when the reactor
    /// loop runs (immediately, or after the schedule's initial delay).
    pub fn new(
        name: &str,
        address: &str,
        pauses: PauseSchedule,
        use_thread: bool,
    ) -> Result<Rc<RefCell<Self>>> {
        let mut state = ConnectionState::new(name);
        let initial_usec = (pauses.initial_delay() * 1_000_000.0) as i64;
        state.set_timeout_date(clock::now_usec()? + initial_usec)?;

        let connection = Rc::new(RefCell::new(Self {
            state,
            address: address.to_string(),
            use_thread,
            pauses,
            cache: VecDeque::new(),
            messenger: None,
            worker: None,
            connect_result: Arc::new(Mutex::new(None)),
            thread_done: None,
            connecting: false,
            dispatcher: None,
            on_message: None,
            on_connected: None,
            on_connection_failed: None,
            weak_self: Weak::new(),
        }));
        connection.borrow_mut().weak_self = Rc::downgrade(&connection);
        Ok(connection)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn set_message_handler(&mut self, handler: Handler) {
        self.on_message = Some(handler);
    }

    /// Called once a connection attempt succeeded and the messenger is
    /// installed; typical place for a REGISTER style handshake.
    pub fn set_connected_callback(&mut self, callback: ConnectedCallback) {
        self.on_connected = Some(callback);
    }

    pub fn set_connection_failed_callback(&mut self, callback: ConnectionFailedCallback) {
        self.on_connection_failed = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.messenger.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Number of messages waiting for the next successful connection.
    pub fn cached_messages(&self) -> usize {
        self.cache.len()
    }

    /// Send a message now, or cache it for the next connection when
    /// `cache` is set. Returns `false` when the message was cached or
    /// dropped.
    pub fn send_message(&mut self, message: &Message, cache: bool) -> Result<bool> {
        if let Some(messenger) = &self.messenger {
            return messenger.borrow_mut().send_message(message);
        }
        if cache && !self.state.is_done() {
            self.cache.push_back(message.clone());
        }
        Ok(false)
    }

    /// Detach the child messenger without entering Done; the timer re-arms
    /// so the connection comes back.
    pub fn disconnect(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(messenger) = self.messenger.take() {
            let connection: ConnectionRef = messenger;
            reactor.remove_connection(&connection);
        }
        if !self.state.is_done() {
            self.re_arm()?;
        }
        Ok(())
    }

    /// Enter the terminal Done state: the cache is dropped and no further
    /// connection attempt is made. With `drain_messenger` the child
    /// finishes flushing its output and then detaches; otherwise it is up
    /// to the caller to disconnect.
    pub fn mark_done(&mut self, reactor: &mut Reactor, drain_messenger: bool) {
        self.state.mark_done();
        self.state.set_enable(false);
        let _ = self.state.set_timeout_date(-1);
        self.cache.clear();
        if drain_messenger {
            let drained = match &self.messenger {
                Some(messenger) => {
                    let mut messenger = messenger.borrow_mut();
                    messenger.state_mut().mark_done();
                    !messenger.buffer.has_output()
                }
                None => false,
            };
            if drained {
                // nothing left to flush; detach the child right away
                if let Some(messenger) = self.messenger.take() {
                    let connection: ConnectionRef = messenger;
                    reactor.remove_connection(&connection);
                }
            }
        }
    }

    fn attempt_connect(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.use_thread {
            self.background_connect(reactor)
        } else {
            let result = TcpStream::connect(&self.address).map_err(|e| e.to_string());
            if let Ok(mut slot) = self.connect_result.lock() {
                *slot = Some(result);
            }
            self.finish_connect(reactor)
        }
    }

    fn background_connect(&mut self, reactor: &mut Reactor) -> Result<()> {
        let efd = Arc::new(EventFd::new_semaphore()?);
        let signal = Rc::new(RefCell::new(ThreadDoneSignal {
            state: ConnectionState::new(&format!("{}-thread-done", self.state.name())),
            efd: efd.clone(),
            parent: self.weak_self.clone(),
        }));
        reactor.add_connection(signal.clone())?;

        let address = self.address.clone();
        let slot = self.connect_result.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-connect", self.state.name()))
            .spawn(move || {
                let result = TcpStream::connect(&address).map_err(|e| e.to_string());
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(result);
                }
                // wake the reactor; the parent joins us before reading
                let _ = efd.post(1);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.thread_done = Some(signal);
                self.connecting = true;
                // no ticks while the thread owns the attempt
                self.state.set_enable(false);
                Ok(())
            }
            Err(e) => {
                let connection: ConnectionRef = signal;
                reactor.remove_connection(&connection);
                tracing::error!(
                    "the thread for the background connection attempt did not start: {e}"
                );
                self.re_arm()
            }
        }
    }

    /// Consume the connect attempt's result; shared by the inline path and
    /// the thread-done signal.
    fn finish_connect(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(signal) = self.thread_done.take() {
            let connection: ConnectionRef = signal;
            reactor.remove_connection(&connection);
        }
        self.connecting = false;
        if let Some(worker) = self.worker.take() {
            // join forces the memory barrier before the result is read
            let _ = worker.join();
        }
        let result = self.connect_result.lock().ok().and_then(|mut slot| slot.take());

        if self.state.is_done() {
            // marked done while connecting; drop the socket if any
            return Ok(());
        }

        match result {
            Some(Ok(stream)) => self.install_messenger(reactor, stream),
            other => {
                let error = match other {
                    Some(Err(error)) => error,
                    _ => "connection attempt produced no result".to_string(),
                };
                tracing::error!("connection to {} failed with: {error}", self.address);
                if let Some(mut callback) = self.on_connection_failed.take() {
                    let result = callback(reactor, &error);
                    self.on_connection_failed = Some(callback);
                    result?;
                }
                self.re_arm()
            }
        }
    }

    fn install_messenger(&mut self, reactor: &mut Reactor, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(true).map_err(|e| {
            Error::Initialization(format!("could not make socket non-blocking: {e}"))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Initialization(format!("could not set TCP_NODELAY: {e}")))?;

        let messenger = Rc::new(RefCell::new(PermanentMessenger {
            state: ConnectionState::new(&format!("{}-messenger", self.state.name())),
            stream: Some(stream),
            buffer: LineBuffer::new(),
            parent: self.weak_self.clone(),
        }));
        reactor.add_connection(messenger.clone())?;
        self.messenger = Some(messenger);

        // flush the cache in order before the user can send anything new
        while let Some(message) = self.cache.pop_front() {
            if let Some(messenger) = &self.messenger {
                messenger.borrow_mut().send_message(&message)?;
            }
        }

        // a later drop of this connection starts the schedule over
        self.pauses.restart();
        self.state.set_enable(false);
        self.state.set_timeout_date(-1)?;

        if let Some(mut callback) = self.on_connected.take() {
            let result = callback(reactor);
            self.on_connected = Some(callback);
            result?;
        }
        Ok(())
    }

    /// Schedule the next attempt, or transition to Done when the schedule
    /// has run out.
    fn re_arm(&mut self) -> Result<()> {
        let delay = self.pauses.next_delay();
        if delay < 0.0 {
            tracing::error!(
                "permanent connection \"{}\" exhausted its reconnect pauses, \
                 no further attempts will be made",
                self.state.name()
            );
            self.state.mark_done();
            self.state.set_enable(false);
            self.state.set_timeout_date(-1)?;
            self.cache.clear();
            return Ok(());
        }
        self.state
            .set_timeout_date(clock::now_usec()? + (delay * 1_000_000.0) as i64)?;
        self.state.set_enable(true);
        Ok(())
    }

    /// The child messenger reported an error, a hang up, or an invalid
    /// descriptor.
    fn messenger_failed(&mut self, reactor: &mut Reactor) -> Result<()> {
        if let Some(messenger) = self.messenger.take() {
            let connection: ConnectionRef = messenger;
            reactor.remove_connection(&connection);
        }
        if self.state.is_done() {
            return Ok(());
        }
        self.re_arm()
    }

    /// The child messenger was detached by the reactor on its own.
    fn forget_messenger(&mut self) {
        self.messenger = None;
    }
}

impl Connection for TcpPermanentMessageConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn process_timeout(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.state.is_done() {
            // spurious tick after mark_done
            return Ok(());
        }
        if self.messenger.is_some() || self.connecting {
            return Ok(());
        }
        self.attempt_connect(reactor)
    }

    fn connection_removed(&mut self, reactor: &mut Reactor) {
        // the child and the rendezvous helper must not outlive us in the
        // reactor
        if let Some(messenger) = self.messenger.take() {
            let connection: ConnectionRef = messenger;
            reactor.remove_connection(&connection);
        }
        if let Some(signal) = self.thread_done.take() {
            let connection: ConnectionRef = signal;
            reactor.remove_connection(&connection);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The reactor-registered eventfd the worker thread posts to when its
/// connect attempt finished.
struct ThreadDoneSignal {
    state: ConnectionState,
    efd: Arc<EventFd>,
    parent: Weak<RefCell<TcpPermanentMessageConnection>>,
}

impl Connection for ThreadDoneSignal {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.efd.as_raw_fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.efd.take()?;
        match self.parent.upgrade() {
            Some(parent) => parent.borrow_mut().finish_connect(reactor),
            None => Err(Error::Done),
        }
    }
}

/// The child connection carrying the actual message traffic.
struct PermanentMessenger {
    state: ConnectionState,
    stream: Option<TcpStream>,
    buffer: LineBuffer,
    parent: Weak<RefCell<TcpPermanentMessageConnection>>,
}

impl PermanentMessenger {
    fn close(&mut self) {
        self.stream = None;
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

        // the dispatcher lives on the parent; borrow it for the duration
        // of this one dispatch
        let Some(parent) = self.parent.upgrade() else {
            tracing::warn!(
                "connection \"{}\" received a message but its permanent \
                 connection is gone",
                self.state.name()
            );
            return Ok(());
        };
        let (mut dispatcher, mut handler) = {
            let mut parent = parent.borrow_mut();
            (parent.dispatcher.take(), parent.on_message.take())
        };
        let result = if let Some(dispatcher) = dispatcher.as_mut() {
            dispatcher.dispatch(reactor, self, &message).map(|_| ())
        } else if let Some(handler) = handler.as_mut() {
            handler(reactor, self, &message)
        } else {
            tracing::warn!(
                "connection \"{}\" received message \"{}\" but has neither a \
                 dispatcher nor a message handler",
                self.state.name(),
                message.command()
            );
            Ok(())
        };
        {
            let mut parent = parent.borrow_mut();
            if parent.dispatcher.is_none() {
                parent.dispatcher = dispatcher;
            }
            if parent.on_message.is_none() {
                parent.on_message = handler;
            }
        }
        result
    }

    fn parent_failed(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.close();
        if let Some(parent) = self.parent.upgrade() {
            parent.borrow_mut().messenger_failed(reactor)?;
        }
        Err(Error::Done)
    }
}

impl MessageSender for PermanentMessenger {
    fn send_message(&mut self, message: &Message) -> Result<bool> {
        let mut line = message.to_line()?;
        line.push('\n');
        match self.stream.as_mut() {
            Some(stream) => {
                let len = line.len();
                Ok(self.buffer.write(stream, line.as_bytes())? == len)
            }
            None => Err(Error::Runtime("bad file descriptor".to_string())),
        }
    }
}

impl Connection for PermanentMessenger {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
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
            return Err(Error::Done);
        }
        Ok(())
    }

    fn process_error(&mut self, reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" reported an error, reconnecting",
            self.state.name()
        );
        self.parent_failed(reactor)
    }

    fn process_hup(&mut self, reactor: &mut Reactor) -> Result<()> {
        tracing::debug!("connection \"{}\" hung up, reconnecting", self.state.name());
        self.parent_failed(reactor)
    }

    fn process_invalid(&mut self, reactor: &mut Reactor) -> Result<()> {
        tracing::error!(
            "connection \"{}\" has an invalid descriptor, reconnecting",
            self.state.name()
        );
        self.parent_failed(reactor)
    }

    fn connection_removed(&mut self, _reactor: &mut Reactor) {
        // when the parent initiated the removal it is borrowed right now
        // and has already dropped its handle; otherwise tell it we are gone
        if let Some(parent) = self.parent.upgrade() {
            if let Ok(mut parent) = parent.try_borrow_mut() {
                parent.forget_messenger();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerConnection;

    /// A watchdog that stops the reactor once `predicate` returns true.
    fn watchdog(
        reactor: &mut Reactor,
        predicate: Box<dyn Fn() -> bool>,
    ) -> Rc<RefCell<TimerConnection>> {
        let timer = TimerConnection::new(
            "watchdog",
            10_000,
            Box::new(move |reactor, _| {
                if predicate() {
                    let all: Vec<_> = reactor.connections().to_vec();
                    for connection in all {
                        reactor.remove_connection(&connection);
                    }
                }
                Ok(())
            }),
        )
        .unwrap();
        reactor.add_connection(timer.clone()).unwrap();
        timer
    }

    fn refused_address() -> String {
        // bind a listener to grab a free port, then close it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        address.to_string()
    }

    #[test]
    fn test_exhausted_schedule_transitions_to_done() {
        let pauses = PauseSchedule::parse("0.02,0.04,0.08").unwrap();
        let failures = Rc::new(RefCell::new(0));
        let connection = TcpPermanentMessageConnection::new(
            "permanent",
            &refused_address(),
            pauses,
            false,
        )
        .unwrap();
        let seen = failures.clone();
        connection
            .borrow_mut()
            .set_connection_failed_callback(Box::new(move |_, _| {
                *seen.borrow_mut() += 1;
                Ok(())
            }));

        let mut reactor = Reactor::new();
        reactor.add_connection(connection.clone()).unwrap();
        let probe = connection.clone();
        watchdog(&mut reactor, Box::new(move || probe.borrow().is_done()));
        reactor.run().unwrap();

        // 3 pauses: attempts at 0, +0.02, +0.06, +0.14, then done
        assert_eq!(*failures.borrow(), 4);
        assert!(connection.borrow().is_done());

        // after Done, sends are dropped and nothing is cached
        let mut msg = Message::new();
        msg.set_command("LATE").unwrap();
        assert!(!connection.borrow_mut().send_message(&msg, true).unwrap());
        assert_eq!(connection.borrow().cached_messages(), 0);
    }

    #[test]
    fn test_cache_drains_in_order_on_connect() {
        use crate::tcp::{TcpMessageConnection, TcpServerConnection};

        let received = Rc::new(RefCell::new(Vec::new()));
        let seen = received.clone();
        let server = TcpServerConnection::new(
            "server",
            "127.0.0.1:0",
            true,
            Box::new(move |reactor, stream, _peer| {
                let mut messenger = TcpMessageConnection::from_stream("server-client", stream);
                let seen = seen.clone();
                messenger.set_message_handler(Box::new(move |_, _, message| {
                    seen.borrow_mut()
                        .push(message.get_integer_parameter("sequence")?);
                    Ok(())
                }));
                reactor.add_connection(Rc::new(RefCell::new(messenger)))?;
                Ok(())
            }),
        )
        .unwrap();
        let address = server.borrow().local_addr().unwrap().to_string();

        let pauses = PauseSchedule::parse("1").unwrap();
        let connection =
            TcpPermanentMessageConnection::new("permanent", &address, pauses, true).unwrap();

        // cache three messages while disconnected
        for sequence in 0..3 {
            let mut msg = Message::new();
            msg.set_command("SEQ").unwrap();
            msg.add_parameter("sequence", sequence).unwrap();
            assert!(!connection.borrow_mut().send_message(&msg, true).unwrap());
        }
        assert_eq!(connection.borrow().cached_messages(), 3);

        let mut reactor = Reactor::new();
        reactor.add_connection(server).unwrap();
        reactor.add_connection(connection.clone()).unwrap();
        let probe = received.clone();
        watchdog(&mut reactor, Box::new(move || probe.borrow().len() >= 3));
        reactor.run().unwrap();

        assert_eq!(*received.borrow(), vec![0, 1, 2]);
        assert_eq!(connection.borrow().cached_messages(), 0);
    }

    #[test]
    fn test_disconnect_re_arms_timer() {
        let pauses = PauseSchedule::parse("0.02,0.02,0.02,0.02,0.02").unwrap();
        let connection = TcpPermanentMessageConnection::new(
            "permanent",
            &refused_address(),
            pauses,
            false,
        )
        .unwrap();
        let attempts = Rc::new(RefCell::new(0));
        let seen = attempts.clone();
        connection
            .borrow_mut()
            .set_connection_failed_callback(Box::new(move |_, _| {
                *seen.borrow_mut() += 1;
                Ok(())
            }));

        let mut reactor = Reactor::new();
        reactor.add_connection(connection.clone()).unwrap();
        let probe = attempts.clone();
        watchdog(&mut reactor, Box::new(move || *probe.borrow() >= 2));
        reactor.run().unwrap();
        assert!(*attempts.borrow() >= 2);
        assert!(!connection.borrow().is_done());
    }
}
