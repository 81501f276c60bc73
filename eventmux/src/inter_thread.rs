// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread message queues driven by eventfd semaphores.
//!
//! The connection is created by "side A" (the thread owning the reactor).
//! Each side has its own eventfd counter and FIFO: sending from side A
//! pushes to side B's FIFO and increments side B's counter by one; a read
//! on side B decrements once and pops one message. The FIFO length always
//! matches the counter. The mutex-guarded queues are the only shared
//! synchronized state in the library.

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::eventfd::EventFd;
use crate::fdutil;
use crate::message::Message;
use crate::reactor::Reactor;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

#[derive(Debug)]
struct Shared {
    creator: ThreadId,
    /// Counter and FIFO read by side A (the creator).
    eventfd_a: EventFd,
    fifo_a: Mutex<VecDeque<Message>>,
    /// Counter and FIFO read by side B.
    eventfd_b: EventFd,
    fifo_b: Mutex<VecDeque<Message>>,
}

impl Shared {
    fn send_to_side(&self, to_creator: bool, message: &Message) -> Result<bool> {
        let (fifo, eventfd) = if to_creator {
            (&self.fifo_a, &self.eventfd_a)
        } else {
            (&self.fifo_b, &self.eventfd_b)
        };
        fifo.lock()
            .map_err(|_| Error::Runtime("inter-thread queue mutex poisoned".to_string()))?
            .push_back(message.clone());
        eventfd.post(1)?;
        Ok(true)
    }

    fn pop_from_side(&self, from_creator: bool) -> Result<Option<Message>> {
        let (fifo, eventfd) = if from_creator {
            (&self.fifo_a, &self.eventfd_a)
        } else {
            (&self.fifo_b, &self.eventfd_b)
        };
        if eventfd.take()?.is_none() {
            return Ok(None);
        }
        Ok(fifo
            .lock()
            .map_err(|_| Error::Runtime("inter-thread queue mutex poisoned".to_string()))?
            .pop_front())
    }
}

pub type InterThreadCallback = Box<dyn FnMut(&mut Reactor, Message) -> Result<()>>;

/// The reactor-facing side of the channel.
///
/// Which eventfd the connection polls depends on the calling thread: the
/// creating thread reads side A, any other thread side B. The non-reactor
/// thread usually holds an [`InterThreadSender`] instead.
pub struct InterThreadMessageConnection {
    state: ConnectionState,
    shared: Arc<Shared>,
    on_message_a: Option<InterThreadCallback>,
    on_message_b: Option<InterThreadCallback>,
}

impl InterThreadMessageConnection {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            state: ConnectionState::new(name),
            shared: Arc::new(Shared {
                creator: std::thread::current().id(),
                eventfd_a: EventFd::new_semaphore()?,
                fifo_a: Mutex::new(VecDeque::new()),
                eventfd_b: EventFd::new_semaphore()?,
                fifo_b: Mutex::new(VecDeque::new()),
            }),
            on_message_a: None,
            on_message_b: None,
        })
    }

    /// Callback for messages arriving on the creator side.
    pub fn set_creator_callback(&mut self, callback: InterThreadCallback) {
        self.on_message_a = Some(callback);
    }

    /// Callback for messages arriving on the peer side.
    pub fn set_peer_callback(&mut self, callback: InterThreadCallback) {
        self.on_message_b = Some(callback);
    }

    fn on_creator_side(&self) -> bool {
        std::thread::current().id() == self.shared.creator
    }

    /// Send a message to the other side.
    pub fn send_message(&self, message: &Message) -> Result<bool> {
        // the creator posts to side B and vice versa
        self.shared.send_to_side(!self.on_creator_side(), message)
    }

    /// A `Send` handle for the peer thread.
    pub fn sender(&self) -> InterThreadSender {
        InterThreadSender {
            shared: self.shared.clone(),
        }
    }
}

impl Connection for InterThreadMessageConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        if self.on_creator_side() {
            self.shared.eventfd_a.as_raw_fd()
        } else {
            self.shared.eventfd_b.as_raw_fd()
        }
    }

    fn is_reader(&self) -> bool {
        true
    }

    /// Take one count off this side's semaphore and process one message.
    fn process_read(&mut self, reactor: &mut Reactor) -> Result<()> {
        let creator_side = self.on_creator_side();
        let message = self.shared.pop_from_side(creator_side)?;
        let Some(message) = message else {
            return Ok(());
        };
        let slot = if creator_side {
            &mut self.on_message_a
        } else {
            &mut self.on_message_b
        };
        if let Some(mut callback) = slot.take() {
            let result = callback(reactor, message);
            let slot = if creator_side {
                &mut self.on_message_a
            } else {
                &mut self.on_message_b
            };
            *slot = Some(callback);
            return result;
        }
        tracing::warn!(
            "inter-thread connection \"{}\" received a message but has no callback \
             for this side",
            self.state.name()
        );
        Ok(())
    }
}

/// Cloneable, `Send` handle used by the thread that does not run the
/// reactor.
#[derive(Clone)]
pub struct InterThreadSender {
    shared: Arc<Shared>,
}

impl InterThreadSender {
    fn on_creator_side(&self) -> bool {
        std::thread::current().id() == self.shared.creator
    }

    /// Send a message to the other side.
    pub fn send_message(&self, message: &Message) -> Result<bool> {
        self.shared.send_to_side(!self.on_creator_side(), message)
    }

    /// Wait up to `timeout_usec` microseconds (-1 blocks) for a message
    /// addressed to this side; used by worker threads that have no
    /// reactor of their own.
    pub fn poll_for_message(&self, timeout_usec: i64) -> Result<Option<Message>> {
        let creator_side = self.on_creator_side();
        let eventfd = if creator_side {
            &self.shared.eventfd_a
        } else {
            &self.shared.eventfd_b
        };
        if !fdutil::wait_for_input(eventfd.as_raw_fd(), timeout_usec)? {
            return Ok(None);
        }
        self.shared.pop_from_side(creator_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_message(command: &str, sequence: i64) -> Message {
        let mut msg = Message::new();
        msg.set_command(command).unwrap();
        msg.add_parameter("sequence", sequence).unwrap();
        msg
    }

    #[test]
    fn test_worker_to_reactor_in_order() {
        let mut connection = InterThreadMessageConnection::new("channel").unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let seen = received.clone();
        connection.set_creator_callback(Box::new(move |reactor, message| {
            let sequence = message.get_integer_parameter("sequence")?;
            seen.borrow_mut().push(sequence);
            if sequence == 9 {
                let all: Vec<_> = reactor.connections().to_vec();
                for c in all {
                    reactor.remove_connection(&c);
                }
            }
            Ok(())
        }));
        let sender = connection.sender();

        let worker = std::thread::spawn(move || {
            for sequence in 0..10 {
                sender.send_message(&make_message("TICK", sequence)).unwrap();
            }
        });

        let mut reactor = Reactor::new();
        reactor
            .add_connection(Rc::new(RefCell::new(connection)))
            .unwrap();
        reactor.run().unwrap();
        worker.join().unwrap();
        assert_eq!(*received.borrow(), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_reactor_to_worker_poll() {
        let connection = InterThreadMessageConnection::new("channel").unwrap();
        let sender = connection.sender();

        let worker = std::thread::spawn(move || {
            let message = sender
                .poll_for_message(2_000_000)
                .unwrap()
                .expect("message should arrive");
            message.command().to_string()
        });

        connection.send_message(&make_message("WORK", 1)).unwrap();
        assert_eq!(worker.join().unwrap(), "WORK");
    }

    #[test]
    fn test_poll_timeout() {
        let connection = InterThreadMessageConnection::new("channel").unwrap();
        let sender = connection.sender();
        let worker = std::thread::spawn(move || sender.poll_for_message(20_000).unwrap());
        assert!(worker.join().unwrap().is_none());
    }

    #[test]
    fn test_one_event_per_message() {
        // the eventfd counter matches the queue length one to one
        let mut connection = InterThreadMessageConnection::new("channel").unwrap();
        let count = Rc::new(RefCell::new(0));
        let seen = count.clone();
        connection.set_creator_callback(Box::new(move |_, _| {
            *seen.borrow_mut() += 1;
            Ok(())
        }));
        let sender = connection.sender();
        std::thread::spawn(move || {
            sender.send_message(&make_message("A", 0)).unwrap();
            sender.send_message(&make_message("B", 1)).unwrap();
        })
        .join()
        .unwrap();

        let mut reactor = Reactor::new();
        connection.process_read(&mut reactor).unwrap();
        assert_eq!(*count.borrow(), 1);
        connection.process_read(&mut reactor).unwrap();
        assert_eq!(*count.borrow(), 2);
        // drained: a further read is a no-op
        connection.process_read(&mut reactor).unwrap();
        assert_eq!(*count.borrow(), 2);
    }
}
