// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-process event dispatch.
//!
//! This crate multiplexes heterogeneous connections (TCP and Unix
//! streams, UDP and Unix datagrams, pipes, inter-thread channels, timers,
//! Unix signals, and file watches) onto one readiness-polling
//! [`Reactor`]. Messages are structured records with a compact line
//! encoding and a JSON encoding; incoming messages are routed by command
//! name through a [`Dispatcher`]. The [`TcpPermanentMessageConnection`]
//! adds transparent reconnection with a configurable pause schedule.
//!
//! The reactor is single threaded and cooperative: all callbacks run on
//! the thread calling [`Reactor::run`], and the only suspension point is
//! the `poll(2)` call. The two sanctioned exceptions are the permanent
//! connection's worker thread (bounded to a blocking connect plus a
//! completion signal) and the inter-thread message connection.
//!
//! ```no_run
//! use eventmux::dispatch::Dispatcher;
//! use eventmux::message::Message;
//! use eventmux::reactor::Reactor;
//! use eventmux::tcp::TcpMessageConnection;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! fn main() -> eventmux::Result<()> {
//!     let mut dispatcher = Dispatcher::new();
//!     dispatcher.add_match(
//!         "PING",
//!         Box::new(|_, sender, message| {
//!             let mut reply = Message::new();
//!             reply.set_command("PONG")?;
//!             reply.reply_to(message)?;
//!             sender.send_message(&reply)?;
//!             Ok(())
//!         }),
//!     )?;
//!
//!     let mut connection = TcpMessageConnection::connect("client", "127.0.0.1:4040")?;
//!     connection.set_dispatcher(dispatcher);
//!
//!     let mut reactor = Reactor::new();
//!     reactor.add_connection(Rc::new(RefCell::new(connection)))?;
//!     reactor.run()
//! }
//! ```

pub mod blocking;
pub mod clock;
pub mod connection;
pub mod dgram;
pub mod dispatch;
pub mod error;
mod eventfd;
mod fdutil;
pub mod file_watch;
pub mod inter_thread;
pub mod line_buffer;
pub mod message;
pub mod name;
pub mod pause;
pub mod permanent;
pub mod pipe;
pub mod reactor;
pub mod signal;
pub mod signal_handler;
pub mod stream;
pub mod tcp;
pub mod timer;
pub mod unix_stream;

pub use connection::{Connection, ConnectionState};
pub use dispatch::{Dispatcher, MessageSender};
pub use error::{Error, Result};
pub use message::{Format, Message, MESSAGE_VERSION};
pub use pause::PauseSchedule;
pub use permanent::TcpPermanentMessageConnection;
pub use reactor::{ConnectionRef, Reactor};
