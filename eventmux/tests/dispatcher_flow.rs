// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end dispatcher behavior over a real TCP connection: first match
//! wins, and an unmatched command comes back as UNKNOWN carrying the
//! original command name.

use eventmux::dispatch::{Dispatcher, MessageSender};
use eventmux::message::Message;
use eventmux::reactor::Reactor;
use eventmux::tcp::{TcpMessageConnection, TcpServerConnection};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_dispatcher_fall_through_over_tcp() {
    let server = TcpServerConnection::new(
        "server",
        "127.0.0.1:0",
        true,
        Box::new(|reactor, stream, _peer| {
            let mut messenger = TcpMessageConnection::from_stream("server-client", stream);
            let mut dispatcher = Dispatcher::new();
            dispatcher.add_match(
                "PING",
                Box::new(|_, sender, message| {
                    let mut reply = Message::new();
                    reply.set_command("PINGED")?;
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

    let replies: Rc<RefCell<Vec<(String, Option<String>)>>> = Rc::new(RefCell::new(Vec::new()));
    let mut client = TcpMessageConnection::connect("client", address).unwrap();
    let seen = replies.clone();
    client.set_message_handler(Box::new(move |reactor, _, message| {
        let command_parameter = if message.has_parameter("command")? {
            Some(message.get_parameter("command")?)
        } else {
            None
        };
        seen.borrow_mut()
            .push((message.command().to_string(), command_parameter));
        if seen.borrow().len() == 2 {
            let all: Vec<_> = reactor.connections().to_vec();
            for connection in all {
                reactor.remove_connection(&connection);
            }
        }
        Ok(())
    }));

    let mut ping = Message::new();
    ping.set_command("PING").unwrap();
    ping.set_sent_from_server("clienthost").unwrap();
    ping.set_sent_from_service("tester").unwrap();
    let mut pong = Message::new();
    pong.set_command("PONG").unwrap();
    pong.set_sent_from_server("clienthost").unwrap();
    pong.set_sent_from_service("tester").unwrap();

    let client = Rc::new(RefCell::new(client));
    let mut reactor = Reactor::new();
    reactor.add_connection(server).unwrap();
    reactor.add_connection(client.clone()).unwrap();
    client.borrow_mut().send_message(&ping).unwrap();
    client.borrow_mut().send_message(&pong).unwrap();
    reactor.run().unwrap();

    let replies = replies.borrow();
    assert_eq!(replies.len(), 2);
    // the matched command ran its handler, not the catch-all
    assert_eq!(replies[0].0, "PINGED");
    assert_eq!(replies[0].1, None);
    // the unmatched command came back as UNKNOWN with the original name
    assert_eq!(replies[1].0, "UNKNOWN");
    assert_eq!(replies[1].1.as_deref(), Some("PONG"));
}
