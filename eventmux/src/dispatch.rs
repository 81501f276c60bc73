// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command dispatching.
//!
//! A [`Dispatcher`] is an ordered table of match entries. Each incoming
//! message is offered to the entries in declaration order and the first
//! match wins. When nothing matches, an `UNKNOWN` reply carrying the
//! unmatched command is sent back through the connection.

use crate::error::Result;
use crate::message::Message;
use crate::name::verify_name;
use crate::reactor::Reactor;

/// Implemented by connections able to send a [`Message`] to their peer.
pub trait MessageSender {
    /// Send a message; returns `false` when the message was cached or
    /// dropped instead of being handed to the transport.
    fn send_message(&mut self, message: &Message) -> Result<bool>;
}

/// Handler invoked for a matched message.
pub type Handler = Box<dyn FnMut(&mut Reactor, &mut dyn MessageSender, &Message) -> Result<()>>;

/// Predicate deciding whether an entry matches a command name.
pub type MatchPredicate = Box<dyn Fn(&str) -> bool>;

enum MatchRule {
    /// Exact command name.
    Command(String),
    /// Caller supplied predicate over the command name.
    Predicate(MatchPredicate),
    /// Matches everything; useful as an explicit catch-all.
    Always,
}

struct Entry {
    rule: MatchRule,
    handler: Handler,
}

/// Ordered command-to-handler routing table.
///
/// The table is meant to be fully built before it is installed on a
/// connection; entries cannot be removed.
#[derive(Default)]
pub struct Dispatcher {
    entries: Vec<Entry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages whose command equals `command` to `handler`.
    pub fn add_match(&mut self, command: &str, handler: Handler) -> Result<()> {
        verify_name(command, false, false)?;
        self.entries.push(Entry {
            rule: MatchRule::Command(command.to_string()),
            handler,
        });
        Ok(())
    }

    /// Route messages accepted by `predicate` to `handler`.
    pub fn add_predicate(&mut self, predicate: MatchPredicate, handler: Handler) {
        self.entries.push(Entry {
            rule: MatchRule::Predicate(predicate),
            handler,
        });
    }

    /// Route every message to `handler`; placed last this becomes the
    /// catch-all.
    pub fn add_always(&mut self, handler: Handler) {
        self.entries.push(Entry {
            rule: MatchRule::Always,
            handler,
        });
    }

    /// Literal command names of all exact-match entries, for COMMANDS
    /// style introspection replies.
    pub fn commands(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match &e.rule {
                MatchRule::Command(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Dispatch one message; returns `true` when a handler ran.
    ///
    /// When no entry matches, an `UNKNOWN` reply with a `command` parameter
    /// equal to the unmatched command is sent back through `sender`.
    pub fn dispatch(
        &mut self,
        reactor: &mut Reactor,
        sender: &mut dyn MessageSender,
        message: &Message,
    ) -> Result<bool> {
        for entry in &mut self.entries {
            let matched = match &entry.rule {
                MatchRule::Command(name) => name == message.command(),
                MatchRule::Predicate(predicate) => predicate(message.command()),
                MatchRule::Always => true,
            };
            if matched {
                (entry.handler)(reactor, sender, message)?;
                return Ok(true);
            }
        }

        tracing::warn!(
            "unknown command \"{}\" in message, replying with UNKNOWN",
            message.command()
        );
        let mut reply = Message::new();
        reply.set_command("UNKNOWN")?;
        reply.add_parameter("command", message.command())?;
        reply.reply_to(message)?;
        sender.send_message(&reply)?;
        Ok(false)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingSender {
        sent: Vec<Message>,
    }

    impl MessageSender for RecordingSender {
        fn send_message(&mut self, message: &Message) -> Result<bool> {
            self.sent.push(message.clone());
            Ok(true)
        }
    }

    fn incoming(command: &str) -> Message {
        let mut msg = Message::new();
        msg.set_sent_from_server("peer").unwrap();
        msg.set_sent_from_service("svc").unwrap();
        msg.set_command(command).unwrap();
        msg
    }

    #[test]
    fn test_first_match_wins() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let h = hits.clone();
        dispatcher
            .add_match(
                "PING",
                Box::new(move |_, _, _| {
                    h.borrow_mut().push("ping");
                    Ok(())
                }),
            )
            .unwrap();
        let h = hits.clone();
        dispatcher.add_always(Box::new(move |_, _, _| {
            h.borrow_mut().push("always");
            Ok(())
        }));

        let mut reactor = Reactor::new();
        let mut sender = RecordingSender { sent: Vec::new() };
        let handled = dispatcher
            .dispatch(&mut reactor, &mut sender, &incoming("PING"))
            .unwrap();
        assert!(handled);
        assert_eq!(*hits.borrow(), vec!["ping"]);

        let handled = dispatcher
            .dispatch(&mut reactor, &mut sender, &incoming("PONG"))
            .unwrap();
        assert!(handled);
        assert_eq!(*hits.borrow(), vec!["ping", "always"]);
        assert!(sender.sent.is_empty());
    }

    #[test]
    fn test_unknown_reply() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .add_match("PING", Box::new(|_, _, _| Ok(())))
            .unwrap();

        let mut reactor = Reactor::new();
        let mut sender = RecordingSender { sent: Vec::new() };
        let handled = dispatcher
            .dispatch(&mut reactor, &mut sender, &incoming("PONG"))
            .unwrap();
        assert!(!handled);
        assert_eq!(sender.sent.len(), 1);
        let reply = &sender.sent[0];
        assert_eq!(reply.command(), "UNKNOWN");
        assert_eq!(reply.get_parameter("command").unwrap(), "PONG");
        assert_eq!(reply.server(), "peer");
        assert_eq!(reply.service(), "svc");
    }

    #[test]
    fn test_predicate_match() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_predicate(
            Box::new(|command| command.starts_with("LOCK")),
            Box::new(|_, _, _| Ok(())),
        );
        let mut reactor = Reactor::new();
        let mut sender = RecordingSender { sent: Vec::new() };
        assert!(dispatcher
            .dispatch(&mut reactor, &mut sender, &incoming("LOCKENTERING"))
            .unwrap());
    }

    #[test]
    fn test_commands_listing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_match("PING", Box::new(|_, _, _| Ok(()))).unwrap();
        dispatcher.add_match("STOP", Box::new(|_, _, _| Ok(()))).unwrap();
        dispatcher.add_always(Box::new(|_, _, _| Ok(())));
        assert_eq!(dispatcher.commands(), vec!["PING", "STOP"]);
        assert!(dispatcher.add_match("lower", Box::new(|_, _, _| Ok(()))).is_err());
    }
}
