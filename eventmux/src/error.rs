// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the event dispatch library.
///
/// Transport-level failures inside a running reactor are not raised through
/// this type; they are routed to the affected connection's `process_error`
/// callback instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed wire text, invalid name, or a missing mandatory field on emit.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// An accessor was called for a parameter the message does not carry.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// An out-of-range or unusable argument at an API boundary.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An OS resource (socket, bind, eventfd, inotify, signalfd, ...) could
    /// not be created or configured.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// An unexpected OS error at runtime.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A wire invariant was violated mid-stream.
    #[error("unexpected data: {0}")]
    UnexpectedData(String),

    /// A connection finished its work and asks the reactor to detach it.
    /// Not a failure; the reactor removes the connection without logging
    /// an error.
    #[error("connection done")]
    Done,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::InvalidMessage("no command".to_string());
        assert_eq!(e.to_string(), "invalid message: no command");
        let e = Error::MissingParameter("uri".to_string());
        assert_eq!(e.to_string(), "missing parameter: uri");
    }
}
