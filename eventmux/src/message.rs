// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured messages and their two wire encodings.
//!
//! A message carries an optional routing tuple (`sent_from_server`,
//! `sent_from_service`, `server`, `service`), a mandatory command, and a
//! map of named parameters. On the wire a message is either one line of
//! the compact format:
//!
//! ```text
//! ['<' sent_from_server ':' sent_from_service ' ']
//! [[server ':'] service '/'] command
//! [' ' name '=' value (';' name '=' value)*]
//! ```
//!
//! or a JSON object with the fields `sent-from-server`, `sent-from-service`,
//! `server`, `service`, `command`, and `parameters`.

use crate::error::{Error, Result};
use crate::name::verify_name;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;

/// Version of the message protocol; carried in the `version` parameter when
/// [`Message::add_version_parameter`] is used.
pub const MESSAGE_VERSION: i64 = 1;

/// Name of the parameter carrying [`MESSAGE_VERSION`].
pub const MESSAGE_VERSION_NAME: &str = "version";

/// Output encoding selector for [`Message::to_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Line,
    Json,
}

#[derive(Debug, Default)]
pub struct Message {
    sent_from_server: String,
    sent_from_service: String,
    server: String,
    service: String,
    command: String,
    parameters: BTreeMap<String, String>,

    cached_line: RefCell<Option<String>>,
    cached_json: RefCell<Option<String>>,
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            sent_from_server: self.sent_from_server.clone(),
            sent_from_service: self.sent_from_service.clone(),
            server: self.server.clone(),
            service: self.service.clone(),
            command: self.command.clone(),
            parameters: self.parameters.clone(),
            cached_line: RefCell::new(None),
            cached_json: RefCell::new(None),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.sent_from_server == other.sent_from_server
            && self.sent_from_service == other.sent_from_service
            && self.server == other.server
            && self.service == other.service
            && self.command == other.command
            && self.parameters == other.parameters
    }
}

impl Eq for Message {}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a message in either encoding.
    ///
    /// Surrounding ASCII whitespace (including a telnet `\r`) is removed
    /// first; a leading `{` selects the JSON parser, anything else the line
    /// parser.
    pub fn from_text(text: &str) -> Result<Self> {
        let msg = text.trim_matches(|c: char| c.is_ascii_whitespace());
        if msg.is_empty() {
            let err = format!("message is empty or only composed of blanks ({text:?})");
            tracing::error!("{err}");
            return Err(Error::InvalidMessage(err));
        }
        if msg.starts_with('{') {
            Self::from_json(msg)
        } else {
            Self::from_line(msg)
        }
    }

    /// Parse the compact line format.
    pub fn from_line(line: &str) -> Result<Self> {
        let msg = line.trim_matches(|c: char| c.is_ascii_whitespace());
        let b = msg.as_bytes();
        let mut i = 0usize;

        let mut result = Message::new();

        // sent-from block?
        if i < b.len() && b[i] == b'<' {
            i += 1;
            let start = i;
            while i < b.len() && b[i] != b':' {
                if b[i] == b' ' {
                    let err = format!(
                        "a message with a sent-from block must not include a space \
                         in the server name ({msg})"
                    );
                    tracing::error!("{err}");
                    return Err(Error::InvalidMessage(err));
                }
                i += 1;
            }
            result.sent_from_server = msg[start..i].to_string();
            if i < b.len() {
                i += 1; // skip ':'
                let start = i;
                while i < b.len() && b[i] != b' ' {
                    i += 1;
                }
                result.sent_from_service = msg[start..i].to_string();
            }
            if i >= b.len() {
                let err = "a message cannot only include a sent-from block".to_string();
                tracing::error!("{err}");
                return Err(Error::InvalidMessage(err));
            }
            i += 1; // skip ' '
        }

        // [server ':'] [service '/'] command
        let mut has_server = false;
        let mut has_service = false;
        let mut word_start = i;
        while i < b.len() && b[i] != b' ' {
            match b[i] {
                b':' => {
                    if has_server || has_service || word_start == i {
                        let err = format!(
                            "invalid server name specification in message ({msg})"
                        );
                        tracing::error!("{err}");
                        return Err(Error::InvalidMessage(err));
                    }
                    has_server = true;
                    result.server = msg[word_start..i].to_string();
                    word_start = i + 1;
                }
                b'/' => {
                    if has_service || word_start == i {
                        let err = format!(
                            "invalid service name specification in message ({msg})"
                        );
                        tracing::error!("{err}");
                        return Err(Error::InvalidMessage(err));
                    }
                    has_service = true;
                    result.service = msg[word_start..i].to_string();
                    word_start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        result.command = msg[word_start..i].to_string();
        if result.command.is_empty() {
            let err = format!("a command is mandatory in a message ({msg})");
            tracing::error!("{err}");
            return Err(Error::InvalidMessage(err));
        }

        // parameters after a single space
        if i < b.len() {
            i += 1; // skip ' '
            while i < b.len() {
                let name_start = i;
                while i < b.len() && b[i] != b'=' {
                    i += 1;
                }
                let param_name = &msg[name_start..i];
                if param_name.is_empty() {
                    let err = "an empty parameter name is not valid in a message".to_string();
                    tracing::error!("{err}");
                    return Err(Error::InvalidMessage(err));
                }
                verify_name(param_name, false, true)?;
                if i >= b.len() {
                    let err = format!(
                        "message parameter \"{param_name}\" must be followed by '='"
                    );
                    tracing::error!("{err}");
                    return Err(Error::InvalidMessage(err));
                }
                i += 1; // skip '='

                let mut value = String::new();
                if i < b.len() && b[i] == b'"' {
                    // quoted value, '\"' is restored here; other sequences below
                    i += 1;
                    loop {
                        if i >= b.len() {
                            let err =
                                "a quoted message parameter must end with a quote".to_string();
                            tracing::error!("{err}");
                            return Err(Error::InvalidMessage(err));
                        }
                        if b[i] == b'"' {
                            i += 1;
                            break;
                        }
                        if b[i] == b'\\' && i + 1 < b.len() && b[i + 1] == b'"' {
                            i += 1;
                        }
                        let char_end = next_char_boundary(msg, i);
                        value.push_str(&msg[i..char_end]);
                        i = char_end;
                    }
                } else {
                    let start = i;
                    while i < b.len() && b[i] != b';' {
                        i += 1;
                    }
                    value.push_str(&msg[start..i]);
                }

                if i < b.len() {
                    if b[i] != b';' {
                        let err =
                            "two message parameters must be separated by a semicolon".to_string();
                        tracing::error!("{err}");
                        return Err(Error::InvalidMessage(err));
                    }
                    i += 1;
                }

                result
                    .parameters
                    .insert(param_name.to_string(), decode_backslashes(&value));
            }
        }

        Ok(result)
    }

    /// Parse the JSON encoding.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            let err = format!("invalid JSON message: {e}");
            tracing::error!("{err}");
            Error::InvalidMessage(err)
        })?;
        let object = value.as_object().ok_or_else(|| {
            let err = "a JSON message must be an object".to_string();
            tracing::error!("{err}");
            Error::InvalidMessage(err)
        })?;

        let mut result = Message::new();
        for (name, field) in object {
            match name.as_str() {
                "parameters" => {
                    let parameters = field.as_object().ok_or_else(|| {
                        let err = "JSON message \"parameters\" must be an object".to_string();
                        tracing::error!("{err}");
                        Error::InvalidMessage(err)
                    })?;
                    for (parameter_name, parameter) in parameters {
                        verify_name(parameter_name, false, true)?;
                        let value = match parameter {
                            serde_json::Value::String(s) => decode_backslashes(s),
                            serde_json::Value::Number(n) => {
                                if let Some(i) = n.as_i64() {
                                    i.to_string()
                                } else if let Some(u) = n.as_u64() {
                                    u.to_string()
                                } else {
                                    // avoid a ".0" tail for whole numbers
                                    let f = n.as_f64().unwrap_or(0.0);
                                    if f == f.trunc() && f.is_finite() {
                                        (f as i64).to_string()
                                    } else {
                                        f.to_string()
                                    }
                                }
                            }
                            serde_json::Value::Bool(flag) => flag.to_string(),
                            serde_json::Value::Null => String::new(),
                            _ => {
                                let err = format!(
                                    "JSON message parameter \"{parameter_name}\" has an \
                                     unsupported type"
                                );
                                tracing::error!("{err}");
                                return Err(Error::InvalidMessage(err));
                            }
                        };
                        result.parameters.insert(parameter_name.clone(), value);
                    }
                }
                "sent-from-server" | "sent-from-service" | "server" | "service" | "command" => {
                    let text = field.as_str().ok_or_else(|| {
                        let err =
                            format!("JSON message field \"{name}\" must be a string");
                        tracing::error!("{err}");
                        Error::InvalidMessage(err)
                    })?;
                    match name.as_str() {
                        "sent-from-server" => result.sent_from_server = text.to_string(),
                        "sent-from-service" => result.sent_from_service = text.to_string(),
                        "server" => result.server = text.to_string(),
                        "service" => result.service = text.to_string(),
                        _ => result.command = text.to_string(),
                    }
                }
                _ => {
                    // ignore unknown fields for forward compatibility
                    tracing::info!("JSON message field \"{name}\" was not recognized, ignored");
                }
            }
        }

        if result.command.is_empty() {
            let err = "a command is mandatory in a JSON message".to_string();
            tracing::error!("{err}");
            return Err(Error::InvalidMessage(err));
        }

        Ok(result)
    }

    /// Serialize in the requested encoding.
    pub fn to_text(&self, format: Format) -> Result<String> {
        match format {
            Format::Line => self.to_line(),
            Format::Json => self.to_json(),
        }
    }

    /// Serialize as one line of the compact format (no trailing newline).
    ///
    /// The result is cached; the cache is invalidated by any mutation.
    pub fn to_line(&self) -> Result<String> {
        if let Some(cached) = self.cached_line.borrow().as_ref() {
            return Ok(cached.clone());
        }
        if self.command.is_empty() {
            return Err(Error::InvalidMessage(
                "cannot build a valid message without at least a command".to_string(),
            ));
        }

        let mut out = String::new();
        if !self.sent_from_server.is_empty() || !self.sent_from_service.is_empty() {
            out.push('<');
            out.push_str(&self.sent_from_server);
            out.push(':');
            out.push_str(&self.sent_from_service);
            out.push(' ');
        }
        if !self.service.is_empty() {
            if !self.server.is_empty() {
                out.push_str(&self.server);
                out.push(':');
            }
            out.push_str(&self.service);
            out.push('/');
        }
        out.push_str(&self.command);

        let mut sep = ' ';
        for (name, value) in &self.parameters {
            out.push(sep);
            out.push_str(name);
            out.push('=');

            let quote = value.contains(';') || value.starts_with('"');
            let safe = escape_value(value, quote);
            if quote {
                out.push('"');
                out.push_str(&safe);
                out.push('"');
            } else {
                out.push_str(&safe);
            }
            sep = ';';
        }

        *self.cached_line.borrow_mut() = Some(out.clone());
        Ok(out)
    }

    /// Serialize as a JSON object.
    ///
    /// Parameter values equal to `true`/`false` become booleans and values
    /// whose decimal re-emission is byte-identical become numbers; anything
    /// else is a string.
    pub fn to_json(&self) -> Result<String> {
        if let Some(cached) = self.cached_json.borrow().as_ref() {
            return Ok(cached.clone());
        }
        if self.command.is_empty() {
            return Err(Error::InvalidMessage(
                "cannot build a valid JSON message without at least a command".to_string(),
            ));
        }

        let mut object = serde_json::Map::new();
        if !self.sent_from_server.is_empty() {
            object.insert(
                "sent-from-server".to_string(),
                serde_json::Value::String(self.sent_from_server.clone()),
            );
        }
        if !self.sent_from_service.is_empty() {
            object.insert(
                "sent-from-service".to_string(),
                serde_json::Value::String(self.sent_from_service.clone()),
            );
        }
        if !self.service.is_empty() {
            if !self.server.is_empty() {
                object.insert(
                    "server".to_string(),
                    serde_json::Value::String(self.server.clone()),
                );
            }
            object.insert(
                "service".to_string(),
                serde_json::Value::String(self.service.clone()),
            );
        }
        object.insert(
            "command".to_string(),
            serde_json::Value::String(self.command.clone()),
        );
        if !self.parameters.is_empty() {
            let mut parameters = serde_json::Map::new();
            for (name, value) in &self.parameters {
                parameters.insert(name.clone(), json_parameter_value(value));
            }
            object.insert("parameters".to_string(), serde_json::Value::Object(parameters));
        }

        let out = serde_json::Value::Object(object).to_string();
        *self.cached_json.borrow_mut() = Some(out.clone());
        Ok(out)
    }

    fn invalidate_caches(&mut self) {
        self.cached_line.borrow_mut().take();
        self.cached_json.borrow_mut().take();
    }

    pub fn sent_from_server(&self) -> &str {
        &self.sent_from_server
    }

    pub fn set_sent_from_server(&mut self, sent_from_server: &str) -> Result<()> {
        if self.sent_from_server != sent_from_server {
            verify_name(sent_from_server, true, true)?;
            self.sent_from_server = sent_from_server.to_string();
            self.invalidate_caches();
        }
        Ok(())
    }

    pub fn sent_from_service(&self) -> &str {
        &self.sent_from_service
    }

    pub fn set_sent_from_service(&mut self, sent_from_service: &str) -> Result<()> {
        if self.sent_from_service != sent_from_service {
            verify_name(sent_from_service, true, true)?;
            self.sent_from_service = sent_from_service.to_string();
            self.invalidate_caches();
        }
        Ok(())
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Set the destination server. `"."` (local delivery only) and `"*"`
    /// (broadcast) are accepted in addition to regular names.
    pub fn set_server(&mut self, server: &str) -> Result<()> {
        if self.server != server {
            if server != "." && server != "*" {
                verify_name(server, true, true)?;
            }
            self.server = server.to_string();
            self.invalidate_caches();
        }
        Ok(())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Set the destination service. `"*"`, `"?"`, and `"."` are accepted in
    /// addition to regular names.
    pub fn set_service(&mut self, service: &str) -> Result<()> {
        if self.service != service {
            if service != "*" && service != "?" && service != "." {
                verify_name(service, true, true)?;
            }
            self.service = service.to_string();
            self.invalidate_caches();
        }
        Ok(())
    }

    /// Address the message back to whoever sent `original`.
    pub fn reply_to(&mut self, original: &Message) -> Result<()> {
        self.set_server(original.sent_from_server())?;
        self.set_service(original.sent_from_service())?;
        Ok(())
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn set_command(&mut self, command: &str) -> Result<()> {
        verify_name(command, false, false)?;
        if self.command != command {
            self.command = command.to_string();
            self.invalidate_caches();
        }
        Ok(())
    }

    /// Add a parameter; any `Display` value is stored in its decimal or
    /// string form (strings, signed/unsigned integers, socket addresses).
    pub fn add_parameter(&mut self, name: &str, value: impl std::fmt::Display) -> Result<()> {
        verify_name(name, false, true)?;
        self.parameters.insert(name.to_string(), value.to_string());
        self.invalidate_caches();
        Ok(())
    }

    pub fn has_parameter(&self, name: &str) -> Result<bool> {
        verify_name(name, false, true)?;
        Ok(self.parameters.contains_key(name))
    }

    pub fn get_parameter(&self, name: &str) -> Result<String> {
        verify_name(name, false, true)?;
        self.parameters.get(name).cloned().ok_or_else(|| {
            Error::MissingParameter(format!(
                "parameter \"{name}\" of command \"{}\" is not defined",
                self.command
            ))
        })
    }

    pub fn get_integer_parameter(&self, name: &str) -> Result<i64> {
        let value = self.get_parameter(name)?;
        value.parse::<i64>().map_err(|_| {
            Error::InvalidMessage(format!(
                "command \"{}\" expected an integer for \"{name}\" but \"{value}\" \
                 could not be converted",
                self.command
            ))
        })
    }

    pub fn get_i32_parameter(&self, name: &str) -> Result<i32> {
        let value = self.get_integer_parameter(name)?;
        i32::try_from(value).map_err(|_| {
            Error::InvalidMessage(format!(
                "parameter \"{name}\" value {value} does not fit a 32 bit integer"
            ))
        })
    }

    pub fn get_u32_parameter(&self, name: &str) -> Result<u32> {
        let value = self.get_unsigned_parameter(name)?;
        u32::try_from(value).map_err(|_| {
            Error::InvalidMessage(format!(
                "parameter \"{name}\" value {value} does not fit an unsigned 32 bit integer"
            ))
        })
    }

    pub fn get_unsigned_parameter(&self, name: &str) -> Result<u64> {
        let value = self.get_parameter(name)?;
        value.parse::<u64>().map_err(|_| {
            Error::InvalidMessage(format!(
                "command \"{}\" expected an unsigned integer for \"{name}\" but \
                 \"{value}\" could not be converted",
                self.command
            ))
        })
    }

    /// Parse a parameter of the form `ip:port`.
    pub fn get_address_parameter(&self, name: &str) -> Result<SocketAddr> {
        let value = self.get_parameter(name)?;
        value.parse::<SocketAddr>().map_err(|_| {
            Error::InvalidMessage(format!(
                "command \"{}\" expected an address for \"{name}\" but \"{value}\" \
                 could not be converted",
                self.command
            ))
        })
    }

    pub fn all_parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Add the `version` parameter with [`MESSAGE_VERSION`].
    pub fn add_version_parameter(&mut self) -> Result<()> {
        self.add_parameter(MESSAGE_VERSION_NAME, MESSAGE_VERSION)
    }

    /// Verify that the `version` parameter is present and matches
    /// [`MESSAGE_VERSION`].
    pub fn check_version_parameter(&self) -> Result<bool> {
        Ok(self.get_integer_parameter(MESSAGE_VERSION_NAME)? == MESSAGE_VERSION)
    }
}

/// End of the UTF-8 character starting at byte `i`.
fn next_char_boundary(s: &str, i: usize) -> usize {
    let mut end = i + 1;
    while end < s.len() && !s.is_char_boundary(end) {
        end += 1;
    }
    end
}

/// Restore `\\`, `\n`, and `\r` sequences in a decoded value.
fn decode_backslashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('r') => {
                    chars.next();
                    out.push('\r');
                }
                _ => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape a value for emission: `\` -> `\\`, newline -> `\n`, carriage
/// return -> `\r`, and when quoting, `"` -> `\"`.
fn escape_value(value: &str, quote: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '"' if quote => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Pick the JSON representation of a parameter value.
///
/// A value becomes a number or boolean only when its decimal re-emission is
/// byte-identical so parsing the result restores the exact stored string.
fn json_parameter_value(value: &str) -> serde_json::Value {
    if value == "true" {
        return serde_json::Value::Bool(true);
    }
    if value == "false" {
        return serde_json::Value::Bool(false);
    }
    if let Ok(i) = value.parse::<i64>() {
        if i.to_string() == value {
            return serde_json::Value::Number(i.into());
        }
    }
    if let Ok(u) = value.parse::<u64>() {
        if u.to_string() == value {
            return serde_json::Value::Number(u.into());
        }
    }
    if let Ok(f) = value.parse::<f64>() {
        if f.is_finite() && f.to_string() == value {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return serde_json::Value::Number(n);
            }
        }
    }
    serde_json::Value::String(escape_value(value, false))
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_line() {
            Ok(line) => f.write_str(&line),
            Err(_) => {
                let mut out = String::new();
                let _ = write!(out, "<incomplete message command={:?}>", self.command);
                f.write_str(&out)
            }
        }
    }
}
