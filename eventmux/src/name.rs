// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};

/// Validate a name used in messages (command, service, parameter).
///
/// A valid name is composed of ASCII letters, digits, and underscores, and
/// does not start with a digit. Commands (`can_be_lowercase == false`) are
/// restricted to uppercase letters. Some call sites accept an empty name
/// (e.g. an unset routing field).
pub fn verify_name(name: &str, can_be_empty: bool, can_be_lowercase: bool) -> Result<()> {
    if name.is_empty() {
        if can_be_empty {
            return Ok(());
        }
        let err = "a message name cannot be empty".to_string();
        tracing::error!("{err}");
        return Err(Error::InvalidMessage(err));
    }

    for c in name.chars() {
        let valid = (c.is_ascii_lowercase() && can_be_lowercase)
            || c.is_ascii_uppercase()
            || c.is_ascii_digit()
            || c == '_';
        if !valid {
            let what = if can_be_lowercase { "parameter" } else { "command" };
            let err = format!(
                "a {what} name must be composed of ASCII letters, digits, or '_' \
                 (a command must be uppercase only), \"{}\" is not valid",
                name.escape_default(),
            );
            tracing::error!("{err}");
            return Err(Error::InvalidMessage(err));
        }
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        let err = format!("a name cannot start with a digit, \"{name}\" is not valid");
        tracing::error!("{err}");
        return Err(Error::InvalidMessage(err));
    }

    Ok(())
}
