//! Outgoing command wire formatting
//!
//! The engine is payload-agnostic: a command is an opaque line (or lines) the
//! caller supplies, terminated by a blank line. The only validation applied
//! is a newline guard on single-line payloads — ESL commands are
//! line-delimited, so embedded newlines would allow injection of arbitrary
//! protocol commands.

use crate::constants::{COMMAND_TERMINATOR, LINE_TERMINATOR};
use crate::error::{EslError, EslResult};

/// Reject user-supplied text containing newline characters.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol(format!(
            "{context} must not contain newlines"
        )));
    }
    Ok(())
}

/// Format a single-line command as a wire frame.
pub(crate) fn simple_command(command: &str) -> EslResult<String> {
    validate_no_newlines(command, "command")?;
    Ok(format!("{command}{COMMAND_TERMINATOR}"))
}

/// Format a command with additional headers, e.g. `bgapi` with an explicit
/// `Job-UUID` for completion correlation.
pub(crate) fn command_with_headers(
    command: &str,
    headers: &[(&str, &str)],
) -> EslResult<String> {
    validate_no_newlines(command, "command")?;
    let mut wire = String::from(command);
    wire.push_str(LINE_TERMINATOR);
    for (name, value) in headers {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        wire.push_str(name);
        wire.push_str(": ");
        wire.push_str(value);
        wire.push_str(LINE_TERMINATOR);
    }
    wire.push_str(LINE_TERMINATOR);
    Ok(wire)
}
