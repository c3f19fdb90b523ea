//! Chat Message Formats

use super::constants::*;
use crate::error::RelayError;

/// Notice sent to everyone else when a connection completes its handshake
pub fn join_notice(name: &str) -> String {
    format!("{}{}", name, JOIN_SUFFIX)
}

/// Notice sent to everyone else when a named connection closes
pub fn leave_notice(name: &str) -> String {
    format!("{}{}", name, LEAVE_SUFFIX)
}

/// A chat line as forwarded to recipients
pub fn chat_message(sender: &str, payload: &str) -> String {
    format!("{}{}{}", sender, CHAT_SEPARATOR, payload)
}

/// Cut `payload` so that `chat_message(sender, payload)` is at most
/// `max_line_length` bytes. Cuts fall on a character boundary.
pub fn fit_payload<'a>(sender: &str, payload: &'a str, max_line_length: usize) -> &'a str {
    let budget = max_line_length.saturating_sub(sender.len() + CHAT_SEPARATOR.len());
    if payload.len() <= budget {
        return payload;
    }

    let mut end = budget;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

/// Strip trailing NUL and carriage-return bytes from a received line.
///
/// Older console clients send the C string terminator along with the text.
pub fn normalize_payload(line: &str) -> &str {
    line.trim_end_matches(['\0', '\r'])
}

/// Extract a display name from the handshake line
pub fn parse_display_name(line: &str, max_length: usize) -> Result<String, RelayError> {
    let name = normalize_payload(line).trim();

    if name.is_empty() {
        return Err(RelayError::HandshakeFailure("empty display name".to_string()));
    }

    let length = name.chars().count();
    if length > max_length {
        return Err(RelayError::HandshakeFailure(format!(
            "display name is {} characters, limit is {}",
            length, max_length
        )));
    }

    Ok(name.to_string())
}
