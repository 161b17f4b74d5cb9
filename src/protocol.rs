//! Line protocol parsing.
//!
//! One frame is one line; the terminator is stripped by the connection
//! before parsing. The first byte is the command, the rest is positional:
//! no separators, three ASCII digits for the slot number where one is
//! required.

use thiserror::Error;

/// Longest frame content, terminator excluded.
pub const MAX_FRAME: usize = 40;
/// Shortest frame content for every command except `q`.
pub const MIN_FRAME: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is too short")]
    TooShort,
    #[error("message is too long")]
    TooLong,
    #[error("command not supported: {0:#04x}")]
    UnknownCommand(u8),
    #[error("malformed slot number")]
    MalformedSlot,
    #[error("message is not valid utf-8")]
    InvalidEncoding,
}

/// A parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: u8,
    pub slot: usize,
    pub value: String,
}

impl Message {
    fn bare(command: u8) -> Self {
        Message {
            command,
            slot: 0,
            value: String::new(),
        }
    }
}

/// Parse one terminator-stripped frame.
///
/// `q` is recognized from its first byte alone. Every other command must
/// be between [`MIN_FRAME`] and [`MAX_FRAME`] bytes. `u`/`p` carry the
/// remainder as their value; `r`/`w`/`j` address a slot with exactly
/// three digits, and `w` carries the remainder after the slot.
pub fn parse_message(buf: &[u8]) -> Result<Message, ProtocolError> {
    let command = *buf.first().ok_or(ProtocolError::TooShort)?;

    if command == b'q' {
        return Ok(Message::bare(b'q'));
    }

    if buf.len() < MIN_FRAME {
        return Err(ProtocolError::TooShort);
    }
    if buf.len() > MAX_FRAME {
        return Err(ProtocolError::TooLong);
    }

    match command {
        b'u' | b'p' => Ok(Message {
            command,
            slot: 0,
            value: as_utf8(&buf[1..])?.to_string(),
        }),
        b'r' | b'w' | b'j' => {
            let slot = parse_slot(&buf[1..4])?;
            let value = if command == b'w' {
                as_utf8(&buf[4..])?.to_string()
            } else {
                String::new()
            };
            Ok(Message {
                command,
                slot,
                value,
            })
        }
        other => Err(ProtocolError::UnknownCommand(other)),
    }
}

fn parse_slot(digits: &[u8]) -> Result<usize, ProtocolError> {
    if digits.len() != 3 || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedSlot);
    }
    let mut slot = 0usize;
    for &b in digits {
        slot = slot * 10 + usize::from(b - b'0');
    }
    Ok(slot)
}

fn as_utf8(buf: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(buf).map_err(|_| ProtocolError::InvalidEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read() {
        let msg = parse_message(b"r042").unwrap();
        assert_eq!(msg.command, b'r');
        assert_eq!(msg.slot, 42);
        assert_eq!(msg.value, "");
    }

    #[test]
    fn parses_write_with_value() {
        let msg = parse_message(b"w000Hello").unwrap();
        assert_eq!(msg.command, b'w');
        assert_eq!(msg.slot, 0);
        assert_eq!(msg.value, "Hello");
    }

    #[test]
    fn parses_username_and_password() {
        let msg = parse_message(b"upepe").unwrap();
        assert_eq!(msg.command, b'u');
        assert_eq!(msg.value, "pepe");

        let msg = parse_message(b"ppassw0rd").unwrap();
        assert_eq!(msg.command, b'p');
        assert_eq!(msg.value, "passw0rd");
    }

    #[test]
    fn quit_is_recognized_from_first_byte() {
        assert_eq!(parse_message(b"q").unwrap().command, b'q');
    }

    #[test]
    fn rejects_short_and_long_frames() {
        assert_eq!(parse_message(b""), Err(ProtocolError::TooShort));
        assert_eq!(parse_message(b"r0"), Err(ProtocolError::TooShort));
        let long = [b'w', b'0', b'0', b'0']
            .iter()
            .copied()
            .chain(std::iter::repeat(b'x').take(37))
            .collect::<Vec<_>>();
        assert_eq!(parse_message(&long), Err(ProtocolError::TooLong));
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(
            parse_message(b"a000Hello"),
            Err(ProtocolError::UnknownCommand(b'a'))
        );
    }

    #[test]
    fn rejects_malformed_slot() {
        assert_eq!(parse_message(b"r0x1"), Err(ProtocolError::MalformedSlot));
        assert_eq!(parse_message(b"w-01x"), Err(ProtocolError::MalformedSlot));
    }

    #[test]
    fn write_of_max_length_is_accepted() {
        let frame = [b'w', b'0', b'0', b'7']
            .iter()
            .copied()
            .chain(std::iter::repeat(b'x').take(36))
            .collect::<Vec<_>>();
        let msg = parse_message(&frame).unwrap();
        assert_eq!(msg.slot, 7);
        assert_eq!(msg.value.len(), 36);
    }
}
