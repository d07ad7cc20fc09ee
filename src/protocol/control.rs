//! ASTM E1381 control characters.
//!
//! Single-byte codes exchanged during the handshake and used to delimit
//! frames:
//! ```text
//! ┌─────┬─────┬─────┬─────┬─────┬─────┬─────┬─────┬─────┐
//! │ STX │ ETX │ EOT │ ENQ │ ACK │ LF  │ CR  │ NAK │ ETB │
//! │ 02  │ 03  │ 04  │ 05  │ 06  │ 0A  │ 0D  │ 15  │ 17  │
//! └─────┴─────┴─────┴─────┴─────┴─────┴─────┴─────┴─────┘
//! ```

/// Start of text, opens every frame.
pub const STX: u8 = 0x02;
/// End of text, closes the last frame of a message.
pub const ETX: u8 = 0x03;
/// End of transmission.
pub const EOT: u8 = 0x04;
/// Enquiry, requests permission to transmit.
pub const ENQ: u8 = 0x05;
/// Positive acknowledgement.
pub const ACK: u8 = 0x06;
/// Line feed, final byte of every frame.
pub const LF: u8 = 0x0A;
/// Carriage return.
pub const CR: u8 = 0x0D;
/// Negative acknowledgement.
pub const NAK: u8 = 0x15;
/// End of transmission block, closes every frame except the last.
pub const ETB: u8 = 0x17;

/// Handshake bytes that may arrive outside of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlByte {
    Enq,
    Ack,
    Nak,
    Eot,
}

impl ControlByte {
    /// Classify a raw byte, `None` for anything that is not a handshake byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ENQ => Some(Self::Enq),
            ACK => Some(Self::Ack),
            NAK => Some(Self::Nak),
            EOT => Some(Self::Eot),
            _ => None,
        }
    }

    /// Wire value.
    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Enq => ENQ,
            Self::Ack => ACK,
            Self::Nak => NAK,
            Self::Eot => EOT,
        }
    }

    /// Mnemonic as used in traces.
    pub fn name(self) -> &'static str {
        match self {
            Self::Enq => "ENQ",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Eot => "EOT",
        }
    }
}

impl std::fmt::Display for ControlByte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn mnemonic(byte: u8) -> Option<&'static str> {
    Some(match byte {
        STX => "<STX>",
        ETX => "<ETX>",
        EOT => "<EOT>",
        ENQ => "<ENQ>",
        ACK => "<ACK>",
        LF => "<LF>",
        CR => "<CR>",
        NAK => "<NAK>",
        ETB => "<ETB>",
        _ => return None,
    })
}

/// Render raw wire bytes as printable text, control bytes shown as `<NAME>`.
///
/// Non-ASCII text is decoded as UTF-8 (lossy).
///
/// ```
/// use astm_client::protocol::control::{display_bytes, STX, ETX};
///
/// assert_eq!(display_bytes(&[STX, b'1', b'L', ETX]), "<STX>1L<ETX>");
/// ```
pub fn display_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 16);
    for ch in String::from_utf8_lossy(bytes).chars() {
        if ch.is_ascii_control() {
            match mnemonic(ch as u8) {
                Some(name) => out.push_str(name),
                None => out.push_str(&format!("<{:02X}>", ch as u8)),
            }
        } else {
            out.push(ch);
        }
    }
    out
}
