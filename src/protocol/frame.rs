//! Frame codec.
//!
//! One record travels as one frame:
//! ```text
//! ┌─────┬─────┬─────────────┬─────────┬──────────┬────┬────┐
//! │ STX │ FN  │ record text │ ETX/ETB │ checksum │ CR │ LF │
//! │ 1   │ 1   │ N bytes     │ 1       │ 4 (or 2) │ 1  │ 1  │
//! └─────┴─────┴─────────────┴─────────┴──────────┴────┴────┘
//! ```
//!
//! `FN` is the frame number modulo 8 as a single ASCII digit. The checksum is
//! the 8-bit wrapping sum of the bytes selected by [`ChecksumFormat`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::control::{CR, ETB, ETX, LF, STX};
use crate::error::{AstmError, Result};

/// How the frame checksum is computed and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumFormat {
    /// Sum covers STX through ETX/ETB; each nibble is rendered as two
    /// uppercase hex digits, four characters in total (`0xF9` -> `"0F09"`).
    #[default]
    NibblePadded,
    /// ASTM E1381 form: sum covers the frame number through ETX/ETB, rendered
    /// as two uppercase hex digits (`0xF9` -> `"F9"`).
    Standard,
}

impl ChecksumFormat {
    /// Number of checksum characters on the wire.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            Self::NibblePadded => 4,
            Self::Standard => 2,
        }
    }

    /// Checksum over `content`, which starts with STX and ends with ETX/ETB.
    pub fn checksum(self, content: &[u8]) -> u8 {
        let summed = match self {
            Self::NibblePadded => content,
            Self::Standard => content.strip_prefix(&[STX]).unwrap_or(content),
        };
        summed.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    /// Render a checksum value in this format.
    pub fn encode(self, checksum: u8) -> String {
        match self {
            Self::NibblePadded => format!("{:02X}{:02X}", checksum >> 4, checksum & 0x0F),
            Self::Standard => format!("{:02X}", checksum),
        }
    }
}

/// A decoded inbound frame whose checksum has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame number digit (0-7).
    pub number: u8,
    /// Record text between the frame number and the terminator.
    pub text: Bytes,
    /// `true` when terminated by ETX.
    pub is_last: bool,
}

impl Frame {
    /// Record text as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.text).into_owned()
    }

    /// Parse and verify one complete frame (`STX` .. `LF`).
    ///
    /// Returns `AstmError::Protocol` on framing violations or checksum mismatch.
    pub fn decode(raw: &[u8], format: ChecksumFormat) -> Result<Self> {
        let width = format.width();
        // STX + FN + terminator + checksum + CR + LF
        if raw.len() < 5 + width {
            return Err(AstmError::Protocol(format!(
                "Frame too short ({} bytes)",
                raw.len()
            )));
        }
        if raw[0] != STX {
            return Err(AstmError::Protocol("Frame does not start with STX".into()));
        }
        if raw[raw.len() - 2..] != [CR, LF] {
            return Err(AstmError::Protocol("Frame is not terminated by CR LF".into()));
        }

        let term_pos = raw.len() - 3 - width;
        let is_last = match raw[term_pos] {
            ETX => true,
            ETB => false,
            other => {
                return Err(AstmError::Protocol(format!(
                    "Expected ETX or ETB, found 0x{:02X}",
                    other
                )))
            }
        };

        let number = match raw[1] {
            d @ b'0'..=b'7' => d - b'0',
            other => {
                return Err(AstmError::Protocol(format!(
                    "Invalid frame number byte 0x{:02X}",
                    other
                )))
            }
        };

        let content = &raw[..=term_pos];
        let expected = format.encode(format.checksum(content));
        let received = &raw[term_pos + 1..term_pos + 1 + width];
        if !received.eq_ignore_ascii_case(expected.as_bytes()) {
            return Err(AstmError::Protocol(format!(
                "Checksum mismatch: expected {}, received {}",
                expected,
                String::from_utf8_lossy(received)
            )));
        }

        Ok(Self {
            number,
            text: Bytes::copy_from_slice(&raw[2..term_pos]),
            is_last,
        })
    }
}

/// Build a complete frame for one record using the default checksum format.
///
/// # Example
///
/// ```
/// use astm_client::protocol::build_frame;
///
/// let frame = build_frame("L|1|N", 1, true);
/// assert_eq!(&frame[..], b"\x021L|1|N\x030F09\r\n");
/// ```
pub fn build_frame(record_text: &str, frame_number: u32, is_last: bool) -> Bytes {
    build_frame_with(ChecksumFormat::default(), record_text, frame_number, is_last)
}

/// Build a complete frame with an explicit checksum format.
pub fn build_frame_with(
    format: ChecksumFormat,
    record_text: &str,
    frame_number: u32,
    is_last: bool,
) -> Bytes {
    let digit = b'0' + (frame_number % 8) as u8;
    let terminator = if is_last { ETX } else { ETB };

    let mut buf = Vec::with_capacity(record_text.len() + 5 + format.width());
    buf.push(STX);
    buf.push(digit);
    buf.extend_from_slice(record_text.as_bytes());
    buf.push(terminator);

    let checksum = format.encode(format.checksum(&buf));
    buf.extend_from_slice(checksum.as_bytes());
    buf.push(CR);
    buf.push(LF);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_frame_exact_bytes() {
        let frame = build_frame("L|1|N", 1, true);
        let expected: Vec<u8> = [STX, b'1', b'L', b'|', b'1', b'|', b'N', ETX]
            .into_iter()
            .chain(*b"0F09")
            .chain([CR, LF])
            .collect();
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn test_checksum_sum_and_mask() {
        let content = [STX, b'1', b'L', b'|', b'1', b'|', b'N', ETX];
        let sum: u32 = content.iter().map(|b| *b as u32).sum();
        assert_eq!(sum, 505);
        assert_eq!(ChecksumFormat::NibblePadded.checksum(&content), 0xF9);
        assert_eq!(ChecksumFormat::NibblePadded.encode(0xF9), "0F09");
    }

    #[test]
    fn test_standard_checksum_excludes_stx() {
        let content = [STX, b'1', b'L', b'|', b'1', b'|', b'N', ETX];
        assert_eq!(ChecksumFormat::Standard.checksum(&content), 0xF7);
        assert_eq!(ChecksumFormat::Standard.encode(0xF7), "F7");

        let frame = build_frame_with(ChecksumFormat::Standard, "L|1|N", 1, true);
        assert_eq!(&frame[..], b"\x021L|1|N\x03F7\r\n");
    }

    #[test]
    fn test_frame_number_wraps_mod_8() {
        assert_eq!(build_frame("C|1|I|x|G", 7, false)[1], b'7');
        assert_eq!(build_frame("C|1|I|x|G", 8, false)[1], b'0');
        assert_eq!(build_frame("C|1|I|x|G", 9, false)[1], b'1');
    }

    #[test]
    fn test_etb_for_intermediate_frames() {
        let frame = build_frame("H|\\^&", 1, false);
        assert_eq!(frame[frame.len() - 7], ETB);
    }

    #[test]
    fn test_low_nibble_zero_padding() {
        assert_eq!(ChecksumFormat::NibblePadded.encode(0x0A), "000A");
        assert_eq!(ChecksumFormat::NibblePadded.encode(0x00), "0000");
    }

    #[test]
    fn test_decode_valid_frame() {
        let raw = build_frame("R|1|^^^ALB|3.0|g/dL|2.3-4.0|N||||F||20240101120000", 3, false);
        let frame = Frame::decode(&raw, ChecksumFormat::NibblePadded).unwrap();
        assert_eq!(frame.number, 3);
        assert!(!frame.is_last);
        assert_eq!(
            frame.text(),
            "R|1|^^^ALB|3.0|g/dL|2.3-4.0|N||||F||20240101120000"
        );
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut raw = build_frame("L|1|N", 1, true).to_vec();
        let pos = raw.len() - 3;
        raw[pos] = b'0';
        let err = Frame::decode(&raw, ChecksumFormat::NibblePadded).unwrap_err();
        assert!(matches!(err, AstmError::Protocol(_)));
    }

    #[test]
    fn test_decode_wrong_format_rejected() {
        let raw = build_frame("L|1|N", 1, true);
        assert!(Frame::decode(&raw, ChecksumFormat::Standard).is_err());
    }

    #[test]
    fn test_decode_bad_frame_number() {
        let mut raw = build_frame("L|1|N", 1, true).to_vec();
        raw[1] = b'9';
        assert!(Frame::decode(&raw, ChecksumFormat::NibblePadded).is_err());
    }

    #[test]
    fn test_decode_lowercase_checksum_accepted() {
        let raw = b"\x021L|1|N\x03f7\r\n";
        let frame = Frame::decode(raw, ChecksumFormat::Standard).unwrap();
        assert!(frame.is_last);
    }
}
