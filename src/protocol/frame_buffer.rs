//! Inbound byte-stream parser.
//!
//! Uses `bytes::BytesMut` to accumulate partial reads. Implements a state
//! machine over the inbound stream:
//! - `Idle`: between frames; handshake bytes are reported, anything else is
//!   collected as stray text
//! - `InFrame`: after STX, collecting record text until ETX/ETB
//! - `Trailer`: terminator seen, waiting for checksum + CR LF
//!
//! # Example
//!
//! ```
//! use astm_client::protocol::{build_frame, FrameBuffer, Inbound};
//!
//! let mut buffer = FrameBuffer::new();
//! let events = buffer.push(&build_frame("L|1|N", 1, true));
//! assert!(matches!(&events[0], Inbound::Frame(f) if f.is_last));
//! ```

use bytes::{Bytes, BytesMut};

use super::control::{ControlByte, ETB, ETX, STX};
use super::frame::{ChecksumFormat, Frame};

/// Default upper bound for a single inbound frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// One unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A handshake byte received outside a frame.
    Control(ControlByte),
    /// A complete frame with a verified checksum.
    Frame(Frame),
    /// Bytes that belong to neither a frame nor the handshake.
    Text(Bytes),
    /// A frame that failed validation; it must be discarded.
    Invalid { raw: Bytes, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InFrame,
    Trailer { needed: usize },
}

/// Buffer for accumulating inbound bytes and extracting frames and control bytes.
pub struct FrameBuffer {
    /// Bytes of the frame currently being assembled (starting at STX).
    frame: BytesMut,
    /// Stray bytes seen while idle.
    text: BytesMut,
    state: State,
    format: ChecksumFormat,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer using the default checksum format.
    pub fn new() -> Self {
        Self::with_format(ChecksumFormat::default())
    }

    /// Create a new frame buffer validating checksums in `format`.
    pub fn with_format(format: ChecksumFormat) -> Self {
        Self {
            frame: BytesMut::with_capacity(512),
            text: BytesMut::new(),
            state: State::Idle,
            format,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the maximum accepted frame size.
    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Push data into the buffer and extract every complete event.
    ///
    /// Partial frames are kept for the next push. Stray text is flushed at
    /// the end of each push so it is reported promptly.
    pub fn push(&mut self, data: &[u8]) -> Vec<Inbound> {
        let mut events = Vec::new();

        for &byte in data {
            match self.state {
                State::Idle => self.on_idle(byte, &mut events),
                State::InFrame => self.on_frame_byte(byte, &mut events),
                State::Trailer { needed } => {
                    self.frame.extend_from_slice(&[byte]);
                    if needed > 1 {
                        self.state = State::Trailer { needed: needed - 1 };
                    } else {
                        events.push(self.finish_frame());
                    }
                }
            }
        }

        if self.state == State::Idle {
            self.flush_text(&mut events);
        }
        events
    }

    fn on_idle(&mut self, byte: u8, events: &mut Vec<Inbound>) {
        if byte == STX {
            self.flush_text(events);
            self.frame.clear();
            self.frame.extend_from_slice(&[STX]);
            self.state = State::InFrame;
        } else if let Some(control) = ControlByte::from_byte(byte) {
            self.flush_text(events);
            events.push(Inbound::Control(control));
        } else {
            self.text.extend_from_slice(&[byte]);
        }
    }

    fn on_frame_byte(&mut self, byte: u8, events: &mut Vec<Inbound>) {
        if byte == STX {
            events.push(self.discard_frame("Unexpected STX inside frame"));
            self.frame.extend_from_slice(&[STX]);
            self.state = State::InFrame;
            return;
        }

        if let Some(control) = ControlByte::from_byte(byte) {
            events.push(self.discard_frame("Frame interrupted by control byte"));
            events.push(Inbound::Control(control));
            return;
        }

        self.frame.extend_from_slice(&[byte]);

        if byte == ETX || byte == ETB {
            self.state = State::Trailer {
                needed: self.format.width() + 2,
            };
        } else if self.frame.len() > self.max_frame_size {
            events.push(self.discard_frame("Frame exceeds maximum size"));
        }
    }

    fn finish_frame(&mut self) -> Inbound {
        let raw = self.frame.split().freeze();
        self.state = State::Idle;
        match Frame::decode(&raw, self.format) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => Inbound::Invalid {
                raw,
                reason: e.to_string(),
            },
        }
    }

    fn discard_frame(&mut self, reason: &str) -> Inbound {
        self.state = State::Idle;
        Inbound::Invalid {
            raw: self.frame.split().freeze(),
            reason: reason.to_string(),
        }
    }

    fn flush_text(&mut self, events: &mut Vec<Inbound>) {
        if !self.text.is_empty() {
            events.push(Inbound::Text(self.text.split().freeze()));
        }
    }

    /// `true` while a frame is partially assembled.
    pub fn in_frame(&self) -> bool {
        self.state != State::Idle
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.frame.len() + self.text.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.frame.clear();
        self.text.clear();
        self.state = State::Idle;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;
    use crate::protocol::control::{ACK, ENQ, EOT, NAK};

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let events = buffer.push(&build_frame("C|1|I|SN^Connect|G", 2, false));

        assert_eq!(events.len(), 1);
        match &events[0] {
            Inbound::Frame(frame) => {
                assert_eq!(frame.number, 2);
                assert!(!frame.is_last);
                assert_eq!(frame.text(), "C|1|I|SN^Connect|G");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_control_bytes() {
        let mut buffer = FrameBuffer::new();
        let events = buffer.push(&[ACK, NAK, ENQ, EOT]);
        assert_eq!(
            events,
            vec![
                Inbound::Control(ControlByte::Ack),
                Inbound::Control(ControlByte::Nak),
                Inbound::Control(ControlByte::Enq),
                Inbound::Control(ControlByte::Eot),
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let raw = build_frame("L|1|N", 1, true);
        let mut events = Vec::new();
        for b in raw.iter() {
            events.extend(buffer.push(&[*b]));
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Inbound::Frame(f) if f.is_last && f.number == 1));
    }

    #[test]
    fn test_fragmented_trailer() {
        let mut buffer = FrameBuffer::new();
        let raw = build_frame("L|1|N", 1, true);
        let split = raw.len() - 3;

        assert!(buffer.push(&raw[..split]).is_empty());
        assert!(buffer.in_frame());
        let events = buffer.push(&raw[split..]);
        assert_eq!(events.len(), 1);
        assert!(!buffer.in_frame());
    }

    #[test]
    fn test_frames_and_control_interleaved() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![ENQ];
        data.extend_from_slice(&build_frame("H|\\^&", 1, false));
        data.extend_from_slice(&build_frame("L|1|N", 2, true));
        data.push(EOT);

        let events = buffer.push(&data);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], Inbound::Control(ControlByte::Enq));
        assert!(matches!(&events[1], Inbound::Frame(f) if !f.is_last));
        assert!(matches!(&events[2], Inbound::Frame(f) if f.is_last));
        assert_eq!(events[3], Inbound::Control(ControlByte::Eot));
    }

    #[test]
    fn test_checksum_mismatch_reported_invalid() {
        let mut buffer = FrameBuffer::new();
        let mut raw = build_frame("L|1|N", 1, true).to_vec();
        let pos = raw.len() - 4;
        raw[pos] = b'A';

        let events = buffer.push(&raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Inbound::Invalid { reason, .. } => assert!(reason.contains("Checksum mismatch")),
            other => panic!("unexpected event {:?}", other),
        }

        // Parser recovers for the next frame
        let events = buffer.push(&build_frame("L|1|N", 1, true));
        assert!(matches!(&events[0], Inbound::Frame(_)));
    }

    #[test]
    fn test_stray_text_flushed() {
        let mut buffer = FrameBuffer::new();
        let events = buffer.push(b"hello");
        assert_eq!(events, vec![Inbound::Text(Bytes::from_static(b"hello"))]);

        let events = buffer.push(b"ab\x06");
        assert_eq!(
            events,
            vec![
                Inbound::Text(Bytes::from_static(b"ab")),
                Inbound::Control(ControlByte::Ack),
            ]
        );
    }

    #[test]
    fn test_control_byte_interrupts_frame() {
        let mut buffer = FrameBuffer::new();
        let events = buffer.push(b"\x021H|partial\x04");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Inbound::Invalid { .. }));
        assert_eq!(events[1], Inbound::Control(ControlByte::Eot));
        assert!(!buffer.in_frame());
    }

    #[test]
    fn test_oversized_frame_discarded() {
        let mut buffer = FrameBuffer::new().max_frame_size(8);
        let events = buffer.push(b"\x021ABCDEFGHIJ");
        assert!(matches!(&events[0], Inbound::Invalid { reason, .. } if reason.contains("maximum")));
    }

    #[test]
    fn test_standard_format() {
        let mut buffer = FrameBuffer::with_format(ChecksumFormat::Standard);
        let events = buffer.push(b"\x021L|1|N\x03F7\r\n");
        assert!(matches!(&events[0], Inbound::Frame(f) if f.is_last));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"\x021H|");
        assert!(buffer.in_frame());
        buffer.clear();
        assert!(!buffer.in_frame());
        assert!(buffer.is_empty());
    }
}
