//! Protocol module - ASTM E1381 low-level transport.
//!
//! This module implements the byte-level side of the protocol:
//! - Control characters for the ENQ/ACK/NAK/EOT handshake
//! - Frame construction and checksum computation
//! - Frame buffer for parsing the inbound byte stream

pub mod control;
mod frame;
mod frame_buffer;

pub use control::{display_bytes, ControlByte};
pub use frame::{build_frame, build_frame_with, ChecksumFormat, Frame};
pub use frame_buffer::{FrameBuffer, Inbound, DEFAULT_MAX_FRAME_SIZE};
