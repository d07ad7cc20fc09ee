//! Sender-side E1381 state machine.
//!
//! The machine performs no I/O. It is fed [`TxEvent`]s and answers with the
//! [`TxAction`]s the driver must carry out, in order:
//!
//! ```text
//!          start()                 ACK                   Written
//! Idle ───────────► AwaitingEnqAck ────► SendingFrame ─────────► AwaitingFrameAck
//!   ▲   ENQ, Wait       │                  ▲    ▲                 │   │    │
//!   │                   │ NAK/Timeout      │    │ NAK/Timeout     │   │    │
//!   │◄──── Fail ────────┘                  │    └─(retry, backoff)┘   │    │
//!   │                                      └──── ACK, more frames ────┘    │
//!   │                        Written                                       │
//!   └──── Complete ◄──────── AwaitingEot ◄──────── ACK, last frame (EOT) ──┘
//! ```
//!
//! Frame *k* (1-based) carries frame number `k mod 8`; only the last frame is
//! closed with ETX. A frame is never followed by the next one until the
//! remote side has acknowledged it.

use std::time::Duration;

use bytes::Bytes;

use crate::config::{ClientConfig, RetryBackoff};
use crate::error::AstmError;
use crate::message::Message;
use crate::protocol::{build_frame_with, ChecksumFormat, ControlByte};

/// Reported when the ENQ is not answered with ACK.
pub const ESTABLISH_FAILED: &str = "Failed to establish transmission";

/// Reported when a frame exhausts its attempts.
pub const RETRANSMISSION_LIMIT: &str = "Retransmission limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Idle,
    AwaitingEnqAck,
    SendingFrame,
    AwaitingFrameAck,
    AwaitingEot,
}

/// Input to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Ack,
    Nak,
    /// The bounded wait announced by [`TxAction::Wait`] expired.
    Timeout,
    /// The last frame or control byte handed to the socket was written.
    Written,
    /// The connection went away.
    Closed,
}

/// Work for the driver.
#[derive(Debug)]
pub enum TxAction {
    SendControl(ControlByte),
    SendFrame {
        frame: Bytes,
        /// Frame number digit on the wire (0-7).
        number: u8,
        /// 1 for the first transmission of this frame.
        attempt: u32,
    },
    /// Wait at most this long for the next event.
    Wait(Duration),
    /// Pause before retransmitting.
    Backoff(Duration),
    /// Message delivered; machine is idle again.
    Complete,
    /// Transmission aborted; machine is idle again.
    Fail {
        error: AstmError,
        /// EOT should be sent so the receiver releases the line.
        send_eot: bool,
    },
}

/// Timeouts and retry bounds for one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enq_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            enq_timeout: config.enq_timeout,
            ack_timeout: config.ack_timeout,
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }
}

/// One message being transmitted.
#[derive(Debug)]
pub struct Transmission {
    state: TxState,
    frames: Vec<Bytes>,
    /// Index of the frame being sent.
    index: usize,
    /// 1-based frame counter; the wire digit is `frame_number % 8`.
    frame_number: u32,
    attempt: u32,
    policy: RetryPolicy,
}

impl Transmission {
    /// Prepare frames for `message`. Empty timestamps are filled in now.
    pub fn new(message: &Message, policy: RetryPolicy, format: ChecksumFormat) -> Self {
        let records = message.serialize_all();
        let last = records.len().saturating_sub(1);
        let frames = records
            .iter()
            .enumerate()
            .map(|(i, text)| build_frame_with(format, text, i as u32 + 1, i == last))
            .collect();
        Self::from_frames(frames, policy)
    }

    /// Transmit pre-built frames.
    pub fn from_frames(frames: Vec<Bytes>, policy: RetryPolicy) -> Self {
        Self {
            state: TxState::Idle,
            frames,
            index: 0,
            frame_number: 1,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TxState::Idle
    }

    /// Current 1-based frame counter.
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Begin the handshake. Does nothing unless idle.
    pub fn start(&mut self) -> Vec<TxAction> {
        if self.state != TxState::Idle {
            return Vec::new();
        }
        self.index = 0;
        self.frame_number = 1;
        self.attempt = 0;
        self.state = TxState::AwaitingEnqAck;
        vec![
            TxAction::SendControl(ControlByte::Enq),
            TxAction::Wait(self.policy.enq_timeout),
        ]
    }

    /// Advance on `event`. Events that mean nothing in the current state
    /// yield no actions.
    pub fn handle(&mut self, event: TxEvent) -> Vec<TxAction> {
        match (self.state, event) {
            (TxState::AwaitingEnqAck, TxEvent::Ack) => self.send_current(),
            (TxState::AwaitingEnqAck, TxEvent::Nak | TxEvent::Timeout | TxEvent::Closed) => {
                self.fail(AstmError::Transmission(ESTABLISH_FAILED.into()), false)
            }

            (TxState::SendingFrame, TxEvent::Written) => {
                self.state = TxState::AwaitingFrameAck;
                vec![TxAction::Wait(self.policy.ack_timeout)]
            }

            (TxState::AwaitingFrameAck, TxEvent::Ack) => {
                self.index += 1;
                self.frame_number += 1;
                self.attempt = 0;
                if self.index < self.frames.len() {
                    self.send_current()
                } else {
                    self.state = TxState::AwaitingEot;
                    vec![TxAction::SendControl(ControlByte::Eot)]
                }
            }
            (TxState::AwaitingFrameAck, TxEvent::Nak | TxEvent::Timeout) => {
                if self.attempt >= self.policy.max_attempts {
                    return self.fail(AstmError::Transmission(RETRANSMISSION_LIMIT.into()), true);
                }
                let delay = self.policy.backoff.delay(self.attempt);
                let mut actions = Vec::with_capacity(2);
                if !delay.is_zero() {
                    actions.push(TxAction::Backoff(delay));
                }
                actions.extend(self.send_current());
                actions
            }

            (TxState::AwaitingEot, TxEvent::Written) => {
                self.state = TxState::Idle;
                self.frame_number = 1;
                vec![TxAction::Complete]
            }

            (TxState::SendingFrame | TxState::AwaitingFrameAck | TxState::AwaitingEot, TxEvent::Closed) => {
                self.fail(AstmError::ConnectionClosed, false)
            }

            _ => Vec::new(),
        }
    }

    /// Abort an in-flight transmission. Returns nothing when idle.
    pub fn abort(&mut self) -> Vec<TxAction> {
        if self.state == TxState::Idle {
            return Vec::new();
        }
        self.fail(AstmError::Cancelled, true)
    }

    fn send_current(&mut self) -> Vec<TxAction> {
        match self.frames.get(self.index) {
            Some(frame) => {
                self.attempt += 1;
                self.state = TxState::SendingFrame;
                vec![TxAction::SendFrame {
                    frame: frame.clone(),
                    number: (self.frame_number % 8) as u8,
                    attempt: self.attempt,
                }]
            }
            None => {
                self.state = TxState::AwaitingEot;
                vec![TxAction::SendControl(ControlByte::Eot)]
            }
        }
    }

    fn fail(&mut self, error: AstmError, send_eot: bool) -> Vec<TxAction> {
        self.state = TxState::Idle;
        self.frame_number = 1;
        self.attempt = 0;
        vec![TxAction::Fail { error, send_eot }]
    }
}
