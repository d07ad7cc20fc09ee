//! Client configuration.
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! use astm_client::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{ "ack_timeout": 500 }"#).unwrap();
//! assert_eq!(config.ack_timeout.as_millis(), 500);
//! assert_eq!(config.max_attempts, 6);
//! ```
//!
//! Durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AstmError, Result};
use crate::generator::DEFAULT_SENDER;
use crate::protocol::ChecksumFormat;

/// Software version reported in connect/disconnect status messages.
pub const STATUS_SOFTWARE_VERSION: &str = "1.0.0";

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the ACK that answers our ENQ.
pub const DEFAULT_ENQ_TIMEOUT: Duration = Duration::from_secs(15);

/// Default wait for the ACK/NAK that answers a frame.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest silence tolerated between frames while the host is transmitting.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// E1381 allows six attempts per frame.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Consecutive malformed inbound frames tolerated before the connection is dropped.
pub const DEFAULT_PROTOCOL_ERROR_THRESHOLD: u32 = 5;

/// Time allowed for the disconnect status message before the socket is closed.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Default command channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Backoff between retransmissions: `base * 2^(retry - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoff {
    #[serde(with = "millis")]
    pub base: Duration,
    #[serde(with = "millis")]
    pub max: Duration,
}

impl RetryBackoff {
    /// No delay between attempts.
    pub const NONE: RetryBackoff = RetryBackoff {
        base: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Delay before retry number `retry` (1 = first retransmission).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sender name placed in the header of status messages.
    pub sender_name: String,
    /// Software version placed in the header of status messages.
    pub software_version: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub enq_timeout: Duration,
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    /// Attempts per frame, including the first transmission.
    pub max_attempts: u32,
    pub retry_backoff: RetryBackoff,
    pub checksum_format: ChecksumFormat,
    pub protocol_error_threshold: u32,
    #[serde(with = "millis")]
    pub disconnect_grace: Duration,
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sender_name: DEFAULT_SENDER.to_string(),
            software_version: STATUS_SOFTWARE_VERSION.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            enq_timeout: DEFAULT_ENQ_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: RetryBackoff::default(),
            checksum_format: ChecksumFormat::default(),
            protocol_error_threshold: DEFAULT_PROTOCOL_ERROR_THRESHOLD,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AstmError::Configuration(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(AstmError::Configuration(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.protocol_error_threshold == 0 {
            return Err(AstmError::Configuration(
                "protocol_error_threshold must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("enq_timeout", self.enq_timeout),
            ("ack_timeout", self.ack_timeout),
            ("receive_timeout", self.receive_timeout),
        ] {
            if value.is_zero() {
                return Err(AstmError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// (De)serialize a `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
