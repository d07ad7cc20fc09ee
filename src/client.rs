//! Connection manager and its builder.
//!
//! The [`ConnectionManagerBuilder`] provides a fluent API for configuring
//! timeouts, retries and the instrument identity. The [`ConnectionManager`]
//! manages the lifecycle:
//! 1. Validate host/port
//! 2. Open the TCP stream
//! 3. Start the session (reader, writer, transmission driver)
//! 4. Announce the instrument with a connect status message
//! 5. On `disconnect()`, cancel pending work and say goodbye
//!
//! # Example
//!
//! ```no_run
//! use astm_client::{ConnectionManager, Scenario};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::builder()
//!         .sender_name("Skyla Solution")
//!         .build()?;
//!
//!     manager.connect("localhost", 3000).await?;
//!     manager.send_scenario(Scenario::NormalLiverPanel).await?;
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::config::{ClientConfig, RetryBackoff};
use crate::error::{AstmError, Result};
use crate::generator::{connection_status, Scenario, CONNECT_COMMENT, DISCONNECT_COMMENT};
use crate::message::Message;
use crate::protocol::ChecksumFormat;
use crate::session::{SessionHandle, SessionSender};
use crate::status::{ConnectionState, LogCategory, LogLevel, StatusBoard, StatusSnapshot};
use crate::transport::{self, Endpoint};

/// Builder for configuring and creating a [`ConnectionManager`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionManagerBuilder {
    config: ClientConfig,
}

impl ConnectionManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sender name used in connect/disconnect status messages.
    ///
    /// Default: "Skyla Solution"
    pub fn sender_name(mut self, name: impl Into<String>) -> Self {
        self.config.sender_name = name.into();
        self
    }

    /// Software version used in connect/disconnect status messages.
    ///
    /// Default: "1.0.0"
    pub fn software_version(mut self, version: impl Into<String>) -> Self {
        self.config.software_version = version.into();
        self
    }

    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// How long to wait for the host to answer ENQ.
    ///
    /// Default: 15 seconds
    pub fn enq_timeout(mut self, timeout: Duration) -> Self {
        self.config.enq_timeout = timeout;
        self
    }

    /// How long to wait for the host to answer a frame.
    ///
    /// Default: 15 seconds
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Attempts per frame, including the first.
    ///
    /// Default: 6
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Default: 100 ms doubling, capped at 2 s
    pub fn retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Default: [`ChecksumFormat::NibblePadded`]
    pub fn checksum_format(mut self, format: ChecksumFormat) -> Self {
        self.config.checksum_format = format;
        self
    }

    /// Consecutive malformed inbound units before the connection is dropped.
    ///
    /// Default: 5
    pub fn protocol_error_threshold(mut self, threshold: u32) -> Self {
        self.config.protocol_error_threshold = threshold;
        self
    }

    /// Time allowed for the disconnect status message.
    ///
    /// Default: 2 seconds
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    /// Validate the configuration and build the manager.
    pub fn build(self) -> Result<ConnectionManager> {
        self.config.validate()?;
        Ok(ConnectionManager::with_config(self.config))
    }
}

/// Owns one TCP connection to a LIS host and everything transmitted over it.
///
/// All methods take `&self`; share the manager behind an `Arc` to send from
/// several tasks. Sends are transmitted one at a time, first come first served.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ClientConfig,
    status: Arc<StatusBoard>,
    session: Mutex<Option<SessionHandle>>,
    /// Wakes a `connect` that is still waiting for the TCP handshake.
    cancel_connect: Notify,
    /// Bumped by every `disconnect`; a `connect` that sees it change gives up.
    disconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new()
    }

    /// Manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            status: Arc::new(StatusBoard::new()),
            session: Mutex::new(None),
            cancel_connect: Notify::new(),
            disconnects: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared status board.
    pub fn status(&self) -> Arc<StatusBoard> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Connect to `host:port` and announce the instrument.
    ///
    /// Invalid input fails with `AstmError::Configuration` before any network
    /// activity. An existing connection is closed first. Returns once the
    /// connection is up; the connect status message is queued, not awaited.
    pub async fn connect(&self, host: &str, port: u32) -> Result<()> {
        let endpoint = match Endpoint::new(host, port) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.status.report_error(&e, None);
                return Err(e);
            }
        };

        let generation = self.disconnects.load(Ordering::SeqCst);
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            self.status.log(
                LogLevel::Info,
                LogCategory::Connection,
                "Closing previous connection",
                None,
            );
            previous.shutdown(self.farewell()).await;
        }

        self.status.clear_error();
        self.status.set_state(ConnectionState::Connecting);
        self.status.log(
            LogLevel::Info,
            LogCategory::Connection,
            format!("Connecting to {}", endpoint),
            None,
        );

        let stream = {
            let mut guard = ConnectingGuard::new(&self.status);
            let cancelled = self.cancel_connect.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();
            // A disconnect may have run while the previous session was closing.
            let outcome = if self.disconnects.load(Ordering::SeqCst) != generation {
                Err(AstmError::Cancelled)
            } else {
                tokio::select! {
                    result = transport::connect(&endpoint, self.config.connect_timeout) => result,
                    _ = &mut cancelled => Err(AstmError::Cancelled),
                }
            };
            guard.disarm();
            outcome
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(AstmError::Cancelled) => {
                self.status.log(
                    LogLevel::Info,
                    LogCategory::Connection,
                    format!("Connection to {} cancelled", endpoint),
                    None,
                );
                self.status.set_state(ConnectionState::Disconnected);
                return Err(AstmError::Cancelled);
            }
            Err(e) => {
                self.status.report_error(&e, None);
                self.status.set_state(ConnectionState::Error);
                return Err(e);
            }
        };

        let (reader, writer) = stream.into_split();
        let session = SessionHandle::spawn(reader, writer, &self.config, self.status.clone());
        self.status.set_state(ConnectionState::Connected);
        self.status.log(
            LogLevel::Info,
            LogCategory::Connection,
            format!("Connected to {}", endpoint),
            None,
        );

        let announce = connection_status(
            &self.config.sender_name,
            &self.config.software_version,
            CONNECT_COMMENT,
        );
        session.sender().enqueue(announce).await?;
        *slot = Some(session);
        Ok(())
    }

    /// Close the connection.
    ///
    /// A transmission in flight and every queued send fail with
    /// `AstmError::Cancelled`. When connected, a disconnect status message is
    /// attempted (bounded by `disconnect_grace`) before the socket closes.
    pub async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.cancel_connect.notify_waiters();

        let session = self.session.lock().await.take();
        if let Some(session) = session {
            self.status.log(
                LogLevel::Info,
                LogCategory::Connection,
                "Disconnecting",
                None,
            );
            session.shutdown(self.farewell()).await;
        }
        self.status.set_transmitting(false);
        self.status.set_state(ConnectionState::Disconnected);
    }

    /// Transmit `message` and wait for the outcome.
    ///
    /// Fails immediately with `AstmError::NotConnected`, without touching the
    /// socket, unless the state is `Connected`.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let sender = match self.status.state() {
            ConnectionState::Connected => self.sender().await,
            _ => None,
        };
        match sender {
            Some(sender) => {
                self.status.log(
                    LogLevel::Info,
                    LogCategory::Message,
                    format!("Queued {} message", message.kind().label()),
                    Some(message.serialize_all().join("\n")),
                );
                sender.send(message).await
            }
            _ => {
                let err = AstmError::NotConnected;
                self.status.report_error(&err, None);
                Err(err)
            }
        }
    }

    /// Build `scenario` with fresh randomness and transmit it.
    pub async fn send_scenario(&self, scenario: Scenario) -> Result<()> {
        let message = scenario.build(&mut rand::thread_rng());
        self.status.log(
            LogLevel::Info,
            LogCategory::System,
            format!("Running scenario: {}", scenario),
            None,
        );
        self.send_message(message).await
    }

    async fn sender(&self) -> Option<SessionSender> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.is_finished())
            .map(SessionHandle::sender)
    }

    /// Disconnect notification, only sent from a healthy connection.
    fn farewell(&self) -> Option<Message> {
        (self.status.state() == ConnectionState::Connected).then(|| {
            connection_status(
                &self.config.sender_name,
                &self.config.software_version,
                DISCONNECT_COMMENT,
            )
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the state to `Disconnected` if a `connect` future is dropped
/// while the TCP handshake is still pending.
struct ConnectingGuard<'a> {
    status: &'a StatusBoard,
    armed: bool,
}

impl<'a> ConnectingGuard<'a> {
    fn new(status: &'a StatusBoard) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.set_state(ConnectionState::Disconnected);
        }
    }
}
