//! Observable engine status.
//!
//! [`StatusBoard`] is owned by one [`ConnectionManager`](crate::ConnectionManager)
//! and shared (via `Arc`) with its background tasks. Presentation code reads
//! it through [`StatusBoard::snapshot`] or waits for state changes with
//! [`StatusBoard::subscribe`].
//!
//! ```text
//! session task ─┐                     ┌─► snapshot()  (serializable)
//! writer task  ─┼─► StatusBoard ──────┤
//! manager      ─┘                     └─► subscribe() (watch::Receiver)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{AstmError, ErrorKind};
use crate::protocol::display_bytes;

/// Log entries kept before the oldest are dropped.
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Sent/received trace entries kept per direction.
pub const MAX_TRACE_ENTRIES: usize = 1000;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Error => "Error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogCategory {
    Connection,
    Transmission,
    Protocol,
    Message,
    Error,
    System,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "CONNECTION",
            Self::Transmission => "TRANSMISSION",
            Self::Protocol => "PROTOCOL",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::System => "SYSTEM",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub details: Option<String>,
}

/// Most recent failure, human-readable plus its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AstmError> for LastError {
    fn from(err: &AstmError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Bytes written to or read from the socket, rendered printable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// Point-in-time copy of everything on the board.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<LastError>,
    pub transmitting: bool,
    pub sent: Vec<TraceEntry>,
    pub received: Vec<TraceEntry>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    last_error: Option<LastError>,
    transmitting: bool,
    sent: VecDeque<TraceEntry>,
    received: VecDeque<TraceEntry>,
    logs: VecDeque<LogEntry>,
}

/// Shared, observable status of one connection manager.
#[derive(Debug)]
pub struct StatusBoard {
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.log(
                LogLevel::Info,
                LogCategory::Connection,
                format!("State changed: {} -> {}", previous, state),
                None,
            );
        }
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.lock().last_error.clone()
    }

    /// Record `err` as the last error and log it.
    pub(crate) fn report_error(&self, err: &AstmError, details: Option<String>) {
        let category = match err.kind() {
            ErrorKind::Connection => LogCategory::Connection,
            ErrorKind::Transmission | ErrorKind::Cancelled => LogCategory::Transmission,
            ErrorKind::Protocol => LogCategory::Protocol,
            _ => LogCategory::Error,
        };
        self.log(LogLevel::Error, category, err.to_string(), details);
        self.lock().last_error = Some(LastError::from(err));
    }

    pub(crate) fn clear_error(&self) {
        self.lock().last_error = None;
    }

    /// `true` while a message is being transmitted.
    pub fn is_transmitting(&self) -> bool {
        self.lock().transmitting
    }

    pub(crate) fn set_transmitting(&self, transmitting: bool) {
        self.lock().transmitting = transmitting;
    }

    pub(crate) fn record_sent(&self, bytes: &[u8]) {
        let text = display_bytes(bytes);
        tracing::debug!(direction = "sent", "{}", text);
        push_bounded(
            &mut self.lock().sent,
            TraceEntry {
                timestamp: Local::now(),
                text,
            },
            MAX_TRACE_ENTRIES,
        );
    }

    pub(crate) fn record_received(&self, bytes: &[u8]) {
        let text = display_bytes(bytes);
        tracing::debug!(direction = "received", "{}", text);
        push_bounded(
            &mut self.lock().received,
            TraceEntry {
                timestamp: Local::now(),
                text,
            },
            MAX_TRACE_ENTRIES,
        );
    }

    /// Append a log entry and forward it to `tracing`.
    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        details: Option<String>,
    ) {
        let message = message.into();
        let details_text = details.as_deref().unwrap_or("");
        match level {
            LogLevel::Debug => tracing::debug!(%category, details = details_text, "{}", message),
            LogLevel::Info => tracing::info!(%category, details = details_text, "{}", message),
            LogLevel::Warn => tracing::warn!(%category, details = details_text, "{}", message),
            LogLevel::Error => tracing::error!(%category, details = details_text, "{}", message),
        }
        push_bounded(
            &mut self.lock().logs,
            LogEntry {
                timestamp: Local::now(),
                level,
                category,
                message,
                details,
            },
            MAX_LOG_ENTRIES,
        );
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.lock().logs.iter().cloned().collect()
    }

    /// Log entries at or above `level`.
    pub fn logs_at_least(&self, level: LogLevel) -> Vec<LogEntry> {
        self.lock()
            .logs
            .iter()
            .filter(|e| e.level >= level)
            .cloned()
            .collect()
    }

    pub fn sent(&self) -> Vec<TraceEntry> {
        self.lock().sent.iter().cloned().collect()
    }

    pub fn received(&self) -> Vec<TraceEntry> {
        self.lock().received.iter().cloned().collect()
    }

    /// Drop all logs and traces. State and last error are kept.
    pub fn clear_logs(&self) {
        let mut inner = self.lock();
        inner.logs.clear();
        inner.sent.clear();
        inner.received.clear();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state();
        let inner = self.lock();
        StatusSnapshot {
            state,
            last_error: inner.last_error.clone(),
            transmitting: inner.transmitting,
            sent: inner.sent.iter().cloned().collect(),
            received: inner.received.iter().cloned().collect(),
            logs: inner.logs.iter().cloned().collect(),
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    while queue.len() >= limit {
        queue.pop_front();
    }
    queue.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let board = StatusBoard::new();
        assert_eq!(board.state(), ConnectionState::Disconnected);
        assert!(board.last_error().is_none());
        assert!(!board.is_transmitting());
        assert!(board.logs().is_empty());
    }

    #[test]
    fn test_state_change_is_logged_once() {
        let board = StatusBoard::new();
        board.set_state(ConnectionState::Connecting);
        board.set_state(ConnectionState::Connecting);
        let logs = board.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].category, LogCategory::Connection);
        assert_eq!(logs[0].message, "State changed: Disconnected -> Connecting");
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        board.set_state(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_report_error_sets_kind() {
        let board = StatusBoard::new();
        board.report_error(
            &AstmError::Transmission("Retransmission limit exceeded".into()),
            Some("frame 2".into()),
        );

        let last = board.last_error().unwrap();
        assert_eq!(last.kind, ErrorKind::Transmission);
        assert_eq!(last.message, "Transmission error: Retransmission limit exceeded");
        let errors = board.logs_at_least(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, LogCategory::Transmission);
        assert_eq!(errors[0].details.as_deref(), Some("frame 2"));

        board.clear_error();
        assert!(board.last_error().is_none());
    }

    #[test]
    fn test_log_is_bounded() {
        let board = StatusBoard::new();
        for i in 0..MAX_LOG_ENTRIES + 10 {
            board.log(LogLevel::Debug, LogCategory::System, format!("entry {}", i), None);
        }
        let logs = board.logs();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs[0].message, "entry 10");
    }

    #[test]
    fn test_traces_are_printable() {
        let board = StatusBoard::new();
        board.record_sent(&[0x05]);
        board.record_received(&[0x06]);
        assert_eq!(board.sent()[0].text, "<ENQ>");
        assert_eq!(board.received()[0].text, "<ACK>");

        board.clear_logs();
        assert!(board.sent().is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let board = StatusBoard::new();
        board.set_transmitting(true);
        board.report_error(&AstmError::NotConnected, None);
        let json = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(json["state"], "disconnected");
        assert_eq!(json["transmitting"], true);
        assert_eq!(json["last_error"]["kind"], "not_connected");
        assert_eq!(json["logs"][0]["level"], "ERROR");
    }
}
