//! Connection session: drives transmissions over one open socket.
//!
//! ```text
//!                 ┌──────────────┐  Wire   ┌──────────────────────────────┐
//!  TcpStream ───► │ reader task  │ ──────► │                              │
//!   (read half)   │ FrameBuffer  │         │        session task          │
//!                 └──────────────┘         │  idle: answer host ENQ/frames│
//!  ConnectionManager ── Command (FIFO) ──► │  busy: run one Transmission  │
//!                   ── abort (watch)  ───► │                              │
//!                                          └──────────────┬───────────────┘
//!                                                         │ OutboundUnit
//!                                                  ┌──────▼──────┐
//!                                                  │ writer task │ ───► TcpStream (write half)
//!                                                  └─────────────┘
//! ```
//!
//! Messages are transmitted strictly one at a time in the order their
//! commands were queued. Setting the abort flag cancels the transmission in
//! flight and every queued send until the flag is observed by a `Shutdown`
//! command.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{AstmError, Result};
use crate::message::Message;
use crate::protocol::{display_bytes, ChecksumFormat, ControlByte, FrameBuffer, Inbound};
use crate::record::Record;
use crate::status::{ConnectionState, LogCategory, LogLevel, StatusBoard};
use crate::transmission::{RetryPolicy, Transmission, TxAction, TxEvent};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size for the socket.
const READ_BUFFER_SIZE: usize = 4096;

/// Instruction for the session task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Transmit a message; the outcome goes to `reply` when present.
    Send {
        message: Message,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Optionally transmit a last message, then close the connection.
    Shutdown {
        farewell: Option<Message>,
        reply: oneshot::Sender<()>,
    },
}

/// Output of the reader task.
#[derive(Debug)]
enum Wire {
    Data(Inbound),
    /// `None` for a clean end of stream.
    Closed(Option<String>),
}

/// Why the session ended.
#[derive(Debug)]
enum Exit {
    Requested,
    RemoteClosed,
    ReadFailed(String),
    WriteFailed(String),
    ProtocolErrors(u32),
}

/// Cloneable sender for queuing messages.
#[derive(Debug, Clone)]
pub(crate) struct SessionSender {
    commands: mpsc::Sender<Command>,
}

impl SessionSender {
    /// Queue `message` and wait for its transmission to finish.
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send {
                message,
                reply: Some(reply),
            })
            .await
            .map_err(|_| AstmError::NotConnected)?;
        outcome.await.map_err(|_| AstmError::Cancelled)?
    }

    /// Queue `message` without waiting; the outcome is only logged.
    pub(crate) async fn enqueue(&self, message: Message) -> Result<()> {
        self.commands
            .send(Command::Send {
                message,
                reply: None,
            })
            .await
            .map_err(|_| AstmError::NotConnected)
    }
}

/// Owner's handle to a running session.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    sender: SessionSender,
    abort: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Start reader, writer and session tasks over an established stream.
    pub(crate) fn spawn<R, W>(
        reader: R,
        writer: W,
        config: &ClientConfig,
        status: Arc<StatusBoard>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (abort_tx, abort_rx) = watch::channel(false);

        let (writer, writer_task) =
            spawn_writer_task(writer, config.channel_capacity, status.clone());
        let frame_buffer = FrameBuffer::with_format(config.checksum_format);
        let reader_task = tokio::spawn(read_loop(reader, frame_buffer, inbound_tx, status.clone()));

        let session = Session {
            commands: commands_rx,
            inbound: inbound_rx,
            abort: abort_rx,
            writer,
            writer_task,
            reader_task,
            status,
            policy: RetryPolicy::from(config),
            format: config.checksum_format,
            error_threshold: config.protocol_error_threshold.max(1),
            disconnect_grace: config.disconnect_grace,
            receive_timeout: config.receive_timeout,
            protocol_errors: 0,
            inbox: None,
            exit: None,
        };

        let task = tokio::spawn(async move {
            let (session, exit) = session.run().await;
            session.finish(exit).await;
        });

        Self {
            sender: SessionSender {
                commands: commands_tx,
            },
            abort: abort_tx,
            task,
        }
    }

    pub(crate) fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// `true` once the session task has ended.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the transmission in flight and every queued send, transmit
    /// `farewell` if given, then close the connection and wait for the
    /// session to end.
    pub(crate) async fn shutdown(self, farewell: Option<Message>) {
        self.abort.send_replace(true);
        let (reply, done) = oneshot::channel();
        let queued = self
            .sender
            .commands
            .send(Command::Shutdown { farewell, reply })
            .await;
        if queued.is_ok() {
            let _ = done.await;
        }
        drop(self.sender);
        if let Err(e) = self.task.await {
            tracing::error!("Session task failed: {}", e);
        }
    }
}

/// Messages collected while the host is transmitting to us.
#[derive(Debug, Default)]
struct Inbox {
    lines: Vec<String>,
    records: Vec<Record>,
}

struct Session {
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<Wire>,
    abort: watch::Receiver<bool>,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    reader_task: JoinHandle<()>,
    status: Arc<StatusBoard>,
    policy: RetryPolicy,
    format: ChecksumFormat,
    error_threshold: u32,
    disconnect_grace: Duration,
    receive_timeout: Duration,
    /// Consecutive protocol errors.
    protocol_errors: u32,
    /// `Some` between a host ENQ and its EOT.
    inbox: Option<Inbox>,
    exit: Option<Exit>,
}

impl Session {
    async fn run(mut self) -> (Self, Exit) {
        loop {
            if let Some(exit) = self.exit.take() {
                return (self, exit);
            }
            let receiving = self.inbox.is_some();

            tokio::select! {
                command = self.commands.recv(), if !receiving => match command {
                    Some(Command::Send { message, reply }) => {
                        let result = self.transmit(&message, true).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(Command::Shutdown { farewell, reply }) => {
                        if let Some(message) = farewell {
                            self.send_farewell(&message).await;
                        }
                        let _ = reply.send(());
                        return (self, Exit::Requested);
                    }
                    None => return (self, Exit::Requested),
                },
                wire = self.inbound.recv() => match wire {
                    Some(Wire::Data(item)) => self.on_idle_inbound(item).await,
                    Some(Wire::Closed(reason)) => self.exit = Some(closed_exit(reason)),
                    None => self.exit = Some(Exit::RemoteClosed),
                },
                _ = tokio::time::sleep(self.receive_timeout), if receiving => {
                    self.inbox = None;
                    self.status.log(
                        LogLevel::Warn,
                        LogCategory::Protocol,
                        "Host stopped transmitting without EOT, discarding partial message",
                        None,
                    );
                }
                _ = self.abort.changed(), if receiving => {
                    self.inbox = None;
                    self.status.log(
                        LogLevel::Info,
                        LogCategory::Protocol,
                        "Abandoning inbound message for disconnect",
                        None,
                    );
                }
            }
        }
    }

    /// Drive one message through the state machine.
    ///
    /// With `honor_abort` the abort flag cancels the transmission.
    async fn transmit(&mut self, message: &Message, honor_abort: bool) -> Result<()> {
        if honor_abort && *self.abort.borrow() {
            let err = AstmError::Cancelled;
            self.status.report_error(&err, Some(message.kind().label().into()));
            return Err(err);
        }

        let mut machine = Transmission::new(message, self.policy, self.format);
        self.status.set_transmitting(true);
        self.status.log(
            LogLevel::Info,
            LogCategory::Transmission,
            format!(
                "Sending {} message ({} records)",
                message.kind().label(),
                machine.frame_count()
            ),
            None,
        );

        let mut actions: VecDeque<TxAction> = machine.start().into();
        let result = loop {
            let Some(action) = actions.pop_front() else {
                break Err(AstmError::Transmission("Transmission stalled".into()));
            };
            match action {
                TxAction::SendControl(byte) => {
                    let event = self.write(Bytes::copy_from_slice(&[byte.as_byte()])).await;
                    actions.extend(machine.handle(event));
                }
                TxAction::SendFrame {
                    frame,
                    number,
                    attempt,
                } => {
                    if let Some(event) = self.discard_stale_replies().await {
                        actions.extend(machine.handle(event));
                        continue;
                    }
                    if attempt > 1 {
                        self.status.log(
                            LogLevel::Warn,
                            LogCategory::Transmission,
                            format!("Retransmitting frame {} (attempt {})", number, attempt),
                            None,
                        );
                    } else {
                        self.status.log(
                            LogLevel::Debug,
                            LogCategory::Transmission,
                            format!("Sending frame {}", number),
                            Some(display_bytes(&frame)),
                        );
                    }
                    let event = self.write(frame).await;
                    actions.extend(machine.handle(event));
                }
                // A failed write already ended the machine.
                TxAction::Wait(_) | TxAction::Backoff(_) if machine.is_idle() => {}
                TxAction::Wait(timeout) => {
                    match self.next_tx_event(Instant::now() + timeout, honor_abort).await {
                        Some(event) => actions.extend(machine.handle(event)),
                        None => actions = machine.abort().into(),
                    }
                }
                TxAction::Backoff(delay) => {
                    if !self.pause(delay, honor_abort).await {
                        actions = machine.abort().into();
                    }
                }
                TxAction::Complete => break Ok(()),
                TxAction::Fail { error, send_eot } => {
                    if send_eot && !self.writer.is_closed() {
                        let _ = self.writer.send_control(ControlByte::Eot).await;
                    }
                    break Err(error);
                }
            }
        };

        self.status.set_transmitting(false);
        match &result {
            Ok(()) => self.status.log(
                LogLevel::Info,
                LogCategory::Transmission,
                format!("{} message sent", message.kind().label()),
                None,
            ),
            Err(e) => self
                .status
                .report_error(e, Some(format!("{} message", message.kind().label()))),
        }
        result
    }

    /// Transmit the disconnect notification, bounded by the grace period.
    async fn send_farewell(&mut self, message: &Message) {
        if self.exit.is_some() || self.writer.is_closed() {
            return;
        }
        let grace = self.disconnect_grace;
        if tokio::time::timeout(grace, self.transmit(message, false))
            .await
            .is_err()
        {
            self.status.set_transmitting(false);
            self.status.log(
                LogLevel::Warn,
                LogCategory::Transmission,
                format!(
                    "Disconnect message not completed within {} ms",
                    grace.as_millis()
                ),
                None,
            );
        }
    }

    /// Hand bytes to the writer and translate the outcome for the machine.
    async fn write(&mut self, bytes: Bytes) -> TxEvent {
        match self.writer.write(bytes).await {
            Ok(()) => TxEvent::Written,
            Err(e) => {
                self.exit.get_or_insert(Exit::WriteFailed(e.to_string()));
                TxEvent::Closed
            }
        }
    }

    /// Wait for ACK/NAK until `deadline`. `None` means the abort flag was set.
    async fn next_tx_event(&mut self, deadline: Instant, honor_abort: bool) -> Option<TxEvent> {
        loop {
            if honor_abort && *self.abort.borrow_and_update() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Some(TxEvent::Timeout),
                changed = self.abort.changed(), if honor_abort => {
                    if changed.is_err() {
                        return None;
                    }
                }
                wire = self.inbound.recv() => match wire {
                    Some(Wire::Data(item)) => {
                        if let Some(event) = self.on_busy_inbound(item).await {
                            return Some(event);
                        }
                    }
                    Some(Wire::Closed(reason)) => {
                        self.exit.get_or_insert(closed_exit(reason));
                        return Some(TxEvent::Closed);
                    }
                    None => {
                        self.exit.get_or_insert(Exit::RemoteClosed);
                        return Some(TxEvent::Closed);
                    }
                },
            }
        }
    }

    /// Drop ACK/NAK bytes already queued before a frame is written. They
    /// answer an earlier attempt, never the frame about to go out.
    async fn discard_stale_replies(&mut self) -> Option<TxEvent> {
        while let Ok(wire) = self.inbound.try_recv() {
            match wire {
                Wire::Data(Inbound::Control(byte @ (ControlByte::Ack | ControlByte::Nak))) => {
                    self.status.log(
                        LogLevel::Debug,
                        LogCategory::Protocol,
                        format!("Discarding late {}", byte),
                        None,
                    );
                }
                Wire::Data(item) => {
                    if let Some(event) = self.on_busy_inbound(item).await {
                        return Some(event);
                    }
                }
                Wire::Closed(reason) => {
                    self.exit.get_or_insert(closed_exit(reason));
                    return Some(TxEvent::Closed);
                }
            }
        }
        None
    }

    /// Sleep for `delay`; `false` if the abort flag was set meanwhile.
    async fn pause(&mut self, delay: Duration, honor_abort: bool) -> bool {
        if !honor_abort {
            tokio::time::sleep(delay).await;
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !*self.abort.borrow(),
            _ = self.abort.changed() => false,
        }
    }

    /// Inbound data while one of our messages is in flight.
    async fn on_busy_inbound(&mut self, item: Inbound) -> Option<TxEvent> {
        match item {
            Inbound::Control(ControlByte::Ack) => {
                self.protocol_errors = 0;
                Some(TxEvent::Ack)
            }
            Inbound::Control(ControlByte::Nak) => {
                self.protocol_errors = 0;
                Some(TxEvent::Nak)
            }
            Inbound::Control(ControlByte::Enq) => {
                self.status.log(
                    LogLevel::Info,
                    LogCategory::Protocol,
                    "Host ENQ while transmitting, answering NAK",
                    None,
                );
                self.reply(ControlByte::Nak).await;
                None
            }
            Inbound::Control(ControlByte::Eot) => {
                self.protocol_error("Unexpected EOT during transmission", None)
            }
            Inbound::Frame(frame) => self.protocol_error(
                &format!("Unexpected frame {} during transmission", frame.number),
                Some(frame.text()),
            ),
            Inbound::Text(text) => self.protocol_error(
                "Unexpected data during transmission",
                Some(display_bytes(&text)),
            ),
            Inbound::Invalid { raw, reason } => {
                self.protocol_error(&reason, Some(display_bytes(&raw)))
            }
        }
    }

    /// Inbound data while no message of ours is in flight.
    async fn on_idle_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Control(ControlByte::Enq) => {
                if *self.abort.borrow() || self.inbox.is_some() {
                    self.reply(ControlByte::Nak).await;
                    return;
                }
                self.inbox = Some(Inbox::default());
                self.status.log(
                    LogLevel::Info,
                    LogCategory::Protocol,
                    "Host requested transmission",
                    None,
                );
                self.reply(ControlByte::Ack).await;
            }
            Inbound::Frame(frame) => {
                let Some(inbox) = self.inbox.as_mut() else {
                    self.protocol_error("Frame received without ENQ", Some(frame.text()));
                    return;
                };
                self.protocol_errors = 0;
                let text = frame.text();
                for line in text.split('\r').filter(|l| !l.is_empty()) {
                    match Record::parse(line) {
                        Ok(record) => {
                            inbox.records.push(record);
                            inbox.lines.push(line.to_string());
                        }
                        Err(e) => self.status.log(
                            LogLevel::Warn,
                            LogCategory::Message,
                            e.to_string(),
                            Some(line.to_string()),
                        ),
                    }
                }
                self.reply(ControlByte::Ack).await;
            }
            Inbound::Invalid { raw, reason } => {
                if self.inbox.is_some() {
                    self.reply(ControlByte::Nak).await;
                }
                self.protocol_error(&reason, Some(display_bytes(&raw)));
            }
            Inbound::Control(ControlByte::Eot) => match self.inbox.take() {
                Some(inbox) => self.finish_inbound(inbox),
                None => {
                    self.protocol_error("Unexpected EOT while idle", None);
                }
            },
            Inbound::Control(byte) => {
                self.protocol_error(&format!("Unexpected {} while idle", byte), None);
            }
            Inbound::Text(text) => self.status.log(
                LogLevel::Info,
                LogCategory::Message,
                "Received text",
                Some(display_bytes(&text)),
            ),
        }
    }

    fn finish_inbound(&mut self, inbox: Inbox) {
        let details = Some(inbox.lines.join("\n"));
        match Message::from_records(inbox.records) {
            Ok(message) => self.status.log(
                LogLevel::Info,
                LogCategory::Message,
                format!(
                    "Received {} message ({} records)",
                    message.kind().label(),
                    message.len()
                ),
                details,
            ),
            Err(e) => self.status.log(
                LogLevel::Warn,
                LogCategory::Message,
                format!("Received records do not form a message: {}", e),
                details,
            ),
        }
    }

    /// Count a protocol error. Returns `Some(Closed)` once the threshold of
    /// consecutive errors is reached.
    fn protocol_error(&mut self, message: &str, details: Option<String>) -> Option<TxEvent> {
        self.protocol_errors += 1;
        self.status
            .report_error(&AstmError::Protocol(message.to_string()), details);
        if self.protocol_errors >= self.error_threshold {
            self.exit
                .get_or_insert(Exit::ProtocolErrors(self.protocol_errors));
            return Some(TxEvent::Closed);
        }
        None
    }

    async fn reply(&mut self, byte: ControlByte) {
        if let Err(e) = self.writer.send_control(byte).await {
            self.exit.get_or_insert(Exit::WriteFailed(e.to_string()));
        }
    }

    /// Tear down the tasks, fail whatever is still queued and publish the
    /// final state.
    async fn finish(self, exit: Exit) {
        let Session {
            mut commands,
            writer,
            writer_task,
            reader_task,
            status,
            ..
        } = self;

        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Send {
                    reply: Some(reply), ..
                } => {
                    let err = match exit {
                        Exit::Requested => AstmError::Cancelled,
                        _ => AstmError::ConnectionClosed,
                    };
                    let _ = reply.send(Err(err));
                }
                Command::Send { reply: None, .. } => {}
                Command::Shutdown { reply, .. } => {
                    let _ = reply.send(());
                }
            }
        }

        drop(writer);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Writer ended with error: {}", e),
            Err(e) => tracing::error!("Writer task failed: {}", e),
        }
        reader_task.abort();
        status.set_transmitting(false);

        match exit {
            Exit::Requested => status.set_state(ConnectionState::Disconnected),
            Exit::RemoteClosed => {
                status.report_error(
                    &AstmError::Connection("Connection closed by remote host".into()),
                    None,
                );
                status.set_state(ConnectionState::Disconnected);
            }
            Exit::ReadFailed(reason) | Exit::WriteFailed(reason) => {
                status.report_error(&AstmError::Connection(reason), None);
                status.set_state(ConnectionState::Error);
            }
            Exit::ProtocolErrors(count) => {
                status.report_error(
                    &AstmError::Protocol(format!(
                        "{} consecutive protocol errors, closing connection",
                        count
                    )),
                    None,
                );
                status.set_state(ConnectionState::Error);
            }
        }
    }
}

fn closed_exit(reason: Option<String>) -> Exit {
    match reason {
        Some(reason) => Exit::ReadFailed(reason),
        None => Exit::RemoteClosed,
    }
}

/// Read the socket, split it into protocol units and forward them.
async fn read_loop<R>(
    mut reader: R,
    mut frame_buffer: FrameBuffer,
    tx: mpsc::Sender<Wire>,
    status: Arc<StatusBoard>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(Wire::Closed(None)).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Wire::Closed(Some(e.to_string()))).await;
                return;
            }
        };

        status.record_received(&buf[..n]);
        for item in frame_buffer.push(&buf[..n]) {
            if tx.send(Wire::Data(item)).await.is_err() {
                return;
            }
        }
    }
}
