//! Integration tests for astm-client.
//!
//! Each test runs the full manager against an in-process mock LIS host on a
//! loopback TCP listener.

use std::collections::VecDeque;
use std::time::Duration;

use astm_client::config::RetryBackoff;
use astm_client::protocol::control::{ACK, NAK};
use astm_client::protocol::{build_frame, display_bytes, ControlByte, Frame, FrameBuffer, Inbound};
use astm_client::status::LogCategory;
use astm_client::{AstmError, ConnectionManager, ConnectionState, ErrorKind, Scenario};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the mock host answers frames.
#[derive(Clone, Copy)]
enum FrameReply {
    Ack,
    NakOnce,
}

struct MockHost {
    stream: TcpStream,
    buffer: FrameBuffer,
    pending: VecDeque<Inbound>,
}

impl MockHost {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buffer: FrameBuffer::new(),
            pending: VecDeque::new(),
        }
    }

    /// Next inbound unit, `None` once the client closed the socket.
    async fn next(&mut self) -> Option<Inbound> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let mut buf = [0u8; 1024];
            let n = self.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            self.pending.extend(self.buffer.push(&buf[..n]));
        }
    }

    async fn expect_control(&mut self, byte: ControlByte) {
        match self.next().await {
            Some(Inbound::Control(b)) if b == byte => {}
            other => panic!("expected {}, got {:?}", byte, other),
        }
    }

    async fn expect_frame(&mut self) -> Frame {
        match self.next().await {
            Some(Inbound::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    async fn reply(&mut self, byte: u8) {
        self.stream.write_all(&[byte]).await.unwrap();
    }

    /// Accept one full message: ENQ, frames up to ETX, EOT.
    async fn receive_message(&mut self, mode: FrameReply) -> Vec<Frame> {
        self.expect_control(ControlByte::Enq).await;
        self.reply(ACK).await;

        let mut frames = Vec::new();
        let mut nak_pending = matches!(mode, FrameReply::NakOnce);
        loop {
            let frame = self.expect_frame().await;
            if nak_pending {
                nak_pending = false;
                self.reply(NAK).await;
                continue;
            }
            self.reply(ACK).await;
            let last = frame.is_last;
            frames.push(frame);
            if last {
                break;
            }
        }
        self.expect_control(ControlByte::Eot).await;
        frames
    }
}

fn texts(frames: &[Frame]) -> Vec<String> {
    frames.iter().map(Frame::text).collect()
}

fn manager() -> ConnectionManager {
    ConnectionManager::builder()
        .enq_timeout(Duration::from_millis(300))
        .ack_timeout(Duration::from_millis(300))
        .max_attempts(3)
        .retry_backoff(RetryBackoff::NONE)
        .disconnect_grace(Duration::from_secs(1))
        .build()
        .unwrap()
}

async fn listener() -> (TcpListener, u32) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port as u32)
}

/// Connect and consume the automatic connect status message.
async fn connected() -> (ConnectionManager, MockHost, Vec<Frame>) {
    let (listener, port) = listener().await;
    let manager = manager();
    let (connect, mut host) = tokio::join!(manager.connect("127.0.0.1", port), async {
        MockHost::accept(&listener).await
    });
    connect.unwrap();
    let frames = host.receive_message(FrameReply::Ack).await;
    (manager, host, frames)
}

#[tokio::test]
async fn test_connect_announces_instrument() {
    let (manager, _host, frames) = connected().await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    let texts = texts(&frames);
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("H|\\^&|||Skyla Solution^1.0.0|||||P|1|"));
    assert_eq!(texts[1], "C|1|I|SN^Connect|G");
    assert_eq!(texts[2], "L|1|N");

    let numbers: Vec<u8> = frames.iter().map(|f| f.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(!frames[0].is_last && !frames[1].is_last && frames[2].is_last);
}

#[tokio::test]
async fn test_sent_trace_matches_wire_frames() {
    let (manager, _host, _) = connected().await;

    let sent = manager.status().sent();
    assert_eq!(sent[0].text, "<ENQ>");
    let terminator = display_bytes(&build_frame("L|1|N", 3, true));
    assert!(sent.iter().any(|t| t.text == terminator), "{:?}", sent);
}

#[tokio::test]
async fn test_send_scenario_end_to_end() {
    let (manager, mut host, _) = connected().await;

    let (result, frames) = tokio::join!(
        manager.send_scenario(Scenario::NormalLiverPanel),
        host.receive_message(FrameReply::Ack)
    );
    result.unwrap();

    let letters: String = texts(&frames)
        .iter()
        .map(|t| t.chars().next().unwrap())
        .collect();
    assert_eq!(letters, "HPORRL");
    assert!(texts(&frames)[1].contains("金城武"));
    assert!(!manager.status().is_transmitting());
}

#[tokio::test]
async fn test_nak_is_retransmitted() {
    let (manager, mut host, _) = connected().await;

    let (result, frames) = tokio::join!(
        manager.send_scenario(Scenario::StatusComment),
        host.receive_message(FrameReply::NakOnce)
    );
    result.unwrap();
    assert_eq!(frames.len(), 3);

    let retries = manager
        .status()
        .logs()
        .into_iter()
        .filter(|e| e.message.starts_with("Retransmitting frame 1"))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn test_unacknowledged_frame_fails_but_connection_survives() {
    let (manager, mut host, _) = connected().await;

    let host_side = async {
        host.expect_control(ControlByte::Enq).await;
        host.reply(ACK).await;
        // Three attempts of frame 1, never acknowledged.
        let mut attempts = Vec::new();
        for _ in 0..3 {
            attempts.push(host.expect_frame().await);
        }
        host.expect_control(ControlByte::Eot).await;
        attempts
    };
    let (result, attempts) = tokio::join!(
        manager.send_scenario(Scenario::StatusComment),
        host_side
    );

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transmission);
    assert_eq!(err.to_string(), "Transmission error: Retransmission limit exceeded");
    assert!(attempts.iter().all(|f| f.number == 1));
    assert_eq!(manager.state(), ConnectionState::Connected);

    // The next message goes through normally.
    let (result, frames) = tokio::join!(
        manager.send_scenario(Scenario::StatusComment),
        host.receive_message(FrameReply::Ack)
    );
    result.unwrap();
    assert_eq!(frames.len(), 3);
}

#[tokio::test]
async fn test_unanswered_enq_fails_to_establish() {
    let (manager, mut host, _) = connected().await;

    let (result, _) = tokio::join!(manager.send_scenario(Scenario::StatusComment), async {
        host.expect_control(ControlByte::Enq).await;
    });

    let err = result.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Transmission error: Failed to establish transmission"
    );
    let last = manager.status().last_error().unwrap();
    assert_eq!(last.kind, ErrorKind::Transmission);
}

#[tokio::test]
async fn test_disconnect_sends_disconnect_message_then_closes() {
    let (manager, mut host, _) = connected().await;

    let host_side = async {
        let frames = host.receive_message(FrameReply::Ack).await;
        let closed = host.next().await.is_none();
        (frames, closed)
    };
    let ((), (frames, closed)) = tokio::join!(manager.disconnect(), host_side);

    assert_eq!(texts(&frames)[1], "C|1|I|SN^Disconnect|G");
    assert!(closed);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_send() {
    let (manager, mut host, _) = connected().await;

    let sending = manager.send_scenario(Scenario::AbnormalResults);
    let host_side = async {
        host.expect_control(ControlByte::Enq).await;
        host.reply(ACK).await;
        host.expect_frame().await;
        // Leave frame 1 unanswered and ask the client to go away.
        let disconnect = manager.disconnect();
        let farewell = async {
            host.expect_control(ControlByte::Eot).await;
            host.receive_message(FrameReply::Ack).await
        };
        let ((), frames) = tokio::join!(disconnect, farewell);
        frames
    };
    let (result, frames) = tokio::join!(sending, host_side);

    assert!(matches!(result, Err(AstmError::Cancelled)));
    assert_eq!(texts(&frames)[1], "C|1|I|SN^Disconnect|G");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let (manager, mut host, _) = connected().await;
    let (next, next_port) = listener().await;

    // The reconnect first closes the current session; the host leaves its
    // disconnect message unanswered so that close takes a while.
    let host_side = async {
        host.expect_control(ControlByte::Enq).await;
        manager.disconnect().await;
    };
    let (result, ()) = tokio::join!(manager.connect("127.0.0.1", next_port), host_side);

    assert!(matches!(result, Err(AstmError::Cancelled)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    let accepted = tokio::time::timeout(Duration::from_millis(100), next.accept()).await;
    assert!(accepted.is_err());
}

#[tokio::test]
async fn test_send_requires_connection() {
    let manager = manager();
    let err = manager
        .send_scenario(Scenario::NormalLiverPanel)
        .await
        .unwrap_err();
    assert!(matches!(err, AstmError::NotConnected));
    assert_eq!(err.to_string(), "Not connected to server");
    assert!(manager.status().sent().is_empty());
}

#[tokio::test]
async fn test_invalid_port_never_touches_network() {
    let manager = manager();
    for port in [0, 65536] {
        let err = manager.connect("127.0.0.1", port).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_remote_close_is_reported() {
    let (manager, host, _) = connected().await;
    let mut state = manager.status().subscribe();
    drop(host);

    while *state.borrow_and_update() == ConnectionState::Connected {
        state.changed().await.unwrap();
    }
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    let last = manager.status().last_error().unwrap();
    assert_eq!(last.kind, ErrorKind::Connection);

    let err = manager
        .send_scenario(Scenario::StatusComment)
        .await
        .unwrap_err();
    assert!(matches!(err, AstmError::NotConnected));
}

#[tokio::test]
async fn test_status_logs_cover_the_session() {
    let (manager, _host, _) = connected().await;
    let status = manager.status();

    assert!(status
        .logs()
        .iter()
        .any(|e| e.category == LogCategory::Connection && e.message.starts_with("Connected to")));

    // The completion entry is written right after the EOT leaves the socket.
    let mut announced = false;
    for _ in 0..100 {
        announced = status.logs().iter().any(|e| {
            e.category == LogCategory::Transmission && e.message == "Connection Status message sent"
        });
        if announced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(announced);

    let snapshot = serde_json::to_value(manager.snapshot()).unwrap();
    assert_eq!(snapshot["state"], "connected");
}
