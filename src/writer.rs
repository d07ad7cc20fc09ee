//! Dedicated writer task.
//!
//! The socket's write half is owned by one task that receives outbound units
//! over an mpsc channel. Control bytes and frames from the transmission
//! driver and the receive path all funnel through it, so writes never
//! interleave.
//!
//! # Architecture
//!
//! ```text
//! transmission driver ─┐
//! receive path (ACK)  ─┼─► mpsc::Sender<OutboundUnit> ─► Writer Task ─► TcpStream
//! disconnect (EOT)    ─┘                                    │
//!                                                           └─► StatusBoard (sent trace)
//! ```
//!
//! Units queued together are written with one vectored write. A unit may
//! carry a completion sender; it fires once the bytes have been flushed.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{AstmError, Result};
use crate::protocol::ControlByte;
use crate::status::StatusBoard;

/// Maximum units to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 16;

/// Bytes waiting to be written.
#[derive(Debug)]
pub struct OutboundUnit {
    pub bytes: Bytes,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundUnit {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, done: None }
    }

    #[inline]
    pub fn control(byte: ControlByte) -> Self {
        Self::new(Bytes::copy_from_slice(&[byte.as_byte()]))
    }

    fn notify(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

/// Handle for sending bytes to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundUnit>,
}

impl WriterHandle {
    /// Queue bytes without waiting for them to reach the socket.
    pub async fn send(&self, unit: OutboundUnit) -> Result<()> {
        self.tx
            .send(unit)
            .await
            .map_err(|_| AstmError::ConnectionClosed)
    }

    /// Queue a single control byte.
    pub async fn send_control(&self, byte: ControlByte) -> Result<()> {
        self.send(OutboundUnit::control(byte)).await
    }

    /// Write bytes and wait until they have been flushed to the socket.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(OutboundUnit {
            bytes,
            done: Some(done),
        })
        .await?;
        wait.await.map_err(|_| AstmError::ConnectionClosed)?
    }

    /// `true` once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending bytes.
///
/// The task ends when every handle has been dropped (after shutting down the
/// write half) or when a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    capacity: usize,
    status: Arc<StatusBoard>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer, status));
    (WriterHandle { tx }, task)
}

/// Main writer loop.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundUnit>,
    mut writer: W,
    status: Arc<StatusBoard>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(unit) => unit,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(unit) => batch.push(unit),
                Err(_) => break,
            }
        }

        match write_batch(&mut writer, &batch).await {
            Ok(()) => {
                for unit in batch {
                    status.record_sent(&unit.bytes);
                    unit.notify(Ok(()));
                }
            }
            Err(e) => {
                tracing::error!("Socket write failed: {}", e);
                let message = e.to_string();
                for unit in batch {
                    unit.notify(Err(AstmError::Connection(message.clone())));
                }
                rx.close();
                while let Some(unit) = rx.recv().await {
                    unit.notify(Err(AstmError::ConnectionClosed));
                }
                return Err(e);
            }
        }
    }
}

/// Write a batch of units using scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundUnit]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|u| u.bytes.len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(AstmError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for everything after the first `skip_bytes` bytes of the batch.
fn remaining_slices(batch: &[OutboundUnit], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for unit in batch {
        let end = offset + unit.bytes.len();
        if skip_bytes < end && !unit.bytes.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&unit.bytes[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn units(parts: &[&'static [u8]]) -> Vec<OutboundUnit> {
        parts
            .iter()
            .map(|p| OutboundUnit::new(Bytes::from_static(p)))
            .collect()
    }

    #[test]
    fn test_remaining_slices() {
        let batch = units(&[b"abc", b"", b"de"]);
        assert_eq!(remaining_slices(&batch, 0).len(), 2);

        let slices = remaining_slices(&batch, 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"c");

        let slices = remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"de");
    }

    #[tokio::test]
    async fn test_write_batch() {
        let mut buf = Cursor::new(Vec::new());
        write_batch(&mut buf, &units(&[b"\x05", b"\x021L|1|N\x030F09\r\n", b"\x04"]))
            .await
            .unwrap();
        assert_eq!(buf.into_inner(), b"\x05\x021L|1|N\x030F09\r\n\x04");
    }

    #[tokio::test]
    async fn test_write_waits_for_flush_and_records_trace() {
        let (client, mut server) = duplex(1024);
        let status = Arc::new(StatusBoard::new());
        let (handle, _task) = spawn_writer_task(client, 8, status.clone());

        handle.write(Bytes::from_static(&[0x05])).await.unwrap();

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x05]);
        assert_eq!(status.sent()[0].text, "<ENQ>");
    }

    #[tokio::test]
    async fn test_control_bytes_in_order() {
        let (client, mut server) = duplex(1024);
        let (handle, _task) = spawn_writer_task(client, 8, Arc::new(StatusBoard::new()));

        handle.send_control(ControlByte::Ack).await.unwrap();
        handle.send_control(ControlByte::Nak).await.unwrap();
        handle.write(Bytes::from_static(&[0x04])).await.unwrap();

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x06, 0x15, 0x04]);
    }

    #[tokio::test]
    async fn test_shutdown_on_handle_drop() {
        let (client, mut server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, 8, Arc::new(StatusBoard::new()));

        drop(handle);
        assert!(task.await.unwrap().is_ok());

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_peer_gone_fails() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, 8, Arc::new(StatusBoard::new()));

        let err = handle.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, AstmError::Connection(_) | AstmError::ConnectionClosed));
        assert!(task.await.unwrap().is_err());
    }
}
