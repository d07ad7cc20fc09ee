//! Mock Host - a minimal LIS host that accepts ASTM messages.
//!
//! Listens on the given port, acknowledges every ENQ and valid frame, NAKs
//! frames with a bad checksum, and prints each completed message.
//!
//! # Running
//!
//! ```text
//! cargo run --example mock_host -- 3000
//! ```

use astm_client::protocol::control::{ACK, NAK};
use astm_client::protocol::{display_bytes, ControlByte, FrameBuffer, Inbound};
use astm_client::{Message, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buffer = FrameBuffer::new();
    let mut records = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        println!("<< {}", display_bytes(&chunk[..n]));

        for item in buffer.push(&chunk[..n]) {
            match item {
                Inbound::Control(ControlByte::Enq) => {
                    records.clear();
                    stream.write_all(&[ACK]).await?;
                }
                Inbound::Control(ControlByte::Eot) => {
                    match Message::from_records(std::mem::take(&mut records)) {
                        Ok(message) => println!("== {} message", message.kind().label()),
                        Err(e) => println!("== incomplete message: {}", e),
                    }
                }
                Inbound::Control(_) => {}
                Inbound::Frame(frame) => match Record::parse(&frame.text()) {
                    Ok(record) => {
                        records.push(record);
                        stream.write_all(&[ACK]).await?;
                    }
                    Err(e) => {
                        println!("!! {}", e);
                        stream.write_all(&[NAK]).await?;
                    }
                },
                Inbound::Text(bytes) => println!("?? {}", display_bytes(&bytes)),
                Inbound::Invalid { reason, .. } => {
                    println!("!! {}", reason);
                    stream.write_all(&[NAK]).await?;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(3000);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!("listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("accepted {}", peer);
        tokio::spawn(async move {
            if let Err(e) = serve(stream).await {
                println!("connection {} failed: {}", peer, e);
            }
        });
    }
}
