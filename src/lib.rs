//! # astm-client
//!
//! Laboratory instrument simulator engine speaking ASTM E1381 (low-level
//! framing and handshake) and ASTM E1394 (records and messages) over TCP.
//!
//! ## Architecture
//!
//! - **Records and messages**: typed E1394 records serialized to `|`-delimited
//!   text, grouped into a [`Message`] (header ... terminator)
//! - **Frame codec**: one record per frame, `STX FN text ETX|ETB checksum CR LF`
//! - **Transmission**: a sans-IO state machine (ENQ, ACK-gated frames, EOT)
//!   driven by a per-connection session task
//! - **Status**: a [`StatusBoard`] with connection state, last error and
//!   bounded logs, observable by any presentation layer
//!
//! ## Example
//!
//! ```no_run
//! use astm_client::{ConnectionManager, Scenario};
//!
//! #[tokio::main]
//! async fn main() -> astm_client::Result<()> {
//!     let manager = ConnectionManager::new();
//!     manager.connect("localhost", 3000).await?;
//!     manager.send_scenario(Scenario::AbnormalResults).await?;
//!     manager.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod generator;
pub mod message;
pub mod panel;
pub mod protocol;
pub mod record;
pub mod status;
pub mod transmission;
pub mod transport;

mod client;
mod session;
mod writer;

pub use client::{ConnectionManager, ConnectionManagerBuilder};
pub use config::ClientConfig;
pub use error::{AstmError, ErrorKind, Result};
pub use generator::Scenario;
pub use message::{Message, MessageBuilder, MessageKind};
pub use record::Record;
pub use status::{ConnectionState, StatusBoard, StatusSnapshot};
