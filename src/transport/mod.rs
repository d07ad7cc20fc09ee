//! Transport module - TCP connection to the host.

mod tcp;

pub use tcp::{connect, Endpoint};
