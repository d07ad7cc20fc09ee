//! TCP client transport.
//!
//! # Example
//!
//! ```ignore
//! use astm_client::transport::{connect, Endpoint};
//!
//! let endpoint = Endpoint::new("localhost", 3000)?;
//! let stream = connect(&endpoint, Duration::from_secs(10)).await?;
//! ```

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{AstmError, Result};

/// Validated host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Validate a host and port.
    ///
    /// `port` is taken as `u32` so out-of-range input from a text field can be
    /// rejected here rather than silently truncated.
    pub fn new(host: &str, port: u32) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(AstmError::Configuration("Host must not be empty".into()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                AstmError::Configuration(format!("Port {} is out of range (1-65535)", port))
            })?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Open a TCP stream to `endpoint`, giving up after `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let attempt = TcpStream::connect((endpoint.host(), endpoint.port()));
    let stream = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(AstmError::Connection(format!(
                "Failed to connect to {}: {}",
                endpoint, e
            )))
        }
        Err(_) => {
            return Err(AstmError::Connection(format!(
                "Timed out connecting to {} after {} ms",
                endpoint,
                timeout.as_millis()
            )))
        }
    };

    // Control bytes are single-byte writes; don't let Nagle hold them back.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_validation() {
        assert_eq!(Endpoint::new("localhost", 3000).unwrap().port(), 3000);
        assert_eq!(Endpoint::new(" host ", 1).unwrap().host(), "host");
        assert_eq!(Endpoint::new("h", 65535).unwrap().port(), 65535);

        for port in [0, 65536, 70000] {
            let err = Endpoint::new("localhost", port).unwrap_err();
            assert!(matches!(err, AstmError::Configuration(_)), "port {}", port);
        }
        assert!(matches!(
            Endpoint::new("  ", 3000),
            Err(AstmError::Configuration(_))
        ));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.5", 3000).unwrap().to_string(), "10.0.0.5:3000");
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = Endpoint::new("127.0.0.1", port as u32).unwrap();
        let (stream, accepted) = tokio::join!(
            connect(&endpoint, Duration::from_secs(1)),
            listener.accept()
        );
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new("127.0.0.1", port as u32).unwrap();
        let err = connect(&endpoint, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, AstmError::Connection(_)));
    }
}
