//! TCP connection to a port agent

use super::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: 10,
        }
    }

    /// Set timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// `host:port` string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new("localhost", 4001)
    }
}

/// Open a TCP stream to the port agent
pub async fn connect(config: &TcpConfig) -> Result<TcpStream, TransportError> {
    let addr = config.address();
    tracing::info!(%addr, "connecting to port agent");

    let stream = tokio::time::timeout(Duration::from_secs(config.timeout_secs), TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout(config.timeout_secs))?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Set TCP_NODELAY for lower latency
    stream.set_nodelay(true).map_err(TransportError::IoError)?;

    Ok(stream)
}
