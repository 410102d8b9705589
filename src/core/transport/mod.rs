//! Transport layer for the port-agent connection
//!
//! The instrument itself sits behind a port agent that owns the serial
//! line; drivers only ever see a duplex byte stream. Anything that is
//! `AsyncRead + AsyncWrite` works (TCP sockets in production,
//! `tokio::io::duplex` pipes in tests).
//!
//! This module owns the two primitives every writer and reader shares:
//! - [`write_fully`]: re-issues the unwritten remainder after partial
//!   writes and backs off on transient errors
//! - [`read_exact`]: fills a buffer, treating a zero-byte read as a lost
//!   connection

mod tcp;

pub use tcp::{connect, TcpConfig};

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Peer closed the stream or the socket failed for good
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error ends the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::IoError(_))
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Packets or records that failed validation
    pub invalid_packets: u64,
    /// Write retries after transient errors
    pub write_retries: u64,
}

/// Retry behaviour at the write site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    /// Attempts allowed after a transient error before giving up
    pub max_retries: u32,
    /// Fixed delay between attempts
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(20),
        }
    }
}

/// Errors that go away if the write is simply tried again
pub fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::ConnectionReset
    )
}

/// Write the whole buffer, re-issuing the remainder after partial writes.
///
/// Returns the number of retries that were needed.
pub async fn write_fully<W>(writer: &mut W, data: &[u8], policy: &WritePolicy) -> Result<u32, TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    let mut attempts = 0;
    let mut retries = 0;

    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => {
                return Err(TransportError::ConnectionLost("write accepted zero bytes".into()));
            }
            Ok(n) => {
                if n < data.len() - written {
                    tracing::trace!(written = n, remaining = data.len() - written - n, "partial write");
                }
                written += n;
                attempts = 0;
            }
            Err(e) if is_transient(e.kind()) => {
                if attempts >= policy.max_retries {
                    return Err(TransportError::ConnectionLost(format!(
                        "write failed after {} retries: {}",
                        attempts, e
                    )));
                }
                attempts += 1;
                retries += 1;
                tracing::debug!(error = %e, attempt = attempts, "transient write error, backing off");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(TransportError::IoError(e)),
        }
    }

    writer.flush().await?;
    Ok(retries)
}

/// Fill `buf` completely.
///
/// Short reads are retried; a zero-byte read means the peer is gone.
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(TransportError::ConnectionLost(format!(
                    "peer closed stream after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(TransportError::IoError(e)),
        }
    }

    Ok(())
}

/// Serde adapter storing a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
