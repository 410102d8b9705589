//! Wire traffic log
//!
//! Records every block of bytes a session sends or receives, one line per
//! block, so a conversation with an instrument can be inspected or replayed
//! later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Lines written between automatic flushes
const FLUSH_EVERY: usize = 100;

/// Traffic log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogFormat {
    /// Printable text, escapes for everything else
    #[default]
    Text,
    /// Hex dump
    Hex,
    /// One JSON object per line
    JsonLines,
}

impl LogFormat {
    /// File extension for the format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "log",
            LogFormat::Hex => "hex",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// From the instrument
    Rx,
    /// To the instrument
    Tx,
    /// A note from the session itself
    Info,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Direction::Rx => "RX",
            Direction::Tx => "TX",
            Direction::Info => "##",
        }
    }
}

/// One logged block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// When the block was seen
    pub timestamp: DateTime<Utc>,
    /// Direction
    pub direction: Direction,
    /// Bytes, hex encoded
    pub hex: String,
}

impl TrafficEntry {
    /// Create an entry stamped now
    pub fn new(direction: Direction, data: &[u8]) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            hex: hex::encode(data),
        }
    }

    /// Render in `format`
    pub fn render(&self, data: &[u8], format: LogFormat) -> String {
        let stamp = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        match format {
            LogFormat::Text => format!("[{}] {} {}", stamp, self.direction.tag(), data.escape_ascii()),
            LogFormat::Hex => {
                let hex: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
                format!("[{}] {} {}", stamp, self.direction.tag(), hex.join(" "))
            }
            LogFormat::JsonLines => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

/// Line oriented traffic log writer
pub struct TrafficLogger {
    writer: Box<dyn Write + Send>,
    format: LogFormat,
    path: Option<PathBuf>,
    bytes_logged: u64,
    lines_logged: usize,
}

impl TrafficLogger {
    /// Log to any writer
    pub fn new(writer: Box<dyn Write + Send>, format: LogFormat) -> Self {
        Self {
            writer,
            format,
            path: None,
            bytes_logged: 0,
            lines_logged: 0,
        }
    }

    /// Append to the file at `path`, creating it if needed
    pub fn create(path: &Path, format: LogFormat) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        let mut logger = Self::new(Box::new(BufWriter::new(file)), format);
        logger.path = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), ?format, "traffic log opened");
        Ok(logger)
    }

    /// Log file path, if logging to a file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Log a block
    pub fn log(&mut self, direction: Direction, data: &[u8]) {
        let line = TrafficEntry::new(direction, data).render(data, self.format);
        if let Err(e) = writeln!(self.writer, "{}", line) {
            tracing::warn!(error = %e, "traffic log write failed");
            return;
        }
        self.bytes_logged += data.len() as u64;
        self.lines_logged += 1;
        if self.lines_logged % FLUSH_EVERY == 0 {
            self.flush();
        }
    }

    /// Log received bytes
    pub fn log_rx(&mut self, data: &[u8]) {
        self.log(Direction::Rx, data);
    }

    /// Log sent bytes
    pub fn log_tx(&mut self, data: &[u8]) {
        self.log(Direction::Tx, data);
    }

    /// Log a note
    pub fn note(&mut self, message: &str) {
        self.log(Direction::Info, message.as_bytes());
    }

    /// `(bytes, lines)` logged so far
    pub fn stats(&self) -> (u64, usize) {
        (self.bytes_logged, self.lines_logged)
    }

    /// Flush to disk
    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(error = %e, "traffic log flush failed");
        }
    }
}

impl Drop for TrafficLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// File name for a new traffic log, e.g. `ctd_20240101_120000.log`
pub fn log_file_name(prefix: &str, format: LogFormat) -> String {
    format!("{}_{}.{}", prefix, Utc::now().format("%Y%m%d_%H%M%S"), format.extension())
}
