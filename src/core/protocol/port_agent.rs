//! Port-agent packet protocol
//!
//! Every block of bytes exchanged with a port agent is wrapped in a 16-byte
//! header:
//!
//! ```text
//! ┌────────────────┬──────┬──────────────┬──────────────┬─────────────────┬─────────┐
//! │ Sentinel (3B)  │ Type │ Total length │ Checksum     │ Timestamp (8B)  │ Payload │
//! │ A3 9D 7A       │ (1B) │ (2B BE)      │ (2B BE)      │ NTP secs + frac │         │
//! └────────────────┴──────┴──────────────┴──────────────┴─────────────────┴─────────┘
//! ```
//!
//! The checksum is the additive sum of every header byte except the
//! checksum field itself, plus every payload byte, stored in the 16-bit
//! field.
//!
//! Two read paths exist: [`read_packet`] for a live socket that is always
//! aligned on a packet boundary, and [`PortAgentCodec`] / [`scan_packets`]
//! for captures that may start mid-packet and need resynchronising.

use super::checksum::{additive_sum, ChecksumType};
use crate::core::transport::{read_exact, write_fully, TransportError, WritePolicy};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

/// Packet sentinel
pub const SENTINEL: [u8; 3] = [0xA3, 0x9D, 0x7A];

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest payload a 16-bit total length can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_SIZE;

/// Header bytes left out of the checksum
pub const CHECKSUM_FIELD: Range<usize> = 6..8;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Port-agent packet errors
#[derive(Error, Debug)]
pub enum FramingError {
    /// Header does not start with the sentinel
    #[error("missing port agent sentinel")]
    BadSentinel,

    /// Total length smaller than the header
    #[error("invalid total length {0}")]
    InvalidLength(usize),

    /// Payload does not fit a 16-bit total length
    #[error("payload too large ({0} bytes, max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    /// Computed checksum differs from the carried one
    #[error("checksum mismatch: computed {computed:#06x}, carried {carried:#06x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        computed: u16,
        /// Checksum carried in the header
        carried: u16,
    },

    /// No sentinel found in the scanned window
    #[error("no sentinel found in {0} bytes")]
    Desync(usize),

    /// Underlying stream failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(TransportError::IoError(e))
    }
}

impl FramingError {
    /// Whether the stream is unusable after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Port-agent packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Bytes read from the instrument
    DataFromInstrument,
    /// Bytes the driver wants written to the instrument
    DataFromDriver,
    /// Command for the port agent itself (`break`, ...)
    PortAgentCommand,
    /// Port agent status report
    PortAgentStatus,
    /// Port agent fault report
    PortAgentFault,
    /// Command relayed to the instrument
    InstrumentCommand,
    /// Keep-alive
    Heartbeat,
    /// Serialized instrument data
    PickledDataFromInstrument,
    /// Serialized driver data
    PickledDataFromDriver,
    /// Unrecognized type code
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::DataFromInstrument,
            2 => Self::DataFromDriver,
            3 => Self::PortAgentCommand,
            4 => Self::PortAgentStatus,
            5 => Self::PortAgentFault,
            6 => Self::InstrumentCommand,
            7 => Self::Heartbeat,
            8 => Self::PickledDataFromInstrument,
            9 => Self::PickledDataFromDriver,
            other => Self::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        match t {
            PacketType::DataFromInstrument => 1,
            PacketType::DataFromDriver => 2,
            PacketType::PortAgentCommand => 3,
            PacketType::PortAgentStatus => 4,
            PacketType::PortAgentFault => 5,
            PacketType::InstrumentCommand => 6,
            PacketType::Heartbeat => 7,
            PacketType::PickledDataFromInstrument => 8,
            PacketType::PickledDataFromDriver => 9,
            PacketType::Unknown(other) => other,
        }
    }
}

/// 64-bit NTP timestamp carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NtpTimestamp {
    /// Seconds since 1900-01-01
    pub seconds: u32,
    /// Fraction of a second in units of 2^-32 s
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Current time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from wall-clock time
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let seconds = (dt.timestamp() + NTP_UNIX_OFFSET) as u32;
        let fraction = ((u64::from(dt.timestamp_subsec_nanos()) << 32) / 1_000_000_000) as u32;
        Self { seconds, fraction }
    }

    /// Convert to wall-clock time
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = i64::from(self.seconds) - NTP_UNIX_OFFSET;
        let nanos = ((u64::from(self.fraction) * 1_000_000_000) >> 32) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    /// Big-endian wire form
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..].copy_from_slice(&self.fraction.to_be_bytes());
        out
    }

    /// Parse the big-endian wire form
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            fraction: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        }
    }
}

/// Additive checksum over header (minus the checksum field) and payload
pub fn compute_checksum(header: &[u8; HEADER_SIZE], payload: &[u8]) -> u32 {
    additive_sum(header, &[CHECKSUM_FIELD]).wrapping_add(additive_sum(payload, &[]))
}

/// A port-agent packet, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    packet_type: PacketType,
    total_length: u16,
    checksum: u16,
    timestamp: NtpTimestamp,
    payload: Bytes,
    valid: bool,
}

impl WirePacket {
    /// Build an outbound packet stamped with the current time
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Result<Self, FramingError> {
        Self::with_timestamp(packet_type, payload, NtpTimestamp::now())
    }

    /// Build an outbound packet with an explicit timestamp
    pub fn with_timestamp(
        packet_type: PacketType,
        payload: impl Into<Bytes>,
        timestamp: NtpTimestamp,
    ) -> Result<Self, FramingError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FramingError::PayloadTooLarge(payload.len()));
        }

        let mut packet = Self {
            packet_type,
            total_length: (HEADER_SIZE + payload.len()) as u16,
            checksum: 0,
            timestamp,
            payload,
            valid: true,
        };
        let header = packet.header_bytes();
        packet.checksum = ChecksumType::Sum.truncate(compute_checksum(&header, &packet.payload)) as u16;
        Ok(packet)
    }

    /// Rebuild a received packet from its header and payload and verify it
    pub fn from_parts(header: &[u8; HEADER_SIZE], payload: Bytes) -> Result<Self, FramingError> {
        let parsed = parse_header(header)?;
        if parsed.payload_len() != payload.len() {
            return Err(FramingError::InvalidLength(HEADER_SIZE + payload.len()));
        }

        let computed = ChecksumType::Sum.truncate(compute_checksum(header, &payload)) as u16;
        Ok(Self {
            packet_type: parsed.packet_type,
            total_length: parsed.total_length,
            checksum: parsed.checksum,
            timestamp: parsed.timestamp,
            valid: computed == parsed.checksum,
            payload,
        })
    }

    /// Unpack a buffer holding exactly one packet
    pub fn unpack(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < HEADER_SIZE {
            return Err(FramingError::InvalidLength(buf.len()));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[..HEADER_SIZE]);
        Self::from_parts(&header, Bytes::copy_from_slice(&buf[HEADER_SIZE..]))
    }

    /// Serialize header then payload
    pub fn pack(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.total_length as usize);
        out.put_slice(&self.header_bytes());
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Header as it appears on the wire
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[..3].copy_from_slice(&SENTINEL);
        h[3] = self.packet_type.into();
        h[4..6].copy_from_slice(&self.total_length.to_be_bytes());
        h[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        h[8..].copy_from_slice(&self.timestamp.to_bytes());
        h
    }

    /// Packet type
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Header plus payload length
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    /// Checksum carried in the header
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Header timestamp
    pub fn timestamp(&self) -> NtpTimestamp {
        self.timestamp
    }

    /// Payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the packet, keeping only the payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether the carried checksum matched
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Fail with `ChecksumMismatch` for an invalid packet
    pub fn verify(&self) -> Result<(), FramingError> {
        if self.valid {
            return Ok(());
        }
        let computed = ChecksumType::Sum.truncate(compute_checksum(&self.header_bytes(), &self.payload)) as u16;
        Err(FramingError::ChecksumMismatch {
            computed,
            carried: self.checksum,
        })
    }
}

impl fmt::Display for WirePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} len={} ck={:#06x}{}",
            self.packet_type,
            self.total_length,
            self.checksum,
            if self.valid { "" } else { " (invalid)" }
        )
    }
}

/// Header fields as read off the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type
    pub packet_type: PacketType,
    /// Header plus payload length
    pub total_length: u16,
    /// Carried checksum
    pub checksum: u16,
    /// Header timestamp
    pub timestamp: NtpTimestamp,
}

impl PacketHeader {
    /// Payload bytes following the header
    pub fn payload_len(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }
}

/// Parse and sanity-check a header
pub fn parse_header(h: &[u8; HEADER_SIZE]) -> Result<PacketHeader, FramingError> {
    if h[..3] != SENTINEL {
        return Err(FramingError::BadSentinel);
    }
    let total_length = u16::from_be_bytes([h[4], h[5]]);
    if (total_length as usize) < HEADER_SIZE {
        return Err(FramingError::InvalidLength(total_length as usize));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&h[8..]);
    Ok(PacketHeader {
        packet_type: PacketType::from(h[3]),
        total_length,
        checksum: u16::from_be_bytes([h[6], h[7]]),
        timestamp: NtpTimestamp::from_bytes(ts),
    })
}

/// Read one packet from an aligned stream.
///
/// The packet is returned even when its checksum fails; check
/// [`WirePacket::is_valid`].
pub async fn read_packet<R>(reader: &mut R) -> Result<WirePacket, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    read_exact(reader, &mut header).await?;
    let parsed = parse_header(&header)?;

    let mut payload = vec![0u8; parsed.payload_len()];
    read_exact(reader, &mut payload).await?;

    let packet = WirePacket::from_parts(&header, Bytes::from(payload))?;
    if !packet.is_valid() {
        tracing::warn!(%packet, "port agent packet failed checksum");
    }
    Ok(packet)
}

/// Write one packet, header then payload. Returns the retries needed.
pub async fn write_packet<W>(writer: &mut W, packet: &WirePacket, policy: &WritePolicy) -> Result<u32, FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut retries = write_fully(writer, &packet.header_bytes(), policy).await?;
    retries += write_fully(writer, packet.payload(), policy).await?;
    Ok(retries)
}

/// Outcome of scanning a buffer that may start mid-packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    /// A valid packet occupies `start..end`
    Packet {
        /// Offset of the sentinel
        start: usize,
        /// One past the last payload byte
        end: usize,
    },
    /// More bytes are needed to decide anything from `from` onward
    Incomplete {
        /// First undecided offset
        from: usize,
    },
}

/// Find the next valid packet at or after `from`.
///
/// An invalid header or checksum discards the first sentinel byte and
/// retries from the next sentinel occurrence.
pub fn scan_next(buf: &[u8], mut from: usize) -> ScanStep {
    loop {
        let Some(rel) = find_sentinel(&buf[from.min(buf.len())..]) else {
            // A sentinel prefix may be straddling the end of the buffer
            let keep = buf.len().saturating_sub(SENTINEL.len() - 1).max(from);
            return ScanStep::Incomplete { from: keep };
        };
        let start = from + rel;
        if buf.len() - start < HEADER_SIZE {
            return ScanStep::Incomplete { from: start };
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[start..start + HEADER_SIZE]);
        let parsed = match parse_header(&header) {
            Ok(p) => p,
            Err(_) => {
                from = start + 1;
                continue;
            }
        };

        let end = start + parsed.total_length as usize;
        if end > buf.len() {
            return ScanStep::Incomplete { from: start };
        }
        let computed = ChecksumType::Sum.truncate(compute_checksum(&header, &buf[start + HEADER_SIZE..end])) as u16;
        if computed != parsed.checksum {
            tracing::debug!(offset = start, "discarding false sentinel match");
            from = start + 1;
            continue;
        }
        return ScanStep::Packet { start, end };
    }
}

/// Every complete, valid packet span in `buf`, in order
pub fn scan_packets(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let ScanStep::Packet { start, end } = scan_next(buf, from) {
        spans.push((start, end));
        from = end;
    }
    spans
}

fn find_sentinel(buf: &[u8]) -> Option<usize> {
    buf.windows(SENTINEL.len()).position(|w| w == SENTINEL)
}

/// `tokio_util` codec for port-agent streams and capture files.
///
/// Decoding resynchronises on the sentinel, so the input may start anywhere.
#[derive(Debug, Default)]
pub struct PortAgentCodec {
    discarded: u64,
}

impl PortAgentCodec {
    /// Create a codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes skipped while resynchronising
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Decoder for PortAgentCodec {
    type Item = WirePacket;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WirePacket>, FramingError> {
        match scan_next(src, 0) {
            ScanStep::Packet { start, end } => {
                if start > 0 {
                    tracing::debug!(skipped = start, "resynchronised on sentinel");
                    self.discarded += start as u64;
                    src.advance(start);
                }
                let bytes = src.split_to(end - start);
                WirePacket::unpack(&bytes).map(Some)
            }
            ScanStep::Incomplete { from } => {
                if from > 0 {
                    self.discarded += from as u64;
                    src.advance(from);
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<WirePacket>, FramingError> {
        loop {
            if let Some(packet) = self.decode(src)? {
                return Ok(Some(packet));
            }
            if src.is_empty() {
                return Ok(None);
            }
            // Nothing left can complete; drop up to the next sentinel
            let skip = find_sentinel(&src[1..]).map_or(src.len(), |p| p + 1);
            self.discarded += skip as u64;
            src.advance(skip);
        }
    }
}

impl Encoder<WirePacket> for PortAgentCodec {
    type Error = FramingError;

    fn encode(&mut self, item: WirePacket, dst: &mut BytesMut) -> Result<(), FramingError> {
        dst.reserve(item.total_length() as usize);
        dst.put_slice(&item.header_bytes());
        dst.put_slice(item.payload());
        Ok(())
    }
}
