//! Protocol implementations
//!
//! - Checksum algorithms used by instrument records (XOR, additive sums, CRC-16)
//! - Port-agent packet framing

pub mod checksum;
pub mod port_agent;

pub use checksum::{calculate as calc_checksum, ChecksumType, TrailingChecksum};
pub use port_agent::{PacketType, PortAgentCodec, WirePacket};
