//! # Seacomm Core Library
//!
//! Communication core for oceanographic instrument drivers:
//! - Port-agent packet framing (bit-exact, with log-scan resync)
//! - Checksums and CRCs used by instrument record formats
//! - Fragmentation-independent stream chunking with pluggable sieves
//! - Schema-driven sample decoding with counter rollover handling
//! - Protocol state machines, including composite "reactive" ones
//! - Instrument sessions with command/response waits and async samples
//! - Ordered lifecycle control of multi-unit instruments
//!
//! ## Example
//!
//! ```rust,no_run
//! use seacomm_core::{CommandRequest, InstrumentSession, Prompt, SessionMachine, TcpConfig};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum State { Command }
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Event { Sample }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = seacomm_core::core::transport::connect(&TcpConfig::new("localhost", 4001)).await?;
//!     let fsm: SessionMachine<State, Event, ()> = SessionMachine::new(State::Command);
//!     let session = InstrumentSession::builder("ctd", fsm, ())
//!         .literal_command("ts", b"ts\r\n")
//!         .start(stream)?;
//!
//!     let reply = session.send(CommandRequest::new("ts").expect(Prompt::literal("S>"))).await?;
//!     println!("{:?}", reply.map(|r| r.text()));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;
pub mod logging;

// Re-exports for convenience
pub use crate::config::{ConfigError, DriverConfig, PortAgentConfig};
pub use crate::core::chunker::{Chunk, LineSieve, MarkerSieve, Sieve, StreamChunk, StreamChunker};
pub use crate::core::coordinator::{InstrumentUnit, LifecycleCommand, MultiUnitCoordinator, SessionUnit};
pub use crate::core::logger::{LogFormat, TrafficLogger};
pub use crate::core::parser::{ParserCheckpoint, RecordParser};
pub use crate::core::protocol::checksum::{ChecksumType, TrailingChecksum};
pub use crate::core::protocol::port_agent::{FramingError, PacketType, PortAgentCodec, WirePacket};
pub use crate::core::sample::{DecodeError, Sample, SampleDecoder, Schema};
pub use crate::core::session::{
    CommandRequest, EventSink, InstrumentSession, Prompt, SessionError, SessionEvent, SessionMachine,
};
pub use crate::core::state_machine::{HandlerResult, ProtocolStateMachine, ReactiveMachine, StateMachineError};
pub use crate::core::timebase::{CounterTimeBase, TimeBaseError, TimeBaseSettings};
pub use crate::core::transport::{TcpConfig, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
