//! Core module containing the instrument communication machinery
//!
//! This module provides:
//! - Transport plumbing for port-agent TCP connections
//! - Port-agent packet framing and instrument checksums
//! - Stream chunking with pluggable record sieves
//! - Sample decoding and the counter time base
//! - Resumable record parsing with checkpoints
//! - Protocol state machines
//! - Instrument sessions and multi-unit coordination
//! - Traffic logging

pub mod chunker;
pub mod coordinator;
pub mod logger;
pub mod parser;
pub mod protocol;
pub mod sample;
pub mod session;
pub mod state_machine;
pub mod timebase;
pub mod transport;
