//! Resumable record parser
//!
//! Chains the chunker, the sample decoder and the counter time base into a
//! single inbound pipeline. Its whole state can be captured in a
//! [`ParserCheckpoint`]: restoring one and feeding the bytes that followed
//! the checkpoint reproduces exactly the samples the original run produced.

use crate::core::chunker::{Chunk, Sieve, StreamChunk, StreamChunker};
use crate::core::sample::{DecodeError, Sample, SampleDecoder};
use crate::core::timebase::{CounterTimeBase, TimeBaseState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted parser position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserCheckpoint {
    /// Stream offset of the first byte not yet classified
    pub byte_offset: u64,
    /// Counter rollovers seen so far
    pub rollover_count: u32,
    /// First counter tick seen
    pub first_tick: Option<u32>,
    /// Last accepted counter tick
    #[serde(default)]
    pub last_tick: Option<u32>,
    /// Typical spacing between ticks
    #[serde(default)]
    pub typical_delta: Option<u64>,
    /// Wall time the counter is anchored to
    #[serde(default)]
    pub start_wall_time: Option<DateTime<Utc>>,
}

impl ParserCheckpoint {
    /// Checkpoint at the beginning of a stream
    pub fn at(byte_offset: u64) -> Self {
        Self {
            byte_offset,
            rollover_count: 0,
            first_tick: None,
            last_tick: None,
            typical_delta: None,
            start_wall_time: None,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from JSON
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    fn timebase_state(&self, fallback_start: DateTime<Utc>) -> TimeBaseState {
        TimeBaseState {
            start: self.start_wall_time.unwrap_or(fallback_start),
            rollover_count: self.rollover_count,
            first_tick: self.first_tick,
            last_tick: self.last_tick,
            typical_delta: self.typical_delta,
        }
    }
}

/// One result of feeding bytes to the parser
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    /// A record and its decoding. A failed decode still consumes the
    /// record; the stream continues past it.
    Record {
        /// The raw record
        chunk: Chunk,
        /// Decoded sample or why decoding failed
        result: Result<Sample, DecodeError>,
    },
    /// Bytes that are not part of any record
    NonData(Chunk),
}

impl ParseEvent {
    /// The decoded sample, if this is a good record
    pub fn sample(&self) -> Option<&Sample> {
        match self {
            Self::Record { result: Ok(sample), .. } => Some(sample),
            _ => None,
        }
    }
}

/// Inbound record pipeline
pub struct RecordParser<S> {
    chunker: StreamChunker<S>,
    decoder: SampleDecoder,
    timebase: Option<CounterTimeBase>,
}

impl<S: Sieve> RecordParser<S> {
    /// Create a parser without a counter time base
    pub fn new(sieve: S, decoder: SampleDecoder) -> Self {
        Self {
            chunker: StreamChunker::new(sieve),
            decoder,
            timebase: None,
        }
    }

    /// Timestamp tick fields through `timebase`
    #[must_use]
    pub fn with_timebase(mut self, timebase: CounterTimeBase) -> Self {
        self.timebase = Some(timebase);
        self
    }

    /// Set the chunker desync window
    #[must_use]
    pub fn with_desync_window(mut self, window: usize) -> Self {
        self.chunker = self.chunker.with_desync_window(window);
        self
    }

    /// Feed received bytes and return everything they completed
    pub fn feed(&mut self, data: &[u8], arrival: DateTime<Utc>) -> Vec<ParseEvent> {
        self.chunker.add(data);
        let mut events = Vec::new();
        while let Some(chunk) = self.chunker.next_chunk() {
            events.push(self.process(chunk, arrival));
        }
        events
    }

    fn process(&mut self, chunk: StreamChunk, arrival: DateTime<Utc>) -> ParseEvent {
        match chunk {
            StreamChunk::NonData(c) => {
                tracing::debug!(offset = c.start_offset, len = c.len(), "non-data bytes");
                ParseEvent::NonData(c)
            }
            StreamChunk::Data(c) => {
                let result = self.decoder.decode(&c, self.timebase.as_mut(), arrival);
                if let Err(error) = &result {
                    tracing::debug!(offset = c.start_offset, %error, "record failed to decode");
                }
                ParseEvent::Record { chunk: c, result }
            }
        }
    }

    /// Capture the current position
    pub fn checkpoint(&self) -> ParserCheckpoint {
        let mut cp = ParserCheckpoint::at(self.chunker.consumed_offset());
        if let Some(tb) = &self.timebase {
            let state = tb.state();
            cp.rollover_count = state.rollover_count;
            cp.first_tick = state.first_tick;
            cp.last_tick = state.last_tick;
            cp.typical_delta = state.typical_delta;
            cp.start_wall_time = Some(state.start);
        }
        cp
    }

    /// Resume from a checkpoint; the next byte fed must be the one at
    /// `checkpoint.byte_offset`
    pub fn restore(&mut self, checkpoint: &ParserCheckpoint) {
        tracing::info!(offset = checkpoint.byte_offset, "restoring parser checkpoint");
        self.chunker.reset(checkpoint.byte_offset);
        if let Some(tb) = &mut self.timebase {
            let start = tb.state().start;
            tb.restore(checkpoint.timebase_state(start));
        }
    }

    /// Restart the counter time base at `tick`
    pub fn rebase(&mut self, tick: u32, start: DateTime<Utc>) {
        if let Some(tb) = &mut self.timebase {
            tb.rebase(tick, start);
        }
    }

    /// The chunker
    pub fn chunker(&self) -> &StreamChunker<S> {
        &self.chunker
    }

    /// The decoder
    pub fn decoder(&self) -> &SampleDecoder {
        &self.decoder
    }
}
