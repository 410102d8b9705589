//! Resumable stream chunker
//!
//! Bytes arrive from the instrument in arbitrary fragments. The chunker
//! keeps them in one buffer and asks a [`Sieve`] where the complete records
//! are. Everything the sieve matched comes out as [`StreamChunk::Data`],
//! everything it skipped over as [`StreamChunk::NonData`], in stream order.
//!
//! Only the bytes in front of the last matched record are ever classified,
//! so the output is the same no matter how the input was split across
//! [`StreamChunker::add`] calls. The tail after the last record stays
//! buffered until more bytes arrive or it outgrows the desync window.
//!
//! Non-data runs are cut into blocks of at most one desync window,
//! counted from the end of the previous record. A block is flushed early
//! only once the sieve's lookahead lies entirely behind it, so early
//! flushes land on the same boundaries the whole stream would produce.

mod sieve;

pub use sieve::{from_fn, FnSieve, LineSieve, MarkerSieve, PortAgentSieve, RecordMarker, Sieve};

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;

/// Default upper bound on unclassified bytes
pub const DEFAULT_DESYNC_WINDOW: usize = 64 * 1024;

/// A contiguous span of the logical byte stream
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Stream offset of the first byte
    pub start_offset: u64,
    /// Stream offset one past the last byte
    pub end_offset: u64,
    /// The bytes themselves
    pub bytes: Bytes,
}

impl Chunk {
    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes as (lossy) text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk[{}..{}] {}", self.start_offset, self.end_offset, hex::encode(&self.bytes))
    }
}

/// Classified output of the chunker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A span the sieve recognized as one record
    Data(Chunk),
    /// Bytes between records (noise, corruption, or a desync flush)
    NonData(Chunk),
}

impl StreamChunk {
    /// The underlying chunk
    pub fn chunk(&self) -> &Chunk {
        match self {
            Self::Data(c) | Self::NonData(c) => c,
        }
    }

    /// Whether this is a data chunk
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// Chunker statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkerStats {
    /// Data chunks produced
    pub data_chunks: u64,
    /// Non-data chunks produced
    pub non_data_chunks: u64,
    /// Full desync windows emitted as non-data
    pub desyncs: u64,
    /// Spans rejected because the sieve returned them out of order
    pub rejected_spans: u64,
}

/// Byte stream chunker
pub struct StreamChunker<S> {
    sieve: S,
    /// Bytes not yet classified
    buffer: BytesMut,
    /// Stream offset of `buffer[0]`
    base_offset: u64,
    /// Classified output not yet taken
    ready: VecDeque<StreamChunk>,
    /// Stream offset up to which output has been taken
    consumed_offset: u64,
    desync_window: usize,
    stats: ChunkerStats,
}

impl<S: Sieve> StreamChunker<S> {
    /// Create a chunker at stream offset zero
    pub fn new(sieve: S) -> Self {
        Self::starting_at(sieve, 0)
    }

    /// Create a chunker whose first byte is at `offset` in the stream
    pub fn starting_at(sieve: S, offset: u64) -> Self {
        Self {
            sieve,
            buffer: BytesMut::with_capacity(8192),
            base_offset: offset,
            ready: VecDeque::new(),
            consumed_offset: offset,
            desync_window: DEFAULT_DESYNC_WINDOW,
            stats: ChunkerStats::default(),
        }
    }

    /// Set the desync window
    #[must_use]
    pub fn with_desync_window(mut self, window: usize) -> Self {
        self.desync_window = window.max(2);
        self
    }

    /// Append received bytes and classify what can be classified
    pub fn add(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.classify();
    }

    /// Earliest unconsumed chunk of either kind
    pub fn next_chunk(&mut self) -> Option<StreamChunk> {
        let chunk = self.ready.pop_front()?;
        self.consumed_offset = chunk.chunk().end_offset;
        Some(chunk)
    }

    /// Earliest data chunk; non-data in front of it is discarded.
    ///
    /// Returns `None` when no complete record is buffered yet.
    pub fn next_data_chunk(&mut self) -> Option<Chunk> {
        if !self.ready.iter().any(StreamChunk::is_data) {
            return None;
        }
        while let Some(chunk) = self.next_chunk() {
            if let StreamChunk::Data(c) = chunk {
                return Some(c);
            }
        }
        None
    }

    /// Non-data chunk preceding the next data chunk, if any
    pub fn next_non_data_chunk(&mut self) -> Option<Chunk> {
        match self.ready.front() {
            Some(StreamChunk::NonData(_)) => match self.next_chunk() {
                Some(StreamChunk::NonData(c)) => Some(c),
                _ => None,
            },
            _ => None,
        }
    }

    /// Drop output up to stream offset `offset`; unclassified bytes are
    /// never touched. Returns the number of chunks dropped.
    pub fn advance(&mut self, offset: u64) -> usize {
        let mut dropped = 0;
        while self.ready.front().is_some_and(|c| c.chunk().end_offset <= offset) {
            self.next_chunk();
            dropped += 1;
        }
        dropped
    }

    /// Drop pending non-data chunks in front of the next data chunk
    pub fn clean(&mut self) -> usize {
        let mut dropped = 0;
        while self.next_non_data_chunk().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Discard everything and continue as if the next byte added sits at
    /// stream offset `offset`
    pub fn reset(&mut self, offset: u64) {
        self.buffer.clear();
        self.ready.clear();
        self.base_offset = offset;
        self.consumed_offset = offset;
    }

    /// Stream offset up to which output has been taken
    pub fn consumed_offset(&self) -> u64 {
        self.consumed_offset
    }

    /// Stream offset one past the last byte added
    pub fn received_offset(&self) -> u64 {
        self.base_offset + self.buffer.len() as u64
    }

    /// Bytes waiting for classification
    pub fn unclassified_len(&self) -> usize {
        self.buffer.len()
    }

    /// Classified chunks waiting to be taken
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Statistics
    pub fn stats(&self) -> ChunkerStats {
        self.stats
    }

    /// The sieve
    pub fn sieve(&self) -> &S {
        &self.sieve
    }

    fn classify(&mut self) {
        let spans = self.sieve.sift(&self.buffer);

        let mut cursor = 0;
        let mut marks = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            if start < cursor || end <= start || end > self.buffer.len() {
                tracing::warn!(start, end, cursor, "sieve returned an invalid span");
                self.stats.rejected_spans += 1;
                continue;
            }
            marks.push((start, end));
            cursor = end;
        }

        if cursor > 0 {
            let classified = self.buffer.split_to(cursor).freeze();
            let base = self.base_offset;
            let mut last = 0;
            for (start, end) in marks {
                if start > last {
                    self.push_gap(base + last as u64, classified.slice(last..start));
                }
                self.ready.push_back(StreamChunk::Data(Chunk {
                    start_offset: base + start as u64,
                    end_offset: base + end as u64,
                    bytes: classified.slice(start..end),
                }));
                self.stats.data_chunks += 1;
                last = end;
            }
            self.base_offset += cursor as u64;
        }

        // Bytes further than this from the end can no longer start a record
        let lookahead = self
            .sieve
            .max_record_len()
            .map_or(self.desync_window, |len| len.saturating_mul(2));
        while self.buffer.len() >= self.desync_window.saturating_add(lookahead) {
            tracing::warn!(
                offset = self.base_offset,
                bytes = self.desync_window,
                "no record found within desync window, flushing as non-data"
            );
            let bytes = self.buffer.split_to(self.desync_window).freeze();
            let base = self.base_offset;
            self.push_non_data(base, bytes);
            self.base_offset += self.desync_window as u64;
            self.stats.desyncs += 1;
        }
    }

    /// Emit a run of non-data, cut into desync-window blocks
    fn push_gap(&mut self, start: u64, mut bytes: Bytes) {
        let mut offset = start;
        while bytes.len() > self.desync_window {
            let block = bytes.split_to(self.desync_window);
            self.push_non_data(offset, block);
            offset += self.desync_window as u64;
            self.stats.desyncs += 1;
        }
        self.push_non_data(offset, bytes);
    }

    fn push_non_data(&mut self, start: u64, bytes: Bytes) {
        self.ready.push_back(StreamChunk::NonData(Chunk {
            start_offset: start,
            end_offset: start + bytes.len() as u64,
            bytes,
        }));
        self.stats.non_data_chunks += 1;
    }
}
