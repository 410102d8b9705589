//! Sieves locate candidate records in the chunker buffer
//!
//! A sieve scans left to right and returns ascending, non-overlapping
//! `(start, end)` spans. It must stop at the first position it cannot
//! decide yet (a record that is only partly buffered) rather than guess,
//! which is what keeps chunker output independent of read fragmentation.
//! Bytes it skips without a candidate must not influence later decisions,
//! so the chunker may drop them once they fall outside the lookahead.

use crate::core::protocol::checksum::TrailingChecksum;
use crate::core::protocol::port_agent::{scan_packets, HEADER_SIZE, MAX_PAYLOAD};
use regex::bytes::Regex;

/// Locates candidate record spans in a buffer
pub trait Sieve: Send {
    /// Ascending, non-overlapping record spans in `buf`
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)>;

    /// Longest record this sieve can match, when bounded
    fn max_record_len(&self) -> Option<usize> {
        None
    }
}

/// Sieve backed by a closure, see [`from_fn`]
pub struct FnSieve<F>(F);

/// Use a closure `Fn(&[u8]) -> Vec<(usize, usize)>` as a sieve
pub fn from_fn<F>(f: F) -> FnSieve<F>
where
    F: FnMut(&[u8]) -> Vec<(usize, usize)> + Send,
{
    FnSieve(f)
}

impl<F> Sieve for FnSieve<F>
where
    F: FnMut(&[u8]) -> Vec<(usize, usize)> + Send,
{
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)> {
        (self.0)(buf)
    }
}

impl Sieve for Box<dyn Sieve> {
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)> {
        (**self).sift(buf)
    }

    fn max_record_len(&self) -> Option<usize> {
        (**self).max_record_len()
    }
}

/// A binary record type identified by its leading byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMarker {
    /// Leading marker byte
    pub marker: u8,
    /// Total record length including marker and checksum
    pub length: usize,
}

impl RecordMarker {
    /// Create a marker
    pub fn new(marker: u8, length: usize) -> Self {
        Self { marker, length }
    }
}

/// Sieve for fixed-length binary records with a trailing checksum.
///
/// When a candidate fails its checksum the rest of its window is searched
/// for another marker that starts a valid record; only if none does is the
/// whole window emitted, as one invalid record for the decoder to report.
#[derive(Debug, Clone)]
pub struct MarkerSieve {
    markers: Vec<RecordMarker>,
    checksum: TrailingChecksum,
}

impl MarkerSieve {
    /// Create a sieve for the given record types
    pub fn new(markers: Vec<RecordMarker>, checksum: TrailingChecksum) -> Self {
        Self { markers, checksum }
    }

    fn length_for(&self, byte: u8) -> Option<usize> {
        self.markers.iter().find(|m| m.marker == byte).map(|m| m.length)
    }
}

impl Sieve for MarkerSieve {
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut i = 0;

        'scan: while i < buf.len() {
            let Some(len) = self.length_for(buf[i]) else {
                i += 1;
                continue;
            };
            if i + len > buf.len() {
                break;
            }
            if self.checksum.is_valid(&buf[i..i + len]) {
                spans.push((i, i + len));
                i += len;
                continue;
            }

            for p in i + 1..i + len {
                let Some(next_len) = self.length_for(buf[p]) else {
                    continue;
                };
                if p + next_len > buf.len() {
                    break 'scan;
                }
                if self.checksum.is_valid(&buf[p..p + next_len]) {
                    tracing::debug!(from = i, to = p, "resynchronised on marker inside failed record");
                    i = p;
                    continue 'scan;
                }
            }

            spans.push((i, i + len));
            i += len;
        }

        spans
    }

    fn max_record_len(&self) -> Option<usize> {
        self.markers.iter().map(|m| m.length).max()
    }
}

/// Sieve for text records matched by regular expressions.
///
/// Patterns should end on a terminator (`\r\n`, a prompt) so a record is
/// never matched before it is complete. When a short pattern (a prompt)
/// can also occur inside a longer record, set a record start with
/// [`with_record_start`](Self::with_record_start): matching then stops at
/// the first record start that no complete record covers yet.
#[derive(Debug, Clone)]
pub struct LineSieve {
    patterns: Vec<Regex>,
    record_start: Option<Regex>,
    max_len: Option<usize>,
}

impl LineSieve {
    /// Create from compiled patterns
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self {
            patterns,
            record_start: None,
            max_len: None,
        }
    }

    /// Compile patterns
    pub fn from_patterns(patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns.iter().map(|p| Regex::new(p)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    /// Where records begin, e.g. `\$` for NMEA sentences
    pub fn with_record_start(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.record_start = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Bound on record length, used as the chunker's lookahead
    #[must_use]
    pub fn with_max_record_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }
}

impl Sieve for LineSieve {
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)> {
        let mut matches: Vec<(usize, usize)> = self
            .patterns
            .iter()
            .flat_map(|re| re.find_iter(buf).map(|m| (m.start(), m.end())))
            .filter(|(s, e)| e > s)
            .collect();

        // Earliest start wins, longest match on a tie
        matches.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(matches.len());
        for (start, end) in matches {
            if spans.last().map_or(true, |&(_, last_end)| start >= last_end) {
                spans.push((start, end));
            }
        }

        if let Some(record_start) = &self.record_start {
            // An uncovered record start is a record still arriving
            let open = record_start
                .find_iter(buf)
                .map(|m| m.start())
                .find(|&p| !spans.iter().any(|&(s, e)| s <= p && p < e));
            if let Some(open) = open {
                spans.retain(|&(s, _)| s < open);
            }
        }
        spans
    }

    fn max_record_len(&self) -> Option<usize> {
        self.max_len
    }
}

/// Sieve over a raw port-agent capture
#[derive(Debug, Clone, Copy, Default)]
pub struct PortAgentSieve;

impl Sieve for PortAgentSieve {
    fn sift(&mut self, buf: &[u8]) -> Vec<(usize, usize)> {
        scan_packets(buf)
    }

    fn max_record_len(&self) -> Option<usize> {
        Some(HEADER_SIZE + MAX_PAYLOAD)
    }
}
