//! Newline framing for the device byte stream
//!
//! Serial reads return arbitrary chunks. [`LineFramer`] buffers them and
//! yields one [`RawRecord`] per `\n`-terminated line, keeping any partial
//! tail for the next chunk.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::RawRecord;

/// Ceiling for buffered bytes without a delimiter
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

const DELIMITER: u8 = b'\n';

/// Counters kept by a framer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Records emitted
    pub records: u64,
    /// Times the buffer was discarded for exceeding the ceiling
    pub overflows: u64,
    /// Bytes thrown away by overflow discards
    pub discarded_bytes: u64,
}

/// Reassembles newline-delimited records from byte chunks
///
/// Lines are trimmed; lines that are empty after trimming are skipped.
/// If more than `max_line_len` bytes accumulate without a delimiter the
/// buffer is discarded and the overflow is counted and logged.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_len: usize,
    stats: FramerStats,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_line_len,
            stats: FramerStats::default(),
        }
    }

    /// Append a chunk and iterate the records it completes
    ///
    /// The iterator is lazy. Records it does not yield stay buffered and
    /// come out of the next `feed` call, so dropping it early loses nothing.
    pub fn feed(&mut self, bytes: &[u8]) -> Records<'_> {
        self.feed_at(bytes, Utc::now())
    }

    /// Same as [`feed`](Self::feed) with an explicit arrival time
    pub fn feed_at(&mut self, bytes: &[u8], received_at: DateTime<Utc>) -> Records<'_> {
        self.buffer.extend_from_slice(bytes);
        Records {
            framer: self,
            received_at,
        }
    }

    /// Bytes buffered after the last delimiter
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn next_record(&mut self, received_at: DateTime<Utc>) -> Option<RawRecord> {
        loop {
            let Some(idx) = self.buffer.iter().position(|&b| b == DELIMITER) else {
                self.check_overflow();
                return None;
            };

            let line = self.buffer.split_to(idx);
            self.buffer.advance(1);

            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            self.stats.records += 1;
            return Some(RawRecord::at(text, received_at));
        }
    }

    fn check_overflow(&mut self) {
        if self.buffer.len() <= self.max_line_len {
            return;
        }
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.stats.overflows += 1;
        self.stats.discarded_bytes += discarded as u64;
        warn!(
            discarded,
            limit = self.max_line_len,
            overflows = self.stats.overflows,
            "Framer buffer overflow, discarding undelimited data"
        );
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Records completed by one [`LineFramer::feed`] call
pub struct Records<'a> {
    framer: &'a mut LineFramer,
    received_at: DateTime<Utc>,
}

impl Iterator for Records<'_> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_record(self.received_at)
    }
}
