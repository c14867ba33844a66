//! Buffered `(key, value)` record writer with running statistics.
//!
//! Dump and merge threads append fixed-width little-endian records into a
//! local buffer, flush it to the output when their write token comes around,
//! and combine their statistics afterwards.

use std::io::{self, Write};

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// The four counters every database header records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    /// Entries whose count is exactly one.
    pub unique: u64,
    /// Distinct entries.
    pub distinct: u64,
    /// Sum of all counts.
    pub total: u64,
    /// Largest single count.
    pub max_count: u64,
}

impl DumpStats {
    pub fn absorb(&mut self, other: DumpStats) {
        self.unique += other.unique;
        self.distinct += other.distinct;
        self.total += other.total;
        self.max_count = self.max_count.max(other.max_count);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordWriter
// ─────────────────────────────────────────────────────────────────────────────

pub struct RecordWriter {
    key_bytes: usize,
    val_bytes: usize,
    val_max: u64,
    capacity: usize,
    buffer: Vec<u8>,
    stats: DumpStats,
}

impl RecordWriter {
    /// A buffer for `capacity` records of `key_bytes + val_bytes` bytes.
    pub fn new(capacity: usize, key_bytes: usize, val_bytes: usize) -> RecordWriter {
        assert!(val_bytes >= 1 && val_bytes <= 8);
        assert!(key_bytes >= 1 && key_bytes <= 8);
        let val_max = if val_bytes == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * val_bytes)) - 1
        };
        RecordWriter {
            key_bytes,
            val_bytes,
            val_max,
            capacity,
            buffer: Vec::with_capacity(capacity * (key_bytes + val_bytes)),
            stats: DumpStats::default(),
        }
    }

    pub fn key_bytes(&self) -> usize {
        self.key_bytes
    }
    pub fn val_bytes(&self) -> usize {
        self.val_bytes
    }
    pub fn record_len(&self) -> usize {
        self.key_bytes + self.val_bytes
    }

    /// Largest value one record can carry; appends clamp to it.
    pub fn val_max(&self) -> u64 {
        self.val_max
    }

    /// Append one record; returns false when the buffer is full.
    pub fn append(&mut self, key: u64, val: u64) -> bool {
        if self.buffer.len() >= self.capacity * self.record_len() {
            return false;
        }
        let val = val.min(self.val_max);
        self.buffer
            .extend_from_slice(&key.to_le_bytes()[..self.key_bytes]);
        self.buffer
            .extend_from_slice(&val.to_le_bytes()[..self.val_bytes]);
        self.stats.unique += (val == 1) as u64;
        self.stats.distinct += 1;
        self.stats.total += val;
        self.stats.max_count = self.stats.max_count.max(val);
        true
    }

    /// Flush the buffered records and clear the buffer.
    pub fn dump<W: Write + ?Sized>(&mut self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> DumpStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DumpStats::default();
    }
}
