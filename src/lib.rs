//! mercount — multi-threaded k-mer counting.
//!
//! The core is a lock-free, bit-packed, open-addressed hash array with an
//! invertible hash function: slots store only the key bits the slot
//! position does not already imply, counters spill into overflow chains,
//! and full keys are reconstructed through the inverse matrix on readout.
//! Around it: a cooperative size-doubling/dump-on-full protocol, token-ring
//! dumpers, a self-describing on-disk format with mmap point queries, and a
//! k-way database merger.

pub mod bloom;
pub mod cli;
pub mod config;
pub mod dump;
pub mod format;
#[cfg(unix)]
pub mod generator;
pub mod hash;
pub mod mer;
pub mod merge;
pub mod parse;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the most common entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// The lock-free counting array.
pub use hash::array::{Array, ArrayError, Entry, SlotState};
/// The thread-facing cooperative counter.
pub use hash::counter::{CounterError, HashCounter};
/// The invertible GF(2) hash matrix.
pub use hash::matrix::{MatrixError, SquareMatrix};

/// Position-sorted compacted dumper (the standard database writer).
pub use dump::sorted::SortedDumper;
/// Raw block-image dumper.
pub use dump::raw::RawDumper;
/// Destination trait for dump-on-full.
pub use dump::Dumper;

/// Streaming reader over a compacted database.
pub use format::reader::ListReader;
/// Raw block-image reload.
pub use format::reader::RawDb;
/// Memory-mapped point queries.
pub use format::query::ListQuery;
pub use format::FormatError;

/// K-way merge of compacted databases.
pub use merge::{merge_files, MergeError};

/// Bounded-overlap FASTA/FASTQ parsing.
pub use parse::{each_mer, OverlapParser};

/// Counting Bloom pre-filter.
pub use bloom::BloomCounter;
