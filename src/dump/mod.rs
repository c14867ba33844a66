//! Multi-threaded dumpers: drain the in-memory array to disk and zero it so
//! counting can continue in the same memory.
//!
//! Both dumpers walk the array in block order with one thread per `T`-th
//! block group, serialize their writes through a [`token_ring::TokenRing`],
//! and zero each block group right after writing it. The [`sorted`] dumper
//! compacts entries into position-sorted `(key, value)` records (the format
//! queries and merges consume); the [`raw`] dumper writes the block words
//! verbatim.

pub mod raw;
pub mod sorted;
pub mod token_ring;
pub mod writer;

use std::io;
use std::path::PathBuf;

use crate::hash::array::Array;

/// A destination for a full table. [`dump`](Dumper::dump) must leave the
/// array zeroed and reusable; it is called with every worker thread parked,
/// so it may iterate freely and spawn its own crew.
pub trait Dumper: Send + Sync {
    fn dump(&self, ary: &Array) -> io::Result<()>;
}

/// Numbered output path for intermediate dumps: `prefix_0`, `prefix_1`, ...
pub fn indexed_path(prefix: &std::path::Path, index: usize) -> PathBuf {
    let mut name = prefix.file_name().unwrap_or_default().to_os_string();
    name.push(format!("_{}", index));
    prefix.with_file_name(name)
}
