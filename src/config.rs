//! Compile-time constants shared across the crate.

/// Bit width of the machine word used for slot storage and CAS operations.
pub const WORD_BITS: usize = 64;

/// Largest supported mer length. A mer of length `k` occupies `2k` bits and
/// must fit in one word together with the matrix product.
pub const MAX_MER_LEN: usize = 32;

/// Default width of the in-memory counter field, in bits.
pub const DEFAULT_COUNTER_LEN: usize = 7;

/// Default maximum number of reprobes before an insert reports the table full.
pub const DEFAULT_REPROBE_LIMIT: usize = 62;

/// Hard cap on the reprobe limit (the reprobe offset table has this many
/// entries past index zero).
pub const MAX_REPROBE_LIMIT: usize = 255;

/// Default buffer size, in bytes, for dump and merge record buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000_000;
