//! The self-describing on-disk database format.
//!
//! Two body layouts share the same framing (magic, fixed binary header,
//! serialized matrix pair, padding to 8-byte alignment):
//!
//! - `JFLISTDN` — a *compacted list*: one `(key, value)` byte record per
//!   present entry, sorted by (hash position, key). Written by the sorted
//!   dumper and the merger; consumed by [`reader::ListReader`] (streaming)
//!   and [`query::ListQuery`] (mmap + binary search).
//! - `JFRHSHDN` — a *raw block image*: the in-memory word array verbatim.
//!   Written by the raw dumper; reloaded by [`reader::RawDb`].
//!
//! Files may carry an optional digit-prefixed JSON header in front of the
//! binary magic; readers skip it (see [`header`]).

pub mod header;
pub mod query;
pub mod reader;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Magic of compacted-list databases.
pub const LIST_MAGIC: &[u8; 8] = b"JFLISTDN";
/// Magic of raw block-image databases.
pub const RAW_MAGIC: &[u8; 8] = b"JFRHSHDN";

/// Bytes needed to hold `bits` bits.
#[inline]
pub fn bits_to_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Round `n` up to the next multiple of 8.
#[inline]
pub fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FormatError {
    /// The file does not start with a known magic.
    BadMagic { path: PathBuf, found: [u8; 8] },
    /// Header-declared key length is zero or exceeds 64 bits.
    BadKeyLen { path: PathBuf, key_len: u64 },
    /// Header-declared value length is zero or exceeds 8 bytes.
    BadValLen { path: PathBuf, val_len: u64 },
    /// Header-declared table size is not a power of two.
    SizeNotPow2 { path: PathBuf, size: u64 },
    /// File ends before the header, matrices or body it declares.
    Truncated { path: PathBuf },
    /// Body length disagrees with the header-declared entry count.
    LengthMismatch {
        path: PathBuf,
        found: u64,
        expected: u64,
    },
    /// A serialized matrix is unusable or disagrees with the key length.
    BadMatrix { path: PathBuf, detail: String },
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::BadMagic { path, found } => write!(
                f,
                "'{}': invalid file format '{}'",
                path.display(),
                String::from_utf8_lossy(found)
            ),
            FormatError::BadKeyLen { path, key_len } => {
                write!(f, "'{}': invalid key length '{}'", path.display(), key_len)
            }
            FormatError::BadValLen { path, val_len } => {
                write!(f, "'{}': invalid value length '{}'", path.display(), val_len)
            }
            FormatError::SizeNotPow2 { path, size } => write!(
                f,
                "'{}': size '{}' is not a power of 2",
                path.display(),
                size
            ),
            FormatError::Truncated { path } => write!(f, "'{}': file truncated", path.display()),
            FormatError::LengthMismatch {
                path,
                found,
                expected,
            } => write!(
                f,
                "'{}': bad hash size '{}', expected '{}' bytes",
                path.display(),
                found,
                expected
            ),
            FormatError::BadMatrix { path, detail } => {
                write!(f, "'{}': {}", path.display(), detail)
            }
            FormatError::Io { path, source } => {
                write!(f, "'{}': {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for FormatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormatError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FormatError {
    pub fn io(path: &Path, source: io::Error) -> FormatError {
        FormatError::Io {
            path: path.to_owned(),
            source,
        }
    }
}
