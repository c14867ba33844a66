//! Sequential readers for on-disk databases.
//!
//! [`ListReader`] streams the records of a compacted-list database in file
//! order (sorted by hash position, then key); the merger and the text dump
//! are built on it. [`RawDb`] reloads a raw block image into a live
//! [`Array`].

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::format::header::{skip_generic_header, ListHeader, RawHeader, LIST_HEADER_BYTES};
use crate::format::{align8, bits_to_bytes, FormatError};
use crate::hash::array::Array;
use crate::hash::matrix::SquareMatrix;

// ─────────────────────────────────────────────────────────────────────────────
// ListReader
// ─────────────────────────────────────────────────────────────────────────────

pub struct ListReader {
    path: PathBuf,
    io: BufReader<File>,
    header: ListHeader,
    hash_matrix: SquareMatrix,
    hash_inverse_matrix: SquareMatrix,
    key_bytes: usize,
    val_bytes: usize,
    records_left: u64,
    size_mask: u64,
}

impl ListReader {
    pub fn open(path: &Path) -> Result<ListReader, FormatError> {
        let file = File::open(path).map_err(|e| FormatError::io(path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| FormatError::io(path, e))?
            .len();
        let mut io = BufReader::new(file);
        let mut offset = 0u64;

        // Optional generic header: ASCII digits, JSON, padding to 8 bytes.
        let mut first = [0u8; 1];
        io.read_exact(&mut first)
            .map_err(|_| FormatError::Truncated {
                path: path.to_owned(),
            })?;
        let mut head_buf = [0u8; LIST_HEADER_BYTES as usize];
        if first[0].is_ascii_digit() {
            let mut digits = 1u64;
            let mut json_len = (first[0] - b'0') as u64;
            loop {
                io.read_exact(&mut first)
                    .map_err(|_| FormatError::Truncated {
                        path: path.to_owned(),
                    })?;
                if first[0].is_ascii_digit() {
                    digits += 1;
                    json_len = json_len * 10 + (first[0] - b'0') as u64;
                } else {
                    break;
                }
            }
            // first[0] is the first JSON byte; skip the rest plus padding
            let skip = align8(digits + json_len) - digits - 1;
            std::io::copy(&mut (&mut io).take(skip), &mut std::io::sink())
                .map_err(|e| FormatError::io(path, e))?;
            offset = align8(digits + json_len);
            io.read_exact(&mut head_buf)
                .map_err(|_| FormatError::Truncated {
                    path: path.to_owned(),
                })?;
        } else {
            head_buf[0] = first[0];
            io.read_exact(&mut head_buf[1..])
                .map_err(|_| FormatError::Truncated {
                    path: path.to_owned(),
                })?;
        }
        offset += LIST_HEADER_BYTES;

        let (header, _) = ListHeader::parse(&head_buf).ok_or_else(|| FormatError::BadMagic {
            path: path.to_owned(),
            found: head_buf[..8].try_into().unwrap(),
        })?;

        if header.key_len == 0 || header.key_len > 64 {
            return Err(FormatError::BadKeyLen {
                path: path.to_owned(),
                key_len: header.key_len,
            });
        }
        if !header.size.is_power_of_two() {
            return Err(FormatError::SizeNotPow2 {
                path: path.to_owned(),
                size: header.size,
            });
        }
        if header.val_len == 0 || header.val_len > 8 {
            return Err(FormatError::BadValLen {
                path: path.to_owned(),
                val_len: header.val_len,
            });
        }

        let hash_matrix = SquareMatrix::load(&mut io).map_err(|e| FormatError::BadMatrix {
            path: path.to_owned(),
            detail: e.to_string(),
        })?;
        let hash_inverse_matrix =
            SquareMatrix::load(&mut io).map_err(|e| FormatError::BadMatrix {
                path: path.to_owned(),
                detail: e.to_string(),
            })?;
        for m in [&hash_matrix, &hash_inverse_matrix] {
            if m.size() as u64 != header.key_len {
                return Err(FormatError::BadMatrix {
                    path: path.to_owned(),
                    detail: format!(
                        "size of hash matrix '{}' not equal to key length '{}'",
                        m.size(),
                        header.key_len
                    ),
                });
            }
        }
        offset += (hash_matrix.dump_size() + hash_inverse_matrix.dump_size()) as u64;

        let body_start = align8(offset);
        let pad = body_start - offset;
        std::io::copy(&mut (&mut io).take(pad), &mut std::io::sink())
            .map_err(|e| FormatError::io(path, e))?;

        let key_bytes = bits_to_bytes(header.key_len as usize);
        let val_bytes = header.val_len as usize;
        let record_len = (key_bytes + val_bytes) as u64;
        if file_len < body_start {
            return Err(FormatError::Truncated {
                path: path.to_owned(),
            });
        }
        let body_len = file_len - body_start;
        if header.distinct != 0 && body_len != header.distinct * record_len {
            return Err(FormatError::LengthMismatch {
                path: path.to_owned(),
                found: body_len,
                expected: header.distinct * record_len,
            });
        }
        if body_len % record_len != 0 {
            return Err(FormatError::LengthMismatch {
                path: path.to_owned(),
                found: body_len,
                expected: body_len / record_len * record_len,
            });
        }

        Ok(ListReader {
            path: path.to_owned(),
            io,
            size_mask: header.size - 1,
            header,
            hash_matrix,
            hash_inverse_matrix,
            key_bytes,
            val_bytes,
            records_left: body_len / record_len,
        })
    }

    pub fn header(&self) -> &ListHeader {
        &self.header
    }
    pub fn matrix(&self) -> &SquareMatrix {
        &self.hash_matrix
    }
    pub fn inverse_matrix(&self) -> &SquareMatrix {
        &self.hash_inverse_matrix
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn key_len(&self) -> usize {
        self.header.key_len as usize
    }
    pub fn mer_len(&self) -> usize {
        self.header.key_len as usize / 2
    }
    pub fn records_left(&self) -> u64 {
        self.records_left
    }

    /// Hash position of a key under this database's matrix.
    pub fn pos(&self, key: u64) -> u64 {
        self.hash_matrix.times(key) & self.size_mask
    }

    /// Next `(key, value)` record, or `None` at end of body.
    pub fn next(&mut self) -> Result<Option<(u64, u64)>, FormatError> {
        if self.records_left == 0 {
            return Ok(None);
        }
        let mut kb = [0u8; 8];
        let mut vb = [0u8; 8];
        self.io
            .read_exact(&mut kb[..self.key_bytes])
            .map_err(|_| FormatError::Truncated {
                path: self.path.clone(),
            })?;
        self.io
            .read_exact(&mut vb[..self.val_bytes])
            .map_err(|_| FormatError::Truncated {
                path: self.path.clone(),
            })?;
        self.records_left -= 1;
        Ok(Some((u64::from_le_bytes(kb), u64::from_le_bytes(vb))))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RawDb
// ─────────────────────────────────────────────────────────────────────────────

/// A raw block-image database loaded back into a live array.
pub struct RawDb {
    header: RawHeader,
    ary: Array,
}

impl RawDb {
    pub fn open(path: &Path) -> Result<RawDb, FormatError> {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| FormatError::io(path, e))?;

        let start = skip_generic_header(&bytes).ok_or_else(|| FormatError::Truncated {
            path: path.to_owned(),
        })? as usize;
        let buf = &bytes[start.min(bytes.len())..];

        let (header, mut at) = RawHeader::parse(buf).ok_or_else(|| FormatError::BadMagic {
            path: path.to_owned(),
            found: {
                let mut m = [0u8; 8];
                let n = buf.len().min(8);
                m[..n].copy_from_slice(&buf[..n]);
                m
            },
        })?;

        if header.key_len == 0 || header.key_len > 64 {
            return Err(FormatError::BadKeyLen {
                path: path.to_owned(),
                key_len: header.key_len,
            });
        }
        if !header.size.is_power_of_two() {
            return Err(FormatError::SizeNotPow2 {
                path: path.to_owned(),
                size: header.size,
            });
        }
        // val_len is the in-memory counter width in bits here
        if header.val_len == 0 || header.val_len >= 64 {
            return Err(FormatError::BadValLen {
                path: path.to_owned(),
                val_len: header.val_len,
            });
        }

        let load_matrix = |buf: &[u8], at: usize| -> Result<(SquareMatrix, usize), FormatError> {
            let (m, used) =
                SquareMatrix::read(&buf[at..]).map_err(|e| FormatError::BadMatrix {
                    path: path.to_owned(),
                    detail: e.to_string(),
                })?;
            if m.size() as u64 != header.key_len {
                return Err(FormatError::BadMatrix {
                    path: path.to_owned(),
                    detail: format!(
                        "size of hash matrix '{}' not equal to key length '{}'",
                        m.size(),
                        header.key_len
                    ),
                });
            }
            Ok((m, at + used))
        };
        let (hash_matrix, n) = load_matrix(buf, at)?;
        at = n;
        let (hash_inverse_matrix, n) = load_matrix(buf, at)?;
        at = n;
        let body_start = align8(at as u64) as usize;

        let expected_words = Array::words_for(
            header.size,
            header.key_len as usize,
            header.val_len as usize,
            header.max_reprobe as usize,
        );
        let body = &buf[body_start.min(buf.len())..];
        if body.len() != expected_words * 8 {
            return Err(FormatError::LengthMismatch {
                path: path.to_owned(),
                found: body.len() as u64,
                expected: (expected_words * 8) as u64,
            });
        }
        let words: Vec<u64> = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let ary = Array::from_words(
            words,
            header.size,
            header.key_len as usize,
            header.val_len as usize,
            header.max_reprobe as usize,
            hash_matrix,
            hash_inverse_matrix,
        )
        .map_err(|e| FormatError::BadMatrix {
            path: path.to_owned(),
            detail: e.to_string(),
        })?;

        Ok(RawDb { header, ary })
    }

    pub fn header(&self) -> &RawHeader {
        &self.header
    }

    pub fn array(&self) -> &Array {
        &self.ary
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
