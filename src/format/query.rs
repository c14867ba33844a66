//! Memory-mapped point queries over compacted-list databases.
//!
//! The list body is sorted by (hash position, key), so a point query
//! computes the key's position under the stored matrix and binary-searches
//! the record array. In canonical mode the query key is first replaced by
//! `min(m, reverse_complement(m))`, matching how canonical databases were
//! counted.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::format::header::{skip_generic_header, ListHeader, LIST_HEADER_BYTES};
use crate::format::{bits_to_bytes, FormatError};
use crate::hash::matrix::SquareMatrix;
use crate::mer;

pub struct ListQuery {
    map: Mmap,
    /// Offset of the record array inside the map.
    base: usize,
    header: ListHeader,
    hash_matrix: SquareMatrix,
    hash_inverse_matrix: SquareMatrix,
    key_bytes: usize,
    val_bytes: usize,
    record_len: usize,
    last_id: u64,
    size_mask: u64,
    first_key: u64,
    last_key: u64,
    first_pos: u64,
    last_pos: u64,
    canonical: bool,
}

impl ListQuery {
    pub fn open(path: &Path) -> Result<ListQuery, FormatError> {
        let file = File::open(path).map_err(|e| FormatError::io(path, e))?;
        // SAFETY: read-only private mapping; database files are not mutated
        // while mapped.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| FormatError::io(path, e))?;
        Self::from_map(map, path.to_owned())
    }

    fn from_map(map: Mmap, path: PathBuf) -> Result<ListQuery, FormatError> {
        let start = skip_generic_header(&map).ok_or_else(|| FormatError::Truncated {
            path: path.clone(),
        })? as usize;
        let buf = &map[start.min(map.len())..];

        if buf.len() < LIST_HEADER_BYTES as usize {
            return Err(FormatError::Truncated { path });
        }
        let (header, mut at) = ListHeader::parse(buf).ok_or_else(|| FormatError::BadMagic {
            path: path.clone(),
            found: buf[..8].try_into().unwrap(),
        })?;
        if header.key_len == 0 || header.key_len > 64 {
            return Err(FormatError::BadKeyLen {
                path,
                key_len: header.key_len,
            });
        }
        if !header.size.is_power_of_two() {
            return Err(FormatError::SizeNotPow2 {
                path,
                size: header.size,
            });
        }
        if header.val_len == 0 || header.val_len > 8 {
            return Err(FormatError::BadValLen {
                path,
                val_len: header.val_len,
            });
        }

        let mut load_matrix = |at: &mut usize| -> Result<SquareMatrix, FormatError> {
            let (m, used) =
                SquareMatrix::read(&buf[(*at).min(buf.len())..]).map_err(|e| {
                    FormatError::BadMatrix {
                        path: path.clone(),
                        detail: e.to_string(),
                    }
                })?;
            if m.size() as u64 != header.key_len {
                return Err(FormatError::BadMatrix {
                    path: path.clone(),
                    detail: format!(
                        "size of hash matrix '{}' not equal to key length '{}'",
                        m.size(),
                        header.key_len
                    ),
                });
            }
            *at += used;
            Ok(m)
        };
        let hash_matrix = load_matrix(&mut at)?;
        let hash_inverse_matrix = load_matrix(&mut at)?;

        let base = start + crate::format::align8(at as u64) as usize;
        if base > map.len() {
            return Err(FormatError::Truncated { path });
        }

        let key_bytes = bits_to_bytes(header.key_len as usize);
        let val_bytes = header.val_len as usize;
        let record_len = key_bytes + val_bytes;
        let body_len = (map.len() - base) as u64;
        if header.distinct != 0 && body_len != header.distinct * record_len as u64 {
            return Err(FormatError::LengthMismatch {
                path,
                found: body_len,
                expected: header.distinct * record_len as u64,
            });
        }
        let last_id = body_len / record_len as u64;

        let mut q = ListQuery {
            map,
            base,
            size_mask: header.size - 1,
            header,
            hash_matrix,
            hash_inverse_matrix,
            key_bytes,
            val_bytes,
            record_len,
            last_id,
            first_key: 0,
            last_key: 0,
            first_pos: 0,
            last_pos: 0,
            canonical: false,
        };
        if last_id > 0 {
            q.first_key = q.key_at(0);
            q.first_pos = q.pos(q.first_key);
            q.last_key = q.key_at(last_id - 1);
            q.last_pos = q.pos(q.last_key);
        }
        Ok(q)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn header(&self) -> &ListHeader {
        &self.header
    }
    pub fn matrix(&self) -> &SquareMatrix {
        &self.hash_matrix
    }
    pub fn inverse_matrix(&self) -> &SquareMatrix {
        &self.hash_inverse_matrix
    }
    pub fn mer_len(&self) -> usize {
        self.header.key_len as usize / 2
    }
    pub fn nb_records(&self) -> u64 {
        self.last_id
    }
    pub fn canonical(&self) -> bool {
        self.canonical
    }
    pub fn set_canonical(&mut self, v: bool) {
        self.canonical = v;
    }

    /// Hash position of a key under the stored matrix.
    pub fn pos(&self, key: u64) -> u64 {
        self.hash_matrix.times(key) & self.size_mask
    }

    fn key_at(&self, id: u64) -> u64 {
        let at = self.base + id as usize * self.record_len;
        let mut kb = [0u8; 8];
        kb[..self.key_bytes].copy_from_slice(&self.map[at..at + self.key_bytes]);
        u64::from_le_bytes(kb)
    }

    fn val_at(&self, id: u64) -> u64 {
        let at = self.base + id as usize * self.record_len + self.key_bytes;
        let mut vb = [0u8; 8];
        vb[..self.val_bytes].copy_from_slice(&self.map[at..at + self.val_bytes]);
        u64::from_le_bytes(vb)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Count for `key`, 0 when absent.
    pub fn get(&self, key: u64) -> u64 {
        self.get_with_id(key).map_or(0, |(v, _)| v)
    }

    /// Count for a mer given in ASCII. Returns 0 for malformed input.
    pub fn get_str(&self, s: &str) -> u64 {
        match mer::mer_from_ascii(s.as_bytes(), self.mer_len()) {
            Some(m) => self.get(m),
            None => 0,
        }
    }

    /// Count and record id for `key`.
    pub fn get_with_id(&self, key: u64) -> Option<(u64, u64)> {
        let key = if self.canonical {
            mer::canonical(key, self.mer_len())
        } else {
            key
        };
        if self.last_id == 0 {
            return None;
        }
        if key == self.first_key {
            return Some((self.val_at(0), 0));
        }
        if key == self.last_key {
            return Some((self.val_at(self.last_id - 1), self.last_id - 1));
        }
        let pos = self.pos(key);
        if pos < self.first_pos || pos > self.last_pos {
            return None;
        }
        let mut first = 0u64;
        let mut last = self.last_id;
        while first + 1 < last {
            let middle = (first + last) / 2;
            let mid_key = self.key_at(middle);
            if key == mid_key {
                return Some((self.val_at(middle), middle));
            }
            let mid_pos = self.pos(mid_key);
            if mid_pos > pos || (mid_pos == pos && mid_key > key) {
                last = middle;
            } else {
                first = middle;
            }
        }
        None
    }

    /// Iterate the records in file order.
    pub fn iter(&self) -> ListQueryIter<'_> {
        ListQueryIter { q: self, id: 0 }
    }
}

pub struct ListQueryIter<'a> {
    q: &'a ListQuery,
    id: u64,
}

impl Iterator for ListQueryIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.id >= self.q.last_id {
            return None;
        }
        let id = self.id;
        self.id += 1;
        Some((self.q.key_at(id), self.q.val_at(id)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
