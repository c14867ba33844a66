//! Bounded-overlap sequence parsing.
//!
//! [`OverlapParser`] turns FASTA/FASTQ files (or plain sequence text) into a
//! normalized byte stream — sequence bytes verbatim, one `N` separator at
//! every record and file boundary — and hands it out in buffers whose last
//! `k - 1` bytes are replayed at the front of the next buffer. A k-mer
//! window therefore never spans a buffer boundary unseen: every full window
//! occurs in exactly one buffer, because a buffer's final `k - 1` positions
//! cannot start a full window and reappear as the seam of its successor.
//!
//! Workers pull buffers under a shared lock and do all per-base work
//! locally with [`each_mer`].

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::mer::{dna_code, mer_mask, CODE_IGNORE, CODE_RESET};

// ─────────────────────────────────────────────────────────────────────────────
// Rolling mer window
// ─────────────────────────────────────────────────────────────────────────────

/// Roll a `k`-base window over `seq`, calling `f` for every full window.
/// Any byte that is not `[acgtACGT]` resets the window; newlines are
/// skipped. In canonical mode `f` receives `min(window, rc(window))`.
pub fn each_mer<F: FnMut(u64)>(seq: &[u8], k: usize, canonical: bool, mut f: F) {
    let mask = mer_mask(k);
    let lshift = (2 * (k - 1)) as u32;
    let mut kmer = 0u64;
    let mut rkmer = 0u64;
    let mut filled = 0usize;

    for &b in seq {
        let c = dna_code(b);
        if c <= 3 {
            kmer = ((kmer << 2) & mask) | c as u64;
            rkmer = (rkmer >> 2) | (((3 - c) as u64) << lshift);
            filled += 1;
            if filled >= k {
                filled = k;
                f(if canonical { kmer.min(rkmer) } else { kmer });
            }
        } else if c == CODE_RESET {
            filled = 0;
            kmer = 0;
            rkmer = 0;
        } else {
            debug_assert_eq!(c, CODE_IGNORE);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OverlapParser
// ─────────────────────────────────────────────────────────────────────────────

enum Format {
    Fasta,
    Fastq,
    /// Bare sequence text, one read per line group; used by tests and pipes
    /// carrying raw bases.
    Plain,
}

struct OpenFile {
    io: BufReader<File>,
    format: Format,
    /// FASTQ line phase: 0 header, 1 sequence, 2 plus, 3 quality.
    phase: u8,
}

struct ParserState {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<OpenFile>,
    seam: Vec<u8>,
    line: Vec<u8>,
}

pub struct OverlapParser {
    state: Mutex<ParserState>,
    mer_len: usize,
    buffer_size: usize,
}

impl OverlapParser {
    pub fn new(files: Vec<PathBuf>, mer_len: usize, buffer_size: usize) -> OverlapParser {
        assert!(mer_len >= 1);
        OverlapParser {
            state: Mutex::new(ParserState {
                files: files.into_iter(),
                current: None,
                seam: Vec::new(),
                line: Vec::new(),
            }),
            mer_len,
            buffer_size: buffer_size.max(mer_len * 2),
        }
    }

    /// Refill `buf` with the seam plus up to `buffer_size` new stream bytes.
    /// Returns false once the inputs are exhausted.
    pub fn next_buffer(&self, buf: &mut Vec<u8>) -> io::Result<bool> {
        buf.clear();
        let mut st = self.state.lock().unwrap();
        buf.extend_from_slice(&st.seam);
        let seam_len = buf.len();

        while buf.len() < seam_len + self.buffer_size {
            if st.current.is_none() {
                match st.files.next() {
                    Some(path) => {
                        st.current = Some(open_sequence_file(&path)?);
                        // separate reads across file boundaries
                        buf.push(b'N');
                    }
                    None => break,
                }
            }
            let st = &mut *st;
            let of = st.current.as_mut().unwrap();
            if !fill_from_file(of, buf, &mut st.line)? {
                st.current = None;
            }
        }

        if buf.len() == seam_len {
            // nothing new: inputs exhausted
            return Ok(false);
        }
        let keep = self.mer_len - 1;
        let tail = buf.len().saturating_sub(keep);
        st.seam.clear();
        st.seam.extend_from_slice(&buf[tail..]);
        Ok(true)
    }
}

fn open_sequence_file(path: &std::path::Path) -> io::Result<OpenFile> {
    let f = File::open(path)?;
    let mut io = BufReader::new(f);
    let first = {
        let buf = io.fill_buf()?;
        buf.first().copied()
    };
    let format = match first {
        Some(b'>') => Format::Fasta,
        Some(b'@') => Format::Fastq,
        _ => Format::Plain,
    };
    Ok(OpenFile {
        io,
        format,
        phase: 0,
    })
}

// Append one input line's worth of stream bytes to `buf`. Returns false at
// end of file.
fn fill_from_file(of: &mut OpenFile, buf: &mut Vec<u8>, line: &mut Vec<u8>) -> io::Result<bool> {
    line.clear();
    let n = of.io.read_until(b'\n', line)?;
    if n == 0 {
        return Ok(false);
    }
    while line.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
        line.pop();
    }
    match of.format {
        Format::Fasta => {
            if line.first() == Some(&b'>') {
                buf.push(b'N');
            } else {
                buf.extend_from_slice(line);
            }
        }
        Format::Fastq => {
            match of.phase {
                0 => buf.push(b'N'), // @header
                1 => buf.extend_from_slice(line),
                _ => {} // '+' line and quality line
            }
            of.phase = (of.phase + 1) % 4;
        }
        Format::Plain => {
            buf.extend_from_slice(line);
            // a plain-text line is one read
            buf.push(b'N');
        }
    }
    Ok(true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
