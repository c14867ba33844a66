//! K-way merge of compacted-list databases.
//!
//! All inputs must have been counted into tables with identical geometry
//! (key length, size, reprobe strategy) and the same hash matrices, so their
//! record streams are sorted by the same (position, key) order. A min-heap
//! primed with one front record per reader then yields the global order;
//! runs of equal keys are summed (saturating) and emitted once.
//!
//! Records are appended into rotating buffers; a background writer thread
//! drains full buffers to the output file while the merge loop keeps
//! filling the next, with a bounded channel pair recycling the buffers.

use std::collections::BinaryHeap;
use std::fmt;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::bounded;

use crate::dump::writer::{DumpStats, RecordWriter};
use crate::format::header::ListHeader;
use crate::format::reader::ListReader;
use crate::format::{align8, bits_to_bytes, FormatError};

/// Buffers in flight between the merge loop and the writer thread.
const NB_BUFFERS: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum MergeError {
    /// No input databases were given.
    NoInput,
    /// An input disagrees with the first one on geometry or matrices.
    Mismatch { path: PathBuf, detail: String },
    Format(FormatError),
    Io(io::Error),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::NoInput => write!(f, "no input databases to merge"),
            MergeError::Mismatch { path, detail } => {
                write!(f, "'{}': cannot merge: {}", path.display(), detail)
            }
            MergeError::Format(e) => e.fmt(f),
            MergeError::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<FormatError> for MergeError {
    fn from(e: FormatError) -> Self {
        MergeError::Format(e)
    }
}

impl From<io::Error> for MergeError {
    fn from(e: io::Error) -> Self {
        MergeError::Io(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// merge_files
// ─────────────────────────────────────────────────────────────────────────────

/// Merge `inputs` into `output`. `out_val_bytes` is the value width of the
/// produced records (sums clamp to it); `buffer_size` the per-buffer byte
/// budget. Returns the output's statistics.
pub fn merge_files(
    inputs: &[PathBuf],
    output: &Path,
    out_val_bytes: usize,
    buffer_size: usize,
) -> Result<DumpStats, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::NoInput);
    }
    let mut readers = Vec::with_capacity(inputs.len());
    for p in inputs {
        readers.push(ListReader::open(p)?);
    }

    // Geometry and matrices must agree exactly with the first input.
    {
        let (h0, m0, i0) = {
            let r = &readers[0];
            (*r.header(), r.matrix().clone(), r.inverse_matrix().clone())
        };
        for r in &readers[1..] {
            let h = r.header();
            let detail = if h.key_len != h0.key_len {
                Some(format!(
                    "key length {} != {}",
                    h.key_len, h0.key_len
                ))
            } else if h.size != h0.size {
                Some(format!("hash size {} != {}", h.size, h0.size))
            } else if h.max_reprobe != h0.max_reprobe {
                Some(format!(
                    "max reprobe offset {} != {}",
                    h.max_reprobe, h0.max_reprobe
                ))
            } else if r.matrix() != &m0 || r.inverse_matrix() != &i0 {
                Some("hash function differs".to_owned())
            } else {
                None
            };
            if let Some(detail) = detail {
                return Err(MergeError::Mismatch {
                    path: r.path().to_owned(),
                    detail,
                });
            }
        }
    }

    let h0 = *readers[0].header();
    let key_bytes = bits_to_bytes(h0.key_len as usize);
    let out_val_bytes = out_val_bytes.clamp(1, 8);
    let record_len = key_bytes + out_val_bytes;
    let nb_records = (buffer_size / record_len).max(1);

    // Output file: header placeholder, matrices, padding; the body is
    // appended by the writer thread.
    let mut file = File::create(output)?;
    let out_header = |stats: DumpStats| ListHeader {
        key_len: h0.key_len,
        val_len: out_val_bytes as u64,
        size: h0.size,
        max_reprobe: h0.max_reprobe,
        unique: stats.unique,
        distinct: stats.distinct,
        total: stats.total,
        max_count: stats.max_count,
    };
    out_header(DumpStats::default()).write(&mut file)?;
    readers[0].matrix().dump(&mut file)?;
    readers[0].inverse_matrix().dump(&mut file)?;
    let at = file.stream_position()?;
    file.write_all(&vec![0u8; (align8(at) - at) as usize])?;

    let (full_tx, full_rx) = bounded::<RecordWriter>(NB_BUFFERS);
    let (free_tx, free_rx) = bounded::<RecordWriter>(NB_BUFFERS);
    for _ in 0..NB_BUFFERS {
        free_tx
            .send(RecordWriter::new(nb_records, key_bytes, out_val_bytes))
            .expect("free buffer channel open");
    }

    let stats = thread::scope(|s| -> Result<DumpStats, MergeError> {
        // Writer: drain full buffers in order, hand them back for reuse.
        let writer = s.spawn(move || -> io::Result<File> {
            for mut w in full_rx {
                w.dump(&mut file)?;
                if free_tx.send(w).is_err() {
                    break;
                }
            }
            Ok(file)
        });

        // Merge loop: prime the heap with one record per reader, then pop
        // runs of equal keys.
        let mut heap: BinaryHeap<std::cmp::Reverse<(u64, u64, u64, usize)>> = BinaryHeap::new();
        let mut refill =
            |heap: &mut BinaryHeap<std::cmp::Reverse<(u64, u64, u64, usize)>>,
             readers: &mut [ListReader],
             i: usize|
             -> Result<(), MergeError> {
                if let Some((k, v)) = readers[i].next()? {
                    let pos = readers[i].pos(k);
                    heap.push(std::cmp::Reverse((pos, k, v, i)));
                }
                Ok(())
            };
        for i in 0..readers.len() {
            refill(&mut heap, &mut readers, i)?;
        }

        let w = free_rx.recv().expect("initial buffer");
        let (result, w) = (|mut w: RecordWriter| -> (Result<(), MergeError>, RecordWriter) {
            while let Some(std::cmp::Reverse((_, key, val, src))) = heap.pop() {
                let mut sum = val;
                if let Err(e) = refill(&mut heap, &mut readers, src) {
                    return (Err(e), w);
                }
                while let Some(std::cmp::Reverse((_, k2, v2, s2))) = heap.peek().copied() {
                    if k2 != key {
                        break;
                    }
                    heap.pop();
                    sum = sum.saturating_add(v2);
                    if let Err(e) = refill(&mut heap, &mut readers, s2) {
                        return (Err(e), w);
                    }
                }
                if !w.append(key, sum) {
                    full_tx.send(w).expect("writer alive");
                    w = free_rx.recv().expect("recycled buffer");
                    w.append(key, sum);
                }
            }
            (Ok(()), w)
        })(w);

        // Flush the tail buffer and shut the pipeline down even on error.
        let _ = full_tx.send(w);
        drop(full_tx);
        let mut file = writer.join().expect("writer thread")?;
        result?;

        // Collect the stats accumulated inside every rotated buffer.
        let mut stats = DumpStats::default();
        while let Ok(w) = free_rx.try_recv() {
            stats.absorb(w.stats());
        }

        file.seek(SeekFrom::Start(0))?;
        out_header(stats).write(&mut file)?;
        file.sync_all()?;
        Ok(stats)
    })?;

    Ok(stats)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::sorted::SortedDumper;
    use crate::dump::Dumper;
    use crate::format::query::ListQuery;
    use crate::hash::array::Array;
    use crate::hash::matrix::SquareMatrix;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn shared_matrices(key_len: usize, seed: u64) -> (SquareMatrix, SquareMatrix) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut m = SquareMatrix::new(key_len);
        let inv = m.randomize_pseudo_inverse(&mut rng);
        (m, inv)
    }

    fn dump_with(
        dir: &TempDir,
        name: &str,
        m: &SquareMatrix,
        inv: &SquareMatrix,
        entries: &[(u64, u64)],
    ) -> PathBuf {
        let out = dir.path().join(name);
        let ary =
            Array::with_matrices(1024, 20, 5, 62, m.clone(), inv.clone()).unwrap();
        for (k, v) in entries {
            ary.add(*k, *v).unwrap();
        }
        let d = SortedDumper::new(2, &out, 4096, 4);
        d.set_one_file(true);
        d.dump(&ary).unwrap();
        out
    }

    #[test]
    fn merge_sums_counts_across_inputs() {
        let dir = TempDir::new().unwrap();
        let (m, inv) = shared_matrices(20, 1);
        let mut rng = StdRng::seed_from_u64(2);
        let mut expect: HashMap<u64, u64> = HashMap::new();
        let mut paths = Vec::new();
        for i in 0..3 {
            let entries: Vec<(u64, u64)> = (0..200)
                .map(|_| {
                    (
                        rng.gen::<u64>() & ((1 << 20) - 1),
                        rng.gen_range(1..20) as u64,
                    )
                })
                .collect();
            let mut dedup: HashMap<u64, u64> = HashMap::new();
            for (k, v) in &entries {
                *dedup.entry(*k).or_default() += v;
            }
            for (k, v) in &dedup {
                *expect.entry(*k).or_default() += v;
            }
            paths.push(dump_with(
                &dir,
                &format!("in{}.jf", i),
                &m,
                &inv,
                &dedup.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
            ));
        }

        let out = dir.path().join("merged.jf");
        let stats = merge_files(&paths, &out, 4, 1 << 12).unwrap();
        assert_eq!(stats.distinct, expect.len() as u64);
        assert_eq!(stats.total, expect.values().sum::<u64>());

        let q = ListQuery::open(&out).unwrap();
        for (k, v) in &expect {
            assert_eq!(q.get(*k), *v, "key {:#x}", k);
        }
        // output is still position-sorted, so binary search keeps working on
        // keys that are absent
        assert_eq!(q.nb_records(), expect.len() as u64);
    }

    #[test]
    fn merge_rejects_different_hash_functions() {
        let dir = TempDir::new().unwrap();
        let (m1, i1) = shared_matrices(20, 10);
        let (m2, i2) = shared_matrices(20, 11);
        let a = dump_with(&dir, "a.jf", &m1, &i1, &[(1, 1)]);
        let b = dump_with(&dir, "b.jf", &m2, &i2, &[(2, 1)]);
        let out = dir.path().join("out.jf");
        match merge_files(&[a, b], &out, 4, 4096) {
            Err(MergeError::Mismatch { detail, .. }) => {
                assert!(detail.contains("hash function"), "{}", detail)
            }
            other => panic!("expected mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn merge_clamps_to_output_counter_width() {
        let dir = TempDir::new().unwrap();
        let (m, inv) = shared_matrices(20, 20);
        let a = dump_with(&dir, "a.jf", &m, &inv, &[(5, 200)]);
        let b = dump_with(&dir, "b.jf", &m, &inv, &[(5, 100)]);
        let out = dir.path().join("out.jf");
        // 1-byte output counters: 200 + 100 clamps to 255
        let stats = merge_files(&[a, b], &out, 1, 4096).unwrap();
        assert_eq!(stats.max_count, 255);
        let q = ListQuery::open(&out).unwrap();
        assert_eq!(q.get(5), 255);
    }

    #[test]
    fn merge_requires_inputs() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.jf");
        assert!(matches!(
            merge_files(&[], &out, 4, 4096),
            Err(MergeError::NoInput)
        ));
    }
}
