//! Position-sorted compacted dumper.
//!
//! Walks the array in block order, one thread per `T`-th block group. Each
//! group is compacted in memory into `(key, value)` records ordered by hash
//! position, written under the group's token, then zeroed so the array can
//! keep counting. Entries that reprobed past a group boundary are picked up
//! by the overlap-aware iterator and re-ordered through a bounded heap: an
//! entry can sit at most `max_reprobe_offset` slots past its base position,
//! so a heap of that capacity restores position order.
//!
//! Group 0 is zeroed only after all threads have finished: the overlap scan
//! of the last group wraps around into it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::dump::writer::{DumpStats, RecordWriter};
use crate::dump::{indexed_path, token_ring::TokenRing, Dumper};
use crate::format::header::ListHeader;
use crate::format::{align8, bits_to_bytes};
use crate::hash::array::Array;

pub struct SortedDumper {
    threads: usize,
    path: PathBuf,
    buffer_size: usize,
    out_val_bytes: usize,
    lower: u64,
    upper: u64,
    one_file: AtomicBool,
    file_index: AtomicUsize,
    last_stats: Mutex<DumpStats>,
}

impl SortedDumper {
    pub fn new(threads: usize, path: &Path, buffer_size: usize, out_val_bytes: usize) -> SortedDumper {
        assert!(threads >= 1);
        SortedDumper {
            threads,
            path: path.to_owned(),
            buffer_size: buffer_size.max(1024),
            out_val_bytes: out_val_bytes.clamp(1, 8),
            lower: 0,
            upper: u64::MAX,
            one_file: AtomicBool::new(false),
            file_index: AtomicUsize::new(0),
            last_stats: Mutex::new(DumpStats::default()),
        }
    }

    /// Entries whose summed count falls outside `[lower, upper]` are skipped
    /// (their blocks are still zeroed).
    pub fn set_bounds(&mut self, lower: u64, upper: u64) {
        self.lower = lower;
        self.upper = upper;
    }

    /// When set, the next dump writes to the bare output path instead of a
    /// numbered intermediate.
    pub fn set_one_file(&self, v: bool) {
        self.one_file.store(v, Ordering::SeqCst);
    }

    /// Number of numbered intermediate files written so far.
    pub fn nb_files(&self) -> usize {
        self.file_index.load(Ordering::SeqCst)
    }

    /// Statistics of the most recent dump.
    pub fn last_stats(&self) -> DumpStats {
        *self.last_stats.lock().unwrap()
    }

    /// Path of intermediate file `i`.
    pub fn file_path(&self, i: usize) -> PathBuf {
        indexed_path(&self.path, i)
    }

    fn header(&self, ary: &Array, stats: DumpStats) -> ListHeader {
        ListHeader {
            key_len: ary.key_len() as u64,
            val_len: self.out_val_bytes as u64,
            size: ary.size(),
            max_reprobe: ary.max_reprobe_offset(),
            unique: stats.unique,
            distinct: stats.distinct,
            total: stats.total,
            max_count: stats.max_count,
        }
    }

    fn dump_inner(&self, ary: &Array) -> io::Result<()> {
        let one_file = self.one_file.load(Ordering::SeqCst);
        let path = if one_file {
            self.path.clone()
        } else {
            self.file_path(self.file_index.load(Ordering::SeqCst))
        };

        let key_bytes = bits_to_bytes(ary.key_len());
        let record_len = key_bytes + self.out_val_bytes;
        let mro = ary.max_reprobe_offset() as usize;

        // Group length: a whole number of blocks close to the buffer budget,
        // but no shorter than the reprobe overlap the heap must absorb.
        let want = (self.buffer_size / record_len).max(ary.block_len());
        let (mut nb_records, mut nb_blocks) = ary.floor_block(want);
        while nb_records < mro {
            let grown = ary.floor_block(2 * nb_records.max(ary.block_len()));
            nb_records = grown.0;
            nb_blocks = grown.1;
        }

        let mut file = File::create(&path)?;
        // Placeholder header; totals are rewritten once they are known.
        self.header(ary, DumpStats::default()).write(&mut file)?;
        ary.write_matrices(&mut file)?;
        let at = file.stream_position()?;
        let pad = align8(at) - at;
        file.write_all(&vec![0u8; pad as usize])?;

        let out = Mutex::new(file);
        let ring = TokenRing::new(self.threads);
        let totals = Mutex::new(DumpStats::default());
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<io::Error>> = Mutex::new(None);

        thread::scope(|s| {
            for t in 0..self.threads {
                let token = ring.token(t);
                let out = &out;
                let totals = &totals;
                let failed = &failed;
                let first_error = &first_error;
                s.spawn(move || {
                    let mut w = RecordWriter::new(nb_records, key_bytes, self.out_val_bytes);
                    let mut heap: BinaryHeap<Reverse<(u64, u64, u64)>> =
                        BinaryHeap::with_capacity(mro + 1);

                    let mut group = t as u64;
                    while group * (nb_records as u64) < ary.size() {
                        let start = group * nb_records as u64;
                        let end = start + nb_records as u64;
                        let mut it = ary.iter_range(start, end, true);

                        for _ in 0..mro {
                            match it.next() {
                                Some(e) => heap.push(Reverse((e.pos, e.key, e.val))),
                                None => break,
                            }
                        }
                        while let Some(e) = it.next() {
                            let Reverse((_, key, val)) = heap.pop().unwrap();
                            if val >= self.lower && val <= self.upper {
                                w.append(key, val);
                            }
                            heap.push(Reverse((e.pos, e.key, e.val)));
                        }
                        while let Some(Reverse((_, key, val))) = heap.pop() {
                            if val >= self.lower && val <= self.upper {
                                w.append(key, val);
                            }
                        }

                        token.wait();
                        if failed.load(Ordering::SeqCst) {
                            // drain the buffer, keep the ring moving
                            let _ = w.dump(&mut io::sink());
                        } else if let Err(e) = w.dump(&mut *out.lock().unwrap()) {
                            failed.store(true, Ordering::SeqCst);
                            first_error.lock().unwrap().get_or_insert(e);
                        }
                        token.pass();

                        if group > 0 {
                            ary.zero_blocks(group as usize * nb_blocks, nb_blocks);
                        }
                        group += self.threads as u64;
                    }

                    totals.lock().unwrap().absorb(w.stats());
                });
            }
        });

        // The overlap scan of the tail groups wraps into the first group, so
        // it is only zeroed once everyone is finished.
        ary.zero_blocks(0, nb_blocks);

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }

        let stats = totals.into_inner().unwrap();
        let mut file = out.into_inner().unwrap();
        file.seek(SeekFrom::Start(0))?;
        self.header(ary, stats).write(&mut file)?;
        file.sync_all()?;

        *self.last_stats.lock().unwrap() = stats;
        if !one_file {
            self.file_index.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Dumper for SortedDumper {
    fn dump(&self, ary: &Array) -> io::Result<()> {
        self.dump_inner(ary)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
