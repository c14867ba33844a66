//! Raw block-image dumper.
//!
//! Writes the array's words verbatim (little-endian), block group by block
//! group, under the same token-ring ordering as the sorted dumper. The
//! resulting `JFRHSHDN` file mirrors the in-memory layout exactly and is
//! reloaded with [`crate::format::reader::RawDb`]. No per-entry work
//! happens, so this is the fastest way to empty a table; the price is that
//! consumers must understand the slot layout.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::dump::{indexed_path, token_ring::TokenRing, Dumper};
use crate::format::align8;
use crate::format::header::RawHeader;
use crate::hash::array::Array;

pub struct RawDumper {
    threads: usize,
    path: PathBuf,
    buffer_size: usize,
    one_file: AtomicBool,
    file_index: AtomicUsize,
}

impl RawDumper {
    pub fn new(threads: usize, path: &Path, buffer_size: usize) -> RawDumper {
        assert!(threads >= 1);
        RawDumper {
            threads,
            path: path.to_owned(),
            buffer_size: buffer_size.max(1024),
            one_file: AtomicBool::new(false),
            file_index: AtomicUsize::new(0),
        }
    }

    pub fn set_one_file(&self, v: bool) {
        self.one_file.store(v, Ordering::SeqCst);
    }

    pub fn nb_files(&self) -> usize {
        self.file_index.load(Ordering::SeqCst)
    }

    pub fn file_path(&self, i: usize) -> PathBuf {
        indexed_path(&self.path, i)
    }

    fn dump_inner(&self, ary: &Array) -> io::Result<()> {
        let one_file = self.one_file.load(Ordering::SeqCst);
        let path = if one_file {
            self.path.clone()
        } else {
            self.file_path(self.file_index.load(Ordering::SeqCst))
        };

        // Whole blocks per group, sized to the write-buffer budget.
        let words_budget = (self.buffer_size / 8).max(ary.block_word_len());
        let nb_blocks = (words_budget / ary.block_word_len()).max(1);
        let group_records = nb_blocks * ary.block_len();

        let mut file = File::create(&path)?;
        RawHeader {
            key_len: ary.key_len() as u64,
            val_len: ary.val_len() as u64,
            size: ary.size(),
            max_reprobe: ary.max_reprobe() as u64,
        }
        .write(&mut file)?;
        ary.write_matrices(&mut file)?;
        let at = file.metadata()?.len();
        file.write_all(&vec![0u8; (align8(at) - at) as usize])?;

        let out = Mutex::new(io::BufWriter::new(file));
        let ring = TokenRing::new(self.threads);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<io::Error>> = Mutex::new(None);

        thread::scope(|s| {
            for t in 0..self.threads {
                let token = ring.token(t);
                let out = &out;
                let failed = &failed;
                let first_error = &first_error;
                s.spawn(move || {
                    let mut group = t;
                    while group * group_records < ary.size() as usize {
                        token.wait();
                        if !failed.load(Ordering::SeqCst) {
                            let mut w = out.lock().unwrap();
                            if let Err(e) =
                                ary.write_blocks(&mut *w, group * nb_blocks, nb_blocks)
                            {
                                failed.store(true, Ordering::SeqCst);
                                first_error.lock().unwrap().get_or_insert(e);
                            }
                        }
                        token.pass();
                        ary.zero_blocks(group * nb_blocks, nb_blocks);
                        group += self.threads;
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }
        out.into_inner().unwrap().flush()?;
        if !one_file {
            self.file_index.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Dumper for RawDumper {
    fn dump(&self, ary: &Array) -> io::Result<()> {
        self.dump_inner(ary)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reader::RawDb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn raw_dump_reloads_identically() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("raw.jf");

        let ary = Array::new(512, 18, 5, 62).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let mut expect: HashMap<u64, u64> = HashMap::new();
        for _ in 0..200 {
            let key = rng.gen::<u64>() & ((1 << 18) - 1);
            ary.add(key, 1).unwrap();
            *expect.entry(key).or_default() += 1;
        }

        let d = RawDumper::new(2, &out, 4096);
        d.set_one_file(true);
        d.dump(&ary).unwrap();
        assert_eq!(ary.iter_all().count(), 0, "dump must zero the table");

        let db = RawDb::open(&out).unwrap();
        let reloaded = db.array();
        let mut seen: HashMap<u64, u64> = HashMap::new();
        for e in reloaded.iter_all() {
            seen.insert(e.key, e.val);
        }
        assert_eq!(seen, expect);
        for (k, v) in &expect {
            assert_eq!(reloaded.get_val(*k), Some(*v));
        }
    }
}
