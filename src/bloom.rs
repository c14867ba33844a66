//! Counting Bloom filter over mers, used as a pre-filter for `count --bf`.
//!
//! The filter answers "has this mer been seen at least twice?" with no false
//! negatives and a configurable false-positive rate, which lets the counting
//! pass drop the long tail of sequencing-error singletons before they ever
//! claim a hash slot. Buckets saturate at 255; only the 0/1/many distinction
//! is consumed.
//!
//! Double hashing: two xxh64 seeds produce `h1` and `h2`, probe `i` uses
//! `h1 + i * h2 (mod m)`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use xxhash_rust::xxh64::xxh64;

const BLOOM_MAGIC: &[u8; 8] = b"JFBLOOMC";

const SEED1: u64 = 0x9747_b28c_0aa3_19fe;
const SEED2: u64 = 0x2545_f491_4f6c_dd1d;

pub struct BloomCounter {
    mer_len: usize,
    nb_hashes: usize,
    buckets: Vec<AtomicU8>,
}

impl BloomCounter {
    /// A filter sized for `n` expected distinct mers at false-positive rate
    /// `fp` (classic `m = -n ln fp / (ln 2)^2`, `k = m/n ln 2`).
    pub fn new(fp: f64, n: u64, mer_len: usize) -> BloomCounter {
        let fp = fp.clamp(1e-10, 0.5);
        let m = (-(n.max(1) as f64) * fp.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as usize;
        let k = ((m as f64 / n.max(1) as f64) * std::f64::consts::LN_2).round() as usize;
        BloomCounter::with_size(m.max(64), k.clamp(1, 16), mer_len)
    }

    pub fn with_size(m: usize, nb_hashes: usize, mer_len: usize) -> BloomCounter {
        let mut buckets = Vec::new();
        buckets.resize_with(m, || AtomicU8::new(0));
        BloomCounter {
            mer_len,
            nb_hashes,
            buckets,
        }
    }

    pub fn mer_len(&self) -> usize {
        self.mer_len
    }
    pub fn nb_buckets(&self) -> usize {
        self.buckets.len()
    }
    pub fn nb_hashes(&self) -> usize {
        self.nb_hashes
    }

    #[inline]
    fn probes(&self, mer: u64) -> (u64, u64) {
        let bytes = mer.to_le_bytes();
        (xxh64(&bytes, SEED1), xxh64(&bytes, SEED2) | 1)
    }

    /// Record one occurrence; returns the filter's count *before* the
    /// insert (the minimum over the probed buckets).
    pub fn insert(&self, mer: u64) -> u8 {
        let (h1, h2) = self.probes(mer);
        let m = self.buckets.len() as u64;
        let mut prior = u8::MAX;
        for i in 0..self.nb_hashes as u64 {
            let b = &self.buckets[(h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize];
            // saturating increment
            let mut cur = b.load(Ordering::Relaxed);
            loop {
                if cur == u8::MAX {
                    break;
                }
                match b.compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => break,
                    Err(now) => cur = now,
                }
            }
            prior = prior.min(cur);
        }
        prior
    }

    /// The filter's count for `mer` (minimum over the probed buckets).
    pub fn check(&self, mer: u64) -> u8 {
        let (h1, h2) = self.probes(mer);
        let m = self.buckets.len() as u64;
        let mut count = u8::MAX;
        for i in 0..self.nb_hashes as u64 {
            let b = &self.buckets[(h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize];
            count = count.min(b.load(Ordering::Relaxed));
        }
        count
    }

    // ── Serialization: magic, mer_len, m, nb_hashes, bucket bytes ───────────

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut f = File::create(path)?;
        f.write_all(BLOOM_MAGIC)?;
        for v in [
            self.mer_len as u64,
            self.buckets.len() as u64,
            self.nb_hashes as u64,
        ] {
            f.write_all(&v.to_le_bytes())?;
        }
        let mut buf = Vec::with_capacity(self.buckets.len());
        for b in &self.buckets {
            buf.push(b.load(Ordering::Relaxed));
        }
        f.write_all(&buf)
    }

    pub fn read_from(path: &Path) -> io::Result<BloomCounter> {
        let mut f = File::open(path)?;
        let mut head = [0u8; 8 + 3 * 8];
        f.read_exact(&mut head)?;
        if &head[..8] != BLOOM_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid bloom filter format '{}'",
                    String::from_utf8_lossy(&head[..8])
                ),
            ));
        }
        let field = |i: usize| {
            u64::from_le_bytes(head[8 + 8 * i..16 + 8 * i].try_into().unwrap())
        };
        let mer_len = field(0) as usize;
        let m = field(1) as usize;
        let nb_hashes = field(2) as usize;
        if mer_len == 0 || mer_len > 32 || m == 0 || nb_hashes == 0 || nb_hashes > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt bloom filter header",
            ));
        }
        let mut bytes = vec![0u8; m];
        f.read_exact(&mut bytes)?;
        let filter = BloomCounter::with_size(m, nb_hashes, mer_len);
        for (b, v) in filter.buckets.iter().zip(bytes) {
            b.store(v, Ordering::Relaxed);
        }
        Ok(filter)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn no_false_negatives_for_twice_seen() {
        let bc = BloomCounter::new(0.01, 10_000, 8);
        for m in 0..1000u64 {
            bc.insert(m);
            bc.insert(m);
        }
        for m in 0..1000u64 {
            assert!(bc.check(m) >= 2, "mer {} lost", m);
        }
    }

    #[test]
    fn insert_reports_prior_count() {
        let bc = BloomCounter::new(0.001, 1000, 8);
        assert_eq!(bc.insert(42), 0);
        assert!(bc.insert(42) >= 1);
    }

    #[test]
    fn unseen_mers_mostly_read_zero() {
        let bc = BloomCounter::new(0.01, 100_000, 12);
        for m in 0..10_000u64 {
            bc.insert(m);
        }
        let fp = (100_000u64..110_000)
            .filter(|&m| bc.check(m) > 0)
            .count();
        // 1% target rate; allow generous slack
        assert!(fp < 500, "false positive rate too high: {}/10000", fp);
    }

    #[test]
    fn file_round_trip() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("filter.bc");
        let bc = BloomCounter::new(0.01, 1000, 9);
        for m in 0..500u64 {
            bc.insert(m);
            bc.insert(m);
        }
        bc.write_to(&p).unwrap();

        let back = BloomCounter::read_from(&p).unwrap();
        assert_eq!(back.mer_len(), 9);
        assert_eq!(back.nb_buckets(), bc.nb_buckets());
        for m in 0..500u64 {
            assert_eq!(back.check(m), bc.check(m));
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("junk.bc");
        std::fs::write(&p, b"NOTBLOOMxxxxxxxxxxxxxxxxxxxxxxxx").unwrap();
        assert!(BloomCounter::read_from(&p).is_err());
    }

    #[test]
    fn concurrent_inserts_saturate_safely() {
        use std::sync::Arc;
        let bc = Arc::new(BloomCounter::new(0.01, 1000, 8));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let bc = Arc::clone(&bc);
                s.spawn(move || {
                    for _ in 0..100 {
                        for m in 0..64u64 {
                            bc.insert(m);
                        }
                    }
                });
            }
        });
        for m in 0..64u64 {
            assert!(bc.check(m) >= 2);
        }
    }
}
