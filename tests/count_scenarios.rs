//! End-to-end scenarios over the library: count into the cooperative hash,
//! dump, reload, query.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use mercount::dump::Dumper;
use mercount::{each_mer, mer, Array, HashCounter, ListQuery, SortedDumper};

// ── Small fixed workloads ────────────────────────────────────────────────────

#[test]
fn four_copies_of_one_mer() {
    // k = 4, 64 slots, 4-bit counters
    let c = HashCounter::new(64, 8, 4, 1, 62).unwrap();
    let acgt = mer::mer_from_ascii(b"ACGT", 4).unwrap();
    for _ in 0..4 {
        c.add(acgt, 1).unwrap();
    }
    c.done().unwrap();

    let ary = c.ary();
    assert_eq!(ary.get_val(acgt), Some(4));
    let entries: Vec<_> = ary.iter_all().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, acgt);
    assert_eq!(entries[0].val, 4);
}

#[test]
fn overflow_past_a_three_bit_counter() {
    // 3-bit counters hold at most 7; ten adds must chain
    let c = HashCounter::new(64, 8, 3, 1, 62).unwrap();
    let acgt = mer::mer_from_ascii(b"ACGT", 4).unwrap();
    for _ in 0..10 {
        c.add(acgt, 1).unwrap();
    }
    c.done().unwrap();

    let ary = c.ary();
    assert_eq!(ary.get_val(acgt), Some(10));
    let entries: Vec<_> = ary.iter_all().collect();
    assert_eq!(entries.len(), 1, "overflow links must not appear as entries");
    assert_eq!((entries[0].key, entries[0].val), (acgt, 10));
}

#[test]
fn canonical_counting_folds_strands() {
    let k = 16;
    let c = HashCounter::new(1024, 2 * k, 5, 1, 62).unwrap();
    let fwd = mer::mer_from_ascii(b"AAAAAAAAAAAAAAAC", k).unwrap();
    let rc = mer::reverse_complement(fwd, k);
    assert_eq!(mer::mer_to_string(rc, k), "GTTTTTTTTTTTTTTT");

    for m in [fwd, rc] {
        c.add(mer::canonical(m, k), 1).unwrap();
    }
    c.done().unwrap();

    let ary = c.ary();
    let entries: Vec<_> = ary.iter_all().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, fwd.min(rc), "stored key is min(m, rc(m))");
    assert_eq!(entries[0].val, 2);
}

// ── Contended counting, resize, dump, mmap reload ────────────────────────────

#[test]
fn contended_count_dump_reload() {
    let threads = 4usize;
    let per_thread = 250_000u64;
    let k = 8usize;
    let c = Arc::new(HashCounter::new(16, 2 * k, 4, threads, 62).unwrap());
    let hot = mer::mer_from_ascii(b"ACGTACGT", k).unwrap();

    thread::scope(|s| {
        for _ in 0..threads {
            let c = Arc::clone(&c);
            s.spawn(move || {
                for _ in 0..per_thread {
                    c.add(hot, 1).unwrap();
                }
                c.done().unwrap();
            });
        }
    });

    let expected = threads as u64 * per_thread;
    let ary = c.ary();
    assert_eq!(ary.get_val(hot), Some(expected));
    let entries: Vec<_> = ary.iter_all().collect();
    assert_eq!(entries.len(), 1);

    // dump and reload through the mmap query
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("hot.jf");
    let d = SortedDumper::new(threads, &out, 1 << 16, 4);
    d.set_one_file(true);
    d.dump(&ary).unwrap();

    let q = ListQuery::open(&out).unwrap();
    assert_eq!(q.get(hot), expected);
    let h = q.header();
    assert_eq!(h.distinct, 1);
    assert_eq!(h.total, expected);
    assert_eq!(h.max_count, expected);
    assert_eq!(h.unique, 0);
}

// ── Parser-to-query pipeline with brute-force oracle ─────────────────────────

#[test]
fn parser_counts_agree_with_brute_force() {
    let dir = TempDir::new().unwrap();
    let fasta = dir.path().join("reads.fa");
    let k = 11usize;

    // deterministic pseudo-random reads
    let mut state = 0x1234_5678_9abc_def0u64;
    let mut reads: Vec<Vec<u8>> = Vec::new();
    for _ in 0..40 {
        let len = 80 + (state % 120) as usize;
        let read: Vec<u8> = (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                b"ACGT"[(state >> 33) as usize % 4]
            })
            .collect();
        reads.push(read);
    }
    let mut text = String::new();
    for (i, r) in reads.iter().enumerate() {
        text.push_str(&format!(">read{}\n", i));
        text.push_str(std::str::from_utf8(r).unwrap());
        text.push('\n');
    }
    std::fs::write(&fasta, &text).unwrap();

    let mut expect: HashMap<u64, u64> = HashMap::new();
    for r in &reads {
        each_mer(r, k, false, |m| *expect.entry(m).or_default() += 1);
    }

    let threads = 3;
    let c = Arc::new(HashCounter::new(1024, 2 * k, 5, threads, 62).unwrap());
    let parser = Arc::new(mercount::OverlapParser::new(vec![fasta], k, 256));
    thread::scope(|s| {
        for _ in 0..threads {
            let c = Arc::clone(&c);
            let parser = Arc::clone(&parser);
            s.spawn(move || {
                let mut buf = Vec::new();
                while parser.next_buffer(&mut buf).unwrap() {
                    each_mer(&buf, k, false, |m| c.add(m, 1).unwrap());
                }
                c.done().unwrap();
            });
        }
    });

    let ary = c.ary();
    let got: HashMap<u64, u64> = ary.iter_all().map(|e| (e.key, e.val)).collect();
    assert_eq!(got, expect);
}

// ── Raw dump round trip through Array reload ─────────────────────────────────

#[test]
fn raw_round_trip_preserves_block_image() {
    use mercount::{RawDb, RawDumper};

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("image.jfr");
    let ary = Array::new(256, 14, 5, 62).unwrap();
    for key in (0..1000u64).step_by(7) {
        ary.add(key & 0x3FFF, 3).unwrap();
    }
    let before: HashMap<u64, u64> = ary.iter_all().map(|e| (e.key, e.val)).collect();

    let d = RawDumper::new(2, &out, 4096);
    d.set_one_file(true);
    d.dump(&ary).unwrap();

    let db = RawDb::open(&out).unwrap();
    let after: HashMap<u64, u64> = db.array().iter_all().map(|e| (e.key, e.val)).collect();
    assert_eq!(after, before);
}
