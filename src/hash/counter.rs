//! Thread-facing wrapper around the hash array: cooperative resize and
//! dump-on-full.
//!
//! A fixed crew of `nb_threads` workers share one [`HashCounter`]. Each
//! worker loops calling [`HashCounter::add`] (or `set`/`update_add`) and
//! finally calls [`HashCounter::done`] exactly once. When the array reports
//! full, every worker converges on a barrier-synchronized *round*:
//!
//! 1. barrier; the leader decides the round: terminate (all workers are
//!    done), double the array, or drain it to disk;
//! 2. barrier; everyone reads the decision;
//! 3. doubling only: each worker re-inserts one slice of the old array into
//!    the new one;
//! 4. barrier; the leader swaps the new array in;
//! 5. barrier; workers retry whatever made them enter the round.
//!
//! No worker touches the array between steps 1 and 5 except through its
//! assigned slice, so the swap needs no per-slot synchronization. Workers
//! that are already `done` keep participating in rounds until the round
//! terminates, which keeps the barrier full.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};

use crate::dump::Dumper;
use crate::hash::array::{Array, ArrayError};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CounterError {
    /// The leader failed to allocate the doubled array.
    Alloc(String),
    /// The leader failed to drain the array to disk.
    Dump(String),
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::Alloc(m) => write!(f, "size doubling failed: {}", m),
            CounterError::Dump(m) => write!(f, "dump on full table failed: {}", m),
        }
    }
}

impl std::error::Error for CounterError {}

// ─────────────────────────────────────────────────────────────────────────────
// HashCounter
// ─────────────────────────────────────────────────────────────────────────────

enum FullPolicy {
    /// Allocate a 2x array and re-insert (the default).
    Double,
    /// Keep the size fixed; drain to disk and reuse the zeroed array.
    Dump(Arc<dyn Dumper>),
}

#[derive(Clone)]
enum Round {
    Terminate,
    Doubled,
    Dumped,
    Failed(CounterError),
}

pub struct HashCounter {
    ary: RwLock<Arc<Array>>,
    new_ary: Mutex<Option<Arc<Array>>>,
    outcome: Mutex<Round>,
    nb_threads: usize,
    barrier: Barrier,
    size_thid: AtomicUsize,
    done_threads: AtomicUsize,
    failed: AtomicBool,
    policy: FullPolicy,
}

impl HashCounter {
    pub fn new(
        size: u64,
        key_len: usize,
        val_len: usize,
        nb_threads: usize,
        reprobe_limit: usize,
    ) -> Result<HashCounter, ArrayError> {
        assert!(nb_threads >= 1);
        let ary = Array::new(size, key_len, val_len, reprobe_limit)?;
        Ok(HashCounter::around(ary, nb_threads))
    }

    /// Like [`HashCounter::new`] but with caller-chosen matrices, so several
    /// runs can produce mergeable databases.
    pub fn with_matrices(
        size: u64,
        key_len: usize,
        val_len: usize,
        nb_threads: usize,
        reprobe_limit: usize,
        matrix: crate::hash::matrix::SquareMatrix,
        inverse: crate::hash::matrix::SquareMatrix,
    ) -> Result<HashCounter, ArrayError> {
        assert!(nb_threads >= 1);
        let ary = Array::with_matrices(size, key_len, val_len, reprobe_limit, matrix, inverse)?;
        Ok(HashCounter::around(ary, nb_threads))
    }

    fn around(ary: Array, nb_threads: usize) -> HashCounter {
        HashCounter {
            ary: RwLock::new(Arc::new(ary)),
            new_ary: Mutex::new(None),
            outcome: Mutex::new(Round::Terminate),
            nb_threads,
            barrier: Barrier::new(nb_threads),
            size_thid: AtomicUsize::new(0),
            done_threads: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            policy: FullPolicy::Double,
        }
    }

    /// Switch the full-table policy from doubling to draining through
    /// `dumper`. Must be called before the workers start.
    pub fn dump_on_full(&mut self, dumper: Arc<dyn Dumper>) {
        self.policy = FullPolicy::Dump(dumper);
    }

    pub fn nb_threads(&self) -> usize {
        self.nb_threads
    }

    /// Snapshot of the current array (stable between rounds).
    pub fn ary(&self) -> Arc<Array> {
        self.ary.read().unwrap().clone()
    }

    // ── Worker operations ───────────────────────────────────────────────────

    /// Add `val` to `key`, cooperating in resize rounds until it sticks.
    pub fn add(&self, key: u64, val: u64) -> Result<(), CounterError> {
        loop {
            if self.ary.read().unwrap().add(key, val).is_some() {
                return Ok(());
            }
            self.round()?;
        }
    }

    /// Mark `key` present; returns whether it was new.
    pub fn set(&self, key: u64) -> Result<bool, CounterError> {
        loop {
            if let Some(claim) = self.ary.read().unwrap().set(key) {
                return Ok(claim.is_new);
            }
            self.round()?;
        }
    }

    /// Add `val` to `key` only if present; returns whether the key was
    /// present.
    pub fn update_add(&self, key: u64, val: u64) -> Result<bool, CounterError> {
        loop {
            if let Some(present) = self.ary.read().unwrap().update_add(key, val) {
                return Ok(present);
            }
            self.round()?;
        }
    }

    /// Declare this worker finished, then keep serving resize rounds until
    /// every worker has done the same.
    pub fn done(&self) -> Result<(), CounterError> {
        self.done_threads.fetch_add(1, Ordering::SeqCst);
        while !self.round()? {}
        Ok(())
    }

    // ── The cooperative round ───────────────────────────────────────────────

    // Returns Ok(true) when the round terminated the crew, Ok(false) when
    // the caller should retry its operation.
    //
    // Once a round has failed, every worker of that round received the
    // error and unwinds without calling `done`; later calls must not reach
    // the barrier (nobody would show up) and fail fast instead.
    fn round(&self) -> Result<bool, CounterError> {
        if self.failed.load(Ordering::SeqCst) {
            if let Round::Failed(e) = &*self.outcome.lock().unwrap() {
                return Err(e.clone());
            }
        }
        if self.barrier.wait().is_leader() {
            let mut out = self.outcome.lock().unwrap();
            *out = if self.done_threads.load(Ordering::SeqCst) >= self.nb_threads {
                self.done_threads.store(0, Ordering::SeqCst);
                Round::Terminate
            } else {
                let old = self.ary.read().unwrap().clone();
                match &self.policy {
                    FullPolicy::Double => match old.doubled() {
                        Ok(bigger) => {
                            *self.new_ary.lock().unwrap() = Some(Arc::new(bigger));
                            self.size_thid.store(0, Ordering::SeqCst);
                            Round::Doubled
                        }
                        Err(e) => Round::Failed(CounterError::Alloc(e.to_string())),
                    },
                    FullPolicy::Dump(dumper) => match dumper.dump(&old) {
                        Ok(()) => Round::Dumped,
                        Err(e) => Round::Failed(CounterError::Dump(e.to_string())),
                    },
                }
            };
            if matches!(*out, Round::Failed(_)) {
                self.failed.store(true, Ordering::SeqCst);
            }
        }
        self.barrier.wait();

        let decision = self.outcome.lock().unwrap().clone();
        match decision {
            Round::Terminate => Ok(true),
            Round::Dumped => Ok(false),
            Round::Failed(e) => Err(e),
            Round::Doubled => {
                let new = self
                    .new_ary
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("doubled array present");
                let tid = self.size_thid.fetch_add(1, Ordering::SeqCst) as u64;
                {
                    let old = self.ary.read().unwrap();
                    for e in old.iter_slice(tid, self.nb_threads as u64) {
                        // A table twice the size cannot fill up on the old
                        // table's entries.
                        let ok = new.add(e.key, e.val).is_some();
                        debug_assert!(ok);
                    }
                }
                if self.barrier.wait().is_leader() {
                    *self.ary.write().unwrap() = new;
                    *self.new_ary.lock().unwrap() = None;
                }
                self.barrier.wait();
                Ok(false)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_thread_grows_from_tiny_table() {
        let c = HashCounter::new(16, 16, 4, 1, 62).unwrap();
        for key in 0..4096u64 {
            c.add(key, 1).unwrap();
        }
        c.done().unwrap();
        let ary = c.ary();
        assert!(ary.size() >= 4096, "table did not grow: {}", ary.size());
        for key in 0..4096u64 {
            assert_eq!(ary.get_val(key), Some(1), "key {}", key);
        }
    }

    #[test]
    fn contended_single_key_loses_nothing() {
        let threads = 4usize;
        let per_thread = 100_000u64;
        let c = Arc::new(HashCounter::new(16, 16, 4, threads, 62).unwrap());

        thread::scope(|s| {
            for _ in 0..threads {
                let c = Arc::clone(&c);
                s.spawn(move || {
                    for _ in 0..per_thread {
                        c.add(0xBEE, 1).unwrap();
                    }
                    c.done().unwrap();
                });
            }
        });

        let ary = c.ary();
        assert_eq!(ary.get_val(0xBEE), Some(threads as u64 * per_thread));
        assert_eq!(ary.iter_all().count(), 1);
    }

    #[test]
    fn distinct_keys_survive_many_resizes() {
        let threads = 3usize;
        let keys_per_thread = 3000u64;
        let c = Arc::new(HashCounter::new(16, 20, 5, threads, 62).unwrap());

        thread::scope(|s| {
            for t in 0..threads as u64 {
                let c = Arc::clone(&c);
                s.spawn(move || {
                    for i in 0..keys_per_thread {
                        c.add(t * keys_per_thread + i, 1).unwrap();
                        // everyone also hammers one shared key
                        c.add(999_983, 1).unwrap();
                    }
                    c.done().unwrap();
                });
            }
        });

        let ary = c.ary();
        assert!(ary.size() > 16, "at least one resize expected");
        assert_eq!(
            ary.get_val(999_983),
            Some(threads as u64 * keys_per_thread)
        );
        for k in 0..threads as u64 * keys_per_thread {
            assert_eq!(ary.get_val(k), Some(1), "key {}", k);
        }
    }

    #[test]
    fn set_and_update_add_through_counter() {
        let c = HashCounter::new(64, 14, 4, 1, 62).unwrap();
        for key in 0..500u64 {
            c.set(key).unwrap();
        }
        for key in 0..1000u64 {
            c.update_add(key, 2).unwrap();
        }
        c.done().unwrap();
        let ary = c.ary();
        assert_eq!(ary.get_val(10), Some(2));
        assert_eq!(ary.get_val(999), None, "update_add must not create keys");
    }
}
