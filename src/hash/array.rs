//! The lock-free, bit-packed, open-addressed counting array.
//!
//! Keys are not stored. A key `m` is hashed through the invertible matrix
//! `M`; the low `lsize` bits of `M * m` select the base slot and only the
//! remaining *residual* bits are written into the slot, together with the
//! probe distance actually used (plus one, so a claimed key field is never
//! zero). Iteration runs the recovery backwards: position and residual
//! reassemble the hash, and `M⁻¹` restores the key.
//!
//! A counter that outgrows its value field spills into an *overflow chain*:
//! a slot with the large bit set, placed `REPROBES[0]` past the entry (its
//! own collisions resolved with the same reprobe offsets), holding the carry
//! in a wider value field that reuses the residual-key bits. Chains extend
//! the same way when they saturate in turn.
//!
//! All slot access is word-at-a-time through atomics: claims OR bits in via
//! compare-exchange, increments are read-modify-write loops that return the
//! carry out of the field. Inserts never block and never spin on a lock;
//! a `None` return means the table is full and the caller must resize or
//! dump (capacity is a signal here, not an error).

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::thread_rng;

use crate::hash::matrix::SquareMatrix;
use crate::hash::offsets::{bitsize, OffsetPair, Offsets, SlotOffsets};
use crate::hash::{clamp_reprobe_limit, slice, REPROBES};

// ─────────────────────────────────────────────────────────────────────────────
// Errors and result types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ArrayError {
    /// The backing word buffer could not be allocated.
    Allocation { bytes: usize },
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayError::Allocation { bytes } => {
                write!(f, "failed to allocate {} bytes of memory", bytes)
            }
        }
    }
}

impl std::error::Error for ArrayError {}

/// Result of a successful claim: whether the key was new to the table and
/// which slot it occupies.
#[derive(Debug, Clone, Copy)]
pub struct Claim {
    pub is_new: bool,
    pub id: u64,
}

/// What an absolute slot id holds.
#[derive(Debug, Clone, Copy)]
pub enum SlotState {
    Empty,
    /// An overflow-chain link; its counter bits belong to some entry earlier
    /// in the table.
    LargeChain,
    /// A normal entry. `key` is the reconstructed original key, `val` the
    /// full count including the overflow chain, `pos` the base position the
    /// key hashes to.
    Filled { key: u64, val: u64, pos: u64 },
}

/// One reconstructed entry produced by iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: u64,
    pub val: u64,
    pub id: u64,
    pub pos: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Array
// ─────────────────────────────────────────────────────────────────────────────

pub struct Array {
    lsize: usize,
    size: u64,
    size_mask: u64,
    reprobe_limit: usize,
    key_len: usize,
    key_mask: u64,
    key_off: usize,
    offsets: Offsets,
    data: Box<[AtomicU64]>,
    hash_matrix: SquareMatrix,
    hash_inverse_matrix: SquareMatrix,
}

#[inline]
fn ceil_log2(n: u64) -> usize {
    n.max(1).next_power_of_two().trailing_zeros() as usize
}

impl Array {
    /// Create an empty table with fresh random matrices. `size` is rounded
    /// up to a power of two; `key_len` is the key width in bits (`2k` for a
    /// `k`-mer), `val_len` the counter width, `reprobe_limit` the requested
    /// maximum probe distance (clamped to the table size).
    pub fn new(
        size: u64,
        key_len: usize,
        val_len: usize,
        reprobe_limit: usize,
    ) -> Result<Array, ArrayError> {
        let mut m = SquareMatrix::new(key_len);
        let inv = m.randomize_pseudo_inverse(&mut thread_rng());
        Array::with_matrices(size, key_len, val_len, reprobe_limit, m, inv)
    }

    /// Create an empty table around existing matrices (doubling and on-disk
    /// reload paths).
    pub fn with_matrices(
        size: u64,
        key_len: usize,
        val_len: usize,
        reprobe_limit: usize,
        hash_matrix: SquareMatrix,
        hash_inverse_matrix: SquareMatrix,
    ) -> Result<Array, ArrayError> {
        assert!(key_len >= 1 && key_len <= 64, "key length out of range");
        assert_eq!(hash_matrix.size(), key_len, "matrix size != key length");
        let lsize = ceil_log2(size);
        let size = 1u64 << lsize;
        let reprobe_limit = clamp_reprobe_limit(reprobe_limit, size);
        let key_off = key_len.saturating_sub(lsize);
        let key_mask = if key_off == 0 { 0 } else { (1u64 << key_off) - 1 };
        let offsets = Offsets::new(
            key_off + bitsize(reprobe_limit as u64 + 1),
            val_len,
            reprobe_limit + 1,
        );
        let blocks = (size as usize).div_ceil(offsets.block_len());
        let words = blocks * offsets.block_word_len();

        let mut v: Vec<AtomicU64> = Vec::new();
        v.try_reserve_exact(words)
            .map_err(|_| ArrayError::Allocation { bytes: words * 8 })?;
        v.resize_with(words, || AtomicU64::new(0));

        Ok(Array {
            lsize,
            size,
            size_mask: size - 1,
            reprobe_limit,
            key_len,
            key_mask,
            key_off,
            offsets,
            data: v.into_boxed_slice(),
            hash_matrix,
            hash_inverse_matrix,
        })
    }

    /// Rebuild a table from a raw block image (`write_blocks` output) and the
    /// parameters recorded next to it.
    pub fn from_words(
        words: Vec<u64>,
        size: u64,
        key_len: usize,
        val_len: usize,
        reprobe_limit: usize,
        hash_matrix: SquareMatrix,
        hash_inverse_matrix: SquareMatrix,
    ) -> Result<Array, ArrayError> {
        let mut ary = Array::with_matrices(
            size,
            key_len,
            val_len,
            reprobe_limit,
            hash_matrix,
            hash_inverse_matrix,
        )?;
        let mut data: Vec<AtomicU64> = words.into_iter().map(AtomicU64::new).collect();
        data.resize_with(ary.data.len(), || AtomicU64::new(0));
        data.truncate(ary.data.len());
        ary.data = data.into_boxed_slice();
        Ok(ary)
    }

    /// An empty table of twice the size, sharing this table's matrices so
    /// hash values (and therefore dump files) stay comparable.
    pub fn doubled(&self) -> Result<Array, ArrayError> {
        Array::with_matrices(
            self.size * 2,
            self.key_len,
            self.offsets.val_len(),
            self.reprobe_limit,
            self.hash_matrix.clone(),
            self.hash_inverse_matrix.clone(),
        )
    }

    // ── Geometry accessors ──────────────────────────────────────────────────

    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn lsize(&self) -> usize {
        self.lsize
    }
    pub fn key_len(&self) -> usize {
        self.key_len
    }
    pub fn val_len(&self) -> usize {
        self.offsets.val_len()
    }
    pub fn max_reprobe(&self) -> usize {
        self.reprobe_limit
    }
    pub fn max_reprobe_offset(&self) -> u64 {
        REPROBES[self.reprobe_limit]
    }
    pub fn block_len(&self) -> usize {
        self.offsets.block_len()
    }
    pub fn block_word_len(&self) -> usize {
        self.offsets.block_word_len()
    }
    pub fn nb_blocks(&self) -> usize {
        (self.size as usize).div_ceil(self.offsets.block_len())
    }
    pub fn floor_block(&self, entries: usize) -> (usize, usize) {
        self.offsets.floor_block(entries)
    }
    pub fn matrix(&self) -> &SquareMatrix {
        &self.hash_matrix
    }
    pub fn inverse_matrix(&self) -> &SquareMatrix {
        &self.hash_inverse_matrix
    }

    // ── Word-level atomics ──────────────────────────────────────────────────

    #[inline]
    fn load(&self, w: usize) -> u64 {
        self.data[w].load(Ordering::Acquire)
    }

    // Claim (part of) a key field by OR-ing `nkey` into word `w`. The claim
    // succeeds while the field is free under `free_mask`; otherwise the slot
    // belongs to whoever's bits match under `equal_mask` (or not ours).
    fn set_key(
        &self,
        w: usize,
        nkey: u64,
        free_mask: u64,
        equal_mask: u64,
        is_new: Option<&mut bool>,
    ) -> bool {
        let mut ow = self.load(w);
        while ow & free_mask == 0 {
            match self
                .data[w]
                .compare_exchange(ow, ow | nkey, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if let Some(n) = is_new {
                        *n = true;
                    }
                    return true;
                }
                Err(cur) => ow = cur,
            }
        }
        if let Some(n) = is_new {
            *n = false;
        }
        (ow & equal_mask) == nkey
    }

    // Add `val` into the field (shift, mask) of word `w`; returns the bits
    // that carried out of the field.
    fn add_val(&self, w: usize, val: u64, shift: u32, mask: u64) -> u64 {
        let mut ow = self.load(w);
        loop {
            let nval = ((ow & mask) >> shift).wrapping_add(val);
            let nw = (ow & !mask) | ((nval << shift) & mask);
            match self
                .data[w]
                .compare_exchange(ow, nw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return nval & !(mask >> shift),
                Err(cur) => ow = cur,
            }
        }
    }

    // ── Field reads ─────────────────────────────────────────────────────────

    // Read a key field at a resolved slot; picks the overflow layout when the
    // large bit is set. Returns (field value, large).
    fn read_key(&self, wb: usize, pair: &OffsetPair) -> (u64, bool) {
        let first = &pair.normal.key;
        let kw = wb + first.woff;
        let raw = self.load(kw);
        let large = raw & first.lb_mask != 0;
        let o = if large { &pair.large.key } else { &pair.normal.key };
        let key = if o.mask2 != 0 {
            ((raw & o.mask1 & !o.sb_mask1) >> o.boff)
                | ((self.load(kw + 1) & o.mask2 & !o.sb_mask2) << o.shift)
        } else {
            (raw & o.mask1) >> o.boff
        };
        (key, large)
    }

    fn read_val(&self, wb: usize, so: &SlotOffsets) -> u64 {
        let vo = &so.val;
        let vw = wb + vo.woff;
        let mut val = (self.load(vw) & vo.mask1) >> vo.boff;
        if vo.mask2 != 0 {
            val |= (self.load(vw + 1) & vo.mask2) << vo.shift;
        }
        val
    }

    // True when the slot's normal key field holds no claim at all.
    fn slot_is_empty(&self, wb: usize, pair: &OffsetPair) -> bool {
        let ko = &pair.normal.key;
        let raw = self.load(wb + ko.woff);
        if ko.mask2 != 0 {
            raw & ko.sb_mask1 == 0
        } else {
            raw & ko.mask1 == 0
        }
    }

    // ── Claim protocol ──────────────────────────────────────────────────────

    // Claim a slot for `key` (already reduced to residual bits for normal
    // entries, or a chain-hop index for large ones), starting at `*id` and
    // reprobing on collisions. On success `*id` is the claimed slot and the
    // returned offsets select the layout variant in effect.
    fn claim_key(
        &self,
        key: u64,
        large: bool,
        id: &mut u64,
    ) -> Option<(usize, &SlotOffsets, bool)> {
        let mut reprobe = 0usize;
        let mut cid = *id;
        let mut akey = if large {
            0
        } else {
            key | (1u64 << self.key_off)
        };
        let mut is_new = false;

        loop {
            let (wb, pair) = self.offsets.word_offset(cid);
            let o = &pair.normal;
            let ao = if large { &pair.large } else { &pair.normal };
            let kw = wb + ao.key.woff;

            let claimed = if ao.key.mask2 != 0 {
                // key split over two words: claim the first word, then the
                // spill. The first word must be free under the *normal*
                // variant's longer mask, whichever variant we are.
                let mut nkey = (akey << ao.key.boff) | ao.key.sb_mask1;
                if large {
                    nkey |= ao.key.lb_mask;
                }
                nkey &= ao.key.mask1;
                let mut ok = self.set_key(kw, nkey, o.key.mask1, ao.key.mask1, None);
                if ok {
                    let nkey2 = ((akey >> ao.key.shift) | ao.key.sb_mask2) & ao.key.mask2;
                    ok = self.set_key(kw + 1, nkey2, o.key.mask2, ao.key.mask2, Some(&mut is_new));
                }
                ok
            } else {
                let mut nkey = akey << ao.key.boff;
                if large {
                    nkey |= ao.key.lb_mask;
                }
                nkey &= ao.key.mask1;
                self.set_key(kw, nkey, o.key.mask1, ao.key.mask1, Some(&mut is_new))
            };

            if claimed {
                *id = cid;
                return Some((wb, ao, is_new));
            }
            reprobe += 1;
            if reprobe > self.reprobe_limit {
                return None;
            }
            cid = (*id).wrapping_add(REPROBES[reprobe]) & self.size_mask;
            akey = if large {
                reprobe as u64
            } else {
                key | (((reprobe as u64) + 1) << self.key_off)
            };
        }
    }

    // Undo `val` previously added at a slot by adding the field's modular
    // complement; carries propagate into the spill word like a forward add.
    fn undo_add(&self, wb: usize, ao: &SlotOffsets, val: u64, large: bool) {
        let width = if large {
            self.offsets.lval_len()
        } else {
            self.offsets.val_len()
        } as u32;
        let complement = (!0u64 >> (64 - width)).wrapping_sub(val).wrapping_add(1);
        let vw = wb + ao.val.woff;
        let mut cary = self.add_val(vw, complement, ao.val.boff, ao.val.mask1);
        cary >>= ao.val.shift;
        if cary != 0 && ao.val.mask2 != 0 {
            self.add_val(vw + 1, cary, 0, ao.val.mask2);
        }
    }

    // Claim + increment, recursing into the overflow chain on carry. Returns
    // None when the table is full; the partial increment is rolled back so a
    // failed add has no net effect.
    fn add_rec(&self, mut id: u64, key: u64, val: u64, large: bool) -> Option<Claim> {
        let (wb, ao, is_new) = self.claim_key(key, large, &mut id)?;

        let vw = wb + ao.val.woff;
        let mut cary = self.add_val(vw, val, ao.val.boff, ao.val.mask1);
        cary >>= ao.val.shift;
        if cary != 0 && ao.val.mask2 != 0 {
            cary = self.add_val(vw + 1, cary, 0, ao.val.mask2);
            cary >>= ao.val.cshift;
        }
        if cary != 0 {
            let oid = id.wrapping_add(REPROBES[0]) & self.size_mask;
            if self.add_rec(oid, key, cary, true).is_none() {
                self.undo_add(wb, ao, val, large);
                return None;
            }
        }
        Some(Claim { is_new, id })
    }

    // ── Public operations ───────────────────────────────────────────────────

    /// Atomically add `val` to the counter for `key`, claiming a slot if the
    /// key is new. `None` means the table is full (resize or dump, then
    /// retry); in that case the counter is unchanged.
    pub fn add(&self, key: u64, val: u64) -> Option<Claim> {
        let hash = self.hash_matrix.times(key);
        let id = hash & self.size_mask;
        let residual = (hash >> self.lsize) & self.key_mask;
        self.add_rec(id, residual, val, false)
    }

    /// Mark `key` present without touching its value field. `None` when the
    /// table is full.
    pub fn set(&self, key: u64) -> Option<Claim> {
        let hash = self.hash_matrix.times(key);
        let mut id = hash & self.size_mask;
        let residual = (hash >> self.lsize) & self.key_mask;
        let (_, _, is_new) = self.claim_key(residual, false, &mut id)?;
        Some(Claim { is_new, id })
    }

    /// Add `val` to `key` only if `key` is already present. `Some(true)` on
    /// success, `Some(false)` if the key is absent (no-op), `None` when an
    /// overflow slot could not be allocated (table full; increment undone).
    pub fn update_add(&self, key: u64, val: u64) -> Option<bool> {
        let hash = self.hash_matrix.times(key);
        let id = hash & self.size_mask;
        let residual = (hash >> self.lsize) & self.key_mask;
        let Some((cid, wb)) = self.find_slot(id, residual) else {
            return Some(false);
        };
        let (_, pair) = self.offsets.word_offset(cid);
        let ao = &pair.normal;

        let vw = wb + ao.val.woff;
        let mut cary = self.add_val(vw, val, ao.val.boff, ao.val.mask1);
        cary >>= ao.val.shift;
        if cary != 0 && ao.val.mask2 != 0 {
            cary = self.add_val(vw + 1, cary, 0, ao.val.mask2);
            cary >>= ao.val.cshift;
        }
        if cary != 0 {
            let oid = cid.wrapping_add(REPROBES[0]) & self.size_mask;
            if self.add_rec(oid, residual, cary, true).is_none() {
                self.undo_add(wb, ao, val, false);
                return None;
            }
        }
        Some(true)
    }

    // Probe for an existing normal entry for `key` (residual bits). Returns
    // the slot id and its block base word.
    fn find_slot(&self, id: u64, key: u64) -> Option<(u64, usize)> {
        let mut reprobe = 0usize;
        let mut cid = id;
        let mut akey = key | (1u64 << self.key_off);
        loop {
            let (wb, pair) = self.offsets.word_offset(cid);
            let (k, large) = self.read_key(wb, pair);
            if !large && k == akey {
                return Some((cid, wb));
            }
            reprobe += 1;
            if reprobe > self.reprobe_limit {
                return None;
            }
            cid = id.wrapping_add(REPROBES[reprobe]) & self.size_mask;
            akey = key | (((reprobe as u64) + 1) << self.key_off);
        }
    }

    /// Point lookup with full overflow-chain summation.
    pub fn get_val(&self, key: u64) -> Option<u64> {
        self.get_val_with(key, true, false).map(|(v, _)| v)
    }

    /// Point lookup. `full` follows the overflow chain; `carry_bit` treats
    /// the lowest value bit as the continue-chain flag of map-mode tables.
    /// Returns the value and the slot id.
    pub fn get_val_with(&self, key: u64, full: bool, carry_bit: bool) -> Option<(u64, u64)> {
        let hash = self.hash_matrix.times(key);
        let id = hash & self.size_mask;
        let residual = (hash >> self.lsize) & self.key_mask;
        let (cid, wb) = self.find_slot(id, residual)?;
        let (_, pair) = self.offsets.word_offset(cid);
        let mut val = self.read_val(wb, &pair.normal);
        let mut do_reprobe = true;
        if carry_bit {
            do_reprobe = val & 1 == 1;
            val >>= 1;
        }
        if full && do_reprobe {
            val = self.sum_overflow(cid, val, carry_bit);
        }
        Some((val, cid))
    }

    // Walk the overflow chain of the entry at `entry_id`, accumulating each
    // link's contribution scaled by the field widths below it.
    fn sum_overflow(&self, entry_id: u64, mut val: u64, carry_bit: bool) -> u64 {
        let mut overflows = 0u32;
        let mut reprobe = 0usize;
        let mut id = entry_id.wrapping_add(REPROBES[0]) & self.size_mask;
        let mut cid = id;

        while reprobe <= self.reprobe_limit {
            if reprobe > 0 {
                cid = id.wrapping_add(REPROBES[reprobe]) & self.size_mask;
            }
            let (wb, pair) = self.offsets.word_offset(cid);
            let (k, large) = self.read_key(wb, pair);
            if large {
                if k == reprobe as u64 {
                    let mut nval = self.read_val(wb, &pair.large);
                    let mut do_reprobe = true;
                    if carry_bit {
                        do_reprobe = nval & 1 == 1;
                        nval >>= 1;
                    }
                    let shift =
                        self.offsets.val_len() as u32 + self.offsets.lval_len() as u32 * overflows;
                    val = val.wrapping_add(nval.checked_shl(shift).unwrap_or(0));
                    if !do_reprobe {
                        return val;
                    }
                    overflows += 1;
                    reprobe = 0;
                    id = cid.wrapping_add(REPROBES[0]) & self.size_mask;
                    cid = id;
                    continue;
                }
            } else if self.slot_is_empty(wb, pair) {
                // chain cannot continue past a never-claimed slot
                return val;
            }
            reprobe += 1;
        }
        val
    }

    /// Inspect the slot at `id`: empty, an overflow link, or a normal entry
    /// with its reconstructed key and fully summed value.
    pub fn get_key_val_at_id(&self, id: u64) -> SlotState {
        let (wb, pair) = self.offsets.word_offset(id);
        let ko = &pair.normal.key;
        let raw = self.load(wb + ko.woff);
        if raw & ko.lb_mask != 0 {
            return SlotState::LargeChain;
        }
        let key = if ko.mask2 != 0 {
            if raw & ko.sb_mask1 == 0 {
                return SlotState::Empty;
            }
            ((raw & ko.mask1 & !ko.sb_mask1) >> ko.boff)
                | ((self.load(wb + ko.woff + 1) & ko.mask2 & !ko.sb_mask2) << ko.shift)
        } else {
            let k = (raw & ko.mask1) >> ko.boff;
            if k == 0 {
                return SlotState::Empty;
            }
            k
        };

        // Recover the base position from the recorded probe distance, then
        // the full hash, then the key through the inverse matrix.
        let rp = (key >> self.key_off) as usize;
        let off = if rp > 1 {
            REPROBES[(rp - 1).min(self.reprobe_limit)]
        } else {
            0
        };
        let pos = id.wrapping_sub(off) & self.size_mask;
        let hash = ((key & self.key_mask) << self.lsize) | pos;
        let full_key = self.hash_inverse_matrix.times(hash);

        let val = self.read_val(wb, &pair.normal);
        let val = self.sum_overflow(id, val, false);
        SlotState::Filled {
            key: full_key,
            val,
            pos,
        }
    }

    // ── Iteration ───────────────────────────────────────────────────────────

    /// Visit every filled normal slot in the table.
    pub fn iter_all(&self) -> SlotIter<'_> {
        self.iter_range(0, self.size, false)
    }

    /// Visit slice `i` of `n`: the table is partitioned into `n` contiguous
    /// position ranges with no overlap and no gap.
    pub fn iter_slice(&self, i: u64, n: u64) -> SlotIter<'_> {
        let (start, end) = slice(i, n, self.size);
        self.iter_range(start, end, false)
    }

    /// Visit entries whose *base position* lies in `[start, end)`, scanning
    /// up to `max_reprobe_offset` slots past `end` to catch entries that
    /// reprobed across the boundary. Used by the sorted dumper.
    pub fn iter_range(&self, start: u64, end: u64, overlap: bool) -> SlotIter<'_> {
        let start = start.min(self.size);
        let end = end.min(self.size);
        let span = if overlap {
            (end - start + self.max_reprobe_offset()).min(self.size)
        } else {
            end - start
        };
        SlotIter {
            ary: self,
            start,
            end,
            oid: 0,
            span,
            overlap,
        }
    }

    // ── Bulk block operations ───────────────────────────────────────────────

    /// Zero the whole table. Not safe concurrently with inserts.
    pub fn clear(&self) {
        for w in self.data.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Zero blocks `[start, start + len)`.
    pub fn zero_blocks(&self, start: usize, len: usize) {
        let bwl = self.offsets.block_word_len();
        let s = (start.saturating_mul(bwl)).min(self.data.len());
        let e = ((start + len).saturating_mul(bwl)).min(self.data.len());
        for w in &self.data[s..e] {
            w.store(0, Ordering::Release);
        }
    }

    /// Write blocks `[start, start + len)` verbatim, little-endian words.
    pub fn write_blocks<W: Write>(&self, out: &mut W, start: usize, len: usize) -> io::Result<()> {
        let bwl = self.offsets.block_word_len();
        let s = (start.saturating_mul(bwl)).min(self.data.len());
        let e = ((start + len).saturating_mul(bwl)).min(self.data.len());
        for w in &self.data[s..e] {
            out.write_all(&w.load(Ordering::Acquire).to_le_bytes())?;
        }
        Ok(())
    }

    /// Serialize both matrices (the on-disk files carry them after the
    /// binary header).
    pub fn write_matrices<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.hash_matrix.dump(out)?;
        self.hash_inverse_matrix.dump(out)
    }

    /// Total number of backing words.
    pub fn data_word_len(&self) -> usize {
        self.data.len()
    }

    /// Number of backing words a table with these parameters occupies,
    /// without allocating it.
    pub fn words_for(size: u64, key_len: usize, val_len: usize, reprobe_limit: usize) -> usize {
        let lsize = ceil_log2(size);
        let size = 1u64 << lsize;
        let reprobe_limit = clamp_reprobe_limit(reprobe_limit, size);
        let key_off = key_len.saturating_sub(lsize);
        let offsets = Offsets::new(
            key_off + bitsize(reprobe_limit as u64 + 1),
            val_len,
            reprobe_limit + 1,
        );
        (size as usize).div_ceil(offsets.block_len()) * offsets.block_word_len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SlotIter
// ─────────────────────────────────────────────────────────────────────────────

/// Iterator over the filled normal slots of a position range; see
/// [`Array::iter_range`].
pub struct SlotIter<'a> {
    ary: &'a Array,
    start: u64,
    end: u64,
    oid: u64,
    span: u64,
    overlap: bool,
}

impl Iterator for SlotIter<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while self.oid < self.span {
            let id = (self.start + self.oid) & self.ary.size_mask;
            self.oid += 1;
            if let SlotState::Filled { key, val, pos } = self.ary.get_key_val_at_id(id) {
                if self.overlap && !(pos >= self.start && pos < self.end) {
                    continue;
                }
                return Some(Entry { key, val, id, pos });
            }
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn ary(size: u64, key_len: usize, val_len: usize) -> Array {
        Array::new(size, key_len, val_len, 62).unwrap()
    }

    #[test]
    fn add_and_query_single_key() {
        let a = ary(64, 8, 4);
        for _ in 0..4 {
            assert!(a.add(0b00_01_10_11, 1).is_some());
        }
        assert_eq!(a.get_val(0b00_01_10_11), Some(4));
        assert_eq!(a.get_val(0b11_11_11_11), None);
    }

    #[test]
    fn add_reports_new_exactly_once() {
        let a = ary(64, 8, 4);
        assert!(a.add(42, 1).unwrap().is_new);
        assert!(!a.add(42, 1).unwrap().is_new);
        assert!(a.add(43, 1).unwrap().is_new);
    }

    #[test]
    fn counts_round_trip_random_multiset() {
        let a = ary(4096, 20, 5);
        let mut rng = StdRng::seed_from_u64(7);
        let mut expect: HashMap<u64, u64> = HashMap::new();
        for _ in 0..500 {
            let key = rng.gen::<u64>() & ((1 << 20) - 1);
            let times = rng.gen_range(1..60);
            for _ in 0..times {
                assert!(a.add(key, 1).is_some());
            }
            *expect.entry(key).or_default() += times;
        }
        for (k, c) in &expect {
            assert_eq!(a.get_val(*k), Some(*c), "key {:#x}", k);
        }
    }

    #[test]
    fn overflow_chain_extends_counter() {
        // 3-bit counters: max 7 in a slot, anything above chains.
        for n in [8u64, 10, 200, 5000] {
            let a = ary(64, 8, 3);
            for _ in 0..n {
                assert!(a.add(0b00_01_10_11, 1).is_some());
            }
            assert_eq!(a.get_val(0b00_01_10_11), Some(n), "count {}", n);
        }
    }

    #[test]
    fn overflow_bulk_increment_matches_unit_increments() {
        let a = ary(64, 8, 3);
        a.add(9, 1000).unwrap();
        assert_eq!(a.get_val(9), Some(1000));
    }

    #[test]
    fn iterator_visits_every_entry_once() {
        let a = ary(256, 16, 5);
        let mut expect: HashMap<u64, u64> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..150 {
            let key = rng.gen::<u64>() & 0xFFFF;
            a.add(key, 1).unwrap();
            *expect.entry(key).or_default() += 1;
        }
        let mut seen: HashMap<u64, u64> = HashMap::new();
        for e in a.iter_all() {
            assert!(seen.insert(e.key, e.val).is_none(), "duplicate {:#x}", e.key);
        }
        assert_eq!(seen, expect);
    }

    #[test]
    fn slices_partition_iteration() {
        let a = ary(512, 16, 5);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            a.add(rng.gen::<u64>() & 0xFFFF, 1).unwrap();
        }
        let all: HashMap<u64, u64> = a.iter_all().map(|e| (e.key, e.val)).collect();
        let mut merged: HashMap<u64, u64> = HashMap::new();
        for i in 0..5 {
            for e in a.iter_slice(i, 5) {
                assert!(merged.insert(e.key, e.val).is_none());
            }
        }
        assert_eq!(merged, all);
    }

    #[test]
    fn overlap_iteration_filters_by_base_position() {
        let a = ary(256, 16, 5);
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..120 {
            a.add(rng.gen::<u64>() & 0xFFFF, 1).unwrap();
        }
        let mut count = 0usize;
        for i in 0..4 {
            let (s, e) = slice(i, 4, a.size());
            for entry in a.iter_range(s, e, true) {
                assert!(entry.pos >= s && entry.pos < e);
                count += 1;
            }
        }
        assert_eq!(count, a.iter_all().count());
    }

    #[test]
    fn set_then_update_add() {
        let a = ary(128, 12, 4);
        let claim = a.set(100).unwrap();
        assert!(claim.is_new);
        assert!(!a.set(100).unwrap().is_new);

        assert_eq!(a.update_add(100, 3), Some(true));
        assert_eq!(a.update_add(100, 2), Some(true));
        assert_eq!(a.get_val(100), Some(5));
        // absent key is a no-op
        assert_eq!(a.update_add(101, 1), Some(false));
        assert_eq!(a.get_val(101), None);
    }

    #[test]
    fn full_table_returns_none_and_rolls_back() {
        // 8 slots, tiny reprobe window: fill it up and watch add refuse.
        let a = Array::new(8, 8, 4, 2).unwrap();
        let mut inserted = Vec::new();
        for key in 0..=255u64 {
            match a.add(key, 1) {
                Some(_) => inserted.push(key),
                None => break,
            }
        }
        assert!(!inserted.is_empty());
        // every successfully inserted key still reads back exactly 1
        for k in &inserted {
            assert_eq!(a.get_val(*k), Some(1));
        }
    }

    #[test]
    fn key_reconstruction_matches_matrix_inverse() {
        let a = ary(1024, 32, 6);
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..50 {
            let key = rng.gen::<u64>() & 0xFFFF_FFFF;
            let hash = a.matrix().times(key);
            assert_eq!(a.inverse_matrix().times(hash), key);
            a.add(key, 1).unwrap();
        }
        for e in a.iter_all() {
            // the recovered position really is the hash's low bits
            assert_eq!(a.matrix().times(e.key) & (a.size() - 1), e.pos);
        }
    }

    #[test]
    fn clear_empties_table() {
        let a = ary(64, 8, 4);
        a.add(1, 1).unwrap();
        a.add(2, 1).unwrap();
        a.clear();
        assert_eq!(a.iter_all().count(), 0);
        assert_eq!(a.get_val(1), None);
    }

    #[test]
    fn zero_blocks_clears_exact_range() {
        let a = ary(256, 16, 5);
        let mut rng = StdRng::seed_from_u64(23);
        for _ in 0..100 {
            a.add(rng.gen::<u64>() & 0xFFFF, 1).unwrap();
        }
        a.zero_blocks(0, a.nb_blocks());
        assert_eq!(a.iter_all().count(), 0);
    }

    #[test]
    fn concurrent_adds_lose_no_updates() {
        use std::sync::Arc;
        let a = Arc::new(ary(1024, 16, 7));
        let threads = 4;
        let per_thread = 20_000u64;
        std::thread::scope(|s| {
            for _ in 0..threads {
                let a = Arc::clone(&a);
                s.spawn(move || {
                    for i in 0..per_thread {
                        // one hot key plus a spread of cold ones
                        a.add(0xABC, 1).unwrap();
                        a.add(i % 64, 1).unwrap();
                    }
                });
            }
        });
        assert_eq!(a.get_val(0xABC), Some(threads * per_thread));
        let total: u64 = a.iter_all().map(|e| e.val).sum();
        assert_eq!(total, 2 * threads * per_thread);
    }

    #[test]
    fn doubled_table_preserves_matrices() {
        let a = ary(64, 16, 5);
        let b = a.doubled().unwrap();
        assert_eq!(b.size(), a.size() * 2);
        assert_eq!(b.matrix(), a.matrix());
        // entries re-inserted into the doubled table read back identically
        for k in [1u64, 77, 1234, 0xFFFF] {
            a.add(k, 3).unwrap();
            b.add(k, 3).unwrap();
            assert_eq!(b.get_val(k), a.get_val(k));
        }
    }
}
