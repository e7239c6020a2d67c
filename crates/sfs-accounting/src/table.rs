//! The per-device bucket table.
//!
//! A device owns one table per accounting world: the packed marks, parallel
//! per-bucket flag bitsets, and the oldest-gen array. The table is published
//! through an `ArcSwap`; readers take a guard and see a consistent snapshot,
//! a resize builds a fresh table under the exclusive locks, copies the
//! overlapping prefix and swaps the pointer. The old table is freed when the
//! last reader guard drops.
//!
//! Allocation failures are reported as `NoMemory` without touching the
//! published table.

use crate::mark::AtomicBucketMark;
use sfs_error::{Result, SfsError};
use sfs_types::{BucketIndex, BucketMark};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Minimum btree node count the btree free-list reserve must cover.
const BTREE_NODE_RESERVE: u64 = 8;

/// Free-list classes, most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserve {
    Btree = 0,
    Movinggc = 1,
    None = 2,
}

pub const RESERVE_NR: usize = 3;

// ─── Bitset ─────────────────────────────────────────────────────────────────

/// A fixed-size atomic bitset, one bit per bucket.
#[derive(Debug)]
pub struct Bitset {
    words: Vec<AtomicU64>,
    nbits: u64,
}

impl Bitset {
    fn alloc(nbits: u64) -> Result<Self> {
        let nwords = usize::try_from(nbits.div_ceil(64)).map_err(|_| SfsError::NoMemory)?;
        let mut words = Vec::new();
        words.try_reserve_exact(nwords).map_err(|_| SfsError::NoMemory)?;
        words.resize_with(nwords, AtomicU64::default);
        Ok(Self { words, nbits })
    }

    #[must_use]
    pub fn get(&self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        let word = self.words[(bit / 64) as usize].load(Ordering::Relaxed);
        word >> (bit % 64) & 1 != 0
    }

    pub fn set(&self, bit: u64) {
        debug_assert!(bit < self.nbits);
        self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
    }

    pub fn clear(&self, bit: u64) {
        debug_assert!(bit < self.nbits);
        self.words[(bit / 64) as usize].fetch_and(!(1 << (bit % 64)), Ordering::Relaxed);
    }

    fn copy_prefix_from(&self, other: &Bitset, nbits: u64) {
        for bit in 0..nbits.min(self.nbits).min(other.nbits) {
            if other.get(bit) {
                self.set(bit);
            }
        }
    }
}

// ─── Bucket table ───────────────────────────────────────────────────────────

/// The marks and per-bucket metadata of one device, one world.
///
/// Valid bucket indices are `first_bucket..nbuckets`; the leading buckets
/// hold the device's reserved headers and are never allocated.
#[derive(Debug)]
pub struct BucketTable {
    first_bucket: u64,
    nbuckets: u64,
    marks: Vec<AtomicBucketMark>,
    oldest_gen: Vec<AtomicU8>,
    /// Buckets withheld from allocation (bad blocks, superblock overlap).
    pub in_use: Bitset,
    /// Buckets written at least once since the device came up.
    pub has_been_written: Bitset,
}

impl BucketTable {
    /// Build a zeroed table. Fails with `NoMemory`, leaving nothing behind.
    pub fn alloc(first_bucket: u64, nbuckets: u64) -> Result<Self> {
        let n = usize::try_from(nbuckets).map_err(|_| SfsError::NoMemory)?;
        let mut marks = Vec::new();
        marks.try_reserve_exact(n).map_err(|_| SfsError::NoMemory)?;
        marks.resize_with(n, AtomicBucketMark::default);

        let mut oldest_gen = Vec::new();
        oldest_gen.try_reserve_exact(n).map_err(|_| SfsError::NoMemory)?;
        oldest_gen.resize_with(n, AtomicU8::default);

        Ok(Self {
            first_bucket,
            nbuckets,
            marks,
            oldest_gen,
            in_use: Bitset::alloc(nbuckets)?,
            has_been_written: Bitset::alloc(nbuckets)?,
        })
    }

    /// A zero-bucket placeholder (the gc world before GC has started).
    #[must_use]
    pub fn empty() -> Self {
        Self::alloc(0, 0).expect("zero-size table allocation cannot fail")
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.nbuckets
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    /// The mark word for bucket `b`, or `None` if out of range.
    #[must_use]
    pub fn mark(&self, b: BucketIndex) -> Option<&AtomicBucketMark> {
        if b.0 < self.first_bucket || b.0 >= self.nbuckets {
            return None;
        }
        Some(&self.marks[b.0 as usize])
    }

    #[must_use]
    pub fn oldest_gen(&self, b: BucketIndex) -> Option<u8> {
        if b.0 < self.first_bucket || b.0 >= self.nbuckets {
            return None;
        }
        Some(self.oldest_gen[b.0 as usize].load(Ordering::Relaxed))
    }

    pub fn set_oldest_gen(&self, b: BucketIndex, gen: u8) {
        if b.0 >= self.first_bucket && b.0 < self.nbuckets {
            self.oldest_gen[b.0 as usize].store(gen, Ordering::Relaxed);
        }
    }

    /// Iterate every valid bucket.
    pub fn iter(&self) -> impl Iterator<Item = (BucketIndex, &AtomicBucketMark)> + '_ {
        (self.first_bucket..self.nbuckets)
            .map(move |b| (BucketIndex(b), &self.marks[b as usize]))
    }

    /// Iterate buckets holding data: every bucket whose mark has a non-zero
    /// data type. Used at mount to rebuild device usage from the marks.
    pub fn iter_live(&self) -> impl Iterator<Item = (BucketIndex, BucketMark)> + '_ {
        self.iter().filter_map(|(b, m)| {
            let mark = m.load();
            (mark.data_type() != sfs_types::DataType::None).then_some((b, mark))
        })
    }

    /// Copy the overlapping prefix of `old` into this table, marks bit for
    /// bit. Callers hold the mark lock in write mode, so the plain stores
    /// cannot race with marking.
    pub fn copy_prefix_from(&self, old: &BucketTable) {
        let n = self.nbuckets.min(old.nbuckets);
        for b in 0..n as usize {
            self.marks[b].store(old.marks[b].load());
            self.oldest_gen[b].store(old.oldest_gen[b].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.in_use.copy_prefix_from(&old.in_use, n);
        self.has_been_written.copy_prefix_from(&old.has_been_written, n);
    }
}

// ─── Free lists ─────────────────────────────────────────────────────────────

/// The per-device free FIFOs, guarded by the device's freelist lock.
///
/// The core does not run the allocator; it owns these only so the table
/// resize can size and swap them atomically with the table.
#[derive(Debug)]
pub struct FreeLists {
    free: [VecDeque<u64>; RESERVE_NR],
    free_inc: VecDeque<u64>,
    caps: [usize; RESERVE_NR],
    free_inc_cap: usize,
}

impl FreeLists {
    /// Size the FIFOs for a device of `nbuckets` buckets.
    #[must_use]
    pub fn for_nbuckets(nbuckets: u64, bucket_size: u32, btree_node_size: u32) -> Self {
        let nodes_per_bucket = u64::from(bucket_size / btree_node_size.max(1)).max(1);
        let btree_reserve = BTREE_NODE_RESERVE.div_ceil(nodes_per_bucket);
        let copygc_reserve = (nbuckets >> 7).max(2);
        let reserve_none = (nbuckets >> 9).max(1);
        let free_inc = (nbuckets >> 12).max(1).max(btree_reserve);

        let caps = [
            btree_reserve as usize,
            copygc_reserve as usize,
            reserve_none as usize,
        ];
        Self {
            free: [
                VecDeque::with_capacity(caps[0]),
                VecDeque::with_capacity(caps[1]),
                VecDeque::with_capacity(caps[2]),
            ],
            free_inc: VecDeque::with_capacity(free_inc as usize),
            caps,
            free_inc_cap: free_inc as usize,
        }
    }

    #[must_use]
    pub fn push(&mut self, reserve: Reserve, bucket: u64) -> bool {
        let i = reserve as usize;
        if self.free[i].len() >= self.caps[i] {
            return false;
        }
        self.free[i].push_back(bucket);
        true
    }

    #[must_use]
    pub fn pop(&mut self, reserve: Reserve) -> Option<u64> {
        self.free[reserve as usize].pop_front()
    }

    #[must_use]
    pub fn push_inc(&mut self, bucket: u64) -> bool {
        if self.free_inc.len() >= self.free_inc_cap {
            return false;
        }
        self.free_inc.push_back(bucket);
        true
    }

    #[must_use]
    pub fn pop_inc(&mut self) -> Option<u64> {
        self.free_inc.pop_front()
    }

    #[must_use]
    pub fn len(&self, reserve: Reserve) -> usize {
        self.free[reserve as usize].len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.iter().all(VecDeque::is_empty) && self.free_inc.is_empty()
    }

    /// Carry the surviving entries of `old` into these (freshly sized)
    /// FIFOs. Buckets past `nbuckets` were retired by the resize and are
    /// dropped.
    pub fn take_from(&mut self, old: &mut FreeLists, nbuckets: u64) {
        for i in 0..RESERVE_NR {
            while let Some(b) = old.free[i].pop_front() {
                if b < nbuckets && self.free[i].len() < self.caps[i] {
                    self.free[i].push_back(b);
                }
            }
        }
        while let Some(b) = old.free_inc.pop_front() {
            if b < nbuckets && self.free_inc.len() < self.free_inc_cap {
                self.free_inc.push_back(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::DataType;

    #[test]
    fn alloc_respects_first_bucket() {
        let t = BucketTable::alloc(4, 100).unwrap();
        assert!(t.mark(BucketIndex(3)).is_none());
        assert!(t.mark(BucketIndex(4)).is_some());
        assert!(t.mark(BucketIndex(99)).is_some());
        assert!(t.mark(BucketIndex(100)).is_none());
        assert_eq!(t.iter().count(), 96);
    }

    #[test]
    fn iter_live_skips_empty_marks() {
        let t = BucketTable::alloc(0, 10).unwrap();
        t.mark(BucketIndex(3)).unwrap().update(|m| {
            m.with_data_type(DataType::User)
                .checked_add_dirty(16)
                .unwrap()
        });
        t.mark(BucketIndex(7)).unwrap().update(|m| {
            m.with_data_type(DataType::Btree)
                .checked_add_dirty(8)
                .unwrap()
        });

        let live: Vec<_> = t.iter_live().collect();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].0, BucketIndex(3));
        assert_eq!(live[1].1.data_type(), DataType::Btree);
    }

    #[test]
    fn prefix_copy_preserves_marks_bit_for_bit() {
        let old = BucketTable::alloc(1, 10).unwrap();
        for b in 1..10 {
            old.mark(BucketIndex(b)).unwrap().update(|m| {
                m.with_gen(b as u8)
                    .with_data_type(DataType::User)
                    .checked_add_dirty(i64::from(b as u32))
                    .unwrap()
            });
            old.set_oldest_gen(BucketIndex(b), b as u8);
            old.in_use.set(b);
        }

        let new = BucketTable::alloc(1, 6).unwrap();
        new.copy_prefix_from(&old);
        for b in 1..6 {
            assert_eq!(
                new.mark(BucketIndex(b)).unwrap().load().to_raw(),
                old.mark(BucketIndex(b)).unwrap().load().to_raw()
            );
            assert_eq!(new.oldest_gen(BucketIndex(b)), Some(b as u8));
            assert!(new.in_use.get(b));
        }
        assert!(new.mark(BucketIndex(6)).is_none());
    }

    #[test]
    fn bitset_boundaries() {
        let bs = Bitset::alloc(130).unwrap();
        bs.set(0);
        bs.set(63);
        bs.set(64);
        bs.set(129);
        assert!(bs.get(0) && bs.get(63) && bs.get(64) && bs.get(129));
        bs.clear(64);
        assert!(!bs.get(64));
        assert!(bs.get(63));
    }

    #[test]
    fn freelists_sized_and_bounded() {
        let mut fl = FreeLists::for_nbuckets(1 << 12, 512, 256);
        // reserve_none = 4096 >> 9 = 8.
        for b in 0..8 {
            assert!(fl.push(Reserve::None, b));
        }
        assert!(!fl.push(Reserve::None, 99));
        assert_eq!(fl.len(Reserve::None), 8);
        assert_eq!(fl.pop(Reserve::None), Some(0));
    }

    #[test]
    fn freelists_handoff_drops_retired_buckets() {
        let mut old = FreeLists::for_nbuckets(1 << 12, 512, 256);
        for b in [1, 500, 3000, 4000] {
            assert!(old.push(Reserve::None, b));
        }
        let mut new = FreeLists::for_nbuckets(2048, 512, 256);
        new.take_from(&mut old, 2048);
        assert!(old.is_empty());
        assert_eq!(new.len(Reserve::None), 2);
        assert_eq!(new.pop(Reserve::None), Some(1));
        assert_eq!(new.pop(Reserve::None), Some(500));
    }
}
