//! The atomic per-bucket state word.
//!
//! A bucket's entire state lives in one 64-bit [`BucketMark`]; this module
//! wraps it in an `AtomicU64` and provides the compare-and-swap combinator
//! every state transition goes through. Splitting the fields across separate
//! atomics would reintroduce tearing between the sector counts and the
//! generation, so the whole word always moves as a unit.

use sfs_types::BucketMark;
use std::sync::atomic::{AtomicU64, Ordering};

/// A bucket mark updated lock-free by many writers.
///
/// Writers race through [`update`](Self::update); the CAS serializes them, so
/// every bucket's sequence of transitions is total. The non-atomic variants
/// exist for single-threaded bring-up, before the filesystem handle is
/// published.
#[derive(Debug)]
pub struct AtomicBucketMark(AtomicU64);

impl AtomicBucketMark {
    #[must_use]
    pub fn new(mark: BucketMark) -> Self {
        Self(AtomicU64::new(mark.to_raw()))
    }

    #[must_use]
    pub fn load(&self) -> BucketMark {
        BucketMark::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Store without a CAS. Only valid while no concurrent access is
    /// possible (bring-up, or under the fs-wide mark lock in write mode).
    pub fn store(&self, mark: BucketMark) {
        self.0.store(mark.to_raw(), Ordering::Release);
    }

    /// Transactionally mutate the mark: load, apply `f` to a local copy,
    /// compare-and-swap, retry until the swap wins. Returns `(old, new)`.
    pub fn update(&self, mut f: impl FnMut(BucketMark) -> BucketMark) -> (BucketMark, BucketMark) {
        let mut v = self.0.load(Ordering::Acquire);
        loop {
            let old = BucketMark::from_raw(v);
            let new = f(old);
            match self
                .0
                .compare_exchange_weak(v, new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (old, new),
                Err(cur) => v = cur,
            }
        }
    }

    /// Like [`update`](Self::update), but `f` may abort the transition by
    /// returning `None` (e.g. on a stale-generation pointer). The abort
    /// decision is re-evaluated on every CAS retry, which is what makes the
    /// gen check race-free against concurrent invalidation.
    pub fn try_update(
        &self,
        mut f: impl FnMut(BucketMark) -> Option<BucketMark>,
    ) -> Option<(BucketMark, BucketMark)> {
        let mut v = self.0.load(Ordering::Acquire);
        loop {
            let old = BucketMark::from_raw(v);
            let new = f(old)?;
            match self
                .0
                .compare_exchange_weak(v, new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((old, new)),
                Err(cur) => v = cur,
            }
        }
    }

    /// Single-threaded fast path: plain load + store, no CAS.
    pub fn try_update_nonatomic(
        &self,
        mut f: impl FnMut(BucketMark) -> Option<BucketMark>,
    ) -> Option<(BucketMark, BucketMark)> {
        let old = BucketMark::from_raw(self.0.load(Ordering::Relaxed));
        let new = f(old)?;
        self.0.store(new.to_raw(), Ordering::Relaxed);
        Some((old, new))
    }
}

impl Default for AtomicBucketMark {
    fn default() -> Self {
        Self::new(BucketMark::EMPTY)
    }
}
