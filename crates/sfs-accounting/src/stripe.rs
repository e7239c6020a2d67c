//! Erasure-coded stripe records.
//!
//! The marking engine consumes stripe records by index: extent pointers that
//! participate in a stripe charge their share of the parity sectors, and the
//! stripe key itself sets the `stripe` bit on every member bucket. Like the
//! usage counters, the stripe map exists twice (live and gc).
//!
//! The map also maintains a heap of live stripes ordered by how many of
//! their blocks are non-empty; the erasure-coding layer reuses the emptiest
//! stripes first. GC-mode updates skip the heap, it is rebuilt from the gc
//! world when the sweep ends.

use parking_lot::{Mutex, RwLock};
use sfs_error::{Result, SfsError};
use sfs_types::{StripeKey, EC_STRIPE_MAX};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// An in-memory stripe record.
#[derive(Debug, Default)]
pub struct Stripe {
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    alive: AtomicBool,
    blocks_nonempty: AtomicI32,
    block_sectors: [AtomicI32; EC_STRIPE_MAX],
}

impl Stripe {
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn blocks_nonempty(&self) -> i32 {
        self.blocks_nonempty.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn block_sectors(&self, block: u8) -> i32 {
        self.block_sectors[block as usize].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn nr_data_blocks(&self) -> u8 {
        self.nr_blocks - self.nr_redundant
    }
}

// ─── Rate limiter ───────────────────────────────────────────────────────────

/// One log line per interval; everything else is counted and dropped.
/// Stripe lookups sit on the extent write path, an unthrottled error there
/// floods the log.
#[derive(Debug)]
pub(crate) struct LogRateLimiter {
    last_ms: AtomicU64,
    suppressed: AtomicU64,
    interval_ms: u64,
}

fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl LogRateLimiter {
    pub(crate) fn new(interval_ms: u64) -> Self {
        Self {
            last_ms: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            interval_ms,
        }
    }

    /// Returns `Some(suppressed_since_last)` when the caller may log.
    pub(crate) fn check(&self) -> Option<u64> {
        // last_ms == 0 means "never logged"; monotonic_ms() is clamped away
        // from 0 so a real timestamp never collides with the sentinel.
        let now = monotonic_ms().max(1);
        let last = self.last_ms.load(Ordering::Relaxed);
        if (last == 0 || now.saturating_sub(last) >= self.interval_ms)
            && self
                .last_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

// ─── Stripe map ─────────────────────────────────────────────────────────────

/// The sparse stripe map of one world, plus the emptiest-first heap.
#[derive(Debug)]
pub struct StripeMap {
    inner: RwLock<BTreeMap<u64, Arc<Stripe>>>,
    /// Live stripes keyed by `(blocks_nonempty, idx)`; the head is the
    /// emptiest stripe.
    heap: Mutex<BTreeSet<(i32, u64)>>,
    rate_limit: LogRateLimiter,
}

impl StripeMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            heap: Mutex::new(BTreeSet::new()),
            rate_limit: LogRateLimiter::new(1000),
        }
    }

    #[must_use]
    pub fn get(&self, idx: u64) -> Option<Arc<Stripe>> {
        self.inner.read().get(&idx).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Look up a stripe that must be alive, with the rate-limited error path.
    pub(crate) fn get_alive(&self, idx: u64) -> Result<Arc<Stripe>> {
        match self.get(idx) {
            Some(m) if m.alive() => Ok(m),
            _ => {
                if let Some(suppressed) = self.rate_limit.check() {
                    error!(
                        target: "sfs::accounting::stripe",
                        idx,
                        suppressed,
                        "pointer to nonexistent stripe"
                    );
                }
                Err(SfsError::MissingStripe { idx })
            }
        }
    }

    /// Create (or revive) the record for an inserted stripe key.
    pub(crate) fn insert(&self, key: &StripeKey, gc: bool) -> Result<Arc<Stripe>> {
        let mut map = self.inner.write();
        let m = map.entry(key.idx).or_default();
        if m.alive() {
            if let Some(suppressed) = self.rate_limit.check() {
                error!(
                    target: "sfs::accounting::stripe",
                    idx = key.idx,
                    suppressed,
                    "marking stripe: already exists"
                );
            }
            return Err(SfsError::StripeExists { idx: key.idx });
        }
        debug_assert_eq!(m.blocks_nonempty(), 0);
        debug_assert!((0..EC_STRIPE_MAX as u8).all(|b| m.block_sectors(b) == 0));

        let m = Arc::new(Stripe {
            sectors: key.sectors,
            algorithm: key.algorithm,
            nr_blocks: key.nr_blocks,
            nr_redundant: key.nr_redundant,
            alive: AtomicBool::new(true),
            ..Default::default()
        });
        map.insert(key.idx, Arc::clone(&m));
        drop(map);

        if !gc {
            self.heap.lock().insert((0, key.idx));
        }
        Ok(m)
    }

    /// Retire the record for a removed stripe key.
    pub(crate) fn remove(&self, idx: u64, gc: bool) -> Result<Arc<Stripe>> {
        let m = self.get_alive(idx)?;
        debug_assert_eq!(m.blocks_nonempty(), 0);
        m.alive.store(false, Ordering::Release);
        if !gc {
            self.heap.lock().remove(&(m.blocks_nonempty(), idx));
        }
        Ok(m)
    }

    /// Apply a sector delta to one block of a stripe, maintaining
    /// `blocks_nonempty` and (outside GC) the heap position.
    pub(crate) fn add_block_sectors(&self, idx: u64, m: &Stripe, block: u8, sectors: i64) {
        let sectors = i32::try_from(sectors).unwrap_or_else(|_| {
            panic!("stripe block sector delta {sectors} out of range");
        });
        let new = m.block_sectors[block as usize].fetch_add(sectors, Ordering::AcqRel) + sectors;
        let old = new - sectors;

        let nonempty_delta = i32::from(new != 0) - i32::from(old != 0);
        if nonempty_delta == 0 {
            return;
        }

        let mut heap = self.heap.lock();
        let before = m.blocks_nonempty.fetch_add(nonempty_delta, Ordering::AcqRel);
        let after = before + nonempty_delta;
        debug_assert!(after >= 0, "stripe blocks_nonempty underflow");
        if m.alive() {
            heap.remove(&(before, idx));
            heap.insert((after, idx));
        }
    }

    /// GC-mode block-sector update: no heap maintenance.
    pub(crate) fn add_block_sectors_gc(&self, m: &Stripe, block: u8, sectors: i64) {
        let sectors = i32::try_from(sectors).unwrap_or_else(|_| {
            panic!("stripe block sector delta {sectors} out of range");
        });
        let new = m.block_sectors[block as usize].fetch_add(sectors, Ordering::AcqRel) + sectors;
        let old = new - sectors;
        let nonempty_delta = i32::from(new != 0) - i32::from(old != 0);
        if nonempty_delta != 0 {
            let before = m.blocks_nonempty.fetch_add(nonempty_delta, Ordering::AcqRel);
            debug_assert!(before + nonempty_delta >= 0, "stripe blocks_nonempty underflow");
        }
    }

    /// The emptiest live stripe, if any.
    #[must_use]
    pub fn heap_first(&self) -> Option<(u64, i32)> {
        self.heap.lock().iter().next().map(|&(n, idx)| (idx, n))
    }

    /// Drop everything (GC start resets the gc world).
    pub(crate) fn clear(&self) {
        self.inner.write().clear();
        self.heap.lock().clear();
    }
}

impl Default for StripeMap {
    fn default() -> Self {
        Self::new()
    }
}
