//! Sharded usage counters.
//!
//! Filesystem-wide (`FsUsage`) and per-device (`DevUsage`) totals are kept as
//! per-shard blocks of atomics; writers fold signed deltas into their own
//! shard under a read pin of the mark lock, readers sum every shard. A read
//! is a point-in-time sum, not linearizable against concurrent folds —
//! consumers tolerate slight skew between fields. Taking the mark lock in
//! write mode quiesces all folders and makes the sum exact.
//!
//! Each counter structure exists twice: the *live* world and the *gc* shadow
//! world that garbage collection rebuilds while writes continue.

use serde::{Deserialize, Serialize};
use sfs_types::{DataType, MAX_REPLICAS, NR_DATA_TYPES};
use std::sync::atomic::{AtomicU64, Ordering};

/// log2 of the reserve-factor granule: reserved sectors are charged an extra
/// 1/64 to cover metadata overhead.
pub const RESERVE_FACTOR_SHIFT: u32 = 6;

fn round_up(v: u64, to: u64) -> u64 {
    v.div_ceil(to) * to
}

/// The markup applied to reserved sectors: `r + round_up(r, 64) / 64`,
/// roughly `r * 65/64`.
#[must_use]
pub fn reserve_factor(r: u64) -> u64 {
    r + (round_up(r, 1 << RESERVE_FACTOR_SHIFT) >> RESERVE_FACTOR_SHIFT)
}

/// Inverse of [`reserve_factor`]: how many sectors may be admitted for
/// reservation given `r` free sectors. Integer rounding never oversubscribes:
/// `reserve_factor(avail_factor(r)) <= r`.
#[must_use]
pub fn avail_factor(r: u64) -> u64 {
    (r << RESERVE_FACTOR_SHIFT) / ((1 << RESERVE_FACTOR_SHIFT) + 1)
}

// ─── Delta structures ───────────────────────────────────────────────────────

/// Summarized filesystem counters. As a delta every field is signed; the
/// sharded totals are the accumulated sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsageSummarized {
    /// Superblock + journal footprint, invisible to users.
    pub hidden: i64,
    pub data: i64,
    pub cached: i64,
    pub reserved: i64,
    pub online_reserved: i64,
    pub nr_inodes: i64,
}

/// Per-replication-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicasUsage {
    pub data: [i64; NR_DATA_TYPES],
    pub ec_data: i64,
    pub persistent_reserved: i64,
}

/// A transient filesystem-usage delta, accumulated across one marking call or
/// one transaction and folded into a shard at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub s: FsUsageSummarized,
    /// Sector totals per bucket data type (bucket-granularity accounting).
    pub buckets: [i64; NR_DATA_TYPES],
    /// Indexed by replication level minus one.
    pub replicas: [ReplicasUsage; MAX_REPLICAS],
}

impl FsUsage {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A per-device usage delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevUsage {
    /// Bucket counts per data type.
    pub buckets: [i64; NR_DATA_TYPES],
    pub buckets_alloc: i64,
    pub buckets_ec: i64,
    pub buckets_unavailable: i64,
    /// Dirty-sector totals per data type; `sectors[Cached]` counts cached.
    pub sectors: [i64; NR_DATA_TYPES],
    /// Unused sectors inside partially-full user buckets; copygc feeds on
    /// this.
    pub sectors_fragmented: i64,
}

// ─── Read-side snapshots ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicasSnapshot {
    pub data: [u64; NR_DATA_TYPES],
    pub ec_data: u64,
    pub persistent_reserved: u64,
}

/// Point-in-time sum of the filesystem usage shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageSnapshot {
    pub hidden: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub online_reserved: u64,
    pub nr_inodes: u64,
    pub buckets: [u64; NR_DATA_TYPES],
    pub replicas: [ReplicasSnapshot; MAX_REPLICAS],
}

impl FsUsageSnapshot {
    /// Total sectors consumed, with the reserve markup applied.
    #[must_use]
    pub fn sectors_used(&self) -> u64 {
        self.hidden + self.data + reserve_factor(self.reserved + self.online_reserved)
    }
}

/// Point-in-time sum of a device's usage shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUsageSnapshot {
    pub buckets: [u64; NR_DATA_TYPES],
    pub buckets_alloc: u64,
    pub buckets_ec: u64,
    pub buckets_unavailable: u64,
    pub sectors: [u64; NR_DATA_TYPES],
    pub sectors_fragmented: u64,
}

/// The public `{capacity, used, nr_inodes}` view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageShort {
    pub capacity: u64,
    pub used: u64,
    pub nr_inodes: u64,
}

// ─── Shards ─────────────────────────────────────────────────────────────────

// Folds are wrapping adds of the delta's two's-complement bits: a field that
// goes transiently negative in one shard sums correctly across shards.
#[inline]
fn fold_field(field: &AtomicU64, delta: i64) {
    if delta != 0 {
        field.fetch_add(delta as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct ReplicasShard {
    data: [AtomicU64; NR_DATA_TYPES],
    ec_data: AtomicU64,
    persistent_reserved: AtomicU64,
}

#[derive(Debug, Default)]
struct FsUsageShard {
    hidden: AtomicU64,
    data: AtomicU64,
    cached: AtomicU64,
    reserved: AtomicU64,
    online_reserved: AtomicU64,
    nr_inodes: AtomicU64,
    buckets: [AtomicU64; NR_DATA_TYPES],
    replicas: [ReplicasShard; MAX_REPLICAS],
}

impl FsUsageShard {
    fn fold(&self, d: &FsUsage) {
        fold_field(&self.hidden, d.s.hidden);
        fold_field(&self.data, d.s.data);
        fold_field(&self.cached, d.s.cached);
        fold_field(&self.reserved, d.s.reserved);
        fold_field(&self.online_reserved, d.s.online_reserved);
        fold_field(&self.nr_inodes, d.s.nr_inodes);
        for t in 0..NR_DATA_TYPES {
            fold_field(&self.buckets[t], d.buckets[t]);
        }
        for r in 0..MAX_REPLICAS {
            for t in 0..NR_DATA_TYPES {
                fold_field(&self.replicas[r].data[t], d.replicas[r].data[t]);
            }
            fold_field(&self.replicas[r].ec_data, d.replicas[r].ec_data);
            fold_field(
                &self.replicas[r].persistent_reserved,
                d.replicas[r].persistent_reserved,
            );
        }
    }

    fn add_to(&self, acc: &mut FsUsageSnapshot) {
        acc.hidden = acc.hidden.wrapping_add(self.hidden.load(Ordering::Relaxed));
        acc.data = acc.data.wrapping_add(self.data.load(Ordering::Relaxed));
        acc.cached = acc.cached.wrapping_add(self.cached.load(Ordering::Relaxed));
        acc.reserved = acc
            .reserved
            .wrapping_add(self.reserved.load(Ordering::Relaxed));
        acc.online_reserved = acc
            .online_reserved
            .wrapping_add(self.online_reserved.load(Ordering::Relaxed));
        acc.nr_inodes = acc
            .nr_inodes
            .wrapping_add(self.nr_inodes.load(Ordering::Relaxed));
        for t in 0..NR_DATA_TYPES {
            acc.buckets[t] = acc.buckets[t].wrapping_add(self.buckets[t].load(Ordering::Relaxed));
        }
        for r in 0..MAX_REPLICAS {
            for t in 0..NR_DATA_TYPES {
                acc.replicas[r].data[t] = acc.replicas[r].data[t]
                    .wrapping_add(self.replicas[r].data[t].load(Ordering::Relaxed));
            }
            acc.replicas[r].ec_data = acc.replicas[r]
                .ec_data
                .wrapping_add(self.replicas[r].ec_data.load(Ordering::Relaxed));
            acc.replicas[r].persistent_reserved = acc.replicas[r]
                .persistent_reserved
                .wrapping_add(self.replicas[r].persistent_reserved.load(Ordering::Relaxed));
        }
    }

    fn zero(&self) {
        self.hidden.store(0, Ordering::Relaxed);
        self.data.store(0, Ordering::Relaxed);
        self.cached.store(0, Ordering::Relaxed);
        self.reserved.store(0, Ordering::Relaxed);
        self.online_reserved.store(0, Ordering::Relaxed);
        self.nr_inodes.store(0, Ordering::Relaxed);
        for t in 0..NR_DATA_TYPES {
            self.buckets[t].store(0, Ordering::Relaxed);
        }
        for r in 0..MAX_REPLICAS {
            for t in 0..NR_DATA_TYPES {
                self.replicas[r].data[t].store(0, Ordering::Relaxed);
            }
            self.replicas[r].ec_data.store(0, Ordering::Relaxed);
            self.replicas[r].persistent_reserved.store(0, Ordering::Relaxed);
        }
    }
}

/// The filesystem usage counters of one world (live or gc), sharded for
/// write-side scalability.
#[derive(Debug)]
pub struct ShardedFsUsage {
    shards: Vec<FsUsageShard>,
}

impl ShardedFsUsage {
    #[must_use]
    pub fn new(nr_shards: usize) -> Self {
        Self {
            shards: (0..nr_shards.max(1)).map(|_| FsUsageShard::default()).collect(),
        }
    }

    /// Fold a delta into shard `shard`. The caller holds the mark lock in
    /// read mode; write-mode acquisition is what makes [`read`](Self::read)
    /// exact.
    pub fn fold(&self, shard: usize, delta: &FsUsage) {
        self.shards[shard].fold(delta);
    }

    /// Sum all shards.
    #[must_use]
    pub fn read(&self) -> FsUsageSnapshot {
        let mut acc = FsUsageSnapshot::default();
        for s in &self.shards {
            s.add_to(&mut acc);
        }
        acc
    }

    /// Reset every shard to zero (GC start; callers hold the mark lock in
    /// write mode).
    pub fn zero(&self) {
        for s in &self.shards {
            s.zero();
        }
    }
}

#[derive(Debug, Default)]
struct DevUsageShard {
    buckets: [AtomicU64; NR_DATA_TYPES],
    buckets_alloc: AtomicU64,
    buckets_ec: AtomicU64,
    buckets_unavailable: AtomicU64,
    sectors: [AtomicU64; NR_DATA_TYPES],
    sectors_fragmented: AtomicU64,
}

/// A device's usage counters for one world, sharded like [`ShardedFsUsage`].
#[derive(Debug)]
pub struct ShardedDevUsage {
    shards: Vec<DevUsageShard>,
}

impl ShardedDevUsage {
    #[must_use]
    pub fn new(nr_shards: usize) -> Self {
        Self {
            shards: (0..nr_shards.max(1)).map(|_| DevUsageShard::default()).collect(),
        }
    }

    pub fn fold(&self, shard: usize, d: &DevUsage) {
        let s = &self.shards[shard];
        for t in 0..NR_DATA_TYPES {
            fold_field(&s.buckets[t], d.buckets[t]);
            fold_field(&s.sectors[t], d.sectors[t]);
        }
        fold_field(&s.buckets_alloc, d.buckets_alloc);
        fold_field(&s.buckets_ec, d.buckets_ec);
        fold_field(&s.buckets_unavailable, d.buckets_unavailable);
        fold_field(&s.sectors_fragmented, d.sectors_fragmented);
    }

    #[must_use]
    pub fn read(&self) -> DevUsageSnapshot {
        let mut acc = DevUsageSnapshot::default();
        for s in &self.shards {
            for t in 0..NR_DATA_TYPES {
                acc.buckets[t] = acc.buckets[t].wrapping_add(s.buckets[t].load(Ordering::Relaxed));
                acc.sectors[t] = acc.sectors[t].wrapping_add(s.sectors[t].load(Ordering::Relaxed));
            }
            acc.buckets_alloc = acc
                .buckets_alloc
                .wrapping_add(s.buckets_alloc.load(Ordering::Relaxed));
            acc.buckets_ec = acc
                .buckets_ec
                .wrapping_add(s.buckets_ec.load(Ordering::Relaxed));
            acc.buckets_unavailable = acc
                .buckets_unavailable
                .wrapping_add(s.buckets_unavailable.load(Ordering::Relaxed));
            acc.sectors_fragmented = acc
                .sectors_fragmented
                .wrapping_add(s.sectors_fragmented.load(Ordering::Relaxed));
        }
        acc
    }

    pub fn zero(&self) {
        for s in &self.shards {
            for t in 0..NR_DATA_TYPES {
                s.buckets[t].store(0, Ordering::Relaxed);
                s.sectors[t].store(0, Ordering::Relaxed);
            }
            s.buckets_alloc.store(0, Ordering::Relaxed);
            s.buckets_ec.store(0, Ordering::Relaxed);
            s.buckets_unavailable.store(0, Ordering::Relaxed);
            s.sectors_fragmented.store(0, Ordering::Relaxed);
        }
    }
}

/// Shard index for the calling thread.
///
/// The mark-lock read pin plus atomic folds make any stable mapping correct;
/// hashing the thread id spreads unrelated writers across shards.
#[must_use]
pub(crate) fn current_shard(nr_shards: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    (h.finish() % nr_shards as u64) as usize
}

/// Index helper: per-data-type arrays are indexed by the enum encoding.
#[inline]
pub(crate) fn dt(t: DataType) -> usize {
    t.as_index()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserve_factor_known_values() {
        assert_eq!(reserve_factor(0), 0);
        assert_eq!(reserve_factor(64), 65);
        assert_eq!(reserve_factor(100), 102);
        assert_eq!(reserve_factor(1), 2);
    }

    #[test]
    fn avail_factor_never_oversubscribes() {
        for r in (0..100_000).chain([u32::MAX as u64, 1 << 40]) {
            assert!(
                reserve_factor(avail_factor(r)) <= r,
                "oversubscription at r = {r}"
            );
        }
    }

    #[test]
    fn fold_and_read_roundtrip() {
        let sharded = ShardedFsUsage::new(4);
        let mut d = FsUsage::default();
        d.s.data = 100;
        d.s.cached = 50;
        d.buckets[dt(DataType::User)] = 512;
        d.replicas[0].data[dt(DataType::User)] = 100;
        sharded.fold(0, &d);
        sharded.fold(3, &d);

        let snap = sharded.read();
        assert_eq!(snap.data, 200);
        assert_eq!(snap.cached, 100);
        assert_eq!(snap.buckets[dt(DataType::User)], 1024);
        assert_eq!(snap.replicas[0].data[dt(DataType::User)], 200);
    }

    #[test]
    fn negative_deltas_cancel_across_shards() {
        let sharded = ShardedFsUsage::new(2);
        let mut add = FsUsage::default();
        add.s.data = 100;
        let mut sub = FsUsage::default();
        sub.s.data = -100;

        // Add in one shard, subtract in the other: the sum is exact.
        sharded.fold(0, &add);
        sharded.fold(1, &sub);
        assert_eq!(sharded.read().data, 0);
    }

    #[test]
    fn concurrent_folds_sum_exactly() {
        let sharded = Arc::new(ShardedFsUsage::new(8));
        let handles: Vec<_> = (0..8_usize)
            .map(|i| {
                let sharded = Arc::clone(&sharded);
                thread::spawn(move || {
                    let mut d = FsUsage::default();
                    d.s.data = 1;
                    for _ in 0..10_000 {
                        sharded.fold(i, &d);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sharded.read().data, 80_000);
    }

    #[test]
    fn dev_usage_fold_and_zero() {
        let sharded = ShardedDevUsage::new(2);
        let mut d = DevUsage::default();
        d.buckets[dt(DataType::Btree)] = 1;
        d.sectors[dt(DataType::Btree)] = 512;
        d.buckets_unavailable = 1;
        sharded.fold(1, &d);

        let snap = sharded.read();
        assert_eq!(snap.buckets[dt(DataType::Btree)], 1);
        assert_eq!(snap.sectors[dt(DataType::Btree)], 512);
        assert_eq!(snap.buckets_unavailable, 1);

        sharded.zero();
        assert_eq!(sharded.read(), DevUsageSnapshot::default());
    }

    #[test]
    fn sectors_used_applies_reserve_markup() {
        let snap = FsUsageSnapshot {
            hidden: 10,
            data: 100,
            reserved: 64,
            online_reserved: 0,
            ..Default::default()
        };
        assert_eq!(snap.sectors_used(), 10 + 100 + 65);
    }
}
