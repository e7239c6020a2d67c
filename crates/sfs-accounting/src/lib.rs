#![forbid(unsafe_code)]
//! Bucket accounting and disk-space reservation core for StrataFS.
//!
//! Every block device is partitioned into fixed-size *buckets*, the unit of
//! allocation and garbage collection. Each bucket's state lives in one packed
//! 64-bit mark updated lock-free; above the marks sit per-shard usage
//! counters (live and a GC shadow world), the key marking engine that
//! translates key insertions and removals into mark transitions and counter
//! deltas, and the disk reservation layer that admits writers only when
//! sectors are provably available.
//!
//! Bucket states, derived from the mark:
//!
//! - *free*: mark is all-zero. The bucket holds nothing and will not be read.
//! - *allocator-owned*: on a free list or an open bucket being filled.
//! - *cached*: only discardable copies; safe to invalidate.
//! - *dirty*: holds data we must not discard.
//! - *metadata*: superblock, journal or btree node.
//!
//! Lifecycle: invalidated → freelist → open bucket → [dirty →] cached →
//! invalidated → … A cached bucket can also spontaneously become dirty when
//! a device removal leaves formerly replicated data under-replicated; only a
//! traversal of the keyspace can determine whether a bucket is truly dirty
//! or cached, so the marking engine treats that transition as observational.
//!
//! # Locking
//!
//! - Bucket marks: lock-free CAS, no lock.
//! - `mark_lock`: fs-wide reader/writer lock. Every marking call and usage
//!   read holds it in read mode (a [`MarkPin`]); pool recalculation, table
//!   swaps and GC world resets take it in write mode, which is what makes a
//!   cross-shard counter sum exact.
//! - `gc_lock`: serializes GC sweeps against table resizes and pool
//!   recalculation.
//! - Per-device `bucket_lock`: read for iteration, write for resize.
//! - Per-device freelist lock: brief, covers the free FIFOs.

pub mod gc;
pub mod mark;
pub mod reservation;
pub mod stripe;
pub mod table;
pub mod usage;

mod engine;
mod seq_cleanup;

pub use engine::{BtreeNodeView, MarkFlags};
pub use reservation::{DiskReservation, ReservationFlags, SECTORS_CACHE};

use arc_swap::ArcSwap;
use gc::GcCursor;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use reservation::ReservationPool;
use sfs_error::Result;
use sfs_types::{BucketIndex, BucketMark, DataType, DeviceIdx};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use stripe::StripeMap;
use table::{BucketTable, FreeLists};
use tracing::{debug, error, info};
use usage::{DevUsageSnapshot, FsUsageShort, FsUsageSnapshot, ShardedDevUsage, ShardedFsUsage};

pub(crate) const GC: usize = 1;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Accounting-core configuration.
#[derive(Debug, Clone)]
pub struct AccountingConfig {
    /// Number of counter shards (0 = auto-detect from available
    /// parallelism, clamped to 16).
    pub shards: usize,
    /// Btree node size in sectors; btree pointer keys are marked with this
    /// many sectors per pointer.
    pub btree_node_size: u32,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            btree_node_size: 512,
        }
    }
}

impl AccountingConfig {
    #[must_use]
    pub fn resolved_shards(&self) -> usize {
        if self.shards == 0 {
            std::thread::available_parallelism().map_or(4, |n| n.get().min(16))
        } else {
            self.shards
        }
    }
}

/// Geometry of one member device.
#[derive(Debug, Clone, Copy)]
pub struct DevConfig {
    /// Buckets below this index hold the device headers and are never
    /// allocated.
    pub first_bucket: u64,
    pub nbuckets: u64,
    /// Bucket size in sectors.
    pub bucket_size: u32,
}

// ─── Allocator waker ────────────────────────────────────────────────────────

/// Parking spot for the device's allocator thread.
///
/// The marking engine wakes it whenever a bucket transitions from
/// unavailable to available; the allocator parks here when its free lists
/// run dry.
#[derive(Debug, Default)]
pub struct AllocatorWaker {
    wakeups: Mutex<u64>,
    cv: Condvar,
}

impl AllocatorWaker {
    pub fn wake(&self) {
        let mut n = self.wakeups.lock();
        *n += 1;
        self.cv.notify_all();
    }

    /// Total wakeups so far.
    #[must_use]
    pub fn wakeups(&self) -> u64 {
        *self.wakeups.lock()
    }

    /// Park until the wakeup count moves past `seen`.
    pub fn wait_past(&self, seen: u64) {
        let mut n = self.wakeups.lock();
        while *n <= seen {
            self.cv.wait(&mut n);
        }
    }
}

// ─── Device handle ──────────────────────────────────────────────────────────

/// A copygc heap entry: a fragmented user bucket worth compacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopygcHeapEntry {
    pub bucket: BucketIndex,
    pub sectors_fragmented: u64,
}

/// A member device's accounting state.
///
/// The device exclusively owns its bucket tables (live and gc world), its
/// usage shards, its free FIFOs and its copygc heap. Bucket marks inside the
/// tables are shared and updated lock-free.
pub struct Dev {
    idx: DeviceIdx,
    bucket_size: u32,
    first_bucket: u64,
    buckets: [ArcSwap<BucketTable>; 2],
    bucket_lock: RwLock<()>,
    usage: [ShardedDevUsage; 2],
    freelists: Mutex<FreeLists>,
    copygc_heap: Mutex<Vec<CopygcHeapEntry>>,
    copygc_running: AtomicBool,
    waker: AllocatorWaker,
}

impl std::fmt::Debug for Dev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dev")
            .field("idx", &self.idx)
            .field("bucket_size", &self.bucket_size)
            .field("nbuckets", &self.nbuckets())
            .finish_non_exhaustive()
    }
}

impl Dev {
    fn new(idx: DeviceIdx, cfg: &DevConfig, nr_shards: usize, btree_node_size: u32) -> Self {
        Self {
            idx,
            bucket_size: cfg.bucket_size,
            first_bucket: cfg.first_bucket,
            buckets: [
                ArcSwap::from_pointee(BucketTable::empty()),
                ArcSwap::from_pointee(BucketTable::empty()),
            ],
            bucket_lock: RwLock::new(()),
            usage: [
                ShardedDevUsage::new(nr_shards),
                ShardedDevUsage::new(nr_shards),
            ],
            freelists: Mutex::new(FreeLists::for_nbuckets(0, cfg.bucket_size, btree_node_size)),
            copygc_heap: Mutex::new(Vec::new()),
            copygc_running: AtomicBool::new(false),
            waker: AllocatorWaker::default(),
        }
    }

    #[must_use]
    pub fn idx(&self) -> DeviceIdx {
        self.idx
    }

    #[must_use]
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    /// The current bucket table of one world. The guard keeps the table
    /// alive; a concurrent resize publishes a new table without disturbing
    /// existing guards.
    #[must_use]
    pub fn bucket_table(&self, gc: bool) -> arc_swap::Guard<Arc<BucketTable>> {
        self.buckets[usize::from(gc)].load()
    }

    pub(crate) fn publish_table(&self, gc: bool, table: Arc<BucketTable>) {
        self.buckets[usize::from(gc)].store(table);
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.bucket_table(false).nbuckets()
    }

    /// Usable capacity in sectors.
    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.nbuckets().saturating_sub(self.first_bucket) * u64::from(self.bucket_size)
    }

    #[must_use]
    pub fn bucket_of_sector(&self, sector: u64) -> BucketIndex {
        BucketIndex(sector / u64::from(self.bucket_size))
    }

    pub(crate) fn usage(&self, gc: bool) -> &ShardedDevUsage {
        &self.usage[usize::from(gc)]
    }

    /// Point-in-time device usage.
    #[must_use]
    pub fn usage_read(&self, gc: bool) -> DevUsageSnapshot {
        self.usage[usize::from(gc)].read()
    }

    #[must_use]
    pub fn allocator_waker(&self) -> &AllocatorWaker {
        &self.waker
    }

    pub(crate) fn wake_allocator(&self) {
        self.waker.wake();
    }

    /// The free FIFOs, under the freelist lock.
    pub fn with_freelists<R>(&self, f: impl FnOnce(&mut FreeLists) -> R) -> R {
        f(&mut self.freelists.lock())
    }

    /// The copygc heap, under its lock. A table resize stops copygc and
    /// restarts the heap empty against the new table.
    pub fn with_copygc_heap<R>(&self, f: impl FnOnce(&mut Vec<CopygcHeapEntry>) -> R) -> R {
        f(&mut self.copygc_heap.lock())
    }

    #[must_use]
    pub fn copygc_running(&self) -> bool {
        self.copygc_running.load(Ordering::Acquire)
    }

    pub fn set_copygc_running(&self, running: bool) {
        self.copygc_running.store(running, Ordering::Release);
    }

    /// Shared read access for bucket iteration (seq cleanup, usage rebuild).
    pub(crate) fn bucket_read(&self) -> RwLockReadGuard<'_, ()> {
        self.bucket_lock.read()
    }

    /// Metadata marking during device bring-up, before the filesystem handle
    /// exists. Single-threaded by construction, so the mark takes the
    /// non-atomic path, and no usage counters are touched — mount rebuilds
    /// them from the marks.
    pub fn mark_metadata_startup(&self, b: BucketIndex, data_type: DataType, sectors: u32) {
        debug_assert!(data_type.is_metadata() && data_type != DataType::Btree);
        let table = self.bucket_table(false);
        if let Some(mark) = table.mark(b) {
            mark.try_update_nonatomic(|m| {
                let new = m
                    .with_data_type(data_type)
                    .checked_add_dirty(i64::from(sectors))
                    .unwrap_or_else(|| {
                        panic!("bucket {} sector count overflow marking {}", b.0, data_type.name())
                    });
                Some(new)
            });
        }
    }
}

// ─── Mark pin ───────────────────────────────────────────────────────────────

/// A read pin of the fs-wide mark lock.
///
/// Holding a pin licenses folding into the usage shards and marking buckets;
/// the pin also fixes the caller's shard index for its lifetime, the Rust
/// analog of disabling preemption over a per-CPU pointer.
pub struct MarkPin<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    shard: usize,
}

impl MarkPin<'_> {
    #[must_use]
    pub(crate) fn shard(&self) -> usize {
        self.shard
    }
}

// ─── Filesystem handle ──────────────────────────────────────────────────────

/// The filesystem-wide accounting state.
///
/// Owns the fs-usage shards (live and gc), the stripe maps, the global
/// reservation pool, the mark lock and the GC cursor. Devices are registered
/// here so pointer marking can resolve `(device, bucket)`.
pub struct Fs {
    cfg: AccountingConfig,
    nr_shards: usize,
    mark_lock: RwLock<()>,
    gc_lock: RwLock<()>,
    devs: RwLock<Vec<Option<Arc<Dev>>>>,
    capacity: AtomicU64,
    usage: [ShardedFsUsage; 2],
    pub(crate) pool: ReservationPool,
    stripes: [StripeMap; 2],
    pub(crate) gc: GcCursor,
    alloc_read_done: AtomicBool,
    pub(crate) last_bucket_seq_cleanup: AtomicU64,
    inconsistencies: AtomicU64,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("capacity", &self.capacity())
            .field("nr_shards", &self.nr_shards)
            .finish_non_exhaustive()
    }
}

impl Fs {
    #[must_use]
    pub fn new(cfg: AccountingConfig) -> Self {
        let nr_shards = cfg.resolved_shards();
        info!(
            target: "sfs::accounting",
            nr_shards,
            btree_node_size = cfg.btree_node_size,
            "accounting core initializing"
        );
        Self {
            cfg,
            nr_shards,
            mark_lock: RwLock::new(()),
            gc_lock: RwLock::new(()),
            devs: RwLock::new(Vec::new()),
            capacity: AtomicU64::new(0),
            usage: [
                ShardedFsUsage::new(nr_shards),
                ShardedFsUsage::new(nr_shards),
            ],
            pool: ReservationPool::new(nr_shards),
            stripes: [StripeMap::new(), StripeMap::new()],
            gc: GcCursor::new(),
            alloc_read_done: AtomicBool::new(false),
            last_bucket_seq_cleanup: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    pub(crate) fn config(&self) -> &AccountingConfig {
        &self.cfg
    }

    /// Take the mark lock in read mode, pinning the caller to a shard.
    #[must_use]
    pub fn mark_pin(&self) -> MarkPin<'_> {
        MarkPin {
            _guard: self.mark_lock.read(),
            shard: usage::current_shard(self.nr_shards),
        }
    }

    pub(crate) fn mark_lock_write(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.mark_lock.write()
    }

    pub(crate) fn gc_lock(&self) -> &RwLock<()> {
        &self.gc_lock
    }

    pub(crate) fn nr_shards(&self) -> usize {
        self.nr_shards
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn usage_read(&self, gc: bool) -> FsUsageSnapshot {
        self.usage[usize::from(gc)].read()
    }

    pub(crate) fn usage_counters(&self, gc: bool) -> &ShardedFsUsage {
        &self.usage[usize::from(gc)]
    }

    /// The public `{capacity, used, nr_inodes}` view.
    #[must_use]
    pub fn usage_read_short(&self) -> FsUsageShort {
        let u = self.usage_read(false);
        let capacity = self.capacity().saturating_sub(u.hidden);
        let used = (u.data + usage::reserve_factor(u.reserved + u.online_reserved)).min(capacity);
        FsUsageShort {
            capacity,
            used,
            nr_inodes: u.nr_inodes,
        }
    }

    #[must_use]
    pub fn stripes(&self, gc: bool) -> &StripeMap {
        &self.stripes[usize::from(gc)]
    }

    /// Has the cursor of a running GC swept past `pos`? Callers hold a
    /// [`MarkPin`].
    #[must_use]
    pub fn gc_visited(&self, pos: sfs_types::GcPos) -> bool {
        self.gc.visited(pos)
    }

    /// The alloc btree has been fully read at mount; stale-gen pointers are
    /// expected (and skipped) from here on. Before this point they are
    /// accounting corruption.
    pub fn alloc_read_complete(&self) {
        self.alloc_read_done.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn alloc_read_done(&self) -> bool {
        self.alloc_read_done.load(Ordering::Acquire)
    }

    /// Inconsistencies surfaced so far (release builds keep running; debug
    /// builds have already panicked).
    #[must_use]
    pub fn inconsistency_count(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }

    pub(crate) fn inconsistent(&self, msg: &str) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
        error!(target: "sfs::accounting", msg, "filesystem inconsistency");
        debug_assert!(false, "filesystem inconsistency: {msg}");
    }

    pub(crate) fn dev(&self, idx: DeviceIdx) -> Option<Arc<Dev>> {
        self.devs
            .read()
            .get(idx.0 as usize)
            .and_then(Option::clone)
    }

    /// All registered devices.
    #[must_use]
    pub fn devs(&self) -> Vec<Arc<Dev>> {
        self.devs.read().iter().filter_map(Option::clone).collect()
    }

    fn recompute_capacity(&self) {
        let total: u64 = self.devs().iter().map(|d| d.capacity_sectors()).sum();
        self.capacity.store(total, Ordering::Release);
    }

    // ── Device lifecycle ──

    /// Bring up a device: allocate its bucket table and usage shards,
    /// register it, and refresh capacity and the reservation pool.
    pub fn dev_buckets_alloc(&self, cfg: DevConfig) -> Result<Arc<Dev>> {
        let dev = {
            let mut devs = self.devs.write();
            let slot = devs.iter().position(Option::is_none).unwrap_or_else(|| {
                devs.push(None);
                devs.len() - 1
            });
            let dev = Arc::new(Dev::new(
                DeviceIdx(slot as u32),
                &cfg,
                self.nr_shards,
                self.cfg.btree_node_size,
            ));
            devs[slot] = Some(Arc::clone(&dev));
            dev
        };

        if let Err(e) = self.dev_buckets_resize(&dev, cfg.nbuckets) {
            self.devs.write()[dev.idx.0 as usize] = None;
            return Err(e);
        }

        {
            let _write = self.mark_lock_write();
            self.recalc_sectors_available_locked_store();
        }
        info!(
            target: "sfs::accounting",
            dev = dev.idx.0,
            nbuckets = cfg.nbuckets,
            bucket_size = cfg.bucket_size,
            "device registered"
        );
        Ok(dev)
    }

    /// Resize a device's bucket table online.
    ///
    /// Allocates the new table and FIFOs first (failure leaves the device
    /// untouched), then swaps under the gc lock, the device's bucket lock
    /// and the mark lock in write mode. Readers holding a table guard keep
    /// the old table alive until they drop it. Copygc is stopped across the
    /// swap.
    pub fn dev_buckets_resize(&self, dev: &Arc<Dev>, nbuckets: u64) -> Result<()> {
        let resize = dev.bucket_table(false).nbuckets() > 0;
        let new_table = BucketTable::alloc(dev.first_bucket, nbuckets)?;
        let mut new_free =
            FreeLists::for_nbuckets(nbuckets, dev.bucket_size, self.cfg.btree_node_size);

        let copygc_was_running = dev.copygc_running.swap(false, Ordering::AcqRel);

        {
            let _gcw = resize.then(|| self.gc_lock.write());
            let _bl = resize.then(|| dev.bucket_lock.write());
            {
                let _ml = resize.then(|| self.mark_lock.write());
                if resize {
                    new_table.copy_prefix_from(&dev.bucket_table(false));
                }
                dev.publish_table(false, Arc::new(new_table));
            }

            {
                let mut fl = dev.freelists.lock();
                new_free.take_from(&mut fl, nbuckets);
                *fl = new_free;
            }

            // Copygc is stopped, its heap restarts empty against the new
            // table.
            dev.copygc_heap.lock().clear();
        }

        if copygc_was_running {
            dev.copygc_running.store(true, Ordering::Release);
        }
        self.recompute_capacity();
        debug!(
            target: "sfs::accounting",
            dev = dev.idx.0,
            nbuckets,
            resize,
            "bucket table published"
        );
        Ok(())
    }

    /// Drop a device from the registry. The caller has already migrated its
    /// data; outstanding table guards keep the final table alive until they
    /// drop.
    pub fn dev_buckets_free(&self, dev: &Arc<Dev>) {
        self.devs.write()[dev.idx.0 as usize] = None;
        self.recompute_capacity();
    }

    // ── GC world lifecycle ──

    /// Begin a GC sweep: reset the gc usage shards, materialize gc bucket
    /// tables (marks zeroed, generations carried over from the live world)
    /// and clear the gc stripe map, then start the cursor.
    pub fn gc_start(&self) -> Result<()> {
        let _gcw = self.gc_lock.write();
        let _ml = self.mark_lock_write();
        debug_assert!(!self.gc.is_running());

        self.usage[GC].zero();
        self.stripes[GC].clear();
        for dev in self.devs() {
            let live = dev.bucket_table(false);
            let gc_table = BucketTable::alloc(live.first_bucket(), live.nbuckets())?;
            for (b, m) in live.iter() {
                let gen = m.load().gen();
                if gen != 0 {
                    gc_table
                        .mark(b)
                        .expect("same geometry")
                        .store(BucketMark::EMPTY.with_gen(gen));
                }
            }
            dev.usage[GC].zero();
            dev.publish_table(true, Arc::new(gc_table));
        }
        self.gc.start();
        Ok(())
    }

    /// Advance the GC cursor; positions behind it route marking into the gc
    /// world.
    pub fn gc_advance(&self, pos: sfs_types::GcPos) {
        self.gc.advance(pos);
    }

    /// End the sweep and drop the gc world. Reconciling gc counters into
    /// the live world is the sweep driver's job, before calling this.
    pub fn gc_finish(&self) {
        let _gcw = self.gc_lock.write();
        let _ml = self.mark_lock_write();
        self.gc.finish();
        for dev in self.devs() {
            dev.publish_table(true, Arc::new(BucketTable::empty()));
        }
    }

    // ── Debug verification ──

    /// Panic if any summed counter has gone negative or any per-device
    /// bucket count exceeds the device. Exact only while nothing is folding
    /// concurrently (tests at quiescence, or under the mark lock in write
    /// mode); compiled to a no-op in release builds.
    #[cfg(debug_assertions)]
    pub fn verify_counters(&self) {
        let u = self.usage_read(false);
        for (name, v) in [
            ("hidden", u.hidden),
            ("data", u.data),
            ("cached", u.cached),
            ("reserved", u.reserved),
            ("online_reserved", u.online_reserved),
            ("nr_inodes", u.nr_inodes),
        ] {
            assert!((v as i64) >= 0, "fs usage {name} underflow: {}", v as i64);
        }
        for r in 0..sfs_types::MAX_REPLICAS {
            for t in DataType::ALL {
                let v = u.replicas[r].data[t.as_index()];
                assert!(
                    (v as i64) >= 0,
                    "replicas {} {} sectors underflow: {}",
                    r + 1,
                    t.name(),
                    v as i64
                );
            }
            let v = u.replicas[r].persistent_reserved;
            assert!(
                (v as i64) >= 0,
                "replicas {} reserved underflow: {}",
                r + 1,
                v as i64
            );
        }

        for dev in self.devs() {
            let n = dev.nbuckets() - dev.first_bucket();
            let du = dev.usage_read(false);
            for t in DataType::ALL {
                assert!(
                    du.buckets[t.as_index()] <= n,
                    "dev {} {} bucket count exceeds device",
                    dev.idx().0,
                    t.name()
                );
            }
            assert!(du.buckets_alloc <= n);
            assert!(du.buckets_unavailable <= n);
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn verify_counters(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_with_dev(nbuckets: u64, bucket_size: u32) -> (Fs, Arc<Dev>) {
        let fs = Fs::new(AccountingConfig {
            shards: 2,
            btree_node_size: 256,
        });
        let dev = fs
            .dev_buckets_alloc(DevConfig {
                first_bucket: 0,
                nbuckets,
                bucket_size,
            })
            .unwrap();
        (fs, dev)
    }

    #[test]
    fn capacity_tracks_devices() {
        let (fs, dev) = fs_with_dev(16, 512);
        assert_eq!(fs.capacity(), 16 * 512);

        let dev2 = fs
            .dev_buckets_alloc(DevConfig {
                first_bucket: 2,
                nbuckets: 10,
                bucket_size: 512,
            })
            .unwrap();
        assert_eq!(fs.capacity(), 16 * 512 + 8 * 512);

        fs.dev_buckets_free(&dev2);
        assert_eq!(fs.capacity(), 16 * 512);
        assert_eq!(dev.idx(), DeviceIdx(0));
    }

    #[test]
    fn device_slots_are_reused() {
        let (fs, _dev) = fs_with_dev(16, 512);
        let dev2 = fs
            .dev_buckets_alloc(DevConfig {
                first_bucket: 0,
                nbuckets: 8,
                bucket_size: 512,
            })
            .unwrap();
        assert_eq!(dev2.idx(), DeviceIdx(1));
        fs.dev_buckets_free(&dev2);
        let dev3 = fs
            .dev_buckets_alloc(DevConfig {
                first_bucket: 0,
                nbuckets: 4,
                bucket_size: 512,
            })
            .unwrap();
        assert_eq!(dev3.idx(), DeviceIdx(1));
    }

    #[test]
    fn resize_preserves_prefix_marks() {
        let (fs, dev) = fs_with_dev(1000, 512);
        for b in 0..1000 {
            dev.bucket_table(false)
                .mark(BucketIndex(b))
                .unwrap()
                .update(|m| m.with_gen((b % 251) as u8));
        }

        fs.dev_buckets_resize(&dev, 800).unwrap();
        let table = dev.bucket_table(false);
        assert_eq!(table.nbuckets(), 800);
        for b in 0..800 {
            assert_eq!(table.mark(BucketIndex(b)).unwrap().load().gen(), (b % 251) as u8);
        }
        assert_eq!(fs.capacity(), 800 * 512);
    }

    #[test]
    fn readers_see_old_or_new_table_never_both() {
        let (fs, dev) = fs_with_dev(1000, 512);
        let guard = dev.bucket_table(false);
        assert_eq!(guard.nbuckets(), 1000);

        fs.dev_buckets_resize(&dev, 500).unwrap();
        // The held guard still sees the old table in full.
        assert_eq!(guard.nbuckets(), 1000);
        assert!(guard.mark(BucketIndex(999)).is_some());
        // A fresh load sees the new one.
        assert_eq!(dev.bucket_table(false).nbuckets(), 500);
    }

    #[test]
    fn waker_counts_wakeups() {
        let w = AllocatorWaker::default();
        assert_eq!(w.wakeups(), 0);
        w.wake();
        w.wake();
        assert_eq!(w.wakeups(), 2);
        w.wait_past(1);
    }
}
