//! Disk-space reservations: writer admission control.
//!
//! A writer must hold a [`DiskReservation`] covering its sectors before it
//! may dirty anything. Admission runs at two levels: a per-shard cache of
//! pre-charged sectors (refilled [`SECTORS_CACHE`] at a time) and a global
//! atomic pool holding the filesystem-wide admissible count,
//! `avail_factor(free_sectors)`. When the global pool cannot satisfy a
//! request the slow path recalculates it from the summed usage counters
//! under the mark lock in write mode.
//!
//! Reservations are repaid at transaction commit
//! ([`Fs::fs_usage_apply`](crate::Fs::fs_usage_apply) debits the sectors
//! that became real data) or released wholesale on abort.

use crate::usage::{avail_factor, FsUsage};
use crate::{Fs, MarkPin};
use sfs_error::{Result, SfsError};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Sectors pre-charged into a shard's cache beyond the request that missed.
pub const SECTORS_CACHE: u64 = 1024;

/// An outstanding promise of writable sectors.
///
/// Consumed by the marking engine as data is written; anything left over is
/// returned with [`Fs::reservation_put`].
#[derive(Debug, Default)]
pub struct DiskReservation {
    pub sectors: u64,
}

/// Flags modifying [`Fs::reservation_add`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservationFlags {
    /// Reserve even if the pool cannot cover it; the filesystem is already
    /// committed to this write (journal replay, emergency metadata).
    pub nofail: bool,
    /// The caller already holds the gc lock.
    pub gc_lock_held: bool,
    /// The caller holds btree node locks: taking the gc lock blocking would
    /// invert the lock order against a running GC, so only try-lock and let
    /// the caller unwind on failure.
    pub btree_locks_held: bool,
}

/// The two-level sector pool.
pub(crate) struct ReservationPool {
    global: AtomicU64,
    caches: Vec<AtomicU64>,
}

impl std::fmt::Debug for ReservationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationPool")
            .field("global", &self.global.load(Ordering::Relaxed))
            .field("cached", &self.caches_total())
            .finish()
    }
}

impl ReservationPool {
    pub(crate) fn new(nr_shards: usize) -> Self {
        Self {
            global: AtomicU64::new(0),
            caches: (0..nr_shards.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn global_read(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    pub(crate) fn global_store(&self, v: u64) {
        self.global.store(v, Ordering::Release);
    }

    pub(crate) fn global_sub(&self, v: u64) {
        let _ = self
            .global
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(v))
            });
    }

    pub(crate) fn caches_total(&self) -> u64 {
        self.caches
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    fn zero_caches(&self) {
        for c in &self.caches {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl Fs {
    /// Reserve `sectors` sectors for an upcoming write.
    ///
    /// Fast path: debit the caller's shard cache. Cache miss: withdraw the
    /// request plus a cache refill from the global pool with a CAS. If the
    /// pool cannot cover the request, drop the read pin and recalculate the
    /// pool from the summed counters; a recalculation that still cannot
    /// cover it fails with `NoSpace` (unless `nofail`), leaving the
    /// reservation and `online_reserved` untouched.
    pub fn reservation_add(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        {
            let pin = self.mark_pin();
            let cache = &self.pool.caches[pin.shard()];

            let mut have = cache
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    v.checked_sub(sectors)
                })
                .is_ok();

            if !have {
                let mut v = self.pool.global_read();
                loop {
                    let get = (sectors + SECTORS_CACHE).min(v);
                    if get < sectors {
                        break;
                    }
                    match self.pool.global.compare_exchange_weak(
                        v,
                        v - get,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            cache.fetch_add(get - sectors, Ordering::AcqRel);
                            have = true;
                            break;
                        }
                        Err(cur) => v = cur,
                    }
                }
            }

            if have {
                self.credit_reservation(&pin, res, sectors);
                trace!(
                    target: "sfs::accounting::reservation",
                    sectors,
                    "reservation granted from cache"
                );
                return Ok(());
            }
        }

        self.reservation_recalculate(res, sectors, flags)
    }

    fn credit_reservation(&self, pin: &MarkPin<'_>, res: &mut DiskReservation, sectors: u64) {
        let mut delta = FsUsage::default();
        delta.s.online_reserved = sectors as i64;
        self.usage_counters(false).fold(pin.shard(), &delta);
        res.sectors += sectors;
    }

    /// The slow path: zero every shard cache and recompute the global pool
    /// from the counters. GC recalculates the pool when it starts, so
    /// writers rarely end up here.
    fn reservation_recalculate(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        flags: ReservationFlags,
    ) -> Result<()> {
        let _gc_guard = if flags.gc_lock_held {
            None
        } else if flags.btree_locks_held {
            match self.gc_lock().try_read() {
                Some(g) => Some(g),
                None => return Err(SfsError::WouldBlock),
            }
        } else {
            Some(self.gc_lock().read())
        };

        let _write = self.mark_lock_write();
        let sectors_available = self.recalc_sectors_available_locked();

        let ret = if sectors <= sectors_available || flags.nofail {
            self.pool
                .global_store(sectors_available.saturating_sub(sectors));
            let shard = crate::usage::current_shard(self.nr_shards());
            let mut delta = FsUsage::default();
            delta.s.online_reserved = sectors as i64;
            self.usage_counters(false).fold(shard, &delta);
            res.sectors += sectors;
            debug!(
                target: "sfs::accounting::reservation",
                sectors,
                sectors_available,
                "reservation granted after recalculation"
            );
            Ok(())
        } else {
            self.pool.global_store(sectors_available);
            debug!(
                target: "sfs::accounting::reservation",
                sectors,
                sectors_available,
                "reservation denied"
            );
            Err(SfsError::NoSpace)
        };

        self.reservations_verify(flags);
        ret
    }

    /// Zero the shard caches and recompute the admissible sector count.
    /// Caller holds the mark lock in write mode.
    pub(crate) fn recalc_sectors_available_locked(&self) -> u64 {
        self.pool.zero_caches();
        let used = self.usage_read(false).sectors_used();
        avail_factor(self.capacity().saturating_sub(used))
    }

    /// Recompute and publish the global pool. Caller holds the mark lock in
    /// write mode (device bring-up, GC start).
    pub(crate) fn recalc_sectors_available_locked_store(&self) {
        let avail = self.recalc_sectors_available_locked();
        self.pool.global_store(avail);
    }

    /// Release an unused (or aborted) reservation.
    pub fn reservation_put(&self, res: &mut DiskReservation) {
        if res.sectors == 0 {
            return;
        }
        let pin = self.mark_pin();
        let mut delta = FsUsage::default();
        delta.s.online_reserved = -(res.sectors as i64);
        self.usage_counters(false).fold(pin.shard(), &delta);
        trace!(
            target: "sfs::accounting::reservation",
            sectors = res.sectors,
            "reservation released"
        );
        res.sectors = 0;
    }

    /// The global pool's current admissible sector count.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.pool.global_read()
    }

    /// Total sectors parked in the shard caches.
    #[must_use]
    pub fn sectors_cached(&self) -> u64 {
        self.pool.caches_total()
    }

    /// `used + available + caches` must never exceed capacity. Checked on
    /// the recalculation path, where the write-mode mark lock makes the sum
    /// exact; debug builds panic on violation.
    #[cfg(debug_assertions)]
    pub(crate) fn reservations_verify(&self, flags: ReservationFlags) {
        if flags.nofail {
            return;
        }
        let used = self.usage_read(false).sectors_used();
        let avail = self.pool.global_read();
        let cached = self.pool.caches_total();
        assert!(
            used + avail + cached <= self.capacity(),
            "reservation oversubscription: used {used} avail {avail} cached {cached} capacity {}",
            self.capacity()
        );
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn reservations_verify(&self, _flags: ReservationFlags) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountingConfig, DevConfig};

    fn fs_with_capacity(sectors: u64) -> Fs {
        let fs = Fs::new(AccountingConfig {
            shards: 2,
            btree_node_size: 256,
        });
        fs.dev_buckets_alloc(DevConfig {
            first_bucket: 0,
            nbuckets: sectors / 512,
            bucket_size: 512,
        })
        .unwrap();
        fs
    }

    #[test]
    fn pool_initialized_from_capacity() {
        let fs = fs_with_capacity(8192);
        assert_eq!(fs.sectors_available(), avail_factor(8192));
    }

    #[test]
    fn add_and_put_roundtrip() {
        let fs = fs_with_capacity(8192);
        let pool_before = fs.sectors_available() + fs.sectors_cached();

        let mut res = DiskReservation::default();
        fs.reservation_add(&mut res, 100, ReservationFlags::default())
            .unwrap();
        assert_eq!(res.sectors, 100);
        assert_eq!(fs.usage_read(false).online_reserved, 100);
        // The withdrawal moved sectors into the cache, none were lost.
        assert_eq!(
            fs.sectors_available() + fs.sectors_cached() + 100,
            pool_before
        );

        fs.reservation_put(&mut res);
        assert_eq!(res.sectors, 0);
        assert_eq!(fs.usage_read(false).online_reserved, 0);
        fs.verify_counters();
    }

    #[test]
    fn cache_refill_is_bounded_by_the_pool() {
        let fs = fs_with_capacity(8192);
        let avail = fs.sectors_available();

        let mut res = DiskReservation::default();
        fs.reservation_add(&mut res, 100, ReservationFlags::default())
            .unwrap();
        // Withdrawal is at most the request plus one cache refill.
        assert!(fs.sectors_available() >= avail - (100 + SECTORS_CACHE));

        // A second small reservation hits the cache, the pool is untouched.
        let pool = fs.sectors_available();
        let mut res2 = DiskReservation::default();
        fs.reservation_add(&mut res2, 10, ReservationFlags::default())
            .unwrap();
        assert_eq!(fs.sectors_available(), pool);

        fs.reservation_put(&mut res);
        fs.reservation_put(&mut res2);
    }

    #[test]
    fn no_space_leaves_state_untouched() {
        let fs = fs_with_capacity(8192);

        let mut big = DiskReservation::default();
        let err = fs
            .reservation_add(&mut big, 1 << 20, ReservationFlags::default())
            .unwrap_err();
        assert!(matches!(err, SfsError::NoSpace));
        assert_eq!(big.sectors, 0);
        assert_eq!(fs.usage_read(false).online_reserved, 0);
        // The recalculated pool stays published.
        assert_eq!(fs.sectors_available(), avail_factor(8192));
    }

    #[test]
    fn nofail_reserves_past_the_pool() {
        let fs = fs_with_capacity(8192);
        let mut res = DiskReservation::default();
        fs.reservation_add(
            &mut res,
            1 << 20,
            ReservationFlags {
                nofail: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(res.sectors, 1 << 20);
        assert_eq!(fs.sectors_available(), 0);
        fs.reservation_put(&mut res);
    }

    #[test]
    fn btree_locks_held_degrades_to_try_lock() {
        let fs = fs_with_capacity(8192);
        // Exhaust the pool so recalculation is forced.
        let mut res = DiskReservation::default();
        let gc_write = fs.gc_lock().write();
        let err = fs
            .reservation_add(
                &mut res,
                1 << 20,
                ReservationFlags {
                    btree_locks_held: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SfsError::WouldBlock));
        drop(gc_write);

        // Without contention the try-lock succeeds and we get the normal
        // NoSpace answer.
        let err = fs
            .reservation_add(
                &mut res,
                1 << 20,
                ReservationFlags {
                    btree_locks_held: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SfsError::NoSpace));
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::{Arc, Barrier};
        use std::thread;

        let fs = Arc::new(fs_with_capacity(1 << 20));
        let admissible = fs.sectors_available();
        let granted = Arc::new(AtomicU64::new(0));
        let threads = 8_usize;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let fs = Arc::clone(&fs);
                let granted = Arc::clone(&granted);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut held = Vec::new();
                    loop {
                        let mut res = DiskReservation::default();
                        match fs.reservation_add(&mut res, 4096, ReservationFlags::default()) {
                            Ok(()) => {
                                granted.fetch_add(res.sectors, Ordering::Relaxed);
                                held.push(res);
                            }
                            Err(SfsError::NoSpace) => break,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                    held
                })
            })
            .collect();

        let mut all: Vec<DiskReservation> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }

        assert!(
            granted.load(Ordering::Relaxed) <= admissible,
            "granted more than the admissible pool"
        );
        for mut res in all {
            fs.reservation_put(&mut res);
        }
        assert_eq!(fs.usage_read(false).online_reserved, 0);
        fs.verify_counters();
    }
}
