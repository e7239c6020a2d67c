//! The key marking engine.
//!
//! Translates key insertions and removals into bucket-mark transitions and
//! counter deltas. A write transaction assembles a key update, calls
//! [`Fs::mark_update`] with the node's overlapping keys, and commits the
//! accumulated delta through [`Fs::fs_usage_apply`].
//!
//! Every marking call updates the live world; it additionally updates the gc
//! world when the caller is GC itself (the `gc` flag) or when GC's cursor has
//! already swept past the key's position. Both checks happen under the
//! caller's [`MarkPin`], so GC cannot reset the gc world between the two
//! updates. Filesystem-level counters reach the gc shard exactly once: a
//! direct marking call folds them at mark time, a transaction accumulates
//! them in its delta and [`Fs::fs_usage_apply`] folds that delta into the
//! live shard and, when the position was visited, into the gc shard too.

use crate::usage::{dt, DevUsage, DevUsageSnapshot, FsUsage};
use crate::{Dev, DiskReservation, Fs, MarkPin};
use sfs_error::Result;
use sfs_types::{
    extent_overlap, gen_after, BtreeId, BucketIndex, BucketMark, DataType, DecodedPtr,
    ExtentOverlap, ExtentPtr, GcPos, Key, KeyPos, PtrCrc, StripeKey, StripeRef, MAX_REPLICAS,
};
use std::sync::Arc;
use tracing::{trace, warn};

/// Flags modifying a marking call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkFlags {
    /// The caller is the GC sweep: update only the gc world.
    pub gc: bool,
    /// Single-threaded bring-up: skip the CAS.
    pub noatomic: bool,
}

impl MarkFlags {
    pub const GC: Self = Self {
        gc: true,
        noatomic: false,
    };
}

/// The slice of a btree node [`Fs::mark_update`] walks: the keys at and
/// after the insertion position, in node order.
#[derive(Debug)]
pub struct BtreeNodeView<'a> {
    pub btree: BtreeId,
    /// Extent btrees overlap by range; other btrees overwrite by position.
    pub is_extents: bool,
    /// The node's end-of-range bound; the inserted key is clamped to it.
    pub node_end: KeyPos,
    pub keys: &'a [Key],
}

// ─── Disk-sector scaling ────────────────────────────────────────────────────

fn scaled_sectors(crc: &PtrCrc, sectors: i64) -> i64 {
    debug_assert!(sectors >= 0);
    if crc.compressed {
        let (num, den) = (
            sectors * i64::from(crc.compressed_size),
            i64::from(crc.uncompressed_size),
        );
        (num + den - 1) / den
    } else {
        sectors
    }
}

/// The on-disk sector delta of marking `delta` live sectors through this
/// pointer's compression envelope.
///
/// A positive delta describes a key that *will have* that size (in the
/// middle-overlap split the right-hand key does not exist yet, so the
/// pointer's own live size must not be consulted). A negative delta removes
/// part of the live range, and the on-disk change is the difference of the
/// scaled sizes.
fn ptr_disk_sectors_delta(crc: &PtrCrc, delta: i64) -> i64 {
    if delta > 0 {
        scaled_sectors(crc, delta)
    } else {
        debug_assert!(-delta <= i64::from(crc.live_size));
        scaled_sectors(crc, i64::from(crc.live_size) + delta)
            - scaled_sectors(crc, i64::from(crc.live_size))
    }
}

// ─── Per-bucket accounting ──────────────────────────────────────────────────

fn is_fragmented(bucket_size: u32, m: BucketMark) -> i64 {
    if !m.owned_by_allocator() && m.data_type() == DataType::User && m.sectors_used() > 0 {
        i64::from(bucket_size).saturating_sub(i64::from(m.sectors_used())).max(0)
    } else {
        0
    }
}

fn account_bucket(sink: &mut FsUsage, du: &mut DevUsage, t: DataType, nr: i64, size: i64) {
    if matches!(t, DataType::Sb | DataType::Journal) {
        sink.s.hidden += size;
    }
    sink.buckets[dt(t)] += size;
    du.buckets[dt(t)] += nr;
}

/// The counter movement of one bucket-mark transition, independent of which
/// world it lands in.
fn dev_usage_delta(
    bucket_size: u32,
    old: BucketMark,
    new: BucketMark,
    du: &mut DevUsage,
    sink: &mut FsUsage,
) {
    let size = i64::from(bucket_size);
    if old.bucket_type() != DataType::None {
        account_bucket(sink, du, old.bucket_type(), -1, -size);
    }
    if new.bucket_type() != DataType::None {
        account_bucket(sink, du, new.bucket_type(), 1, size);
    }

    du.buckets_alloc += i64::from(new.owned_by_allocator()) - i64::from(old.owned_by_allocator());
    du.buckets_ec += i64::from(new.stripe()) - i64::from(old.stripe());
    du.buckets_unavailable += i64::from(new.is_unavailable()) - i64::from(old.is_unavailable());

    du.sectors[dt(old.data_type())] -= i64::from(old.dirty_sectors());
    du.sectors[dt(new.data_type())] += i64::from(new.dirty_sectors());
    du.sectors[dt(DataType::Cached)] +=
        i64::from(new.cached_sectors()) - i64::from(old.cached_sectors());
    du.sectors_fragmented += is_fragmented(bucket_size, new) - is_fragmented(bucket_size, old);
}

impl Fs {
    fn dev_usage_update(
        &self,
        dev: &Dev,
        pin: &MarkPin<'_>,
        sink: &mut FsUsage,
        old: BucketMark,
        new: BucketMark,
        gc: bool,
    ) {
        if old.data_type() != DataType::None
            && new.data_type() != DataType::None
            && old.data_type() != new.data_type()
        {
            self.inconsistent(&format!(
                "different types of data in same bucket: {}, {}",
                old.data_type().name(),
                new.data_type().name()
            ));
        }

        let mut du = DevUsage::default();
        dev_usage_delta(dev.bucket_size(), old, new, &mut du, sink);
        dev.usage(gc).fold(pin.shard(), &du);

        if old.is_unavailable() && new.is_available() {
            dev.wake_allocator();
        }
    }

    /// Rebuild a device's live usage from the authoritative bucket marks.
    ///
    /// Called at mount, after the alloc btree has been read and before any
    /// marking: the device's usage shards must still be zero.
    pub fn dev_usage_from_buckets(&self, dev: &Arc<Dev>) {
        let pin = self.mark_pin();
        let _bl = dev.bucket_read();
        let mut sink = FsUsage::default();
        let table = dev.bucket_table(false);
        for (_b, mark) in table.iter_live() {
            self.dev_usage_update(dev, &pin, &mut sink, BucketMark::EMPTY, mark, false);
        }
        self.usage_counters(false).fold(pin.shard(), &sink);
    }

    /// What a device's usage would sum to from its current marks, without
    /// touching any counter. Mirrors [`dev_usage_from_buckets`]; property
    /// checks compare the two.
    #[must_use]
    pub fn dev_usage_compute(&self, dev: &Dev) -> DevUsageSnapshot {
        let mut du = DevUsage::default();
        let mut sink = FsUsage::default();
        let table = dev.bucket_table(false);
        for (_b, mark) in table.iter_live() {
            dev_usage_delta(dev.bucket_size(), BucketMark::EMPTY, mark, &mut du, &mut sink);
        }
        DevUsageSnapshot {
            buckets: du.buckets.map(|v| v as u64),
            buckets_alloc: du.buckets_alloc as u64,
            buckets_ec: du.buckets_ec as u64,
            buckets_unavailable: du.buckets_unavailable as u64,
            sectors: du.sectors.map(|v| v as u64),
            sectors_fragmented: du.sectors_fragmented as u64,
        }
    }

    // ─── Pointer marking ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn mark_pointer(
        &self,
        pin: &MarkPin<'_>,
        p: &DecodedPtr,
        disk_sectors: i64,
        data_type: DataType,
        sink: &mut FsUsage,
        journal_seq: u64,
        flags: MarkFlags,
        gc: bool,
    ) -> Result<()> {
        let Some(dev) = self.dev(p.ptr.dev) else {
            self.inconsistent(&format!("pointer to invalid device {}", p.ptr.dev.0));
            return Ok(());
        };
        let table = dev.bucket_table(gc);
        if gc && table.nbuckets() == 0 {
            // The gc world is not materialized; nothing to reflect.
            return Ok(());
        }
        let b = dev.bucket_of_sector(p.ptr.offset);
        let Some(mark) = table.mark(b) else {
            self.inconsistent(&format!(
                "pointer to invalid bucket {} on device {}",
                b.0, p.ptr.dev.0
            ));
            return Ok(());
        };

        let ptr_gen = p.ptr.gen;
        let cached = p.ptr.cached;
        let update = |old: BucketMark| -> Option<BucketMark> {
            // The gen is compared inside the CAS loop: the allocator may
            // invalidate the bucket between our load and our swap, and the
            // retry re-evaluates the check against the bumped gen.
            if gen_after(old.gen(), ptr_gen) {
                return None;
            }
            let mut new = if cached {
                old.checked_add_cached(disk_sectors)
            } else {
                old.checked_add_dirty(disk_sectors)
            }
            .unwrap_or_else(|| {
                panic!(
                    "bucket {} on device {}: sector count over/underflow (delta {})",
                    b.0, p.ptr.dev.0, disk_sectors
                )
            });

            if new.dirty_sectors() == 0 && new.cached_sectors() == 0 {
                new = new.with_data_type(DataType::None);
            } else {
                new = new.with_data_type(data_type);
                if journal_seq != 0 {
                    new = new.with_journal_seq(journal_seq);
                }
            }
            Some(new)
        };

        let result = if flags.noatomic {
            mark.try_update_nonatomic(update)
        } else {
            mark.try_update(update)
        };

        let Some((old, new)) = result else {
            // Stale pointer: the bucket was invalidated and reused beneath
            // this key. Routine once the alloc btree has been read; fatal
            // inconsistency before that.
            if !self.alloc_read_done() {
                self.inconsistent(&format!(
                    "stale pointer (gen {} behind bucket {}) before alloc read finished",
                    ptr_gen, b.0
                ));
            }
            trace!(
                target: "sfs::accounting::engine",
                dev = p.ptr.dev.0,
                bucket = b.0,
                ptr_gen,
                "stale pointer skipped"
            );
            return Ok(());
        };

        self.dev_usage_update(&dev, pin, sink, old, new, gc);

        if !gc && old.is_available() && new.is_unavailable() {
            self.inconsistent(&format!(
                "bucket {} became unavailable outside invalidation",
                b.0
            ));
        }
        Ok(())
    }

    fn mark_stripe_ptr(
        &self,
        s: &StripeRef,
        sectors: i64,
        adjusted_disk_sectors: &mut i64,
        redundancy: &mut u32,
        gc: bool,
    ) -> Result<()> {
        let map = self.stripes(gc);
        let m = map.get_alive(s.idx)?;

        let nr_data = i64::from(m.nr_data_blocks());
        debug_assert!(nr_data > 0);
        let parity_num = sectors.abs() * i64::from(m.nr_redundant);
        let mut parity = (parity_num + nr_data - 1) / nr_data;
        if sectors < 0 {
            parity = -parity;
        }
        *adjusted_disk_sectors += parity;
        *redundancy = (*redundancy).max(u32::from(m.nr_redundant) + 1);

        if gc {
            map.add_block_sectors_gc(&m, s.block, sectors);
        } else {
            map.add_block_sectors(s.idx, &m, s.block, sectors);
        }
        Ok(())
    }

    // ─── Extent marking ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn mark_extent(
        &self,
        pin: &MarkPin<'_>,
        ptrs: &[DecodedPtr],
        sectors: i64,
        data_type: DataType,
        sink: &mut FsUsage,
        journal_seq: u64,
        flags: MarkFlags,
        gc: bool,
    ) -> Result<()> {
        debug_assert!(sectors != 0);

        // A dead stripe must fail the whole call before any sibling pointer
        // is marked.
        for p in ptrs {
            if !p.ptr.cached {
                for s in &p.stripes {
                    self.stripes(gc).get_alive(s.idx)?;
                }
            }
        }

        let mut cached_sectors = 0_i64;
        let mut dirty_sectors = 0_i64;
        let mut ec_sectors = 0_i64;
        let mut replicas = 0_u32;
        let mut ec_redundancy = 0_u32;

        for p in ptrs {
            let disk_sectors = if data_type == DataType::Btree {
                sectors
            } else {
                ptr_disk_sectors_delta(&p.crc, sectors)
            };
            let mut adjusted_disk_sectors = disk_sectors;

            self.mark_pointer(pin, p, disk_sectors, data_type, sink, journal_seq, flags, gc)?;

            if !p.ptr.cached {
                for s in &p.stripes {
                    self.mark_stripe_ptr(s, disk_sectors, &mut adjusted_disk_sectors,
                                         &mut ec_redundancy, gc)?;
                }
                replicas += 1;
            }

            if p.ptr.cached {
                cached_sectors += adjusted_disk_sectors;
            } else if p.stripes.is_empty() {
                dirty_sectors += adjusted_disk_sectors;
            } else {
                ec_sectors += adjusted_disk_sectors;
            }
        }

        let replicas = replicas.clamp(1, MAX_REPLICAS as u32) as usize;
        let ec_redundancy = ec_redundancy.clamp(1, MAX_REPLICAS as u32) as usize;

        sink.s.cached += cached_sectors;
        sink.replicas[0].data[dt(DataType::Cached)] += cached_sectors;

        sink.s.data += dirty_sectors;
        sink.replicas[replicas - 1].data[dt(data_type)] += dirty_sectors;

        sink.s.data += ec_sectors;
        sink.replicas[ec_redundancy - 1].ec_data += ec_sectors;

        Ok(())
    }

    // ─── Stripe key marking ─────────────────────────────────────────────────

    fn mark_stripe_key(
        &self,
        pin: &MarkPin<'_>,
        key: &StripeKey,
        inserting: bool,
        sink: &mut FsUsage,
        flags: MarkFlags,
        gc: bool,
    ) -> Result<()> {
        if inserting {
            self.stripes(gc).insert(key, gc)?;
        } else {
            self.stripes(gc).remove(key.idx, gc)?;
        }

        for ptr in &key.ptrs {
            self.set_stripe_bit(pin, ptr, inserting, sink, flags, gc);
        }
        Ok(())
    }

    fn set_stripe_bit(
        &self,
        pin: &MarkPin<'_>,
        ptr: &ExtentPtr,
        enabled: bool,
        sink: &mut FsUsage,
        flags: MarkFlags,
        gc: bool,
    ) {
        let Some(dev) = self.dev(ptr.dev) else {
            self.inconsistent(&format!("stripe pointer to invalid device {}", ptr.dev.0));
            return;
        };
        let table = dev.bucket_table(gc);
        if gc && table.nbuckets() == 0 {
            return;
        }
        let b = dev.bucket_of_sector(ptr.offset);
        let Some(mark) = table.mark(b) else {
            self.inconsistent(&format!(
                "stripe pointer to invalid bucket {} on device {}",
                b.0, ptr.dev.0
            ));
            return;
        };

        let ptr_gen = ptr.gen;
        let update = |m: BucketMark| {
            // Checked on every CAS retry, as in mark_pointer: a stripe
            // member going stale under us must not have its bit flipped.
            if gen_after(m.gen(), ptr_gen) {
                return None;
            }
            Some(m.with_stripe(enabled))
        };
        let result = if flags.noatomic {
            mark.try_update_nonatomic(update)
        } else {
            mark.try_update(update)
        };
        let Some((old, new)) = result else {
            self.inconsistent(&format!("stripe pointer to stale bucket {}", b.0));
            return;
        };

        if old.stripe() == enabled {
            self.inconsistent(&format!(
                "bucket {} stripe bit already {}",
                b.0,
                if enabled { "set" } else { "clear" }
            ));
        }
        self.dev_usage_update(&dev, pin, sink, old, new, gc);
    }

    // ─── Key dispatch ───────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn mark_key_world(
        &self,
        pin: &MarkPin<'_>,
        k: &Key,
        inserting: bool,
        sectors: i64,
        sink: &mut FsUsage,
        journal_seq: u64,
        flags: MarkFlags,
        gc: bool,
    ) -> Result<()> {
        match k {
            Key::BtreePtr { ptrs } => {
                let node = i64::from(self.config().btree_node_size);
                self.mark_extent(
                    pin,
                    ptrs,
                    if inserting { node } else { -node },
                    DataType::Btree,
                    sink,
                    journal_seq,
                    flags,
                    gc,
                )
            }
            Key::Extent(e) => self.mark_extent(
                pin,
                &e.ptrs,
                sectors,
                DataType::User,
                sink,
                journal_seq,
                flags,
                gc,
            ),
            Key::Stripe(s) => self.mark_stripe_key(pin, s, inserting, sink, flags, gc),
            Key::InodeAlloc { .. } => {
                sink.s.nr_inodes += if inserting { 1 } else { -1 };
                Ok(())
            }
            Key::Reservation { nr_replicas, .. } => {
                let total = sectors * i64::from(*nr_replicas);
                let r = usize::from(*nr_replicas).clamp(1, MAX_REPLICAS);
                sink.s.reserved += total;
                sink.replicas[r - 1].persistent_reserved += total;
                Ok(())
            }
        }
    }

    /// Mark a key insertion or removal. Requires the mark lock held in read
    /// mode (the pin).
    ///
    /// `sectors` is the signed live-sector count for ranged keys; btree
    /// pointers, stripes and inode allocations ignore it. The live world's
    /// filesystem-level counters accumulate into `fs_usage` when supplied
    /// (the transaction delta, applied later through
    /// [`fs_usage_apply`](Fs::fs_usage_apply)) and fold straight into the
    /// live shard otherwise. The gc world's bucket marks and device usage
    /// always move at mark time; its filesystem-level counters fold at mark
    /// time only for direct calls — with a transaction delta in play they
    /// arrive through [`fs_usage_apply`](Fs::fs_usage_apply)'s visited fold
    /// instead, so each contribution lands exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_key_locked(
        &self,
        pin: &MarkPin<'_>,
        k: &Key,
        inserting: bool,
        sectors: i64,
        pos: GcPos,
        mut fs_usage: Option<&mut FsUsage>,
        journal_seq: u64,
        flags: MarkFlags,
    ) -> Result<()> {
        let have_delta = fs_usage.is_some();
        if !flags.gc {
            match fs_usage.as_deref_mut() {
                Some(sink) => {
                    self.mark_key_world(pin, k, inserting, sectors, sink, journal_seq, flags, false)?;
                }
                None => {
                    let mut local = FsUsage::default();
                    self.mark_key_world(
                        pin, k, inserting, sectors, &mut local, journal_seq, flags, false,
                    )?;
                    self.usage_counters(false).fold(pin.shard(), &local);
                }
            }
        }

        if flags.gc || self.gc.visited(pos) {
            let mut gc_delta = FsUsage::default();
            self.mark_key_world(pin, k, inserting, sectors, &mut gc_delta, journal_seq, flags, true)?;
            if flags.gc || !have_delta {
                self.usage_counters(true).fold(pin.shard(), &gc_delta);
            }
        }
        Ok(())
    }

    /// [`mark_key_locked`](Fs::mark_key_locked) behind its own read pin.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_key(
        &self,
        k: &Key,
        inserting: bool,
        sectors: i64,
        pos: GcPos,
        fs_usage: Option<&mut FsUsage>,
        journal_seq: u64,
        flags: MarkFlags,
    ) -> Result<()> {
        let pin = self.mark_pin();
        self.mark_key_locked(&pin, k, inserting, sectors, pos, fs_usage, journal_seq, flags)
    }

    // ─── Transaction commit ─────────────────────────────────────────────────

    /// Fold a transaction's accumulated delta into the current shard and
    /// settle its reservation.
    ///
    /// Newly persisted sectors (`data + reserved`) are debited from the
    /// reservation and from `online_reserved`; usage that grew *without* a
    /// covering reservation is a bug, repaid to the global pool so the
    /// admission math stays honest. The delta lands in the live shard, and
    /// in the gc shard as well when GC has already swept past `pos` — the
    /// caller's pin has been held since the marks were made, so the visited
    /// answer here matches the one the marking calls saw.
    pub fn fs_usage_apply(
        &self,
        pin: &MarkPin<'_>,
        delta: &mut FsUsage,
        mut res: Option<&mut DiskReservation>,
        pos: GcPos,
    ) {
        let mut added = delta.s.data + delta.s.reserved;

        let res_sectors = res.as_deref().map_or(0, |r| r.sectors) as i64;
        let should_not_have_added = added - res_sectors;
        if should_not_have_added > 0 {
            warn!(
                target: "sfs::accounting::engine",
                sectors = should_not_have_added,
                "disk usage increased without a reservation"
            );
            self.pool.global_sub(should_not_have_added as u64);
            added -= should_not_have_added;
        }

        if added > 0 {
            if let Some(r) = res.as_deref_mut() {
                r.sectors -= added as u64;
            }
            delta.s.online_reserved -= added;
        }

        self.usage_counters(false).fold(pin.shard(), delta);
        if self.gc.visited(pos) {
            self.usage_counters(true).fold(pin.shard(), delta);
        }
        delta.clear();
    }

    /// Walk a btree node for keys overlapping an insertion, mark the
    /// insertion and unmark the overlapped portions, then commit the delta.
    ///
    /// Requires the caller's read pin, held across the whole walk so the
    /// gc-visited answer is stable from first mark to final apply.
    pub fn mark_update(
        &self,
        pin: &MarkPin<'_>,
        node: &BtreeNodeView<'_>,
        insert: &Key,
        res: &mut DiskReservation,
        journal_seq: u64,
    ) -> Result<()> {
        let pos = GcPos::btree(node.btree, node.node_end);
        let mut delta = FsUsage::default();
        let flags = MarkFlags::default();

        let insert_sectors = match key_range(insert) {
            Some((start, end)) => {
                i64::try_from(end.offset.min(node.node_end.offset).saturating_sub(start.offset))
                    .expect("key sizes fit in i64")
            }
            None => 0,
        };
        self.mark_key_locked(
            pin,
            insert,
            true,
            insert_sectors,
            pos,
            Some(&mut delta),
            journal_seq,
            flags,
        )?;

        for k in node.keys {
            if node.is_extents {
                let Some((old_start, old_end)) = key_range(k) else {
                    continue;
                };
                let Some((new_start, new_end)) = key_range(insert) else {
                    break;
                };
                if old_start.inode != new_start.inode || new_end.offset <= old_start.offset {
                    // Keys are in node order; nothing further overlaps.
                    break;
                }
                if old_end.offset <= new_start.offset {
                    continue;
                }

                let sectors = match extent_overlap(
                    new_start.offset,
                    new_end.offset,
                    old_start.offset,
                    old_end.offset,
                ) {
                    ExtentOverlap::All => -(i64::try_from(old_end.offset - old_start.offset)
                        .expect("key sizes fit in i64")),
                    ExtentOverlap::Back => {
                        i64::try_from(old_end.offset - new_start.offset)
                            .map(|s| -s)
                            .expect("key sizes fit in i64")
                    }
                    ExtentOverlap::Front => {
                        i64::try_from(new_end.offset - old_start.offset)
                            .map(|s| -s)
                            .expect("key sizes fit in i64")
                    }
                    ExtentOverlap::Middle => {
                        // The insertion splits the old key: the right-hand
                        // part becomes a fresh key that will be written, so
                        // re-mark it as an insertion first.
                        let split = i64::try_from(old_end.offset - new_end.offset)
                            .expect("key sizes fit in i64");
                        debug_assert!(split > 0);
                        self.mark_key_locked(
                            pin,
                            k,
                            true,
                            split,
                            pos,
                            Some(&mut delta),
                            journal_seq,
                            flags,
                        )?;
                        -(i64::try_from(old_end.offset - new_start.offset)
                            .expect("key sizes fit in i64"))
                    }
                };
                debug_assert!(sectors < 0);
                self.mark_key_locked(
                    pin,
                    k,
                    false,
                    sectors,
                    pos,
                    Some(&mut delta),
                    journal_seq,
                    flags,
                )?;
            } else {
                if k.pos() != insert.pos() {
                    break;
                }
                self.mark_key_locked(pin, k, false, 0, pos, Some(&mut delta), journal_seq, flags)?;
            }
        }

        self.fs_usage_apply(pin, &mut delta, Some(res), pos);
        Ok(())
    }

    // ─── Allocator-facing transitions ───────────────────────────────────────

    /// Invalidate an available bucket: the allocator takes ownership, the
    /// contents are discarded and the generation is bumped so outstanding
    /// pointers go stale. Returns the old mark so the caller can see what
    /// was discarded; the cached sectors it held are charged back out of the
    /// cached totals here.
    pub fn invalidate_bucket(&self, pin: &MarkPin<'_>, dev: &Arc<Dev>, b: BucketIndex) -> BucketMark {
        let table = dev.bucket_table(false);
        let Some(mark) = table.mark(b) else {
            self.inconsistent(&format!("invalidating out-of-range bucket {}", b.0));
            return BucketMark::EMPTY;
        };

        let (old, new) = mark.update(|m| {
            m.with_owned_by_allocator(true)
                .with_data_type(DataType::None)
                .with_dirty_sectors(0)
                .with_cached_sectors(0)
                .with_gen(m.gen().wrapping_add(1))
        });
        if !old.is_available() {
            self.inconsistent(&format!("invalidated unavailable bucket {}", b.0));
        }

        let mut sink = FsUsage::default();
        self.dev_usage_update(dev, pin, &mut sink, old, new, false);
        sink.s.cached -= i64::from(old.cached_sectors());
        sink.replicas[0].data[dt(DataType::Cached)] -= i64::from(old.cached_sectors());
        self.usage_counters(false).fold(pin.shard(), &sink);

        if !old.owned_by_allocator() && old.cached_sectors() > 0 {
            trace!(
                target: "sfs::accounting::engine",
                dev = dev.idx().0,
                bucket = b.0,
                cached_sectors = old.cached_sectors(),
                "invalidated bucket holding cached data"
            );
        }
        old
    }

    /// Set or clear allocator ownership of a bucket.
    pub fn mark_alloc_bucket(
        &self,
        pin: &MarkPin<'_>,
        dev: &Arc<Dev>,
        b: BucketIndex,
        owned_by_allocator: bool,
        pos: GcPos,
        flags: MarkFlags,
    ) {
        if !flags.gc {
            self.mark_alloc_bucket_world(pin, dev, b, owned_by_allocator, false);
        }
        if flags.gc || self.gc.visited(pos) {
            self.mark_alloc_bucket_world(pin, dev, b, owned_by_allocator, true);
        }
    }

    fn mark_alloc_bucket_world(
        &self,
        pin: &MarkPin<'_>,
        dev: &Arc<Dev>,
        b: BucketIndex,
        owned: bool,
        gc: bool,
    ) {
        let table = dev.bucket_table(gc);
        if gc && table.nbuckets() == 0 {
            return;
        }
        let Some(mark) = table.mark(b) else {
            self.inconsistent(&format!("alloc mark on out-of-range bucket {}", b.0));
            return;
        };

        let (old, new) = mark.update(|m| m.with_owned_by_allocator(owned));
        if !gc && !owned && !old.owned_by_allocator() {
            self.inconsistent(&format!(
                "clearing allocator ownership of bucket {} the allocator does not own",
                b.0
            ));
        }

        let mut sink = FsUsage::default();
        self.dev_usage_update(dev, pin, &mut sink, old, new, gc);
        self.usage_counters(gc).fold(pin.shard(), &sink);
    }

    /// Mark a superblock or journal bucket.
    pub fn mark_metadata_bucket(
        &self,
        pin: &MarkPin<'_>,
        dev: &Arc<Dev>,
        b: BucketIndex,
        data_type: DataType,
        sectors: u32,
        pos: GcPos,
        flags: MarkFlags,
    ) {
        debug_assert!(matches!(data_type, DataType::Sb | DataType::Journal));

        if !flags.gc {
            self.mark_metadata_world(pin, dev, b, data_type, sectors, flags, false);
        }
        if flags.gc || self.gc.visited(pos) {
            self.mark_metadata_world(pin, dev, b, data_type, sectors, flags, true);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_metadata_world(
        &self,
        pin: &MarkPin<'_>,
        dev: &Arc<Dev>,
        b: BucketIndex,
        data_type: DataType,
        sectors: u32,
        flags: MarkFlags,
        gc: bool,
    ) {
        let table = dev.bucket_table(gc);
        if gc && table.nbuckets() == 0 {
            return;
        }
        let Some(mark) = table.mark(b) else {
            self.inconsistent(&format!("metadata mark on out-of-range bucket {}", b.0));
            return;
        };

        let update = |m: BucketMark| {
            Some(
                m.with_data_type(data_type)
                    .checked_add_dirty(i64::from(sectors))
                    .unwrap_or_else(|| {
                        panic!(
                            "bucket {} sector count overflow marking {}",
                            b.0,
                            data_type.name()
                        )
                    }),
            )
        };
        let result = if flags.noatomic {
            mark.try_update_nonatomic(update)
        } else {
            mark.try_update(update)
        };
        let Some((old, new)) = result else { return };

        let mut sink = FsUsage::default();
        self.dev_usage_update(dev, pin, &mut sink, old, new, gc);
        sink.replicas[0].data[dt(data_type)] += i64::from(sectors);
        self.usage_counters(gc).fold(pin.shard(), &sink);
    }
}

/// The keyspace range of a ranged key (extents and persistent
/// reservations); `None` for point keys.
fn key_range(k: &Key) -> Option<(KeyPos, KeyPos)> {
    match k {
        Key::Extent(e) => Some((e.start_pos(), e.end)),
        Key::Reservation { end, size, .. } => Some((
            KeyPos::new(end.inode, end.offset - u64::from(*size)),
            *end,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed(uncompressed: u32, compressed: u32, live: u32) -> PtrCrc {
        PtrCrc {
            uncompressed_size: uncompressed,
            compressed_size: compressed,
            live_size: live,
            compressed: true,
        }
    }

    #[test]
    fn uncompressed_deltas_pass_through() {
        let crc = PtrCrc::uncompressed(100);
        assert_eq!(ptr_disk_sectors_delta(&crc, 100), 100);
        assert_eq!(ptr_disk_sectors_delta(&crc, -40), -40);
    }

    #[test]
    fn compressed_deltas_scale_by_the_envelope() {
        // 2:1 compression over a fully live extent.
        let crc = compressed(100, 50, 100);
        assert_eq!(ptr_disk_sectors_delta(&crc, 100), 50);
        // Removing 40 live sectors: scaled(60) - scaled(100) = 30 - 50.
        assert_eq!(ptr_disk_sectors_delta(&crc, -40), -20);
        // Rounding goes up for insertions.
        let crc = compressed(3, 2, 3);
        assert_eq!(ptr_disk_sectors_delta(&crc, 1), 1);
        assert_eq!(ptr_disk_sectors_delta(&crc, 3), 2);
    }

    #[test]
    fn fragmentation_counts_only_settled_user_buckets() {
        let dirty = BucketMark::EMPTY
            .with_data_type(DataType::User)
            .with_dirty_sectors(100);
        assert_eq!(is_fragmented(512, dirty), 412);

        let owned = dirty.with_owned_by_allocator(true);
        assert_eq!(is_fragmented(512, owned), 0);

        let meta = BucketMark::EMPTY
            .with_data_type(DataType::Btree)
            .with_dirty_sectors(100);
        assert_eq!(is_fragmented(512, meta), 0);

        assert_eq!(is_fragmented(512, BucketMark::EMPTY), 0);
    }

    #[test]
    fn ranged_keys_expose_their_span() {
        let e = Key::Extent(sfs_types::ExtentKey {
            end: KeyPos::new(1, 100),
            size: 60,
            ptrs: Vec::new(),
        });
        assert_eq!(
            key_range(&e),
            Some((KeyPos::new(1, 40), KeyPos::new(1, 100)))
        );

        let r = Key::Reservation {
            end: KeyPos::new(2, 50),
            size: 50,
            nr_replicas: 1,
        };
        assert_eq!(key_range(&r), Some((KeyPos::new(2, 0), KeyPos::new(2, 50))));

        assert_eq!(key_range(&Key::InodeAlloc { pos: KeyPos::MIN }), None);
    }

    #[test]
    fn bucket_transition_delta_is_symmetric() {
        let mark = BucketMark::EMPTY
            .with_data_type(DataType::User)
            .with_dirty_sectors(64)
            .with_cached_sectors(8);

        let mut du = DevUsage::default();
        let mut sink = FsUsage::default();
        dev_usage_delta(512, BucketMark::EMPTY, mark, &mut du, &mut sink);
        dev_usage_delta(512, mark, BucketMark::EMPTY, &mut du, &mut sink);

        assert_eq!(du, DevUsage::default());
        assert_eq!(sink, FsUsage::default());
    }
}

