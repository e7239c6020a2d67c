//! The GC sweep cursor.
//!
//! Garbage collection rebuilds canonical accounting by walking the keyspace
//! while writes continue. Instead of halting writers, a full shadow set of
//! counters (the gc world) is maintained: a marking call updates the live
//! world first and then the gc world iff GC's cursor has already swept past
//! the key's position — once GC has walked a position, the gc world is
//! responsible for reflecting later changes there.
//!
//! [`GcCursor::visited`] must be evaluated while the caller holds the mark
//! lock in read mode: GC only resets the gc world and moves the cursor out of
//! `Start` under the mark lock in write mode, so the predicate cannot flip
//! between a marking call's live and gc updates.

use parking_lot::RwLock;
use sfs_types::GcPos;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct GcCursor {
    running: AtomicBool,
    pos: RwLock<GcPos>,
}

impl GcCursor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            pos: RwLock::new(GcPos::start()),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Has GC already swept strictly past `pos`?
    ///
    /// Callers hold the mark-lock read pin; see the module docs for why that
    /// makes the answer stable across a marking call.
    #[must_use]
    pub fn visited(&self, pos: GcPos) -> bool {
        self.running.load(Ordering::Acquire) && *self.pos.read() > pos
    }

    /// Begin a sweep. The caller (the filesystem handle) holds the gc lock
    /// and the mark lock in write mode and has just reset the gc world.
    pub fn start(&self) {
        *self.pos.write() = GcPos::start();
        self.running.store(true, Ordering::Release);
        debug!(target: "sfs::accounting::gc", "gc_sweep_start");
    }

    /// Advance the cursor. Positions may only move forward.
    pub fn advance(&self, pos: GcPos) {
        let mut cur = self.pos.write();
        debug_assert!(pos >= *cur, "gc cursor moved backwards");
        *cur = pos;
    }

    /// End the sweep; the gc world stops receiving updates.
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
        *self.pos.write() = GcPos::start();
        debug!(target: "sfs::accounting::gc", "gc_sweep_finish");
    }
}

impl Default for GcCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::{BtreeId, KeyPos};

    #[test]
    fn not_running_visits_nothing() {
        let gc = GcCursor::new();
        assert!(!gc.visited(GcPos::start()));
        assert!(!gc.visited(GcPos::btree(BtreeId::Extents, KeyPos::MIN)));
    }

    #[test]
    fn visited_is_strictly_behind_the_cursor() {
        let gc = GcCursor::new();
        gc.start();
        let early = GcPos::btree(BtreeId::Extents, KeyPos::new(1, 100));
        let late = GcPos::btree(BtreeId::Alloc, KeyPos::MIN);

        assert!(!gc.visited(early));
        gc.advance(early);
        // The cursor sits *at* early: not yet strictly past it.
        assert!(!gc.visited(early));
        gc.advance(late);
        assert!(gc.visited(early));
        assert!(!gc.visited(late));

        gc.finish();
        assert!(!gc.visited(early));
    }
}
