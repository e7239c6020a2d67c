//! Bucket journal-sequence cleanup.
//!
//! Each mark stores the last journal sequence that touched the bucket,
//! truncated to [`BUCKET_JOURNAL_SEQ_BITS`] bits. Once the journal has
//! flushed past that sequence the stamp is no longer needed; left alone it
//! would eventually wrap and falsely claim the bucket was touched recently.
//! This sweep clears stale stamps, throttled to run at most once per quarter
//! of the sequence space.

use sfs_types::{bucket_journal_seq_after, BucketMark, BUCKET_JOURNAL_SEQ_BITS};
use std::sync::atomic::Ordering;
use tracing::debug;

use crate::Fs;

fn truncate_seq(seq: u64) -> u32 {
    (seq & ((1 << BUCKET_JOURNAL_SEQ_BITS) - 1)) as u32
}

/// Does this bucket still need its journal sequence flushed before it can be
/// reused?
#[must_use]
pub fn bucket_needs_journal_commit(m: BucketMark, last_seq_ondisk: u64) -> bool {
    m.journal_seq_valid() && bucket_journal_seq_after(m.journal_seq(), truncate_seq(last_seq_ondisk))
}

impl Fs {
    /// Clear `journal_seq_valid` on buckets whose stamped sequence is
    /// already on disk. `journal_seq` is the journal's current sequence,
    /// `last_seq_ondisk` the newest sequence known flushed.
    pub fn bucket_seq_cleanup(&self, journal_seq: u64, last_seq_ondisk: u64) {
        let last = self.last_bucket_seq_cleanup.load(Ordering::Acquire);
        if journal_seq.wrapping_sub(last) < (1 << (BUCKET_JOURNAL_SEQ_BITS - 2)) {
            return;
        }
        if self
            .last_bucket_seq_cleanup
            .compare_exchange(last, journal_seq, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another sweep won the throttle window.
            return;
        }

        let mut cleared = 0_u64;
        for dev in self.devs() {
            let _bl = dev.bucket_read();
            let table = dev.bucket_table(false);
            for (_b, mark) in table.iter() {
                let updated = mark.try_update(|m| {
                    if !m.journal_seq_valid() || bucket_needs_journal_commit(m, last_seq_ondisk) {
                        return None;
                    }
                    Some(m.with_journal_seq_invalid())
                });
                if updated.is_some() {
                    cleared += 1;
                }
            }
        }
        debug!(
            target: "sfs::accounting",
            journal_seq,
            last_seq_ondisk,
            cleared,
            "bucket journal-seq cleanup"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountingConfig, DevConfig, Fs};
    use sfs_types::BucketIndex;

    fn fs_with_dev() -> (Fs, std::sync::Arc<crate::Dev>) {
        let fs = Fs::new(AccountingConfig {
            shards: 2,
            btree_node_size: 256,
        });
        let dev = fs
            .dev_buckets_alloc(DevConfig {
                first_bucket: 0,
                nbuckets: 16,
                bucket_size: 512,
            })
            .unwrap();
        (fs, dev)
    }

    #[test]
    fn needs_commit_respects_wraparound() {
        let m = BucketMark::EMPTY.with_journal_seq(100);
        assert!(bucket_needs_journal_commit(m, 50));
        assert!(!bucket_needs_journal_commit(m, 100));
        assert!(!bucket_needs_journal_commit(m, 150));
        assert!(!bucket_needs_journal_commit(BucketMark::EMPTY, 0));
    }

    #[test]
    fn cleanup_clears_flushed_stamps_only() {
        let (fs, dev) = fs_with_dev();
        let table = dev.bucket_table(false);
        table
            .mark(BucketIndex(1))
            .unwrap()
            .update(|m| m.with_journal_seq(100));
        table
            .mark(BucketIndex(2))
            .unwrap()
            .update(|m| m.with_journal_seq(900));

        // Journal progressed far enough to pass the throttle; seq 100 is on
        // disk, 900 is not.
        fs.bucket_seq_cleanup(1 << (BUCKET_JOURNAL_SEQ_BITS - 2), 500);

        assert!(!table.mark(BucketIndex(1)).unwrap().load().journal_seq_valid());
        let m2 = table.mark(BucketIndex(2)).unwrap().load();
        assert!(m2.journal_seq_valid());
        assert_eq!(m2.journal_seq(), 900);
    }

    #[test]
    fn cleanup_is_throttled() {
        let (fs, dev) = fs_with_dev();
        let table = dev.bucket_table(false);
        table
            .mark(BucketIndex(1))
            .unwrap()
            .update(|m| m.with_journal_seq(10));

        // Not enough journal progress since the last sweep (at seq 0).
        fs.bucket_seq_cleanup(100, 50);
        assert!(table.mark(BucketIndex(1)).unwrap().load().journal_seq_valid());
    }
}
