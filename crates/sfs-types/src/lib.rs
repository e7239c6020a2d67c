#![forbid(unsafe_code)]
//! Core value types for the StrataFS bucket accounting core.
//!
//! Defines the packed per-bucket mark word, the data-type taxonomy, GC cursor
//! positions, and the decoded key/pointer descriptors the marking engine
//! consumes. Everything here is a plain value; the atomics and locks live in
//! `sfs-accounting`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a sector in bytes. All size fields in this workspace count sectors.
pub const SECTOR_SIZE: u32 = 512;

/// Maximum replication level tracked by the usage counters.
pub const MAX_REPLICAS: usize = 4;

/// Maximum number of blocks in an erasure-coded stripe.
pub const EC_STRIPE_MAX: usize = 16;

/// Width of the truncated journal sequence stored in a bucket mark.
pub const BUCKET_JOURNAL_SEQ_BITS: u32 = 19;

// ─── Newtypes ───────────────────────────────────────────────────────────────

/// Index of a device within the filesystem's member array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

/// Index of a bucket within a device's bucket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIndex(pub u64);

/// Position of a key in the keyspace: (inode, offset) pairs ordered
/// lexicographically, offsets in sectors.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

impl KeyPos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }
}

// ─── Data types ─────────────────────────────────────────────────────────────

/// Number of distinct bucket data types (including `None`).
pub const NR_DATA_TYPES: usize = 6;

/// What a bucket (or a set of sectors) holds.
///
/// Stored in 4 bits of the bucket mark; the discriminants are the on-mark
/// encoding and must not change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DataType {
    #[default]
    None = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
}

impl DataType {
    /// Decode from the 4-bit mark field.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Sb),
            2 => Some(Self::Journal),
            3 => Some(Self::Btree),
            4 => Some(Self::User),
            5 => Some(Self::Cached),
            _ => None,
        }
    }

    #[must_use]
    pub const fn to_bits(self) -> u8 {
        self as u8
    }

    /// Index into the per-data-type counter arrays.
    #[must_use]
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Superblock, journal and btree buckets are metadata: never invalidable.
    #[must_use]
    pub const fn is_metadata(self) -> bool {
        matches!(self, Self::Sb | Self::Journal | Self::Btree)
    }

    /// All data types, in counter-array order.
    pub const ALL: [Self; NR_DATA_TYPES] = [
        Self::None,
        Self::Sb,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
    ];

    /// Human-readable name, for inconsistency reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sb => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
        }
    }
}

// ─── Generation comparison ──────────────────────────────────────────────────

/// Wraparound-aware comparison of 8-bit bucket generations.
///
/// Returns true if `a` is newer than `b`, treating the generation space as a
/// circle: distances of up to 127 forward count as "after".
#[must_use]
#[inline]
pub const fn gen_after(a: u8, b: u8) -> bool {
    (a.wrapping_sub(b) as i8) > 0
}

/// Wraparound-aware comparison of truncated journal sequences
/// ([`BUCKET_JOURNAL_SEQ_BITS`] wide).
#[must_use]
#[inline]
pub const fn bucket_journal_seq_after(a: u32, b: u32) -> bool {
    let shift = 32 - BUCKET_JOURNAL_SEQ_BITS;
    ((a.wrapping_sub(b) << shift) as i32) > 0
}

// ─── Bucket mark ────────────────────────────────────────────────────────────

/// Maximum value of the 15-bit packed sector counters.
pub const BUCKET_SECTORS_MAX: u32 = (1 << 15) - 1;

const GEN_SHIFT: u32 = 0;
const GEN_BITS: u32 = 8;
const DATA_TYPE_SHIFT: u32 = 8;
const DATA_TYPE_BITS: u32 = 4;
const OWNED_SHIFT: u32 = 12;
const DIRTY_SHIFT: u32 = 13;
const SECTORS_BITS: u32 = 15;
const CACHED_SHIFT: u32 = 28;
const STRIPE_SHIFT: u32 = 43;
const SEQ_VALID_SHIFT: u32 = 44;
const SEQ_SHIFT: u32 = 45;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// The packed per-bucket state record.
///
/// The whole record is 64 bits wide and is always read and written as a
/// single unit; `sfs-accounting` wraps it in an `AtomicU64` so concurrent
/// writers serialize through compare-and-swap. Layout, LSB first:
///
/// | field              | bits |
/// |--------------------|------|
/// | `gen`              | 8    |
/// | `data_type`        | 4    |
/// | `owned_by_allocator` | 1  |
/// | `dirty_sectors`    | 15   |
/// | `cached_sectors`   | 15   |
/// | `stripe`           | 1    |
/// | `journal_seq_valid`| 1    |
/// | `journal_seq`      | 19   |
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketMark(u64);

impl BucketMark {
    /// The all-zero mark: a free bucket.
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    // ── Field accessors ──

    #[must_use]
    pub const fn gen(self) -> u8 {
        ((self.0 >> GEN_SHIFT) & mask(GEN_BITS)) as u8
    }

    #[must_use]
    pub fn data_type(self) -> DataType {
        let bits = ((self.0 >> DATA_TYPE_SHIFT) & mask(DATA_TYPE_BITS)) as u8;
        // Only this crate's setters can produce the field, so the encoding is
        // always in range.
        DataType::from_bits(bits).unwrap_or(DataType::None)
    }

    #[must_use]
    pub const fn owned_by_allocator(self) -> bool {
        (self.0 >> OWNED_SHIFT) & 1 != 0
    }

    #[must_use]
    pub const fn dirty_sectors(self) -> u32 {
        ((self.0 >> DIRTY_SHIFT) & mask(SECTORS_BITS)) as u32
    }

    #[must_use]
    pub const fn cached_sectors(self) -> u32 {
        ((self.0 >> CACHED_SHIFT) & mask(SECTORS_BITS)) as u32
    }

    #[must_use]
    pub const fn stripe(self) -> bool {
        (self.0 >> STRIPE_SHIFT) & 1 != 0
    }

    #[must_use]
    pub const fn journal_seq_valid(self) -> bool {
        (self.0 >> SEQ_VALID_SHIFT) & 1 != 0
    }

    /// Truncated journal sequence; meaningful only when
    /// [`journal_seq_valid`](Self::journal_seq_valid) is set.
    #[must_use]
    pub const fn journal_seq(self) -> u32 {
        ((self.0 >> SEQ_SHIFT) & mask(BUCKET_JOURNAL_SEQ_BITS)) as u32
    }

    // ── Setters (with-style; the CAS combinator mutates a local copy) ──

    #[must_use]
    pub const fn with_gen(self, gen: u8) -> Self {
        Self(self.0 & !(mask(GEN_BITS) << GEN_SHIFT) | ((gen as u64) << GEN_SHIFT))
    }

    #[must_use]
    pub fn with_data_type(self, t: DataType) -> Self {
        Self(
            self.0 & !(mask(DATA_TYPE_BITS) << DATA_TYPE_SHIFT)
                | ((t.to_bits() as u64) << DATA_TYPE_SHIFT),
        )
    }

    #[must_use]
    pub const fn with_owned_by_allocator(self, owned: bool) -> Self {
        Self(self.0 & !(1u64 << OWNED_SHIFT) | ((owned as u64) << OWNED_SHIFT))
    }

    #[must_use]
    pub const fn with_dirty_sectors(self, sectors: u32) -> Self {
        debug_assert!(sectors <= BUCKET_SECTORS_MAX);
        Self(self.0 & !(mask(SECTORS_BITS) << DIRTY_SHIFT) | ((sectors as u64) << DIRTY_SHIFT))
    }

    #[must_use]
    pub const fn with_cached_sectors(self, sectors: u32) -> Self {
        debug_assert!(sectors <= BUCKET_SECTORS_MAX);
        Self(self.0 & !(mask(SECTORS_BITS) << CACHED_SHIFT) | ((sectors as u64) << CACHED_SHIFT))
    }

    #[must_use]
    pub const fn with_stripe(self, stripe: bool) -> Self {
        Self(self.0 & !(1u64 << STRIPE_SHIFT) | ((stripe as u64) << STRIPE_SHIFT))
    }

    #[must_use]
    pub const fn with_journal_seq(self, seq: u64) -> Self {
        let truncated = seq & mask(BUCKET_JOURNAL_SEQ_BITS);
        Self(
            self.0 & !(mask(BUCKET_JOURNAL_SEQ_BITS) << SEQ_SHIFT) | (truncated << SEQ_SHIFT)
                | (1u64 << SEQ_VALID_SHIFT),
        )
    }

    #[must_use]
    pub const fn with_journal_seq_invalid(self) -> Self {
        Self(self.0 & !(1u64 << SEQ_VALID_SHIFT))
    }

    /// Add a signed sector count to `dirty_sectors`.
    ///
    /// Returns `None` if the result would underflow zero or overflow the
    /// 15-bit field; either is accounting corruption.
    #[must_use]
    pub fn checked_add_dirty(self, delta: i64) -> Option<Self> {
        let new = i64::from(self.dirty_sectors()).checked_add(delta)?;
        if !(0..=i64::from(BUCKET_SECTORS_MAX)).contains(&new) {
            return None;
        }
        Some(self.with_dirty_sectors(new as u32))
    }

    /// Add a signed sector count to `cached_sectors`; same bounds as
    /// [`checked_add_dirty`](Self::checked_add_dirty).
    #[must_use]
    pub fn checked_add_cached(self, delta: i64) -> Option<Self> {
        let new = i64::from(self.cached_sectors()).checked_add(delta)?;
        if !(0..=i64::from(BUCKET_SECTORS_MAX)).contains(&new) {
            return None;
        }
        Some(self.with_cached_sectors(new as u32))
    }

    // ── Derived states ──

    /// Free: the mark is all-zero.
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn sectors_used(self) -> u32 {
        self.dirty_sectors() + self.cached_sectors()
    }

    /// Available buckets hold nothing we have to keep: free, or only cached
    /// copies. Invalidation requires this state.
    #[must_use]
    pub fn is_available(self) -> bool {
        !self.owned_by_allocator() && self.dirty_sectors() == 0 && !self.data_type().is_metadata()
    }

    #[must_use]
    pub fn is_unavailable(self) -> bool {
        !self.is_available()
    }

    /// The data type this bucket counts as for bucket-granularity accounting.
    ///
    /// A bucket holding only cached sectors counts as `Cached` regardless of
    /// the stored `data_type` (only a keyspace traversal can tell a truly
    /// cached bucket from one whose dirty copy lives elsewhere).
    #[must_use]
    pub fn bucket_type(self) -> DataType {
        if self.cached_sectors() > 0 && self.dirty_sectors() == 0 {
            DataType::Cached
        } else {
            self.data_type()
        }
    }
}

impl fmt::Debug for BucketMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketMark")
            .field("gen", &self.gen())
            .field("data_type", &self.data_type())
            .field("owned_by_allocator", &self.owned_by_allocator())
            .field("dirty_sectors", &self.dirty_sectors())
            .field("cached_sectors", &self.cached_sectors())
            .field("stripe", &self.stripe())
            .field("journal_seq_valid", &self.journal_seq_valid())
            .field("journal_seq", &self.journal_seq())
            .finish()
    }
}

// ─── GC positions ───────────────────────────────────────────────────────────

/// Btrees the GC sweep walks, in sweep order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BtreeId {
    Extents,
    Inodes,
    Alloc,
    Stripes,
}

/// Phase of the GC sweep; ordered so cursor comparison is a plain `Ord`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum GcPhase {
    /// GC has not visited anything yet.
    Start,
    /// GC is walking the given btree.
    Btree(BtreeId),
    /// GC has swept the whole keyspace.
    Done,
}

/// A point in the GC sweep order. `gc_visited(pos)` is `cursor >= pos`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GcPos {
    pub phase: GcPhase,
    pub pos: KeyPos,
}

impl GcPos {
    /// Before everything: nothing compares `<=` to this except itself.
    #[must_use]
    pub const fn start() -> Self {
        Self {
            phase: GcPhase::Start,
            pos: KeyPos::MIN,
        }
    }

    /// The position of a btree node boundary.
    #[must_use]
    pub const fn btree(btree: BtreeId, pos: KeyPos) -> Self {
        Self {
            phase: GcPhase::Btree(btree),
            pos,
        }
    }

    /// After everything.
    #[must_use]
    pub const fn done() -> Self {
        Self {
            phase: GcPhase::Done,
            pos: KeyPos::MAX,
        }
    }
}

// ─── Decoded keys and pointers ──────────────────────────────────────────────

/// Checksum/compression envelope of an extent pointer.
///
/// `live_size` is the portion of the (uncompressed) extent still referenced
/// by the key; `compressed_size`/`uncompressed_size` describe the on-disk
/// encoding and drive disk-sector scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtrCrc {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub live_size: u32,
    pub compressed: bool,
}

impl PtrCrc {
    /// An uncompressed envelope covering `size` live sectors.
    #[must_use]
    pub const fn uncompressed(size: u32) -> Self {
        Self {
            uncompressed_size: size,
            compressed_size: size,
            live_size: size,
            compressed: false,
        }
    }
}

/// A raw extent pointer: device, sector offset on that device, generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Sector offset on the device; the bucket is `offset / bucket_size`.
    pub offset: u64,
    pub gen: u8,
    /// Cached pointers reference a discardable copy.
    pub cached: bool,
}

/// Reference from an extent pointer into an erasure-coded stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeRef {
    pub idx: u64,
    pub block: u8,
}

/// A fully decoded extent pointer, as handed to the marking engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPtr {
    pub ptr: ExtentPtr,
    pub crc: PtrCrc,
    pub stripes: Vec<StripeRef>,
}

impl DecodedPtr {
    /// A plain uncompressed, non-ec pointer covering `size` sectors.
    #[must_use]
    pub fn plain(ptr: ExtentPtr, size: u32) -> Self {
        Self {
            ptr,
            crc: PtrCrc::uncompressed(size),
            stripes: Vec::new(),
        }
    }
}

/// How a newly inserted extent overlaps an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentOverlap {
    /// The existing key lies entirely inside the new key.
    All,
    /// The new key covers the tail of the existing key.
    Back,
    /// The new key covers the head of the existing key.
    Front,
    /// The new key splits the existing key in two.
    Middle,
}

/// Classify how an inserted range overlaps an existing one. Both ranges are
/// offsets within the same inode and must actually intersect.
#[must_use]
pub fn extent_overlap(
    new_start: u64,
    new_end: u64,
    old_start: u64,
    old_end: u64,
) -> ExtentOverlap {
    match (new_start > old_start, new_end < old_end) {
        (false, false) => ExtentOverlap::All,
        (true, false) => ExtentOverlap::Back,
        (false, true) => ExtentOverlap::Front,
        (true, true) => ExtentOverlap::Middle,
    }
}

/// A decoded extent key: its keyspace range plus its pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Position of the key, which is its *end*: the range is
    /// `[end.offset - size, end.offset)` within `end.inode`.
    pub end: KeyPos,
    pub size: u32,
    pub ptrs: Vec<DecodedPtr>,
}

impl ExtentKey {
    #[must_use]
    pub const fn start_offset(&self) -> u64 {
        self.end.offset - self.size as u64
    }

    #[must_use]
    pub const fn start_pos(&self) -> KeyPos {
        KeyPos {
            inode: self.end.inode,
            offset: self.start_offset(),
        }
    }

    /// Classify how `self` (the key being inserted) overlaps `old`.
    ///
    /// Both keys must belong to the same inode and actually overlap.
    #[must_use]
    pub fn overlap(&self, old: &ExtentKey) -> ExtentOverlap {
        debug_assert_eq!(self.end.inode, old.end.inode);
        extent_overlap(
            self.start_offset(),
            self.end.offset,
            old.start_offset(),
            old.end.offset,
        )
    }
}

/// A decoded stripe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeKey {
    pub idx: u64,
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    /// One pointer per stripe block, `nr_blocks` long.
    pub ptrs: Vec<ExtentPtr>,
}

/// The key kinds the marking engine accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    /// A btree node pointer; marked with `±btree_node_size` sectors.
    BtreePtr { ptrs: Vec<DecodedPtr> },
    /// A user-data extent.
    Extent(ExtentKey),
    /// An erasure-coded stripe record.
    Stripe(StripeKey),
    /// Inode allocation; adjusts `nr_inodes` only.
    InodeAlloc { pos: KeyPos },
    /// A persistent reservation placeholder: sectors promised but unwritten.
    /// Lives in the extents btree, so it is ranged like an extent but
    /// carries no pointers.
    Reservation {
        end: KeyPos,
        size: u32,
        nr_replicas: u8,
    },
}

impl Key {
    /// The keyspace position, used for overwrite detection in non-extent
    /// btrees.
    #[must_use]
    pub fn pos(&self) -> KeyPos {
        match self {
            Self::BtreePtr { .. } => KeyPos::MIN,
            Self::Extent(e) => e.end,
            Self::Stripe(s) => KeyPos::new(0, s.idx),
            Self::InodeAlloc { pos } => *pos,
            Self::Reservation { end, .. } => *end,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_roundtrips_every_field() {
        let m = BucketMark::EMPTY
            .with_gen(0xAB)
            .with_data_type(DataType::User)
            .with_owned_by_allocator(true)
            .with_dirty_sectors(12345)
            .with_cached_sectors(321)
            .with_stripe(true)
            .with_journal_seq(0x7_1234);

        assert_eq!(m.gen(), 0xAB);
        assert_eq!(m.data_type(), DataType::User);
        assert!(m.owned_by_allocator());
        assert_eq!(m.dirty_sectors(), 12345);
        assert_eq!(m.cached_sectors(), 321);
        assert!(m.stripe());
        assert!(m.journal_seq_valid());
        assert_eq!(m.journal_seq(), 0x7_1234);

        // And every field clears back without disturbing its neighbors.
        let cleared = m
            .with_gen(0)
            .with_data_type(DataType::None)
            .with_owned_by_allocator(false)
            .with_dirty_sectors(0)
            .with_cached_sectors(0)
            .with_stripe(false)
            .with_journal_seq_invalid()
            .with_journal_seq(0)
            .with_journal_seq_invalid();
        assert_eq!(cleared.to_raw() & !(mask(BUCKET_JOURNAL_SEQ_BITS) << SEQ_SHIFT), 0);
    }

    #[test]
    fn journal_seq_is_truncated() {
        let m = BucketMark::EMPTY.with_journal_seq(u64::MAX);
        assert_eq!(m.journal_seq(), (1 << BUCKET_JOURNAL_SEQ_BITS) - 1);
        assert!(m.journal_seq_valid());
    }

    #[test]
    fn checked_adds_guard_the_field_width() {
        let m = BucketMark::EMPTY.with_dirty_sectors(BUCKET_SECTORS_MAX - 1);
        assert!(m.checked_add_dirty(1).is_some());
        assert!(m.checked_add_dirty(2).is_none());
        assert!(m.checked_add_dirty(-(i64::from(BUCKET_SECTORS_MAX))).is_none());
        assert_eq!(
            m.checked_add_dirty(-1).unwrap().dirty_sectors(),
            BUCKET_SECTORS_MAX - 2
        );

        let c = BucketMark::EMPTY.with_cached_sectors(10);
        assert!(c.checked_add_cached(-11).is_none());
        assert_eq!(c.checked_add_cached(-10).unwrap().cached_sectors(), 0);
    }

    #[test]
    fn derived_states() {
        assert!(BucketMark::EMPTY.is_free());
        assert!(BucketMark::EMPTY.is_available());

        let cached = BucketMark::EMPTY
            .with_data_type(DataType::User)
            .with_cached_sectors(8);
        assert!(cached.is_available());
        assert_eq!(cached.bucket_type(), DataType::Cached);

        let dirty = BucketMark::EMPTY
            .with_data_type(DataType::User)
            .with_dirty_sectors(8);
        assert!(dirty.is_unavailable());
        assert_eq!(dirty.bucket_type(), DataType::User);

        let owned = BucketMark::EMPTY.with_owned_by_allocator(true);
        assert!(owned.is_unavailable());

        let meta = BucketMark::EMPTY
            .with_data_type(DataType::Journal)
            .with_dirty_sectors(8);
        assert!(meta.is_unavailable());
    }

    #[test]
    fn gen_comparison_wraps() {
        assert!(gen_after(1, 0));
        assert!(gen_after(127, 0));
        assert!(!gen_after(128, 0));
        assert!(!gen_after(0, 0));
        // Across the wrap: 2 is after 250.
        assert!(gen_after(2, 250));
        assert!(!gen_after(250, 2));
    }

    #[test]
    fn bucket_journal_seq_comparison_wraps() {
        let max = (1u32 << BUCKET_JOURNAL_SEQ_BITS) - 1;
        assert!(bucket_journal_seq_after(1, 0));
        assert!(!bucket_journal_seq_after(0, 1));
        assert!(bucket_journal_seq_after(0, max));
        assert!(!bucket_journal_seq_after(max, 0));
    }

    #[test]
    fn extent_overlap_classification() {
        let key = |start: u64, end: u64| ExtentKey {
            end: KeyPos::new(1, end),
            size: (end - start) as u32,
            ptrs: Vec::new(),
        };

        let old = key(100, 200);
        assert_eq!(key(100, 200).overlap(&old), ExtentOverlap::All);
        assert_eq!(key(50, 250).overlap(&old), ExtentOverlap::All);
        assert_eq!(key(150, 250).overlap(&old), ExtentOverlap::Back);
        assert_eq!(key(50, 150).overlap(&old), ExtentOverlap::Front);
        assert_eq!(key(120, 180).overlap(&old), ExtentOverlap::Middle);
    }

    #[test]
    fn gc_pos_ordering() {
        let start = GcPos::start();
        let extents = GcPos::btree(BtreeId::Extents, KeyPos::new(1, 0));
        let extents_later = GcPos::btree(BtreeId::Extents, KeyPos::new(2, 0));
        let alloc = GcPos::btree(BtreeId::Alloc, KeyPos::MIN);
        let done = GcPos::done();

        assert!(start < extents);
        assert!(extents < extents_later);
        assert!(extents_later < alloc);
        assert!(alloc < done);
    }

    #[test]
    fn mark_serde_roundtrip() {
        let m = BucketMark::EMPTY
            .with_gen(3)
            .with_data_type(DataType::Btree)
            .with_dirty_sectors(256);
        let json = serde_json::to_string(&m).unwrap();
        let back: BucketMark = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
