use std::time::Duration;

use bitflags::bitflags;

use crate::constants::{DbFlags, EnvFlags};

/// Size bounds and growth policy of the data file.
///
/// `None` keeps the current value, or the default when the file is created.
/// Sizes are in bytes and are rounded to whole pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub size_lower: Option<usize>,
    pub size_now: Option<usize>,
    pub size_upper: Option<usize>,
    pub growth_step: Option<usize>,
    pub shrink_threshold: Option<usize>,
    pub page_size: Option<usize>,
}

impl Geometry {
    pub fn new() -> Self {
        Geometry::default()
    }

    pub fn lower(mut self, bytes: usize) -> Self {
        self.size_lower = Some(bytes);
        self
    }

    pub fn now(mut self, bytes: usize) -> Self {
        self.size_now = Some(bytes);
        self
    }

    pub fn upper(mut self, bytes: usize) -> Self {
        self.size_upper = Some(bytes);
        self
    }

    pub fn growth(mut self, bytes: usize) -> Self {
        self.growth_step = Some(bytes);
        self
    }

    pub fn shrink(mut self, bytes: usize) -> Self {
        self.shrink_threshold = Some(bytes);
        self
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = Some(bytes);
        self
    }
}

/// Table statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    /// Transaction that last modified the table
    pub mod_txnid: u64,
}

/// Geometry as currently applied, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub lower: u64,
    pub upper: u64,
    pub current: u64,
    pub shrink: u64,
    pub grow: u64,
}

/// Page operation counters, accumulated since the environment was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PgOpStat {
    /// Pages taken from the end of the file
    pub newly: u64,
    /// Pages copied on write
    pub cow: u64,
    pub clone: u64,
    pub split: u64,
    pub merge: u64,
    pub spill: u64,
    pub unspill: u64,
    /// Write operations issued at commit
    pub wops: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub txnid: u64,
    /// Checksum of the meta record
    pub sign: u64,
    /// Written after its data reached the disk
    pub steady: bool,
}

/// Environment information
#[derive(Debug, Clone, Default)]
pub struct EnvInfo {
    pub geo: GeoInfo,
    pub map_size: u64,
    pub last_pgno: u64,
    pub recent_txnid: u64,
    /// Oldest snapshot still pinned by a reader
    pub latter_reader_txnid: u64,
    pub self_latter_reader_txnid: u64,
    pub meta: [MetaInfo; 2],
    pub max_readers: u32,
    pub num_readers: u32,
    pub page_size: u32,
    pub sys_page_size: u32,
    pub unsync_volume: u64,
    pub autosync_threshold: u64,
    pub since_sync: Duration,
    pub autosync_period: Duration,
    pub mode: EnvFlags,
    pub pgop_stat: PgOpStat,
}

/// Transaction information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxInfo {
    pub id: u64,
    /// Commits made since this snapshot was taken (readers only)
    pub reader_lag: u64,
    /// Bytes used by the snapshot
    pub space_used: u64,
    pub space_limit_soft: u64,
    pub space_limit_hard: u64,
    /// Bytes released by this write transaction
    pub space_retired: u64,
    /// Bytes still available before the upper bound
    pub space_leftover: u64,
    /// Bytes held in dirty pages
    pub space_dirty: u64,
}

/// Time spent in each commit stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitLatency {
    pub preparation: Duration,
    pub gc: Duration,
    pub audit: Duration,
    pub write: Duration,
    pub sync: Duration,
    pub ending: Duration,
    pub whole: Duration,
}

/// Application-defined marker stored with each commit.
///
/// `x`, `y` and `z` are set by the caller; `v` is stamped with the id of the
/// transaction that committed them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canary {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub v: u64,
}

/// One live reader slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub thread: String,
    /// Snapshot held, `None` while the transaction is reset
    pub txnid: Option<u64>,
    pub lag: u64,
}

/// Runtime tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvOption {
    MaxDb,
    MaxReaders,
    SyncBytes,
    /// In 1/65536 of a second
    SyncPeriod,
    RpAugmentLimit,
    LooseLimit,
    DpReserveLimit,
    TxnDpLimit,
    TxnDpInitial,
    SpillMaxDenominator,
    SpillMinDenominator,
    SpillParent4ChildDenominator,
    MergeThreshold16Dot16Percent,
}

bitflags! {
    /// State of a table handle within a transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbiState: u32 {
        const DIRTY = 0x01;
        const STALE = 0x02;
        const FRESH = 0x04;
        const CREAT = 0x08;
    }
}

/// Table flags together with the handle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFlags {
    pub flags: DbFlags,
    pub state: DbiState,
}
