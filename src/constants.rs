use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// The path names the data file itself instead of a directory.
        const NOSUBDIR = 0x4000;
        /// Open read-only. Write transactions and `sync` are rejected.
        const RDONLY = 0x20000;
        const EXCLUSIVE = 0x400000;
        /// Reuse the geometry of an existing file instead of failing on mismatch.
        const ACCEDE = 0x40000000;
        const WRITEMAP = 0x80000;
        const NOTLS = 0x200000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
        const COALESCE = 0x2000000;
        /// Reuse the most recently reclaimed pages first.
        const LIFORECLAIM = 0x4000000;
        /// Scribble over pages released inside a write transaction.
        const PAGEPERTURB = 0x8000000;
        /// Flush data on commit but not the meta page.
        const NOMETASYNC = 0x40000;
        /// Skip flushes on commit; metas are written weak until the next `sync`.
        const SAFE_NOSYNC = 0x10000;
        const UTTERLY_NOSYNC = 0x10000 | 0x100000;
    }
}

impl EnvFlags {
    /// Durable commits, the default.
    pub const SYNC_DURABLE: EnvFlags = EnvFlags::empty();

    pub(crate) fn skips_data_sync(self) -> bool {
        self.contains(EnvFlags::SAFE_NOSYNC)
    }

    pub(crate) fn skips_meta_sync(self) -> bool {
        self.intersects(EnvFlags::NOMETASYNC | EnvFlags::SAFE_NOSYNC)
    }
}

// Table flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
        /// Open an existing table with whatever flags it was created with.
        const ACCEDE = 0x40000000;
    }
}

impl DbFlags {
    /// Flags stored with the table and fixed at creation.
    pub const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);

    pub(crate) fn persistent(self) -> DbFlags {
        self & DbFlags::PERSISTENT
    }

    pub fn is_dupsort(self) -> bool {
        self.contains(DbFlags::DUPSORT)
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PutFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const ALLDUPS = 0x80;
        const RESERVE = 0x10000;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
        const MULTIPLE = 0x80000;
    }
}

impl PutFlags {
    pub const UPSERT: PutFlags = PutFlags::empty();
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxnFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();
        /// Reserve a reader slot but start in the reset state; `renew` activates it.
        const RDONLY_PREPARE = EnvFlags::RDONLY.bits() | EnvFlags::NOMEMINIT.bits();
        /// Fail with `Busy` instead of waiting for the writer lock.
        const TRY = 0x10000000;
        const NOMETASYNC = EnvFlags::NOMETASYNC.bits();
        const NOSYNC = EnvFlags::SAFE_NOSYNC.bits();
    }
}

impl TxnFlags {
    pub const READWRITE: TxnFlags = TxnFlags::empty();

    pub fn is_readonly(self) -> bool {
        self.contains(TxnFlags::RDONLY)
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CopyFlags: u32 {
        /// Rewrite live entries only, dropping free pages.
        const COMPACT = 0x01;
    }
}

/// How `Environment::remove` treats files that may still be in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Remove the files without checking the lock.
    #[default]
    JustDelete,
    /// Fail with `Busy` if another handle holds the lock.
    EnsureUnused,
    /// Block until the lock can be taken, then remove.
    WaitForUnused,
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u16 {
        /// Data lives in an overflow run.
        const BIGDATA = 0x01;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
    }
}

/// Default page size for newly created files.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Smallest page size accepted by `Geometry`.
pub const MIN_PAGE_SIZE: usize = 256;
/// Largest page size accepted by `Geometry`.
pub const MAX_PAGE_SIZE: usize = 65536;
/// Magic number at the start of every meta record
pub const MAGIC: u64 = 0x4C55_4D4F_4B56_4442;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 3;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 1;
/// On-disk format revision, checked on open
pub const FORMAT_VERSION: u32 = 2;
/// Meta pages at the head of the data file
pub const META_PAGES: u64 = 2;
/// Page number meaning "no page"
pub const NO_PAGE: u64 = u64::MAX;

/// Data file name in directory mode.
pub const DATA_FILE_NAME: &str = "mdbx.dat";
/// Lock file name in directory mode.
pub const LOCK_FILE_NAME: &str = "mdbx.lck";
/// Suffix appended to the data path for the lock file in `NOSUBDIR` mode.
pub const LOCK_SUFFIX: &str = "-lck";

pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_TABLES: u32 = 0;
/// Hard ceiling for `set_max_tables`.
pub const MAX_TABLES_LIMIT: u32 = 32765;
/// Largest value that can be stored in a single entry.
pub const MAX_DATA_SIZE: usize = 0x7FFF_0000;
