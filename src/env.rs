use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::slice;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fs2::FileExt as _;
use lazy_static::lazy_static;
use log::{debug, info, trace, warn};
use memmap2::{Mmap, MmapOptions, MmapRaw};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::constants::{
    CopyFlags, DbFlags, DeleteMode, EnvFlags, PutFlags, TxnFlags, DATA_FILE_NAME,
    DEFAULT_MAX_READERS, DEFAULT_MAX_TABLES, DEFAULT_PAGE_SIZE, LOCK_FILE_NAME, LOCK_SUFFIX,
    MAX_DATA_SIZE, MAX_PAGE_SIZE, MAX_TABLES_LIMIT, META_PAGES, MIN_PAGE_SIZE,
};
use crate::database::{Database, TableRegistry};
use crate::error::{Error, Result};
use crate::meta::{pick_meta, MetaRecord, MetaSlot, TableRecord, META_RECORD_SIZE, META_STEADY};
use crate::midl::Idl;
use crate::page::{max_key_size, PAGE_HEADER_SIZE};
use crate::transaction::Transaction;
use crate::tree::{self, PageSource};
use crate::types::{
    EnvInfo, EnvOption, GeoInfo, Geometry, MetaInfo, PgOpStat, ReaderInfo, Stat,
};

lazy_static! {
    /// Flags that may be toggled on an open environment.
    static ref CHANGEABLE: EnvFlags = EnvFlags::SAFE_NOSYNC
        | EnvFlags::UTTERLY_NOSYNC
        | EnvFlags::NOMETASYNC
        | EnvFlags::NOMEMINIT
        | EnvFlags::COALESCE
        | EnvFlags::PAGEPERTURB;
}

const DEFAULT_SIZE_LOWER: usize = 1 << 20;
const DEFAULT_SIZE_UPPER: usize = 1 << 30;
const DEFAULT_GROWTH: usize = 1 << 20;
const MIN_GEO_PAGES: u64 = 4;
const DEFAULT_FILE_MODE: u32 = 0o644;
const SYS_PAGE_SIZE: u32 = 4096;

/// Runtime tunables, see [`EnvOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tunables {
    pub(crate) sync_bytes: u64,
    /// 16.16 fixed-point seconds
    pub(crate) sync_period: u64,
    pub(crate) rp_augment_limit: u64,
    pub(crate) loose_limit: u64,
    pub(crate) dp_reserve_limit: u64,
    pub(crate) txn_dp_limit: u64,
    pub(crate) txn_dp_initial: u64,
    pub(crate) spill_max_denominator: u64,
    pub(crate) spill_min_denominator: u64,
    pub(crate) spill_parent4child_denominator: u64,
    /// 16.16 fixed-point fraction of a page
    pub(crate) merge_threshold: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            sync_bytes: 0,
            sync_period: 0,
            rp_augment_limit: 256 * 1024,
            loose_limit: 64,
            dp_reserve_limit: 1024,
            txn_dp_limit: 65536,
            txn_dp_initial: 1024,
            spill_max_denominator: 8,
            spill_min_denominator: 8,
            spill_parent4child_denominator: 0,
            merge_threshold: 65536 / 4,
        }
    }
}

impl Tunables {
    fn sync_period(&self) -> Duration {
        let nanos = (self.sync_period & 0xFFFF) * 1_000_000_000 / 65536;
        Duration::new(self.sync_period >> 16, nanos as u32)
    }
}

/// Geometry in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GeoPages {
    lower: u64,
    now: u64,
    upper: u64,
    grow: u64,
    shrink: u64,
}

impl GeoPages {
    fn of(meta: &MetaRecord) -> Self {
        GeoPages {
            lower: meta.geo_lower,
            now: meta.geo_now,
            upper: meta.geo_upper,
            grow: meta.geo_grow,
            shrink: meta.geo_shrink,
        }
    }

    fn store(&self, meta: &mut MetaRecord) {
        meta.geo_lower = self.lower;
        meta.geo_now = self.now;
        meta.geo_upper = self.upper;
        meta.geo_grow = self.grow;
        meta.geo_shrink = self.shrink;
    }

    fn defaults(psize: usize) -> Self {
        GeoPages {
            lower: to_pages(DEFAULT_SIZE_LOWER, psize),
            now: 0,
            upper: to_pages(DEFAULT_SIZE_UPPER, psize),
            grow: to_pages(DEFAULT_GROWTH, psize),
            shrink: to_pages(4 * DEFAULT_GROWTH, psize),
        }
    }

    /// Applies the requested bounds on top of `self`.
    fn resolve(self, req: &Geometry, psize: usize, in_use: u64) -> Result<Self> {
        let lower = req
            .size_lower
            .map(|b| to_pages(b, psize))
            .unwrap_or(self.lower)
            .max(MIN_GEO_PAGES);
        let upper = match req.size_upper {
            Some(b) => to_pages(b, psize),
            None => self.upper.max(lower),
        };
        if upper < lower {
            return Err(Error::InvalidArgument);
        }
        if upper < in_use {
            return Err(Error::MapFull);
        }
        if (upper as u128) * (psize as u128) > isize::MAX as u128 {
            return Err(Error::TooLarge);
        }
        let now = req
            .size_now
            .map(|b| to_pages(b, psize))
            .unwrap_or(self.now)
            .max(in_use)
            .clamp(lower, upper);
        Ok(GeoPages {
            lower,
            now,
            upper,
            grow: req.growth_step.map(|b| to_pages(b, psize)).unwrap_or(self.grow).max(1),
            shrink: req.shrink_threshold.map(|b| to_pages(b, psize)).unwrap_or(self.shrink),
        })
    }
}

fn to_pages(bytes: usize, psize: usize) -> u64 {
    bytes.div_ceil(psize) as u64
}

fn check_page_size(psize: usize) -> Result<usize> {
    if !psize.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&psize) {
        return Err(Error::InvalidArgument);
    }
    Ok(psize)
}

/// Data and lock file paths for `path`.
pub(crate) fn file_paths(path: &Path, flags: EnvFlags) -> (PathBuf, PathBuf) {
    if flags.contains(EnvFlags::NOSUBDIR) {
        let mut lock = path.as_os_str().to_owned();
        lock.push(LOCK_SUFFIX);
        (path.to_path_buf(), PathBuf::from(lock))
    } else {
        (path.join(DATA_FILE_NAME), path.join(LOCK_FILE_NAME))
    }
}

enum Mapping {
    Rw(MmapRaw),
    Ro(Mmap),
}

impl Mapping {
    fn new(file: &File, len: usize, readonly: bool) -> Result<Self> {
        if readonly {
            // SAFETY: the file is locked for the lifetime of the environment and
            // nothing else in this process writes it while it is mapped read-only.
            let map = unsafe { MmapOptions::new().len(len).map(file)? };
            Ok(Mapping::Ro(map))
        } else {
            Ok(Mapping::Rw(MmapOptions::new().len(len).map_raw(file)?))
        }
    }

    fn base(&self) -> *const u8 {
        match self {
            Mapping::Rw(m) => m.as_ptr(),
            Mapping::Ro(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Mapping::Rw(m) => m.len(),
            Mapping::Ro(m) => m.len(),
        }
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        match self {
            Mapping::Rw(m) => {
                if offset.checked_add(data.len()).map_or(true, |end| end > m.len()) {
                    return Err(Error::MapFull);
                }
                // SAFETY: the range is inside the map and only the writer holding
                // the environment state lock writes to it. Pages written here are
                // not part of any live snapshot.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), m.as_mut_ptr().add(offset), data.len());
                }
                Ok(())
            }
            Mapping::Ro(_) => Err(Error::Access),
        }
    }

    fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        match self {
            Mapping::Rw(m) if len > 0 => Ok(m.flush_range(offset, len)?),
            _ => Ok(()),
        }
    }
}

/// Open files and map of an environment.
struct Core {
    path: PathBuf,
    file: File,
    _lock: File,
    map: Mapping,
    readonly: bool,
}

#[derive(Debug)]
struct ReaderSlot {
    thread: ThreadId,
    thread_name: String,
    txnid: Option<u64>,
}

/// Reader slots. A slot is held from begin until commit or abort; a reset
/// transaction keeps its slot but pins no snapshot.
#[derive(Debug, Default)]
struct ReaderTable {
    slots: Vec<Option<ReaderSlot>>,
}

impl ReaderTable {
    fn acquire(&mut self, max: usize) -> Result<usize> {
        let current = thread::current();
        let slot = ReaderSlot {
            thread: current.id(),
            thread_name: current.name().map(str::to_owned).unwrap_or_else(|| format!("{:?}", current.id())),
            txnid: None,
        };
        if let Some(i) = self.slots.iter().position(Option::is_none) {
            self.slots[i] = Some(slot);
            return Ok(i);
        }
        if self.slots.len() >= max {
            return Err(Error::ReadersFull);
        }
        self.slots.push(Some(slot));
        Ok(self.slots.len() - 1)
    }

    fn pin(&mut self, slot: usize, txnid: Option<u64>) -> Result<()> {
        match self.slots.get_mut(slot) {
            Some(Some(s)) => {
                s.txnid = txnid;
                Ok(())
            }
            _ => Err(Error::BadRslot),
        }
    }

    fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = None;
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn oldest(&self) -> Option<u64> {
        self.slots.iter().flatten().filter_map(|s| s.txnid).min()
    }

    fn oldest_of(&self, thread: ThreadId) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.thread == thread)
            .filter_map(|s| s.txnid)
            .min()
    }
}

/// Everything shared by the transactions of one environment.
struct EnvState {
    core: Option<Core>,
    flags: EnvFlags,
    geometry: Geometry,
    max_tables: u32,
    max_readers: u32,
    tunables: Tunables,
    page_size: usize,
    /// Newest committed meta, geometry included.
    meta: MetaRecord,
    metas: [MetaInfo; 2],
    /// Geometry changed since the meta was last written.
    geo_dirty: bool,
    /// Pages freed by each commit, keyed by the freeing txn id.
    reclaimable: Vec<(u64, Idl)>,
    readers: ReaderTable,
    live_txns: usize,
    unsynced: u64,
    last_sync: Instant,
    pgop: PgOpStat,
}

impl EnvState {
    fn core(&self) -> Result<&Core> {
        self.core.as_ref().ok_or(Error::Closed)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let core = self.core()?;
        Ok(Snapshot {
            base: core.map.base(),
            map_len: core.map.len(),
            page_size: self.page_size,
            meta: self.meta,
        })
    }

    fn write_meta(&mut self, meta: &MetaRecord, sync: bool) -> Result<()> {
        let psize = self.page_size;
        let slot = (meta.txnid % META_PAGES) as usize;
        let mut buf = vec![0u8; psize];
        let sign = meta.encode_page(&mut buf, slot as u64);
        let core = self.core()?;
        core.map.write(slot * psize, &buf)?;
        if sync {
            core.map.flush_range(slot * psize, psize)?;
        }
        self.metas[slot] = MetaInfo {
            txnid: meta.txnid,
            sign,
            steady: meta.is_steady(),
        };
        self.pgop.wops += 1;
        Ok(())
    }

    fn autosync_due(&self) -> bool {
        let t = &self.tunables;
        (t.sync_bytes > 0 && self.unsynced >= t.sync_bytes)
            || (t.sync_period > 0 && self.last_sync.elapsed() >= t.sync_period())
    }

    /// Flushes the map and rewrites the current meta as steady.
    fn sync(&mut self, force: bool) -> Result<bool> {
        let pending = self.unsynced > 0 || !self.meta.is_steady() || self.geo_dirty;
        if !pending {
            return Ok(false);
        }
        let thresholds = self.tunables.sync_bytes > 0 || self.tunables.sync_period > 0;
        if !force && thresholds && !self.autosync_due() {
            return Ok(false);
        }
        let psize = self.page_size;
        let end = self.meta.last_pgno as usize * psize;
        self.core()?.map.flush_range(0, end)?;
        let mut meta = self.meta;
        meta.flags |= META_STEADY;
        self.write_meta(&meta, true)?;
        self.meta = meta;
        self.unsynced = 0;
        self.geo_dirty = false;
        self.last_sync = Instant::now();
        debug!("synced up to txn {}", meta.txnid);
        Ok(true)
    }

    fn set_file_pages(&mut self, pages: u64) -> Result<()> {
        let core = self.core()?;
        core.file.set_len(pages * self.page_size as u64)?;
        self.meta.geo_now = pages;
        Ok(())
    }
}

/// Committed pages of one snapshot, read straight from the map.
///
/// Holds a raw view of the map; the environment keeps the map in place while
/// any transaction is live.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    base: *const u8,
    map_len: usize,
    page_size: usize,
    pub(crate) meta: MetaRecord,
}

impl Snapshot {
    /// Snapshot over a caller-owned mapping, which must outlive it.
    pub(crate) fn over(map: &[u8], page_size: usize, meta: MetaRecord) -> Self {
        Snapshot {
            base: map.as_ptr(),
            map_len: map.len(),
            page_size,
            meta,
        }
    }

    /// Pages `[pgno, pgno + npages)`, bounded by `limit` pages.
    pub(crate) fn pages(&self, pgno: u64, npages: u64, limit: u64) -> Result<&[u8]> {
        let end = pgno.checked_add(npages).ok_or(Error::PageNotFound)?;
        if pgno < META_PAGES || end > limit {
            return Err(Error::PageNotFound);
        }
        let start = pgno as usize * self.page_size;
        let len = npages as usize * self.page_size;
        if start + len > self.map_len {
            return Err(Error::PageNotFound);
        }
        // SAFETY: the range lies inside the map, and pages below the snapshot's
        // last page are never rewritten while the snapshot is live.
        Ok(unsafe { slice::from_raw_parts(self.base.add(start), len) })
    }
}

impl PageSource for Snapshot {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page(&self, pgno: u64) -> Result<&[u8]> {
        self.pages(pgno, 1, self.meta.last_pgno)
    }

    fn run(&self, pgno: u64, npages: u64) -> Result<&[u8]> {
        self.pages(pgno, npages, self.meta.last_pgno)
    }
}

/// Collects the pages in `[META_PAGES, last_pgno)` not reachable from any tree.
pub(crate) fn unreachable_pages(snap: &Snapshot) -> Result<Idl> {
    let last = snap.meta.last_pgno;
    let mut used = vec![false; last as usize];
    let mut mark = |pgno: u64, n: u64| -> Result<()> {
        for p in pgno..pgno + n {
            match used.get_mut(p as usize) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => return Err(Error::Corrupted),
                None => return Err(Error::PageNotFound),
            }
        }
        Ok(())
    };
    tree::walk(snap, snap.meta.main.root, &mut mark)?;
    tree::walk(snap, snap.meta.catalog.root, &mut mark)?;
    for (_, record) in catalog_entries(snap, snap.meta.catalog.root)? {
        tree::walk(snap, record.root, &mut mark)?;
    }
    Ok(Idl::from_unsorted(
        (META_PAGES..last).filter(|&p| !used[p as usize]).collect(),
    ))
}

/// Named tables recorded in the catalog tree rooted at `root`.
pub(crate) fn catalog_entries<S: PageSource + ?Sized>(
    src: &S,
    root: u64,
) -> Result<Vec<(Vec<u8>, TableRecord)>> {
    let mut out = Vec::new();
    let mut path = tree::Path::new();
    if !tree::first(src, root, &mut path)? {
        return Ok(out);
    }
    loop {
        let (key, data) = tree::pair(src, &path)?;
        out.push((key.to_vec(), TableRecord::from_bytes(data)?));
        if !tree::step_next(src, &mut path)? {
            return Ok(out);
        }
    }
}

/// What a write transaction starts from.
pub(crate) struct WriteStart {
    pub(crate) snap: Snapshot,
    /// Reclaimable page batches, oldest first.
    pub(crate) pool: Vec<(u64, Idl)>,
    pub(crate) dp_limit: usize,
    pub(crate) merge_threshold: usize,
    pub(crate) lifo: bool,
    pub(crate) perturb: bool,
}

/// Everything a write transaction hands over at commit.
pub(crate) struct CommitPlan {
    pub(crate) meta: MetaRecord,
    pub(crate) pages: Vec<(u64, Box<[u8]>)>,
    pub(crate) retired: Idl,
    /// Txn ids of the batches taken at begin, and what is left of them.
    pub(crate) taken: Vec<u64>,
    pub(crate) pool: Vec<(u64, Idl)>,
    pub(crate) nosync: bool,
    pub(crate) nometasync: bool,
    pub(crate) pgop: PgOpStat,
}

/// Durations measured while publishing a commit.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PublishTimes {
    pub(crate) gc: Duration,
    pub(crate) write: Duration,
    pub(crate) sync: Duration,
}

/// Embedded store environment.
///
/// An environment owns one data file and its lock file. It is configured,
/// then opened once, and closed once; transactions borrow it in between.
pub struct Environment {
    state: Mutex<EnvState>,
    writer: Mutex<Option<ThreadId>>,
    writer_cv: Condvar,
    tables: RwLock<TableRegistry>,
    opened: OnceCell<Instant>,
    closed: OnceCell<Instant>,
}

impl Environment {
    /// Creates an unopened environment with default settings.
    pub fn new() -> Result<Self> {
        Ok(Environment {
            state: Mutex::new(EnvState {
                core: None,
                flags: EnvFlags::empty(),
                geometry: Geometry::default(),
                max_tables: DEFAULT_MAX_TABLES,
                max_readers: DEFAULT_MAX_READERS,
                tunables: Tunables::default(),
                page_size: DEFAULT_PAGE_SIZE,
                meta: MetaRecord::new(DEFAULT_PAGE_SIZE),
                metas: [MetaInfo::default(); 2],
                geo_dirty: false,
                reclaimable: Vec::new(),
                readers: ReaderTable::default(),
                live_txns: 0,
                unsynced: 0,
                last_sync: Instant::now(),
                pgop: PgOpStat::default(),
            }),
            writer: Mutex::new(None),
            writer_cv: Condvar::new(),
            tables: RwLock::new(TableRegistry::new()),
            opened: OnceCell::new(),
            closed: OnceCell::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.opened.get().is_some() && self.closed.get().is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// When the environment was opened, if it was.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened.get().copied()
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.closed.get().copied()
    }

    /// Sets the size bounds of the data file.
    ///
    /// Before open the geometry is recorded and applied when the file is
    /// created or opened. On an open environment the file is resized in
    /// place, which requires that no transaction is live. The page size of
    /// an open environment cannot change.
    pub fn set_geometry(&self, geometry: Geometry) -> Result<()> {
        if let Some(psize) = geometry.page_size {
            check_page_size(psize)?;
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.is_open() {
            let mut state = self.state.lock();
            let psize = geometry.page_size.unwrap_or(state.page_size);
            GeoPages::defaults(psize).resolve(&geometry, psize, 0)?;
            state.geometry = geometry;
            return Ok(());
        }

        let writer = self.writer.lock();
        let mut state = self.state.lock();
        if writer.is_some() || state.live_txns > 0 {
            return Err(Error::Busy);
        }
        let core = state.core()?;
        if core.readonly {
            return Err(Error::Access);
        }
        let psize = state.page_size;
        if geometry.page_size.map_or(false, |p| p != psize) {
            return Err(Error::InvalidArgument);
        }
        let old = GeoPages::of(&state.meta);
        let geo = old.resolve(&geometry, psize, state.meta.last_pgno)?;
        if geo.upper != old.upper {
            let len = geo.upper as usize * psize;
            let map = Mapping::new(&core.file, len, false)?;
            if let Some(core) = state.core.as_mut() {
                core.map = map;
            }
        }
        geo.store(&mut state.meta);
        if geo.now != old.now {
            state.set_file_pages(geo.now)?;
        }
        state.geo_dirty = true;
        debug!(
            "geometry now lower={} now={} upper={} grow={} shrink={} pages",
            geo.lower, geo.now, geo.upper, geo.grow, geo.shrink
        );
        Ok(())
    }

    pub fn geometry(&self) -> GeoInfo {
        let state = self.state.lock();
        geo_info(&state.meta, state.page_size)
    }

    /// Maximum number of named tables. Only settable before open.
    pub fn set_max_tables(&self, count: u32) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::Permission);
        }
        if count > MAX_TABLES_LIMIT {
            return Err(Error::InvalidArgument);
        }
        self.state.lock().max_tables = count;
        Ok(())
    }

    pub fn max_tables(&self) -> u32 {
        self.state.lock().max_tables
    }

    /// Maximum number of concurrent readers. Only settable before open.
    pub fn set_max_readers(&self, count: u32) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::Permission);
        }
        if count == 0 || count > i16::MAX as u32 {
            return Err(Error::InvalidArgument);
        }
        self.state.lock().max_readers = count;
        Ok(())
    }

    pub fn max_readers(&self) -> u32 {
        self.state.lock().max_readers
    }

    pub fn set_option(&self, option: EnvOption, value: u64) -> Result<()> {
        let count = || u32::try_from(value).map_err(|_| Error::InvalidArgument);
        match option {
            EnvOption::MaxDb => return self.set_max_tables(count()?),
            EnvOption::MaxReaders => return self.set_max_readers(count()?),
            _ => {}
        }
        let mut state = self.state.lock();
        let t = &mut state.tunables;
        match option {
            EnvOption::SyncBytes => t.sync_bytes = value,
            EnvOption::SyncPeriod => t.sync_period = value,
            EnvOption::RpAugmentLimit => t.rp_augment_limit = value,
            EnvOption::LooseLimit => t.loose_limit = bounded(value, 0, 255)?,
            EnvOption::DpReserveLimit => t.dp_reserve_limit = value,
            EnvOption::TxnDpLimit => t.txn_dp_limit = bounded(value, 16, u32::MAX as u64)?,
            EnvOption::TxnDpInitial => t.txn_dp_initial = bounded(value, 16, u32::MAX as u64)?,
            EnvOption::SpillMaxDenominator => t.spill_max_denominator = bounded(value, 0, 255)?,
            EnvOption::SpillMinDenominator => t.spill_min_denominator = bounded(value, 0, 255)?,
            EnvOption::SpillParent4ChildDenominator => {
                t.spill_parent4child_denominator = bounded(value, 0, 255)?
            }
            EnvOption::MergeThreshold16Dot16Percent => {
                t.merge_threshold = bounded(value, 8192, 32768)?
            }
            EnvOption::MaxDb | EnvOption::MaxReaders => return Err(Error::InvalidArgument),
        }
        trace!("option {:?} set to {}", option, value);
        Ok(())
    }

    pub fn get_option(&self, option: EnvOption) -> Result<u64> {
        let state = self.state.lock();
        let t = &state.tunables;
        Ok(match option {
            EnvOption::MaxDb => state.max_tables as u64,
            EnvOption::MaxReaders => state.max_readers as u64,
            EnvOption::SyncBytes => t.sync_bytes,
            EnvOption::SyncPeriod => t.sync_period,
            EnvOption::RpAugmentLimit => t.rp_augment_limit,
            EnvOption::LooseLimit => t.loose_limit,
            EnvOption::DpReserveLimit => t.dp_reserve_limit,
            EnvOption::TxnDpLimit => t.txn_dp_limit,
            EnvOption::TxnDpInitial => t.txn_dp_initial,
            EnvOption::SpillMaxDenominator => t.spill_max_denominator,
            EnvOption::SpillMinDenominator => t.spill_min_denominator,
            EnvOption::SpillParent4ChildDenominator => t.spill_parent4child_denominator,
            EnvOption::MergeThreshold16Dot16Percent => t.merge_threshold,
        })
    }

    /// Opens (creating if needed) the environment at `path`.
    ///
    /// A second call on an open environment does nothing. `mode` is the
    /// permission of newly created files; 0 picks `0o644`.
    pub fn open<P: AsRef<Path>>(&self, path: P, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut state = self.state.lock();
        if self.opened.get().is_some() {
            return Ok(());
        }
        let path = path.as_ref();
        let flags = flags | state.flags;
        let readonly = flags.contains(EnvFlags::RDONLY);
        let mode = if mode == 0 { DEFAULT_FILE_MODE } else { mode };

        if !flags.contains(EnvFlags::NOSUBDIR) && !readonly {
            fs::create_dir_all(path)?;
        }
        let (data_path, lock_path) = file_paths(path, flags);

        let lock = open_lock_file(&lock_path, mode)?;
        lock.try_lock_exclusive().map_err(|_| Error::Busy)?;

        let file = if readonly {
            OpenOptions::new().read(true).open(&data_path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(mode)
                .open(&data_path)?
        };

        let file_len = file.metadata()?.len();
        let (meta, metas) = if file_len == 0 {
            if readonly {
                return Err(Error::Invalid);
            }
            let psize = state.geometry.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
            check_page_size(psize)?;
            let geo = GeoPages::defaults(psize).resolve(&state.geometry, psize, META_PAGES)?;
            create_metas(&file, psize, geo)?
        } else {
            let (meta, metas, torn) = read_metas(&file, file_len)?;
            if torn {
                if readonly {
                    warn!("{}: newest meta page is damaged", data_path.display());
                    return Err(Error::WannaRecovery);
                }
                warn!(
                    "{}: damaged meta page, rolling back to txn {}",
                    data_path.display(),
                    meta.txnid
                );
            }
            (meta, metas)
        };

        let psize = meta.page_size as usize;
        let file_pages = file.metadata()?.len() / psize as u64;
        let mut meta = meta;
        if !readonly {
            let geo = GeoPages::of(&meta).resolve(&state.geometry, psize, meta.last_pgno)?;
            geo.store(&mut meta);
            if geo.now != file_pages {
                file.set_len(geo.now * psize as u64)?;
            }
        } else if file_pages < meta.last_pgno {
            return Err(Error::Corrupted);
        }
        let map = Mapping::new(&file, meta.geo_upper as usize * psize, readonly)?;

        state.page_size = psize;
        state.meta = meta;
        state.metas = metas;
        state.flags = flags;
        state.geo_dirty = false;
        state.core = Some(Core {
            path: path.to_path_buf(),
            file,
            _lock: lock,
            map,
            readonly,
        });
        state.reclaimable.clear();
        if !readonly {
            let free = unreachable_pages(&state.snapshot()?)?;
            if !free.is_empty() {
                debug!("{} free pages found on open", free.len());
                state.reclaimable.push((0, free));
            }
        }
        state.last_sync = Instant::now();
        let _ = self.opened.set(Instant::now());
        info!(
            "opened {} at txn {} ({} pages of {} bytes{})",
            data_path.display(),
            meta.txnid,
            meta.last_pgno,
            psize,
            if readonly { ", read-only" } else { "" }
        );
        Ok(())
    }

    /// Closes the environment. Fails with `Busy` while a transaction is live.
    ///
    /// Closing is final; closing a closed environment does nothing.
    pub fn close(&self, dont_sync: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let writer = self.writer.lock();
        let mut state = self.state.lock();
        if writer.is_some() || state.live_txns > 0 {
            return Err(Error::Busy);
        }
        if self.is_closed() {
            return Ok(());
        }
        if let Some((readonly, path)) = state.core.as_ref().map(|c| (c.readonly, c.path.clone())) {
            if !dont_sync && !readonly {
                state.sync(true)?;
            }
            info!("closed {}", path.display());
        }
        state.core = None;
        state.reclaimable.clear();
        state.readers = ReaderTable::default();
        let _ = self.closed.set(Instant::now());
        Ok(())
    }

    /// Flushes committed data and marks the newest meta steady.
    ///
    /// Returns whether anything was written. With `nonblock`, fails with
    /// `Busy` instead of proceeding while a write transaction is running.
    pub fn sync(&self, force: bool, nonblock: bool) -> Result<bool> {
        if nonblock && self.writer.lock().is_some() {
            return Err(Error::Busy);
        }
        let mut state = self.state.lock();
        if state.core()?.readonly {
            return Err(Error::Access);
        }
        state.sync(force)
    }

    pub fn flags(&self) -> EnvFlags {
        self.state.lock().flags
    }

    /// Turns flags on or off. After open only the sync-mode flags can change.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        if self.is_open() && !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        let mut state = self.state.lock();
        state.flags.set(flags, on);
        Ok(())
    }

    /// Path given to `open`.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().core.as_ref().map(|c| c.path.clone())
    }

    pub fn page_size(&self) -> usize {
        self.state.lock().page_size
    }

    pub fn max_key_size(&self) -> usize {
        max_key_size(self.page_size())
    }

    /// Largest value a table with `flags` accepts.
    pub fn max_val_size(&self, flags: DbFlags) -> usize {
        if flags.is_dupsort() {
            self.max_key_size()
        } else {
            MAX_DATA_SIZE
        }
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let state = self.state.lock();
        let core = state.core()?;
        let recent = state.meta.txnid;
        let t = &state.tunables;
        Ok(EnvInfo {
            geo: geo_info(&state.meta, state.page_size),
            map_size: core.map.len() as u64,
            last_pgno: state.meta.last_pgno.saturating_sub(1),
            recent_txnid: recent,
            latter_reader_txnid: state.readers.oldest().unwrap_or(recent),
            self_latter_reader_txnid: state
                .readers
                .oldest_of(thread::current().id())
                .unwrap_or(recent),
            meta: state.metas,
            max_readers: state.max_readers,
            num_readers: state.readers.live() as u32,
            page_size: state.page_size as u32,
            sys_page_size: SYS_PAGE_SIZE,
            unsync_volume: state.unsynced,
            autosync_threshold: t.sync_bytes,
            since_sync: state.last_sync.elapsed(),
            autosync_period: t.sync_period(),
            mode: state.flags,
            pgop_stat: state.pgop,
        })
    }

    /// Statistics of the main table as of the newest commit.
    pub fn stat(&self) -> Result<Stat> {
        let state = self.state.lock();
        state.core()?;
        Ok(state.meta.main.stat(state.page_size))
    }

    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        let state = self.state.lock();
        state.core()?;
        let recent = state.meta.txnid;
        let pid = std::process::id();
        Ok(state
            .readers
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                s.as_ref().map(|s| ReaderInfo {
                    slot,
                    pid,
                    thread: s.thread_name.clone(),
                    txnid: s.txnid,
                    lag: s.txnid.map_or(0, |t| recent.saturating_sub(t)),
                })
            })
            .collect())
    }

    /// Clears reader slots left behind by dead owners and returns how many.
    ///
    /// Slots are released when their transaction ends, so within one process
    /// there is never anything to clear.
    pub fn reader_check(&self) -> Result<usize> {
        self.state.lock().core()?;
        Ok(0)
    }

    /// Releases a table handle. The handle must not be used afterwards.
    pub fn close_table(&self, db: Database) -> Result<()> {
        self.tables.write().close(db)
    }

    /// Starts a transaction.
    pub fn begin(&self, flags: TxnFlags) -> Result<Transaction<'_>> {
        Transaction::begin(self, flags)
    }

    pub fn begin_ro(&self) -> Result<Transaction<'_>> {
        self.begin(TxnFlags::RDONLY)
    }

    pub fn begin_rw(&self) -> Result<Transaction<'_>> {
        self.begin(TxnFlags::READWRITE)
    }

    /// Writes a copy of the environment to the file `dest`.
    ///
    /// Without `COMPACT` the copy is a page image of the newest snapshot.
    /// With it, live entries are rewritten into a fresh file, leaving free
    /// pages behind.
    pub fn copy<P: AsRef<Path>>(&self, dest: P, flags: CopyFlags) -> Result<()> {
        let dest = dest.as_ref();
        let mut txn = self.begin_ro()?;
        if flags.contains(CopyFlags::COMPACT) {
            self.copy_compact(&txn, dest)?;
        } else {
            copy_image(&txn.snapshot(), dest)?;
        }
        txn.abort()?;
        info!("copied environment to {}", dest.display());
        Ok(())
    }

    fn copy_compact(&self, txn: &Transaction<'_>, dest: &Path) -> Result<()> {
        let snap = txn.snapshot();
        let psize = snap.page_size;
        let names = catalog_entries(&snap, snap.meta.catalog.root)?;
        let geo = GeoPages::of(&snap.meta);
        let out = Environment::new()?;
        out.set_geometry(
            Geometry::new()
                .page_size(psize)
                .lower(geo.lower as usize * psize)
                .upper(geo.upper as usize * psize)
                .growth(geo.grow as usize * psize)
                .shrink(geo.shrink as usize * psize),
        )?;
        out.set_max_tables(names.len() as u32)?;
        out.open(dest, EnvFlags::NOSUBDIR, 0)?;
        {
            let mut wtxn = out.begin_rw()?;
            let main_flags = DbFlags::from_bits_truncate(snap.meta.main.flags);
            copy_table(txn, Database::main(), &mut wtxn, None, main_flags)?;
            for (name, record) in names {
                let name = String::from_utf8(name).map_err(|_| Error::Corrupted)?;
                let flags = DbFlags::from_bits_truncate(record.flags);
                let src = txn.open_table(Some(&name), flags)?;
                copy_table(txn, src, &mut wtxn, Some(&name), flags)?;
            }
            wtxn.put_canary(txn.canary()?)?;
            wtxn.commit()?;
        }
        out.close(false)?;
        let (_, lock_path) = file_paths(dest, EnvFlags::NOSUBDIR);
        fs::remove_file(lock_path)?;
        Ok(())
    }

    /// Deletes the files of an environment.
    ///
    /// `path` is either a directory created by a directory-mode open or a
    /// single data file. Returns false when there was nothing to delete.
    pub fn remove<P: AsRef<Path>>(path: P, mode: DeleteMode) -> Result<bool> {
        let path = path.as_ref();
        let is_dir = path.is_dir();
        let flags = if is_dir { EnvFlags::empty() } else { EnvFlags::NOSUBDIR };
        let (data_path, lock_path) = file_paths(path, flags);

        let _guard = match (mode, OpenOptions::new().read(true).write(true).open(&lock_path)) {
            (DeleteMode::JustDelete, _) => None,
            (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => None,
            (_, Err(e)) => return Err(e.into()),
            (DeleteMode::EnsureUnused, Ok(lock)) => {
                lock.try_lock_exclusive().map_err(|_| Error::Busy)?;
                Some(lock)
            }
            (DeleteMode::WaitForUnused, Ok(lock)) => {
                lock.lock_exclusive()?;
                Some(lock)
            }
        };

        let mut removed = false;
        for file in [&data_path, &lock_path] {
            match fs::remove_file(file) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if is_dir && fs::read_dir(path)?.next().is_none() {
            fs::remove_dir(path)?;
        }
        debug!("removed {} ({})", path.display(), if removed { "files deleted" } else { "nothing found" });
        Ok(removed)
    }

    pub(crate) fn tables(&self) -> &RwLock<TableRegistry> {
        &self.tables
    }

    pub(crate) fn named_table_limit(&self) -> usize {
        self.state.lock().max_tables as usize
    }

    /// Takes the writer lock, waiting for the current writer unless `try_only`.
    pub(crate) fn lock_writer(&self, try_only: bool) -> Result<()> {
        let me = thread::current().id();
        let mut writer = self.writer.lock();
        while let Some(owner) = *writer {
            if try_only {
                return Err(Error::Busy);
            }
            if owner == me {
                return Err(Error::TxnOverlapping);
            }
            self.writer_cv.wait(&mut writer);
        }
        *writer = Some(me);
        Ok(())
    }

    pub(crate) fn unlock_writer(&self) {
        *self.writer.lock() = None;
        self.writer_cv.notify_one();
    }

    /// Registers a write transaction and hands it the reclaimable pages.
    pub(crate) fn start_write(&self) -> Result<WriteStart> {
        let mut state = self.state.lock();
        if state.core()?.readonly {
            return Err(Error::Access);
        }
        let snap = state.snapshot()?;
        let horizon = state.readers.oldest().unwrap_or(u64::MAX);
        let pool = state
            .reclaimable
            .iter()
            .filter(|(txnid, _)| *txnid <= horizon)
            .cloned()
            .collect();
        state.live_txns += 1;
        let t = state.tunables;
        Ok(WriteStart {
            snap,
            pool,
            dp_limit: t.txn_dp_limit as usize,
            merge_threshold: (state.page_size as u64 * t.merge_threshold / 65536) as usize,
            lifo: state.flags.contains(EnvFlags::LIFORECLAIM),
            perturb: state.flags.contains(EnvFlags::PAGEPERTURB),
        })
    }

    /// Takes a reader slot, optionally pinning the newest snapshot.
    pub(crate) fn start_read(&self, pin: bool) -> Result<(Snapshot, usize)> {
        let mut state = self.state.lock();
        let snap = state.snapshot()?;
        let max = state.max_readers as usize;
        let slot = state.readers.acquire(max)?;
        if pin {
            state.readers.pin(slot, Some(snap.meta.txnid))?;
        }
        state.live_txns += 1;
        Ok((snap, slot))
    }

    /// Pins the newest snapshot for a reader that was reset, taking a new
    /// slot if it gave its old one up.
    pub(crate) fn resume_read(&self, slot: Option<usize>) -> Result<(Snapshot, usize)> {
        let mut state = self.state.lock();
        let snap = state.snapshot()?;
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let max = state.max_readers as usize;
                state.readers.acquire(max)?
            }
        };
        state.readers.pin(slot, Some(snap.meta.txnid))?;
        Ok((snap, slot))
    }

    /// Gives up the slot of a reset reader. The transaction stays live.
    pub(crate) fn release_read(&self, slot: usize) {
        self.state.lock().readers.release(slot);
    }

    /// Releases what a finished transaction held.
    pub(crate) fn end_txn(&self, slot: Option<usize>) {
        let mut state = self.state.lock();
        if let Some(slot) = slot {
            state.readers.release(slot);
        }
        state.live_txns = state.live_txns.saturating_sub(1);
    }

    /// Grows the file so that it holds at least `pages` pages.
    pub(crate) fn ensure_pages(&self, pages: u64) -> Result<()> {
        let mut state = self.state.lock();
        let geo = GeoPages::of(&state.meta);
        if pages <= geo.now {
            return Ok(());
        }
        if pages > geo.upper {
            return Err(Error::MapFull);
        }
        let now = pages.div_ceil(geo.grow).saturating_mul(geo.grow).clamp(pages, geo.upper);
        state.set_file_pages(now)?;
        trace!("data file grown to {} pages", now);
        Ok(())
    }

    /// Writes the pages of a commit, then its meta, and publishes it.
    pub(crate) fn publish(&self, mut plan: CommitPlan) -> Result<PublishTimes> {
        let mut times = PublishTimes::default();
        let mut state = self.state.lock();
        let psize = state.page_size;

        let started = Instant::now();
        for (pgno, buf) in &plan.pages {
            state.core()?.map.write(*pgno as usize * psize, buf)?;
        }
        state.pgop.wops += plan.pages.len() as u64;
        times.write = started.elapsed();

        let flags = state.flags;
        let nosync = plan.nosync || flags.skips_data_sync();
        let nometasync = nosync || plan.nometasync || flags.skips_meta_sync();
        let started = Instant::now();
        if !nosync {
            let end = plan.meta.last_pgno as usize * psize;
            state.core()?.map.flush_range(0, end)?;
        }
        let mut meta = plan.meta;
        let geo = GeoPages::of(&state.meta);
        geo.store(&mut meta);
        meta.flags = if nosync { 0 } else { META_STEADY };
        state.write_meta(&meta, !nometasync)?;
        times.sync = started.elapsed();

        let started = Instant::now();
        state.reclaimable.retain(|(txnid, _)| !plan.taken.contains(txnid));
        state.reclaimable.extend(plan.pool.drain(..).filter(|(_, idl)| !idl.is_empty()));
        if !plan.retired.is_empty() {
            state.reclaimable.push((meta.txnid, std::mem::take(&mut plan.retired)));
        }
        state.reclaimable.sort_by_key(|(txnid, _)| *txnid);
        times.gc = started.elapsed();

        let written = (plan.pages.len() * psize) as u64;
        state.meta = meta;
        if nosync {
            state.unsynced += written;
        } else {
            state.unsynced = 0;
            state.geo_dirty = false;
            state.last_sync = Instant::now();
        }
        let pg = &mut state.pgop;
        pg.newly += plan.pgop.newly;
        pg.cow += plan.pgop.cow;
        pg.split += plan.pgop.split;
        pg.merge += plan.pgop.merge;
        pg.spill += plan.pgop.spill;
        pg.unspill += plan.pgop.unspill;

        if geo.shrink > 0 && geo.now > meta.last_pgno + geo.shrink {
            let target = meta
                .last_pgno
                .div_ceil(geo.grow)
                .saturating_mul(geo.grow)
                .max(geo.lower);
            if target < geo.now {
                state.set_file_pages(target)?;
                state.geo_dirty = true;
                debug!("data file shrunk to {} pages", target);
            }
        }

        if nosync && state.autosync_due() {
            state.sync(true)?;
        }
        debug!(
            "committed txn {}: {} pages written, {} in use",
            meta.txnid,
            plan.pages.len(),
            meta.last_pgno
        );
        Ok(times)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.close(false) {
            warn!("closing environment on drop failed: {}", e);
        }
    }
}

fn bounded(value: u64, min: u64, max: u64) -> Result<u64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::InvalidArgument)
    }
}

fn geo_info(meta: &MetaRecord, psize: usize) -> GeoInfo {
    let bytes = |pages: u64| pages * psize as u64;
    GeoInfo {
        lower: bytes(meta.geo_lower),
        upper: bytes(meta.geo_upper),
        current: bytes(meta.geo_now),
        shrink: bytes(meta.geo_shrink),
        grow: bytes(meta.geo_grow),
    }
}

fn open_lock_file(path: &Path, mode: u32) -> Result<File> {
    match OpenOptions::new().read(true).write(true).create(true).mode(mode).open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(OpenOptions::new().read(true).open(path)?),
        Err(e) => Err(e.into()),
    }
}

/// Writes the two initial metas of a fresh file.
fn create_metas(file: &File, psize: usize, geo: GeoPages) -> Result<(MetaRecord, [MetaInfo; 2])> {
    file.set_len(geo.now * psize as u64)?;
    let mut meta = MetaRecord::new(psize);
    geo.store(&mut meta);
    let mut buf = vec![0u8; psize];
    let mut metas = [MetaInfo::default(); 2];
    for (slot, info) in metas.iter_mut().enumerate() {
        let sign = meta.encode_page(&mut buf, slot as u64);
        file.write_all_at(&buf, (slot * psize) as u64)?;
        *info = MetaInfo {
            txnid: 0,
            sign,
            steady: true,
        };
    }
    file.sync_all()?;
    debug!("created data file with {} byte pages", psize);
    Ok((meta, metas))
}

/// Reads both meta pages and picks the newest valid one.
fn read_metas(file: &File, file_len: u64) -> Result<(MetaRecord, [MetaInfo; 2], bool)> {
    let mut head = vec![0u8; PAGE_HEADER_SIZE + META_RECORD_SIZE];
    if file_len < head.len() as u64 {
        return Err(Error::Invalid);
    }
    file.read_exact_at(&mut head, 0)?;
    let psize = check_page_size(MetaRecord::peek_page_size(&head)?).map_err(|_| Error::Invalid)?;
    if file_len < META_PAGES * psize as u64 {
        return Err(Error::Invalid);
    }
    let mut pages = vec![0u8; 2 * psize];
    file.read_exact_at(&mut pages, 0)?;
    let slots = [
        MetaRecord::decode_page(&pages[..psize]),
        MetaRecord::decode_page(&pages[psize..]),
    ];
    let mut metas = [MetaInfo::default(); 2];
    for (info, slot) in metas.iter_mut().zip(slots.iter()) {
        if let Ok(MetaSlot::Valid(m)) = slot {
            *info = MetaInfo {
                txnid: m.txnid,
                sign: m.sign,
                steady: m.is_steady(),
            };
        }
    }
    let (meta, torn) = pick_meta(slots)?;
    if meta.page_size as usize != psize {
        return Err(Error::Corrupted);
    }
    Ok((meta, metas, torn))
}

/// Writes the pages of `snap` as a standalone data file.
fn copy_image(snap: &Snapshot, dest: &Path) -> Result<()> {
    let psize = snap.page_size;
    let last = snap.meta.last_pgno;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(DEFAULT_FILE_MODE)
        .open(dest)?;
    let mut meta = snap.meta;
    meta.flags = META_STEADY;
    meta.geo_now = meta.geo_now.clamp(last, meta.geo_upper.max(last));
    file.set_len(meta.geo_now * psize as u64)?;
    if last > META_PAGES {
        let body = snap.pages(META_PAGES, last - META_PAGES, last)?;
        file.write_all_at(body, META_PAGES * psize as u64)?;
    }
    let mut buf = vec![0u8; psize];
    for slot in 0..META_PAGES {
        meta.encode_page(&mut buf, slot);
        file.write_all_at(&buf, slot * psize as u64)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Appends every entry of `src` to the table `name` of `dst`.
fn copy_table(
    src_txn: &Transaction<'_>,
    src: Database,
    dst_txn: &mut Transaction<'_>,
    name: Option<&str>,
    flags: DbFlags,
) -> Result<()> {
    let dst = dst_txn.open_table(name, flags | DbFlags::CREATE)?;
    let append = if flags.is_dupsort() {
        PutFlags::APPENDDUP
    } else {
        PutFlags::APPEND
    };
    let mut cursor = src_txn.open_cursor(src)?;
    for item in cursor.iter(src_txn) {
        let (key, data) = item?;
        dst_txn.put(dst, &key, &data, append)?;
    }
    Ok(())
}
