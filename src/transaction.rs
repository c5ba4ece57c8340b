use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::constants::{DbFlags, PutFlags, TxnFlags, META_PAGES, NO_PAGE};
use crate::cursor::{Cursor, Entry};
use crate::database::{Database, MAIN_DBI};
use crate::env::{CommitPlan, Environment, Snapshot, WriteStart};
use crate::error::{Error, Result};
use crate::meta::TableRecord;
use crate::midl::Idl;
use crate::page::{LeafValue, PAGE_HEADER_SIZE};
use crate::tree::{self, Cmp, PageSource, PageStore, Path, Probe, TreeOp};
use crate::types::{Canary, CommitLatency, DbiState, EnvInfo, PgOpStat, Stat, TableFlags, TxInfo};
use crate::value::Val;

/// Source of transaction serials. Cursors remember the serial they were
/// bound under.
static SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    /// Read-only transaction parked by `reset`, waiting for `renew`
    Reset,
    Aborted,
    Committed,
}

/// One table as seen by a transaction.
#[derive(Debug, Clone)]
pub(crate) struct TxTable {
    pub(crate) rec: TableRecord,
    pub(crate) flags: DbFlags,
    state: DbiState,
    name: Option<String>,
    generation: u32,
}

/// Private page state of the write transaction.
struct WriteState {
    /// Pages written by this transaction, keyed by first page number
    dirty: HashMap<u64, Box<[u8]>>,
    /// Single pages allocated and released again by this transaction
    loose: Vec<(u64, Box<[u8]>)>,
    /// Multi-page runs allocated and released again by this transaction
    loose_runs: Idl,
    /// Committed pages released by this transaction
    retired: Idl,
    /// Reclaimable batches handed over at begin
    pool: Vec<(u64, Idl)>,
    taken: Vec<u64>,
    next_pgno: u64,
    catalog: TableRecord,
    canary: Option<Canary>,
    /// Tables deleted by `drop_table`, closed on commit
    dropped: Vec<Database>,
    dp_limit: usize,
    merge_threshold: usize,
    lifo: bool,
    perturb: bool,
    pgop: PgOpStat,
}

impl WriteState {
    fn new(start: WriteStart) -> Self {
        let taken = start.pool.iter().map(|(txnid, _)| *txnid).collect();
        WriteState {
            dirty: HashMap::new(),
            loose: Vec::new(),
            loose_runs: Idl::new(),
            retired: Idl::new(),
            pool: start.pool,
            taken,
            next_pgno: start.snap.meta.last_pgno,
            catalog: start.snap.meta.catalog,
            canary: None,
            dropped: Vec::new(),
            dp_limit: start.dp_limit,
            merge_threshold: start.merge_threshold,
            lifo: start.lifo,
            perturb: start.perturb,
            pgop: PgOpStat::default(),
        }
    }

    /// Takes `n` contiguous free pages from the reclaimed batches.
    fn reclaim(&mut self, n: u64) -> Option<u64> {
        if let Some(pgno) = self.loose_runs.take_run(n as usize) {
            return Some(pgno);
        }
        let take = |(_, idl): &mut (u64, Idl)| idl.take_run(n as usize);
        if self.lifo {
            self.pool.iter_mut().rev().find_map(take)
        } else {
            self.pool.iter_mut().find_map(take)
        }
    }
}

fn read_pages<'a>(snap: &'a Snapshot, ws: Option<&'a WriteState>, pgno: u64, n: u64) -> Result<&'a [u8]> {
    if let Some(buf) = ws.and_then(|ws| ws.dirty.get(&pgno)) {
        let len = n as usize * snap.page_size();
        return buf.get(..len).ok_or(Error::PageNotFound);
    }
    snap.pages(pgno, n, snap.meta.last_pgno)
}

/// Page store of the write transaction.
struct Pages<'a> {
    env: &'a Environment,
    snap: &'a Snapshot,
    ws: &'a mut WriteState,
}

impl PageSource for Pages<'_> {
    fn page_size(&self) -> usize {
        self.snap.page_size()
    }

    fn page(&self, pgno: u64) -> Result<&[u8]> {
        read_pages(self.snap, Some(&*self.ws), pgno, 1)
    }

    fn run(&self, pgno: u64, npages: u64) -> Result<&[u8]> {
        read_pages(self.snap, Some(&*self.ws), pgno, npages)
    }
}

impl PageStore for Pages<'_> {
    fn is_dirty(&self, pgno: u64) -> bool {
        self.ws.dirty.contains_key(&pgno)
    }

    fn alloc(&mut self, npages: u64) -> Result<u64> {
        if self.ws.dirty.len() >= self.ws.dp_limit {
            return Err(Error::TxnFull);
        }
        let len = npages as usize * self.page_size();
        if npages == 1 {
            if let Some((pgno, mut buf)) = self.ws.loose.pop() {
                buf.fill(0);
                self.ws.dirty.insert(pgno, buf);
                trace!("reusing loose page {}", pgno);
                return Ok(pgno);
            }
        }
        let pgno = match self.ws.reclaim(npages) {
            Some(pgno) => pgno,
            None => {
                let pgno = self.ws.next_pgno;
                let end = pgno.checked_add(npages).ok_or(Error::MapFull)?;
                self.env.ensure_pages(end)?;
                self.ws.next_pgno = end;
                self.ws.pgop.newly += npages;
                pgno
            }
        };
        trace!("allocated {} page(s) at {}", npages, pgno);
        self.ws.dirty.insert(pgno, vec![0u8; len].into_boxed_slice());
        Ok(pgno)
    }

    fn page_mut(&mut self, pgno: u64) -> Result<&mut [u8]> {
        self.ws
            .dirty
            .get_mut(&pgno)
            .map(|b| &mut b[..])
            .ok_or(Error::Problem)
    }

    fn retire(&mut self, pgno: u64, npages: u64) {
        match self.ws.dirty.remove(&pgno) {
            Some(mut buf) => {
                if self.ws.perturb {
                    buf.fill(0xA5);
                }
                if npages == 1 {
                    self.ws.loose.push((pgno, buf));
                } else {
                    self.ws.loose_runs.insert_run(pgno, npages);
                }
            }
            None => self.ws.retired.insert_run(pgno, npages),
        }
    }

    fn merge_threshold(&self) -> usize {
        self.ws.merge_threshold
    }

    fn note(&mut self, op: TreeOp) {
        let pg = &mut self.ws.pgop;
        match op {
            TreeOp::Cow => pg.cow += 1,
            TreeOp::Split => pg.split += 1,
            TreeOp::Merge => pg.merge += 1,
        }
    }
}

/// Errors raised before a write touches any page. Anything else leaves
/// the transaction unusable.
fn leaves_txn_intact(err: &Error) -> bool {
    matches!(
        err,
        Error::KeyExist
            | Error::NotFound
            | Error::BadValSize
            | Error::TooLarge
            | Error::KeyMismatch
            | Error::MultiVal
            | Error::BufferTooSmall { .. }
            | Error::InvalidArgument
            | Error::Incompatible
            | Error::BadDbi
            | Error::Access
    )
}

/// Exact key lookup on a table without duplicates. Leaves `path` at the
/// insertion point.
fn seek_key<S: PageSource + ?Sized>(
    src: &S,
    rec: &TableRecord,
    cmp: &Cmp,
    key: &[u8],
    path: &mut Path,
) -> Result<bool> {
    path.clear();
    if rec.root == NO_PAGE {
        return Ok(false);
    }
    tree::descend(src, rec.root, cmp, Probe::Key(key), path)?;
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    let page = tree::page_ref(src, pgno)?;
    Ok(idx < page.count() && cmp.keys(page.leaf_key(idx), key).is_eq())
}

/// Exact (key, value) lookup on a duplicate-sorted table. Leaves `path` at
/// the insertion point.
fn seek_pair<S: PageSource + ?Sized>(
    src: &S,
    rec: &TableRecord,
    cmp: &Cmp,
    key: &[u8],
    data: &[u8],
    path: &mut Path,
) -> Result<bool> {
    path.clear();
    if rec.root == NO_PAGE {
        return Ok(false);
    }
    tree::descend(src, rec.root, cmp, Probe::Pair(key, data), path)?;
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    let page = tree::page_ref(src, pgno)?;
    if idx >= page.count() || !cmp.keys(page.leaf_key(idx), key).is_eq() {
        return Ok(false);
    }
    match page.leaf_value(idx) {
        LeafValue::Inline(d) => Ok(cmp.values(d, data).is_eq()),
        LeafValue::Overflow { .. } => Err(Error::Corrupted),
    }
}

/// Positions `path` on the first entry of `key`.
fn seek_first<S: PageSource + ?Sized>(
    src: &S,
    rec: &TableRecord,
    cmp: &Cmp,
    key: &[u8],
    path: &mut Path,
) -> Result<bool> {
    if !tree::lower_bound(src, rec.root, cmp, Probe::Key(key), path)? {
        return Ok(false);
    }
    let (k, _) = tree::entry(src, path)?;
    Ok(cmp.keys(k, key).is_eq())
}

/// The entry at or after an insertion point.
fn successor<'s, S: PageSource + ?Sized>(src: &'s S, path: &Path) -> Result<Option<&'s [u8]>> {
    let Some(&(pgno, idx)) = path.last() else {
        return Ok(None);
    };
    if idx < tree::page_ref(src, pgno)?.count() {
        return Ok(Some(tree::entry(src, path)?.0));
    }
    if idx == 0 {
        return Ok(None);
    }
    let mut next = path.clone();
    if let Some(last) = next.last_mut() {
        last.1 = idx - 1;
    }
    if tree::step_next(src, &mut next)? {
        Ok(Some(tree::entry(src, &next)?.0))
    } else {
        Ok(None)
    }
}

/// Counts the values stored under the key at `path`.
pub(crate) fn count_dups<S: PageSource + ?Sized>(src: &S, cmp: &Cmp, path: &Path) -> Result<usize> {
    if !cmp.is_dupsort() {
        return Ok(1);
    }
    let key = tree::entry(src, path)?.0;
    let mut count = 1;
    let mut back = path.clone();
    while tree::step_prev(src, &mut back)? && cmp.keys(tree::entry(src, &back)?.0, key).is_eq() {
        count += 1;
    }
    let mut fwd = path.clone();
    while tree::step_next(src, &mut fwd)? && cmp.keys(tree::entry(src, &fwd)?.0, key).is_eq() {
        count += 1;
    }
    Ok(count)
}

/// Inserts or overwrites one entry.
fn upsert(p: &mut Pages<'_>, t: &mut TxTable, key: &[u8], data: &[u8], flags: PutFlags) -> Result<()> {
    tree::check_sizes(p.page_size(), &t.rec, t.flags, key, data)?;
    let cmp = Cmp::for_flags(t.flags);
    let mut path = Path::new();
    if !cmp.is_dupsort() {
        if seek_key(p, &t.rec, &cmp, key, &mut path)? {
            if flags.contains(PutFlags::NOOVERWRITE) {
                return Err(Error::KeyExist);
            }
            if flags.contains(PutFlags::APPEND) {
                return Err(Error::KeyMismatch);
            }
            return tree::replace_at(p, &mut t.rec, &cmp, path, data);
        }
        if flags.contains(PutFlags::CURRENT) {
            return Err(Error::NotFound);
        }
        if flags.contains(PutFlags::APPEND) && successor(p, &path)?.is_some() {
            return Err(Error::KeyMismatch);
        }
        let entry = tree::make_entry(p, &mut t.rec, false, key, data)?;
        return tree::insert_at(p, &mut t.rec, &cmp, path, entry);
    }

    let exists = seek_first(p, &t.rec, &cmp, key, &mut path)?;
    if exists && flags.contains(PutFlags::NOOVERWRITE) {
        return Err(Error::KeyExist);
    }
    if flags.contains(PutFlags::CURRENT) && !exists {
        return Err(Error::NotFound);
    }
    if exists && flags.intersects(PutFlags::ALLDUPS | PutFlags::CURRENT) {
        let dups = count_dups(p, &cmp, &path)?;
        if flags.contains(PutFlags::CURRENT) && !flags.contains(PutFlags::ALLDUPS) && dups > 1 {
            return Err(Error::MultiVal);
        }
        for _ in 0..dups {
            seek_first(p, &t.rec, &cmp, key, &mut path)?;
            tree::delete_at(p, &mut t.rec, &cmp, std::mem::take(&mut path))?;
        }
    }
    if seek_pair(p, &t.rec, &cmp, key, data, &mut path)? {
        if flags.contains(PutFlags::NODUPDATA) {
            return Err(Error::KeyExist);
        }
        return Ok(());
    }
    if flags.intersects(PutFlags::APPEND | PutFlags::APPENDDUP) {
        let next = successor(p, &path)?;
        let misplaced = match next {
            None => false,
            Some(_) if flags.contains(PutFlags::APPEND) => true,
            Some(k) => cmp.keys(k, key).is_eq(),
        };
        if misplaced {
            return Err(Error::KeyMismatch);
        }
    }
    if t.flags.contains(DbFlags::DUPFIXED) && t.rec.dupfix_size == 0 {
        t.rec.dupfix_size = data.len() as u32;
    }
    let entry = tree::make_entry(p, &mut t.rec, true, key, data)?;
    tree::insert_at(p, &mut t.rec, &cmp, path, entry)
}

/// Removes `key`, or only the pair (`key`, `data`) when `data` is given.
fn remove(p: &mut Pages<'_>, t: &mut TxTable, key: &[u8], data: Option<&[u8]>) -> Result<()> {
    let cmp = Cmp::for_flags(t.flags);
    let mut path = Path::new();
    if cmp.is_dupsort() {
        if let Some(data) = data {
            if !seek_pair(p, &t.rec, &cmp, key, data, &mut path)? {
                return Err(Error::NotFound);
            }
            return tree::delete_at(p, &mut t.rec, &cmp, path);
        }
        if !seek_first(p, &t.rec, &cmp, key, &mut path)? {
            return Err(Error::NotFound);
        }
        let dups = count_dups(p, &cmp, &path)?;
        for _ in 0..dups {
            seek_first(p, &t.rec, &cmp, key, &mut path)?;
            tree::delete_at(p, &mut t.rec, &cmp, std::mem::take(&mut path))?;
        }
        return Ok(());
    }
    if !seek_key(p, &t.rec, &cmp, key, &mut path)? {
        return Err(Error::NotFound);
    }
    if let Some(data) = data {
        if tree::pair(p, &path)?.1 != data {
            return Err(Error::NotFound);
        }
    }
    tree::delete_at(p, &mut t.rec, &cmp, path)
}

/// Stores a table record in the catalog.
fn catalog_put(p: &mut Pages<'_>, catalog: &mut TableRecord, name: &str, rec: &TableRecord) -> Result<()> {
    let cmp = Cmp::for_flags(DbFlags::empty());
    let mut path = Path::new();
    let bytes = rec.to_bytes();
    if seek_key(p, catalog, &cmp, name.as_bytes(), &mut path)? {
        return tree::replace_at(p, catalog, &cmp, path, &bytes);
    }
    let entry = tree::make_entry(p, catalog, false, name.as_bytes(), &bytes)?;
    tree::insert_at(p, catalog, &cmp, path, entry)
}

fn catalog_lookup<S: PageSource + ?Sized>(src: &S, catalog: &TableRecord, name: &str) -> Result<Option<TableRecord>> {
    let cmp = Cmp::for_flags(DbFlags::empty());
    let mut path = Path::new();
    if !seek_key(src, catalog, &cmp, name.as_bytes(), &mut path)? {
        return Ok(None);
    }
    let (_, data) = tree::pair(src, &path)?;
    TableRecord::from_bytes(data).map(Some)
}

/// A read-only snapshot or the single write session of an environment.
///
/// Values returned by reads borrow the transaction, so they cannot outlive
/// it or survive the next write. The type is neither `Send` nor `Sync`:
/// a transaction stays on the thread that began it.
pub struct Transaction<'env> {
    /// Environment the transaction belongs to
    env: &'env Environment,
    /// Flags given to begin
    flags: TxnFlags,
    state: TxnState,
    /// Set by `mark_broken` or a failed write; only abort remains valid
    broken: bool,
    /// Unique per begin and renew
    serial: u64,
    /// Thread that began the transaction
    owner: ThreadId,
    /// Committed state the transaction started from
    snap: Snapshot,
    /// Reader slot, readers only
    slot: Option<usize>,
    /// Tables touched so far, indexed by handle
    tables: RefCell<Vec<Option<TxTable>>>,
    /// Dirty pages and allocation state, writers only
    write: Option<WriteState>,
    /// Bumped on every write so cursors can re-seek
    mutations: u64,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<'env> Transaction<'env> {
    pub(crate) fn begin(env: &'env Environment, flags: TxnFlags) -> Result<Self> {
        let (snap, slot, write, state) = if flags.is_readonly() {
            let prepare = flags.contains(TxnFlags::RDONLY_PREPARE);
            let (snap, slot) = env.start_read(!prepare)?;
            let state = if prepare { TxnState::Reset } else { TxnState::Active };
            (snap, Some(slot), None, state)
        } else {
            env.lock_writer(flags.contains(TxnFlags::TRY))?;
            let start = match env.start_write() {
                Ok(start) => start,
                Err(e) => {
                    env.unlock_writer();
                    return Err(e);
                }
            };
            (start.snap, None, Some(WriteState::new(start)), TxnState::Active)
        };
        let txn = Transaction {
            env,
            flags,
            state,
            broken: false,
            serial: next_serial(),
            owner: thread::current().id(),
            snap,
            slot,
            tables: RefCell::new(Vec::new()),
            write,
            mutations: 0,
            _not_send: PhantomData,
        };
        trace!("begin txn {} ({:?})", txn.id(), flags);
        Ok(txn)
    }

    fn check_thread(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(Error::ThreadMismatch);
        }
        Ok(())
    }

    /// Fails unless the transaction is active, unbroken and on its thread.
    pub(crate) fn check(&self) -> Result<()> {
        self.check_thread()?;
        if self.state != TxnState::Active || self.broken {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check()?;
        if self.write.is_none() {
            return Err(Error::Access);
        }
        Ok(())
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn mutations(&self) -> u64 {
        self.mutations
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.snap
    }

    pub fn env(&self) -> &'env Environment {
        self.env
    }

    /// Snapshot id for readers, the id the commit will get for writers.
    pub fn id(&self) -> u64 {
        if self.write.is_some() {
            self.snap.meta.txnid + 1
        } else {
            self.snap.meta.txnid
        }
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_readonly(&self) -> bool {
        self.write.is_none()
    }

    pub fn is_reset(&self) -> bool {
        self.state == TxnState::Reset
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TxnState::Aborted
    }

    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Ends the transaction and hands back what it held.
    fn finish(&mut self, state: TxnState) {
        let write = self.write.take();
        self.env.end_txn(self.slot.take());
        if let Some(ws) = write {
            let mut tables = self.env.tables().write();
            if state == TxnState::Committed {
                tables.settle(self.serial);
                let live = self.tables.get_mut();
                for db in ws.dropped {
                    // re-created after the drop
                    if matches!(live.get(db.dbi() as usize), Some(Some(t)) if t.generation == db.generation()) {
                        continue;
                    }
                    // the handle may already be gone if the caller closed it
                    let _ = tables.close(db);
                }
            } else {
                tables.rollback(self.serial);
            }
            drop(tables);
            self.env.unlock_writer();
        }
        self.tables.get_mut().clear();
        self.state = state;
        trace!("txn {} finished as {:?}", self.id(), state);
    }

    /// Commits and returns the time spent in each stage.
    ///
    /// The transaction ends even when the commit fails. Committing a broken
    /// transaction aborts it and fails with `BadTxn`.
    pub fn commit_ex(&mut self) -> Result<CommitLatency> {
        self.check_thread()?;
        if self.state != TxnState::Active {
            return Err(Error::BadTxn);
        }
        if self.broken {
            self.finish(TxnState::Aborted);
            return Err(Error::BadTxn);
        }
        let started = Instant::now();
        if self.write.is_none() {
            self.finish(TxnState::Committed);
            return Ok(CommitLatency {
                whole: started.elapsed(),
                ..CommitLatency::default()
            });
        }
        match self.commit_write() {
            Ok(mut latency) => {
                let ending = Instant::now();
                self.finish(TxnState::Committed);
                latency.ending = ending.elapsed();
                latency.whole = started.elapsed();
                Ok(latency)
            }
            Err(e) => {
                warn!("commit of txn {} failed: {}", self.id(), e);
                self.finish(TxnState::Aborted);
                Err(e)
            }
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.commit_ex().map(|_| ())
    }

    fn commit_write(&mut self) -> Result<CommitLatency> {
        let mut latency = CommitLatency::default();
        let txnid = self.id();
        let env = self.env;
        let nosync = self.flags.contains(TxnFlags::NOSYNC);
        let nometasync = self.flags.contains(TxnFlags::NOMETASYNC);
        let snap = &self.snap;
        let tables = &mut self.tables;
        let ws = self.write.as_mut().ok_or(Error::Problem)?;

        let started = Instant::now();
        let mut main = snap.meta.main;
        let mut catalog = ws.catalog;
        {
            let mut pages = Pages { env, snap, ws: &mut *ws };
            for table in tables.get_mut().iter_mut().flatten() {
                if !table.state.contains(DbiState::DIRTY) {
                    continue;
                }
                table.rec.mod_txnid = txnid;
                match &table.name {
                    None => main = table.rec,
                    Some(name) => catalog_put(&mut pages, &mut catalog, name, &table.rec)?,
                }
            }
        }
        ws.catalog = catalog;
        latency.preparation = started.elapsed();

        let started = Instant::now();
        let mut pool = std::mem::take(&mut ws.pool);
        let mut loose = Idl::from_unsorted(ws.loose.drain(..).map(|(pgno, _)| pgno).collect());
        loose.merge(&ws.loose_runs);
        if !loose.is_empty() {
            pool.push((0, loose));
        }
        // Free pages at the end of the file are dropped instead of kept.
        let mut free = Idl::new();
        for (_, idl) in &pool {
            free.merge(idl);
        }
        let tail = free.tail_run(ws.next_pgno);
        if tail > 0 && ws.next_pgno - tail >= META_PAGES {
            ws.next_pgno -= tail;
            for (_, idl) in pool.iter_mut() {
                idl.truncate_from(ws.next_pgno);
            }
            trace!("released {} free pages at the end of the file", tail);
        }
        latency.gc = started.elapsed();

        let mut meta = snap.meta;
        meta.txnid = txnid;
        meta.last_pgno = ws.next_pgno;
        meta.catalog = ws.catalog;
        meta.main = main;
        if let Some(canary) = ws.canary {
            meta.set_canary(canary);
        }
        let mut pages: Vec<(u64, Box<[u8]>)> = ws.dirty.drain().collect();
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);
        let plan = CommitPlan {
            meta,
            pages,
            retired: std::mem::take(&mut ws.retired),
            taken: std::mem::take(&mut ws.taken),
            pool,
            nosync,
            nometasync,
            pgop: ws.pgop,
        };
        let times = env.publish(plan)?;
        latency.gc += times.gc;
        latency.write = times.write;
        latency.sync = times.sync;
        debug!("txn {} committed", txnid);
        Ok(latency)
    }

    /// Discards the transaction. Valid while active or reset.
    pub fn abort(&mut self) -> Result<()> {
        self.check_thread()?;
        match self.state {
            TxnState::Active | TxnState::Reset => {
                self.finish(TxnState::Aborted);
                Ok(())
            }
            _ => Err(Error::BadTxn),
        }
    }

    /// Parks a read-only transaction, releasing its reader slot and snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.check_thread()?;
        if self.write.is_some() {
            return Err(Error::InvalidArgument);
        }
        match self.state {
            TxnState::Active => {}
            TxnState::Reset => return Ok(()),
            _ => return Err(Error::BadTxn),
        }
        if let Some(slot) = self.slot.take() {
            self.env.release_read(slot);
        }
        self.tables.get_mut().clear();
        self.state = TxnState::Reset;
        Ok(())
    }

    /// Reactivates a reset read-only transaction on the newest snapshot.
    /// An active reader is reset first.
    pub fn renew(&mut self) -> Result<()> {
        self.check_thread()?;
        if self.write.is_some() {
            return Err(Error::InvalidArgument);
        }
        if self.broken {
            return Err(Error::BadTxn);
        }
        match self.state {
            TxnState::Active => self.reset()?,
            TxnState::Reset => {}
            _ => return Err(Error::BadTxn),
        }
        let (snap, slot) = self.env.resume_read(self.slot)?;
        self.snap = snap;
        self.slot = Some(slot);
        self.serial = next_serial();
        self.state = TxnState::Active;
        Ok(())
    }

    /// Marks the transaction unusable; only `abort` is accepted afterwards.
    pub fn mark_broken(&mut self) -> Result<()> {
        self.check_thread()?;
        if self.state != TxnState::Active {
            return Err(Error::BadTxn);
        }
        self.broken = true;
        Ok(())
    }

    pub fn info(&self, scan_rlt: bool) -> Result<TxInfo> {
        self.check()?;
        let psize = self.snap.page_size() as u64;
        let geo = self.env.geometry();
        let (used, retired, dirty) = match &self.write {
            Some(ws) => (
                ws.next_pgno * psize,
                ws.retired.len() as u64 * psize,
                ws.dirty.len() as u64 * psize,
            ),
            None => (self.snap.meta.last_pgno * psize, 0, 0),
        };
        let reader_lag = if self.write.is_none() && scan_rlt {
            self.env.info()?.recent_txnid.saturating_sub(self.snap.meta.txnid)
        } else {
            0
        };
        Ok(TxInfo {
            id: self.id(),
            reader_lag,
            space_used: used,
            space_limit_soft: geo.current,
            space_limit_hard: geo.upper,
            space_retired: retired,
            space_leftover: geo.upper.saturating_sub(used),
            space_dirty: dirty,
        })
    }

    pub fn env_info(&self) -> Result<EnvInfo> {
        self.check()?;
        self.env.info()
    }

    /// Loads the record of `db` into the transaction if needed.
    fn load_table(&self, db: Database) -> Result<()> {
        let dbi = db.dbi() as usize;
        if let Some(Some(t)) = self.tables.borrow().get(dbi) {
            if t.generation == db.generation() {
                return Ok(());
            }
        }
        let slot = self.env.tables().read().get(db)?.clone();
        let rec = match &slot.name {
            None => self.snap.meta.main,
            Some(name) => {
                let catalog = self.write.as_ref().map_or(self.snap.meta.catalog, |ws| ws.catalog);
                catalog_lookup(self, &catalog, name)?.ok_or(Error::BadDbi)?
            }
        };
        let mut tables = self.tables.borrow_mut();
        if tables.len() <= dbi {
            tables.resize(dbi + 1, None);
        }
        tables[dbi] = Some(TxTable {
            rec,
            flags: DbFlags::from_bits_truncate(rec.flags),
            state: DbiState::FRESH,
            name: slot.name,
            generation: db.generation(),
        });
        Ok(())
    }

    /// Record and flags of `db` as seen by this transaction.
    pub(crate) fn table(&self, db: Database) -> Result<(TableRecord, DbFlags)> {
        self.load_table(db)?;
        let tables = self.tables.borrow();
        let t = tables.get(db.dbi() as usize).and_then(Option::as_ref).ok_or(Error::BadDbi)?;
        Ok((t.rec, t.flags))
    }

    /// Applies the open flags to a table that already exists.
    fn adopt(&self, db: Database, flags: DbFlags) -> Result<Database> {
        self.load_table(db)?;
        let wanted = flags.persistent();
        let mut tables = self.tables.borrow_mut();
        let t = tables.get_mut(db.dbi() as usize).and_then(Option::as_mut).ok_or(Error::BadDbi)?;
        if t.flags == wanted || flags.contains(DbFlags::ACCEDE) {
            return Ok(db);
        }
        if flags.contains(DbFlags::CREATE) && t.rec.is_empty() && self.write.is_some() {
            t.flags = wanted;
            t.rec.flags = wanted.bits();
            t.rec.dupfix_size = 0;
            t.state |= DbiState::DIRTY;
            self.env.tables().write().set_flags(db, wanted);
            debug!("table {:?} re-created with flags {:?}", t.name, wanted);
            return Ok(db);
        }
        Err(Error::Incompatible)
    }

    /// Opens the main table (`name` of `None`) or a named table.
    ///
    /// Named tables need `set_max_tables` before the environment is opened.
    /// Without `CREATE` a missing table is `NotFound`; persistent flags that
    /// differ from the stored ones are `Incompatible` unless `ACCEDE`.
    pub fn open_table(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.check()?;
        let Some(name) = name else {
            return self.adopt(Database::main(), flags);
        };
        if name.len() > crate::page::max_key_size(self.snap.page_size()) {
            return Err(Error::BadValSize);
        }
        let known = self.env.tables().read().find(name);
        if let Some(db) = known {
            if self.has_loaded(db) {
                return self.adopt(db, flags);
            }
        }
        let catalog = self.write.as_ref().map_or(self.snap.meta.catalog, |ws| ws.catalog);
        match catalog_lookup(self, &catalog, name)? {
            Some(rec) => {
                let stored = DbFlags::from_bits_truncate(rec.flags);
                let db = match known {
                    Some(db) => db,
                    None => {
                        let limit = self.env.named_table_limit();
                        let mut reg = self.env.tables().write();
                        match reg.find(name) {
                            Some(db) => db,
                            None => reg.register(name, stored, None, limit)?,
                        }
                    }
                };
                self.adopt(db, flags)
            }
            // The handle may belong to a table this snapshot does not hold:
            // one created later, or dropped earlier in this transaction.
            None => {
                if !flags.contains(DbFlags::CREATE) {
                    return Err(Error::NotFound);
                }
                if self.write.is_none() {
                    return Err(Error::Access);
                }
                let wanted = flags.persistent();
                let db = match known {
                    Some(db) => {
                        self.env.tables().write().set_flags(db, wanted);
                        db
                    }
                    None => {
                        let limit = self.env.named_table_limit();
                        self.env.tables().write().register(name, wanted, Some(self.serial), limit)?
                    }
                };
                let dbi = db.dbi() as usize;
                let mut tables = self.tables.borrow_mut();
                if tables.len() <= dbi {
                    tables.resize(dbi + 1, None);
                }
                tables[dbi] = Some(TxTable {
                    rec: TableRecord::empty(wanted.bits()),
                    flags: wanted,
                    state: DbiState::CREAT | DbiState::DIRTY | DbiState::FRESH,
                    name: Some(name.to_owned()),
                    generation: db.generation(),
                });
                debug!("created table {:?} with flags {:?}", name, wanted);
                Ok(db)
            }
        }
    }

    /// Whether `db` is already loaded into this transaction.
    fn has_loaded(&self, db: Database) -> bool {
        matches!(
            self.tables.borrow().get(db.dbi() as usize),
            Some(Some(t)) if t.generation == db.generation()
        )
    }

    pub fn table_stat(&self, db: Database) -> Result<Stat> {
        self.check()?;
        let (rec, _) = self.table(db)?;
        Ok(rec.stat(self.snap.page_size()))
    }

    pub fn table_flags(&self, db: Database) -> Result<TableFlags> {
        self.check()?;
        self.load_table(db)?;
        let tables = self.tables.borrow();
        let t = tables.get(db.dbi() as usize).and_then(Option::as_ref).ok_or(Error::BadDbi)?;
        Ok(TableFlags {
            flags: t.flags,
            state: t.state,
        })
    }

    /// Runs a write against one table, marking the transaction broken if
    /// the write fails after touching pages.
    fn with_table<R>(
        &mut self,
        db: Database,
        f: impl FnOnce(&mut Pages<'_>, &mut TxTable) -> Result<R>,
    ) -> Result<R> {
        self.check_write()?;
        self.load_table(db)?;
        self.mutations += 1;
        let env = self.env;
        let snap = &self.snap;
        let broken = &mut self.broken;
        let ws = self.write.as_mut().ok_or(Error::Access)?;
        let table = self
            .tables
            .get_mut()
            .get_mut(db.dbi() as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::BadDbi)?;
        let mut pages = Pages { env, snap, ws };
        let result = f(&mut pages, table);
        match &result {
            Ok(_) => table.state |= DbiState::DIRTY,
            Err(e) if !leaves_txn_intact(e) => {
                warn!("write failed, transaction is now broken: {}", e);
                *broken = true;
            }
            Err(_) => {}
        }
        result
    }

    /// Empties a table. With `delete` a named table is also removed and its
    /// handle is closed once the transaction commits.
    pub fn drop_table(&mut self, db: Database, delete: bool) -> Result<()> {
        self.with_table(db, |p, t| tree::clear(p, &mut t.rec))?;
        if !delete || db.dbi() == MAIN_DBI {
            return Ok(());
        }
        let dbi = db.dbi() as usize;
        let name = self.tables.get_mut()[dbi].as_ref().and_then(|t| t.name.clone());
        let env = self.env;
        let snap = &self.snap;
        let ws = self.write.as_mut().ok_or(Error::Access)?;
        if let Some(name) = name {
            let mut catalog = ws.catalog;
            let cmp = Cmp::for_flags(DbFlags::empty());
            let mut path = Path::new();
            let mut pages = Pages { env, snap, ws: &mut *ws };
            if seek_key(&pages, &catalog, &cmp, name.as_bytes(), &mut path)? {
                if let Err(e) = tree::delete_at(&mut pages, &mut catalog, &cmp, path) {
                    self.broken = true;
                    return Err(e);
                }
            }
            ws.catalog = catalog;
            debug!("deleted table {:?}", name);
        }
        ws.dropped.push(db);
        self.tables.get_mut()[dbi] = None;
        Ok(())
    }

    /// Value stored under `key`; the first one for duplicate-sorted tables.
    pub fn get<'t>(&'t self, db: Database, key: &[u8]) -> Result<Option<Val<'t>>> {
        self.check()?;
        let (rec, flags) = self.table(db)?;
        let cmp = Cmp::for_flags(flags);
        let mut path = Path::new();
        if !seek_first(self, &rec, &cmp, key, &mut path)? {
            return Ok(None);
        }
        let (_, data) = tree::pair(self, &path)?;
        Ok(Some(Val::new(data)))
    }

    /// First entry not below `key` (and `data`, for duplicate-sorted tables).
    pub fn get_equal_or_great<'t>(
        &'t self,
        db: Database,
        key: &[u8],
        data: Option<&[u8]>,
    ) -> Result<Option<Entry<'t>>> {
        self.check()?;
        let (rec, flags) = self.table(db)?;
        let cmp = Cmp::for_flags(flags);
        let probe = match data {
            Some(d) if cmp.is_dupsort() => Probe::Pair(key, d),
            _ => Probe::Key(key),
        };
        let mut path = Path::new();
        if !tree::lower_bound(self, rec.root, &cmp, probe, &mut path)? {
            return Ok(None);
        }
        let (k, v) = tree::pair(self, &path)?;
        let exact = cmp.keys(k, key).is_eq()
            && match data {
                Some(d) if cmp.is_dupsort() => cmp.values(v, d).is_eq(),
                _ => true,
            };
        Ok(Some(Entry {
            key: Val::new(k),
            data: Val::new(v),
            exact,
        }))
    }

    /// Value under `key` together with the number of values the key holds.
    pub fn get_ex<'t>(&'t self, db: Database, key: &[u8]) -> Result<Option<(Val<'t>, usize)>> {
        self.check()?;
        let (rec, flags) = self.table(db)?;
        let cmp = Cmp::for_flags(flags);
        let mut path = Path::new();
        if !seek_first(self, &rec, &cmp, key, &mut path)? {
            return Ok(None);
        }
        let (_, data) = tree::pair(self, &path)?;
        Ok(Some((Val::new(data), count_dups(self, &cmp, &path)?)))
    }

    pub fn put(&mut self, db: Database, key: &[u8], data: &[u8], flags: PutFlags) -> Result<()> {
        if flags.contains(PutFlags::RESERVE) {
            return self.reserve(db, key, data.len(), flags).map(|_| ());
        }
        self.with_table(db, |p, t| upsert(p, t, key, data, flags))
    }

    /// Inserts a zeroed value of `len` bytes and returns it for filling in.
    /// Not available on duplicate-sorted tables.
    pub fn reserve(&mut self, db: Database, key: &[u8], len: usize, flags: PutFlags) -> Result<&mut [u8]> {
        self.check_write()?;
        let (_, tflags) = self.table(db)?;
        if tflags.is_dupsort() {
            return Err(Error::InvalidArgument);
        }
        let zeros = vec![0u8; len];
        let flags = flags - PutFlags::RESERVE;
        self.with_table(db, |p, t| upsert(p, t, key, &zeros, flags))?;

        let (rec, tflags) = self.table(db)?;
        let cmp = Cmp::for_flags(tflags);
        let mut path = Path::new();
        if !seek_key(self, &rec, &cmp, key, &mut path)? {
            return Err(Error::Problem);
        }
        let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
        let (target, range) = match tree::entry(self, &path)?.1 {
            LeafValue::Inline(_) => {
                let (start, len) = tree::page_ref(self, pgno)?.leaf_data_range(idx);
                (pgno, start..start + len)
            }
            LeafValue::Overflow { pgno, len } => (pgno, PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len),
        };
        let ws = self.write.as_mut().ok_or(Error::Access)?;
        ws.dirty
            .get_mut(&target)
            .and_then(|buf| buf.get_mut(range))
            .ok_or(Error::Problem)
    }

    /// Stores consecutive fixed-size values of `items` under `key` in a
    /// `DUPFIXED` table. Returns how many were stored.
    pub fn put_multiple(
        &mut self,
        db: Database,
        key: &[u8],
        items: &[u8],
        item_size: usize,
        flags: PutFlags,
    ) -> Result<usize> {
        self.check_write()?;
        let (_, tflags) = self.table(db)?;
        if !tflags.contains(DbFlags::DUPFIXED) {
            return Err(Error::InvalidArgument);
        }
        if item_size == 0 || items.len() % item_size != 0 {
            return Err(Error::BadValSize);
        }
        let flags = flags - PutFlags::MULTIPLE;
        self.with_table(db, |p, t| {
            let mut stored = 0;
            for item in items.chunks(item_size) {
                upsert(p, t, key, item, flags)?;
                stored += 1;
            }
            Ok(stored)
        })
    }

    /// Replaces the value of `key` with `new`, or deletes it when `new` is
    /// `None`, copying the previous value into `old`.
    ///
    /// Returns the length of the previous value, `None` if there was none.
    /// When `old` is too small nothing changes and `BufferTooSmall` reports
    /// the size needed. On a duplicate-sorted table `CURRENT | NOOVERWRITE`
    /// selects the duplicate equal to the contents of `old`; otherwise a key
    /// with several values fails with `MultiVal`.
    pub fn replace(
        &mut self,
        db: Database,
        key: &[u8],
        new: Option<&[u8]>,
        old: &mut [u8],
        flags: PutFlags,
    ) -> Result<Option<usize>> {
        self.check_write()?;
        let (rec, tflags) = self.table(db)?;
        let cmp = Cmp::for_flags(tflags);
        let mut path = Path::new();

        if cmp.is_dupsort() && flags.contains(PutFlags::CURRENT | PutFlags::NOOVERWRITE) {
            let selected = old.to_vec();
            if !seek_pair(self, &rec, &cmp, key, &selected, &mut path)? {
                return Err(Error::NotFound);
            }
            self.with_table(db, |p, t| {
                remove(p, t, key, Some(&selected))?;
                match new {
                    Some(data) => upsert(p, t, key, data, PutFlags::UPSERT),
                    None => Ok(()),
                }
            })?;
            return Ok(Some(selected.len()));
        }

        let previous = if seek_first(self, &rec, &cmp, key, &mut path)? {
            if count_dups(self, &cmp, &path)? > 1 {
                return Err(Error::MultiVal);
            }
            Some(tree::pair(self, &path)?.1.to_vec())
        } else {
            None
        };
        match previous {
            Some(prev) => {
                if flags.contains(PutFlags::NOOVERWRITE) {
                    return Err(Error::KeyExist);
                }
                if old.len() < prev.len() {
                    return Err(Error::BufferTooSmall {
                        required: prev.len(),
                    });
                }
                self.with_table(db, |p, t| {
                    if cmp.is_dupsort() || new.is_none() {
                        remove(p, t, key, None)?;
                    }
                    match new {
                        Some(data) => upsert(p, t, key, data, PutFlags::UPSERT),
                        None => Ok(()),
                    }
                })?;
                old[..prev.len()].copy_from_slice(&prev);
                Ok(Some(prev.len()))
            }
            None => {
                if flags.contains(PutFlags::CURRENT) {
                    return Err(Error::NotFound);
                }
                match new {
                    Some(data) => {
                        self.with_table(db, |p, t| upsert(p, t, key, data, PutFlags::UPSERT))?;
                        Ok(None)
                    }
                    None => Err(Error::NotFound),
                }
            }
        }
    }

    /// Deletes `key` with all its values, or only the pair (`key`, `data`).
    /// Fails with `NotFound` when there is nothing to delete.
    pub fn delete(&mut self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        self.with_table(db, |p, t| remove(p, t, key, data))
    }

    /// Sets the canary. `v` becomes this transaction's id if `x`, `y` or `z`
    /// change.
    pub fn put_canary(&mut self, canary: Canary) -> Result<()> {
        self.check_write()?;
        let current = self.canary()?;
        if (current.x, current.y, current.z) == (canary.x, canary.y, canary.z) {
            return Ok(());
        }
        let id = self.id();
        if let Some(ws) = self.write.as_mut() {
            ws.canary = Some(Canary { v: id, ..canary });
        }
        Ok(())
    }

    pub fn canary(&self) -> Result<Canary> {
        self.check()?;
        Ok(self
            .write
            .as_ref()
            .and_then(|ws| ws.canary)
            .unwrap_or_else(|| self.snap.meta.canary()))
    }

    /// Opens a cursor on `db` bound to this transaction.
    pub fn open_cursor(&self, db: Database) -> Result<Cursor> {
        let mut cursor = Cursor::new();
        cursor.bind(self, db)?;
        Ok(cursor)
    }
}

impl PageSource for Transaction<'_> {
    fn page_size(&self) -> usize {
        self.snap.page_size()
    }

    fn page(&self, pgno: u64) -> Result<&[u8]> {
        read_pages(&self.snap, self.write.as_ref(), pgno, 1)
    }

    fn run(&self, pgno: u64, npages: u64) -> Result<&[u8]> {
        read_pages(&self.snap, self.write.as_ref(), pgno, npages)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Active | TxnState::Reset) {
            self.finish(TxnState::Aborted);
        }
    }
}
