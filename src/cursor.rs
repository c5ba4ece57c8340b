use std::cmp::Ordering;

use crate::constants::PutFlags;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::TableRecord;
use crate::page::LeafValue;
use crate::transaction::{count_dups, Transaction};
use crate::tree::{self, Cmp, Path, Probe};
use crate::value::Val;

/// Positioning operation for [`Cursor::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// First entry of the table
    First,
    /// First value of the current key
    FirstDup,
    /// Exact (key, value) pair
    GetBoth,
    /// First value not below the given one, under the exact key
    GetBothRange,
    GetCurrent,
    Last,
    /// Last value of the current key
    LastDup,
    Next,
    NextDup,
    /// First value of the next key
    NextNoDup,
    Prev,
    PrevDup,
    /// Last value of the previous key
    PrevNoDup,
    /// Exact key
    Set,
    SetKey,
    /// First key not below the given one
    SetRange,
    /// Like `SetRange`, and also honors the value on duplicate-sorted tables.
    /// `Entry::exact` tells an exact match from a greater one.
    SetLowerBound,
}

/// Entry returned by a cursor or a range lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'t> {
    pub key: Val<'t>,
    pub data: Val<'t>,
    /// The entry matches the probe exactly rather than being the next one
    pub exact: bool,
}

/// Position relative to the entries of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Edge {
    #[default]
    Inside,
    /// Stepped past the last entry; the path still points at it
    End,
    /// Stepped before the first entry; the path still points at it
    Start,
}

/// Positionable iterator over one table.
///
/// A cursor is bound to a (transaction, table) pair and must be re-bound
/// with [`Cursor::bind`] or [`Cursor::renew`] before use under another
/// transaction. It does not borrow the transaction between calls, so it can
/// outlive it and be renewed later.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    db: Option<Database>,
    /// Serial of the bound transaction
    serial: u64,
    path: Path,
    edge: Edge,
    /// The entry under `path` took the place of a deleted one
    after_delete: bool,
    /// Transaction write count when `path` was last valid
    mutations: u64,
    /// Copy of the current entry, kept in write transactions to re-seek
    saved: Option<(Vec<u8>, Vec<u8>)>,
}

impl Cursor {
    /// Creates an unbound cursor.
    pub fn new() -> Self {
        Cursor::default()
    }

    /// Binds the cursor to `db` under `txn`, dropping its position.
    pub fn bind(&mut self, txn: &Transaction<'_>, db: Database) -> Result<()> {
        txn.check()?;
        txn.table(db)?;
        *self = Cursor {
            db: Some(db),
            serial: txn.serial(),
            mutations: txn.mutations(),
            ..Cursor::default()
        };
        Ok(())
    }

    /// Re-binds the cursor to its table under another transaction.
    pub fn renew(&mut self, txn: &Transaction<'_>) -> Result<()> {
        let db = self.db.ok_or(Error::InvalidArgument)?;
        self.bind(txn, db)
    }

    pub fn db(&self) -> Option<Database> {
        self.db
    }

    /// Clones the binding and position into `dest`.
    pub fn copy_to(&self, dest: &mut Cursor) {
        dest.clone_from(self);
    }

    pub fn close(self) {}

    /// Checks the binding and returns the table as the transaction sees it.
    fn bound(&mut self, txn: &Transaction<'_>) -> Result<(TableRecord, Cmp)> {
        let db = self.db.ok_or(Error::InvalidArgument)?;
        if txn.serial() != self.serial {
            return Err(Error::InvalidArgument);
        }
        txn.check()?;
        let (rec, flags) = txn.table(db)?;
        let cmp = Cmp::for_flags(flags);
        if self.mutations != txn.mutations() {
            self.mutations = txn.mutations();
            self.reseek(txn, &rec, &cmp)?;
        }
        Ok((rec, cmp))
    }

    /// Finds the saved entry again after the tree changed under the cursor.
    fn reseek(&mut self, txn: &Transaction<'_>, rec: &TableRecord, cmp: &Cmp) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let Some((key, data)) = self.saved.take() else {
            self.unset();
            return Ok(());
        };
        let probe = if cmp.is_dupsort() {
            Probe::Pair(&key, &data)
        } else {
            Probe::Key(&key)
        };
        if tree::lower_bound(txn, rec.root, cmp, probe, &mut self.path)? {
            let (k, v) = tree::entry(txn, &self.path)?;
            let same = cmp.keys(k, &key).is_eq() && (!cmp.is_dupsort() || stored(v) == data.as_slice());
            if !same {
                self.after_delete = true;
                self.edge = Edge::Inside;
            }
            self.save(txn)?;
        } else if tree::last(txn, rec.root, &mut self.path)? {
            self.edge = Edge::End;
            self.save(txn)?;
        } else {
            self.unset();
        }
        Ok(())
    }

    fn unset(&mut self) {
        self.path.clear();
        self.edge = Edge::Inside;
        self.after_delete = false;
        self.saved = None;
    }

    fn save(&mut self, txn: &Transaction<'_>) -> Result<()> {
        if txn.is_readonly() || self.path.is_empty() {
            return Ok(());
        }
        let (k, v) = tree::entry(txn, &self.path)?;
        let (key, data) = self.saved.get_or_insert_with(Default::default);
        key.clear();
        key.extend_from_slice(k);
        data.clear();
        data.extend_from_slice(stored(v));
        Ok(())
    }

    /// Makes the path the current position and returns its entry.
    fn land<'t>(&mut self, txn: &'t Transaction<'_>, exact: bool) -> Result<Option<Entry<'t>>> {
        self.edge = Edge::Inside;
        self.after_delete = false;
        self.save(txn)?;
        current(txn, &self.path, exact).map(Some)
    }

    /// Result of a seek that found nothing.
    fn miss<'t>(&mut self) -> Result<Option<Entry<'t>>> {
        self.unset();
        Ok(None)
    }

    fn is_positioned(&self) -> bool {
        !self.path.is_empty()
    }

    /// Positions the cursor and returns the entry there, `None` if there is
    /// no such entry.
    ///
    /// Seeks that miss leave the cursor unpositioned. Steps that run off an
    /// edge or out of the current key leave the position as it was.
    pub fn get<'t>(
        &mut self,
        txn: &'t Transaction<'_>,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Option<Entry<'t>>> {
        let (rec, cmp) = self.bound(txn)?;
        match op {
            CursorOp::First => {
                if tree::first(txn, rec.root, &mut self.path)? {
                    self.land(txn, true)
                } else {
                    self.miss()
                }
            }
            CursorOp::Last => {
                if tree::last(txn, rec.root, &mut self.path)? {
                    self.land(txn, true)
                } else {
                    self.miss()
                }
            }
            CursorOp::GetCurrent => {
                if !self.is_positioned() || self.edge != Edge::Inside {
                    return Ok(None);
                }
                current(txn, &self.path, true).map(Some)
            }
            CursorOp::Next => self.step_forward(txn, &rec),
            CursorOp::Prev => self.step_back(txn, &rec),
            CursorOp::Set | CursorOp::SetKey => {
                let key = key.ok_or(Error::InvalidArgument)?;
                if seek_key(txn, &rec, &cmp, key, &mut self.path)? {
                    self.land(txn, true)
                } else {
                    self.miss()
                }
            }
            CursorOp::SetRange => {
                let key = key.ok_or(Error::InvalidArgument)?;
                if tree::lower_bound(txn, rec.root, &cmp, Probe::Key(key), &mut self.path)? {
                    let exact = cmp.keys(tree::entry(txn, &self.path)?.0, key).is_eq();
                    self.land(txn, exact)
                } else {
                    self.miss()
                }
            }
            CursorOp::SetLowerBound => {
                let key = key.ok_or(Error::InvalidArgument)?;
                let probe = match data {
                    Some(d) if cmp.is_dupsort() => Probe::Pair(key, d),
                    _ => Probe::Key(key),
                };
                if !tree::lower_bound(txn, rec.root, &cmp, probe, &mut self.path)? {
                    return self.miss();
                }
                let (k, v) = tree::pair(txn, &self.path)?;
                let exact = cmp.keys(k, key).is_eq()
                    && match data {
                        Some(d) if cmp.is_dupsort() => cmp.values(v, d).is_eq(),
                        _ => true,
                    };
                self.land(txn, exact)
            }
            CursorOp::GetBoth | CursorOp::GetBothRange => {
                let key = key.ok_or(Error::InvalidArgument)?;
                let data = data.ok_or(Error::InvalidArgument)?;
                let range = op == CursorOp::GetBothRange && cmp.is_dupsort();
                if !cmp.is_dupsort() {
                    if seek_key(txn, &rec, &cmp, key, &mut self.path)? && tree::pair(txn, &self.path)?.1 == data {
                        return self.land(txn, true);
                    }
                    return self.miss();
                }
                let found = tree::lower_bound(txn, rec.root, &cmp, Probe::Pair(key, data), &mut self.path)?;
                if !found {
                    return self.miss();
                }
                let (k, v) = tree::pair(txn, &self.path)?;
                let key_matches = cmp.keys(k, key).is_eq();
                let exact = key_matches && cmp.values(v, data).is_eq();
                if exact || (range && key_matches) {
                    self.land(txn, exact)
                } else {
                    self.miss()
                }
            }
            CursorOp::FirstDup | CursorOp::LastDup => {
                if !self.is_positioned() || self.edge != Edge::Inside {
                    return Err(Error::InvalidArgument);
                }
                if cmp.is_dupsort() {
                    let key = tree::entry(txn, &self.path)?.0;
                    let mut probe = self.path.clone();
                    loop {
                        let moved = if op == CursorOp::FirstDup {
                            tree::step_prev(txn, &mut probe)?
                        } else {
                            tree::step_next(txn, &mut probe)?
                        };
                        if !moved || !cmp.keys(tree::entry(txn, &probe)?.0, key).is_eq() {
                            break;
                        }
                        self.path.clone_from(&probe);
                    }
                }
                self.land(txn, true)
            }
            CursorOp::NextDup | CursorOp::PrevDup => {
                if !self.is_positioned() || !cmp.is_dupsort() {
                    return Ok(None);
                }
                if op == CursorOp::NextDup && (self.edge == Edge::End) {
                    return Ok(None);
                }
                if op == CursorOp::PrevDup && self.edge == Edge::Start {
                    return Ok(None);
                }
                let here = tree::entry(txn, &self.path)?.0;
                if self.after_delete {
                    let same = self.saved_key_is(&cmp, here);
                    if op == CursorOp::NextDup {
                        // the entry under the cursor has not been returned yet
                        return if same { self.land(txn, true) } else { Ok(None) };
                    }
                    if !same && self.edge == Edge::Inside {
                        let mut probe = self.path.clone();
                        if tree::step_prev(txn, &mut probe)? && self.saved_key_is(&cmp, tree::entry(txn, &probe)?.0) {
                            self.path = probe;
                            return self.land(txn, true);
                        }
                        return Ok(None);
                    }
                }
                let key = here;
                let mut probe = self.path.clone();
                let moved = if op == CursorOp::NextDup {
                    tree::step_next(txn, &mut probe)?
                } else {
                    tree::step_prev(txn, &mut probe)?
                };
                if moved && cmp.keys(tree::entry(txn, &probe)?.0, key).is_eq() {
                    self.path = probe;
                    self.land(txn, true)
                } else {
                    Ok(None)
                }
            }
            CursorOp::NextNoDup => {
                if !self.is_positioned() {
                    return self.get(txn, None, None, CursorOp::First);
                }
                match self.edge {
                    Edge::End => return Ok(None),
                    Edge::Start => return self.land(txn, true),
                    Edge::Inside => {}
                }
                if self.after_delete && !self.saved_key_is(&cmp, tree::entry(txn, &self.path)?.0) {
                    return self.land(txn, true);
                }
                let key = tree::entry(txn, &self.path)?.0.to_vec();
                let mut probe = self.path.clone();
                loop {
                    if !tree::step_next(txn, &mut probe)? {
                        self.edge = Edge::End;
                        return Ok(None);
                    }
                    if !cmp.keys(tree::entry(txn, &probe)?.0, &key).is_eq() {
                        self.path = probe;
                        return self.land(txn, true);
                    }
                }
            }
            CursorOp::PrevNoDup => {
                if !self.is_positioned() {
                    return self.get(txn, None, None, CursorOp::Last);
                }
                if self.edge == Edge::Start {
                    return Ok(None);
                }
                if self.edge == Edge::End {
                    return self.land(txn, true);
                }
                let key = tree::entry(txn, &self.path)?.0.to_vec();
                let mut probe = self.path.clone();
                loop {
                    if !tree::step_prev(txn, &mut probe)? {
                        self.edge = Edge::Start;
                        return Ok(None);
                    }
                    if !cmp.keys(tree::entry(txn, &probe)?.0, &key).is_eq() {
                        self.path = probe;
                        return self.land(txn, true);
                    }
                }
            }
        }
    }

    /// Whether the entry deleted last had `key`.
    fn saved_key_is(&self, cmp: &Cmp, key: &[u8]) -> bool {
        matches!(&self.saved, Some((k, _)) if cmp.keys(k, key).is_eq())
    }

    fn step_forward<'t>(&mut self, txn: &'t Transaction<'_>, rec: &TableRecord) -> Result<Option<Entry<'t>>> {
        if !self.is_positioned() {
            return if tree::first(txn, rec.root, &mut self.path)? {
                self.land(txn, true)
            } else {
                self.miss()
            };
        }
        match self.edge {
            Edge::End => return Ok(None),
            Edge::Start => return self.land(txn, true),
            Edge::Inside if self.after_delete => return self.land(txn, true),
            Edge::Inside => {}
        }
        if tree::step_next(txn, &mut self.path)? {
            self.land(txn, true)
        } else {
            self.edge = Edge::End;
            Ok(None)
        }
    }

    fn step_back<'t>(&mut self, txn: &'t Transaction<'_>, rec: &TableRecord) -> Result<Option<Entry<'t>>> {
        if !self.is_positioned() {
            return if tree::last(txn, rec.root, &mut self.path)? {
                self.land(txn, true)
            } else {
                self.miss()
            };
        }
        match self.edge {
            Edge::Start => return Ok(None),
            Edge::End => return self.land(txn, true),
            Edge::Inside => {}
        }
        if tree::step_prev(txn, &mut self.path)? {
            self.land(txn, true)
        } else {
            self.edge = Edge::Start;
            self.after_delete = false;
            Ok(None)
        }
    }

    pub fn first<'t>(&mut self, txn: &'t Transaction<'_>) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, None, None, CursorOp::First)?.map(Entry::pair))
    }

    pub fn last<'t>(&mut self, txn: &'t Transaction<'_>) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, None, None, CursorOp::Last)?.map(Entry::pair))
    }

    pub fn next<'t>(&mut self, txn: &'t Transaction<'_>) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, None, None, CursorOp::Next)?.map(Entry::pair))
    }

    pub fn prev<'t>(&mut self, txn: &'t Transaction<'_>) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, None, None, CursorOp::Prev)?.map(Entry::pair))
    }

    pub fn set<'t>(&mut self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, Some(key), None, CursorOp::Set)?.map(Entry::pair))
    }

    pub fn set_range<'t>(&mut self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<Option<(Val<'t>, Val<'t>)>> {
        Ok(self.get(txn, Some(key), None, CursorOp::SetRange)?.map(Entry::pair))
    }

    /// Stores an entry and positions the cursor on it.
    ///
    /// With `CURRENT` the value of the entry under the cursor is replaced;
    /// `key` must equal its key.
    pub fn put(&mut self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8], flags: PutFlags) -> Result<()> {
        let (_, cmp) = self.bound(txn)?;
        let db = self.db.ok_or(Error::InvalidArgument)?;
        if flags.contains(PutFlags::CURRENT) {
            if !self.is_positioned() || self.edge != Edge::Inside {
                return Err(Error::InvalidArgument);
            }
            let (k, v) = tree::pair(&*txn, &self.path)?;
            if !cmp.keys(k, key).is_eq() {
                return Err(Error::KeyMismatch);
            }
            if cmp.is_dupsort() {
                let old = v.to_vec();
                if cmp.values(&old, data) != Ordering::Equal {
                    txn.delete(db, key, Some(&old))?;
                    txn.put(db, key, data, PutFlags::UPSERT)?;
                }
            } else {
                txn.put(db, key, data, flags)?;
            }
        } else {
            txn.put(db, key, data, flags)?;
        }
        self.mutations = txn.mutations();
        let (rec, _) = txn.table(db)?;
        let probe = if cmp.is_dupsort() {
            Probe::Pair(key, data)
        } else {
            Probe::Key(key)
        };
        if tree::lower_bound(&*txn, rec.root, &cmp, probe, &mut self.path)? {
            self.edge = Edge::Inside;
            self.after_delete = false;
            self.save(txn)?;
        } else {
            self.unset();
        }
        Ok(())
    }

    /// Deletes the entry under the cursor, or with `ALLDUPS` every value of
    /// its key. The cursor moves to the entry that followed.
    pub fn delete(&mut self, txn: &mut Transaction<'_>, flags: PutFlags) -> Result<()> {
        let (_, cmp) = self.bound(txn)?;
        let db = self.db.ok_or(Error::InvalidArgument)?;
        if !self.is_positioned() || self.edge != Edge::Inside {
            return Err(Error::InvalidArgument);
        }
        let (k, v) = tree::pair(&*txn, &self.path)?;
        let (key, data) = (k.to_vec(), v.to_vec());
        if cmp.is_dupsort() && !flags.contains(PutFlags::ALLDUPS) {
            txn.delete(db, &key, Some(&data))?;
        } else {
            txn.delete(db, &key, None)?;
        }
        self.mutations = txn.mutations();
        let (rec, _) = txn.table(db)?;
        let probe = if cmp.is_dupsort() {
            Probe::Pair(&key, &data)
        } else {
            Probe::Key(&key)
        };
        if tree::lower_bound(&*txn, rec.root, &cmp, probe, &mut self.path)? {
            self.edge = Edge::Inside;
        } else if tree::last(&*txn, rec.root, &mut self.path)? {
            self.edge = Edge::End;
        } else {
            self.unset();
            return Ok(());
        }
        self.after_delete = true;
        // remember what was deleted so the dup-aware steps know the old key
        self.saved = Some((key, data));
        Ok(())
    }

    /// Number of values under the current key.
    pub fn count(&mut self, txn: &Transaction<'_>) -> Result<usize> {
        let (_, cmp) = self.bound(txn)?;
        if !self.is_positioned() || self.edge != Edge::Inside {
            return Err(Error::InvalidArgument);
        }
        count_dups(txn, &cmp, &self.path)
    }

    /// True when the cursor is unpositioned or has run off an edge.
    pub fn eof(&self) -> bool {
        !self.is_positioned() || self.edge != Edge::Inside
    }

    pub fn on_first(&mut self, txn: &Transaction<'_>) -> Result<bool> {
        self.bound(txn)?;
        if !self.is_positioned() {
            return Ok(false);
        }
        let mut probe = self.path.clone();
        Ok(self.edge != Edge::End && !tree::step_prev(txn, &mut probe)?)
    }

    pub fn on_last(&mut self, txn: &Transaction<'_>) -> Result<bool> {
        self.bound(txn)?;
        if !self.is_positioned() {
            return Ok(false);
        }
        let mut probe = self.path.clone();
        Ok(self.edge != Edge::Start && !tree::step_next(txn, &mut probe)?)
    }

    /// Approximate number of entries from this cursor to `other`, negative
    /// when `other` comes first. Both must be positioned on the same table.
    pub fn estimate_distance(&mut self, txn: &Transaction<'_>, other: &mut Cursor) -> Result<i64> {
        self.bound(txn)?;
        other.bound(txn)?;
        if self.db != other.db || !self.is_positioned() || !other.is_positioned() {
            return Err(Error::InvalidArgument);
        }
        Ok(rank(txn, &other.path)? - rank(txn, &self.path)?)
    }

    /// Iterates the whole table from the first entry.
    pub fn iter<'c, 't, 'env>(&'c mut self, txn: &'t Transaction<'env>) -> Iter<'c, 't, 'env> {
        Iter::new(self, txn, CursorOp::First, None, CursorOp::Next)
    }

    /// Iterates from the first key not below `key`.
    pub fn iter_from<'c, 't, 'env>(&'c mut self, txn: &'t Transaction<'env>, key: &[u8]) -> Iter<'c, 't, 'env> {
        Iter::new(self, txn, CursorOp::SetRange, Some(key.to_vec()), CursorOp::Next)
    }

    /// Iterates the values of one key.
    pub fn iter_dup_of<'c, 't, 'env>(&'c mut self, txn: &'t Transaction<'env>, key: &[u8]) -> Iter<'c, 't, 'env> {
        Iter::new(self, txn, CursorOp::Set, Some(key.to_vec()), CursorOp::NextDup)
    }
}

impl<'t> Entry<'t> {
    fn pair(self) -> (Val<'t>, Val<'t>) {
        (self.key, self.data)
    }
}

/// Value bytes kept in the leaf, used to re-find an entry.
fn stored<'a>(v: LeafValue<'a>) -> &'a [u8] {
    match v {
        LeafValue::Inline(d) => d,
        LeafValue::Overflow { .. } => &[],
    }
}

fn current<'t>(txn: &'t Transaction<'_>, path: &Path, exact: bool) -> Result<Entry<'t>> {
    let (k, v) = tree::pair(txn, path)?;
    Ok(Entry {
        key: Val::new(k),
        data: Val::new(v),
        exact,
    })
}

fn seek_key(txn: &Transaction<'_>, rec: &TableRecord, cmp: &Cmp, key: &[u8], path: &mut Path) -> Result<bool> {
    if !tree::lower_bound(txn, rec.root, cmp, Probe::Key(key), path)? {
        return Ok(false);
    }
    Ok(cmp.keys(tree::entry(txn, path)?.0, key).is_eq())
}

/// Position of a path in key order, counted with the fan-out seen along it.
fn rank(txn: &Transaction<'_>, path: &Path) -> Result<i64> {
    let mut rank = 0i64;
    for &(pgno, idx) in path {
        let count = tree::page_ref(txn, pgno)?.count() as i64;
        rank = rank * count.max(1) + idx as i64;
    }
    Ok(rank)
}

/// Iterator over cursor entries. Ends at the first error.
pub struct Iter<'c, 't, 'env> {
    cursor: &'c mut Cursor,
    txn: &'t Transaction<'env>,
    op: Option<CursorOp>,
    key: Option<Vec<u8>>,
    then: CursorOp,
}

impl<'c, 't, 'env> Iter<'c, 't, 'env> {
    fn new(
        cursor: &'c mut Cursor,
        txn: &'t Transaction<'env>,
        op: CursorOp,
        key: Option<Vec<u8>>,
        then: CursorOp,
    ) -> Self {
        Iter {
            cursor,
            txn,
            op: Some(op),
            key,
            then,
        }
    }
}

impl<'t> Iterator for Iter<'_, 't, '_> {
    type Item = Result<(Val<'t>, Val<'t>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let op = self.op?;
        let key = self.key.take();
        match self.cursor.get(self.txn, key.as_deref(), None, op) {
            Ok(Some(entry)) => {
                self.op = Some(self.then);
                Some(Ok(entry.pair()))
            }
            Ok(None) => {
                self.op = None;
                None
            }
            Err(e) => {
                self.op = None;
                Some(Err(e))
            }
        }
    }
}
