//! Copy-on-write B+tree over a page source.
//!
//! Readers walk pages straight out of the map. Writers decode the page they
//! change, edit the entries and write the result back into dirty pages,
//! splitting, merging and re-rooting on the way up. A page that is already
//! dirty in the writing transaction is updated in place; any other page is
//! copied to a fresh page number and the old one is retired.
//!
//! Duplicate-sorted tables keep each (key, value) pair as its own leaf
//! entry, ordered by key and then by value. Branch separators of such tables
//! carry both parts.

use std::cmp::Ordering;

use log::trace;

use crate::constants::{DbFlags, NO_PAGE};
use crate::error::{Error, Result};
use crate::meta::TableRecord;
use crate::page::{
    encode_overflow, needs_overflow, overflow_data, overflow_pages, BranchEntry, LeafData,
    LeafEntry, LeafValue, Node, PageRef, PAGE_HEADER_SIZE,
};

/// Deepest tree a cursor will follow.
pub(crate) const MAX_DEPTH: usize = 32;

/// Root-to-leaf position: page number and entry index at each level.
pub(crate) type Path = Vec<(u64, usize)>;

pub(crate) trait PageSource {
    fn page_size(&self) -> usize;

    /// One page, read-only.
    fn page(&self, pgno: u64) -> Result<&[u8]>;

    /// An overflow run of `npages` pages starting at `pgno`.
    fn run(&self, pgno: u64, npages: u64) -> Result<&[u8]>;
}

/// Structural events counted in the environment's page statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOp {
    Cow,
    Split,
    Merge,
}

pub(crate) trait PageStore: PageSource {
    fn is_dirty(&self, pgno: u64) -> bool;

    /// Allocates `npages` contiguous zeroed dirty pages.
    fn alloc(&mut self, npages: u64) -> Result<u64>;

    /// Dirty buffer starting at `pgno`.
    fn page_mut(&mut self, pgno: u64) -> Result<&mut [u8]>;

    fn retire(&mut self, pgno: u64, npages: u64);

    /// Pages using fewer bytes than this are merged with a sibling.
    fn merge_threshold(&self) -> usize;

    fn note(&mut self, op: TreeOp);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
    Lexical,
    Reverse,
    Integer,
}

impl Order {
    pub(crate) fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Order::Lexical => a.cmp(b),
            Order::Reverse => a.iter().rev().cmp(b.iter().rev()),
            Order::Integer => match (a.len(), b.len()) {
                (4, 4) => read_u32(a).cmp(&read_u32(b)),
                (8, 8) => read_u64(a).cmp(&read_u64(b)),
                _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            },
        }
    }
}

fn read_u32(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(b);
    u32::from_ne_bytes(buf)
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_ne_bytes(buf)
}

/// Sort order of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cmp {
    pub(crate) key: Order,
    /// Value order, present for duplicate-sorted tables
    pub(crate) dup: Option<Order>,
}

/// Search target. `Key` on a duplicate-sorted table sorts before every
/// value of that key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Probe<'a> {
    Key(&'a [u8]),
    Pair(&'a [u8], &'a [u8]),
}

impl Cmp {
    pub(crate) fn for_flags(flags: DbFlags) -> Cmp {
        let key = if flags.contains(DbFlags::INTEGERKEY) {
            Order::Integer
        } else if flags.contains(DbFlags::REVERSEKEY) {
            Order::Reverse
        } else {
            Order::Lexical
        };
        let dup = flags.is_dupsort().then(|| {
            if flags.contains(DbFlags::INTEGERDUP) {
                Order::Integer
            } else if flags.contains(DbFlags::REVERSEDUP) {
                Order::Reverse
            } else {
                Order::Lexical
            }
        });
        Cmp { key, dup }
    }

    pub(crate) fn is_dupsort(&self) -> bool {
        self.dup.is_some()
    }

    pub(crate) fn keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.key.compare(a, b)
    }

    pub(crate) fn values(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.dup.unwrap_or(Order::Lexical).compare(a, b)
    }

    /// Orders an entry (or separator) against a probe.
    pub(crate) fn against(&self, key: &[u8], data: &[u8], probe: Probe<'_>) -> Ordering {
        match probe {
            Probe::Key(k) => match self.keys(key, k) {
                Ordering::Equal if self.is_dupsort() => Ordering::Greater,
                ord => ord,
            },
            Probe::Pair(k, d) => match self.keys(key, k) {
                Ordering::Equal if self.is_dupsort() => self.values(data, d),
                ord => ord,
            },
        }
    }
}

pub(crate) fn page_ref<S: PageSource + ?Sized>(src: &S, pgno: u64) -> Result<PageRef<'_>> {
    let page = PageRef::new(src.page(pgno)?);
    if page.pgno() != pgno {
        return Err(Error::Corrupted);
    }
    Ok(page)
}

/// Resolves a leaf value to its bytes.
pub(crate) fn value<'s, S: PageSource + ?Sized>(src: &'s S, v: LeafValue<'s>) -> Result<&'s [u8]> {
    match v {
        LeafValue::Inline(d) => Ok(d),
        LeafValue::Overflow { pgno, len } => {
            let n = overflow_pages(src.page_size(), len);
            overflow_data(src.run(pgno, n)?, len)
        }
    }
}

/// Key and raw value at a leaf position.
pub(crate) fn entry<'s, S: PageSource + ?Sized>(
    src: &'s S,
    path: &[(u64, usize)],
) -> Result<(&'s [u8], LeafValue<'s>)> {
    let &(pgno, idx) = path.last().ok_or(Error::InvalidArgument)?;
    let page = page_ref(src, pgno)?;
    if !page.is_leaf() || idx >= page.count() {
        return Err(Error::Corrupted);
    }
    Ok((page.leaf_key(idx), page.leaf_value(idx)))
}

/// Key and resolved value at a leaf position.
pub(crate) fn pair<'s, S: PageSource + ?Sized>(
    src: &'s S,
    path: &[(u64, usize)],
) -> Result<(&'s [u8], &'s [u8])> {
    let (k, v) = entry(src, path)?;
    Ok((k, value(src, v)?))
}

/// Separator value part used when comparing a leaf entry as a pair.
fn entry_value<'a>(v: LeafValue<'a>) -> &'a [u8] {
    match v {
        LeafValue::Inline(d) => d,
        LeafValue::Overflow { .. } => &[],
    }
}

fn push_level(path: &mut Path, pgno: u64, idx: usize) -> Result<()> {
    if path.len() >= MAX_DEPTH {
        return Err(Error::CursorFull);
    }
    path.push((pgno, idx));
    Ok(())
}

/// Descends to the leaf where `probe` belongs. The leaf index is the
/// insertion point and may equal the entry count.
pub(crate) fn descend<S: PageSource + ?Sized>(
    src: &S,
    root: u64,
    cmp: &Cmp,
    probe: Probe<'_>,
    path: &mut Path,
) -> Result<()> {
    path.clear();
    let mut pgno = root;
    loop {
        let page = page_ref(src, pgno)?;
        let count = page.count();
        if page.is_leaf() {
            // first entry not below the probe
            let (mut lo, mut hi) = (0, count);
            while lo < hi {
                let mid = (lo + hi) / 2;
                let ord = cmp.against(page.leaf_key(mid), entry_value(page.leaf_value(mid)), probe);
                if ord == Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            return push_level(path, pgno, lo);
        }
        if !page.is_branch() || count == 0 {
            return Err(Error::Corrupted);
        }
        // last child whose separator is not above the probe
        let (mut lo, mut hi) = (1, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ord = cmp.against(page.branch_key(mid), page.branch_data(mid), probe);
            if ord == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let idx = lo - 1;
        push_level(path, pgno, idx)?;
        pgno = page.branch_child(idx);
    }
}

/// Positions `path` on the first entry not below `probe`.
pub(crate) fn lower_bound<S: PageSource + ?Sized>(
    src: &S,
    root: u64,
    cmp: &Cmp,
    probe: Probe<'_>,
    path: &mut Path,
) -> Result<bool> {
    if root == NO_PAGE {
        path.clear();
        return Ok(false);
    }
    descend(src, root, cmp, probe, path)?;
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    if idx < page_ref(src, pgno)?.count() {
        return Ok(true);
    }
    // Past the end of this leaf: the answer is the next leaf's first entry.
    if let Some(last) = path.last_mut() {
        last.1 = idx.saturating_sub(1);
    }
    if idx == 0 {
        return Ok(false);
    }
    step_next(src, path)
}

fn descend_edge<S: PageSource + ?Sized>(
    src: &S,
    mut pgno: u64,
    path: &mut Path,
    last: bool,
) -> Result<bool> {
    loop {
        let page = page_ref(src, pgno)?;
        let count = page.count();
        if count == 0 {
            return Ok(false);
        }
        let idx = if last { count - 1 } else { 0 };
        push_level(path, pgno, idx)?;
        if page.is_leaf() {
            return Ok(true);
        }
        if !page.is_branch() {
            return Err(Error::Corrupted);
        }
        pgno = page.branch_child(idx);
    }
}

pub(crate) fn first<S: PageSource + ?Sized>(src: &S, root: u64, path: &mut Path) -> Result<bool> {
    path.clear();
    if root == NO_PAGE {
        return Ok(false);
    }
    descend_edge(src, root, path, false)
}

pub(crate) fn last<S: PageSource + ?Sized>(src: &S, root: u64, path: &mut Path) -> Result<bool> {
    path.clear();
    if root == NO_PAGE {
        return Ok(false);
    }
    descend_edge(src, root, path, true)
}

/// Moves to the next entry. Leaves `path` untouched and returns false at
/// the end of the tree.
pub(crate) fn step_next<S: PageSource + ?Sized>(src: &S, path: &mut Path) -> Result<bool> {
    for level in (0..path.len()).rev() {
        let (pgno, idx) = path[level];
        let page = page_ref(src, pgno)?;
        if idx + 1 < page.count() {
            path.truncate(level + 1);
            path[level].1 = idx + 1;
            if page.is_leaf() {
                return Ok(true);
            }
            return descend_edge(src, page.branch_child(idx + 1), path, false);
        }
    }
    Ok(false)
}

/// Moves to the previous entry. Leaves `path` untouched and returns false
/// at the start of the tree.
pub(crate) fn step_prev<S: PageSource + ?Sized>(src: &S, path: &mut Path) -> Result<bool> {
    for level in (0..path.len()).rev() {
        let (pgno, idx) = path[level];
        if idx > 0 {
            path.truncate(level + 1);
            path[level].1 = idx - 1;
            let page = page_ref(src, pgno)?;
            if page.is_leaf() {
                return Ok(true);
            }
            let child = page.branch_child(idx - 1);
            return descend_edge(src, child, path, true);
        }
    }
    Ok(false)
}

/// Calls `visit(pgno, npages)` for every page reachable from `root`,
/// overflow runs included.
pub(crate) fn walk<S, F>(src: &S, root: u64, visit: &mut F) -> Result<()>
where
    S: PageSource + ?Sized,
    F: FnMut(u64, u64) -> Result<()>,
{
    if root == NO_PAGE {
        return Ok(());
    }
    let mut stack = vec![(root, 0usize)];
    while let Some((pgno, depth)) = stack.pop() {
        if depth >= MAX_DEPTH {
            return Err(Error::Corrupted);
        }
        let page = page_ref(src, pgno)?;
        page.validate(pgno)?;
        visit(pgno, 1)?;
        for i in 0..page.count() {
            if page.is_leaf() {
                if let LeafValue::Overflow { pgno: run, len } = page.leaf_value(i) {
                    visit(run, overflow_pages(src.page_size(), len))?;
                }
            } else {
                stack.push((page.branch_child(i), depth + 1));
            }
        }
    }
    Ok(())
}

/// Checks key and value sizes for an insert into a table with `flags`.
pub(crate) fn check_sizes(
    page_size: usize,
    rec: &TableRecord,
    flags: DbFlags,
    key: &[u8],
    data: &[u8],
) -> Result<()> {
    let max_key = crate::page::max_key_size(page_size);
    if key.len() > max_key {
        return Err(Error::BadValSize);
    }
    if flags.contains(DbFlags::INTEGERKEY) && key.len() != 4 && key.len() != 8 {
        return Err(Error::BadValSize);
    }
    if flags.is_dupsort() {
        if key.len() + data.len() > max_key {
            return Err(Error::BadValSize);
        }
        if flags.contains(DbFlags::INTEGERDUP) && data.len() != 4 && data.len() != 8 {
            return Err(Error::BadValSize);
        }
        if flags.contains(DbFlags::DUPFIXED)
            && rec.dupfix_size != 0
            && rec.dupfix_size as usize != data.len()
        {
            return Err(Error::BadValSize);
        }
    } else if data.len() > crate::constants::MAX_DATA_SIZE {
        return Err(Error::TooLarge);
    }
    Ok(())
}

/// Builds a leaf entry, moving large values to an overflow run.
pub(crate) fn make_entry<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    dupsort: bool,
    key: &[u8],
    data: &[u8],
) -> Result<LeafEntry> {
    let psize = s.page_size();
    if dupsort || !needs_overflow(psize, key.len(), data.len()) {
        return Ok(LeafEntry {
            key: key.to_vec(),
            data: LeafData::Inline(data.to_vec()),
        });
    }
    let n = overflow_pages(psize, data.len());
    let pgno = s.alloc(n)?;
    encode_overflow(s.page_mut(pgno)?, pgno, n, data);
    rec.overflow_pages += n;
    trace!("overflow run of {} pages at {} for {} bytes", n, pgno, data.len());
    Ok(LeafEntry {
        key: key.to_vec(),
        data: LeafData::Overflow { pgno, len: data.len() },
    })
}

fn release_data<S: PageStore + ?Sized>(s: &mut S, rec: &mut TableRecord, data: &LeafData) {
    if let LeafData::Overflow { pgno, len } = data {
        let n = overflow_pages(s.page_size(), *len);
        s.retire(*pgno, n);
        rec.overflow_pages = rec.overflow_pages.saturating_sub(n);
    }
}

fn leaf_node<S: PageSource + ?Sized>(src: &S, pgno: u64) -> Result<Vec<LeafEntry>> {
    match Node::decode(page_ref(src, pgno)?) {
        Node::Leaf(entries) => Ok(entries),
        Node::Branch(_) => Err(Error::Corrupted),
    }
}

/// Inserts `entry` at the insertion point found by [`descend`].
pub(crate) fn insert_at<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    cmp: &Cmp,
    path: Path,
    entry: LeafEntry,
) -> Result<()> {
    rec.entries += 1;
    if rec.root == NO_PAGE {
        let pgno = s.alloc(1)?;
        Node::Leaf(vec![entry]).encode(s.page_mut(pgno)?, pgno)?;
        rec.root = pgno;
        rec.depth = 1;
        rec.leaf_pages += 1;
        return Ok(());
    }
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    let mut entries = leaf_node(s, pgno)?;
    if idx > entries.len() {
        return Err(Error::Problem);
    }
    entries.insert(idx, entry);
    write_back(s, rec, cmp, path, Node::Leaf(entries))
}

/// Replaces the value of the entry at `path`.
pub(crate) fn replace_at<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    cmp: &Cmp,
    path: Path,
    data: &[u8],
) -> Result<()> {
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    let mut entries = leaf_node(s, pgno)?;
    let old = entries.get(idx).ok_or(Error::Problem)?;
    let key = old.key.clone();
    let old_data = old.data.clone();
    let fresh = make_entry(s, rec, cmp.is_dupsort(), &key, data)?;
    release_data(s, rec, &old_data);
    entries[idx] = fresh;
    write_back(s, rec, cmp, path, Node::Leaf(entries))
}

/// Removes the entry at `path`.
pub(crate) fn delete_at<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    cmp: &Cmp,
    path: Path,
) -> Result<()> {
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    let mut entries = leaf_node(s, pgno)?;
    if idx >= entries.len() {
        return Err(Error::Problem);
    }
    let removed = entries.remove(idx);
    release_data(s, rec, &removed.data);
    rec.entries = rec.entries.saturating_sub(1);
    write_back(s, rec, cmp, path, Node::Leaf(entries))
}

/// Retires every page of the tree and resets it to empty.
pub(crate) fn clear<S: PageStore + ?Sized>(s: &mut S, rec: &mut TableRecord) -> Result<()> {
    let mut pages = Vec::new();
    walk(s, rec.root, &mut |pgno, n| {
        pages.push((pgno, n));
        Ok(())
    })?;
    for (pgno, n) in pages {
        s.retire(pgno, n);
    }
    let keep_flags = rec.flags;
    *rec = TableRecord::empty(keep_flags);
    Ok(())
}

/// Page ranges for splitting entries of the given sizes.
fn split_ranges(sizes: &[usize], capacity: usize) -> Vec<std::ops::Range<usize>> {
    let total: usize = sizes.iter().sum();
    if total <= capacity {
        return vec![0..sizes.len()];
    }
    let pages = (total + capacity - 1) / capacity;
    let target = (total + pages - 1) / pages;
    let mut ranges = Vec::with_capacity(pages + 1);
    let (mut start, mut used) = (0, 0);
    for (i, &sz) in sizes.iter().enumerate() {
        if i > start && (used + sz > capacity || used >= target) {
            ranges.push(start..i);
            start = i;
            used = 0;
        }
        used += sz;
    }
    ranges.push(start..sizes.len());
    ranges
}

/// A stored page and the separator that leads to it.
struct Piece {
    key: Vec<u8>,
    data: Vec<u8>,
    pgno: u64,
}

fn count_pages(rec: &mut TableRecord, leaf: bool, delta: i64) {
    let slot = if leaf { &mut rec.leaf_pages } else { &mut rec.branch_pages };
    *slot = slot.saturating_add_signed(delta);
}

/// Returns a dirty page number holding the current content of `pgno`.
fn touch<S: PageStore + ?Sized>(s: &mut S, pgno: u64) -> Result<u64> {
    if s.is_dirty(pgno) {
        return Ok(pgno);
    }
    let fresh = s.alloc(1)?;
    s.retire(pgno, 1);
    s.note(TreeOp::Cow);
    Ok(fresh)
}

/// Writes `node` over `pgno`, splitting as needed.
fn store<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    dupsort: bool,
    pgno: u64,
    node: Node,
) -> Result<Vec<Piece>> {
    let leaf = node.is_leaf();
    if node.is_empty() {
        s.retire(pgno, 1);
        count_pages(rec, leaf, -1);
        return Ok(Vec::new());
    }
    let capacity = s.page_size() - PAGE_HEADER_SIZE;
    let ranges = split_ranges(&node.entry_sizes(), capacity);
    if ranges.len() > 1 {
        s.note(TreeOp::Split);
        count_pages(rec, leaf, ranges.len() as i64 - 1);
    }
    let mut pieces = Vec::with_capacity(ranges.len());
    let mut chunks: Vec<Node> = Vec::with_capacity(ranges.len());
    match node {
        Node::Leaf(mut entries) => {
            for r in ranges.iter().rev() {
                chunks.push(Node::Leaf(entries.split_off(r.start)));
            }
        }
        Node::Branch(mut entries) => {
            for r in ranges.iter().rev() {
                chunks.push(Node::Branch(entries.split_off(r.start)));
            }
        }
    }
    chunks.reverse();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let target = if i == 0 { touch(s, pgno)? } else { s.alloc(1)? };
        let (key, data) = match &chunk {
            Node::Leaf(e) => {
                let data = match (&e[0].data, dupsort) {
                    (LeafData::Inline(d), true) => d.clone(),
                    _ => Vec::new(),
                };
                (e[0].key.clone(), data)
            }
            Node::Branch(e) => (e[0].key.clone(), e[0].data.clone()),
        };
        chunk.encode(s.page_mut(target)?, target)?;
        pieces.push(Piece { key, data, pgno: target });
    }
    Ok(pieces)
}

fn combine(left: Node, right: Node, sep_key: Vec<u8>, sep_data: Vec<u8>) -> Result<Node> {
    match (left, right) {
        (Node::Leaf(mut l), Node::Leaf(r)) => {
            l.extend(r);
            Ok(Node::Leaf(l))
        }
        (Node::Branch(mut l), Node::Branch(mut r)) => {
            if let Some(first) = r.first_mut() {
                first.key = sep_key;
                first.data = sep_data;
            }
            l.extend(r);
            Ok(Node::Branch(l))
        }
        _ => Err(Error::Corrupted),
    }
}

/// Propagates a modified node up to the root.
///
/// `path` ends with the node's own page; every earlier element names the
/// parent entry that leads to the next level.
fn write_back<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    cmp: &Cmp,
    mut path: Path,
    mut node: Node,
) -> Result<()> {
    let dupsort = cmp.is_dupsort();
    let (mut pgno, _) = path.pop().ok_or(Error::Problem)?;
    while let Some(&(ppgno, pidx)) = path.last() {
        let mut parent = match Node::decode(page_ref(s, ppgno)?) {
            Node::Branch(entries) => entries,
            Node::Leaf(_) => return Err(Error::Corrupted),
        };
        if pidx >= parent.len() {
            return Err(Error::Problem);
        }
        let mut slot = pidx;
        if !node.is_empty() && node.used() < s.merge_threshold() && parent.len() > 1 {
            let sib = if pidx + 1 < parent.len() { pidx + 1 } else { pidx - 1 };
            let sib_pgno = parent[sib].child;
            let sibling = Node::decode(page_ref(s, sib_pgno)?);
            let right = pidx.max(sib);
            let (sep_key, sep_data) = (parent[right].key.clone(), parent[right].data.clone());
            let leaf = node.is_leaf();
            node = if sib > pidx {
                combine(node, sibling, sep_key, sep_data)?
            } else {
                combine(sibling, node, sep_key, sep_data)?
            };
            s.retire(sib_pgno, 1);
            count_pages(rec, leaf, -1);
            s.note(TreeOp::Merge);
            parent.remove(right);
            // the merged node takes the left entry's place
            slot = pidx.min(sib);
        }
        let pieces = store(s, rec, dupsort, pgno, node)?;
        let lead = parent.remove(slot);
        for (i, piece) in pieces.into_iter().enumerate() {
            let (key, data) = if i == 0 {
                (lead.key.clone(), lead.data.clone())
            } else {
                (piece.key, piece.data)
            };
            parent.insert(slot + i, BranchEntry { key, data, child: piece.pgno });
        }
        node = Node::Branch(parent);
        pgno = ppgno;
        path.pop();
    }
    finish_root(s, rec, dupsort, pgno, node)
}

fn finish_root<S: PageStore + ?Sized>(
    s: &mut S,
    rec: &mut TableRecord,
    dupsort: bool,
    mut pgno: u64,
    mut node: Node,
) -> Result<()> {
    loop {
        if node.is_empty() {
            let leaf = node.is_leaf();
            s.retire(pgno, 1);
            count_pages(rec, leaf, -1);
            rec.root = NO_PAGE;
            rec.depth = 0;
            return Ok(());
        }
        if let Node::Branch(entries) = &node {
            if entries.len() == 1 {
                s.retire(pgno, 1);
                count_pages(rec, false, -1);
                rec.root = entries[0].child;
                rec.depth = rec.depth.saturating_sub(1);
                return Ok(());
            }
        }
        let mut pieces = store(s, rec, dupsort, pgno, node)?;
        if pieces.len() == 1 {
            rec.root = pieces.remove(0).pgno;
            return Ok(());
        }
        let entries = pieces
            .into_iter()
            .enumerate()
            .map(|(i, p)| BranchEntry {
                key: if i == 0 { Vec::new() } else { p.key },
                data: if i == 0 { Vec::new() } else { p.data },
                child: p.pgno,
            })
            .collect();
        pgno = s.alloc(1)?;
        count_pages(rec, false, 1);
        rec.depth += 1;
        node = Node::Branch(entries);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory page store for exercising the tree without a file.
    pub(crate) struct MemStore {
        pub(crate) page_size: usize,
        pub(crate) pages: HashMap<u64, Vec<u8>>,
        pub(crate) next: u64,
        pub(crate) retired: Vec<u64>,
    }

    impl MemStore {
        pub(crate) fn new(page_size: usize) -> Self {
            MemStore { page_size, pages: HashMap::new(), next: 2, retired: Vec::new() }
        }
    }

    impl PageSource for MemStore {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn page(&self, pgno: u64) -> Result<&[u8]> {
            self.pages.get(&pgno).map(|p| &p[..self.page_size]).ok_or(Error::PageNotFound)
        }

        fn run(&self, pgno: u64, _npages: u64) -> Result<&[u8]> {
            self.pages.get(&pgno).map(|p| &p[..]).ok_or(Error::PageNotFound)
        }
    }

    impl PageStore for MemStore {
        fn is_dirty(&self, pgno: u64) -> bool {
            self.pages.contains_key(&pgno)
        }

        fn alloc(&mut self, npages: u64) -> Result<u64> {
            let pgno = self.next;
            self.next += npages;
            self.pages.insert(pgno, vec![0; self.page_size * npages as usize]);
            Ok(pgno)
        }

        fn page_mut(&mut self, pgno: u64) -> Result<&mut [u8]> {
            self.pages.get_mut(&pgno).map(|p| &mut p[..]).ok_or(Error::PageNotFound)
        }

        fn retire(&mut self, pgno: u64, npages: u64) {
            for p in pgno..pgno + npages {
                self.pages.remove(&p);
                self.retired.push(p);
            }
        }

        fn merge_threshold(&self) -> usize {
            (self.page_size - PAGE_HEADER_SIZE) / 4
        }

        fn note(&mut self, _op: TreeOp) {}
    }

    pub(crate) fn put(s: &mut MemStore, rec: &mut TableRecord, cmp: &Cmp, key: &[u8], data: &[u8]) {
        let mut path = Path::new();
        let probe = if cmp.is_dupsort() { Probe::Pair(key, data) } else { Probe::Key(key) };
        if rec.root != NO_PAGE {
            descend(s, rec.root, cmp, probe, &mut path).unwrap();
        }
        let entry = make_entry(s, rec, cmp.is_dupsort(), key, data).unwrap();
        insert_at(s, rec, cmp, path, entry).unwrap();
    }

    pub(crate) fn collect(s: &MemStore, rec: &TableRecord) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut path = Path::new();
        if !first(s, rec.root, &mut path).unwrap() {
            return out;
        }
        loop {
            let (k, v) = pair(s, &path).unwrap();
            out.push((k.to_vec(), v.to_vec()));
            if !step_next(s, &mut path).unwrap() {
                return out;
            }
        }
    }

    fn be(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    #[test]
    fn split_ranges_fit_capacity() {
        let sizes = vec![100; 50];
        let ranges = split_ranges(&sizes, 1000);
        assert!(ranges.len() >= 5);
        for r in &ranges {
            assert!(sizes[r.clone()].iter().sum::<usize>() <= 1000);
            assert!(!r.is_empty());
        }
        assert_eq!(ranges.last().unwrap().end, 50);
    }

    #[test]
    fn integer_order_is_numeric() {
        let a = 2u64.to_ne_bytes();
        let b = 256u64.to_ne_bytes();
        assert_eq!(Order::Integer.compare(&a, &b), Ordering::Less);
        assert_eq!(Order::Reverse.compare(b"ab", b"ba"), Ordering::Greater);
    }

    #[test]
    fn many_inserts_stay_sorted_and_deep() {
        let mut s = MemStore::new(512);
        let mut rec = TableRecord::empty(0);
        let cmp = Cmp::for_flags(DbFlags::empty());
        for i in (0..2000u32).rev() {
            put(&mut s, &mut rec, &cmp, &be(i), b"value");
        }
        assert_eq!(rec.entries, 2000);
        assert!(rec.depth >= 3);
        let all = collect(&s, &rec);
        assert_eq!(all.len(), 2000);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        let mut pages = 0;
        walk(&s, rec.root, &mut |_, n| {
            pages += n;
            Ok(())
        })
        .unwrap();
        assert_eq!(pages, rec.leaf_pages + rec.branch_pages);
    }

    #[test]
    fn deletes_shrink_tree_to_empty() {
        let mut s = MemStore::new(512);
        let mut rec = TableRecord::empty(0);
        let cmp = Cmp::for_flags(DbFlags::empty());
        for i in 0..600u32 {
            put(&mut s, &mut rec, &cmp, &be(i), &[7u8; 20]);
        }
        for i in 0..600u32 {
            let mut path = Path::new();
            assert!(lower_bound(&s, rec.root, &cmp, Probe::Key(&be(i)), &mut path).unwrap());
            assert_eq!(pair(&s, &path).unwrap().0, &be(i));
            delete_at(&mut s, &mut rec, &cmp, path).unwrap();
            if i % 100 == 0 {
                assert_eq!(collect(&s, &rec).len() as u32, 599 - i);
            }
        }
        assert_eq!(rec.root, NO_PAGE);
        assert_eq!(rec.entries, 0);
        assert_eq!(rec.leaf_pages + rec.branch_pages, 0);
        assert!(s.pages.is_empty());
    }

    #[test]
    fn dupsort_orders_by_value() {
        let mut s = MemStore::new(512);
        let mut rec = TableRecord::empty(DbFlags::DUPSORT.bits());
        let cmp = Cmp::for_flags(DbFlags::DUPSORT);
        for v in [b"c", b"a", b"b"] {
            put(&mut s, &mut rec, &cmp, b"k", v);
        }
        put(&mut s, &mut rec, &cmp, b"j", b"z");
        let all = collect(&s, &rec);
        let flat: Vec<_> = all.iter().map(|(k, v)| (k[0], v[0])).collect();
        assert_eq!(flat, vec![(b'j', b'z'), (b'k', b'a'), (b'k', b'b'), (b'k', b'c')]);

        let mut path = Path::new();
        assert!(lower_bound(&s, rec.root, &cmp, Probe::Key(b"k"), &mut path).unwrap());
        assert_eq!(pair(&s, &path).unwrap(), (&b"k"[..], &b"a"[..]));
    }

    #[test]
    fn overflow_values_are_released() {
        let mut s = MemStore::new(512);
        let mut rec = TableRecord::empty(0);
        let cmp = Cmp::for_flags(DbFlags::empty());
        let big = vec![9u8; 3000];
        put(&mut s, &mut rec, &cmp, b"big", &big);
        assert!(rec.overflow_pages > 0);
        assert_eq!(collect(&s, &rec)[0].1, big);

        let mut path = Path::new();
        lower_bound(&s, rec.root, &cmp, Probe::Key(b"big"), &mut path).unwrap();
        replace_at(&mut s, &mut rec, &cmp, path, b"small").unwrap();
        assert_eq!(rec.overflow_pages, 0);
        assert_eq!(collect(&s, &rec)[0].1, b"small".to_vec());
    }

    #[test]
    fn lower_bound_past_end() {
        let mut s = MemStore::new(512);
        let mut rec = TableRecord::empty(0);
        let cmp = Cmp::for_flags(DbFlags::empty());
        for i in 0..100u32 {
            put(&mut s, &mut rec, &cmp, &be(i * 2), b"v");
        }
        let mut path = Path::new();
        assert!(lower_bound(&s, rec.root, &cmp, Probe::Key(&be(51)), &mut path).unwrap());
        assert_eq!(pair(&s, &path).unwrap().0, &be(52));
        assert!(!lower_bound(&s, rec.root, &cmp, Probe::Key(&be(1000)), &mut path).unwrap());
    }
}
