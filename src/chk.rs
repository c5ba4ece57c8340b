//! Consistency check.
//!
//! [`check`] reads a closed data file without opening an environment,
//! verifies both meta pages and every tree reachable from the newest one,
//! and optionally rewrites a damaged meta page from the good one. An open
//! environment is checked through a pinned read snapshot instead.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use fs2::FileExt as _;
use log::{info, warn};
use memmap2::MmapOptions;

use crate::constants::{DbFlags, DATA_FILE_NAME, LOCK_FILE_NAME, LOCK_SUFFIX, META_PAGES};
use crate::env::{catalog_entries, Snapshot};
use crate::error::{Error, Result};
use crate::meta::{pick_meta, MetaRecord, MetaSlot, TableRecord, META_RECORD_SIZE, META_STEADY};
use crate::page::PAGE_HEADER_SIZE;
use crate::tree::{self, Cmp, Path as TreePath};

bitflags! {
    /// Options of [`check`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChkFlags: u32 {
        /// Rewrite a damaged meta page from the good one
        const WRITE = 0x01;
        /// Report every table, not just problems
        const VERBOSE = 0x02;
    }
}

/// Outcome of [`check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChkReport {
    /// Number of problems found
    pub problems: u64,
    /// A meta page was rewritten
    pub repaired: bool,
    /// Transaction of the meta page that was checked
    pub txnid: u64,
    pub last_pgno: u64,
    /// Allocated pages no tree refers to
    pub free_pages: u64,
    /// Human-readable report
    pub output: String,
}

impl ChkReport {
    pub fn is_ok(&self) -> bool {
        self.problems == 0
    }

    fn problem(&mut self, msg: impl AsRef<str>) {
        self.problems += 1;
        let _ = writeln!(self.output, " ! {}", msg.as_ref());
    }

    fn note(&mut self, msg: impl AsRef<str>) {
        let _ = writeln!(self.output, " - {}", msg.as_ref());
    }
}

/// Data file for `path`, which is either an environment directory or the
/// data file itself.
fn data_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(DATA_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Lock file belonging to the data file `data`.
fn lock_file(data: &Path) -> PathBuf {
    match (data.file_name(), data.parent()) {
        (Some(name), Some(dir)) if name == DATA_FILE_NAME => dir.join(LOCK_FILE_NAME),
        _ => {
            let mut lock = data.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            PathBuf::from(lock)
        }
    }
}

/// Takes the environment lock of `data`, if it has a lock file, so no
/// environment can open the file while it is checked.
fn lock_unused(data: &Path) -> Result<Option<File>> {
    match OpenOptions::new().read(true).open(lock_file(data)) {
        Ok(lock) => {
            lock.try_lock_exclusive().map_err(|_| Error::Busy)?;
            Ok(Some(lock))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Checks the environment at `path`, which must not be open.
///
/// Fails with `Busy` while an environment holds the file, and otherwise
/// only when the file cannot be read as an environment at all; anything
/// wrong inside it is counted in the report.
pub fn check<P: AsRef<Path>>(path: P, flags: ChkFlags) -> Result<ChkReport> {
    let path = data_file(path.as_ref());
    let verbose = flags.contains(ChkFlags::VERBOSE);
    let file = OpenOptions::new()
        .read(true)
        .write(flags.contains(ChkFlags::WRITE))
        .open(&path)?;
    let _lock = lock_unused(&path)?;
    let file_len = file.metadata()?.len();
    let mut report = ChkReport::default();
    let _ = writeln!(report.output, "checking {}", path.display());

    let mut head = vec![0u8; PAGE_HEADER_SIZE + META_RECORD_SIZE];
    if file_len < head.len() as u64 {
        return Err(Error::Invalid);
    }
    file.read_exact_at(&mut head, 0)?;
    let psize = MetaRecord::peek_page_size(&head)?;
    if !psize.is_power_of_two() || file_len < META_PAGES * psize as u64 {
        return Err(Error::Invalid);
    }
    let mut pages = vec![0u8; 2 * psize];
    file.read_exact_at(&mut pages, 0)?;

    let slots = [
        MetaRecord::decode_page(&pages[..psize]),
        MetaRecord::decode_page(&pages[psize..]),
    ];
    let mut bad = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        match slot {
            Ok(MetaSlot::Valid(m)) => {
                if verbose {
                    let kind = if m.is_steady() { "steady" } else { "weak" };
                    report.note(format!("meta {}: txn {}, {}, sign {:#018x}", i, m.txnid, kind, m.sign));
                }
            }
            Ok(MetaSlot::Torn) => {
                report.problem(format!("meta {}: checksum mismatch", i));
                bad.push(i);
            }
            Err(e) => {
                report.problem(format!("meta {}: {}", i, e));
                bad.push(i);
            }
        }
    }
    let (meta, _) = pick_meta(slots)?;
    report.txnid = meta.txnid;
    report.last_pgno = meta.last_pgno;

    if meta.last_pgno * psize as u64 > file_len {
        report.problem(format!(
            "file holds {} pages, meta uses {}",
            file_len / psize as u64,
            meta.last_pgno
        ));
    } else {
        // SAFETY: the environment lock is held, so no environment writes or
        // resizes the file while it is mapped here.
        let map = unsafe { MmapOptions::new().len(file_len as usize).map(&file)? };
        let snap = Snapshot::over(&map, psize, meta);
        check_trees(&snap, &mut report, verbose);
    }

    if !bad.is_empty() && flags.contains(ChkFlags::WRITE) {
        let mut good = meta;
        good.flags |= META_STEADY;
        file.sync_all()?;
        let mut buf = vec![0u8; psize];
        for &i in &bad {
            good.encode_page(&mut buf, i as u64);
            file.write_all_at(&buf, i as u64 * psize as u64)?;
            report.note(format!("meta {}: rewritten from txn {}", i, good.txnid));
        }
        file.sync_all()?;
        report.repaired = true;
        info!("{}: repaired {} meta page(s)", path.display(), bad.len());
    }

    summarize(&mut report, &path);
    Ok(report)
}

/// Checks every tree of a snapshot pinned by a live read transaction.
pub(crate) fn check_snapshot(snap: &Snapshot, path: &Path, verbose: bool) -> ChkReport {
    let mut report = ChkReport {
        txnid: snap.meta.txnid,
        last_pgno: snap.meta.last_pgno,
        ..ChkReport::default()
    };
    let _ = writeln!(report.output, "checking {} at txn {}", path.display(), snap.meta.txnid);
    check_trees(snap, &mut report, verbose);
    summarize(&mut report, path);
    report
}

fn summarize(report: &mut ChkReport, path: &Path) {
    let _ = writeln!(
        report.output,
        "{} problem(s), txn {}, {} pages, {} free",
        report.problems, report.txnid, report.last_pgno, report.free_pages
    );
    if report.problems > 0 {
        warn!("{}: {} problem(s) found", path.display(), report.problems);
    }
}

fn check_trees(snap: &Snapshot, report: &mut ChkReport, verbose: bool) {
    let last = snap.meta.last_pgno;
    let mut used = vec![false; last as usize];

    let mut tables: Vec<(String, TableRecord)> = vec![
        ("@catalog".to_owned(), snap.meta.catalog),
        ("@main".to_owned(), snap.meta.main),
    ];
    match catalog_entries(snap, snap.meta.catalog.root) {
        Ok(entries) => {
            for (name, rec) in entries {
                tables.push((String::from_utf8_lossy(&name).into_owned(), rec));
            }
        }
        Err(e) => report.problem(format!("catalog unreadable: {}", e)),
    }

    for (name, rec) in &tables {
        let mut pages = 0u64;
        let mut clash = None;
        let walked = tree::walk(snap, rec.root, &mut |pgno, n| {
            for p in pgno..pgno + n {
                match used.get_mut(p as usize) {
                    Some(seen) if !*seen => *seen = true,
                    Some(_) => clash = clash.or(Some(p)),
                    None => return Err(Error::PageNotFound),
                }
            }
            pages += n;
            Ok(())
        });
        if let Err(e) = walked {
            report.problem(format!("{}: tree walk failed: {}", name, e));
            continue;
        }
        if let Some(p) = clash {
            report.problem(format!("{}: page {} is used twice", name, p));
        }
        match check_order(snap, rec) {
            Ok(entries) if entries != rec.entries => report.problem(format!(
                "{}: {} entries found, record says {}",
                name, entries, rec.entries
            )),
            Ok(_) => {}
            Err(e) => report.problem(format!("{}: {}", name, e)),
        }
        if verbose {
            report.note(format!(
                "{}: {} entries, depth {}, {} pages",
                name, rec.entries, rec.depth, pages
            ));
        }
    }

    report.free_pages = used.iter().skip(META_PAGES as usize).filter(|u| !**u).count() as u64;
}

/// Walks a table in order and returns its entry count.
fn check_order(snap: &Snapshot, rec: &TableRecord) -> Result<u64> {
    let cmp = Cmp::for_flags(DbFlags::from_bits_truncate(rec.flags));
    let mut path = TreePath::new();
    if !tree::first(snap, rec.root, &mut path)? {
        return Ok(0);
    }
    let mut count = 1u64;
    let (k, v) = tree::pair(snap, &path)?;
    let mut prev = (k.to_vec(), v.to_vec());
    while tree::step_next(snap, &mut path)? {
        let (k, v) = tree::pair(snap, &path)?;
        let order = cmp.keys(&prev.0, k).then_with(|| {
            if cmp.is_dupsort() {
                cmp.values(&prev.1, v)
            } else {
                std::cmp::Ordering::Less
            }
        });
        if order.is_ge() {
            return Err(Error::Corrupted);
        }
        prev = (k.to_vec(), v.to_vec());
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_reported_as_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = check(dir.path().join("nothing.dat"), ChkFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::NotExists));
    }

    #[test]
    fn foreign_file_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("junk.dat");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();
        assert!(matches!(check(&path, ChkFlags::empty()), Err(Error::Invalid)));
    }

    #[test]
    fn lock_file_sits_next_to_data_file() {
        assert_eq!(lock_file(Path::new("/db/mdbx.dat")), Path::new("/db/mdbx.lck"));
        assert_eq!(lock_file(Path::new("/db/single")), Path::new("/db/single-lck"));
    }
}
