//! Meta pages.
//!
//! Pages 0 and 1 each hold a meta record. A commit writes the record for
//! transaction `t` into page `t % 2`, so the previous record stays intact
//! until the new one is complete. On open the newest record whose checksum
//! verifies wins.

use std::mem::{offset_of, size_of};

use xxhash_rust::xxh3::xxh3_64;

use crate::constants::{PageFlags, FORMAT_VERSION, MAGIC, NO_PAGE};
use crate::error::{Error, Result};
use crate::page::{get_u32, get_u64, put_u32, put_u64, write_header, PAGE_HEADER_SIZE};
use crate::types::{Canary, Stat};

/// Persistent state of one table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableRecord {
    /// Persistent `DbFlags` bits
    pub(crate) flags: u32,
    /// Depth of the tree, zero when empty
    pub(crate) depth: u32,
    pub(crate) root: u64,
    pub(crate) branch_pages: u64,
    pub(crate) leaf_pages: u64,
    pub(crate) overflow_pages: u64,
    pub(crate) entries: u64,
    pub(crate) mod_txnid: u64,
    /// Value width shared by all dups of a `DUPFIXED` table, zero until the first insert
    pub(crate) dupfix_size: u32,
    pub(crate) reserved: u32,
}

/// Meta record as laid out after the page header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaRecord {
    pub(crate) magic: u64,
    pub(crate) version: u32,
    pub(crate) page_size: u32,
    pub(crate) txnid: u64,
    /// Geometry, in pages
    pub(crate) geo_lower: u64,
    pub(crate) geo_upper: u64,
    pub(crate) geo_now: u64,
    pub(crate) geo_grow: u64,
    pub(crate) geo_shrink: u64,
    /// First page number never allocated
    pub(crate) last_pgno: u64,
    pub(crate) flags: u32,
    pub(crate) reserved: u32,
    pub(crate) catalog: TableRecord,
    pub(crate) main: TableRecord,
    pub(crate) canary: [u64; 4],
    pub(crate) sign: u64,
}

pub(crate) const TABLE_RECORD_SIZE: usize = 64;
pub(crate) const META_RECORD_SIZE: usize = 248;

const _: () = assert!(size_of::<TableRecord>() == TABLE_RECORD_SIZE);
const _: () = assert!(offset_of!(TableRecord, root) == 8);
const _: () = assert!(offset_of!(TableRecord, dupfix_size) == 56);
const _: () = assert!(size_of::<MetaRecord>() == META_RECORD_SIZE);
const _: () = assert!(offset_of!(MetaRecord, txnid) == 16);
const _: () = assert!(offset_of!(MetaRecord, catalog) == 80);
const _: () = assert!(offset_of!(MetaRecord, main) == 144);
const _: () = assert!(offset_of!(MetaRecord, sign) == META_RECORD_SIZE - 8);

/// Set on metas written after the data they describe reached the disk.
pub(crate) const META_STEADY: u32 = 0x01;

impl TableRecord {
    pub(crate) fn empty(flags: u32) -> Self {
        TableRecord {
            flags,
            depth: 0,
            root: NO_PAGE,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            mod_txnid: 0,
            dupfix_size: 0,
            reserved: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root == NO_PAGE
    }

    pub(crate) fn stat(&self, page_size: usize) -> Stat {
        Stat {
            page_size: page_size as u32,
            depth: self.depth,
            branch_pages: self.branch_pages,
            leaf_pages: self.leaf_pages,
            overflow_pages: self.overflow_pages,
            entries: self.entries,
            mod_txnid: self.mod_txnid,
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8], base: usize) {
        put_u32(buf, base + offset_of!(TableRecord, flags), self.flags);
        put_u32(buf, base + offset_of!(TableRecord, depth), self.depth);
        put_u64(buf, base + offset_of!(TableRecord, root), self.root);
        put_u64(buf, base + offset_of!(TableRecord, branch_pages), self.branch_pages);
        put_u64(buf, base + offset_of!(TableRecord, leaf_pages), self.leaf_pages);
        put_u64(buf, base + offset_of!(TableRecord, overflow_pages), self.overflow_pages);
        put_u64(buf, base + offset_of!(TableRecord, entries), self.entries);
        put_u64(buf, base + offset_of!(TableRecord, mod_txnid), self.mod_txnid);
        put_u32(buf, base + offset_of!(TableRecord, dupfix_size), self.dupfix_size);
        put_u32(buf, base + offset_of!(TableRecord, reserved), 0);
    }

    pub(crate) fn decode(buf: &[u8], base: usize) -> Self {
        TableRecord {
            flags: get_u32(buf, base + offset_of!(TableRecord, flags)),
            depth: get_u32(buf, base + offset_of!(TableRecord, depth)),
            root: get_u64(buf, base + offset_of!(TableRecord, root)),
            branch_pages: get_u64(buf, base + offset_of!(TableRecord, branch_pages)),
            leaf_pages: get_u64(buf, base + offset_of!(TableRecord, leaf_pages)),
            overflow_pages: get_u64(buf, base + offset_of!(TableRecord, overflow_pages)),
            entries: get_u64(buf, base + offset_of!(TableRecord, entries)),
            mod_txnid: get_u64(buf, base + offset_of!(TableRecord, mod_txnid)),
            dupfix_size: get_u32(buf, base + offset_of!(TableRecord, dupfix_size)),
            reserved: 0,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; TABLE_RECORD_SIZE] {
        let mut buf = [0u8; TABLE_RECORD_SIZE];
        self.encode(&mut buf, 0);
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != TABLE_RECORD_SIZE {
            return Err(Error::Corrupted);
        }
        Ok(TableRecord::decode(buf, 0))
    }
}

/// Outcome of reading one meta page.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MetaSlot {
    Valid(MetaRecord),
    /// Magic and version are right but the checksum is not.
    Torn,
}

impl MetaRecord {
    pub(crate) fn new(page_size: usize) -> Self {
        MetaRecord {
            magic: MAGIC,
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            txnid: 0,
            geo_lower: 0,
            geo_upper: 0,
            geo_now: 0,
            geo_grow: 0,
            geo_shrink: 0,
            last_pgno: crate::constants::META_PAGES,
            flags: META_STEADY,
            reserved: 0,
            catalog: TableRecord::empty(0),
            main: TableRecord::empty(0),
            canary: [0; 4],
            sign: 0,
        }
    }

    pub(crate) fn is_steady(&self) -> bool {
        self.flags & META_STEADY != 0
    }

    pub(crate) fn canary(&self) -> Canary {
        let [x, y, z, v] = self.canary;
        Canary { x, y, z, v }
    }

    pub(crate) fn set_canary(&mut self, c: Canary) {
        self.canary = [c.x, c.y, c.z, c.v];
    }

    fn encode_record(&self, buf: &mut [u8]) {
        let b = PAGE_HEADER_SIZE;
        put_u64(buf, b + offset_of!(MetaRecord, magic), self.magic);
        put_u32(buf, b + offset_of!(MetaRecord, version), self.version);
        put_u32(buf, b + offset_of!(MetaRecord, page_size), self.page_size);
        put_u64(buf, b + offset_of!(MetaRecord, txnid), self.txnid);
        put_u64(buf, b + offset_of!(MetaRecord, geo_lower), self.geo_lower);
        put_u64(buf, b + offset_of!(MetaRecord, geo_upper), self.geo_upper);
        put_u64(buf, b + offset_of!(MetaRecord, geo_now), self.geo_now);
        put_u64(buf, b + offset_of!(MetaRecord, geo_grow), self.geo_grow);
        put_u64(buf, b + offset_of!(MetaRecord, geo_shrink), self.geo_shrink);
        put_u64(buf, b + offset_of!(MetaRecord, last_pgno), self.last_pgno);
        put_u32(buf, b + offset_of!(MetaRecord, flags), self.flags);
        put_u32(buf, b + offset_of!(MetaRecord, reserved), 0);
        self.catalog.encode(buf, b + offset_of!(MetaRecord, catalog));
        self.main.encode(buf, b + offset_of!(MetaRecord, main));
        let canary = b + offset_of!(MetaRecord, canary);
        for (i, v) in self.canary.iter().enumerate() {
            put_u64(buf, canary + i * 8, *v);
        }
    }

    fn checksum(buf: &[u8]) -> u64 {
        let start = PAGE_HEADER_SIZE;
        let end = PAGE_HEADER_SIZE + offset_of!(MetaRecord, sign);
        // Zero is reserved so that a wiped page never verifies.
        xxh3_64(&buf[start..end]).max(1)
    }

    /// Writes a full meta page into `buf` and returns the checksum used.
    pub(crate) fn encode_page(&self, buf: &mut [u8], pgno: u64) -> u64 {
        buf.fill(0);
        write_header(buf, pgno, PageFlags::META, 0, 0);
        self.encode_record(buf);
        let sign = Self::checksum(buf);
        put_u64(buf, PAGE_HEADER_SIZE + offset_of!(MetaRecord, sign), sign);
        sign
    }

    /// Reads a meta page. Foreign files fail with `Invalid`, other format
    /// revisions with `VersionMismatch`.
    pub(crate) fn decode_page(buf: &[u8]) -> Result<MetaSlot> {
        if buf.len() < PAGE_HEADER_SIZE + META_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        let b = PAGE_HEADER_SIZE;
        let magic = get_u64(buf, b + offset_of!(MetaRecord, magic));
        if magic != MAGIC {
            return Err(Error::Invalid);
        }
        let version = get_u32(buf, b + offset_of!(MetaRecord, version));
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch);
        }
        let sign = get_u64(buf, b + offset_of!(MetaRecord, sign));
        if sign != Self::checksum(buf) {
            return Ok(MetaSlot::Torn);
        }
        let canary = b + offset_of!(MetaRecord, canary);
        let record = MetaRecord {
            magic,
            version,
            page_size: get_u32(buf, b + offset_of!(MetaRecord, page_size)),
            txnid: get_u64(buf, b + offset_of!(MetaRecord, txnid)),
            geo_lower: get_u64(buf, b + offset_of!(MetaRecord, geo_lower)),
            geo_upper: get_u64(buf, b + offset_of!(MetaRecord, geo_upper)),
            geo_now: get_u64(buf, b + offset_of!(MetaRecord, geo_now)),
            geo_grow: get_u64(buf, b + offset_of!(MetaRecord, geo_grow)),
            geo_shrink: get_u64(buf, b + offset_of!(MetaRecord, geo_shrink)),
            last_pgno: get_u64(buf, b + offset_of!(MetaRecord, last_pgno)),
            flags: get_u32(buf, b + offset_of!(MetaRecord, flags)),
            reserved: 0,
            catalog: TableRecord::decode(buf, b + offset_of!(MetaRecord, catalog)),
            main: TableRecord::decode(buf, b + offset_of!(MetaRecord, main)),
            canary: [
                get_u64(buf, canary),
                get_u64(buf, canary + 8),
                get_u64(buf, canary + 16),
                get_u64(buf, canary + 24),
            ],
            sign,
        };
        Ok(MetaSlot::Valid(record))
    }

    /// Page size recorded in a meta page, read before the page size is known.
    pub(crate) fn peek_page_size(buf: &[u8]) -> Result<usize> {
        if buf.len() < PAGE_HEADER_SIZE + META_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        if get_u64(buf, PAGE_HEADER_SIZE + offset_of!(MetaRecord, magic)) != MAGIC {
            return Err(Error::Invalid);
        }
        Ok(get_u32(buf, PAGE_HEADER_SIZE + offset_of!(MetaRecord, page_size)) as usize)
    }
}

/// Picks the record to open from the two meta slots.
///
/// Returns the winner and whether the newest slot was torn.
pub(crate) fn pick_meta(slots: [Result<MetaSlot>; 2]) -> Result<(MetaRecord, bool)> {
    let mut valid = Vec::with_capacity(2);
    let mut torn = false;
    let mut first_err = None;
    for slot in slots {
        match slot {
            Ok(MetaSlot::Valid(m)) => valid.push(m),
            Ok(MetaSlot::Torn) => torn = true,
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match valid.into_iter().max_by_key(|m| m.txnid) {
        Some(best) => Ok((best, torn || first_err.is_some())),
        None if torn => Err(Error::Corrupted),
        None => Err(first_err.unwrap_or(Error::Invalid)),
    }
}
