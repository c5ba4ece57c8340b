//! Page codec.
//!
//! Every page starts with a 16-byte header. Branch and leaf pages are slotted:
//! an array of `u16` node offsets follows the header and nodes are packed from
//! the end of the page downwards. Overflow runs hold one large value across
//! several contiguous pages, with the header only on the first page.
//!
//! ```text
//! leaf node:   flags u16 | ksize u16 | dsize u32 | key | data (or u64 pgno)
//! branch node: ksize u16 | pad u16   | dsize u32 | child u64 | key | data
//! ```
//!
//! All integers are little-endian.

use std::mem::{offset_of, size_of};

use crate::constants::{NodeFlags, PageFlags};
use crate::error::{Error, Result};

/// Page header
#[repr(C)]
pub(crate) struct PageHeader {
    pub(crate) pgno: u64,
    pub(crate) flags: u16,
    pub(crate) count: u16,
    /// Start of node space on slotted pages, page count on overflow pages
    pub(crate) upper: u32,
}

pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const SLOT_SIZE: usize = 2;
pub(crate) const LEAF_NODE_HEADER: usize = 8;
pub(crate) const BRANCH_NODE_HEADER: usize = 16;
const PGNO_SIZE: usize = 8;

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);
const _: () = assert!(offset_of!(PageHeader, flags) == 8);
const _: () = assert!(offset_of!(PageHeader, count) == 10);
const _: () = assert!(offset_of!(PageHeader, upper) == 12);

const OFF_PGNO: usize = offset_of!(PageHeader, pgno);
const OFF_FLAGS: usize = offset_of!(PageHeader, flags);
const OFF_COUNT: usize = offset_of!(PageHeader, count);
const OFF_UPPER: usize = offset_of!(PageHeader, upper);

#[inline]
pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_header(buf: &mut [u8], pgno: u64, flags: PageFlags, count: u16, upper: u32) {
    put_u64(buf, OFF_PGNO, pgno);
    put_u16(buf, OFF_FLAGS, flags.bits());
    put_u16(buf, OFF_COUNT, count);
    put_u32(buf, OFF_UPPER, upper);
}

/// Largest node, slot included, that still lets four fit on a page.
pub(crate) fn node_max(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 4
}

pub(crate) fn max_key_size(page_size: usize) -> usize {
    node_max(page_size) - BRANCH_NODE_HEADER - SLOT_SIZE
}

/// Pages needed by an overflow run holding `len` bytes.
pub(crate) fn overflow_pages(page_size: usize, len: usize) -> u64 {
    ((PAGE_HEADER_SIZE + len + page_size - 1) / page_size) as u64
}

/// Whether a leaf value must be moved to an overflow run.
pub(crate) fn needs_overflow(page_size: usize, key_len: usize, data_len: usize) -> bool {
    SLOT_SIZE + LEAF_NODE_HEADER + key_len + data_len > node_max(page_size)
}

/// Borrowed view over one page.
#[derive(Clone, Copy)]
pub(crate) struct PageRef<'a> {
    buf: &'a [u8],
}

/// Value slot of a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafValue<'a> {
    Inline(&'a [u8]),
    Overflow { pgno: u64, len: usize },
}

impl<'a> PageRef<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        PageRef { buf }
    }

    pub(crate) fn pgno(&self) -> u64 {
        get_u64(self.buf, OFF_PGNO)
    }

    pub(crate) fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(get_u16(self.buf, OFF_FLAGS))
    }

    pub(crate) fn count(&self) -> usize {
        get_u16(self.buf, OFF_COUNT) as usize
    }

    pub(crate) fn upper(&self) -> usize {
        get_u32(self.buf, OFF_UPPER) as usize
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub(crate) fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    /// Checks that the header and slot array are self-consistent.
    pub(crate) fn validate(&self, pgno: u64) -> Result<()> {
        if self.pgno() != pgno {
            return Err(Error::Corrupted);
        }
        let flags = self.flags();
        if !(flags.contains(PageFlags::LEAF) || flags.contains(PageFlags::BRANCH)) {
            return Err(Error::Corrupted);
        }
        let count = self.count();
        let upper = self.upper();
        if PAGE_HEADER_SIZE + count * SLOT_SIZE > upper || upper > self.buf.len() {
            return Err(Error::Corrupted);
        }
        let header = if self.is_leaf() { LEAF_NODE_HEADER } else { BRANCH_NODE_HEADER };
        for i in 0..count {
            let off = self.node_offset(i);
            if off < upper || off + header > self.buf.len() {
                return Err(Error::Corrupted);
            }
        }
        Ok(())
    }

    #[inline]
    fn node_offset(&self, i: usize) -> usize {
        get_u16(self.buf, PAGE_HEADER_SIZE + i * SLOT_SIZE) as usize
    }

    pub(crate) fn leaf_key(&self, i: usize) -> &'a [u8] {
        let off = self.node_offset(i);
        let ksize = get_u16(self.buf, off + 2) as usize;
        let start = off + LEAF_NODE_HEADER;
        &self.buf[start..start + ksize]
    }

    pub(crate) fn leaf_value(&self, i: usize) -> LeafValue<'a> {
        let off = self.node_offset(i);
        let flags = NodeFlags::from_bits_truncate(get_u16(self.buf, off));
        let ksize = get_u16(self.buf, off + 2) as usize;
        let dsize = get_u32(self.buf, off + 4) as usize;
        let start = off + LEAF_NODE_HEADER + ksize;
        if flags.contains(NodeFlags::BIGDATA) {
            LeafValue::Overflow {
                pgno: get_u64(self.buf, start),
                len: dsize,
            }
        } else {
            LeafValue::Inline(&self.buf[start..start + dsize])
        }
    }

    /// Byte range of an inline leaf value within the page.
    pub(crate) fn leaf_data_range(&self, i: usize) -> (usize, usize) {
        let off = self.node_offset(i);
        let ksize = get_u16(self.buf, off + 2) as usize;
        let dsize = get_u32(self.buf, off + 4) as usize;
        (off + LEAF_NODE_HEADER + ksize, dsize)
    }

    pub(crate) fn branch_key(&self, i: usize) -> &'a [u8] {
        let off = self.node_offset(i);
        let ksize = get_u16(self.buf, off) as usize;
        let start = off + BRANCH_NODE_HEADER;
        &self.buf[start..start + ksize]
    }

    pub(crate) fn branch_data(&self, i: usize) -> &'a [u8] {
        let off = self.node_offset(i);
        let ksize = get_u16(self.buf, off) as usize;
        let dsize = get_u32(self.buf, off + 4) as usize;
        let start = off + BRANCH_NODE_HEADER + ksize;
        &self.buf[start..start + dsize]
    }

    pub(crate) fn branch_child(&self, i: usize) -> u64 {
        get_u64(self.buf, self.node_offset(i) + 8)
    }
}

/// Owned value of a decoded leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafData {
    Inline(Vec<u8>),
    Overflow { pgno: u64, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) data: LeafData,
}

impl LeafEntry {
    /// Bytes taken on a page, slot included.
    pub(crate) fn size(&self) -> usize {
        let data = match &self.data {
            LeafData::Inline(d) => d.len(),
            LeafData::Overflow { .. } => PGNO_SIZE,
        };
        SLOT_SIZE + LEAF_NODE_HEADER + self.key.len() + data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) child: u64,
}

impl BranchEntry {
    pub(crate) fn size(&self) -> usize {
        SLOT_SIZE + BRANCH_NODE_HEADER + self.key.len() + self.data.len()
    }
}

/// A page decoded for modification.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Branch(Vec<BranchEntry>),
}

impl Node {
    pub(crate) fn decode(page: PageRef<'_>) -> Node {
        let count = page.count();
        if page.is_leaf() {
            let entries = (0..count)
                .map(|i| LeafEntry {
                    key: page.leaf_key(i).to_vec(),
                    data: match page.leaf_value(i) {
                        LeafValue::Inline(d) => LeafData::Inline(d.to_vec()),
                        LeafValue::Overflow { pgno, len } => LeafData::Overflow { pgno, len },
                    },
                })
                .collect();
            Node::Leaf(entries)
        } else {
            let entries = (0..count)
                .map(|i| BranchEntry {
                    key: page.branch_key(i).to_vec(),
                    data: page.branch_data(i).to_vec(),
                    child: page.branch_child(i),
                })
                .collect();
            Node::Branch(entries)
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Leaf(e) => e.len(),
            Node::Branch(e) => e.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Bytes used below the header.
    pub(crate) fn used(&self) -> usize {
        match self {
            Node::Leaf(e) => e.iter().map(LeafEntry::size).sum(),
            Node::Branch(e) => e.iter().map(BranchEntry::size).sum(),
        }
    }

    pub(crate) fn entry_sizes(&self) -> Vec<usize> {
        match self {
            Node::Leaf(e) => e.iter().map(LeafEntry::size).collect(),
            Node::Branch(e) => e.iter().map(BranchEntry::size).collect(),
        }
    }

    /// Writes the node into `buf`, which must be one page long.
    pub(crate) fn encode(&self, buf: &mut [u8], pgno: u64) -> Result<()> {
        if PAGE_HEADER_SIZE + self.used() > buf.len() {
            return Err(Error::PageFull);
        }
        let mut upper = buf.len();
        match self {
            Node::Leaf(entries) => {
                for (i, e) in entries.iter().enumerate() {
                    let node_len = e.size() - SLOT_SIZE;
                    upper -= node_len;
                    let off = upper;
                    let (flags, dsize) = match &e.data {
                        LeafData::Inline(d) => (NodeFlags::empty(), d.len()),
                        LeafData::Overflow { len, .. } => (NodeFlags::BIGDATA, *len),
                    };
                    put_u16(buf, off, flags.bits());
                    put_u16(buf, off + 2, e.key.len() as u16);
                    put_u32(buf, off + 4, dsize as u32);
                    let kstart = off + LEAF_NODE_HEADER;
                    buf[kstart..kstart + e.key.len()].copy_from_slice(&e.key);
                    let dstart = kstart + e.key.len();
                    match &e.data {
                        LeafData::Inline(d) => buf[dstart..dstart + d.len()].copy_from_slice(d),
                        LeafData::Overflow { pgno, .. } => put_u64(buf, dstart, *pgno),
                    }
                    put_u16(buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, off as u16);
                }
                write_header(buf, pgno, PageFlags::LEAF, entries.len() as u16, upper as u32);
            }
            Node::Branch(entries) => {
                for (i, e) in entries.iter().enumerate() {
                    upper -= e.size() - SLOT_SIZE;
                    let off = upper;
                    put_u16(buf, off, e.key.len() as u16);
                    put_u16(buf, off + 2, 0);
                    put_u32(buf, off + 4, e.data.len() as u32);
                    put_u64(buf, off + 8, e.child);
                    let kstart = off + BRANCH_NODE_HEADER;
                    buf[kstart..kstart + e.key.len()].copy_from_slice(&e.key);
                    let dstart = kstart + e.key.len();
                    buf[dstart..dstart + e.data.len()].copy_from_slice(&e.data);
                    put_u16(buf, PAGE_HEADER_SIZE + i * SLOT_SIZE, off as u16);
                }
                write_header(buf, pgno, PageFlags::BRANCH, entries.len() as u16, upper as u32);
            }
        }
        Ok(())
    }
}

/// Fills an overflow run. `buf` spans all pages of the run.
pub(crate) fn encode_overflow(buf: &mut [u8], pgno: u64, npages: u64, data: &[u8]) {
    write_header(buf, pgno, PageFlags::OVERFLOW, 0, npages as u32);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
}

/// Value bytes stored in an overflow run.
pub(crate) fn overflow_data(run: &[u8], len: usize) -> Result<&[u8]> {
    let page = PageRef::new(run);
    if !page.flags().contains(PageFlags::OVERFLOW) || PAGE_HEADER_SIZE + len > run.len() {
        return Err(Error::Corrupted);
    }
    Ok(&run[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &[u8], data: &[u8]) -> LeafEntry {
        LeafEntry {
            key: key.to_vec(),
            data: LeafData::Inline(data.to_vec()),
        }
    }

    #[test]
    fn leaf_page_layout() {
        let node = Node::Leaf(vec![
            leaf(b"alpha", b"1"),
            leaf(b"beta", b""),
            LeafEntry {
                key: b"gamma".to_vec(),
                data: LeafData::Overflow { pgno: 42, len: 9000 },
            },
        ]);
        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf, 7).unwrap();

        let page = PageRef::new(&buf);
        page.validate(7).unwrap();
        assert!(page.is_leaf());
        assert_eq!(page.count(), 3);
        assert_eq!(page.leaf_key(0), b"alpha");
        assert_eq!(page.leaf_value(0), LeafValue::Inline(b"1"));
        assert_eq!(page.leaf_value(1), LeafValue::Inline(b""));
        assert_eq!(page.leaf_value(2), LeafValue::Overflow { pgno: 42, len: 9000 });
        assert_eq!(page.upper(), 4096 - (node.used() - 3 * SLOT_SIZE));
    }

    #[test]
    fn branch_page_layout() {
        let node = Node::Branch(vec![
            BranchEntry { key: vec![], data: vec![], child: 3 },
            BranchEntry { key: b"m".to_vec(), data: b"x".to_vec(), child: 9 },
        ]);
        let mut buf = vec![0u8; 512];
        node.encode(&mut buf, 2).unwrap();
        let page = PageRef::new(&buf);
        assert!(page.is_branch());
        assert_eq!(page.branch_child(0), 3);
        assert_eq!(page.branch_key(1), b"m");
        assert_eq!(page.branch_data(1), b"x");
        assert_eq!(page.branch_child(1), 9);

        match Node::decode(page) {
            Node::Branch(entries) => assert_eq!(entries[1].child, 9),
            Node::Leaf(_) => panic!("decoded a branch as leaf"),
        }
    }

    #[test]
    fn oversized_node_is_rejected() {
        let node = Node::Leaf(vec![leaf(&[1u8; 300], &[2u8; 300])]);
        let mut buf = vec![0u8; 512];
        assert!(matches!(node.encode(&mut buf, 1), Err(Error::PageFull)));
    }

    #[test]
    fn limits_for_default_page() {
        assert_eq!(node_max(4096), 1020);
        assert_eq!(max_key_size(4096), 1002);
        assert!(!needs_overflow(4096, 8, 100));
        assert!(needs_overflow(4096, 8, 2000));
        assert_eq!(overflow_pages(4096, 4080), 1);
        assert_eq!(overflow_pages(4096, 4081), 2);
    }

    #[test]
    fn overflow_run() {
        let data = vec![0xAB; 5000];
        let n = overflow_pages(4096, data.len());
        let mut run = vec![0u8; 4096 * n as usize];
        encode_overflow(&mut run, 12, n, &data);
        assert_eq!(PageRef::new(&run).upper(), 2);
        assert_eq!(overflow_data(&run, 5000).unwrap(), &data[..]);
    }
}
