//! Page header and element layouts.
//!
//! Every page begins with a 16-byte header:
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  -----------------------------------------
//! 0       8     id        Page id (position in file, units of P)
//! 8       2     flags     Exactly one of branch/leaf/meta/buckets/freelist
//! 10      2     count     Number of elements in the body
//! 12      4     overflow  Extra contiguous pages beyond the first
//! ```
//!
//! Leaf and branch bodies are arrays of fixed-size elements followed by
//! packed key/value bytes. An element's `pos` is a byte offset from the
//! element itself to its key, so a page can be relocated in memory without
//! rewriting offsets. A logical page may span `overflow + 1` physical
//! pages; readers and writers always operate on the full run.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_prefix, parse_prefix_mut, PageId};

pub(crate) const BRANCH_PAGE_FLAG: u16 = 0x01;
pub(crate) const LEAF_PAGE_FLAG: u16 = 0x02;
pub(crate) const META_PAGE_FLAG: u16 = 0x04;
pub(crate) const BUCKETS_PAGE_FLAG: u16 = 0x08;
pub(crate) const FREELIST_PAGE_FLAG: u16 = 0x10;

pub(crate) const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();
pub(crate) const LEAF_ELEMENT_SIZE: usize = size_of::<LeafElement>();
pub(crate) const BRANCH_ELEMENT_SIZE: usize = size_of::<BranchElement>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

const _: () = assert!(size_of::<PageHeader>() == 16);

impl PageHeader {
    pub fn id(&self) -> PageId {
        self.id.get()
    }

    pub fn set_id(&mut self, id: PageId) {
        self.id = U64::new(id);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn add_flags(&mut self, flags: u16) {
        self.flags = U16::new(self.flags.get() | flags);
    }

    pub fn count(&self) -> usize {
        self.count.get() as usize
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= super::MAX_NODES_PER_PAGE);
        self.count = U16::new(count as u16);
    }

    pub fn overflow(&self) -> u32 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.overflow = U32::new(overflow);
    }
}

/// One entry on a leaf page. The key starts `pos` bytes after the element;
/// the value immediately follows the key.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct LeafElement {
    flags: U32,
    pos: U32,
    ksize: U32,
    vsize: U32,
}

const _: () = assert!(size_of::<LeafElement>() == 16);

impl LeafElement {
    pub fn new(pos: u32, ksize: u32, vsize: u32) -> Self {
        Self {
            flags: U32::new(0),
            pos: U32::new(pos),
            ksize: U32::new(ksize),
            vsize: U32::new(vsize),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos.get() as usize
    }

    pub fn ksize(&self) -> usize {
        self.ksize.get() as usize
    }

    pub fn vsize(&self) -> usize {
        self.vsize.get() as usize
    }
}

/// One entry on a branch page. `page_id` points at the subtree whose
/// smallest key equals this element's key.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct BranchElement {
    pos: U32,
    ksize: U32,
    page_id: U64,
}

const _: () = assert!(size_of::<BranchElement>() == 16);

impl BranchElement {
    pub fn new(pos: u32, ksize: u32, page_id: PageId) -> Self {
        Self {
            pos: U32::new(pos),
            ksize: U32::new(ksize),
            page_id: U64::new(page_id),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos.get() as usize
    }

    pub fn ksize(&self) -> usize {
        self.ksize.get() as usize
    }

    pub fn page_id(&self) -> PageId {
        self.page_id.get()
    }
}

/// Immutable view of a page run. The slice covers the full
/// `(overflow + 1) * P` bytes; key/value accessors return subslices that
/// borrow the underlying buffer, not the view.
#[derive(Clone, Copy)]
pub(crate) struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> PageView<'a> {
        assert!(
            data.len() >= PAGE_HEADER_SIZE,
            "page buffer too small: {} bytes",
            data.len()
        );
        PageView { data }
    }

    pub fn header(&self) -> &'a PageHeader {
        parse_prefix(self.data)
    }

    pub fn id(&self) -> PageId {
        self.header().id()
    }

    pub fn flags(&self) -> u16 {
        self.header().flags()
    }

    pub fn count(&self) -> usize {
        self.header().count()
    }

    pub fn overflow(&self) -> u32 {
        self.header().overflow()
    }

    pub fn body(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Human-readable page type tag, used in assertions and logging.
    pub fn typ(&self) -> &'static str {
        let flags = self.flags();
        if flags & BRANCH_PAGE_FLAG != 0 {
            "branch"
        } else if flags & LEAF_PAGE_FLAG != 0 {
            "leaf"
        } else if flags & META_PAGE_FLAG != 0 {
            "meta"
        } else if flags & BUCKETS_PAGE_FLAG != 0 {
            "buckets"
        } else if flags & FREELIST_PAGE_FLAG != 0 {
            "freelist"
        } else {
            "unknown"
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & LEAF_PAGE_FLAG != 0
    }

    pub fn leaf_element(&self, index: usize) -> &'a LeafElement {
        debug_assert!(index < self.count());
        parse_prefix(&self.data[Self::leaf_offset(index)..])
    }

    pub fn leaf_key(&self, index: usize) -> &'a [u8] {
        let elem = self.leaf_element(index);
        let start = Self::leaf_offset(index) + elem.pos();
        &self.data[start..start + elem.ksize()]
    }

    pub fn leaf_value(&self, index: usize) -> &'a [u8] {
        let elem = self.leaf_element(index);
        let start = Self::leaf_offset(index) + elem.pos() + elem.ksize();
        &self.data[start..start + elem.vsize()]
    }

    pub fn branch_element(&self, index: usize) -> &'a BranchElement {
        debug_assert!(index < self.count());
        parse_prefix(&self.data[Self::branch_offset(index)..])
    }

    pub fn branch_key(&self, index: usize) -> &'a [u8] {
        let elem = self.branch_element(index);
        let start = Self::branch_offset(index) + elem.pos();
        &self.data[start..start + elem.ksize()]
    }

    pub fn branch_child(&self, index: usize) -> PageId {
        self.branch_element(index).page_id()
    }

    fn leaf_offset(index: usize) -> usize {
        PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE
    }

    fn branch_offset(index: usize) -> usize {
        PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE
    }
}

/// Mutable page run, used when serializing nodes, the catalog, the
/// freelist, and meta pages into heap buffers before they reach the file.
pub(crate) struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> PageMut<'a> {
        assert!(
            data.len() >= PAGE_HEADER_SIZE,
            "page buffer too small: {} bytes",
            data.len()
        );
        PageMut { data }
    }

    pub fn header_mut(&mut self) -> &mut PageHeader {
        parse_prefix_mut(self.data)
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Raw access from the start of the page. Node serialization computes
    /// self-relative element positions and needs to address the whole run
    /// at once.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_16_bytes() {
        assert_eq!(PAGE_HEADER_SIZE, 16);
        assert_eq!(LEAF_ELEMENT_SIZE, 16);
        assert_eq!(BRANCH_ELEMENT_SIZE, 16);
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = [0u8; 64];
        {
            let mut page = PageMut::new(&mut buf);
            let header = page.header_mut();
            header.set_id(42);
            header.add_flags(LEAF_PAGE_FLAG);
            header.set_count(3);
            header.set_overflow(1);
        }

        let view = PageView::new(&buf);
        assert_eq!(view.id(), 42);
        assert_eq!(view.flags(), LEAF_PAGE_FLAG);
        assert_eq!(view.count(), 3);
        assert_eq!(view.overflow(), 1);
        assert_eq!(view.typ(), "leaf");
    }

    #[test]
    fn typ_reports_each_flag() {
        let mut buf = [0u8; 16];
        for (flag, tag) in [
            (BRANCH_PAGE_FLAG, "branch"),
            (LEAF_PAGE_FLAG, "leaf"),
            (META_PAGE_FLAG, "meta"),
            (BUCKETS_PAGE_FLAG, "buckets"),
            (FREELIST_PAGE_FLAG, "freelist"),
        ] {
            buf.fill(0);
            PageMut::new(&mut buf).header_mut().add_flags(flag);
            assert_eq!(PageView::new(&buf).typ(), tag);
        }
        buf.fill(0);
        assert_eq!(PageView::new(&buf).typ(), "unknown");
    }

    #[test]
    fn leaf_elements_resolve_self_relative_positions() {
        // Two elements packed the way a node serializes them: element
        // array first, then key/value bytes.
        let mut buf = vec![0u8; 4096];
        {
            let mut page = PageMut::new(&mut buf);
            let header = page.header_mut();
            header.add_flags(LEAF_PAGE_FLAG);
            header.set_count(2);
        }

        let data_start = PAGE_HEADER_SIZE + 2 * LEAF_ELEMENT_SIZE;
        let elem0 = LeafElement::new((data_start - PAGE_HEADER_SIZE) as u32, 3, 4);
        let elem1_off = PAGE_HEADER_SIZE + LEAF_ELEMENT_SIZE;
        let elem1 = LeafElement::new((data_start + 7 - elem1_off) as u32, 10, 3);
        crate::storage::write_prefix(&mut buf[PAGE_HEADER_SIZE..], &elem0);
        crate::storage::write_prefix(&mut buf[elem1_off..], &elem1);
        buf[data_start..data_start + 7].copy_from_slice(b"barfooz");
        buf[data_start + 7..data_start + 20].copy_from_slice(b"helloworldbye");

        let view = PageView::new(&buf);
        assert_eq!(view.leaf_key(0), b"bar");
        assert_eq!(view.leaf_value(0), b"fooz");
        assert_eq!(view.leaf_key(1), b"helloworld");
        assert_eq!(view.leaf_value(1), b"bye");
    }

    #[test]
    fn branch_elements_resolve_keys_and_children() {
        let mut buf = vec![0u8; 4096];
        {
            let mut page = PageMut::new(&mut buf);
            let header = page.header_mut();
            header.add_flags(BRANCH_PAGE_FLAG);
            header.set_count(2);
        }

        let data_start = PAGE_HEADER_SIZE + 2 * BRANCH_ELEMENT_SIZE;
        let elem0 = BranchElement::new((data_start - PAGE_HEADER_SIZE) as u32, 2, 7);
        let elem1_off = PAGE_HEADER_SIZE + BRANCH_ELEMENT_SIZE;
        let elem1 = BranchElement::new((data_start + 2 - elem1_off) as u32, 2, 9);
        crate::storage::write_prefix(&mut buf[PAGE_HEADER_SIZE..], &elem0);
        crate::storage::write_prefix(&mut buf[elem1_off..], &elem1);
        buf[data_start..data_start + 4].copy_from_slice(b"aamm");

        let view = PageView::new(&buf);
        assert_eq!(view.branch_key(0), b"aa");
        assert_eq!(view.branch_child(0), 7);
        assert_eq!(view.branch_key(1), b"mm");
        assert_eq!(view.branch_child(1), 9);
    }
}
