//! On-disk storage layer: page format, meta pages, and the freelist.
//!
//! A database file is a flat array of fixed-size pages. Pages 0 and 1 are
//! meta pages; everything else is a branch, leaf, buckets, or freelist
//! page. All multi-byte on-disk fields are little-endian, accessed through
//! zerocopy structs so page bytes are never copied just to be read.

mod freelist;
mod meta;
mod page;

pub(crate) use freelist::Freelist;
pub(crate) use meta::Meta;
pub(crate) use page::{
    BranchElement, LeafElement, PageMut, PageView, BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG,
    BUCKETS_PAGE_FLAG, FREELIST_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG, META_PAGE_FLAG,
    PAGE_HEADER_SIZE,
};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Page identifier: an index into the file in units of the page size.
pub type PageId = u64;

/// Transaction identifier, monotonically increasing across commits.
pub type TxId = u64;

/// Keys are limited to 32KB.
pub const MAX_KEY_SIZE: usize = 32768;

/// Values are limited to what a leaf element's 32-bit size field can hold.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Bucket names are length-prefixed with a single byte on disk.
pub const MAX_BUCKET_NAME_SIZE: usize = 255;

/// A page element count must fit the header's 16-bit count field.
pub(crate) const MAX_NODES_PER_PAGE: usize = 65535;

/// Minimum number of keys a node keeps on each side of a split.
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// Anything that can resolve a page id to its bytes: a read transaction
/// (straight from the mmap) or a write transaction (dirty pages first).
/// Cursors and node loading are written against this seam so the tree code
/// is shared by both transaction types.
pub(crate) trait PageSource {
    fn page(&self, id: PageId) -> PageView<'_>;
    fn page_size(&self) -> usize;
}

/// Parses a zerocopy struct from the front of a byte slice.
///
/// A short buffer here means a page header lied about its contents, which
/// is corruption; it aborts rather than propagating.
#[inline]
pub(crate) fn parse_prefix<T>(bytes: &[u8]) -> &T
where
    T: FromBytes + KnownLayout + Immutable + Unaligned,
{
    let size = size_of::<T>();
    assert!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        std::any::type_name::<T>(),
        bytes.len(),
        size
    );
    match T::ref_from_bytes(&bytes[..size]) {
        Ok(v) => v,
        Err(_) => unreachable!("unaligned zerocopy parse cannot fail on a sized slice"),
    }
}

/// Mutable counterpart of [`parse_prefix`].
#[inline]
pub(crate) fn parse_prefix_mut<T>(bytes: &mut [u8]) -> &mut T
where
    T: FromBytes + KnownLayout + IntoBytes + Unaligned,
{
    let size = size_of::<T>();
    assert!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        std::any::type_name::<T>(),
        bytes.len(),
        size
    );
    match T::mut_from_bytes(&mut bytes[..size]) {
        Ok(v) => v,
        Err(_) => unreachable!("unaligned zerocopy parse cannot fail on a sized slice"),
    }
}

/// Serializes a zerocopy struct into the front of a byte slice.
#[inline]
pub(crate) fn write_prefix<T>(bytes: &mut [u8], value: &T)
where
    T: IntoBytes + Immutable,
{
    let size = size_of::<T>();
    assert!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        std::any::type_name::<T>(),
        bytes.len(),
        size
    );
    bytes[..size].copy_from_slice(value.as_bytes());
}
