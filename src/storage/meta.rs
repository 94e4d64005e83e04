//! Meta pages.
//!
//! Pages 0 and 1 each hold a serialized [`Meta`] directly after the page
//! header. The two alternate: a commit with transaction id T writes page
//! `T % 2`, so the page with the higher txid is the active one and the
//! other still describes the previous committed version. The meta write is
//! the commit's linearization point.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------
//! 0       4     magic (0xED0CDAED)
//! 4       4     version (1)
//! 8       4     page_size
//! 12      4     flags (unused)
//! 16      8     buckets_page_id
//! 24      8     freelist_page_id
//! 32      8     high_water (first never-allocated page id)
//! 40      8     txid
//! ```

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_prefix, write_prefix, PageId, PageMut, PageView, TxId, META_PAGE_FLAG};
use crate::error::{Error, Result};

pub(crate) const MAGIC: u32 = 0xED0C_DAED;
pub(crate) const VERSION: u32 = 1;

/// Page ids laid down by database initialization.
pub(crate) const INIT_FREELIST_PAGE_ID: PageId = 2;
pub(crate) const INIT_BUCKETS_PAGE_ID: PageId = 3;
pub(crate) const INIT_HIGH_WATER: PageId = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    buckets_page_id: U64,
    freelist_page_id: U64,
    high_water: U64,
    txid: U64,
}

const _: () = assert!(size_of::<Meta>() == 48);

impl Meta {
    /// Meta for a freshly initialized database file.
    pub fn init(page_size: u32, txid: TxId) -> Meta {
        Meta {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            buckets_page_id: U64::new(INIT_BUCKETS_PAGE_ID),
            freelist_page_id: U64::new(INIT_FREELIST_PAGE_ID),
            high_water: U64::new(INIT_HIGH_WATER),
            txid: U64::new(txid),
        }
    }

    /// Copies the meta out of a page. The caller validates separately;
    /// reading a garbage page must not abort before `validate` can report.
    pub fn from_page(view: &PageView<'_>) -> Meta {
        *parse_prefix::<Meta>(view.body())
    }

    /// Checks the marker bytes and version against this binary.
    pub fn validate(&self) -> Result<()> {
        if self.magic.get() != MAGIC {
            return Err(Error::Invalid);
        }
        if self.version.get() != VERSION {
            return Err(Error::VersionMismatch);
        }
        Ok(())
    }

    /// Serializes the meta onto a page buffer. The page id is derived from
    /// the transaction id: even txids land on page 0, odd on page 1.
    pub fn write(&self, page: &mut PageMut<'_>) {
        let header = page.header_mut();
        header.set_id(self.txid.get() % 2);
        header.add_flags(META_PAGE_FLAG);
        write_prefix(page.body_mut(), self);
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn buckets_page_id(&self) -> PageId {
        self.buckets_page_id.get()
    }

    pub fn set_buckets_page_id(&mut self, id: PageId) {
        self.buckets_page_id = U64::new(id);
    }

    pub fn freelist_page_id(&self) -> PageId {
        self.freelist_page_id.get()
    }

    pub fn high_water(&self) -> PageId {
        self.high_water.get()
    }

    pub fn set_high_water(&mut self, id: PageId) {
        debug_assert!(id >= self.high_water.get(), "high water must not regress");
        self.high_water = U64::new(id);
    }

    pub fn txid(&self) -> TxId {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: TxId) {
        self.txid = U64::new(txid);
    }
}
