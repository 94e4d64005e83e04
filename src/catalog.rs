//! Bucket catalog.
//!
//! The catalog maps bucket names to their B+tree root page and sequence
//! counter. It is small enough to serialize wholesale: each commit writes
//! the entire catalog onto freshly allocated pages and points the new meta
//! at them.
//!
//! On-disk form: `count` fixed-size records, then the names.
//!
//! ```text
//! +--------------------------+
//! | PageHeader               |
//! +--------------------------+
//! | {root u64, sequence u64} |  <- one record per bucket, name order
//! | ...                      |
//! +--------------------------+
//! | len u8, name bytes       |  <- names, same order, ascending
//! | ...                      |
//! +--------------------------+
//! ```

use std::collections::BTreeMap;

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::storage::{
    parse_prefix, write_prefix, PageId, PageMut, PageView, BUCKETS_PAGE_FLAG, PAGE_HEADER_SIZE,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BucketRecord {
    root: U64,
    sequence: U64,
}

const BUCKET_RECORD_SIZE: usize = size_of::<BucketRecord>();

const _: () = assert!(BUCKET_RECORD_SIZE == 16);

/// A bucket's catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketItem {
    pub root: PageId,
    pub sequence: u64,
}

/// In-memory catalog. A `BTreeMap` keeps names ordered so listing and
/// serialization are both lexicographic without an extra sort.
#[derive(Debug, Default, Clone)]
pub(crate) struct Buckets {
    items: BTreeMap<String, BucketItem>,
}

impl Buckets {
    pub fn new() -> Buckets {
        Buckets::default()
    }

    pub fn get(&self, name: &str) -> Option<&BucketItem> {
        self.items.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BucketItem> {
        self.items.get_mut(name)
    }

    /// Inserts or overwrites an entry.
    pub fn put(&mut self, name: &str, item: BucketItem) {
        self.items.insert(name.to_string(), item);
    }

    /// Removes an entry, reporting whether it existed.
    pub fn del(&mut self, name: &str) -> bool {
        self.items.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BucketItem)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Serialized byte length, header included.
    pub fn size(&self) -> usize {
        let names: usize = self.items.keys().map(|k| 1 + k.len()).sum();
        PAGE_HEADER_SIZE + self.items.len() * BUCKET_RECORD_SIZE + names
    }

    /// Replaces the first entry whose root is `old` with `new`. Called
    /// after spilling a tree whose root page moved (or split under a new
    /// ancestor); roots are unique, so first match is the only match.
    pub fn update_root(&mut self, old: PageId, new: PageId) {
        for item in self.items.values_mut() {
            if item.root == old {
                item.root = new;
                return;
            }
        }
    }

    /// Loads the catalog from a buckets page.
    pub fn read(&mut self, view: &PageView<'_>) -> Result<()> {
        let count = view.count();
        let body = view.body();

        let mut names_off = count * BUCKET_RECORD_SIZE;
        self.items.clear();
        for i in 0..count {
            let record = parse_prefix::<BucketRecord>(&body[i * BUCKET_RECORD_SIZE..]);

            let len = body[names_off] as usize;
            let raw = &body[names_off + 1..names_off + 1 + len];
            names_off += 1 + len;

            let name = std::str::from_utf8(raw).map_err(|_| Error::Invalid)?;
            self.items.insert(
                name.to_string(),
                BucketItem {
                    root: record.root.get(),
                    sequence: record.sequence.get(),
                },
            );
        }
        Ok(())
    }

    /// Serializes the catalog onto a page buffer, names ascending.
    pub fn write(&self, page: &mut PageMut<'_>) {
        debug_assert!(self.items.len() <= crate::storage::MAX_NODES_PER_PAGE);
        let count = self.items.len();
        {
            let header = page.header_mut();
            header.add_flags(BUCKETS_PAGE_FLAG);
            header.set_count(count);
        }

        let body = page.body_mut();
        let mut names_off = count * BUCKET_RECORD_SIZE;
        for (i, (name, item)) in self.items.iter().enumerate() {
            let record = BucketRecord {
                root: U64::new(item.root),
                sequence: U64::new(item.sequence),
            };
            write_prefix(&mut body[i * BUCKET_RECORD_SIZE..], &record);

            body[names_off] = name.len() as u8;
            body[names_off + 1..names_off + 1 + name.len()].copy_from_slice(name.as_bytes());
            names_off += 1 + name.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(root: PageId) -> BucketItem {
        BucketItem { root, sequence: 0 }
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let mut b = Buckets::new();
        b.put("foo", item(2));
        b.put("bar", item(3));
        b.put("foo", item(4));

        assert_eq!(b.len(), 2);
        assert_eq!(b.get("foo").unwrap().root, 4);
        assert_eq!(b.get("bar").unwrap().root, 3);
        assert!(b.get("no_such_bucket").is_none());
    }

    #[test]
    fn iteration_is_lexicographic() {
        let mut b = Buckets::new();
        b.put("foo", item(2));
        b.put("bar", item(3));
        b.put("baz", item(4));

        let names: Vec<&str> = b.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["bar", "baz", "foo"]);
    }

    #[test]
    fn update_root_replaces_first_match() {
        let mut b = Buckets::new();
        b.put("widgets", item(7));
        b.put("woojits", item(9));

        b.update_root(7, 21);
        assert_eq!(b.get("widgets").unwrap().root, 21);
        assert_eq!(b.get("woojits").unwrap().root, 9);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut b = Buckets::new();
        b.put("foo", BucketItem { root: 2, sequence: 5 });
        b.put("bar", item(3));

        let mut buf = vec![0u8; 4096];
        b.write(&mut PageMut::new(&mut buf));

        let mut read = Buckets::new();
        read.read(&PageView::new(&buf)).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.get("foo").unwrap().root, 2);
        assert_eq!(read.get("foo").unwrap().sequence, 5);
        assert_eq!(read.get("bar").unwrap().root, 3);
    }

    #[test]
    fn read_parses_records_then_names() {
        let mut buf = vec![0u8; 4096];
        {
            let mut page = PageMut::new(&mut buf);
            let header = page.header_mut();
            header.add_flags(BUCKETS_PAGE_FLAG);
            header.set_count(2);
        }
        // Records for roots 3 and 4, then "bar" and "helloworld".
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8].copy_from_slice(&3u64.to_le_bytes());
        buf[PAGE_HEADER_SIZE + 16..PAGE_HEADER_SIZE + 24].copy_from_slice(&4u64.to_le_bytes());
        let names = PAGE_HEADER_SIZE + 32;
        buf[names] = 3;
        buf[names + 1..names + 4].copy_from_slice(b"bar");
        buf[names + 4] = 10;
        buf[names + 5..names + 15].copy_from_slice(b"helloworld");

        let mut b = Buckets::new();
        b.read(&PageView::new(&buf)).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b.get("bar").unwrap().root, 3);
        assert_eq!(b.get("helloworld").unwrap().root, 4);
    }

    #[test]
    fn size_accounts_for_records_and_names() {
        let mut b = Buckets::new();
        b.put("ab", item(2));
        b.put("cdef", item(3));

        let expected = PAGE_HEADER_SIZE + 2 * 16 + (1 + 2) + (1 + 4);
        assert_eq!(b.size(), expected);
    }
}
