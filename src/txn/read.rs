//! Read-only transactions.
//!
//! A read transaction is a consistent snapshot: it copies the active meta
//! and the bucket catalog at begin time and holds the mmap shared lock for
//! its whole life, so the pages its cursors walk can neither be remapped
//! nor reclaimed underneath it. Close transactions promptly — an open
//! reader pins every page freed after its snapshot and makes the file
//! grow.

use parking_lot::RwLockReadGuard;

use crate::catalog::Buckets;
use crate::db::{Database, Mapping};
use crate::error::{Error, Result};
use crate::storage::{Meta, PageId, PageSource, PageView};
use crate::tree::Cursor;

/// A named key/value namespace, as listed by a transaction.
#[derive(Debug, Clone)]
pub struct Bucket {
    name: String,
    sequence: u64,
}

impl Bucket {
    pub(crate) fn new(name: &str, sequence: u64) -> Bucket {
        Bucket {
            name: name.to_string(),
            sequence,
        }
    }

    /// The bucket's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bucket's autoincrement counter as of this snapshot.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// A read-only transaction.
///
/// Obtained from [`Database::begin_read`]. Dropping it (or calling
/// [`Tx::close`]) releases the snapshot.
pub struct Tx<'db> {
    db: &'db Database,
    /// Some until the transaction drops; released before unregistering so
    /// a writer waiting to remap is never ordered behind the registry.
    guard: Option<RwLockReadGuard<'db, Mapping>>,
    meta: Meta,
    buckets: Buckets,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db Database,
        guard: RwLockReadGuard<'db, Mapping>,
        meta: Meta,
        buckets: Buckets,
    ) -> Tx<'db> {
        Tx {
            db,
            guard: Some(guard),
            meta,
            buckets,
        }
    }

    /// Retrieves a bucket by name, or None if it does not exist.
    pub fn bucket(&self, name: &str) -> Option<Bucket> {
        self.buckets
            .get(name)
            .map(|item| Bucket::new(name, item.sequence))
    }

    /// Lists every bucket, in lexicographic name order.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.buckets
            .iter()
            .map(|(name, item)| Bucket::new(name, item.sequence))
            .collect()
    }

    /// Retrieves the value for a key in a named bucket. Returns None (with
    /// no error) when the key does not exist.
    pub fn get(&self, name: &str, key: &[u8]) -> Result<Option<&[u8]>> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let mut cursor = Cursor::new(item.root);
        Ok(cursor.get(self, key))
    }

    /// Calls `f` for each key/value pair in a bucket, in key order.
    /// Stops and propagates the first error `f` returns.
    pub fn for_each(
        &self,
        name: &str,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let mut cursor = Cursor::new(item.root);
        let mut entry = cursor.first(self);
        while let Some((key, value)) = entry {
            f(key, value)?;
            entry = cursor.next(self);
        }
        Ok(())
    }

    /// Closes the transaction. Equivalent to dropping it.
    pub fn close(self) {}
}

impl PageSource for Tx<'_> {
    fn page(&self, id: PageId) -> PageView<'_> {
        match &self.guard {
            Some(guard) => guard.page(id, self.db.page_size()),
            None => unreachable!("transaction used after close"),
        }
    }

    fn page_size(&self) -> usize {
        self.db.page_size()
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        // Release the mmap shared lock first: a writer waiting to remap
        // must never be ordered behind the registry lock taken below.
        drop(self.guard.take());

        // Unregister from the active-reader list; the pending pages this
        // snapshot pinned become reclaimable once the writer next looks.
        self.db.unregister_reader(self.meta.txid());
    }
}
