//! Read-write transactions and the commit pipeline.
//!
//! A write transaction never touches committed pages. Mutations load the
//! pages on the cursor's path into the node arena; commit then rebalances
//! those nodes, splits oversized ones, writes every surviving node into
//! freshly allocated pages ("spill"), reserializes the catalog, writes the
//! dirty pages, and finally writes the new meta through the O_SYNC handle.
//! The meta write is the linearization point: crash before it and the
//! previous version is intact, crash after and the new one is.
//!
//! The transaction owns the freelist for its lifetime — the guard that
//! protects writer exclusivity is the guard around the freelist, so there
//! is no separate lock to forget.

use std::os::unix::fs::FileExt;

use hashbrown::HashMap;
use parking_lot::MutexGuard;
use tracing::debug;

use crate::catalog::{BucketItem, Buckets};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::storage::{
    Freelist, Meta, PageId, PageMut, PageSource, PageView, LEAF_PAGE_FLAG, MAX_BUCKET_NAME_SIZE,
    MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use crate::tree::{Bytes, Cursor, ElemRef, Node, NodeArena, NodeId};

/// A dirty page: heap-backed until the commit writes it out. The buffer
/// spans the whole run for nodes that overflow a single page.
pub(crate) struct OwnedPage {
    buf: Box<[u8]>,
}

impl OwnedPage {
    fn new(count: usize, page_size: usize) -> OwnedPage {
        OwnedPage {
            buf: vec![0u8; count * page_size].into_boxed_slice(),
        }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(&self.buf)
    }

    pub fn page_mut(&mut self) -> PageMut<'_> {
        PageMut::new(&mut self.buf)
    }

    fn buf(&self) -> &[u8] {
        &self.buf
    }
}

/// Resolves pages for tree operations that simultaneously need mutable
/// access to the node arena: a split borrow over the transaction's dirty
/// pages and the database mapping.
pub(crate) struct TxPages<'a> {
    pages: &'a HashMap<PageId, OwnedPage>,
    db: &'a Database,
}

impl PageSource for TxPages<'_> {
    fn page(&self, id: PageId) -> PageView<'_> {
        if let Some(page) = self.pages.get(&id) {
            return page.view();
        }
        PageView::new(self.db.mapped_slice(id))
    }

    fn page_size(&self) -> usize {
        self.db.page_size()
    }
}

/// A read-write transaction.
///
/// Obtained from [`Database::begin_write`]; at most one exists per
/// database at a time. Dropping it without [`RwTx::commit`] rolls back.
pub struct RwTx<'db> {
    db: &'db Database,
    freelist: MutexGuard<'db, Freelist>,
    meta: Meta,
    buckets: Buckets,
    pages: HashMap<PageId, OwnedPage>,
    arena: NodeArena,
    finished: bool,
}

impl<'db> RwTx<'db> {
    pub(crate) fn new(
        db: &'db Database,
        freelist: MutexGuard<'db, Freelist>,
        meta: Meta,
        buckets: Buckets,
    ) -> RwTx<'db> {
        RwTx {
            db,
            freelist,
            meta,
            buckets,
            pages: HashMap::new(),
            arena: NodeArena::new(),
            finished: false,
        }
    }

    /// Creates a new bucket backed by a fresh empty leaf page.
    pub fn create_bucket(&mut self, name: &str) -> Result<()> {
        if self.buckets.get(name).is_some() {
            return Err(Error::BucketExists);
        }
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        if name.len() > MAX_BUCKET_NAME_SIZE {
            return Err(Error::BucketNameTooLarge);
        }

        let root = self.allocate(1)?;
        match self.pages.get_mut(&root) {
            Some(page) => page.page_mut().header_mut().add_flags(LEAF_PAGE_FLAG),
            None => unreachable!("allocate registered page {}", root),
        }

        self.buckets.put(name, BucketItem { root, sequence: 0 });
        Ok(())
    }

    /// Creates a bucket unless it already exists.
    pub fn create_bucket_if_not_exists(&mut self, name: &str) -> Result<()> {
        match self.create_bucket(name) {
            Err(Error::BucketExists) => Ok(()),
            other => other,
        }
    }

    /// Deletes a bucket and releases every page of its tree to the
    /// freelist under this transaction's id.
    pub fn delete_bucket(&mut self, name: &str) -> Result<()> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let root = item.root;

        self.free_tree(root);
        self.buckets.del(name);
        Ok(())
    }

    /// Increments and returns the bucket's autoincrement counter.
    pub fn next_sequence(&mut self, name: &str) -> Result<u64> {
        let item = self.buckets.get_mut(name).ok_or(Error::BucketNotFound)?;
        item.sequence += 1;
        Ok(item.sequence)
    }

    /// Sets the value for a key in the named bucket, overwriting any
    /// previous value.
    pub fn put(&mut self, name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let root = item.root;
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }

        let mut cursor = Cursor::new(root);
        cursor.seek(&*self, key);

        let leaf = self.node_for_stack(&cursor.stack);
        self.arena[leaf].put(key, Bytes::owned(key), Bytes::owned(value), 0);
        Ok(())
    }

    /// Removes a key from the named bucket. Removing an absent key is not
    /// an error.
    pub fn delete(&mut self, name: &str, key: &[u8]) -> Result<()> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let root = item.root;

        let mut cursor = Cursor::new(root);
        cursor.seek(&*self, key);

        let leaf = self.node_for_stack(&cursor.stack);
        self.arena[leaf].del(key);
        Ok(())
    }

    /// Reads a key from this transaction's uncommitted page state. Like
    /// the read transaction's `get`, but dirty pages shadow the mmap.
    pub fn get(&self, name: &str, key: &[u8]) -> Result<Option<&[u8]>> {
        let item = self.buckets.get(name).ok_or(Error::BucketNotFound)?;
        let mut cursor = Cursor::new(item.root);
        Ok(cursor.get(self, key))
    }

    /// Commits: rebalance, spill, catalog, dirty pages, meta flip.
    /// On error the database stays at the previous committed version.
    pub fn commit(mut self) -> Result<()> {
        let page_size = self.db.page_size();

        // 1. Rebalance every node the transaction touched. Merges may
        // shrink the cache mid-pass; the snapshot is sound because an
        // absorbed node has already been handled by its absorber.
        {
            let RwTx {
                db, pages, arena, ..
            } = &mut self;
            let src = TxPages { pages, db: *db };
            for id in arena.cached_ids() {
                arena.rebalance(&src, id, page_size);
            }
        }

        // Nodes merged away during rebalancing no longer carry pages in
        // the new version; release them under this transaction.
        let txid = self.meta.txid();
        for page_id in self.arena.take_freed() {
            let overflow = PageSource::page(&self, page_id).overflow();
            self.freelist.free(txid, page_id, overflow);
        }

        // 2. Spill nodes into dirty pages.
        self.spill()?;

        // 3. Serialize the catalog and point the meta at it.
        let count = self.buckets.size().div_ceil(page_size);
        let buckets_page = self.allocate(count)?;
        match self.pages.get_mut(&buckets_page) {
            Some(page) => self.buckets.write(&mut page.page_mut()),
            None => unreachable!("allocate registered page {}", buckets_page),
        }
        self.meta.set_buckets_page_id(buckets_page);

        // 4. Write dirty pages in page-id order.
        self.write_pages()?;

        // 5. Flip the meta. This is the linearization point.
        self.write_meta()?;

        debug!(txid = self.meta.txid(), "commit complete");
        self.finished = true;
        Ok(())
    }

    /// Discards every uncommitted change. Equivalent to dropping the
    /// transaction.
    pub fn rollback(self) {}

    /// Allocates `count` contiguous pages and registers the run as a
    /// dirty page. Falls back from the freelist to the high-water mark,
    /// growing the mmap when the new run would outrun it.
    fn allocate(&mut self, count: usize) -> Result<PageId> {
        let page_size = self.db.page_size();

        let mut id = self.freelist.allocate(count);
        if id == 0 {
            id = self.meta.high_water();
            let min_size = (id as usize + count + 1) * page_size;
            if min_size >= self.db.mapping_len() {
                // The node arena holds borrows into the mapping; they must
                // be heap copies before the region moves.
                self.arena.dereference();
                self.db.grow_mapping(min_size)?;
            }
            self.meta.set_high_water(id + count as PageId);
        }

        let mut page = OwnedPage::new(count, page_size);
        {
            let mut pm = page.page_mut();
            let header = pm.header_mut();
            header.set_id(id);
            header.set_overflow(count as u32 - 1);
        }
        self.pages.insert(id, page);
        Ok(id)
    }

    /// Resolves a cursor stack into the node cache and returns the leaf
    /// node at its tail.
    fn node_for_stack(&mut self, stack: &[ElemRef]) -> NodeId {
        assert!(
            !stack.is_empty(),
            "accessing a node with a zero-length cursor stack"
        );

        let RwTx {
            db, pages, arena, ..
        } = self;
        let src = TxPages { pages, db: *db };

        let mut id = arena.load(&src, stack[0].page_id, None);
        for frame in &stack[..stack.len() - 1] {
            assert!(!arena[id].is_leaf, "expected branch node");
            assert_eq!(
                arena[id].page_id, frame.page_id,
                "cursor stack out of sync with node cache"
            );
            id = arena.child_at(&src, id, frame.index);
        }

        let last = stack[stack.len() - 1];
        assert!(arena[id].is_leaf, "expected leaf node");
        assert_eq!(
            arena[id].page_id, last.page_id,
            "cursor stack out of sync with node cache"
        );
        id
    }

    /// Writes every cached node (deepest first) into freshly allocated
    /// pages, splitting as needed, then repoints catalog roots that moved.
    fn spill(&mut self) -> Result<()> {
        let page_size = self.db.page_size();
        let txid = self.meta.txid();

        let mut work = self.arena.cached_by_depth_desc();
        let mut roots: Vec<(NodeId, PageId)> = Vec::new();

        let mut i = 0;
        while i < work.len() {
            let id = work[i];
            i += 1;

            // Bucket roots are repointed after the spill; remember where
            // each one lived.
            if self.arena[id].parent.is_none() && self.arena[id].page_id != 0 {
                roots.push((id, self.arena[id].page_id));
            }

            let pieces = self.arena.split(id, page_size);

            // A root that split gains a fresh branch parent, spilled
            // after everything queued so far.
            if self.arena[id].parent.is_none() && pieces.len() > 1 {
                let parent_id = self.arena.insert(Node::new(false));
                self.arena[id].parent = Some(parent_id);
                work.push(parent_id);
            }

            // Release the node's old page under this transaction.
            let old_page = self.arena[id].page_id;
            if old_page != 0 {
                let overflow = PageSource::page(&*self, old_page).overflow();
                self.freelist.free(txid, old_page, overflow);
            }

            let parent = self.arena[id].parent;
            for (index, &piece) in pieces.iter().enumerate() {
                let count = self.arena[piece].size().div_ceil(page_size);
                let new_page = self.allocate(count)?;

                {
                    let RwTx { pages, arena, .. } = &mut *self;
                    match pages.get_mut(&new_page) {
                        Some(page) => arena[piece].write(&mut page.page_mut()),
                        None => unreachable!("allocate registered page {}", new_page),
                    }
                }
                self.arena[piece].page_id = new_page;
                self.arena[piece].parent = parent;

                // The first piece replaces the node's existing entry in
                // the parent (located by its original first key); later
                // pieces are inserts.
                if let Some(parent_id) = parent {
                    let first_key = self.arena[piece].inodes[0].key.clone();
                    let old_key = if index == 0 {
                        self.arena[id].key.clone()
                    } else {
                        first_key.clone()
                    };
                    self.arena[parent_id].put(
                        old_key.as_slice(),
                        first_key,
                        Bytes::empty(),
                        new_page,
                    );
                }
            }
        }

        // Root splits promote new ancestors, so resolve each recorded
        // root to whatever it became before the catalog serializes.
        for (node_id, old_page) in roots {
            let root = self.arena.root_of(node_id);
            self.buckets.update_root(old_page, self.arena[root].page_id);
        }
        Ok(())
    }

    /// Frees every page reachable from `root`, including dirty pages
    /// created by this transaction, and drops the tree's cached nodes.
    fn free_tree(&mut self, root: PageId) {
        let txid = self.meta.txid();

        // Cached nodes may borrow the dirty page buffers this walk is
        // about to drop.
        self.arena.dereference();

        let mut stack = vec![root];
        let mut found: Vec<(PageId, u32)> = Vec::new();
        while let Some(id) = stack.pop() {
            let view = PageSource::page(&*self, id);
            found.push((id, view.overflow()));
            if !view.is_leaf() {
                for index in 0..view.count() {
                    stack.push(view.branch_child(index));
                }
            }
        }

        for (id, overflow) in found {
            self.freelist.free(txid, id, overflow);
            self.pages.remove(&id);
            self.arena.evict(id);
        }
    }

    fn write_pages(&mut self) -> Result<()> {
        let page_size = self.db.page_size() as u64;

        let mut ids: Vec<PageId> = self.pages.keys().copied().collect();
        ids.sort_unstable();

        debug!(txid = self.meta.txid(), pages = ids.len(), "writing dirty pages");
        for id in ids {
            if let Some(page) = self.pages.get(&id) {
                self.db.data_file().write_all_at(page.buf(), id * page_size)?;
            }
        }
        self.pages.clear();
        Ok(())
    }

    fn write_meta(&mut self) -> Result<()> {
        let page_size = self.db.page_size();

        let mut buf = vec![0u8; page_size];
        self.meta.write(&mut PageMut::new(&mut buf));
        let id = self.meta.txid() % 2;
        self.db
            .sync_file()
            .write_all_at(&buf, id * page_size as u64)?;
        Ok(())
    }
}

impl PageSource for RwTx<'_> {
    fn page(&self, id: PageId) -> PageView<'_> {
        if let Some(page) = self.pages.get(&id) {
            return page.view();
        }
        PageView::new(self.db.mapped_slice(id))
    }

    fn page_size(&self) -> usize {
        self.db.page_size()
    }
}

impl Drop for RwTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Rolled back (or a failed commit): pages this transaction
            // freed are still live in the committed version.
            self.freelist.rollback(self.meta.txid());
        }
        // The freelist guard drops with the struct, releasing the writer
        // lock.
    }
}
