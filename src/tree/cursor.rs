//! Stack-based B+tree traversal.
//!
//! A cursor walks pages, not nodes: it works identically over a read
//! transaction (pages come straight from the mmap) and a write
//! transaction (dirty pages shadow the mmap), via the [`PageSource`]
//! seam. The stack records the page id and element index chosen at each
//! level; a write transaction later resolves that stack into its node
//! cache to apply a mutation at the right leaf.

use smallvec::SmallVec;

use crate::storage::{PageId, PageSource};

/// One level of a cursor's descent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pub page_id: PageId,
    pub index: usize,
}

/// An iterator over a single bucket's tree, valid for as long as its
/// transaction.
#[derive(Debug)]
pub(crate) struct Cursor {
    root: PageId,
    pub stack: SmallVec<[ElemRef; 8]>,
}

impl Cursor {
    pub fn new(root: PageId) -> Cursor {
        Cursor {
            root,
            stack: SmallVec::new(),
        }
    }

    /// Positions the stack at the leaf slot for `key`: the exact element
    /// if present, otherwise the smallest element greater than it.
    pub fn seek<S: PageSource>(&mut self, src: &S, key: &[u8]) {
        self.stack.clear();
        self.search(src, key, self.root);
    }

    /// Seeks to `key` and returns its value, or None if the bucket holds
    /// no exact match.
    pub fn get<'s, S: PageSource>(&mut self, src: &'s S, key: &[u8]) -> Option<&'s [u8]> {
        self.seek(src, key);

        let top = self.stack.last()?;
        let view = src.page(top.page_id);
        if top.index >= view.count() {
            return None;
        }
        if view.leaf_key(top.index) != key {
            return None;
        }
        Some(view.leaf_value(top.index))
    }

    /// Moves to the first element of the bucket. Returns None when the
    /// bucket is empty.
    pub fn first<'s, S: PageSource>(&mut self, src: &'s S) -> Option<(&'s [u8], &'s [u8])> {
        self.stack.clear();
        self.stack.push(ElemRef {
            page_id: self.root,
            index: 0,
        });
        self.descend_to_leaf(src);
        self.key_value(src)
    }

    /// Advances to the next element in key order. Returns None once the
    /// bucket is exhausted.
    pub fn next<'s, S: PageSource>(&mut self, src: &'s S) -> Option<(&'s [u8], &'s [u8])> {
        // Pop frames sitting on their last element, then advance the
        // survivor; an empty stack means the iteration is done.
        loop {
            let top = match self.stack.last_mut() {
                Some(top) => top,
                None => return None,
            };
            let count = src.page(top.page_id).count();
            if top.index + 1 < count {
                top.index += 1;
                break;
            }
            self.stack.pop();
        }

        self.descend_to_leaf(src);
        self.key_value(src)
    }

    fn search<S: PageSource>(&mut self, src: &S, key: &[u8], page_id: PageId) {
        let view = src.page(page_id);
        let count = view.count();

        if view.is_leaf() {
            // Lower bound within the leaf.
            let mut lo = 0;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if view.leaf_key(mid) < key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            self.stack.push(ElemRef {
                page_id,
                index: lo,
            });
            return;
        }

        // Greatest branch key <= target: lower bound, stepped back one
        // when there is no exact match.
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if view.branch_key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < count && view.branch_key(lo) == key;
        let index = if !exact && lo > 0 { lo - 1 } else { lo };

        self.stack.push(ElemRef { page_id, index });
        self.search(src, key, view.branch_child(index));
    }

    /// Pushes frames down to the leftmost leaf beneath the top frame's
    /// current position.
    fn descend_to_leaf<S: PageSource>(&mut self, src: &S) {
        loop {
            let top = match self.stack.last() {
                Some(top) => *top,
                None => return,
            };
            let view = src.page(top.page_id);
            if view.is_leaf() {
                return;
            }
            self.stack.push(ElemRef {
                page_id: view.branch_child(top.index),
                index: 0,
            });
        }
    }

    fn key_value<'s, S: PageSource>(&self, src: &'s S) -> Option<(&'s [u8], &'s [u8])> {
        let top = self.stack.last()?;
        let view = src.page(top.page_id);
        if top.index >= view.count() {
            return None;
        }
        Some((view.leaf_key(top.index), view.leaf_value(top.index)))
    }
}
