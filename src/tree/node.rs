//! In-memory, mutable nodes.
//!
//! A writer transaction never mutates page bytes in place. Pages touched
//! by a mutation are deserialized into [`Node`]s held in a [`NodeArena`];
//! at commit the nodes are rebalanced, split, and written out to freshly
//! allocated pages. Readers never see nodes.
//!
//! ## Arena and parent links
//!
//! The node graph is a tree with upward pointers, built lazily as cursors
//! descend. To avoid cyclic ownership the arena owns every node and links
//! are [`NodeId`] indices. The arena also keeps a by-page-id map (the node
//! cache): loading the same page twice within one transaction yields the
//! same node. Nodes created by splits have no page yet and stay out of the
//! cache; they still live in the arena so a remap can reach them.
//!
//! ## Borrowed bytes
//!
//! A node freshly read from a page keeps its keys and values as [`Bytes`]
//! pointing straight into the page memory (the mmap, or a dirty page
//! buffer owned by the transaction). Nothing is copied until either the
//! entry is overwritten or the mapping is about to move, at which point
//! `dereference` turns every borrowed entry into an owned heap copy.

use hashbrown::HashMap;

use crate::storage::{
    write_prefix, BranchElement, LeafElement, PageId, PageMut, PageSource, PageView,
    BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG,
    MAX_NODES_PER_PAGE, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE,
};

/// Index of a node within its transaction's arena.
pub(crate) type NodeId = usize;

/// Key or value bytes held by a node.
///
/// `Mapped` entries borrow the transaction's page memory: the database
/// mmap, or a dirty page buffer in the write transaction's page cache.
///
/// # Safety contract
///
/// A `Mapped` entry is only dereferenced while its backing memory is
/// alive: dirty page buffers live until the transaction ends, and the
/// mmap is only replaced by the writer's own `allocate`, which calls
/// [`NodeArena::dereference`] on every node first. Nodes never outlive
/// their transaction.
#[derive(Debug, Clone)]
pub(crate) enum Bytes {
    Mapped { ptr: *const u8, len: usize },
    Owned(Box<[u8]>),
}

impl Bytes {
    pub fn mapped(slice: &[u8]) -> Bytes {
        Bytes::Mapped {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    pub fn owned(slice: &[u8]) -> Bytes {
        Bytes::Owned(slice.into())
    }

    pub fn empty() -> Bytes {
        Bytes::Owned(Box::new([]))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            // SAFETY: per the type's contract, mapped entries are only
            // read while the backing page memory is still mapped; the
            // writer dereferences every node before remapping.
            Bytes::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Bytes::Owned(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Bytes::Mapped { len, .. } => *len,
            Bytes::Owned(b) => b.len(),
        }
    }

    /// Replaces a mapped entry with an owned heap copy.
    pub fn make_owned(&mut self) {
        if let Bytes::Mapped { .. } = self {
            *self = Bytes::Owned(self.as_slice().into());
        }
    }

    #[cfg(test)]
    pub fn is_owned(&self) -> bool {
        matches!(self, Bytes::Owned(_))
    }
}

/// One entry inside a node: a key, a value (leaves only), and a child
/// page id (branches only).
#[derive(Debug, Clone)]
pub(crate) struct Inode {
    pub key: Bytes,
    pub value: Bytes,
    pub page_id: PageId,
}

/// Mutable form of a branch or leaf page.
#[derive(Debug)]
pub(crate) struct Node {
    pub is_leaf: bool,
    /// Page this node was read from; 0 if it has never been written.
    pub page_id: PageId,
    pub parent: Option<NodeId>,
    pub depth: usize,
    /// First key at read time, used to find this node's entry in its
    /// parent while spilling.
    pub key: Bytes,
    pub unbalanced: bool,
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn new(is_leaf: bool) -> Node {
        Node {
            is_leaf,
            page_id: 0,
            parent: None,
            depth: 0,
            key: Bytes::empty(),
            unbalanced: false,
            inodes: Vec::new(),
        }
    }

    /// Deserializes a page into this node. Keys and values stay borrowed
    /// from the page memory.
    pub fn read(&mut self, view: &PageView<'_>) {
        self.page_id = view.id();
        self.is_leaf = view.is_leaf();
        let count = view.count();

        self.inodes = Vec::with_capacity(count);
        for i in 0..count {
            let inode = if self.is_leaf {
                Inode {
                    key: Bytes::mapped(view.leaf_key(i)),
                    value: Bytes::mapped(view.leaf_value(i)),
                    page_id: 0,
                }
            } else {
                Inode {
                    key: Bytes::mapped(view.branch_key(i)),
                    value: Bytes::empty(),
                    page_id: view.branch_child(i),
                }
            };
            assert!(inode.key.len() > 0, "read: zero-length inode key");
            self.inodes.push(inode);
        }

        self.key = match self.inodes.first() {
            Some(first) => first.key.clone(),
            None => Bytes::empty(),
        };
    }

    /// Inserts or replaces an entry. The entry is located by `old_key`;
    /// leaves pass the same key twice, branches pass a child page id and
    /// no value.
    pub fn put(&mut self, old_key: &[u8], new_key: Bytes, value: Bytes, page_id: PageId) {
        let inode = Inode {
            key: new_key,
            value,
            page_id,
        };
        match self
            .inodes
            .binary_search_by(|i| i.key.as_slice().cmp(old_key))
        {
            Ok(index) => self.inodes[index] = inode,
            Err(index) => self.inodes.insert(index, inode),
        }
    }

    /// Removes an entry if present and marks the node for rebalancing.
    pub fn del(&mut self, key: &[u8]) {
        if let Ok(index) = self
            .inodes
            .binary_search_by(|i| i.key.as_slice().cmp(key))
        {
            self.inodes.remove(index);
            self.unbalanced = true;
        }
    }

    /// Serialized byte size, header included.
    pub fn size(&self) -> usize {
        let elem = self.element_size();
        self.inodes
            .iter()
            .fold(PAGE_HEADER_SIZE, |acc, i| acc + elem + i.key.len() + i.value.len())
    }

    pub fn element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Minimum entries this node may hold before rebalancing merges it.
    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    /// Serializes the node onto a page buffer. Element positions are
    /// self-relative, so the buffer can later land anywhere in the file.
    pub fn write(&self, page: &mut PageMut<'_>) {
        assert!(
            self.inodes.len() <= MAX_NODES_PER_PAGE,
            "node has too many elements: {}",
            self.inodes.len()
        );
        {
            let header = page.header_mut();
            header.add_flags(if self.is_leaf {
                LEAF_PAGE_FLAG
            } else {
                BRANCH_PAGE_FLAG
            });
            header.set_count(self.inodes.len());
        }

        let elem_size = self.element_size();
        let data = page.data_mut();
        let mut data_off = PAGE_HEADER_SIZE + elem_size * self.inodes.len();
        for (i, inode) in self.inodes.iter().enumerate() {
            let elem_off = PAGE_HEADER_SIZE + i * elem_size;
            let pos = (data_off - elem_off) as u32;
            let key = inode.key.as_slice();
            let value = inode.value.as_slice();

            if self.is_leaf {
                let elem = LeafElement::new(pos, key.len() as u32, value.len() as u32);
                write_prefix(&mut data[elem_off..], &elem);
            } else {
                assert!(inode.page_id != 0, "write: branch child without a page");
                let elem = BranchElement::new(pos, key.len() as u32, inode.page_id);
                write_prefix(&mut data[elem_off..], &elem);
            }

            data[data_off..data_off + key.len()].copy_from_slice(key);
            data_off += key.len();
            data[data_off..data_off + value.len()].copy_from_slice(value);
            data_off += value.len();
        }
    }

    /// Copies every borrowed key and value onto the heap. Must run before
    /// the memory backing this node's entries goes away.
    pub fn dereference(&mut self) {
        self.key.make_owned();
        for inode in &mut self.inodes {
            inode.key.make_owned();
            inode.value.make_owned();
        }
    }
}

/// Owns every node materialized by one write transaction.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
    /// Node cache: page id -> node, for nodes read from a page.
    cache: HashMap<PageId, NodeId>,
    /// Pages whose nodes were merged away during rebalancing; the commit
    /// releases them to the freelist.
    freed: Vec<PageId>,
}

impl NodeArena {
    pub fn new() -> NodeArena {
        NodeArena::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        if node.page_id != 0 {
            self.cache.insert(node.page_id, id);
        }
        self.nodes.push(node);
        id
    }

    pub fn cached(&self, page_id: PageId) -> Option<NodeId> {
        self.cache.get(&page_id).copied()
    }

    /// Drops a node from the cache (it stays in the arena so dereference
    /// still covers it).
    pub fn evict(&mut self, page_id: PageId) {
        self.cache.remove(&page_id);
    }

    /// Drops a merged-away node from the cache and marks its page for
    /// release.
    fn retire(&mut self, page_id: PageId) {
        self.evict(page_id);
        if page_id != 0 {
            self.freed.push(page_id);
        }
    }

    /// Pages retired by rebalancing since the last call.
    pub fn take_freed(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.freed)
    }

    /// Snapshot of the cached nodes. Rebalancing may shrink the cache
    /// mid-iteration; a node merged away has already been rebalanced by
    /// being absorbed, so iterating the snapshot is sound.
    pub fn cached_ids(&self) -> Vec<NodeId> {
        self.cache.values().copied().collect()
    }

    /// Cached nodes sorted deepest-first, the spill order: children are
    /// written (and linked into their parents) before the parents
    /// themselves spill.
    pub fn cached_by_depth_desc(&self) -> Vec<NodeId> {
        let mut ids = self.cached_ids();
        ids.sort_unstable_by(|a, b| self.nodes[*b].depth.cmp(&self.nodes[*a].depth));
        ids
    }

    /// Walks parent links to the root of the subtree containing `id`.
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            current = parent;
        }
        current
    }

    /// Returns the cached node for a page, reading and caching it if
    /// needed. `parent` only applies to a fresh load.
    pub fn load<S: PageSource>(
        &mut self,
        src: &S,
        page_id: PageId,
        parent: Option<NodeId>,
    ) -> NodeId {
        if let Some(id) = self.cached(page_id) {
            return id;
        }
        let mut node = Node::new(false);
        node.parent = parent;
        node.depth = match parent {
            Some(p) => self.nodes[p].depth + 1,
            None => 0,
        };
        node.read(&src.page(page_id));
        self.insert(node)
    }

    /// Loads the i-th child of a branch node into the cache.
    pub fn child_at<S: PageSource>(&mut self, src: &S, id: NodeId, index: usize) -> NodeId {
        assert!(
            !self.nodes[id].is_leaf,
            "invalid child_at({}) on a leaf node",
            index
        );
        let child_page = self.nodes[id].inodes[index].page_id;
        self.load(src, child_page, Some(id))
    }

    /// Index of `child` within its parent's entries, located by the
    /// child's first key.
    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        let key = self.nodes[child].key.as_slice();
        self.nodes[parent]
            .inodes
            .partition_point(|i| i.key.as_slice() < key)
    }

    /// Converts every borrowed entry in the arena to an owned copy.
    /// Called before the mmap is replaced; covers cached nodes and
    /// pending split products alike.
    pub fn dereference(&mut self) {
        for node in &mut self.nodes {
            node.dereference();
        }
    }

    /// Splits a node into one or more nodes of roughly half a page each.
    /// The first returned node is `id` itself, mutated in place, so
    /// ancestors keep the same identity; later nodes are fresh, unwritten,
    /// and not yet linked to a parent.
    pub fn split(&mut self, id: NodeId, page_size: usize) -> Vec<NodeId> {
        let mut result = vec![id];
        if self.nodes[id].inodes.len() <= MIN_KEYS_PER_PAGE * 2
            || self.nodes[id].size() < page_size
        {
            return result;
        }

        // Fill threshold is 50%: splits leave room to absorb neighbors.
        let threshold = page_size / 2;
        let elem_size = self.nodes[id].element_size();
        let is_leaf = self.nodes[id].is_leaf;
        let depth = self.nodes[id].depth;
        let inodes = std::mem::take(&mut self.nodes[id].inodes);
        let total = inodes.len();

        let mut size = PAGE_HEADER_SIZE;
        let mut current = id;
        for (i, inode) in inodes.into_iter().enumerate() {
            let elem = elem_size + inode.key.len() + inode.value.len();

            if self.nodes[current].inodes.len() >= MIN_KEYS_PER_PAGE
                && i + MIN_KEYS_PER_PAGE < total
                && size + elem > threshold
            {
                size = PAGE_HEADER_SIZE;
                let mut node = Node::new(is_leaf);
                node.depth = depth;
                current = self.insert(node);
                result.push(current);
            }

            size += elem;
            self.nodes[current].inodes.push(inode);
        }
        result
    }

    /// Merges or redistributes an underfilled node. No-op unless a delete
    /// marked it. May cascade to ancestors when a merge empties a slot.
    pub fn rebalance<S: PageSource>(&mut self, src: &S, id: NodeId, page_size: usize) {
        if !self.nodes[id].unbalanced {
            return;
        }
        self.nodes[id].unbalanced = false;

        // Above a quarter page and above the key floor: leave it alone.
        let threshold = page_size / 4;
        if self.nodes[id].size() > threshold
            && self.nodes[id].inodes.len() > self.nodes[id].min_keys()
        {
            return;
        }

        let Some(parent) = self.nodes[id].parent else {
            // A branch root holding a single child collapses: the child's
            // entries move up and the root adopts its leaf-ness.
            if !self.nodes[id].is_leaf && self.nodes[id].inodes.len() == 1 {
                let child_page = self.nodes[id].inodes[0].page_id;
                let child = self.load(src, child_page, Some(id));

                let (child_is_leaf, child_inodes) = {
                    let c = &mut self.nodes[child];
                    (c.is_leaf, std::mem::take(&mut c.inodes))
                };
                self.nodes[id].is_leaf = child_is_leaf;
                self.nodes[id].inodes = child_inodes;

                // Reparent any cached grandchildren onto the root.
                if !child_is_leaf {
                    for i in 0..self.nodes[id].inodes.len() {
                        let page = self.nodes[id].inodes[i].page_id;
                        if let Some(grandchild) = self.cached(page) {
                            self.nodes[grandchild].parent = Some(id);
                        }
                    }
                }

                self.nodes[child].parent = None;
                self.retire(child_page);
            }
            return;
        };

        assert!(
            self.nodes[parent].inodes.len() > 1,
            "parent must have at least 2 children"
        );

        // Borrow from or merge with the right sibling when this is the
        // leftmost child, otherwise the left sibling.
        let index = self.child_index(parent, id);
        let use_next = index == 0;
        let target = if use_next {
            self.child_at(src, parent, index + 1)
        } else {
            self.child_at(src, parent, index - 1)
        };

        if self.nodes[target].inodes.len() > self.nodes[target].min_keys() {
            // Target has spare entries: move exactly one over from the
            // adjacent side and fix the shifted node's key in the parent.
            if use_next {
                let moved = self.nodes[target].inodes.remove(0);
                if moved.page_id != 0 {
                    if let Some(child) = self.cached(moved.page_id) {
                        self.nodes[child].parent = Some(id);
                    }
                }
                self.nodes[id].inodes.push(moved);

                let old_key = self.nodes[target].key.clone();
                let new_key = self.nodes[target].inodes[0].key.clone();
                let target_page = self.nodes[target].page_id;
                self.nodes[target].key = new_key.clone();
                self.nodes[parent].put(old_key.as_slice(), new_key, Bytes::empty(), target_page);
            } else {
                let moved = match self.nodes[target].inodes.pop() {
                    Some(inode) => inode,
                    None => unreachable!("sibling above min_keys cannot be empty"),
                };
                if moved.page_id != 0 {
                    if let Some(child) = self.cached(moved.page_id) {
                        self.nodes[child].parent = Some(id);
                    }
                }
                self.nodes[id].inodes.insert(0, moved);

                let old_key = self.nodes[id].key.clone();
                let new_key = self.nodes[id].inodes[0].key.clone();
                let own_page = self.nodes[id].page_id;
                self.nodes[id].key = new_key.clone();
                self.nodes[parent].put(old_key.as_slice(), new_key, Bytes::empty(), own_page);
            }
            return;
        }

        // Both nodes sit at the floor: merge, right into left, and drop
        // the absorbed node from the parent and the cache.
        if use_next {
            let absorbed = std::mem::take(&mut self.nodes[target].inodes);
            for inode in &absorbed {
                if inode.page_id != 0 {
                    if let Some(child) = self.cached(inode.page_id) {
                        self.nodes[child].parent = Some(id);
                    }
                }
            }
            self.nodes[id].inodes.extend(absorbed);

            let target_key = self.nodes[target].key.clone();
            let target_page = self.nodes[target].page_id;
            self.nodes[parent].del(target_key.as_slice());
            self.nodes[target].parent = None;
            self.retire(target_page);
        } else {
            let absorbed = std::mem::take(&mut self.nodes[id].inodes);
            for inode in &absorbed {
                if inode.page_id != 0 {
                    if let Some(child) = self.cached(inode.page_id) {
                        self.nodes[child].parent = Some(target);
                    }
                }
            }
            self.nodes[target].inodes.extend(absorbed);

            let own_key = self.nodes[id].key.clone();
            let own_page = self.nodes[id].page_id;
            self.nodes[parent].del(own_key.as_slice());
            self.nodes[id].parent = None;
            self.retire(own_page);
        }

        // The parent lost an entry; the delete above marked it.
        self.rebalance(src, parent, page_size);
    }
}

impl std::ops::Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl std::ops::IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageMut;

    const PAGE_SIZE: usize = 4096;

    struct TestSource {
        pages: HashMap<PageId, Vec<u8>>,
    }

    impl TestSource {
        fn new() -> TestSource {
            TestSource {
                pages: HashMap::new(),
            }
        }

        fn add(&mut self, id: PageId, node: &Node) {
            let mut buf = vec![0u8; PAGE_SIZE];
            {
                let mut page = PageMut::new(&mut buf);
                page.header_mut().set_id(id);
                node.write(&mut page);
            }
            self.pages.insert(id, buf);
        }
    }

    impl PageSource for TestSource {
        fn page(&self, id: PageId) -> PageView<'_> {
            PageView::new(&self.pages[&id])
        }

        fn page_size(&self) -> usize {
            PAGE_SIZE
        }
    }

    fn leaf_put(node: &mut Node, key: &[u8], value: &[u8]) {
        node.put(key, Bytes::owned(key), Bytes::owned(value), 0);
    }

    #[test]
    fn put_keeps_entries_sorted_and_overwrites() {
        let mut n = Node::new(true);
        leaf_put(&mut n, b"baz", b"2");
        leaf_put(&mut n, b"foo", b"0");
        leaf_put(&mut n, b"bar", b"1");
        leaf_put(&mut n, b"foo", b"3");

        assert_eq!(n.inodes.len(), 3);
        assert_eq!(n.inodes[0].key.as_slice(), b"bar");
        assert_eq!(n.inodes[0].value.as_slice(), b"1");
        assert_eq!(n.inodes[1].key.as_slice(), b"baz");
        assert_eq!(n.inodes[1].value.as_slice(), b"2");
        assert_eq!(n.inodes[2].key.as_slice(), b"foo");
        assert_eq!(n.inodes[2].value.as_slice(), b"3");
    }

    #[test]
    fn del_removes_and_marks_unbalanced() {
        let mut n = Node::new(true);
        leaf_put(&mut n, b"bar", b"1");
        leaf_put(&mut n, b"foo", b"2");

        n.del(b"nope");
        assert!(!n.unbalanced);

        n.del(b"bar");
        assert!(n.unbalanced);
        assert_eq!(n.inodes.len(), 1);
        assert_eq!(n.inodes[0].key.as_slice(), b"foo");
    }

    #[test]
    fn read_deserializes_a_leaf_page() {
        let mut original = Node::new(true);
        leaf_put(&mut original, b"bar", b"fooz");
        leaf_put(&mut original, b"helloworld", b"bye");

        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut page = PageMut::new(&mut buf);
            page.header_mut().set_id(3);
            original.write(&mut page);
        }

        let mut n = Node::new(false);
        n.read(&PageView::new(&buf));
        assert!(n.is_leaf);
        assert_eq!(n.page_id, 3);
        assert_eq!(n.key.as_slice(), b"bar");
        assert_eq!(n.inodes.len(), 2);
        assert_eq!(n.inodes[0].key.as_slice(), b"bar");
        assert_eq!(n.inodes[0].value.as_slice(), b"fooz");
        assert_eq!(n.inodes[1].key.as_slice(), b"helloworld");
        assert_eq!(n.inodes[1].value.as_slice(), b"bye");
    }

    #[test]
    fn read_deserializes_a_branch_page() {
        let mut original = Node::new(false);
        original.put(b"aa", Bytes::owned(b"aa"), Bytes::empty(), 7);
        original.put(b"mm", Bytes::owned(b"mm"), Bytes::empty(), 9);

        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut page = PageMut::new(&mut buf);
            page.header_mut().set_id(5);
            original.write(&mut page);
        }

        let mut n = Node::new(true);
        n.read(&PageView::new(&buf));
        assert!(!n.is_leaf);
        assert_eq!(n.inodes[0].page_id, 7);
        assert_eq!(n.inodes[1].page_id, 9);
    }

    #[test]
    fn size_counts_header_elements_and_payload() {
        let mut n = Node::new(true);
        leaf_put(&mut n, b"abc", b"de");

        assert_eq!(n.size(), PAGE_HEADER_SIZE + LEAF_ELEMENT_SIZE + 3 + 2);
    }

    #[test]
    fn split_returns_self_when_small() {
        let mut arena = NodeArena::new();
        let mut n = Node::new(true);
        leaf_put(&mut n, b"a", b"1");
        leaf_put(&mut n, b"b", b"2");
        let id = arena.insert(n);

        assert_eq!(arena.split(id, PAGE_SIZE), vec![id]);
    }

    #[test]
    fn split_divides_an_oversized_node() {
        let mut arena = NodeArena::new();
        let mut n = Node::new(true);
        let value = vec![0u8; 128];
        for i in 0..100u32 {
            let key = format!("{:08}", i);
            leaf_put(&mut n, key.as_bytes(), &value);
        }
        assert!(n.size() > PAGE_SIZE);
        let id = arena.insert(n);

        let parts = arena.split(id, PAGE_SIZE);
        assert!(parts.len() > 1);
        assert_eq!(parts[0], id);

        let mut total = 0;
        for &part in &parts {
            let node = &arena[part];
            assert!(node.inodes.len() >= MIN_KEYS_PER_PAGE);
            assert!(node.is_leaf);
            total += node.inodes.len();
        }
        assert_eq!(total, 100);

        // Later pieces are unwritten and unlinked until spill.
        for &part in &parts[1..] {
            assert_eq!(arena[part].page_id, 0);
            assert!(arena[part].parent.is_none());
        }
    }

    #[test]
    fn rebalance_is_a_noop_without_the_flag() {
        let mut arena = NodeArena::new();
        let src = TestSource::new();
        let mut n = Node::new(true);
        leaf_put(&mut n, b"a", b"1");
        let id = arena.insert(n);

        arena.rebalance(&src, id, PAGE_SIZE);
        assert_eq!(arena[id].inodes.len(), 1);
    }

    #[test]
    fn rebalance_collapses_single_child_branch_root() {
        let mut src = TestSource::new();
        let mut child = Node::new(true);
        leaf_put(&mut child, b"k1", b"v1");
        leaf_put(&mut child, b"k2", b"v2");
        src.add(7, &child);

        let mut arena = NodeArena::new();
        let mut root = Node::new(false);
        root.page_id = 3;
        root.put(b"k1", Bytes::owned(b"k1"), Bytes::empty(), 7);
        root.unbalanced = true;
        let root_id = arena.insert(root);

        arena.rebalance(&src, root_id, PAGE_SIZE);

        let root = &arena[root_id];
        assert!(root.is_leaf);
        assert_eq!(root.inodes.len(), 2);
        assert_eq!(root.inodes[0].value.as_slice(), b"v1");
        assert!(arena.cached(7).is_none());
    }

    #[test]
    fn rebalance_merges_underfilled_leaf_into_left_sibling() {
        let mut src = TestSource::new();
        let mut left = Node::new(true);
        leaf_put(&mut left, b"a", b"1");
        src.add(8, &left);

        let mut arena = NodeArena::new();
        let mut parent = Node::new(false);
        parent.page_id = 3;
        parent.put(b"a", Bytes::owned(b"a"), Bytes::empty(), 8);
        parent.put(b"m", Bytes::owned(b"m"), Bytes::empty(), 9);
        let parent_id = arena.insert(parent);

        let mut right = Node::new(true);
        right.page_id = 9;
        right.depth = 1;
        right.parent = Some(parent_id);
        right.key = Bytes::owned(b"m");
        leaf_put(&mut right, b"m", b"2");
        right.unbalanced = true;
        let right_id = arena.insert(right);

        arena.rebalance(&src, right_id, PAGE_SIZE);

        // Right merged into left, the parent shrank to a single entry,
        // and the cascade collapsed the root onto the merged leaf.
        assert!(arena[parent_id].is_leaf);
        assert_eq!(arena[parent_id].inodes.len(), 2);
        assert_eq!(arena[parent_id].inodes[0].key.as_slice(), b"a");
        assert_eq!(arena[parent_id].inodes[1].key.as_slice(), b"m");
        assert!(arena.cached(8).is_none());
        assert!(arena.cached(9).is_none());
    }

    #[test]
    fn rebalance_borrows_one_entry_from_a_rich_sibling() {
        let mut src = TestSource::new();
        let mut right = Node::new(true);
        leaf_put(&mut right, b"m", b"1");
        leaf_put(&mut right, b"n", b"2");
        leaf_put(&mut right, b"o", b"3");
        src.add(9, &right);

        let mut arena = NodeArena::new();
        let mut parent = Node::new(false);
        parent.page_id = 3;
        parent.put(b"a", Bytes::owned(b"a"), Bytes::empty(), 8);
        parent.put(b"m", Bytes::owned(b"m"), Bytes::empty(), 9);
        // Keep the parent itself above its floor during the cascade.
        parent.put(b"z", Bytes::owned(b"z"), Bytes::empty(), 10);
        let parent_id = arena.insert(parent);

        let mut left = Node::new(true);
        left.page_id = 8;
        left.depth = 1;
        left.parent = Some(parent_id);
        left.key = Bytes::owned(b"a");
        leaf_put(&mut left, b"a", b"0");
        left.del(b"a"); // now empty and unbalanced
        let left_id = arena.insert(left);

        arena.rebalance(&src, left_id, PAGE_SIZE);

        assert_eq!(arena[left_id].inodes.len(), 1);
        assert_eq!(arena[left_id].inodes[0].key.as_slice(), b"m");
        let right_id = arena.cached(9).unwrap();
        assert_eq!(arena[right_id].inodes.len(), 2);
        assert_eq!(arena[right_id].key.as_slice(), b"n");
        // Parent's entry for the right sibling now carries its new first key.
        assert_eq!(arena[parent_id].inodes[1].key.as_slice(), b"n");
    }

    #[test]
    fn dereference_copies_borrowed_entries() {
        let mut original = Node::new(true);
        leaf_put(&mut original, b"bar", b"baz");

        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut page = PageMut::new(&mut buf);
            page.header_mut().set_id(3);
            original.write(&mut page);
        }

        let mut arena = NodeArena::new();
        let mut n = Node::new(true);
        n.read(&PageView::new(&buf));
        assert!(!n.inodes[0].key.is_owned());
        let id = arena.insert(n);

        arena.dereference();
        assert!(arena[id].inodes[0].key.is_owned());
        assert!(arena[id].inodes[0].value.is_owned());
        assert_eq!(arena[id].inodes[0].key.as_slice(), b"bar");
        assert_eq!(arena[id].inodes[0].value.as_slice(), b"baz");
    }
}
