//! Writer-side node cache
//!
//! A node is the mutable in-memory image of one page, created lazily
//! when a writer first touches the page. Nodes own copies of their keys
//! and values, link to their parent through a weak back-reference, and
//! track materialized children for spill ordering. At commit the dirty
//! tree is rebalanced bottom-up, split against the fill threshold, and
//! serialized into freshly allocated pages.

use crate::bucket::BucketInner;
use crate::error::{PageId, Result};
use crate::page::{self, PageFlags, PageRef, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE};
use crate::tx::TxInner;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Minimum number of elements before a page can be split
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// Lower clamp for a bucket's fill percentage
pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
/// Upper clamp for a bucket's fill percentage
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;

/// One in-memory element. Branch entries carry a child page id; leaf
/// entries carry flags and value bytes.
pub(crate) struct Inode {
    pub flags: u32,
    pub pgid: PageId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Mutable image of a page being edited by the writer
pub(crate) struct Node {
    pub(crate) is_leaf: Cell<bool>,
    /// Backing page id; zero until the node is spilled (or for the
    /// single page of an inline bucket)
    pub(crate) pgid: Cell<PageId>,
    pub(crate) parent: RefCell<Weak<Node>>,
    /// Materialized children, tracked for spill ordering only
    pub(crate) children: RefCell<Vec<Rc<Node>>>,
    pub(crate) inodes: RefCell<Vec<Inode>>,
    /// First key at read time; the parent's downward pointer
    pub(crate) key: RefCell<Vec<u8>>,
    pub(crate) spilled: Cell<bool>,
    pub(crate) unbalanced: Cell<bool>,
}

impl Node {
    pub(crate) fn new(is_leaf: bool) -> Self {
        Self {
            is_leaf: Cell::new(is_leaf),
            pgid: Cell::new(PageId(0)),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            inodes: RefCell::new(Vec::new()),
            key: RefCell::new(Vec::new()),
            spilled: Cell::new(false),
            unbalanced: Cell::new(false),
        }
    }

    /// Decode a page image into this node.
    pub(crate) fn read(&self, p: PageRef<'_>) {
        self.pgid.set(p.id());
        self.is_leaf.set(p.is_leaf());
        let count = p.count();
        let mut inodes = Vec::with_capacity(count);
        for i in 0..count {
            if p.is_leaf() {
                let (flags, key, value) = p.leaf_elem(i);
                inodes.push(Inode {
                    flags,
                    pgid: PageId(0),
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
            } else {
                let (key, pgid) = p.branch_elem(i);
                inodes.push(Inode { flags: 0, pgid, key: key.to_vec(), value: Vec::new() });
            }
        }
        *self.key.borrow_mut() =
            if let Some(first) = inodes.first() { first.key.clone() } else { Vec::new() };
        *self.inodes.borrow_mut() = inodes;
    }

    pub(crate) fn min_keys(&self) -> usize {
        if self.is_leaf.get() {
            1
        } else {
            2
        }
    }

    pub(crate) fn num_children(&self) -> usize {
        self.inodes.borrow().len()
    }

    /// Serialized size of this node, header included.
    pub(crate) fn size(&self) -> usize {
        let inodes = self.inodes.borrow();
        let mut size = PAGE_HEADER_SIZE;
        for ino in inodes.iter() {
            size += LEAF_ELEMENT_SIZE + ino.key.len() + ino.value.len();
        }
        size
    }

    fn size_less_than(&self, v: usize) -> bool {
        self.size() < v
    }

    /// Insert or replace the entry at `old_key`.
    pub(crate) fn put(
        &self,
        old_key: &[u8],
        new_key: &[u8],
        value: Vec<u8>,
        pgid: PageId,
        flags: u32,
    ) {
        debug_assert!(!old_key.is_empty(), "put with empty old key");
        debug_assert!(!new_key.is_empty(), "put with empty new key");
        let mut inodes = self.inodes.borrow_mut();
        let index = inodes.partition_point(|ino| ino.key.as_slice() < old_key);
        let exact = index < inodes.len() && inodes[index].key == old_key;
        if exact {
            let ino = &mut inodes[index];
            ino.flags = flags;
            ino.key = new_key.to_vec();
            ino.value = value;
            ino.pgid = pgid;
        } else {
            inodes.insert(index, Inode { flags, pgid, key: new_key.to_vec(), value });
        }
    }

    /// Remove the entry at `key`, if present, and mark the node for
    /// rebalancing.
    pub(crate) fn del(&self, key: &[u8]) {
        let mut inodes = self.inodes.borrow_mut();
        let index = inodes.partition_point(|ino| ino.key.as_slice() < key);
        if index >= inodes.len() || inodes[index].key != key {
            return;
        }
        inodes.remove(index);
        drop(inodes);
        self.unbalanced.set(true);
    }

    /// Serialize into a page buffer. The id and overflow fields were
    /// laid down at allocation and are preserved.
    pub(crate) fn write(&self, buf: &mut [u8]) {
        let inodes = self.inodes.borrow();
        let count = inodes.len();
        let flags = if self.is_leaf.get() { PageFlags::LEAF } else { PageFlags::BRANCH };
        page::write_u16(buf, 8, flags.bits());
        page::write_u16(buf, 10, count as u16);
        let mut off = PAGE_HEADER_SIZE + count * LEAF_ELEMENT_SIZE;
        for (i, ino) in inodes.iter().enumerate() {
            let elem = PAGE_HEADER_SIZE + i * LEAF_ELEMENT_SIZE;
            let pos = (off - elem) as u32;
            if self.is_leaf.get() {
                page::write_u32(buf, elem, ino.flags);
                page::write_u32(buf, elem + 4, pos);
                page::write_u32(buf, elem + 8, ino.key.len() as u32);
                page::write_u32(buf, elem + 12, ino.value.len() as u32);
            } else {
                page::write_u32(buf, elem, pos);
                page::write_u32(buf, elem + 4, ino.key.len() as u32);
                page::write_u64(buf, elem + 8, ino.pgid.0);
            }
            buf[off..off + ino.key.len()].copy_from_slice(&ino.key);
            off += ino.key.len();
            buf[off..off + ino.value.len()].copy_from_slice(&ino.value);
            off += ino.value.len();
        }
    }

    /// Materialize the child node at `index` of this branch.
    pub(crate) fn child_at(
        self: &Rc<Node>,
        bucket: &Rc<BucketInner>,
        index: usize,
    ) -> Result<Rc<Node>> {
        debug_assert!(!self.is_leaf.get(), "child_at on a leaf node");
        let pgid = self.inodes.borrow()[index].pgid;
        bucket.node(pgid, Some(self))
    }

    /// Index of `child` within this branch, by its original first key.
    pub(crate) fn child_index(&self, child: &Node) -> usize {
        let key = child.key.borrow();
        self.inodes.borrow().partition_point(|ino| ino.key.as_slice() < key.as_slice())
    }

    pub(crate) fn remove_child(&self, target: &Rc<Node>) {
        self.children.borrow_mut().retain(|c| !Rc::ptr_eq(c, target));
    }

    /// Topmost node reachable through parent links.
    pub(crate) fn root(self: &Rc<Node>) -> Rc<Node> {
        let parent = self.parent.borrow().upgrade();
        match parent {
            Some(p) => p.root(),
            None => self.clone(),
        }
    }

    /// Return the backing page to the freelist.
    pub(crate) fn free(&self, tx: &TxInner) -> Result<()> {
        if self.pgid.get().0 != 0 {
            tx.free(self.pgid.get())?;
            self.pgid.set(PageId(0));
        }
        Ok(())
    }

    /// Index at which to break this node so the left part reaches the
    /// fill threshold without starving either side below MIN_KEYS.
    fn split_index(&self, threshold: usize) -> usize {
        let inodes = self.inodes.borrow();
        let mut size = PAGE_HEADER_SIZE;
        let mut index = 0;
        for (i, ino) in inodes.iter().enumerate().take(inodes.len() - MIN_KEYS_PER_PAGE) {
            index = i;
            let elsize = LEAF_ELEMENT_SIZE + ino.key.len() + ino.value.len();
            if i >= MIN_KEYS_PER_PAGE && size + elsize > threshold {
                break;
            }
            size += elsize;
        }
        index
    }

    /// Break off a sibling holding this node's tail, creating a new
    /// parent above the root if necessary. Returns `None` when the node
    /// fits as is.
    fn split_two(
        self: &Rc<Node>,
        page_size: usize,
        fill_percent: f64,
    ) -> Option<Rc<Node>> {
        if self.inodes.borrow().len() <= MIN_KEYS_PER_PAGE * 2 || self.size_less_than(page_size) {
            return None;
        }
        let fill = fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill) as usize;
        let split_index = self.split_index(threshold);

        let parent = self.parent.borrow().upgrade();
        let parent = match parent {
            Some(p) => p,
            None => {
                let p = Rc::new(Node::new(false));
                p.children.borrow_mut().push(self.clone());
                *self.parent.borrow_mut() = Rc::downgrade(&p);
                p
            }
        };

        let next = Rc::new(Node::new(self.is_leaf.get()));
        *next.parent.borrow_mut() = Rc::downgrade(&parent);
        parent.children.borrow_mut().push(next.clone());

        let moved: Vec<Inode> = self.inodes.borrow_mut().drain(split_index..).collect();
        *next.inodes.borrow_mut() = moved;
        Some(next)
    }

    /// Split into the minimum group of siblings honoring the fill
    /// threshold; the first entry is this node itself.
    fn split(self: &Rc<Node>, page_size: usize, fill_percent: f64) -> Vec<Rc<Node>> {
        let mut nodes = vec![self.clone()];
        let mut node = self.clone();
        while let Some(next) = node.split_two(page_size, fill_percent) {
            nodes.push(next.clone());
            node = next;
        }
        nodes
    }

    /// Write this node and every dirty descendant into freshly
    /// allocated pages, post-order, fixing up parent pointers.
    pub(crate) fn spill(self: &Rc<Node>, bucket: &Rc<BucketInner>) -> Result<()> {
        if self.spilled.get() {
            return Ok(());
        }
        let tx = bucket.tx()?;
        let page_size = tx.page_size();

        // Children can gain split siblings while spilling, so iterate
        // by index over the live list.
        self.children
            .borrow_mut()
            .sort_by(|a, b| a.key.borrow().as_slice().cmp(b.key.borrow().as_slice()));
        let mut i = 0;
        loop {
            let child = {
                let children = self.children.borrow();
                match children.get(i) {
                    Some(c) => c.clone(),
                    None => break,
                }
            };
            child.spill(bucket)?;
            i += 1;
        }
        self.children.borrow_mut().clear();

        let nodes = self.split(page_size, bucket.fill_percent());
        for node in &nodes {
            // The previous version of the page goes to the pending set.
            if node.pgid.get().0 > 0 {
                tx.free(node.pgid.get())?;
                node.pgid.set(PageId(0));
            }

            let count = node.size().div_ceil(page_size);
            let pgid = tx.allocate(count)?;
            node.pgid.set(pgid);
            tx.with_dirty(pgid, |buf| node.write(buf))?;
            node.spilled.set(true);

            let parent = node.parent.borrow().upgrade();
            if let Some(parent) = parent {
                let first = node.inodes.borrow()[0].key.clone();
                let old_key = {
                    let key = node.key.borrow();
                    if key.is_empty() {
                        first.clone()
                    } else {
                        key.clone()
                    }
                };
                parent.put(&old_key, &first, Vec::new(), node.pgid.get(), 0);
                *node.key.borrow_mut() = first;
            }
        }

        // Splitting the root creates an unallocated parent above it.
        let parent = self.parent.borrow().upgrade();
        if let Some(parent) = parent {
            if parent.pgid.get().0 == 0 {
                parent.children.borrow_mut().clear();
                return parent.spill(bucket);
            }
        }
        Ok(())
    }

    /// Merge this node with a sibling when it drops below a quarter
    /// page or its minimum key count. Propagates upward.
    pub(crate) fn rebalance(self: &Rc<Node>, bucket: &Rc<BucketInner>) -> Result<()> {
        if !self.unbalanced.get() {
            return Ok(());
        }
        self.unbalanced.set(false);
        let tx = bucket.tx()?;
        let threshold = tx.page_size() / 4;

        if self.size() > threshold && self.inodes.borrow().len() > self.min_keys() {
            return Ok(());
        }

        let parent = self.parent.borrow().upgrade();
        let Some(parent) = parent else {
            // A branch root with a single child collapses into it.
            if !self.is_leaf.get() && self.inodes.borrow().len() == 1 {
                let child_pgid = self.inodes.borrow()[0].pgid;
                let child = bucket.node(child_pgid, Some(self))?;
                self.is_leaf.set(child.is_leaf.get());
                *self.inodes.borrow_mut() = child.inodes.take();
                *self.children.borrow_mut() = child.children.take();

                // Reparent the moved grandchildren.
                {
                    let inodes = self.inodes.borrow();
                    for ino in inodes.iter() {
                        if let Some(grandchild) = bucket.get_node(ino.pgid) {
                            *grandchild.parent.borrow_mut() = Rc::downgrade(self);
                        }
                    }
                }
                *child.parent.borrow_mut() = Weak::new();
                bucket.remove_node(child.pgid.get());
                child.free(&tx)?;
            }
            return Ok(());
        };

        if self.inodes.borrow().is_empty() {
            let key = self.key.borrow().clone();
            parent.del(&key);
            parent.remove_child(self);
            bucket.remove_node(self.pgid.get());
            self.free(&tx)?;
            return parent.rebalance(bucket);
        }

        debug_assert!(parent.num_children() > 1, "parent must have at least two children");

        if parent.child_index(self) == 0 {
            // This is the leftmost child: absorb the next sibling.
            let target = parent.child_at(bucket, 1)?;
            {
                let target_inodes = target.inodes.borrow();
                for ino in target_inodes.iter() {
                    if let Some(child) = bucket.get_node(ino.pgid) {
                        let old_parent = child.parent.borrow().upgrade();
                        if let Some(old_parent) = old_parent {
                            old_parent.remove_child(&child);
                        }
                        *child.parent.borrow_mut() = Rc::downgrade(self);
                        self.children.borrow_mut().push(child.clone());
                    }
                }
            }
            let mut moved = target.inodes.take();
            self.inodes.borrow_mut().append(&mut moved);
            let target_key = target.key.borrow().clone();
            parent.del(&target_key);
            parent.remove_child(&target);
            bucket.remove_node(target.pgid.get());
            target.free(&tx)?;
        } else {
            // Fold this node into the previous sibling.
            let index = parent.child_index(self);
            let target = parent.child_at(bucket, index - 1)?;
            {
                let inodes = self.inodes.borrow();
                for ino in inodes.iter() {
                    if let Some(child) = bucket.get_node(ino.pgid) {
                        let old_parent = child.parent.borrow().upgrade();
                        if let Some(old_parent) = old_parent {
                            old_parent.remove_child(&child);
                        }
                        *child.parent.borrow_mut() = Rc::downgrade(&target);
                        target.children.borrow_mut().push(child.clone());
                    }
                }
            }
            let mut moved = self.inodes.take();
            target.inodes.borrow_mut().append(&mut moved);
            let key = self.key.borrow().clone();
            parent.del(&key);
            parent.remove_child(self);
            bucket.remove_node(self.pgid.get());
            self.free(&tx)?;
        }

        parent.rebalance(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{write_page_header, PageFlags};

    fn leaf_with(entries: &[(&[u8], &[u8])]) -> Node {
        let n = Node::new(true);
        for (k, v) in entries {
            n.put(k, k, v.to_vec(), PageId(0), 0);
        }
        n
    }

    #[test]
    fn test_put_keeps_sorted_order() {
        let n = leaf_with(&[(b"foo", b"0"), (b"bar", b"1"), (b"baz", b"2")]);
        let inodes = n.inodes.borrow();
        let keys: Vec<&[u8]> = inodes.iter().map(|i| i.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"bar"[..], &b"baz"[..], &b"foo"[..]]);
    }

    #[test]
    fn test_put_replaces_existing() {
        let n = leaf_with(&[(b"foo", b"old")]);
        n.put(b"foo", b"foo", b"new".to_vec(), PageId(0), 0);
        let inodes = n.inodes.borrow();
        assert_eq!(inodes.len(), 1);
        assert_eq!(inodes[0].value, b"new");
    }

    #[test]
    fn test_del_marks_unbalanced() {
        let n = leaf_with(&[(b"foo", b"0"), (b"bar", b"1")]);
        n.del(b"missing");
        assert!(!n.unbalanced.get());
        n.del(b"foo");
        assert!(n.unbalanced.get());
        assert_eq!(n.inodes.borrow().len(), 1);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let n = leaf_with(&[(b"alpha", b"1111"), (b"beta", b"22"), (b"gamma", b"")]);
        let mut buf = vec![0u8; n.size()];
        write_page_header(&mut buf, PageId(9), PageFlags::LEAF, 0, 0);
        n.write(&mut buf);

        let m = Node::new(true);
        m.read(PageRef::new(&buf));
        assert_eq!(m.pgid.get(), PageId(9));
        assert!(m.is_leaf.get());
        let inodes = m.inodes.borrow();
        assert_eq!(inodes.len(), 3);
        assert_eq!(inodes[0].key, b"alpha");
        assert_eq!(inodes[0].value, b"1111");
        assert_eq!(inodes[2].key, b"gamma");
        assert!(inodes[2].value.is_empty());
        assert_eq!(*m.key.borrow(), b"alpha");
    }

    #[test]
    fn test_branch_write_read_roundtrip() {
        let n = Node::new(false);
        n.put(b"a", b"a", Vec::new(), PageId(5), 0);
        n.put(b"m", b"m", Vec::new(), PageId(9), 0);
        let mut buf = vec![0u8; n.size()];
        write_page_header(&mut buf, PageId(4), PageFlags::BRANCH, 0, 0);
        n.write(&mut buf);

        let p = PageRef::new(&buf);
        assert!(p.is_branch());
        assert_eq!(p.branch_elem(0), (&b"a"[..], PageId(5)));
        assert_eq!(p.branch_elem(1), (&b"m"[..], PageId(9)));
    }

    #[test]
    fn test_split_two_small_node_stays() {
        let n = Rc::new(leaf_with(&[(b"a", b"1"), (b"b", b"2")]));
        assert!(n.split_two(4096, 0.5).is_none());
    }

    #[test]
    fn test_split_creates_siblings_and_parent() {
        let n = Rc::new(Node::new(true));
        // Roughly 100 bytes per entry so a 4 KiB page splits.
        let value = vec![0u8; 90];
        for i in 0..100u32 {
            let key = format!("{:08}", i).into_bytes();
            n.put(&key, &key, value.clone(), PageId(0), 0);
        }
        let nodes = n.split(4096, 0.5);
        assert!(nodes.len() > 1, "expected a split, got {} node(s)", nodes.len());
        // A new root was created above the original node.
        let parent = n.parent.borrow().upgrade().expect("new parent");
        assert_eq!(parent.children.borrow().len(), nodes.len());
        // Every split node except possibly the last is near threshold.
        for node in &nodes {
            assert!(node.size() <= 4096);
            assert!(!node.inodes.borrow().is_empty());
        }
        // Entries are fully preserved, in order.
        let mut total = 0;
        let mut last: Vec<u8> = Vec::new();
        for node in &nodes {
            for ino in node.inodes.borrow().iter() {
                assert!(ino.key > last);
                last = ino.key.clone();
                total += 1;
            }
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn test_split_index_honors_min_keys() {
        let n = Node::new(true);
        for i in 0..10u32 {
            let key = format!("{:04}", i).into_bytes();
            n.put(&key, &key, vec![0u8; 500], PageId(0), 0);
        }
        // A tiny threshold still leaves MIN_KEYS on the left.
        let index = n.split_index(64);
        assert!(index >= MIN_KEYS_PER_PAGE);
    }
}
