//! Buckets: named B+trees within the database
//!
//! Every bucket is a subtree rooted in a page of the same file; the
//! database root is itself a bucket whose keys are top-level bucket
//! names. A bucket small enough to fit in a quarter page is stored
//! *inline*: its parent's leaf element carries the bucket header
//! followed by a complete single-leaf page image.

use crate::cursor::{Cursor, InnerCursor};
use crate::error::{Error, PageId, Result};
use crate::meta::{BucketHeader, BUCKET_HEADER_SIZE};
use crate::node::{Node, MAX_FILL_PERCENT, MIN_FILL_PERCENT};
use crate::page::{
    self, PageData, PageFlags, PageRef, BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, LEAF_FLAG_BUCKET,
    PAGE_HEADER_SIZE,
};
use crate::tx::TxInner;
use crate::{DEFAULT_FILL_PERCENT, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

/// Resolution of a page id inside a bucket: the writer's materialized
/// node when one exists, otherwise the page bytes.
#[derive(Clone)]
pub(crate) enum PageNodeRef {
    Page(PageData),
    Node(Rc<Node>),
}

/// Shared bucket state, reference-counted within one transaction
pub(crate) struct BucketInner {
    pub(crate) tx: Weak<TxInner>,
    pub(crate) header: Cell<BucketHeader>,
    /// Materialized child buckets by name
    pub(crate) buckets: RefCell<HashMap<Vec<u8>, Rc<BucketInner>>>,
    /// Materialized nodes by page id
    pub(crate) nodes: RefCell<HashMap<PageId, Rc<Node>>>,
    pub(crate) root_node: RefCell<Option<Rc<Node>>>,
    /// Inline page image when the bucket root is zero
    pub(crate) page: RefCell<Option<Rc<[u8]>>>,
    fill: Cell<f64>,
}

impl BucketInner {
    pub(crate) fn new(tx: Weak<TxInner>, header: BucketHeader) -> Rc<Self> {
        Rc::new(Self {
            tx,
            header: Cell::new(header),
            buckets: RefCell::new(HashMap::new()),
            nodes: RefCell::new(HashMap::new()),
            root_node: RefCell::new(None),
            page: RefCell::new(None),
            fill: Cell::new(DEFAULT_FILL_PERCENT),
        })
    }

    /// The owning transaction, if it is still open.
    pub(crate) fn tx(&self) -> Result<Rc<TxInner>> {
        match self.tx.upgrade() {
            Some(tx) if tx.is_open() => Ok(tx),
            _ => Err(Error::TxClosed),
        }
    }

    fn require_writable(&self) -> Result<Rc<TxInner>> {
        let tx = self.tx()?;
        if !tx.writable {
            return Err(Error::TxNotWritable);
        }
        Ok(tx)
    }

    pub(crate) fn fill_percent(&self) -> f64 {
        self.fill.get()
    }

    pub(crate) fn set_fill_percent(&self, fill: f64) {
        self.fill.set(fill.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT));
    }

    pub(crate) fn get_node(&self, pgid: PageId) -> Option<Rc<Node>> {
        self.nodes.borrow().get(&pgid).cloned()
    }

    pub(crate) fn remove_node(&self, pgid: PageId) {
        self.nodes.borrow_mut().remove(&pgid);
    }

    /// Resolve a page id to the writer's node or the backing page.
    pub(crate) fn page_node(&self, pgid: PageId) -> Result<PageNodeRef> {
        if self.header.get().root.0 == 0 {
            // Inline buckets only ever address their single page zero.
            if pgid.0 != 0 {
                return Err(Error::corruption(
                    format!("inline bucket addressed out-of-band page {}", pgid),
                    Some(pgid),
                ));
            }
            let root_node = self.root_node.borrow().clone();
            if let Some(n) = root_node {
                return Ok(PageNodeRef::Node(n));
            }
            let image = self.page.borrow().clone();
            match image {
                Some(image) => Ok(PageNodeRef::Page(PageData::Owned(image))),
                None => Err(Error::corruption("inline bucket missing page image", None)),
            }
        } else {
            let cached = self.nodes.borrow().get(&pgid).cloned();
            if let Some(n) = cached {
                return Ok(PageNodeRef::Node(n));
            }
            let tx = self.tx()?;
            Ok(PageNodeRef::Page(tx.page_data(pgid)))
        }
    }

    /// Materialize the node for `pgid`, registering it with its parent
    /// and the per-bucket cache.
    pub(crate) fn node(
        self: &Rc<Self>,
        pgid: PageId,
        parent: Option<&Rc<Node>>,
    ) -> Result<Rc<Node>> {
        let cached = self.nodes.borrow().get(&pgid).cloned();
        if let Some(n) = cached {
            return Ok(n);
        }

        let n = Rc::new(Node::new(true));
        match parent {
            Some(p) => {
                *n.parent.borrow_mut() = Rc::downgrade(p);
                p.children.borrow_mut().push(n.clone());
            }
            None => {
                *self.root_node.borrow_mut() = Some(n.clone());
            }
        }

        if self.header.get().root.0 == 0 {
            debug_assert!(pgid.0 == 0, "inline bucket node for page {}", pgid);
            let image = self.page.borrow().clone();
            match image {
                Some(image) => n.read(PageRef::new(&image)),
                None => return Err(Error::corruption("inline bucket missing page image", None)),
            }
        } else {
            let tx = self.tx()?;
            let data = tx.page_data(pgid);
            n.read(data.page());
        }

        self.nodes.borrow_mut().insert(pgid, n.clone());
        Ok(n)
    }

    fn inner_cursor(self: &Rc<Self>) -> InnerCursor {
        InnerCursor::new(self.clone())
    }

    pub(crate) fn put(self: &Rc<Self>, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        let mut c = self.inner_cursor();
        c.seek_to(key)?;
        let found = c.kv().map(|(k, _, flags)| (k.into_owned(), flags));
        if let Some((k, flags)) = found {
            if k == key && flags & LEAF_FLAG_BUCKET != 0 {
                return Err(Error::IncompatibleValue);
            }
        }
        c.node()?.put(key, key, value.to_vec(), PageId(0), 0);
        Ok(())
    }

    pub(crate) fn delete(self: &Rc<Self>, key: &[u8]) -> Result<()> {
        self.require_writable()?;
        let mut c = self.inner_cursor();
        c.seek_to(key)?;
        let found = c.kv().map(|(k, _, flags)| (k.into_owned(), flags));
        match found {
            Some((k, flags)) if k == key => {
                if flags & LEAF_FLAG_BUCKET != 0 {
                    return Err(Error::IncompatibleValue);
                }
                c.node()?.del(key);
                Ok(())
            }
            // Deleting an absent key is a no-op.
            _ => Ok(()),
        }
    }

    /// Materialize the child bucket under `name`, if one exists.
    pub(crate) fn child_bucket(self: &Rc<Self>, name: &[u8]) -> Result<Option<Rc<BucketInner>>> {
        let cached = self.buckets.borrow().get(name).cloned();
        if let Some(b) = cached {
            return Ok(Some(b));
        }
        let mut c = self.inner_cursor();
        c.seek_to(name)?;
        let found = c.kv().map(|(k, v, flags)| (k.into_owned(), v.into_owned(), flags));
        match found {
            Some((k, v, flags)) if k == name && flags & LEAF_FLAG_BUCKET != 0 => {
                let child = self.open_bucket(&v)?;
                self.buckets.borrow_mut().insert(name.to_vec(), child.clone());
                Ok(Some(child))
            }
            _ => Ok(None),
        }
    }

    /// Decode a bucket-flagged element value into a child bucket.
    fn open_bucket(&self, value: &[u8]) -> Result<Rc<BucketInner>> {
        if value.len() < BUCKET_HEADER_SIZE {
            return Err(Error::corruption("short bucket header value", None));
        }
        let header = BucketHeader::read(value);
        let child = BucketInner::new(self.tx.clone(), header);
        child.fill.set(self.fill.get());
        if header.root.0 == 0 {
            if value.len() < BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE {
                return Err(Error::corruption("inline bucket value missing page image", None));
            }
            // Copied so the image stays stable across parent node edits.
            let image: Rc<[u8]> = Rc::from(&value[BUCKET_HEADER_SIZE..]);
            *child.page.borrow_mut() = Some(image);
        }
        Ok(child)
    }

    pub(crate) fn create_bucket(self: &Rc<Self>, name: &[u8]) -> Result<Rc<BucketInner>> {
        self.require_writable()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        let mut c = self.inner_cursor();
        c.seek_to(name)?;
        let found = c.kv().map(|(k, _, flags)| (k.into_owned(), flags));
        if let Some((k, flags)) = found {
            if k == name {
                if flags & LEAF_FLAG_BUCKET != 0 {
                    return Err(Error::BucketExists);
                }
                return Err(Error::IncompatibleValue);
            }
        }

        // New buckets start inline: header plus a bare leaf page image.
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE];
        BucketHeader::default().write(&mut value);
        page::write_page_header(
            &mut value[BUCKET_HEADER_SIZE..],
            PageId(0),
            PageFlags::LEAF,
            0,
            0,
        );
        c.node()?.put(name, name, value, PageId(0), LEAF_FLAG_BUCKET);

        // The stale inline image of this bucket, if any, no longer
        // reflects its contents.
        *self.page.borrow_mut() = None;

        self.child_bucket(name)?
            .ok_or_else(|| Error::corruption("created bucket not found", None))
    }

    pub(crate) fn create_bucket_if_not_exists(
        self: &Rc<Self>,
        name: &[u8],
    ) -> Result<Rc<BucketInner>> {
        match self.create_bucket(name) {
            Err(Error::BucketExists) => self
                .child_bucket(name)?
                .ok_or_else(|| Error::corruption("existing bucket not found", None)),
            other => other,
        }
    }

    pub(crate) fn delete_bucket(self: &Rc<Self>, name: &[u8]) -> Result<()> {
        self.require_writable()?;
        let mut c = self.inner_cursor();
        c.seek_to(name)?;
        let found = c.kv().map(|(k, _, flags)| (k.into_owned(), flags));
        match found {
            Some((k, flags)) if k == name => {
                if flags & LEAF_FLAG_BUCKET == 0 {
                    return Err(Error::IncompatibleValue);
                }
            }
            _ => return Err(Error::BucketNotFound),
        }

        let child = self.child_bucket(name)?.ok_or(Error::BucketNotFound)?;

        // Depth-first: empty out nested buckets before freeing pages.
        let mut nested = Vec::new();
        child.for_each_elem(|k, _, flags| {
            if flags & LEAF_FLAG_BUCKET != 0 {
                nested.push(k.to_vec());
            }
            Ok(())
        })?;
        for sub in nested {
            child.delete_bucket(&sub)?;
        }

        self.buckets.borrow_mut().remove(name);
        child.nodes.borrow_mut().clear();
        *child.root_node.borrow_mut() = None;
        child.free_all()?;

        c.node()?.del(name);
        Ok(())
    }

    /// Return every page reachable from this bucket's root to the
    /// freelist. Inline buckets own no pages.
    pub(crate) fn free_all(&self) -> Result<()> {
        let root = self.header.get().root;
        if root.0 == 0 {
            return Ok(());
        }
        let tx = self.tx()?;
        self.for_each_page_node(root, 0, &mut |pn, _| match pn {
            PageNodeRef::Page(data) => tx.free(data.page().id()),
            PageNodeRef::Node(n) => n.free(&tx),
        })?;
        let mut header = self.header.get();
        header.root = PageId(0);
        self.header.set(header);
        Ok(())
    }

    fn for_each_page_node<F>(&self, pgid: PageId, depth: usize, f: &mut F) -> Result<()>
    where
        F: FnMut(&PageNodeRef, usize) -> Result<()>,
    {
        let pn = self.page_node(pgid)?;
        f(&pn, depth)?;
        let children: Vec<PageId> = match &pn {
            PageNodeRef::Page(data) => {
                let p = data.page();
                if p.is_branch() {
                    (0..p.count()).map(|i| p.branch_elem(i).1).collect()
                } else {
                    Vec::new()
                }
            }
            PageNodeRef::Node(n) => {
                if n.is_leaf.get() {
                    Vec::new()
                } else {
                    n.inodes.borrow().iter().map(|ino| ino.pgid).collect()
                }
            }
        };
        for child in children {
            self.for_each_page_node(child, depth + 1, f)?;
        }
        Ok(())
    }

    /// Visit every element of this bucket in key order. The callback
    /// must not modify the bucket.
    pub(crate) fn for_each_elem<F>(self: &Rc<Self>, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8], u32) -> Result<()>,
    {
        let mut c = self.inner_cursor();
        let mut positioned = c.first()?;
        while positioned {
            if let Some((k, v, flags)) = c.kv() {
                f(&k, &v, flags)?;
            }
            positioned = c.next()?;
        }
        Ok(())
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.header.get().sequence
    }

    pub(crate) fn set_sequence(self: &Rc<Self>, value: u64) -> Result<()> {
        self.require_writable()?;
        self.materialize_root()?;
        let mut header = self.header.get();
        header.sequence = value;
        self.header.set(header);
        Ok(())
    }

    pub(crate) fn next_sequence(self: &Rc<Self>) -> Result<u64> {
        self.require_writable()?;
        self.materialize_root()?;
        let mut header = self.header.get();
        header.sequence += 1;
        self.header.set(header);
        Ok(header.sequence)
    }

    /// Dirty the root node so a sequence-only change still spills.
    fn materialize_root(self: &Rc<Self>) -> Result<()> {
        if self.root_node.borrow().is_none() {
            self.node(self.header.get().root, None)?;
        }
        Ok(())
    }

    /// True when the whole bucket fits inline in its parent: a single
    /// leaf, no sub-buckets, within a quarter page.
    fn inlineable(&self) -> bool {
        let root_node = self.root_node.borrow().clone();
        let Some(n) = root_node else { return false };
        if !n.is_leaf.get() {
            return false;
        }
        let Ok(tx) = self.tx() else { return false };
        let max = tx.page_size() / 4;
        let mut size = PAGE_HEADER_SIZE;
        for ino in n.inodes.borrow().iter() {
            size += LEAF_ELEMENT_SIZE + ino.key.len() + ino.value.len();
            if ino.flags & LEAF_FLAG_BUCKET != 0 {
                return false;
            }
            if size > max {
                return false;
            }
        }
        true
    }

    /// Serialize as `bucket header || leaf page image`.
    fn write_inline(&self) -> Result<Vec<u8>> {
        let root_node = self.root_node.borrow().clone();
        let Some(n) = root_node else {
            return Err(Error::corruption("inline serialization without a root node", None));
        };
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + n.size()];
        self.header.get().write(&mut value);
        n.write(&mut value[BUCKET_HEADER_SIZE..]);
        Ok(value)
    }

    /// Re-serialize child bucket headers, then write this bucket's
    /// dirty nodes into freshly allocated pages.
    pub(crate) fn spill(self: &Rc<Self>) -> Result<()> {
        let tx = self.tx()?;

        let mut names: Vec<Vec<u8>> = self.buckets.borrow().keys().cloned().collect();
        names.sort();
        for name in names {
            let child = {
                let buckets = self.buckets.borrow();
                match buckets.get(&name) {
                    Some(c) => c.clone(),
                    None => continue,
                }
            };

            let value = if child.inlineable() {
                child.free_all()?;
                child.write_inline()?
            } else {
                child.spill()?;
                child.header.get().to_bytes()
            };

            // A child with no materialized nodes was never modified.
            if child.root_node.borrow().is_none() {
                continue;
            }

            let mut c = self.inner_cursor();
            c.seek_to(&name)?;
            let found = c.kv().map(|(k, _, flags)| (k.into_owned(), flags));
            match found {
                Some((k, flags)) if k == name && flags & LEAF_FLAG_BUCKET != 0 => {}
                _ => {
                    return Err(Error::corruption(
                        format!("misplaced bucket header for {:?}", name),
                        None,
                    ))
                }
            }
            c.node()?.put(&name, &name, value, PageId(0), LEAF_FLAG_BUCKET);
        }

        let root_node = self.root_node.borrow().clone();
        let Some(root_node) = root_node else { return Ok(()) };
        root_node.spill(self)?;
        let new_root = root_node.root();
        *self.root_node.borrow_mut() = Some(new_root.clone());

        let pgid = new_root.pgid.get();
        if pgid.0 >= tx.high_water().0 {
            return Err(Error::corruption(
                format!("bucket root {} above high water {}", pgid, tx.high_water()),
                Some(pgid),
            ));
        }
        let mut header = self.header.get();
        header.root = pgid;
        self.header.set(header);
        Ok(())
    }

    /// Merge underfull nodes across this bucket and its children.
    pub(crate) fn rebalance(self: &Rc<Self>) -> Result<()> {
        let nodes: Vec<Rc<Node>> = self.nodes.borrow().values().cloned().collect();
        for n in nodes {
            n.rebalance(self)?;
        }
        let children: Vec<Rc<BucketInner>> = self.buckets.borrow().values().cloned().collect();
        for child in children {
            child.rebalance()?;
        }
        Ok(())
    }

    /// Read-only walk computing page and byte statistics.
    pub(crate) fn stats(self: &Rc<Self>) -> BucketStats {
        let mut s = BucketStats { bucket_n: 1, ..BucketStats::default() };
        let Ok(tx) = self.tx() else { return s };
        let page_size = tx.page_size();
        let root = self.header.get().root;

        let mut sub = BucketStats::default();
        let inline = root.0 == 0;
        if inline {
            s.inline_bucket_n += 1;
            let image = self.page.borrow().clone();
            if let Some(image) = image {
                let p = PageRef::new(&image);
                self.stats_page(&p, 0, inline, &mut s, &mut sub);
            }
        } else {
            let _ = tx.for_each_page(root, 0, &mut |p, depth| {
                self.stats_page(p, depth, inline, &mut s, &mut sub);
                Ok(())
            });
        }

        s.branch_alloc = (s.branch_page_n + s.branch_overflow_n) * page_size;
        s.leaf_alloc = (s.leaf_page_n + s.leaf_overflow_n) * page_size;
        s.add(&sub);
        s
    }

    fn stats_page(
        self: &Rc<Self>,
        p: &PageRef<'_>,
        depth: usize,
        inline: bool,
        s: &mut BucketStats,
        sub: &mut BucketStats,
    ) {
        if p.is_leaf() {
            let count = p.count();
            let mut used = PAGE_HEADER_SIZE;
            if count > 0 {
                let (pos, ksize, vsize) = p.leaf_elem_meta(count - 1);
                used += LEAF_ELEMENT_SIZE * (count - 1) + pos + ksize + vsize;
            }
            if inline {
                s.inline_bucket_inuse += used;
            } else {
                s.leaf_page_n += 1;
                s.leaf_inuse += used;
                s.leaf_overflow_n += p.overflow() as usize;
            }
            for i in 0..count {
                let (flags, _, value) = p.leaf_elem(i);
                if flags & LEAF_FLAG_BUCKET != 0 {
                    if let Ok(child) = self.open_bucket(value) {
                        sub.add(&child.stats());
                    }
                } else {
                    s.key_n += 1;
                }
            }
        } else if p.is_branch() {
            let count = p.count();
            s.branch_page_n += 1;
            let mut used = PAGE_HEADER_SIZE;
            if count > 0 {
                let (pos, ksize) = p.branch_elem_meta(count - 1);
                used += BRANCH_ELEMENT_SIZE * (count - 1) + pos + ksize;
            }
            s.branch_inuse += used;
            s.branch_overflow_n += p.overflow() as usize;
        }
        if depth + 1 > s.depth {
            s.depth = depth + 1;
        }
    }
}

/// Page and byte statistics for one bucket and its descendants
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    /// Number of branch pages
    pub branch_page_n: usize,
    /// Number of branch overflow pages
    pub branch_overflow_n: usize,
    /// Number of leaf pages
    pub leaf_page_n: usize,
    /// Number of leaf overflow pages
    pub leaf_overflow_n: usize,
    /// Number of key/value pairs, sub-buckets excluded
    pub key_n: usize,
    /// Depth of the deepest tree, inline buckets counting as one
    pub depth: usize,
    /// Bytes allocated for branch pages
    pub branch_alloc: usize,
    /// Bytes in use in branch pages (headers, elements, keys)
    pub branch_inuse: usize,
    /// Bytes allocated for leaf pages
    pub leaf_alloc: usize,
    /// Bytes in use in leaf pages (headers, elements, keys, values)
    pub leaf_inuse: usize,
    /// Number of buckets, this one included
    pub bucket_n: usize,
    /// Number of inline buckets
    pub inline_bucket_n: usize,
    /// Bytes in use by inline bucket page images
    pub inline_bucket_inuse: usize,
}

impl BucketStats {
    /// Accumulate `other` into this record. Depth takes the maximum.
    pub fn add(&mut self, other: &BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        self.depth = self.depth.max(other.depth);
        self.branch_alloc += other.branch_alloc;
        self.branch_inuse += other.branch_inuse;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_inuse += other.leaf_inuse;
        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_inuse += other.inline_bucket_inuse;
    }
}

/// A handle to one bucket within a transaction.
///
/// Handles borrow their transaction: they cannot outlive it, and the
/// transaction cannot commit while a handle is alive.
pub struct Bucket<'tx> {
    pub(crate) inner: Rc<BucketInner>,
    pub(crate) _marker: PhantomData<&'tx ()>,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn wrap(inner: Rc<BucketInner>) -> Self {
        Self { inner, _marker: PhantomData }
    }

    /// Look up `key`. Returns `None` for absent keys and for keys that
    /// hold sub-buckets. The bytes are valid for the transaction.
    pub fn get<'a>(&'a self, key: &[u8]) -> Result<Option<Cow<'a, [u8]>>> {
        self.inner.tx()?;
        let mut c = self.inner.inner_cursor();
        c.seek_to(key)?;
        // Safety: this handle cannot outlive its transaction, which
        // pins the mapping the borrowed bytes come from.
        let kv: Option<(Cow<'a, [u8]>, Cow<'a, [u8]>, u32)> = unsafe { c.kv_detached() };
        match kv {
            Some((k, v, flags)) if k.as_ref() == key => {
                if flags & LEAF_FLAG_BUCKET != 0 {
                    Ok(None)
                } else {
                    Ok(Some(v))
                }
            }
            _ => Ok(None),
        }
    }

    /// Insert or overwrite a key. Zero-length values are legal; keys
    /// must be non-empty and within the size limits.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    /// Remove a key. Removing an absent key is a no-op; removing a
    /// bucket requires [`Bucket::delete_bucket`].
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    /// Open the child bucket under `name`.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.inner.tx()?;
        match self.inner.child_bucket(name)? {
            Some(inner) => Ok(Bucket::wrap(inner)),
            None => Err(Error::BucketNotFound),
        }
    }

    /// Create a child bucket under `name`.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        Ok(Bucket::wrap(self.inner.create_bucket(name)?))
    }

    /// Create a child bucket under `name`, or open the existing one.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        Ok(Bucket::wrap(self.inner.create_bucket_if_not_exists(name)?))
    }

    /// Recursively delete the child bucket under `name`.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.inner.delete_bucket(name)
    }

    /// The bucket's persisted sequence counter.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence()
    }

    /// Set the sequence counter.
    pub fn set_sequence(&self, value: u64) -> Result<()> {
        self.inner.set_sequence(value)
    }

    /// Increment and return the sequence counter.
    pub fn next_sequence(&self) -> Result<u64> {
        self.inner.next_sequence()
    }

    /// Visit every element in key order. Sub-bucket elements yield a
    /// `None` value. The callback must not modify the bucket; any
    /// error it returns stops the walk and propagates verbatim.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        self.inner.tx()?;
        self.inner.for_each_elem(|k, v, flags| {
            if flags & LEAF_FLAG_BUCKET != 0 {
                f(k, None)
            } else {
                f(k, Some(v))
            }
        })
    }

    /// Visit every sub-bucket name in key order.
    pub fn for_each_bucket<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.inner.tx()?;
        self.inner.for_each_elem(|k, _, flags| {
            if flags & LEAF_FLAG_BUCKET != 0 {
                f(k)
            } else {
                Ok(())
            }
        })
    }

    /// Position a new cursor over this bucket.
    pub fn cursor(&self) -> Cursor<'_, 'tx> {
        Cursor::new(self.inner.clone())
    }

    /// Compute page statistics for this bucket and its descendants.
    pub fn stats(&self) -> BucketStats {
        self.inner.stats()
    }

    /// Set the split threshold for this bucket's pages, clamped to
    /// [0.1, 1.0]. Useful for append-mostly workloads.
    pub fn set_fill_percent(&self, fill: f64) {
        self.inner.set_fill_percent(fill);
    }

    /// Whether the owning transaction can mutate this bucket.
    pub fn writable(&self) -> bool {
        self.inner.tx().map(|tx| tx.writable).unwrap_or(false)
    }
}
