//! Stackful cursors over a bucket
//!
//! A cursor records one `(page-or-node, index)` frame per tree level.
//! Frames resolve against the writer's node cache first so uncommitted
//! mutations are visible to the transaction that made them, and against
//! the mapped pages otherwise.

use crate::bucket::{BucketInner, PageNodeRef};
use crate::error::{Error, PageId, Result};
use crate::node::Node;
use crate::page::{PageData, LEAF_FLAG_BUCKET};
use std::borrow::Cow;
use std::marker::PhantomData;
use std::rc::Rc;

/// One level of the descent: where we are and which element is current.
struct ElemRef {
    source: PageNodeRef,
    index: usize,
}

impl ElemRef {
    fn count(&self) -> usize {
        match &self.source {
            PageNodeRef::Node(n) => n.inodes.borrow().len(),
            PageNodeRef::Page(data) => data.page().count(),
        }
    }

    fn is_leaf(&self) -> bool {
        match &self.source {
            PageNodeRef::Node(n) => n.is_leaf.get(),
            PageNodeRef::Page(data) => data.page().is_leaf(),
        }
    }

    /// Child page id under the current element of a branch frame.
    fn child_pgid(&self) -> PageId {
        match &self.source {
            PageNodeRef::Node(n) => n.inodes.borrow()[self.index].pgid,
            PageNodeRef::Page(data) => data.page().branch_elem(self.index).1,
        }
    }
}

/// Cursor internals shared by the public cursor and bucket operations
pub(crate) struct InnerCursor {
    bucket: Rc<BucketInner>,
    stack: Vec<ElemRef>,
}

impl InnerCursor {
    pub(crate) fn new(bucket: Rc<BucketInner>) -> Self {
        Self { bucket, stack: Vec::new() }
    }

    fn push(&mut self, pgid: PageId, index: usize) -> Result<()> {
        let source = self.bucket.page_node(pgid)?;
        self.stack.push(ElemRef { source, index });
        Ok(())
    }

    fn top_count(&self) -> usize {
        self.stack.last().map(ElemRef::count).unwrap_or(0)
    }

    /// Whether the top frame points at a real element.
    pub(crate) fn on_element(&self) -> bool {
        match self.stack.last() {
            Some(top) => top.index < top.count(),
            None => false,
        }
    }

    /// Position at the leftmost element of the tree. Returns false for
    /// an empty bucket.
    pub(crate) fn first(&mut self) -> Result<bool> {
        self.stack.clear();
        self.push(self.bucket.header.get().root, 0)?;
        self.descend_first()?;
        if self.top_count() == 0 {
            // An empty leaf under the root; move on to a populated one.
            return self.next();
        }
        Ok(true)
    }

    /// Position at the rightmost element of the tree.
    pub(crate) fn last(&mut self) -> Result<bool> {
        self.stack.clear();
        self.push(self.bucket.header.get().root, 0)?;
        if let Some(top) = self.stack.last_mut() {
            top.index = top.count().saturating_sub(1);
        }
        self.descend_last()?;
        if self.top_count() == 0 {
            return self.prev();
        }
        Ok(true)
    }

    /// Descend to the first element of the subtree under the top frame.
    fn descend_first(&mut self) -> Result<()> {
        loop {
            let child = {
                let top = self.stack.last().expect("descend on empty stack");
                if top.is_leaf() {
                    return Ok(());
                }
                top.child_pgid()
            };
            self.push(child, 0)?;
        }
    }

    /// Descend to the last element of the subtree under the top frame.
    fn descend_last(&mut self) -> Result<()> {
        loop {
            let child = {
                let top = self.stack.last().expect("descend on empty stack");
                if top.is_leaf() {
                    return Ok(());
                }
                top.child_pgid()
            };
            self.push(child, 0)?;
            if let Some(top) = self.stack.last_mut() {
                top.index = top.count().saturating_sub(1);
            }
        }
    }

    /// Advance to the next element. Returns false when exhausted.
    pub(crate) fn next(&mut self) -> Result<bool> {
        loop {
            let mut level = None;
            for depth in (0..self.stack.len()).rev() {
                let elem = &self.stack[depth];
                if elem.index + 1 < elem.count() {
                    level = Some(depth);
                    break;
                }
            }
            let Some(depth) = level else { return Ok(false) };
            self.stack[depth].index += 1;
            self.stack.truncate(depth + 1);
            self.descend_first()?;
            // Retry across empty leaves left by an empty root.
            if self.top_count() == 0 {
                continue;
            }
            return Ok(true);
        }
    }

    /// Step back to the previous element. Returns false at the front.
    pub(crate) fn prev(&mut self) -> Result<bool> {
        loop {
            let mut level = None;
            for depth in (0..self.stack.len()).rev() {
                if self.stack[depth].index > 0 {
                    level = Some(depth);
                    break;
                }
            }
            let Some(depth) = level else { return Ok(false) };
            self.stack[depth].index -= 1;
            self.stack.truncate(depth + 1);
            self.descend_last()?;
            if self.top_count() == 0 {
                continue;
            }
            return Ok(true);
        }
    }

    /// Descend to the leaf position for `key`: the first element whose
    /// key is greater or equal, possibly one past the end of a leaf.
    pub(crate) fn seek_to(&mut self, key: &[u8]) -> Result<()> {
        self.stack.clear();
        self.search(key, self.bucket.header.get().root)
    }

    fn search(&mut self, key: &[u8], pgid: PageId) -> Result<()> {
        self.push(pgid, 0)?;
        let is_leaf = self.stack.last().map(ElemRef::is_leaf).unwrap_or(true);
        if is_leaf {
            self.search_leaf(key);
            return Ok(());
        }

        // Follow the last child whose separator is not greater than
        // the target.
        let (index, child) = {
            let top = self.stack.last().expect("frame just pushed");
            let mut index = match &top.source {
                PageNodeRef::Node(n) => {
                    n.inodes.borrow().partition_point(|ino| ino.key.as_slice() <= key)
                }
                PageNodeRef::Page(data) => {
                    let p = data.page();
                    let mut lo = 0;
                    let mut hi = p.count();
                    while lo < hi {
                        let mid = lo + (hi - lo) / 2;
                        if p.branch_elem(mid).0 <= key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    lo
                }
            };
            if index > 0 {
                index -= 1;
            }
            let child = match &top.source {
                PageNodeRef::Node(n) => n.inodes.borrow()[index].pgid,
                PageNodeRef::Page(data) => data.page().branch_elem(index).1,
            };
            (index, child)
        };
        self.stack.last_mut().expect("frame just pushed").index = index;
        self.search(key, child)
    }

    fn search_leaf(&mut self, key: &[u8]) {
        let top = self.stack.last_mut().expect("search on empty stack");
        top.index = match &top.source {
            PageNodeRef::Node(n) => {
                n.inodes.borrow().partition_point(|ino| ino.key.as_slice() < key)
            }
            PageNodeRef::Page(data) => {
                let p = data.page();
                let mut lo = 0;
                let mut hi = p.count();
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if p.leaf_elem(mid).1 < key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                lo
            }
        };
    }

    /// The element under the cursor, or `None` past either end.
    pub(crate) fn kv(&self) -> Option<(Cow<'_, [u8]>, Cow<'_, [u8]>, u32)> {
        let top = self.stack.last()?;
        if top.count() == 0 || top.index >= top.count() {
            return None;
        }
        match &top.source {
            PageNodeRef::Node(n) => {
                let inodes = n.inodes.borrow();
                let ino = &inodes[top.index];
                Some((Cow::Owned(ino.key.clone()), Cow::Owned(ino.value.clone()), ino.flags))
            }
            PageNodeRef::Page(data) => {
                let p = data.page();
                let (flags, k, v) = p.leaf_elem(top.index);
                Some((Cow::Borrowed(k), Cow::Borrowed(v), flags))
            }
        }
    }

    /// Like [`InnerCursor::kv`], but mapped bytes borrow for a caller
    /// chosen lifetime.
    ///
    /// # Safety
    /// `'a` must not outlive the transaction pinning the mapping; node
    /// and inline bytes are copied, so only mapped slices are at stake.
    pub(crate) unsafe fn kv_detached<'a>(&self) -> Option<(Cow<'a, [u8]>, Cow<'a, [u8]>, u32)> {
        let top = self.stack.last()?;
        if top.count() == 0 || top.index >= top.count() {
            return None;
        }
        match &top.source {
            PageNodeRef::Node(n) => {
                let inodes = n.inodes.borrow();
                let ino = &inodes[top.index];
                Some((Cow::Owned(ino.key.clone()), Cow::Owned(ino.value.clone()), ino.flags))
            }
            PageNodeRef::Page(data) => {
                let p = data.page();
                let (flags, k, v) = p.leaf_elem(top.index);
                match data {
                    PageData::Mapped { .. } => {
                        // Safety: per the contract, the mapping outlives 'a.
                        let k: &'a [u8] =
                            unsafe { std::slice::from_raw_parts(k.as_ptr(), k.len()) };
                        let v: &'a [u8] =
                            unsafe { std::slice::from_raw_parts(v.as_ptr(), v.len()) };
                        Some((Cow::Borrowed(k), Cow::Borrowed(v), flags))
                    }
                    PageData::Owned(_) => {
                        Some((Cow::Owned(k.to_vec()), Cow::Owned(v.to_vec()), flags))
                    }
                }
            }
        }
    }

    /// Materialize the node chain for the current stack and return the
    /// leaf node, creating parents top-down as needed.
    pub(crate) fn node(&mut self) -> Result<Rc<Node>> {
        debug_assert!(!self.stack.is_empty(), "cursor not positioned");

        {
            let top = self.stack.last().expect("cursor not positioned");
            if let PageNodeRef::Node(n) = &top.source {
                if n.is_leaf.get() {
                    return Ok(n.clone());
                }
            }
        }

        let mut node = match &self.stack[0].source {
            PageNodeRef::Node(n) => n.clone(),
            PageNodeRef::Page(data) => {
                let id = data.page().id();
                self.bucket.node(id, None)?
            }
        };
        for depth in 0..self.stack.len() - 1 {
            debug_assert!(!node.is_leaf.get(), "expected a branch node in the chain");
            let index = self.stack[depth].index;
            node = node.child_at(&self.bucket, index)?;
        }
        debug_assert!(node.is_leaf.get(), "cursor chain must end at a leaf");
        Ok(node)
    }

    /// Remove the element under the cursor from its node.
    pub(crate) fn delete_current(&mut self) -> Result<()> {
        let found = self.kv().map(|(k, _, flags)| (k.into_owned(), flags));
        let Some((key, flags)) = found else { return Ok(()) };
        if flags & LEAF_FLAG_BUCKET != 0 {
            return Err(Error::IncompatibleValue);
        }
        self.node()?.del(&key);
        Ok(())
    }
}

/// A positional iterator over one bucket, in key order.
///
/// Returned keys and values borrow the transaction's snapshot; values
/// are `None` for sub-bucket elements.
pub struct Cursor<'b, 'tx> {
    inner: InnerCursor,
    _marker: PhantomData<&'b crate::bucket::Bucket<'tx>>,
}

impl<'b, 'tx> Cursor<'b, 'tx> {
    pub(crate) fn new(bucket: Rc<BucketInner>) -> Self {
        Self { inner: InnerCursor::new(bucket), _marker: PhantomData }
    }

    fn pair(&self) -> Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)> {
        // Safety: the cursor cannot outlive the bucket handle, which
        // cannot outlive the transaction pinning the mapping.
        let kv: Option<(Cow<'_, [u8]>, Cow<'_, [u8]>, u32)> = unsafe { self.inner.kv_detached() };
        let (k, v, flags) = kv?;
        if flags & LEAF_FLAG_BUCKET != 0 {
            Some((k, None))
        } else {
            Some((k, Some(v)))
        }
    }

    /// Move to the first element.
    #[allow(clippy::type_complexity)]
    pub fn first(&mut self) -> Result<Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)>> {
        if self.inner.first()? {
            Ok(self.pair())
        } else {
            Ok(None)
        }
    }

    /// Move to the last element.
    #[allow(clippy::type_complexity)]
    pub fn last(&mut self) -> Result<Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)>> {
        if self.inner.last()? {
            Ok(self.pair())
        } else {
            Ok(None)
        }
    }

    /// Move to the first element with key greater or equal to `key`.
    #[allow(clippy::type_complexity)]
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)>> {
        self.inner.seek_to(key)?;
        if !self.inner.on_element() && !self.inner.next()? {
            return Ok(None);
        }
        Ok(self.pair())
    }

    /// Advance to the next element.
    #[allow(clippy::type_complexity)]
    pub fn next(&mut self) -> Result<Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)>> {
        if self.inner.next()? {
            Ok(self.pair())
        } else {
            Ok(None)
        }
    }

    /// Step back to the previous element.
    #[allow(clippy::type_complexity)]
    pub fn prev(&mut self) -> Result<Option<(Cow<'_, [u8]>, Option<Cow<'_, [u8]>>)>> {
        if self.inner.prev()? {
            Ok(self.pair())
        } else {
            Ok(None)
        }
    }

    /// Remove the element under the cursor. Fails on sub-buckets.
    pub fn delete(&mut self) -> Result<()> {
        let tx = self.inner.bucket.tx()?;
        if !tx.writable {
            return Err(Error::TxNotWritable);
        }
        self.inner.delete_current()
    }
}
