//! Transactions
//!
//! Read-only transactions capture the current meta under the meta lock
//! and then only ever touch immutable pages of that snapshot. The
//! single writable transaction owns the writer mutex for its lifetime
//! and edits copies: freshly allocated pages that no snapshot can reach
//! until the commit's final meta write makes them the new root.
//!
//! Commit ordering: rebalance, spill, rewrite the freelist, grow the
//! file, write dirty pages, fsync, write the meta slot `txid % 2`,
//! fsync again. A failure before the meta fsync leaves the previous
//! meta current and rolls everything back.

use crate::bucket::{Bucket, BucketInner};
use crate::db::{Db, DbInner};
use crate::error::{Error, PageId, Result, TxId};
use crate::meta::{BucketHeader, Meta, BUCKET_HEADER_SIZE};
use crate::page::{self, PageData, PageRef, LEAF_FLAG_BUCKET, PAGE_HEADER_SIZE};
use log::debug;
use memmap2::Mmap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

pub(crate) type WriterGuard = ArcMutexGuard<RawMutex, ()>;

/// Transaction state shared by the handle and its buckets
pub(crate) struct TxInner {
    pub(crate) db: Arc<DbInner>,
    pub(crate) writable: bool,
    open: Cell<bool>,
    pub(crate) meta: RefCell<Meta>,
    /// Mapping pinned at begin; slices handed out stay valid while the
    /// transaction holds this
    map: Arc<Mmap>,
    root: RefCell<Option<Rc<BucketInner>>>,
    /// Dirty logical pages by first page id, written at commit
    pages: RefCell<BTreeMap<PageId, Box<[u8]>>>,
    writer_guard: RefCell<Option<WriterGuard>>,
}

impl TxInner {
    pub(crate) fn new(
        db: Arc<DbInner>,
        meta: Meta,
        map: Arc<Mmap>,
        writable: bool,
        guard: Option<WriterGuard>,
    ) -> Rc<TxInner> {
        Rc::new_cyclic(|weak| {
            let root = BucketInner::new(weak.clone(), meta.root);
            TxInner {
                db,
                writable,
                open: Cell::new(true),
                meta: RefCell::new(meta),
                map,
                root: RefCell::new(Some(root)),
                pages: RefCell::new(BTreeMap::new()),
                writer_guard: RefCell::new(guard),
            }
        })
    }

    pub(crate) fn id(&self) -> TxId {
        self.meta.borrow().txid
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.get()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.db.page_size()
    }

    /// Current page high-water mark.
    pub(crate) fn high_water(&self) -> PageId {
        self.meta.borrow().pgid
    }

    fn root_bucket(&self) -> Result<Rc<BucketInner>> {
        self.root.borrow().clone().ok_or(Error::TxClosed)
    }

    /// Resolve a committed page against the pinned mapping.
    pub(crate) fn page_data(&self, pgid: PageId) -> PageData {
        let page_size = self.page_size();
        let offset = pgid.0 as usize * page_size;
        let head = &self.map[offset..offset + PAGE_HEADER_SIZE];
        let overflow = page::read_u32(head, 12) as usize;
        let len = page_size * (1 + overflow);
        assert!(offset + len <= self.map.len(), "page {} beyond mapped region", pgid);
        PageData::Mapped { ptr: self.map[offset..].as_ptr(), len }
    }

    /// Reserve a run of `count` contiguous pages and register a zeroed
    /// dirty buffer for them.
    pub(crate) fn allocate(&self, count: usize) -> Result<PageId> {
        let txid = self.id();
        let reused = self.db.freelist().lock().allocate(txid, count);
        let pgid = match reused {
            Some(pgid) => pgid,
            None => {
                let mut meta = self.meta.borrow_mut();
                let pgid = meta.pgid;
                meta.pgid = PageId(meta.pgid.0 + count as u64);
                pgid
            }
        };
        let mut buf = vec![0u8; count * self.page_size()].into_boxed_slice();
        page::write_u64(&mut buf, 0, pgid.0);
        page::write_u32(&mut buf, 12, (count - 1) as u32);
        self.pages.borrow_mut().insert(pgid, buf);
        Ok(pgid)
    }

    /// Move a logical page into the pending set under this txid.
    pub(crate) fn free(&self, pgid: PageId) -> Result<()> {
        let overflow = {
            let pages = self.pages.borrow();
            match pages.get(&pgid) {
                Some(buf) => PageRef::new(buf).overflow(),
                None => self.page_data(pgid).page().overflow(),
            }
        } as usize;
        self.db.freelist().lock().free(self.id(), pgid, overflow)
    }

    /// Run `f` over the dirty buffer registered for `pgid`.
    pub(crate) fn with_dirty<R>(&self, pgid: PageId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut pages = self.pages.borrow_mut();
        match pages.get_mut(&pgid) {
            Some(buf) => Ok(f(buf)),
            None => Err(Error::corruption(format!("page {} not in dirty set", pgid), Some(pgid))),
        }
    }

    /// Walk the committed pages of a subtree, parents before children.
    pub(crate) fn for_each_page<F>(&self, pgid: PageId, depth: usize, f: &mut F) -> Result<()>
    where
        F: FnMut(&PageRef<'_>, usize) -> Result<()>,
    {
        let data = self.page_data(pgid);
        let p = data.page();
        f(&p, depth)?;
        if p.is_branch() {
            for i in 0..p.count() {
                let (_, child) = p.branch_elem(i);
                self.for_each_page(child, depth + 1, f)?;
            }
        }
        Ok(())
    }

    fn commit_inner(&self) -> Result<()> {
        if !self.open.get() {
            return Err(Error::TxClosed);
        }
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        let root = self.root_bucket()?;

        // Merge what shrank, then write the dirty tree into new pages.
        root.rebalance()?;
        root.spill()?;
        self.meta.borrow_mut().root = root.header.get();

        // The freelist moves to fresh pages on every commit.
        let old_freelist = self.meta.borrow().freelist;
        self.free(old_freelist)?;
        let freelist_pages = {
            let freelist = self.db.freelist().lock();
            freelist.size().div_ceil(self.page_size())
        };
        let freelist_id = self.allocate(freelist_pages)?;
        self.with_dirty(freelist_id, |buf| self.db.freelist().lock().write(buf))?;
        self.meta.borrow_mut().freelist = freelist_id;

        // Make room for everything below the new high water.
        let required = self.meta.borrow().pgid.0 * self.page_size() as u64;
        self.db.grow_to(required)?;

        // Data pages in ascending order, then the first fsync.
        {
            let pages = self.pages.borrow();
            let page_size = self.page_size() as u64;
            for (pgid, buf) in pages.iter() {
                self.db.write_at(buf, pgid.0 * page_size)?;
            }
        }
        self.db.sync()?;
        self.pages.borrow_mut().clear();

        // The alternating meta slot, then the second fsync. Past this
        // point the commit is durable. The meta lock is held so a
        // concurrent begin never pairs the new meta with the old,
        // shorter mapping.
        let meta = *self.meta.borrow();
        let mut buf = vec![0u8; self.page_size()];
        meta.write(&mut buf);
        {
            let _meta_guard = self.db.meta_write_guard();
            self.db.write_at(&buf, (meta.txid.0 % 2) * self.page_size() as u64)?;
            self.db.sync()?;
            self.db.freelist().lock().commit(meta.txid);
            self.db.publish_map()?;
        }
        self.db.note_commit();
        debug!("committed txid {}, high water {} pages", meta.txid, meta.pgid);
        self.close();
        Ok(())
    }

    pub(crate) fn rollback_inner(&self) {
        if !self.open.get() {
            return;
        }
        if self.writable {
            self.db.freelist().lock().rollback(self.id());
        }
        self.close();
    }

    fn close(&self) {
        self.open.set(false);
        *self.root.borrow_mut() = None;
        self.pages.borrow_mut().clear();
        if self.writable {
            // Dropping the guard reopens the writer mutex.
            self.writer_guard.borrow_mut().take();
        } else {
            self.db.readers().release(self.id());
        }
    }
}

/// A transaction over the database: either a read-only snapshot or the
/// single writer.
///
/// Dropping an unfinished transaction rolls it back.
pub struct Tx<'db> {
    pub(crate) inner: Rc<TxInner>,
    pub(crate) _marker: PhantomData<&'db Db>,
}

impl<'db> Tx<'db> {
    /// The transaction id of this snapshot.
    pub fn id(&self) -> TxId {
        self.inner.id()
    }

    /// Whether this transaction can mutate the database.
    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    /// Open the top-level bucket under `name`.
    pub fn bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        let root = self.inner.root_bucket()?;
        match root.child_bucket(name)? {
            Some(inner) => Ok(Bucket::wrap(inner)),
            None => Err(Error::BucketNotFound),
        }
    }

    /// Create a top-level bucket under `name`.
    pub fn create_bucket<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        let root = self.inner.root_bucket()?;
        Ok(Bucket::wrap(root.create_bucket(name)?))
    }

    /// Create a top-level bucket under `name`, or open the existing one.
    pub fn create_bucket_if_not_exists<'tx>(&'tx self, name: &[u8]) -> Result<Bucket<'tx>> {
        let root = self.inner.root_bucket()?;
        Ok(Bucket::wrap(root.create_bucket_if_not_exists(name)?))
    }

    /// Recursively delete the top-level bucket under `name`.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.inner.root_bucket()?.delete_bucket(name)
    }

    /// Visit every top-level bucket name in key order.
    pub fn for_each_bucket<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        Bucket::wrap(self.inner.root_bucket()?).for_each_bucket(f)
    }

    /// Make every change durable. Consumes the transaction; on error
    /// the transaction is rolled back and the previous meta stays
    /// current.
    pub fn commit(self) -> Result<()> {
        let result = self.inner.commit_inner();
        if result.is_err() {
            self.inner.rollback_inner();
        }
        result
    }

    /// Discard every change (a no-op for read-only transactions beyond
    /// releasing the snapshot).
    pub fn rollback(self) -> Result<()> {
        if !self.inner.is_open() {
            return Err(Error::TxClosed);
        }
        self.inner.rollback_inner();
        Ok(())
    }

    /// Scan the snapshot for invariant violations: every page below the
    /// high water must be reachable from the meta exactly once or sit
    /// in the freelist, and keys must be strictly ordered. Returns
    /// human-readable findings; an empty list means consistent.
    pub fn check(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let meta = *self.inner.meta.borrow();

        let freed: HashSet<PageId> = {
            let freelist = self.inner.db.freelist().lock();
            freelist.copyall().into_iter().collect()
        };

        let mut reachable: HashSet<PageId> = HashSet::new();
        reachable.insert(PageId(0));
        reachable.insert(PageId(1));
        let fl_overflow = self.inner.page_data(meta.freelist).page().overflow() as u64;
        for i in 0..=fl_overflow {
            reachable.insert(PageId(meta.freelist.0 + i));
        }

        self.check_bucket(meta.root.root, &freed, &mut reachable, &mut errors);

        for id in 2..meta.pgid.0 {
            let pgid = PageId(id);
            if !reachable.contains(&pgid) && !freed.contains(&pgid) {
                errors.push(format!("page {}: unreachable and unfreed", pgid));
            }
        }
        errors
    }

    fn check_bucket(
        &self,
        root: PageId,
        freed: &HashSet<PageId>,
        reachable: &mut HashSet<PageId>,
        errors: &mut Vec<String>,
    ) {
        // Inline buckets own no pages.
        if root.0 == 0 {
            return;
        }
        let high_water = self.inner.meta.borrow().pgid;
        let _ = self.inner.for_each_page(root, 0, &mut |p, _| {
            let id = p.id();
            if id.0 + p.overflow() as u64 >= high_water.0 {
                errors.push(format!("page {}: out of bounds (high water {})", id, high_water));
                return Ok(());
            }
            for i in 0..=p.overflow() as u64 {
                let pgid = PageId(id.0 + i);
                if !reachable.insert(pgid) {
                    errors.push(format!("page {}: multiple references", pgid));
                }
                if freed.contains(&pgid) {
                    errors.push(format!("page {}: reachable and freed", pgid));
                }
            }
            if !p.is_leaf() && !p.is_branch() {
                errors.push(format!("page {}: invalid type {:?}", id, p.flags()));
                return Ok(());
            }
            // Keys must be strictly ascending within every page.
            let mut last: Option<Vec<u8>> = None;
            for i in 0..p.count() {
                let key = if p.is_leaf() { p.leaf_elem(i).1 } else { p.branch_elem(i).0 };
                if let Some(prev) = &last {
                    if prev.as_slice() >= key {
                        errors.push(format!("page {}: out-of-order key at index {}", id, i));
                    }
                }
                last = Some(key.to_vec());
            }
            Ok(())
        });

        // Recurse into non-inline sub-buckets.
        let mut subs: Vec<PageId> = Vec::new();
        let _ = self.inner.for_each_page(root, 0, &mut |p, _| {
            if p.is_leaf() {
                for i in 0..p.count() {
                    let (flags, _, value) = p.leaf_elem(i);
                    if flags & LEAF_FLAG_BUCKET != 0 && value.len() >= BUCKET_HEADER_SIZE {
                        let header = BucketHeader::read(value);
                        if header.root.0 != 0 {
                            subs.push(header.root);
                        }
                    }
                }
            }
            Ok(())
        });
        for sub in subs {
            self.check_bucket(sub, freed, reachable, errors);
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.inner.rollback_inner();
    }
}
