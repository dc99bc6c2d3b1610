//! Database handle and file management
//!
//! A database is one file. The first two pages are meta slots, then
//! pages allocated as the trees and the freelist need them. All reads
//! go through a read-only memory map; the writer updates the file with
//! positional writes and publishes a larger mapping after growth, so
//! old snapshots keep reading their own pinned mapping undisturbed.

use crate::error::{Error, PageId, Result, TxId};
use crate::freelist::Freelist;
use crate::meta::{BucketHeader, Meta, MAGIC, VERSION};
use crate::page::{self, PageFlags, PageRef};
use crate::readers::ReaderTable;
use crate::tx::{Tx, TxInner};
use crate::DEFAULT_PAGE_SIZE;
use log::{debug, info};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// File growth doubles up to this size, then advances in whole steps.
const GROW_STEP: u64 = 1 << 30;

/// Smallest size the data file is ever grown to.
const MIN_GROW: u64 = 32 * 1024;

/// Candidate page sizes probed when the first meta page is damaged.
const PAGE_SIZE_PROBES: [usize; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Configuration for opening a database
#[derive(Debug, Clone)]
pub struct Options {
    page_size: usize,
    read_only: bool,
    initial_mmap_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// Default options: 4 KiB pages, read-write.
    pub fn new() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, read_only: false, initial_mmap_size: 0 }
    }

    /// Page size used when creating a new database. Ignored for
    /// existing files, whose page size is read from the meta.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Open with a shared lock and reject write transactions.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Map at least this many bytes up front, avoiding early remaps.
    pub fn initial_mmap_size(mut self, bytes: usize) -> Self {
        self.initial_mmap_size = bytes;
        self
    }

    /// Open or create the database at `path`.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Db> {
        Db::open_with(path.as_ref(), self)
    }
}

/// Shared database state
pub(crate) struct DbInner {
    path: PathBuf,
    file: File,
    page_size: usize,
    read_only: bool,
    /// Current mapping; transactions pin the Arc they begin with
    mmap: RwLock<Arc<Mmap>>,
    data_len: AtomicU64,
    /// At most one writable transaction at a time
    writer_lock: Arc<Mutex<()>>,
    /// Guards the meta snapshot read plus reader registration
    meta_lock: Mutex<()>,
    readers: ReaderTable,
    freelist: Mutex<Freelist>,
    open: AtomicBool,
    tx_count: AtomicU64,
}

impl DbInner {
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn freelist(&self) -> &Mutex<Freelist> {
        &self.freelist
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    pub(crate) fn note_commit(&self) {
        self.tx_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Serializes the meta-slot write against snapshot begins.
    pub(crate) fn meta_write_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.meta_lock.lock()
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::DatabaseNotOpen)
        }
    }

    /// The current valid meta: both slots are validated and the one
    /// with the higher txid wins.
    pub(crate) fn meta(&self) -> Result<Meta> {
        let map = self.mmap.read().clone();
        let psize = self.page_size;
        let meta0 = Meta::validate(&map[0..psize]);
        let meta1 = Meta::validate(&map[psize..2 * psize]);
        match (meta0, meta1) {
            (Ok(a), Ok(b)) => Ok(if a.txid >= b.txid { a } else { b }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Extend the file to cover `required` bytes: doubled while small,
    /// then in 1 GiB steps.
    pub(crate) fn grow_to(&self, required: u64) -> Result<()> {
        let current = self.data_len.load(Ordering::Acquire);
        if required <= current {
            return Ok(());
        }
        let new_len = if required > GROW_STEP {
            required.div_ceil(GROW_STEP) * GROW_STEP
        } else {
            let mut size = MIN_GROW;
            while size < required {
                size *= 2;
            }
            size
        };
        self.file.set_len(new_len)?;
        self.file.sync_all()?;
        self.data_len.store(new_len, Ordering::Release);
        debug!("grew {} to {} bytes", self.path.display(), new_len);
        Ok(())
    }

    /// Publish a mapping covering the grown file. Snapshots begun
    /// earlier keep the mapping they pinned.
    pub(crate) fn publish_map(&self) -> Result<()> {
        let len = self.data_len.load(Ordering::Acquire);
        {
            let current = self.mmap.read();
            if current.len() >= len as usize {
                return Ok(());
            }
        }
        let map = map_file(&self.file, len)?;
        *self.mmap.write() = Arc::new(map);
        debug!("remapped {} at {} bytes", self.path.display(), len);
        Ok(())
    }
}

/// Aggregate counters exposed by [`Db::stats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    /// Pages on the free list
    pub free_page_n: usize,
    /// Pages pending release until old readers finish
    pub pending_page_n: usize,
    /// Bytes held by free and pending pages
    pub free_alloc: usize,
    /// Bytes the serialized freelist occupies
    pub freelist_inuse: usize,
    /// Committed write transactions over the handle's lifetime
    pub tx_n: u64,
    /// Currently open read transactions
    pub open_tx_n: usize,
}

/// An embedded key/value database backed by a single file.
///
/// Closing the handle (dropping it) releases the file lock; open
/// transactions must finish first.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open or create a database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Db> {
        Options::new().open(path)
    }

    fn open_with(path: &Path, opts: Options) -> Result<Db> {
        if opts.page_size < 512 || !opts.page_size.is_power_of_two() {
            return Err(Error::Custom("page size must be a power of two of at least 512".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!opts.read_only)
            .create(!opts.read_only)
            .open(path)?;
        flock(&file, opts.read_only)?;

        let mut len = file.metadata()?.len();
        let page_size;
        if len == 0 {
            if opts.read_only {
                return Err(Error::Invalid);
            }
            page_size = opts.page_size;
            init_file(&file, page_size)?;
            len = (4 * page_size) as u64;
            info!("created database {} (page size {})", path.display(), page_size);
        } else {
            page_size = read_page_size(&file)?;
        }

        let map_len = len.max(opts.initial_mmap_size as u64);
        let map = map_file(&file, map_len)?;

        let inner = Arc::new(DbInner {
            path: path.to_path_buf(),
            file,
            page_size,
            read_only: opts.read_only,
            mmap: RwLock::new(Arc::new(map)),
            data_len: AtomicU64::new(len),
            writer_lock: Arc::new(Mutex::new(())),
            meta_lock: Mutex::new(()),
            readers: ReaderTable::new(),
            freelist: Mutex::new(Freelist::new()),
            open: AtomicBool::new(true),
            tx_count: AtomicU64::new(0),
        });

        // Recover the current root and load the free page inventory.
        let meta = inner.meta()?;
        if meta.page_size as usize != page_size {
            return Err(Error::Invalid);
        }
        {
            let map = inner.mmap.read().clone();
            let offset = meta.freelist.0 as usize * page_size;
            let head = &map[offset..offset + page::PAGE_HEADER_SIZE];
            let overflow = page::read_u32(head, 12) as usize;
            let slice = &map[offset..offset + page_size * (1 + overflow)];
            inner.freelist.lock().read(&PageRef::new(slice));
        }
        info!("opened database {} at txid {}", path.display(), meta.txid);
        Ok(Db { inner })
    }

    /// Begin a read-only transaction over the current snapshot.
    pub fn begin(&self) -> Result<Tx<'_>> {
        self.inner.check_open()?;
        let (meta, map) = {
            let _guard = self.inner.meta_lock.lock();
            let meta = self.inner.meta()?;
            self.inner.readers.acquire(meta.txid);
            (meta, self.inner.mmap.read().clone())
        };
        let inner = TxInner::new(self.inner.clone(), meta, map, false, None);
        Ok(Tx { inner, _marker: PhantomData })
    }

    /// Begin the writable transaction, waiting for any current writer.
    pub fn begin_rw(&self) -> Result<Tx<'_>> {
        self.inner.check_open()?;
        if self.inner.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        let guard = self.inner.writer_lock.lock_arc();
        let (mut meta, map) = {
            let _guard = self.inner.meta_lock.lock();
            let meta = self.inner.meta()?;
            (meta, self.inner.mmap.read().clone())
        };
        meta.txid = TxId(meta.txid.0 + 1);

        // Pages freed below the oldest live snapshot become reusable.
        let floor = self.inner.readers.oldest().unwrap_or(meta.txid);
        self.inner.freelist.lock().release(floor);

        let inner = TxInner::new(self.inner.clone(), meta, map, true, Some(guard));
        Ok(Tx { inner, _marker: PhantomData })
    }

    /// Run `f` inside a read-only transaction, rolling back afterwards.
    /// A panic in the callback still releases the snapshot.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin()?;
        let result = catch_unwind(AssertUnwindSafe(|| f(&tx)));
        match result {
            Ok(r) => {
                let _ = tx.rollback();
                r
            }
            Err(payload) => {
                let _ = tx.rollback();
                resume_unwind(payload)
            }
        }
    }

    /// Run `f` inside a writable transaction: commit when it returns
    /// `Ok`, roll back on error or panic (the panic is re-raised).
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin_rw()?;
        let result = catch_unwind(AssertUnwindSafe(|| f(&tx)));
        match result {
            Ok(Ok(value)) => {
                tx.commit()?;
                Ok(value)
            }
            Ok(Err(e)) => {
                let _ = tx.rollback();
                Err(e)
            }
            Err(payload) => {
                let _ = tx.rollback();
                resume_unwind(payload)
            }
        }
    }

    /// Freelist and transaction counters.
    pub fn stats(&self) -> DbStats {
        let freelist = self.inner.freelist.lock();
        DbStats {
            free_page_n: freelist.free_count(),
            pending_page_n: freelist.pending_count(),
            free_alloc: freelist.count() * self.inner.page_size,
            freelist_inuse: freelist.size(),
            tx_n: self.inner.tx_count.load(Ordering::Relaxed),
            open_tx_n: self.inner.readers.count(),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Page size the file was created with.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Whether the handle rejects write transactions.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.open.store(false, Ordering::Release);
        // The advisory lock dies with the file descriptor.
        debug!("closed database {}", self.inner.path.display());
    }
}

/// Initial file image: two meta slots, an empty freelist at page 2,
/// and an empty root leaf at page 3.
fn init_file(file: &File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; 4 * page_size];
    for i in 0..2u64 {
        let meta = Meta {
            magic: MAGIC,
            version: VERSION,
            page_size: page_size as u32,
            flags: 0,
            root: BucketHeader { root: PageId(3), sequence: 0 },
            freelist: PageId(2),
            pgid: PageId(4),
            txid: TxId(i),
            checksum: 0,
        };
        let slot = &mut buf[i as usize * page_size..(i as usize + 1) * page_size];
        meta.write(slot);
    }
    page::write_page_header(&mut buf[2 * page_size..], PageId(2), PageFlags::FREELIST, 0, 0);
    page::write_page_header(&mut buf[3 * page_size..], PageId(3), PageFlags::LEAF, 0, 0);
    file.write_all_at(&buf, 0)?;
    file.sync_all()?;
    Ok(())
}

/// Learn the page size from meta 0, falling back to probing meta 1 at
/// candidate sizes when the first page is damaged.
fn read_page_size(file: &File) -> Result<usize> {
    let mut buf = [0u8; 4096];
    let n = file.read_at(&mut buf, 0)?;
    let first = match Meta::validate(&buf[..n]) {
        Ok(meta) => return Ok(meta.page_size as usize),
        Err(e) => e,
    };
    for probe in PAGE_SIZE_PROBES {
        let mut buf = [0u8; 128];
        if file.read_at(&mut buf, probe as u64).unwrap_or(0) < buf.len() {
            continue;
        }
        if let Ok(meta) = Meta::validate(&buf) {
            if meta.page_size as usize == probe {
                return Ok(probe);
            }
        }
    }
    Err(first)
}

fn map_file(file: &File, len: u64) -> Result<Mmap> {
    // Safety: the mapping is read-only; the file only ever grows and
    // committed pages are never rewritten in place, so views stay
    // coherent for the snapshots that pinned them.
    let map = unsafe { MmapOptions::new().len(len as usize).map(file)? };
    Ok(map)
}

#[cfg(unix)]
fn flock(file: &File, shared: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let op = (if shared { libc::LOCK_SH } else { libc::LOCK_EX }) | libc::LOCK_NB;
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Err(Error::DatabaseAlreadyOpen);
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock(_file: &File, _shared: bool) -> Result<()> {
    Ok(())
}
