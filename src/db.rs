//! Database handle: file lifecycle, memory mapping, and transaction
//! admission.
//!
//! A database is one file and two handles onto it: a plain handle for
//! dirty-page writes and an `O_SYNC` handle for meta writes, so the meta
//! flip is ordered after the data it references. Reads go through a
//! single shared read-only mapping of the file.
//!
//! Three locks coordinate access:
//!
//! - the writer lock (a mutex around the freelist) admits one write
//!   transaction at a time;
//! - the meta lock (around the reader registry) protects meta selection
//!   and the active-transaction list;
//! - the mmap lock (an `RwLock` around the mapping) is held shared by
//!   every reader for its lifetime and taken exclusively to remap, so a
//!   remap waits for all readers to close.
//!
//! The file itself is held under an exclusive advisory lock from open to
//! close, so a second handle — in this process or another — cannot race
//! the writer; it gets `DatabaseOpen` instead. After `close`, the handle
//! refuses new transactions with `DatabaseNotOpen`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::catalog::Buckets;
use crate::error::{Error, Result};
use crate::storage::{
    Freelist, Meta, PageId, PageMut, PageView, TxId, BUCKETS_PAGE_FLAG, FREELIST_PAGE_FLAG,
};
use crate::txn::{RwTx, Tx};

/// The mmap never shrinks below 4MB.
const MIN_MMAP_SIZE: usize = 1 << 22;
/// Growth doubles until 1GB, then advances in 1GB steps.
const MAX_MMAP_STEP: usize = 1 << 30;

/// The shared read-only mapping of the data file.
pub(crate) struct Mapping {
    mmap: Mmap,
}

impl Mapping {
    fn data(&self) -> &[u8] {
        &self.mmap
    }

    pub(crate) fn len(&self) -> usize {
        self.mmap.len()
    }

    /// A view of the page run starting at `id`. The slice extends to the
    /// end of the mapping; accessors stay within the run.
    pub(crate) fn page(&self, id: PageId, page_size: usize) -> PageView<'_> {
        let offset = id as usize * page_size;
        assert!(offset < self.mmap.len(), "page {} beyond the mapping", id);
        PageView::new(&self.mmap[offset..])
    }
}

/// Active read-transaction registry, guarded by the meta lock.
#[derive(Default)]
struct TxRegistry {
    txs: Vec<TxId>,
}

/// Options for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    mode: u32,
    page_size: Option<u32>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            mode: 0o600,
            page_size: None,
        }
    }

    /// Unix permission bits used when the file is created.
    pub fn mode(mut self, mode: u32) -> Options {
        self.mode = mode;
        self
    }

    /// Page size used when the file is created; an existing file keeps
    /// the size recorded in its meta page. Defaults to the OS page size.
    pub fn page_size(mut self, page_size: u32) -> Options {
        self.page_size = Some(page_size);
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Database> {
        Database::open_with(self, path.as_ref())
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

/// A collection of buckets persisted to one file on disk.
///
/// All data access goes through transactions obtained from
/// [`Database::begin_read`] and [`Database::begin_write`].
pub struct Database {
    path: PathBuf,
    file: File,
    sync_file: File,
    page_size: usize,
    opened: AtomicBool,
    mapping: RwLock<Mapping>,
    state: Mutex<TxRegistry>,
    writer: Mutex<Freelist>,
}

impl Database {
    /// Opens the data file at `path`, creating and initializing it if it
    /// does not exist.
    pub fn open<P: AsRef<Path>>(path: P, mode: u32) -> Result<Database> {
        Options::new().mode(mode).open(path)
    }

    fn open_with(opts: &Options, path: &Path) -> Result<Database> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(opts.mode)
            .open(path)?;

        // One handle at a time: the file stays under an exclusive
        // advisory lock until the database is closed.
        flock_exclusive(&file)?;

        let sync_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;

        // A zero-length file gets the initial page layout; otherwise the
        // first meta page dictates the page size.
        let page_size = if file.metadata()?.len() == 0 {
            let page_size = opts.page_size.unwrap_or_else(default_page_size);
            if !page_size.is_power_of_two() || page_size < 512 {
                return Err(Error::Invalid);
            }
            init_file(&sync_file, page_size)?;
            info!(path = %path.display(), page_size, "initialized database file");
            page_size as usize
        } else {
            let mut buf = [0u8; 4096];
            let want = (file.metadata()?.len() as usize).min(buf.len());
            if want < crate::storage::PAGE_HEADER_SIZE + size_of::<Meta>() {
                return Err(Error::Invalid);
            }
            file.read_exact_at(&mut buf[..want], 0)?;
            let meta = Meta::from_page(&PageView::new(&buf[..want]));
            meta.validate()?;
            meta.page_size() as usize
        };

        let file_len = file.metadata()?.len() as usize;
        if file_len < page_size * 2 {
            return Err(Error::Invalid);
        }

        let size = mmap_size(page_size, file_len);
        // SAFETY: the mapping is read-only and private to this handle;
        // the only writes to the file go through this process's own
        // commit path, which orders them before the meta flip. The
        // mapping is replaced exclusively under the mmap write lock.
        let mmap = unsafe { MmapOptions::new().len(size).map(&file)? };
        let mapping = Mapping { mmap };

        let meta0 = Meta::from_page(&mapping.page(0, page_size));
        meta0.validate()?;
        let meta1 = Meta::from_page(&mapping.page(1, page_size));
        meta1.validate()?;
        let active = if meta0.txid() > meta1.txid() {
            meta0
        } else {
            meta1
        };

        let mut freelist = Freelist::new();
        freelist.read(&mapping.page(active.freelist_page_id(), page_size));

        debug!(
            path = %path.display(),
            txid = active.txid(),
            high_water = active.high_water(),
            "opened database"
        );

        Ok(Database {
            path: path.to_path_buf(),
            file,
            sync_file,
            page_size,
            opened: AtomicBool::new(true),
            mapping: RwLock::new(mapping),
            state: Mutex::new(TxRegistry::default()),
            writer: Mutex::new(freelist),
        })
    }

    /// Begins a read-only transaction. Any number may run concurrently.
    pub fn begin_read(&self) -> Result<Tx<'_>> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(Error::DatabaseNotOpen);
        }

        let mut state = self.state.lock();
        let guard = self.mapping.read();

        let meta = self.active_meta(&guard);
        let mut buckets = Buckets::new();
        buckets.read(&guard.page(meta.buckets_page_id(), self.page_size))?;

        state.txs.push(meta.txid());
        drop(state);

        Ok(Tx::new(self, guard, meta, buckets))
    }

    /// Begins a read-write transaction, blocking until any current writer
    /// finishes. Commit or rollback to release it.
    pub fn begin_write(&self) -> Result<RwTx<'_>> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(Error::DatabaseNotOpen);
        }

        let mut freelist = self.writer.lock();

        let state = self.state.lock();
        let guard = self.mapping.read();
        let mut meta = self.active_meta(&guard);
        let mut buckets = Buckets::new();
        buckets.read(&guard.page(meta.buckets_page_id(), self.page_size))?;
        drop(guard);

        meta.set_txid(meta.txid() + 1);

        // Reclaim pages freed by writers whose versions no open reader
        // can still observe.
        let min_txid = state.txs.iter().copied().min().unwrap_or(TxId::MAX);
        drop(state);
        if min_txid > 0 {
            freelist.release(min_txid - 1);
        }

        debug!(txid = meta.txid(), "begin write transaction");
        Ok(RwTx::new(self, freelist, meta, buckets))
    }

    /// Closes the database: no new transactions can begin and the file
    /// lock is released. Transactions still open keep their snapshots
    /// until they drop; the mapping and handles go with the value.
    pub fn close(&self) {
        if self.opened.swap(false, Ordering::AcqRel) {
            // SAFETY: flock has no memory-safety preconditions.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size this file was created with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn data_file(&self) -> &File {
        &self.file
    }

    pub(crate) fn sync_file(&self) -> &File {
        &self.sync_file
    }

    pub(crate) fn mapping_len(&self) -> usize {
        self.mapping.read().len()
    }

    /// The active meta is whichever of pages 0 and 1 carries the higher
    /// transaction id.
    fn active_meta(&self, mapping: &Mapping) -> Meta {
        let meta0 = Meta::from_page(&mapping.page(0, self.page_size));
        let meta1 = Meta::from_page(&mapping.page(1, self.page_size));
        if meta0.txid() > meta1.txid() {
            meta0
        } else {
            meta1
        }
    }

    /// Raw bytes of a mapped page run, borrowed from the database rather
    /// than from a mapping guard.
    ///
    /// Only the write transaction uses this (readers hold their own guard
    /// for their lifetime). It is sound because the mapping is replaced
    /// only by [`Database::grow_mapping`], which the sole writer calls
    /// from `allocate(&mut self)` — so no `&self`-derived borrow can be
    /// alive across a remap — and the writer dereferences its node arena
    /// before triggering one.
    pub(crate) fn mapped_slice(&self, id: PageId) -> &[u8] {
        let mapping = self.mapping.read();
        let offset = id as usize * self.page_size;
        let data = mapping.data();
        assert!(offset < data.len(), "page {} beyond the mapping", id);
        // SAFETY: see above; the pointer stays valid for the lifetime of
        // the returned borrow because remapping requires either this
        // borrow to end (writer) or every reader guard to drop first.
        unsafe { std::slice::from_raw_parts(data.as_ptr().add(offset), data.len() - offset) }
    }

    /// Replaces the mapping with one of at least `min_size` bytes,
    /// waiting for every open reader to close. The caller must have
    /// dereferenced any node borrows into the old region.
    pub(crate) fn grow_mapping(&self, min_size: usize) -> Result<()> {
        let mut mapping = self.mapping.write();

        let file_len = self.file.metadata()?.len() as usize;
        let target = mmap_size(self.page_size, min_size.max(file_len));
        debug!(from = mapping.len(), to = target, "remapping data file");

        // SAFETY: as in open; the old mapping is dropped only after the
        // new one replaces it, under the exclusive mmap lock.
        let mmap = unsafe { MmapOptions::new().len(target).map(&self.file)? };
        *mapping = Mapping { mmap };

        Meta::from_page(&mapping.page(0, self.page_size)).validate()?;
        Meta::from_page(&mapping.page(1, self.page_size)).validate()?;
        Ok(())
    }

    pub(crate) fn unregister_reader(&self, txid: TxId) {
        let mut state = self.state.lock();
        if let Some(pos) = state.txs.iter().position(|t| *t == txid) {
            state.txs.swap_remove(pos);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Takes a non-blocking exclusive advisory lock on the data file, so a
/// second open of the same file — from this process or another — fails
/// instead of racing the writer.
fn flock_exclusive(file: &File) -> Result<()> {
    // SAFETY: flock has no memory-safety preconditions.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(Error::DatabaseOpen);
    }
    Err(Error::Io(err))
}

/// Writes the initial four pages: two metas (txids 0 and 1), an empty
/// freelist at page 2, and an empty buckets page at page 3.
fn init_file(sync_file: &File, page_size: u32) -> Result<()> {
    let ps = page_size as usize;
    let mut buf = vec![0u8; ps * 4];

    for txid in 0..2u64 {
        let start = txid as usize * ps;
        let mut page = PageMut::new(&mut buf[start..start + ps]);
        Meta::init(page_size, txid).write(&mut page);
    }
    {
        let mut page = PageMut::new(&mut buf[2 * ps..3 * ps]);
        let header = page.header_mut();
        header.set_id(2);
        header.add_flags(FREELIST_PAGE_FLAG);
    }
    {
        let mut page = PageMut::new(&mut buf[3 * ps..4 * ps]);
        let header = page.header_mut();
        header.set_id(3);
        header.add_flags(BUCKETS_PAGE_FLAG);
    }

    sync_file.write_all_at(&buf, 0)?;
    Ok(())
}

fn default_page_size() -> u32 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u32
    }
}

/// Sizes the mapping for a file of `size` bytes: at least 4MB, doubling
/// until 1GB, then 1GB steps, rounded up to a page multiple.
fn mmap_size(page_size: usize, size: usize) -> usize {
    let mut size = size;
    if size < MIN_MMAP_SIZE {
        return MIN_MMAP_SIZE;
    } else if size < MAX_MMAP_STEP {
        size *= 2;
    } else {
        size += MAX_MMAP_STEP;
    }

    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }
    size
}
