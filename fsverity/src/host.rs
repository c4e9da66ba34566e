// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! The interface between the verification core and whatever stores the file.
//!
//! A host supplies pages of the Merkle tree and descriptor, records whether a
//! file has verity enabled, and owns the page cache. [`CachedFile`] is a host
//! backed by any [`ReadAt`] source.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tracing::trace;

use crate::stream::ReadAt;

/// log2 of the page size used when the host does not say otherwise.
pub const DEFAULT_PAGE_SHIFT: u8 = 12;

/// A cached page of metadata. The `checked` flag records that the page has
/// been verified against its parent hash and is shared by every reader of the
/// cached page.
pub struct Page {
    index: u64,
    data: Box<[u8]>,
    checked: AtomicBool,
}

impl Page {
    pub fn new(index: u64, data: Box<[u8]>) -> Self {
        Self {
            index,
            data,
            checked: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the page contents have been verified. A `true` result
    /// guarantees that the verified contents are visible to this thread.
    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    pub fn set_checked(&self) {
        self.checked.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("checked", &self.is_checked())
            .finish()
    }
}

/// Storage operations needed to set up and verify a file.
pub trait VerityHost: Send + Sync {
    /// Identifier used in diagnostics.
    fn ino(&self) -> u64;

    /// log2 of the host page size. This is also the only supported tree block
    /// size.
    fn page_shift(&self) -> u8 {
        DEFAULT_PAGE_SHIFT
    }

    /// Fetch a page from the metadata stream, possibly from cache. Bytes past
    /// the end of the stream read as zero.
    fn read_metadata_page(&self, index: u64) -> io::Result<Arc<Page>>;

    /// End of the metadata for a file that already has verity enabled.
    fn get_metadata_end(&self) -> io::Result<u64>;

    /// Current size of the underlying stream, including any metadata.
    fn stream_size(&self) -> io::Result<u64>;

    /// Whether the file is marked as having verity enabled.
    fn is_verity(&self) -> bool;

    /// Persist that verity is enabled, with `data_size` as the logical size.
    fn set_verity(&self, data_size: u64) -> io::Result<()>;

    /// Drop all cached pages.
    fn invalidate_pages(&self);
}

/// Host over a [`ReadAt`] source that holds the full verity layout: data,
/// tree, descriptor and footer.
pub struct CachedFile<R> {
    inner: R,
    ino: u64,
    page_shift: u8,
    pages: Mutex<HashMap<u64, Arc<Page>>>,
    reads: AtomicU64,
    verity: AtomicBool,
    verity_data_size: OnceLock<u64>,
}

impl<R: ReadAt> CachedFile<R> {
    /// Wrap a source that does not have verity enabled yet.
    pub fn new(inner: R, ino: u64) -> Self {
        Self {
            inner,
            ino,
            page_shift: DEFAULT_PAGE_SHIFT,
            pages: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            verity: AtomicBool::new(false),
            verity_data_size: OnceLock::new(),
        }
    }

    pub fn with_page_shift(mut self, page_shift: u8) -> Self {
        self.page_shift = page_shift;
        self
    }

    /// Mark whether the source already holds enabled verity metadata.
    pub fn with_verity(self, enabled: bool) -> Self {
        self.verity.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    /// Read a full page, zero filling past EOF.
    fn read_page_uncached(&self, index: u64) -> io::Result<Box<[u8]>> {
        let offset = index.checked_shl(u32::from(self.page_shift)).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("Page index {index} overflows"))
        })?;

        let mut buf = vec![0u8; self.page_size()].into_boxed_slice();
        self.inner.read_full_at(&mut buf, offset)?;

        Ok(buf)
    }

    /// Read a data page straight from the source. The result is `page_size`
    /// bytes, or shorter if the page straddles `data_size`.
    pub fn read_data_page(&self, index: u64, data_size: u64) -> io::Result<Vec<u8>> {
        let page_size = self.page_size() as u64;
        let start = index.saturating_mul(page_size);
        let len = data_size.saturating_sub(start).min(page_size);

        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact_at(&mut buf, start)?;

        Ok(buf)
    }

    /// Number of pages that had to be read from the source because they were
    /// not cached.
    pub fn page_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Logical size recorded by [`VerityHost::set_verity`], if any.
    pub fn verity_data_size(&self) -> Option<u64> {
        self.verity_data_size.get().copied()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ReadAt + Send + Sync> VerityHost for CachedFile<R> {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn page_shift(&self) -> u8 {
        self.page_shift
    }

    fn read_metadata_page(&self, index: u64) -> io::Result<Arc<Page>> {
        if let Some(page) = self.pages.lock().ok().and_then(|p| p.get(&index).cloned()) {
            return Ok(page);
        }

        // No lock held during I/O. If two readers race, the first insertion
        // wins so that everyone shares one `checked` flag.
        let data = self.read_page_uncached(index)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        trace!(ino = self.ino, index, "Read metadata page");

        let page = Arc::new(Page::new(index, data));
        match self.pages.lock() {
            Ok(mut pages) => Ok(pages.entry(index).or_insert(page).clone()),
            Err(_) => Ok(page),
        }
    }

    fn get_metadata_end(&self) -> io::Result<u64> {
        self.inner.file_len()
    }

    fn stream_size(&self) -> io::Result<u64> {
        self.inner.file_len()
    }

    fn is_verity(&self) -> bool {
        self.verity.load(Ordering::Acquire)
    }

    fn set_verity(&self, data_size: u64) -> io::Result<()> {
        if self.is_verity() || self.verity_data_size.set(data_size).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Verity is already enabled",
            ));
        }

        self.verity.store(true, Ordering::Release);

        Ok(())
    }

    fn invalidate_pages(&self) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.clear();
        }
    }
}
