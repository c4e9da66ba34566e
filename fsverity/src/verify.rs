// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Data page verification against the Merkle tree.
//!
//! Verifying a page walks up the tree from the page's leaf hash until it finds
//! a hash page that was already verified, or the root. Then it walks back down,
//! hashing and marking each unverified hash page along the way, and finally
//! compares the hash of the data page itself. Hash pages are marked as checked
//! in the host's page cache, so most pages only need one or two hashes.

use std::{
    io,
    sync::Arc,
    time::Duration,
};

use rayon::{
    ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder,
    iter::{IntoParallelRefMutIterator, ParallelIterator},
};
use tracing::{error, trace, warn};

use crate::{
    hash::Digest,
    host::{Page, VerityHost},
    info::VerityInfo,
    tree::MAX_LEVELS,
    util::RateLimit,
};

static FAILURE_LIMIT: RateLimit = RateLimit::new(Duration::from_secs(5), 10);

fn report_corruption(
    info: &VerityInfo,
    ino: u64,
    index: u64,
    level: Option<usize>,
    want: &Digest,
    real: &Digest,
) {
    let Some(suppressed) = FAILURE_LIMIT.check() else {
        return;
    };
    if suppressed > 0 {
        warn!("{suppressed} verification failure messages suppressed");
    }

    let alg = info.hash_alg();
    error!(
        ino,
        index,
        level = ?level,
        "FILE CORRUPTED! want {}, real {}",
        alg.display(want),
        alg.display(real),
    );
}

fn report_read_error(ino: u64, index: u64, block: u64, e: &io::Error) {
    let Some(suppressed) = FAILURE_LIMIT.check() else {
        return;
    };
    if suppressed > 0 {
        warn!("{suppressed} verification failure messages suppressed");
    }

    error!(ino, index, "Error reading Merkle tree block {block}: {e}");
}

/// Extract the digest at `offset` from a hash page.
fn hash_in_page(page: &Page, offset: usize, size: usize) -> Option<Digest> {
    page.data()
        .get(offset..offset + size)
        .and_then(Digest::from_slice)
}

/// Verify data page `index` of a file. `data` may be shorter than the block
/// size, in which case the rest of the block is taken to be zeros. Pages past
/// the end of the data are always valid.
pub fn verify_page<H: VerityHost + ?Sized>(
    host: &H,
    info: &VerityInfo,
    index: u64,
    data: &[u8],
) -> bool {
    let geometry = info.geometry();
    let ino = host.ino();

    if index >= geometry.data_blocks() {
        return true;
    }

    if data.len() > geometry.block_size() {
        warn!(ino, index, "Data page is larger than the block size: {}", data.len());
        return false;
    }

    let digest_size = info.hash_alg().digest_size();
    let mut pending: [Option<(Arc<Page>, usize)>; MAX_LEVELS] = Default::default();
    let mut want = *info.root_hash();

    // Ascend until a hash page that was already checked is found.
    let mut level = 0;
    while level < geometry.depth() {
        let (block, offset) = geometry.hash_at_level(index, level);

        let page = match host.read_metadata_page(block) {
            Ok(p) => p,
            Err(e) => {
                report_read_error(ino, index, block, &e);
                return false;
            }
        };

        if page.is_checked() {
            let Some(digest) = hash_in_page(&page, offset, digest_size) else {
                warn!(ino, index, level, "Hash page is too short: block {block}");
                return false;
            };

            trace!(ino, index, level, "Found checked hash page: block {block}");
            want = digest;
            break;
        }

        pending[level] = Some((page, offset));
        level += 1;
    }

    // Descend, checking each hash page against the level above it.
    for l in (0..level).rev() {
        let Some((page, offset)) = pending[l].take() else {
            return false;
        };

        let real = info.hash_block(page.data());
        if real != want {
            report_corruption(info, ino, index, Some(l), &want, &real);
            return false;
        }

        page.set_checked();

        let Some(digest) = hash_in_page(&page, offset, digest_size) else {
            warn!(ino, index, level = l, "Hash page is too short: block {}", page.index());
            return false;
        };
        want = digest;
    }

    let real = info.hash_block(data);
    if real != want {
        report_corruption(info, ino, index, None, &want, &real);
        return false;
    }

    true
}

/// A data page from a completed read request.
#[derive(Clone, Copy, Debug)]
pub struct ReadPage<'a> {
    pub index: u64,
    pub data: &'a [u8],
    /// Set by an earlier layer, or by verification, if the page is unusable.
    pub error: bool,
}

impl<'a> ReadPage<'a> {
    pub fn new(index: u64, data: &'a [u8]) -> Self {
        Self {
            index,
            data,
            error: false,
        }
    }
}

/// Verify all pages of a read request in parallel. Pages that are already
/// marked as errored are skipped. Returns whether every page is valid.
pub fn verify_pages<H: VerityHost + ?Sized>(
    host: &H,
    info: &VerityInfo,
    pages: &mut [ReadPage<'_>],
) -> bool {
    pages
        .par_iter_mut()
        .filter(|p| !p.error)
        .for_each(|p| {
            if !verify_page(host, info, p.index, p.data) {
                p.error = true;
            }
        });

    pages.iter().all(|p| !p.error)
}

/// Dedicated worker pool for verifying pages off of the submitting thread.
pub struct VerifyQueue {
    pool: ThreadPool,
}

impl VerifyQueue {
    /// Create a pool with one thread per available CPU.
    pub fn new() -> Result<Self, ThreadPoolBuildError> {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_threads(threads)
    }

    pub fn with_threads(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("fsverity-verify-{i}"))
            .build()?;

        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue work to run asynchronously.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(work);
    }

    /// Run work on the pool and wait for it. Parallel iterators used inside
    /// `work` also run on the pool.
    pub fn install<R, F>(&self, work: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(work)
    }
}
