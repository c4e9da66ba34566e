// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Per-file verification state and the hooks a host calls around it.
//!
//! [`create_verity_info`] runs the full setup pipeline once: locate and parse
//! the descriptor, compute the tree geometry and check the file measurement.
//! [`VerityInode`] publishes the result exactly once per file and answers
//! every later page verification from it.

use std::{
    fmt, io,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::VerityConfig,
    format::descriptor,
    hash::{Digest, HashAlgorithm, HashState},
    host::VerityHost,
    measurement::{self, Measurement},
    signature::{self, SignatureVerifier},
    tree::{self, TreeGeometry},
    util::NumBytes,
    verify::{self, ReadPage},
};

/// Coarse classification of every failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown algorithm or a feature that is not compiled in.
    Unsupported,
    /// Structural problem with the metadata.
    Malformed,
    /// Hash or signature mismatch.
    Integrity,
    /// Underlying storage failure.
    Io,
    PermissionDenied,
    AlreadyEnabled,
    NotEnabled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid verity descriptor")]
    Descriptor(#[from] descriptor::Error),
    #[error("Invalid Merkle tree geometry")]
    Tree(#[from] tree::Error),
    #[error("Failed to verify file measurement")]
    Measurement(#[from] measurement::Error),
    #[error("Failed to read verity metadata")]
    Io(#[from] io::Error),
    #[error("Original file size {data_size} exceeds stream size {stream_size}")]
    BadDataSize { data_size: u64, stream_size: u64 },
    #[error("Verity files cannot be modified")]
    PermissionDenied,
    #[error("Verity is already enabled")]
    AlreadyEnabled,
    #[error("Verity is not enabled")]
    NotEnabled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Descriptor(e) if e.is_unsupported() => ErrorKind::Unsupported,
            Self::Descriptor(e) if e.is_integrity() => ErrorKind::Integrity,
            Self::Descriptor(_) | Self::Tree(_) | Self::BadDataSize { .. } => ErrorKind::Malformed,
            Self::Measurement(e) if e.is_unsupported() => ErrorKind::Unsupported,
            Self::Measurement(measurement::Error::Signature(
                signature::Error::UnrecognizedPayload(_)
                | signature::Error::UnknownHashAlgorithm(_)
                | signature::Error::WrongDigestSize { .. }
                | signature::Error::TruncatedPayload,
            )) => ErrorKind::Malformed,
            Self::Measurement(_) => ErrorKind::Integrity,
            Self::Io(_) => ErrorKind::Io,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::AlreadyEnabled => ErrorKind::AlreadyEnabled,
            Self::NotEnabled => ErrorKind::NotEnabled,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Policy and signature verifier shared by every file.
pub struct VerityContext {
    config: VerityConfig,
    verifier: Box<dyn SignatureVerifier>,
}

impl VerityContext {
    /// Create a context that trusts the certificates in `config`. Signed files
    /// are rejected as unsupported when signature support is not compiled in.
    pub fn new(config: VerityConfig) -> Self {
        #[cfg(feature = "signatures")]
        let verifier: Box<dyn SignatureVerifier> = Box::new(signature::Pkcs7Verifier::new(
            config.trusted_certs.clone(),
        ));
        #[cfg(not(feature = "signatures"))]
        let verifier: Box<dyn SignatureVerifier> = Box::new(signature::NoSignatureVerifier);

        Self { config, verifier }
    }

    pub fn with_verifier(config: VerityConfig, verifier: Box<dyn SignatureVerifier>) -> Self {
        Self { config, verifier }
    }

    pub fn config(&self) -> &VerityConfig {
        &self.config
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }
}

impl Default for VerityContext {
    fn default() -> Self {
        Self::new(VerityConfig::default())
    }
}

impl fmt::Debug for VerityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerityContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything needed to verify pages of one file. Immutable once built.
pub struct VerityInfo {
    hash_alg: &'static HashAlgorithm,
    geometry: TreeGeometry,
    hash_state: HashState,
    data_size: u64,
    metadata_end: u64,
    root_hash: Digest,
    measurement: Measurement,
    hash_invocations: AtomicU64,
}

impl VerityInfo {
    pub fn hash_alg(&self) -> &'static HashAlgorithm {
        self.hash_alg
    }

    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    /// Logical size of the file, excluding metadata.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn metadata_end(&self) -> u64 {
        self.metadata_end
    }

    pub fn root_hash(&self) -> &Digest {
        &self.root_hash
    }

    pub fn measurement(&self) -> &Digest {
        &self.measurement.digest
    }

    pub fn have_signed_measurement(&self) -> bool {
        self.measurement.signed
    }

    /// Number of block hashes computed so far.
    pub fn hash_invocations(&self) -> u64 {
        self.hash_invocations.load(Ordering::Relaxed)
    }

    /// Hash one block with the salted initial state. A short buffer is
    /// treated as if it were padded with zeros to the block size.
    pub(crate) fn hash_block(&self, data: &[u8]) -> Digest {
        self.hash_invocations.fetch_add(1, Ordering::Relaxed);

        let mut state = self.hash_state.clone();
        state.update(data);
        state.update_zeros(self.geometry.block_size().saturating_sub(data.len()));
        state.finish()
    }
}

impl fmt::Debug for VerityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerityInfo")
            .field("hash_alg", &self.hash_alg.name())
            .field("geometry", &self.geometry)
            .field("data_size", &NumBytes(self.data_size))
            .field("metadata_end", &NumBytes(self.metadata_end))
            .field("root_hash", &self.root_hash)
            .field("measurement", &self.measurement)
            .finish_non_exhaustive()
    }
}

/// Locate the footer in the metadata stream ending at `metadata_end` and read
/// out the descriptor bytes it points to.
pub fn read_descriptor<H: VerityHost + ?Sized>(host: &H, metadata_end: u64) -> Result<Vec<u8>> {
    let page_shift = host.page_shift();
    let page_size = 1u64 << page_shift;
    let page_mask = page_size - 1;

    if metadata_end == 0 {
        warn!("No verity metadata found");
        return Err(descriptor::Error::FooterNotFound.into());
    }

    let last_index = (metadata_end - 1) >> page_shift;
    let last_valid = ((metadata_end - 1) & page_mask) as usize + 1;
    let last_page = host.read_metadata_page(last_index)?;
    let last_data = last_page.data().get(..last_valid).ok_or_else(short_page)?;

    let location =
        descriptor::locate_descriptor(last_data, last_index << page_shift, page_shift)?;
    debug!("Descriptor location: {location:?}");

    let mut buf = Vec::with_capacity(location.len);
    let mut offset = location.start;
    let end = location.start + location.len as u64;

    while offset < end {
        let index = offset >> page_shift;
        let page = if index == last_index {
            last_page.clone()
        } else {
            host.read_metadata_page(index)?
        };

        let in_page = (offset & page_mask) as usize;
        let n = (page_size - (offset & page_mask)).min(end - offset) as usize;
        let data = page.data().get(in_page..in_page + n).ok_or_else(short_page)?;
        buf.extend_from_slice(data);

        offset += n as u64;
    }

    Ok(buf)
}

fn short_page() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Metadata page is shorter than the page size",
    ))
}

/// Build the verification state for a file. When `enabling` is set, the
/// metadata is expected to end exactly at the current end of the stream.
/// Otherwise, the host is asked where it ends.
pub fn create_verity_info<H: VerityHost + ?Sized>(
    host: &H,
    enabling: bool,
    ctx: &VerityContext,
) -> Result<VerityInfo> {
    let stream_size = host.stream_size()?;
    let metadata_end = if enabling {
        stream_size
    } else {
        host.get_metadata_end()?
    };

    let buf = read_descriptor(host, metadata_end)?;
    let desc = descriptor::parse(&buf, host.page_shift())?;
    debug!("{desc:?}");

    if desc.data_size > stream_size {
        warn!(
            "Original file size {} exceeds stream size {stream_size}",
            desc.data_size,
        );
        return Err(Error::BadDataSize {
            data_size: desc.data_size,
            stream_size,
        });
    }

    let geometry = TreeGeometry::new(desc.data_size, desc.block_bits, desc.log_arity)
        .inspect_err(|e| warn!("{e}"))?;
    debug!("{geometry:?}");

    let measurement = measurement::verify_file_measurement(
        &desc,
        &buf[..desc.auth_len],
        ctx.config(),
        ctx.verifier(),
    )?;

    Ok(VerityInfo {
        hash_alg: desc.hash_alg,
        geometry,
        hash_state: desc.hash_state,
        data_size: desc.data_size,
        metadata_end,
        root_hash: desc.root_hash,
        measurement,
        hash_invocations: AtomicU64::new(0),
    })
}

/// Measurement as reported to callers of [`VerityInode::measure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeasuredDigest {
    pub algorithm: u16,
    pub digest_size: u16,
    pub digest: Digest,
}

/// A file as seen by the host filesystem, with its lazily built verification
/// state.
pub struct VerityInode<H> {
    host: H,
    ctx: Arc<VerityContext>,
    info: OnceLock<Arc<VerityInfo>>,
    setup_lock: Mutex<()>,
}

impl<H: VerityHost> VerityInode<H> {
    pub fn new(host: H, ctx: Arc<VerityContext>) -> Self {
        Self {
            host,
            ctx,
            info: OnceLock::new(),
            setup_lock: Mutex::new(()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// The installed verification state, if setup has happened.
    pub fn info(&self) -> Option<&Arc<VerityInfo>> {
        self.info.get()
    }

    /// Publish `info` unless another thread got there first, in which case
    /// the new copy is dropped.
    fn install(&self, info: VerityInfo) -> &Arc<VerityInfo> {
        self.info.get_or_init(|| Arc::new(info))
    }

    fn ensure_info(&self) -> Result<&Arc<VerityInfo>> {
        if let Some(info) = self.info.get() {
            return Ok(info);
        }

        let _guard = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(info) = self.info.get() {
            return Ok(info);
        }

        let info = create_verity_info(&self.host, false, &self.ctx)?;
        Ok(self.install(info))
    }

    /// Called when the file is opened. Verity files can only be opened
    /// read-only.
    pub fn file_open(&self, writable: bool) -> Result<()> {
        if !self.host.is_verity() {
            return Ok(());
        }

        if writable {
            debug!(ino = self.host.ino(), "Denying opening verity file for writing");
            return Err(Error::PermissionDenied);
        }

        self.ensure_info().map(|_| ())
    }

    /// Called before attributes change. Verity files cannot change size.
    pub fn prepare_setattr(&self, size_change: bool) -> Result<()> {
        if self.host.is_verity() && size_change {
            debug!(ino = self.host.ino(), "Denying truncate of verity file");
            return Err(Error::PermissionDenied);
        }

        Ok(())
    }

    /// Called before attributes are read so that the reported size is the
    /// logical size.
    pub fn prepare_getattr(&self) -> Result<()> {
        if self.host.is_verity() {
            self.ensure_info()?;
        }

        Ok(())
    }

    /// Drop the verification state when the file is evicted.
    pub fn cleanup(&mut self) {
        self.info.take();
    }

    /// Externally visible size of the file.
    pub fn size(&self) -> io::Result<u64> {
        match self.info.get() {
            Some(info) => Ok(info.data_size()),
            None => self.host.stream_size(),
        }
    }

    /// Size including the verity metadata, for hosts that store the metadata
    /// past the nominal end of the file.
    pub fn full_logical_size(&self) -> io::Result<u64> {
        match self.info.get() {
            Some(info) => Ok(info.metadata_end()),
            None => self.host.stream_size(),
        }
    }

    /// Enable verity on a file whose stream already ends with the tree,
    /// descriptor and footer.
    pub fn enable(&self) -> Result<Arc<VerityInfo>> {
        let _guard = self.setup_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.host.is_verity() || self.info.get().is_some() {
            return Err(Error::AlreadyEnabled);
        }

        let info = create_verity_info(&self.host, true, &self.ctx)?;
        self.host.set_verity(info.data_size())?;

        // Pages read while building the info were never checked and the
        // stream now has a different logical layout.
        self.host.invalidate_pages();

        debug!(ino = self.host.ino(), "Enabled verity: {info:?}");

        Ok(self.install(info).clone())
    }

    /// Report the file measurement.
    pub fn measure(&self) -> Result<MeasuredDigest> {
        if !self.host.is_verity() {
            return Err(Error::NotEnabled);
        }

        let info = self.ensure_info()?;
        let digest = *info.measurement();

        Ok(MeasuredDigest {
            algorithm: info.hash_alg().id(),
            digest_size: digest.len() as u16,
            digest,
        })
    }

    /// Verify one data page. Files without verity always pass. Failure to set
    /// up the verification state fails the page.
    pub fn verify_page(&self, index: u64, data: &[u8]) -> bool {
        if !self.host.is_verity() {
            return true;
        }

        match self.ensure_info() {
            Ok(info) => verify::verify_page(&self.host, info, index, data),
            Err(e) => {
                warn!(ino = self.host.ino(), "Failed to set up verity: {e}");
                false
            }
        }
    }

    /// Verify every page of a completed read. Returns whether all pages are
    /// valid.
    pub fn verify_pages(&self, pages: &mut [ReadPage<'_>]) -> bool {
        if !self.host.is_verity() {
            return pages.iter().all(|p| !p.error);
        }

        match self.ensure_info() {
            Ok(info) => verify::verify_pages(&self.host, info, pages),
            Err(e) => {
                warn!(ino = self.host.ino(), "Failed to set up verity: {e}");
                for page in pages {
                    page.error = true;
                }
                false
            }
        }
    }

    /// Check a page that the host has no backing data for. Holes are only
    /// valid if the tree says the page is all zeros.
    pub fn check_hole(&self, index: u64) -> bool {
        match self.info.get() {
            Some(info) => verify::verify_page(&self.host, info, index, &[]),
            None => true,
        }
    }
}

impl<H> fmt::Debug for VerityInode<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerityInode")
            .field("info", &self.info.get())
            .finish_non_exhaustive()
    }
}
