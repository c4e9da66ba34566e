// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::padding::{self, ZeroPadding},
    hash::{self, Digest, HashAlgorithm, HashState},
    util::{self, NumBytes},
};

/// Magic value for [`RawDescriptor::magic`] and [`RawFooter::magic`].
pub const VERITY_MAGIC: [u8; 8] = *b"FSVerity";

/// Supported major version.
pub const MAJOR_VERSION: u8 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u8 = 0;

/// Size of the fixed portion of the descriptor.
pub const DESCRIPTOR_SIZE: usize = mem::size_of::<RawDescriptor>();
/// Size of the footer that points back to the descriptor.
pub const FOOTER_SIZE: usize = mem::size_of::<RawFooter>();
/// Size of an extension header.
pub const EXTENSION_HEADER_SIZE: usize = mem::size_of::<RawExtension>();

/// The descriptor may not span more pages than this.
pub const MAX_DESCRIPTOR_PAGES: u64 = 16;

/// Extension type for the Merkle tree root hash. Authenticated.
pub const EXT_ROOT_HASH: u16 = 1;
/// Extension type for the salt. Authenticated.
pub const EXT_SALT: u16 = 2;
/// Extension type for a detached PKCS#7 signature of the measurement.
/// Unauthenticated.
pub const EXT_PKCS7_SIGNATURE: u16 = 3;

#[derive(Debug, Error)]
pub enum Error {
    // Footer errors.
    #[error("No verity metadata found")]
    FooterNotFound,
    #[error("Unexpected descriptor reverse offset: {0}")]
    InvalidReverseOffset(u32),
    #[error("Descriptor is misaligned: start={0}")]
    MisalignedDescriptor(u64),
    #[error("Descriptor is too long: {0} pages")]
    DescriptorTooLong(u64),
    // Header errors.
    #[error("Descriptor is too small: {0} < {DESCRIPTOR_SIZE}")]
    DescriptorTooSmall(usize),
    #[error("Invalid magic: {:?}", .0.as_bstr())]
    InvalidMagic([u8; 8]),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u8),
    #[error("Unsupported minor version: {0}")]
    UnsupportedMinorVersion(u8),
    #[error("Data ({data}) and tree ({tree}) hash algorithms differ")]
    MixedHashAlgorithms { data: u16, tree: u16 },
    #[error("Unsupported hash algorithm")]
    UnsupportedHashAlgorithm(#[from] hash::Error),
    #[error("Unsupported log2 block size {log_block_size}; must equal page shift {page_shift}")]
    UnsupportedBlockSize { log_block_size: u8, page_shift: u8 },
    #[error("Data ({data}) and tree ({tree}) log2 block sizes differ")]
    MixedBlockSizes { data: u8, tree: u8 },
    #[error("Hashes per block ({0}) is not a power of 2")]
    InvalidArity(usize),
    #[error("Unsupported flags: {0:#x}")]
    UnsupportedFlags(u32),
    #[error("Reserved bits set in descriptor")]
    ReservedFieldsNotZero,
    #[error("Original file size is 0; this is unsupported")]
    EmptyFile,
    #[error("Root hash was not found")]
    MissingRootHash,
    // Extension errors.
    #[error("Extension list overflows buffer")]
    ExtensionListOverflow,
    #[error("Unknown extension type: {0}")]
    UnknownExtensionType(u16),
    #[error("Extension type {ext_type} is in the wrong list (authenticated type: {authenticated})")]
    WrongExtensionList { ext_type: u16, authenticated: bool },
    #[error("Reserved bits set in extension header")]
    ExtensionReservedNotZero,
    #[error("Invalid length in extension header: {0}")]
    InvalidExtensionLength(u32),
    #[error("Extension item overflows buffer")]
    ExtensionOverflow,
    #[error("Multiple root hashes were found")]
    DuplicateRootHash,
    #[error("Wrong root hash size for {name}: {actual} != {expected}")]
    InvalidRootHashSize {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Multiple salts were found")]
    DuplicateSalt,
    #[error("Multiple PKCS#7 signatures were found")]
    DuplicateSignature,
    #[error("Found signed {0} file measurement, but {0} is not a cryptographic hash algorithm")]
    SignedNonCryptographic(&'static str),
    #[error("File is signed, but signature support is not enabled")]
    SignaturesUnsupported,
}

impl Error {
    /// Whether the error is a configuration-level failure rather than a
    /// structural problem with the metadata.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedHashAlgorithm(_) | Self::SignaturesUnsupported)
    }

    /// Whether the error means the file's authenticity is in question.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::SignedNonCryptographic(_))
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the fixed portion of the descriptor.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawDescriptor {
    /// Magic value. This should be equal to [`VERITY_MAGIC`].
    magic: [u8; 8],
    /// Major version. Must be [`MAJOR_VERSION`].
    major_version: u8,
    /// Minor version. Must be [`MINOR_VERSION`].
    minor_version: u8,
    /// log2 of the data block size.
    log_data_blocksize: u8,
    /// log2 of the tree block size.
    log_tree_blocksize: u8,
    /// Hash algorithm used for data blocks.
    data_algorithm: little_endian::U16,
    /// Hash algorithm used for tree blocks.
    tree_algorithm: little_endian::U16,
    /// No flags are currently defined.
    flags: little_endian::U32,
    reserved1: little_endian::U32,
    /// Size of the file before the verity metadata was appended.
    orig_file_size: little_endian::U64,
    /// Number of authenticated extensions following this header.
    auth_ext_count: little_endian::U16,
    reserved2: [u8; 30],
}

impl fmt::Debug for RawDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDescriptor")
            .field("magic", &self.magic.as_bstr())
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("log_data_blocksize", &self.log_data_blocksize)
            .field("log_tree_blocksize", &self.log_tree_blocksize)
            .field("data_algorithm", &self.data_algorithm.get())
            .field("tree_algorithm", &self.tree_algorithm.get())
            .field("flags", &format_args!("{:#x}", self.flags.get()))
            .field("reserved1", &self.reserved1.get())
            .field("orig_file_size", &self.orig_file_size.get())
            .field("auth_ext_count", &self.auth_ext_count.get())
            .field("reserved2", &hex::encode(self.reserved2))
            .finish()
    }
}

impl RawDescriptor {
    /// Check the fixed fields. Returns the selected hash algorithm and the
    /// log2 of the number of digests per tree block.
    fn validate(&self, page_shift: u8) -> Result<(&'static HashAlgorithm, u8)> {
        if self.magic != VERITY_MAGIC {
            return Err(Error::InvalidMagic(self.magic));
        }

        if self.major_version != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version));
        }

        if self.minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion(self.minor_version));
        }

        let data_alg = self.data_algorithm.get();
        let tree_alg = self.tree_algorithm.get();
        if data_alg != tree_alg {
            return Err(Error::MixedHashAlgorithms {
                data: data_alg,
                tree: tree_alg,
            });
        }

        let hash_alg = hash::get_hash_alg(data_alg)?;

        if self.log_data_blocksize != page_shift {
            return Err(Error::UnsupportedBlockSize {
                log_block_size: self.log_data_blocksize,
                page_shift,
            });
        }

        if self.log_tree_blocksize != self.log_data_blocksize {
            return Err(Error::MixedBlockSizes {
                data: self.log_data_blocksize,
                tree: self.log_tree_blocksize,
            });
        }

        let block_size = 1usize
            .checked_shl(u32::from(self.log_data_blocksize))
            .unwrap_or(0);
        let hashes_per_block = block_size / hash_alg.digest_size();
        if !hashes_per_block.is_power_of_two() {
            return Err(Error::InvalidArity(hashes_per_block));
        }

        if self.flags.get() != 0 {
            return Err(Error::UnsupportedFlags(self.flags.get()));
        }

        if self.reserved1.get() != 0 || !util::is_zero(&self.reserved2) {
            return Err(Error::ReservedFieldsNotZero);
        }

        if self.orig_file_size.get() == 0 {
            return Err(Error::EmptyFile);
        }

        Ok((hash_alg, hashes_per_block.trailing_zeros() as u8))
    }
}

/// Raw on-disk layout for an extension header. The payload follows and the
/// whole item is padded to a multiple of 8 bytes.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawExtension {
    /// Length of the header plus payload, excluding padding.
    length: little_endian::U32,
    ext_type: little_endian::U16,
    reserved: little_endian::U16,
}

impl fmt::Debug for RawExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawExtension")
            .field("length", &self.length.get())
            .field("ext_type", &self.ext_type.get())
            .field("reserved", &self.reserved.get())
            .finish()
    }
}

/// Raw on-disk layout for the footer at the end of the metadata.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawFooter {
    /// Distance from the start of the descriptor to the end of the footer.
    desc_reverse_offset: little_endian::U32,
    /// Magic value. This should be equal to [`VERITY_MAGIC`].
    magic: [u8; 8],
}

/// Location of the descriptor, as found via the footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorLocation {
    /// Byte offset of the descriptor in the metadata stream.
    pub start: u64,
    /// Length of the descriptor buffer, including all extensions.
    pub len: usize,
}

/// Find the footer given the valid bytes of the last metadata page, which
/// begins at `last_page_offset`. Trailing zeros after the footer are skipped.
pub fn locate_descriptor(
    last_page: &[u8],
    last_page_offset: u64,
    page_shift: u8,
) -> Result<DescriptorLocation> {
    let trimmed = last_page.trim_end_padding();
    if trimmed.len() < FOOTER_SIZE {
        warn!("No verity metadata found");
        return Err(Error::FooterNotFound);
    }

    let footer_start = trimmed.len() - FOOTER_SIZE;
    let footer = RawFooter::ref_from_bytes(&trimmed[footer_start..])
        .map_err(|_| Error::FooterNotFound)?;
    if footer.magic != VERITY_MAGIC {
        warn!("No verity metadata found");
        return Err(Error::FooterNotFound);
    }

    // Metadata end, ignoring any padding after the footer.
    let metadata_end = last_page_offset + trimmed.len() as u64;

    let reverse_offset = footer.desc_reverse_offset.get();
    if (reverse_offset as usize) < DESCRIPTOR_SIZE + FOOTER_SIZE
        || u64::from(reverse_offset) > metadata_end
    {
        warn!("Unexpected desc_reverse_offset: {reverse_offset}");
        return Err(Error::InvalidReverseOffset(reverse_offset));
    }

    let start = metadata_end - u64::from(reverse_offset);
    if start % 8 != 0 {
        warn!("Descriptor is misaligned: desc_start={start}");
        return Err(Error::MisalignedDescriptor(start));
    }

    let first_page = start >> page_shift;
    let last_page_index = last_page_offset >> page_shift;
    if last_page_index - first_page >= MAX_DESCRIPTOR_PAGES {
        let pages = last_page_index - first_page + 1;
        warn!("Descriptor is too long: {pages} pages");
        return Err(Error::DescriptorTooLong(pages));
    }

    Ok(DescriptorLocation {
        start,
        len: reverse_offset as usize - mem::size_of::<u32>(),
    })
}

/// Everything extracted from a valid descriptor.
#[derive(Clone)]
pub struct Descriptor {
    pub hash_alg: &'static HashAlgorithm,
    pub block_bits: u8,
    pub log_arity: u8,
    pub data_size: u64,
    pub root_hash: Digest,
    pub salt: Option<Vec<u8>>,
    /// Initial hash state with the salt already absorbed.
    pub hash_state: HashState,
    /// Unverified PKCS#7 signature of the measurement.
    pub signature: Option<Vec<u8>>,
    /// Length of the fixed header plus the authenticated extensions. The
    /// measurement covers exactly these bytes.
    pub auth_len: usize,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("hash_alg", &self.hash_alg.name())
            .field("block_bits", &self.block_bits)
            .field("log_arity", &self.log_arity)
            .field("data_size", &NumBytes(self.data_size))
            .field("root_hash", &self.root_hash)
            .field("salt", &self.salt.as_ref().map(hex::encode))
            .field("signature", &self.signature.as_ref().map(|s| NumBytes(s.len())))
            .field("auth_len", &self.auth_len)
            .finish_non_exhaustive()
    }
}

/// Extension values collected while walking the lists.
#[derive(Default)]
struct Extensions {
    root_hash: Option<Digest>,
    salt: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
}

impl Extensions {
    fn add(&mut self, hash_alg: &HashAlgorithm, ext_type: u16, payload: &[u8]) -> Result<()> {
        match ext_type {
            EXT_ROOT_HASH => {
                if self.root_hash.is_some() {
                    warn!("Multiple root hashes were found");
                    return Err(Error::DuplicateRootHash);
                }

                if payload.len() != hash_alg.digest_size() {
                    warn!(
                        "Wrong root hash size; got {} bytes, but expected {} for hash algorithm {}",
                        payload.len(),
                        hash_alg.digest_size(),
                        hash_alg.name(),
                    );
                    return Err(Error::InvalidRootHashSize {
                        name: hash_alg.name(),
                        expected: hash_alg.digest_size(),
                        actual: payload.len(),
                    });
                }

                let digest = Digest::from_slice(payload).ok_or(Error::InvalidRootHashSize {
                    name: hash_alg.name(),
                    expected: hash_alg.digest_size(),
                    actual: payload.len(),
                })?;
                debug!("Root hash: {}", hash_alg.display(&digest));

                self.root_hash = Some(digest);
            }
            EXT_SALT => {
                if self.salt.is_some() {
                    warn!("Multiple salts were found");
                    return Err(Error::DuplicateSalt);
                }

                self.salt = Some(payload.to_vec());
            }
            EXT_PKCS7_SIGNATURE => {
                if self.signature.is_some() {
                    warn!("Found multiple PKCS#7 signatures");
                    return Err(Error::DuplicateSignature);
                }

                if !cfg!(feature = "signatures") {
                    warn!("File is signed, but signature support is not enabled");
                    return Err(Error::SignaturesUnsupported);
                }

                if !hash_alg.is_cryptographic() {
                    warn!(
                        "Found signed {0} file measurement, but {0} isn't a cryptographic hash algorithm",
                        hash_alg.name(),
                    );
                    return Err(Error::SignedNonCryptographic(hash_alg.name()));
                }

                self.signature = Some(payload.to_vec());
            }
            // Filtered out by is_authenticated().
            t => return Err(Error::UnknownExtensionType(t)),
        }

        Ok(())
    }
}

/// Returns whether the extension type belongs in the authenticated list, or
/// [`None`] if the type is unknown.
fn is_authenticated(ext_type: u16) -> Option<bool> {
    match ext_type {
        EXT_ROOT_HASH | EXT_SALT => Some(true),
        EXT_PKCS7_SIGNATURE => Some(false),
        _ => None,
    }
}

/// Parse `count` extensions starting at `offset`. Returns the offset just
/// past the last extension.
fn parse_extensions(
    buf: &[u8],
    mut offset: usize,
    count: u16,
    authenticated: bool,
    hash_alg: &HashAlgorithm,
    exts: &mut Extensions,
) -> Result<usize> {
    for _ in 0..count {
        let Ok((header, _)) = RawExtension::ref_from_prefix(&buf[offset..]) else {
            warn!("Extension list overflows buffer");
            return Err(Error::ExtensionListOverflow);
        };

        let ext_type = header.ext_type.get();
        let Some(type_authenticated) = is_authenticated(ext_type) else {
            warn!("Unknown extension type: {ext_type}");
            return Err(Error::UnknownExtensionType(ext_type));
        };

        if type_authenticated != authenticated {
            warn!(
                "Extension type {ext_type} must be {}authenticated",
                if type_authenticated { "" } else { "un" },
            );
            return Err(Error::WrongExtensionList {
                ext_type,
                authenticated: type_authenticated,
            });
        }

        if header.reserved.get() != 0 {
            warn!("Reserved bits set in extension header");
            return Err(Error::ExtensionReservedNotZero);
        }

        let len = header.length.get();
        if (len as usize) < EXTENSION_HEADER_SIZE {
            warn!("Invalid length in extension header: {len}");
            return Err(Error::InvalidExtensionLength(len));
        }

        let remain = buf.len() - offset;
        let rounded_len = padding::round(u64::from(len), 8).unwrap_or(u64::MAX);
        if rounded_len > remain as u64 {
            warn!("Extension item overflows buffer");
            return Err(Error::ExtensionOverflow);
        }

        let payload = &buf[offset + EXTENSION_HEADER_SIZE..offset + len as usize];
        exts.add(hash_alg, ext_type, payload)?;

        offset += rounded_len as usize;
    }

    Ok(offset)
}

/// Parse a descriptor buffer, including its extension lists. `page_shift` is
/// the only supported log2 block size.
pub fn parse(buf: &[u8], page_shift: u8) -> Result<Descriptor> {
    let Ok((raw, _)) = RawDescriptor::ref_from_prefix(buf) else {
        warn!("Descriptor is too small: {} bytes", buf.len());
        return Err(Error::DescriptorTooSmall(buf.len()));
    };
    debug!("{raw:?}");

    let (hash_alg, log_arity) = raw.validate(page_shift).inspect_err(|e| warn!("{e}"))?;

    let mut exts = Extensions::default();

    let auth_len = parse_extensions(
        buf,
        DESCRIPTOR_SIZE,
        raw.auth_ext_count.get(),
        true,
        hash_alg,
        &mut exts,
    )?;

    // Unauthenticated extensions are optional. An attacker can change these
    // freely, so only signatures are accepted here.
    if buf.len() - auth_len >= 8 {
        let count = u16::from_le_bytes([buf[auth_len], buf[auth_len + 1]]);
        parse_extensions(buf, auth_len + 8, count, false, hash_alg, &mut exts)?;
    }

    let Some(root_hash) = exts.root_hash else {
        warn!("Root hash wasn't found");
        return Err(Error::MissingRootHash);
    };

    // An absent salt still produces a usable (empty) salted state.
    let hash_state = hash_alg
        .transform()?
        .salted_state(exts.salt.as_deref().unwrap_or_default());

    Ok(Descriptor {
        hash_alg,
        block_bits: raw.log_data_blocksize,
        log_arity,
        data_size: raw.orig_file_size.get(),
        root_hash,
        salt: exts.salt,
        hash_state,
        signature: exts.signature,
        auth_len,
    })
}
