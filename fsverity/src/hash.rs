// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Registry of the hash algorithms that may appear in a verity descriptor.
//!
//! Each algorithm has a fixed numeric identifier on disk. The implementation
//! for an algorithm is only materialized the first time a file using it is
//! set up, after which it is shared by every file.

use std::{fmt, sync::OnceLock};

use ring::digest::{self, Context};
use thiserror::Error;
use tracing::error;

use crate::util;

/// Largest digest produced by any supported algorithm.
pub const MAX_DIGEST_SIZE: usize = 64;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(u16),
    #[error("Hash algorithm {name:?} produces {actual}-byte digests, but {expected} bytes are expected")]
    DigestSizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Hash algorithm {name:?} has invalid digest size: {size}")]
    InvalidDigestSize { name: &'static str, size: usize },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug)]
enum Implementation {
    Ring(&'static digest::Algorithm),
    /// CRC-32C (Castagnoli), emitted as 4 little-endian bytes.
    Crc32c,
}

/// A digest of up to [`MAX_DIGEST_SIZE`] bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest {
    data: [u8; MAX_DIGEST_SIZE],
    len: u8,
}

impl Digest {
    /// Copy a digest out of `data`. Returns [`None`] if `data` is too large.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DIGEST_SIZE {
            return None;
        }

        Some(Self::from_output(data))
    }

    fn from_output(data: &[u8]) -> Self {
        let len = data.len().min(MAX_DIGEST_SIZE);
        let mut result = Self {
            data: [0u8; MAX_DIGEST_SIZE],
            len: len as u8,
        };
        result.data[..len].copy_from_slice(&data[..len]);

        result
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest")
            .field(&hex::encode(self))
            .finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self))
    }
}

/// An in-progress hash computation. Cloning a state that has already absorbed
/// a salt is how every block hash starts.
#[derive(Clone)]
pub enum HashState {
    Ring(Context),
    Crc32c(u32),
}

impl HashState {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Ring(context) => context.update(data),
            Self::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
        }
    }

    /// Feed `len` zero bytes into the state.
    pub fn update_zeros(&mut self, mut len: usize) {
        while len > 0 {
            let n = len.min(util::ZEROS.len());
            self.update(&util::ZEROS[..n]);
            len -= n;
        }
    }

    pub fn finish(self) -> Digest {
        match self {
            Self::Ring(context) => Digest::from_output(context.finish().as_ref()),
            Self::Crc32c(crc) => Digest::from_output(&crc.to_le_bytes()),
        }
    }
}

impl fmt::Debug for HashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ring(context) => f
                .debug_tuple("Ring")
                .field(context.algorithm())
                .finish(),
            Self::Crc32c(crc) => f.debug_tuple("Crc32c").field(crc).finish(),
        }
    }
}

/// Materialized implementation of an algorithm. The digest size has been
/// checked against the registry table.
#[derive(Debug)]
pub struct HashTransform {
    implementation: Implementation,
    digest_size: usize,
}

impl HashTransform {
    fn new(name: &'static str, implementation: Implementation, expected: usize) -> Result<Self> {
        let transform = Self {
            implementation,
            digest_size: expected,
        };

        let actual = transform.new_state().finish().len();
        if actual != expected {
            return Err(Error::DigestSizeMismatch {
                name,
                expected,
                actual,
            });
        }

        Ok(transform)
    }

    /// Create an empty, unsalted hash state.
    pub fn new_state(&self) -> HashState {
        match self.implementation {
            Implementation::Ring(algorithm) => HashState::Ring(Context::new(algorithm)),
            Implementation::Crc32c => HashState::Crc32c(0),
        }
    }

    /// Create a hash state that has already absorbed `salt`.
    pub fn salted_state(&self, salt: &[u8]) -> HashState {
        let mut state = self.new_state();
        state.update(salt);
        state
    }

    /// Compute an unsalted one-shot digest.
    pub fn digest(&self, data: &[u8]) -> Digest {
        let mut state = self.new_state();
        state.update(data);
        state.finish()
    }

    pub fn digest_size(&self) -> usize {
        self.digest_size
    }
}

pub struct HashAlgorithm {
    id: u16,
    name: &'static str,
    digest_size: usize,
    cryptographic: bool,
    implementation: Implementation,
    transform: OnceLock<Result<HashTransform>>,
}

impl HashAlgorithm {
    const fn new(
        id: u16,
        name: &'static str,
        digest_size: usize,
        cryptographic: bool,
        implementation: Implementation,
    ) -> Self {
        Self {
            id,
            name,
            digest_size,
            cryptographic,
            implementation,
            transform: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn digest_size(&self) -> usize {
        self.digest_size
    }

    /// Whether the algorithm is collision resistant. Only cryptographic
    /// algorithms may be used for signed files.
    pub fn is_cryptographic(&self) -> bool {
        self.cryptographic
    }

    /// Get the implementation, constructing it on first use. If multiple
    /// threads race, one construction wins and the rest are discarded. A
    /// construction failure is sticky: every later call reports the same
    /// error without rebuilding.
    pub fn transform(&self) -> Result<&HashTransform> {
        let result = match self.transform.get() {
            Some(r) => r,
            None => {
                let built = HashTransform::new(self.name, self.implementation, self.digest_size);
                if let Err(e) = &built {
                    error!("Hash algorithm {:?} is unusable: {e}", self.name);
                }

                self.transform.get_or_init(|| built)
            }
        };

        result.as_ref().map_err(Clone::clone)
    }

    /// Format a digest as `<name>:<hex>` for diagnostics.
    pub fn display<'a>(&'a self, digest: &'a Digest) -> impl fmt::Display + 'a {
        DisplayDigest { alg: self, digest }
    }
}

impl fmt::Debug for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashAlgorithm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("digest_size", &self.digest_size)
            .field("cryptographic", &self.cryptographic)
            .finish_non_exhaustive()
    }
}

struct DisplayDigest<'a> {
    alg: &'a HashAlgorithm,
    digest: &'a Digest,
}

impl fmt::Display for DisplayDigest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alg.name, self.digest)
    }
}

static SHA256: HashAlgorithm =
    HashAlgorithm::new(1, "sha256", 32, true, Implementation::Ring(&digest::SHA256));
static SHA512: HashAlgorithm =
    HashAlgorithm::new(2, "sha512", 64, true, Implementation::Ring(&digest::SHA512));
static CRC32C: HashAlgorithm = HashAlgorithm::new(3, "crc32c", 4, false, Implementation::Crc32c);

/// Indexed by algorithm identifier. Slot 0 is never valid.
static HASH_ALGS: [Option<&HashAlgorithm>; 4] = [None, Some(&SHA256), Some(&SHA512), Some(&CRC32C)];

/// Iterate over every registered algorithm.
pub fn algorithms() -> impl Iterator<Item = &'static HashAlgorithm> {
    HASH_ALGS.iter().flatten().copied()
}

/// Look up an algorithm by identifier and make sure its implementation is
/// usable.
pub fn get_hash_alg(id: u16) -> Result<&'static HashAlgorithm> {
    let alg = HASH_ALGS
        .get(usize::from(id))
        .copied()
        .flatten()
        .ok_or(Error::UnknownAlgorithm(id))?;

    alg.transform()?;

    Ok(alg)
}

/// Look up an algorithm by name, eg. `sha256`.
pub fn get_hash_alg_by_name(name: &str) -> Option<&'static HashAlgorithm> {
    algorithms().find(|a| a.name == name)
}

/// Validate the static table and build every implementation. Every digest
/// size must be a power of two no larger than [`MAX_DIGEST_SIZE`] so that it
/// evenly divides a tree block. This is meant to run once at startup so that a
/// broken implementation is reported before any file is opened.
pub fn check_hash_algs() -> Result<()> {
    for (i, alg) in HASH_ALGS.iter().enumerate() {
        let Some(alg) = alg else {
            continue;
        };

        debug_assert_eq!(usize::from(alg.id), i, "Hash algorithm table is out of order");

        if alg.digest_size == 0
            || alg.digest_size > MAX_DIGEST_SIZE
            || !alg.digest_size.is_power_of_two()
        {
            return Err(Error::InvalidDigestSize {
                name: alg.name,
                size: alg.digest_size,
            });
        }

        alg.transform()?;
    }

    Ok(())
}
