// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    config::VerityConfig,
    format::descriptor::Descriptor,
    hash::{self, Digest, HashAlgorithm},
    signature::{self, SignatureVerifier, SignedDigest},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to compute measurement")]
    Hash(#[from] hash::Error),
    #[error("Signature is required, but file is not signed")]
    SignatureRequired,
    #[error("Failed to verify signature")]
    Signature(#[from] signature::Error),
    #[error("Signed measurement uses {signed}, but file uses {file}")]
    AlgorithmMismatch {
        signed: &'static str,
        file: &'static str,
    },
    #[error("Signed measurement does not match: want {expected}, real {actual}")]
    SignedMismatch { expected: String, actual: String },
}

impl Error {
    /// Whether the failure is due to missing support rather than a bad file.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Hash(_) | Self::Signature(signature::Error::Unsupported),
        )
    }
}

type Result<T> = std::result::Result<T, Error>;

/// The file's cryptographic identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub digest: Digest,
    /// Whether the digest was vouched for by a trusted signature.
    pub signed: bool,
}

/// Hash the authenticated portion of the descriptor.
pub fn compute_measurement(hash_alg: &HashAlgorithm, auth_bytes: &[u8]) -> Result<Digest> {
    Ok(hash_alg.transform()?.digest(auth_bytes))
}

/// Compute the measurement of a parsed descriptor and check it against the
/// descriptor's signature, if any. `auth_bytes` must be the first
/// [`Descriptor::auth_len`] bytes of the descriptor buffer.
pub fn verify_file_measurement(
    desc: &Descriptor,
    auth_bytes: &[u8],
    config: &VerityConfig,
    verifier: &dyn SignatureVerifier,
) -> Result<Measurement> {
    let hash_alg = desc.hash_alg;
    let digest = compute_measurement(hash_alg, auth_bytes)?;

    let Some(sig) = &desc.signature else {
        if config.require_signatures {
            warn!("require_signatures=1, rejecting unsigned file!");
            return Err(Error::SignatureRequired);
        }

        debug!("Computed file measurement: {}", hash_alg.display(&digest));
        return Ok(Measurement {
            digest,
            signed: false,
        });
    };

    let payload = verifier.verify_signed_blob(sig)?;
    let signed = SignedDigest::parse(&payload)?;

    if signed.hash_alg.id() != hash_alg.id() {
        warn!(
            "Signed file measurement uses {}, but file uses {}",
            signed.hash_alg.name(),
            hash_alg.name(),
        );
        return Err(Error::AlgorithmMismatch {
            signed: signed.hash_alg.name(),
            file: hash_alg.name(),
        });
    }

    if signed.digest != digest {
        let expected = hash_alg.display(&signed.digest).to_string();
        let actual = hash_alg.display(&digest).to_string();
        error!(
            "FILE CORRUPTED (actual measurement mismatches signed one): \
             want {expected}, real {actual} (used desc_auth_len {})",
            auth_bytes.len(),
        );
        return Err(Error::SignedMismatch { expected, actual });
    }

    debug!("Verified file measurement: {}", hash_alg.display(&digest));

    Ok(Measurement {
        digest,
        signed: true,
    })
}
