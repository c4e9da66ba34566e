// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of the optional built-in signature of a file's measurement.
//!
//! The signature extension holds a CMS (PKCS#7) `SignedData` message whose
//! embedded content is a [`SignedDigest`]. The message must be signed by a
//! trusted certificate, or by a certificate that a trusted certificate issued.

use std::fmt;

use thiserror::Error;
use tracing::warn;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::hash::{self, Digest, HashAlgorithm};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File is signed, but signature support is not enabled")]
    Unsupported,
    #[error("Signed file measurement has unrecognized format ({0} bytes)")]
    UnrecognizedPayload(usize),
    #[error("Signed file measurement uses unknown hash algorithm")]
    UnknownHashAlgorithm(#[from] hash::Error),
    #[error("Wrong digest size in signed measurement: wanted {expected} for algorithm {name}, but got {actual}")]
    WrongDigestSize {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Signed file measurement is truncated")]
    TruncatedPayload,
    #[error("Failed to parse CMS signature")]
    CmsParse(#[source] x509_cert::der::Error),
    #[error("CMS content type is not SignedData: {0}")]
    NotSignedData(const_oid::ObjectIdentifier),
    #[error("CMS signature has no embedded content")]
    DetachedContent,
    #[error("CMS signature has no signers")]
    NoSigners,
    #[error("Signer is not identified by issuer and serial number")]
    UnsupportedSignerIdentifier,
    #[error("Signer certificate was not found")]
    SignerCertNotFound,
    #[error("Signer certificate is not trusted: {0}")]
    UntrustedSigner(String),
    #[error("Digest algorithm not supported: {0}")]
    UnsupportedDigestAlgorithm(const_oid::ObjectIdentifier),
    #[error("Signature algorithm not supported: {0}")]
    UnsupportedSignatureAlgorithm(const_oid::ObjectIdentifier),
    #[error("Signed attributes have no message digest")]
    MissingMessageDigest,
    #[error("Message digest attribute does not match content")]
    MessageDigestMismatch,
    #[error("Certificate signature has unused bits")]
    InvalidCertSignature,
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] x509_cert::spki::Error),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw layout of the header of the signed payload. The digest follows.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSignedDigest {
    digest_algorithm: little_endian::U16,
    digest_size: little_endian::U16,
}

/// The payload that a signature vouches for.
#[derive(Clone, Copy)]
pub struct SignedDigest {
    pub hash_alg: &'static HashAlgorithm,
    pub digest: Digest,
}

impl fmt::Debug for SignedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedDigest({})", self.hash_alg.display(&self.digest))
    }
}

impl SignedDigest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Ok((raw, digest)) = RawSignedDigest::ref_from_prefix(data) else {
            warn!("Signed file measurement has unrecognized format");
            return Err(Error::UnrecognizedPayload(data.len()));
        };

        let hash_alg = hash::get_hash_alg(raw.digest_algorithm.get())?;
        let digest_size = usize::from(raw.digest_size.get());

        if digest_size != hash_alg.digest_size() {
            warn!(
                "Wrong digest_size in signed measurement: wanted {} for algorithm {}, but got {}",
                hash_alg.digest_size(),
                hash_alg.name(),
                digest_size,
            );
            return Err(Error::WrongDigestSize {
                name: hash_alg.name(),
                expected: hash_alg.digest_size(),
                actual: digest_size,
            });
        }

        let Some(digest) = digest.get(..digest_size).and_then(Digest::from_slice) else {
            warn!("Signed file measurement is truncated");
            return Err(Error::TruncatedPayload);
        };

        Ok(Self { hash_alg, digest })
    }

    /// Serialize to the on-disk payload format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(4 + self.digest.len());
        result.extend_from_slice(&self.hash_alg.id().to_le_bytes());
        result.extend_from_slice(&(self.digest.len() as u16).to_le_bytes());
        result.extend_from_slice(self.digest.as_ref());
        result
    }
}

/// Checks a signature blob against a set of trust anchors.
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` and return the payload it vouches for.
    fn verify_signed_blob(&self, signature: &[u8]) -> Result<Vec<u8>>;
}

/// Verifier that rejects every signature. Used when signature support is not
/// compiled in.
#[derive(Debug, Default)]
pub struct NoSignatureVerifier;

impl SignatureVerifier for NoSignatureVerifier {
    fn verify_signed_blob(&self, _signature: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Unsupported)
    }
}

#[cfg(feature = "signatures")]
pub use pkcs7::{Pkcs7Verifier, iter_cms_certs, parse_cms};

#[cfg(feature = "signatures")]
mod pkcs7 {
    use cms::{
        cert::CertificateChoices,
        content_info::ContentInfo,
        signed_data::{SignedData, SignerIdentifier, SignerInfo},
    };
    use const_oid::{ObjectIdentifier, db::rfc5912};
    use rsa::{Pkcs1v15Sign, RsaPublicKey};
    use sha2::{Digest, Sha256, Sha512};
    use tracing::{debug, warn};
    use x509_cert::{
        Certificate,
        der::{Decode, Encode, asn1::OctetString, referenced::OwnedToRef},
    };

    use super::{Error, Result, SignatureVerifier};

    /// PKCS#9 `id-messageDigest`.
    const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum DigestAlgorithm {
        Sha256,
        Sha512,
    }

    impl DigestAlgorithm {
        fn from_digest_oid(oid: ObjectIdentifier) -> Result<Self> {
            if oid == rfc5912::ID_SHA_256 {
                Ok(Self::Sha256)
            } else if oid == rfc5912::ID_SHA_512 {
                Ok(Self::Sha512)
            } else {
                Err(Error::UnsupportedDigestAlgorithm(oid))
            }
        }

        fn from_signature_oid(oid: ObjectIdentifier) -> Result<Self> {
            if oid == rfc5912::SHA_256_WITH_RSA_ENCRYPTION {
                Ok(Self::Sha256)
            } else if oid == rfc5912::SHA_512_WITH_RSA_ENCRYPTION {
                Ok(Self::Sha512)
            } else {
                Err(Error::UnsupportedSignatureAlgorithm(oid))
            }
        }

        fn digest(self, data: &[u8]) -> Vec<u8> {
            match self {
                Self::Sha256 => Sha256::digest(data).to_vec(),
                Self::Sha512 => Sha512::digest(data).to_vec(),
            }
        }

        fn scheme(self) -> Pkcs1v15Sign {
            match self {
                Self::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                Self::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            }
        }
    }

    /// Parse a CMS [`SignedData`] structure from raw DER-encoded data.
    pub fn parse_cms(data: &[u8]) -> Result<SignedData> {
        let ci = ContentInfo::from_der(data).map_err(Error::CmsParse)?;
        if ci.content_type != const_oid::db::rfc5911::ID_SIGNED_DATA {
            return Err(Error::NotSignedData(ci.content_type));
        }

        let sd = ci
            .content
            .decode_as::<SignedData>()
            .map_err(Error::CmsParse)?;

        Ok(sd)
    }

    /// Get an iterator to all standard X509 certificates contained within a
    /// [`SignedData`] structure.
    pub fn iter_cms_certs(sd: &SignedData) -> impl Iterator<Item = &Certificate> {
        sd.certificates.iter().flat_map(|certs| {
            certs.0.iter().filter_map(|cc| {
                if let CertificateChoices::Certificate(c) = cc {
                    Some(c)
                } else {
                    None
                }
            })
        })
    }

    fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
        let public_key =
            RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
                .map_err(Error::LoadPubKey)?;

        Ok(public_key)
    }

    /// Check that `issuer` signed `cert`.
    fn verify_cert_signature(cert: &Certificate, issuer: &Certificate) -> Result<()> {
        let algorithm = DigestAlgorithm::from_signature_oid(cert.signature_algorithm.oid)?;
        let tbs = cert.tbs_certificate.to_der().map_err(Error::CmsParse)?;
        let signature = cert
            .signature
            .as_bytes()
            .ok_or(Error::InvalidCertSignature)?;

        get_public_key(issuer)?
            .verify(algorithm.scheme(), &algorithm.digest(&tbs), signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }

    /// Verifies CMS signatures with embedded content against a list of
    /// trusted certificates.
    #[derive(Clone, Debug, Default)]
    pub struct Pkcs7Verifier {
        trusted: Vec<Certificate>,
    }

    impl Pkcs7Verifier {
        pub fn new(trusted: Vec<Certificate>) -> Self {
            Self { trusted }
        }

        fn find_signer_cert<'a>(
            &'a self,
            sd: &'a SignedData,
            sid: &SignerIdentifier,
        ) -> Result<&'a Certificate> {
            let SignerIdentifier::IssuerAndSerialNumber(ias) = sid else {
                return Err(Error::UnsupportedSignerIdentifier);
            };

            iter_cms_certs(sd)
                .chain(self.trusted.iter())
                .find(|c| {
                    c.tbs_certificate.issuer == ias.issuer
                        && c.tbs_certificate.serial_number == ias.serial_number
                })
                .ok_or(Error::SignerCertNotFound)
        }

        fn check_trusted(&self, cert: &Certificate) -> Result<()> {
            if self.trusted.iter().any(|t| t == cert) {
                return Ok(());
            }

            for anchor in &self.trusted {
                if anchor.tbs_certificate.subject != cert.tbs_certificate.issuer {
                    continue;
                }

                match verify_cert_signature(cert, anchor) {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!("Certificate not issued by trust anchor: {e}"),
                }
            }

            Err(Error::UntrustedSigner(cert.tbs_certificate.subject.to_string()))
        }

        fn verify_signer(&self, sd: &SignedData, signer: &SignerInfo, content: &[u8]) -> Result<()> {
            let cert = self.find_signer_cert(sd, &signer.sid)?;
            self.check_trusted(cert)?;

            let algorithm = DigestAlgorithm::from_digest_oid(signer.digest_alg.oid)?;

            let sig_oid = signer.signature_algorithm.oid;
            if sig_oid != rfc5912::RSA_ENCRYPTION {
                if DigestAlgorithm::from_signature_oid(sig_oid)? != algorithm {
                    return Err(Error::UnsupportedSignatureAlgorithm(sig_oid));
                }
            }

            let content_digest = algorithm.digest(content);

            let signed_digest = match &signer.signed_attrs {
                Some(attrs) => {
                    let value = attrs
                        .iter()
                        .find(|a| a.oid == ID_MESSAGE_DIGEST)
                        .and_then(|a| a.values.iter().next())
                        .ok_or(Error::MissingMessageDigest)?
                        .decode_as::<OctetString>()
                        .map_err(Error::CmsParse)?;

                    if value.as_bytes() != content_digest.as_slice() {
                        return Err(Error::MessageDigestMismatch);
                    }

                    // The signature covers the attributes encoded as a SET OF.
                    algorithm.digest(&attrs.to_der().map_err(Error::CmsParse)?)
                }
                None => content_digest,
            };

            get_public_key(cert)?
                .verify(algorithm.scheme(), &signed_digest, signer.signature.as_bytes())
                .map_err(|e| Error::RsaVerify(Box::new(e)))
        }
    }

    impl SignatureVerifier for Pkcs7Verifier {
        fn verify_signed_blob(&self, signature: &[u8]) -> Result<Vec<u8>> {
            let sd = parse_cms(signature)?;

            let content = sd
                .encap_content_info
                .econtent
                .as_ref()
                .ok_or(Error::DetachedContent)?
                .decode_as::<OctetString>()
                .map_err(Error::CmsParse)?;

            if sd.signer_infos.0.is_empty() {
                return Err(Error::NoSigners);
            }

            for signer in sd.signer_infos.0.iter() {
                self.verify_signer(&sd, signer, content.as_bytes())
                    .inspect_err(|e| warn!("PKCS#7 signature verification error: {e}"))?;
            }

            Ok(content.as_bytes().to_vec())
        }
    }
}
