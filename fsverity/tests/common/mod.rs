// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Builds files with appended verity metadata for the integration tests. The
//! tree and descriptor are computed here independently of the library.

#![allow(dead_code)]

use std::{ops::Range, path::PathBuf};

use fsverity::host::CachedFile;

pub const EXT_ROOT_HASH: u16 = 1;
pub const EXT_SALT: u16 = 2;
pub const EXT_PKCS7_SIGNATURE: u16 = 3;

pub fn digest_size(alg: u16) -> usize {
    match alg {
        1 => 32,
        2 => 64,
        3 => 4,
        _ => panic!("Unknown algorithm: {alg}"),
    }
}

pub fn digest(alg: u16, data: &[u8]) -> Vec<u8> {
    match alg {
        1 => ring::digest::digest(&ring::digest::SHA256, data).as_ref().to_vec(),
        2 => ring::digest::digest(&ring::digest::SHA512, data).as_ref().to_vec(),
        3 => crc32c::crc32c(data).to_le_bytes().to_vec(),
        _ => panic!("Unknown algorithm: {alg}"),
    }
}

/// Hash a block, zero padded to `block_size`, with the salt prepended.
fn block_hash(alg: u16, salt: &[u8], block: &[u8], block_size: usize) -> Vec<u8> {
    let mut buf = salt.to_vec();
    buf.extend_from_slice(block);
    buf.resize(salt.len() + block_size, 0);
    digest(alg, &buf)
}

fn push_extension(buf: &mut Vec<u8>, ext_type: u16, payload: &[u8]) {
    let len = 8 + payload.len();
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.extend_from_slice(&ext_type.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len().next_multiple_of(8), 0);
}

#[derive(Clone, Debug)]
pub struct ImageBuilder {
    data: Vec<u8>,
    alg: u16,
    page_shift: u8,
    salt: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
    orig_size: Option<u64>,
    root_hash: Option<Vec<u8>>,
    extra_auth: Vec<(u16, Vec<u8>)>,
    trailing_zeros: usize,
}

impl ImageBuilder {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            alg: 1,
            page_shift: 12,
            salt: None,
            signature: None,
            orig_size: None,
            root_hash: None,
            extra_auth: vec![],
            trailing_zeros: 0,
        }
    }

    pub fn alg(mut self, alg: u16) -> Self {
        self.alg = alg;
        self
    }

    pub fn page_shift(mut self, page_shift: u8) -> Self {
        self.page_shift = page_shift;
        self
    }

    pub fn salt(mut self, salt: &[u8]) -> Self {
        self.salt = Some(salt.to_vec());
        self
    }

    pub fn signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Record a different size in the descriptor than the real data size.
    pub fn orig_size(mut self, size: u64) -> Self {
        self.orig_size = Some(size);
        self
    }

    /// Record a different root hash in the descriptor than the real one.
    pub fn root_hash(mut self, root_hash: Vec<u8>) -> Self {
        self.root_hash = Some(root_hash);
        self
    }

    pub fn extra_auth_extension(mut self, ext_type: u16, payload: &[u8]) -> Self {
        self.extra_auth.push((ext_type, payload.to_vec()));
        self
    }

    /// Pad the stream with zeros after the footer.
    pub fn trailing_zeros(mut self, len: usize) -> Self {
        self.trailing_zeros = len;
        self
    }

    pub fn build(&self) -> Image {
        let alg = self.alg;
        let block_size = 1usize << self.page_shift;
        let arity = block_size / digest_size(alg);
        let salt = self.salt.as_deref().unwrap_or_default();

        let data_blocks = self.data.len().div_ceil(block_size);
        let mut hashes = self
            .data
            .chunks(block_size)
            .map(|b| block_hash(alg, salt, b, block_size))
            .collect::<Vec<_>>();

        // Level 0 first.
        let mut levels = vec![];
        while hashes.len() > 1 {
            let mut level = vec![];
            for chunk in hashes.chunks(arity) {
                let start = level.len();
                level.extend(chunk.iter().flatten());
                level.resize(start + block_size, 0);
            }

            hashes = level
                .chunks(block_size)
                .map(|b| block_hash(alg, salt, b, block_size))
                .collect();
            levels.push(level);
        }
        let root_hash = hashes.into_iter().next().unwrap_or_default();

        let mut bytes = self.data.clone();
        bytes.resize(data_blocks * block_size, 0);

        // The root level is stored first.
        let mut level_ranges = vec![0..0; levels.len()];
        for (i, level) in levels.iter().enumerate().rev() {
            let start = (bytes.len() / block_size) as u64;
            bytes.extend_from_slice(level);
            level_ranges[i] = start..(bytes.len() / block_size) as u64;
        }

        let desc_start = bytes.len();
        let descriptor_root = self.root_hash.clone().unwrap_or_else(|| root_hash.clone());
        let auth_count = 1 + usize::from(self.salt.is_some()) + self.extra_auth.len();

        let mut desc = vec![];
        desc.extend_from_slice(b"FSVerity");
        desc.push(1);
        desc.push(0);
        desc.push(self.page_shift);
        desc.push(self.page_shift);
        desc.extend_from_slice(&alg.to_le_bytes());
        desc.extend_from_slice(&alg.to_le_bytes());
        desc.extend_from_slice(&0u32.to_le_bytes());
        desc.extend_from_slice(&0u32.to_le_bytes());
        desc.extend_from_slice(&self.orig_size.unwrap_or(self.data.len() as u64).to_le_bytes());
        desc.extend_from_slice(&(auth_count as u16).to_le_bytes());
        desc.extend_from_slice(&[0u8; 30]);
        assert_eq!(desc.len(), 64);

        push_extension(&mut desc, EXT_ROOT_HASH, &descriptor_root);
        if let Some(salt) = &self.salt {
            push_extension(&mut desc, EXT_SALT, salt);
        }
        for (ext_type, payload) in &self.extra_auth {
            push_extension(&mut desc, *ext_type, payload);
        }

        let auth = desc.clone();
        let measurement = digest(alg, &auth);

        let unauth_count = u16::from(self.signature.is_some());
        desc.extend_from_slice(&unauth_count.to_le_bytes());
        desc.resize(desc.len() + 6, 0);
        if let Some(signature) = &self.signature {
            push_extension(&mut desc, EXT_PKCS7_SIGNATURE, signature);
        }

        bytes.extend_from_slice(&desc);
        let reverse_offset = desc.len() + 12;
        bytes.extend_from_slice(&(reverse_offset as u32).to_le_bytes());
        bytes.extend_from_slice(b"FSVerity");
        bytes.resize(bytes.len() + self.trailing_zeros, 0);

        Image {
            bytes,
            data_size: self.data.len() as u64,
            page_shift: self.page_shift,
            levels: level_ranges,
            root_hash,
            auth,
            measurement,
            desc_start,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub data_size: u64,
    pub page_shift: u8,
    /// Hash block ranges, level 0 first.
    pub levels: Vec<Range<u64>>,
    pub root_hash: Vec<u8>,
    /// Authenticated portion of the descriptor.
    pub auth: Vec<u8>,
    pub measurement: Vec<u8>,
    pub desc_start: usize,
}

impl Image {
    pub fn block_size(&self) -> usize {
        1 << self.page_shift
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_size.div_ceil(self.block_size() as u64)
    }

    /// Host for a file that already has verity enabled.
    pub fn host(&self) -> CachedFile<Vec<u8>> {
        CachedFile::new(self.bytes.clone(), 1)
            .with_page_shift(self.page_shift)
            .with_verity(true)
    }

    /// Data page `index`, short if it straddles the end of the data.
    pub fn data_page(&self, index: u64) -> &[u8] {
        let start = (index as usize * self.block_size()).min(self.data_size as usize);
        let end = (start + self.block_size()).min(self.data_size as usize);
        &self.bytes[start..end]
    }

    /// Flip a bit in hash block `block`.
    pub fn corrupt_block(&mut self, block: u64, offset: usize) {
        let block_size = self.block_size();
        self.bytes[block as usize * block_size + offset] ^= 1;
    }
}

/// Deterministic, non-repeating test data.
pub fn test_data(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn keys_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("keys")
}

#[cfg(feature = "signatures")]
pub mod signing {
    use std::fs;

    use cms::{
        cert::{CertificateChoices, IssuerAndSerialNumber},
        content_info::{CmsVersion, ContentInfo},
        signed_data::{
            CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo,
            SignatureValue, SignedAttributes, SignedData, SignerIdentifier, SignerInfo,
            SignerInfos,
        },
    };
    use const_oid::{
        ObjectIdentifier,
        db::{rfc5911, rfc5912},
    };
    use pkcs8::DecodePrivateKey;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};
    use x509_cert::{
        Certificate,
        attr::Attribute,
        der::{
            Any, DecodePem, Encode,
            asn1::{OctetString, SetOfVec},
        },
        spki::AlgorithmIdentifierOwned,
    };

    use super::keys_dir;

    const ID_CONTENT_TYPE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
    const ID_MESSAGE_DIGEST: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

    pub struct Signer {
        pub key: RsaPrivateKey,
        pub cert: Certificate,
    }

    pub fn load_cert(name: &str) -> Certificate {
        let data = fs::read(keys_dir().join(format!("TEST_KEY_DO_NOT_USE_{name}.crt"))).unwrap();
        Certificate::from_pem(data).unwrap()
    }

    pub fn load_signer(name: &str) -> Signer {
        let key_data =
            fs::read_to_string(keys_dir().join(format!("TEST_KEY_DO_NOT_USE_{name}.key")))
                .unwrap();

        Signer {
            key: RsaPrivateKey::from_pkcs8_pem(&key_data).unwrap(),
            cert: load_cert(name),
        }
    }

    fn attribute(oid: ObjectIdentifier, value: Any) -> Attribute {
        Attribute {
            oid,
            values: SetOfVec::try_from(vec![value]).unwrap(),
        }
    }

    /// Create a DER-encoded CMS signature with the payload embedded.
    pub fn sign(signer: &Signer, payload: &[u8], signed_attrs: bool) -> Vec<u8> {
        let content_digest = Sha256::digest(payload);

        let (attrs, signed_digest) = if signed_attrs {
            let attrs: SignedAttributes = SetOfVec::try_from(vec![
                attribute(ID_CONTENT_TYPE, Any::encode_from(&rfc5911::ID_DATA).unwrap()),
                attribute(
                    ID_MESSAGE_DIGEST,
                    Any::encode_from(&OctetString::new(content_digest.to_vec()).unwrap())
                        .unwrap(),
                ),
            ])
            .unwrap();
            let digest = Sha256::digest(attrs.to_der().unwrap());

            (Some(attrs), digest)
        } else {
            (None, content_digest)
        };

        let signature = signer
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &signed_digest)
            .unwrap();

        let digest_algorithm = AlgorithmIdentifierOwned {
            oid: rfc5912::ID_SHA_256,
            parameters: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: DigestAlgorithmIdentifiers::try_from(vec![
                digest_algorithm.clone(),
            ])
            .unwrap(),
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: rfc5911::ID_DATA,
                econtent: Some(
                    Any::encode_from(&OctetString::new(payload.to_vec()).unwrap()).unwrap(),
                ),
            },
            certificates: Some(
                CertificateSet::try_from(vec![CertificateChoices::Certificate(
                    signer.cert.clone(),
                )])
                .unwrap(),
            ),
            crls: None,
            signer_infos: SignerInfos::try_from(vec![SignerInfo {
                version: CmsVersion::V1,
                sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                    issuer: signer.cert.tbs_certificate.issuer.clone(),
                    serial_number: signer.cert.tbs_certificate.serial_number.clone(),
                }),
                digest_alg: digest_algorithm,
                signed_attrs: attrs,
                signature_algorithm: AlgorithmIdentifierOwned {
                    oid: rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
                    parameters: None,
                },
                signature: SignatureValue::new(signature).unwrap(),
                unsigned_attrs: None,
            }])
            .unwrap(),
        };

        ContentInfo {
            content_type: rfc5911::ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).unwrap(),
        }
        .to_der()
        .unwrap()
    }
}
