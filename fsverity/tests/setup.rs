// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{sync::Arc, thread};

use assert_matches::assert_matches;
use fsverity::{
    config::VerityConfig,
    format::descriptor,
    host::{CachedFile, VerityHost},
    info::{self, Error, ErrorKind, VerityContext, VerityInode},
};

use common::{EXT_ROOT_HASH, EXT_SALT, Image, ImageBuilder, test_data};

fn inode(host: CachedFile<Vec<u8>>) -> VerityInode<CachedFile<Vec<u8>>> {
    VerityInode::new(host, Arc::new(VerityContext::default()))
}

fn open_error(bytes: Vec<u8>) -> Error {
    let inode = inode(CachedFile::new(bytes, 1).with_verity(true));
    inode.file_open(false).unwrap_err()
}

fn image_error(image: &Image) -> Error {
    open_error(image.bytes.clone())
}

#[test]
fn install_once() {
    let image = ImageBuilder::new(test_data(50 * 4096)).build();
    let inode = inode(image.host());
    assert!(inode.info().is_none());

    let infos = thread::scope(|s| {
        let handles = (0..8)
            .map(|_| {
                s.spawn(|| {
                    inode.file_open(false).unwrap();
                    inode.info().unwrap().clone()
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    for info in &infos[1..] {
        assert!(Arc::ptr_eq(&infos[0], info));
    }

    // Later opens reuse the installed state.
    inode.file_open(false).unwrap();
    assert!(Arc::ptr_eq(&infos[0], inode.info().unwrap()));
}

#[test]
fn verity_files_are_read_only() {
    let image = ImageBuilder::new(test_data(3 * 4096)).build();
    let inode = inode(image.host());

    assert_matches!(inode.file_open(true), Err(Error::PermissionDenied));
    assert_eq!(
        inode.file_open(true).unwrap_err().kind(),
        ErrorKind::PermissionDenied,
    );
    assert_matches!(inode.prepare_setattr(true), Err(Error::PermissionDenied));
    inode.prepare_setattr(false).unwrap();
    inode.file_open(false).unwrap();
}

#[test]
fn sizes() {
    let image = ImageBuilder::new(test_data(10_000)).trailing_zeros(100).build();
    let inode = inode(image.host());

    // Before setup, the raw stream is all there is.
    assert_eq!(inode.size().unwrap(), image.bytes.len() as u64);

    inode.prepare_getattr().unwrap();
    assert_eq!(inode.size().unwrap(), 10_000);

    // The full size is whatever the host reports as the metadata end,
    // including any padding after the footer.
    let metadata_end = image.bytes.len() as u64;
    assert_eq!(inode.full_logical_size().unwrap(), metadata_end);
    assert_eq!(inode.info().unwrap().metadata_end(), metadata_end);
}

#[test]
fn enable() {
    let image = ImageBuilder::new(test_data(5 * 4096 + 1)).build();
    let inode = inode(CachedFile::new(image.bytes.clone(), 1));

    // Plain files can be written to.
    inode.file_open(true).unwrap();
    assert!(inode.info().is_none());

    let info = inode.enable().unwrap();
    assert_eq!(info.data_size(), image.data_size);
    assert_eq!(info.root_hash().as_ref(), image.root_hash.as_slice());
    assert!(inode.host().is_verity());
    assert_eq!(inode.host().verity_data_size(), Some(image.data_size));
    assert!(Arc::ptr_eq(&info, inode.info().unwrap()));
    assert_eq!(inode.size().unwrap(), image.data_size);

    let err = inode.enable().unwrap_err();
    assert_matches!(err, Error::AlreadyEnabled);
    assert_eq!(err.kind(), ErrorKind::AlreadyEnabled);

    assert_matches!(inode.file_open(true), Err(Error::PermissionDenied));
    for index in 0..image.data_blocks() {
        assert!(inode.verify_page(index, image.data_page(index)));
    }
}

#[test]
fn enable_malformed() {
    let mut image = ImageBuilder::new(test_data(4096)).build();
    let len = image.bytes.len();
    image.bytes[len - 9] ^= 0xff;

    let inode = inode(CachedFile::new(image.bytes.clone(), 1));
    let err = inode.enable().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
    assert!(!inode.host().is_verity());
    assert!(inode.info().is_none());
}

#[test]
fn measure() {
    let image = ImageBuilder::new(test_data(20_000)).alg(2).salt(b"abc").build();
    let inode = inode(image.host());

    let measured = inode.measure().unwrap();
    assert_eq!(measured.algorithm, 2);
    assert_eq!(measured.digest_size, 64);
    assert_eq!(measured.digest.as_ref(), image.measurement.as_slice());
    assert!(!inode.info().unwrap().have_signed_measurement());

    let plain = self::inode(CachedFile::new(test_data(100), 1));
    let err = plain.measure().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEnabled);
}

#[test]
fn cleanup_drops_info() {
    let image = ImageBuilder::new(test_data(4096)).build();
    let mut inode = inode(image.host());

    inode.file_open(false).unwrap();
    assert!(inode.info().is_some());

    inode.cleanup();
    assert!(inode.info().is_none());
    assert_eq!(inode.size().unwrap(), image.bytes.len() as u64);

    inode.file_open(false).unwrap();
    assert!(inode.info().is_some());
}

#[test]
fn bad_footer() {
    let image = ImageBuilder::new(test_data(4096)).build();
    let len = image.bytes.len();

    // Truncated footer.
    let err = open_error(image.bytes[..len - 4].to_vec());
    assert_matches!(err, Error::Descriptor(descriptor::Error::FooterNotFound));
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Reverse offset smaller than a descriptor and footer.
    let mut bytes = image.bytes.clone();
    bytes[len - 12..len - 8].copy_from_slice(&20u32.to_le_bytes());
    let err = open_error(bytes);
    assert_matches!(err, Error::Descriptor(descriptor::Error::InvalidReverseOffset(20)));

    // Reverse offset pointing before the start of the stream.
    let mut bytes = image.bytes.clone();
    bytes[len - 12..len - 8].copy_from_slice(&(len as u32 + 8).to_le_bytes());
    let err = open_error(bytes);
    assert_matches!(err, Error::Descriptor(descriptor::Error::InvalidReverseOffset(_)));

    // Misaligned descriptor.
    let mut bytes = image.bytes.clone();
    let reverse = u32::from_le_bytes(bytes[len - 12..len - 8].try_into().unwrap());
    bytes[len - 12..len - 8].copy_from_slice(&(reverse + 4).to_le_bytes());
    let err = open_error(bytes);
    assert_matches!(err, Error::Descriptor(descriptor::Error::MisalignedDescriptor(_)));
    assert_eq!(err.kind(), ErrorKind::Malformed);
}

#[test]
fn trailing_zeros_after_footer() {
    let image = ImageBuilder::new(test_data(3 * 4096))
        .trailing_zeros(1000)
        .build();
    let inode = inode(image.host());

    inode.file_open(false).unwrap();
    assert!(inode.verify_page(2, image.data_page(2)));

    // Only the last page is searched for the footer.
    let image = ImageBuilder::new(test_data(3 * 4096))
        .trailing_zeros(5000)
        .build();
    let err = image_error(&image);
    assert_matches!(err, Error::Descriptor(descriptor::Error::FooterNotFound));
}

#[test]
fn malformed_descriptors() {
    let data = test_data(2 * 4096);

    let err = image_error(&ImageBuilder::new(data.clone()).orig_size(0).build());
    assert_matches!(err, Error::Descriptor(descriptor::Error::EmptyFile));
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let err = image_error(&ImageBuilder::new(data.clone()).orig_size(1 << 40).build());
    assert_matches!(err, Error::BadDataSize { data_size, .. } if data_size == 1 << 40);
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let err = image_error(
        &ImageBuilder::new(data.clone())
            .extra_auth_extension(EXT_ROOT_HASH, &[0; 32])
            .build(),
    );
    assert_matches!(err, Error::Descriptor(descriptor::Error::DuplicateRootHash));
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let err = image_error(
        &ImageBuilder::new(data.clone())
            .salt(b"a")
            .extra_auth_extension(EXT_SALT, b"b")
            .build(),
    );
    assert_matches!(err, Error::Descriptor(descriptor::Error::DuplicateSalt));

    let err = image_error(
        &ImageBuilder::new(data.clone())
            .extra_auth_extension(42, b"unknown")
            .build(),
    );
    assert_matches!(err, Error::Descriptor(descriptor::Error::UnknownExtensionType(42)));
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Wrong root hash size.
    let err = image_error(&ImageBuilder::new(data.clone()).root_hash(vec![0; 20]).build());
    assert_matches!(err, Error::Descriptor(descriptor::Error::InvalidRootHashSize { .. }));

    // Block size that does not match the host page size.
    let image = ImageBuilder::new(data.clone()).build();
    let inode = inode(
        CachedFile::new(image.bytes.clone(), 1)
            .with_page_shift(13)
            .with_verity(true),
    );
    let err = inode.file_open(false).unwrap_err();
    assert_matches!(
        err,
        Error::Descriptor(descriptor::Error::UnsupportedBlockSize { log_block_size: 12, .. })
    );
    assert_eq!(err.kind(), ErrorKind::Malformed);
}

#[test]
fn unsupported_algorithm() {
    let mut image = ImageBuilder::new(test_data(4096)).build();
    let start = image.desc_start;
    image.bytes[start + 12..start + 14].copy_from_slice(&9u16.to_le_bytes());
    image.bytes[start + 14..start + 16].copy_from_slice(&9u16.to_le_bytes());

    let err = image_error(&image);
    assert_matches!(err, Error::Descriptor(descriptor::Error::UnsupportedHashAlgorithm(_)));
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // Only one of the two fields changed.
    image.bytes[start + 14..start + 16].copy_from_slice(&1u16.to_le_bytes());
    let err = image_error(&image);
    assert_matches!(
        err,
        Error::Descriptor(descriptor::Error::MixedHashAlgorithms { data: 9, tree: 1 })
    );
    assert_eq!(err.kind(), ErrorKind::Malformed);
}

#[test]
fn failed_setup_fails_reads() {
    let mut image = ImageBuilder::new(test_data(4096)).build();
    let len = image.bytes.len();
    image.bytes[len - 1] ^= 0xff;
    let inode = inode(image.host());

    assert!(!inode.verify_page(0, image.data_page(0)));
    assert!(inode.info().is_none());
}

#[test]
fn unsigned_file_rejected_by_policy() {
    let image = ImageBuilder::new(test_data(4096)).build();
    let config = VerityConfig {
        require_signatures: true,
        ..Default::default()
    };
    let inode = VerityInode::new(image.host(), Arc::new(VerityContext::new(config)));

    let err = inode.file_open(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(inode.info().is_none());
}

#[cfg(not(feature = "signatures"))]
#[test]
fn signatures_not_compiled_in() {
    let image = ImageBuilder::new(test_data(4096))
        .signature(vec![0x30; 64])
        .build();

    let err = image_error(&image);
    assert_matches!(err, Error::Descriptor(descriptor::Error::SignaturesUnsupported));
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn read_descriptor_directly() {
    let image = ImageBuilder::new(test_data(4096)).salt(b"salt").build();
    let host = image.host();

    let buf = info::read_descriptor(&host, image.bytes.len() as u64).unwrap();
    assert_eq!(&buf[..image.auth.len()], image.auth.as_slice());
    assert_eq!(buf.len(), image.bytes.len() - image.desc_start - 4);

    let err = info::read_descriptor(&host, 0).unwrap_err();
    assert_matches!(err, Error::Descriptor(descriptor::Error::FooterNotFound));
}
