// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Verification of files protected by an fs-verity Merkle tree.
//!
//! The semver versioning covers the CLI only. The Rust APIs are primarily
//! meant for hosts embedding the verifier and can change in any release.
//!
//! A host implements [`host::VerityHost`] to expose the metadata stream of a
//! file, then wraps it in an [`info::VerityInode`]. Setup parses the
//! descriptor and checks the file measurement once. After that, every data
//! page read from the file is checked with [`info::VerityInode::verify_page`].

pub mod cli;
pub mod config;
pub mod format;
pub mod hash;
pub mod host;
pub mod info;
pub mod measurement;
pub mod signature;
pub mod stream;
pub mod tree;
pub mod util;
pub mod verify;
