// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use x509_cert::Certificate;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Failed to load X509 certificates: {0:?}")]
    LoadCert(PathBuf, #[source] x509_cert::der::Error),
    #[error("No certificates found: {0:?}")]
    NoCertificates(PathBuf),
}

type Result<T> = std::result::Result<T, Error>;

/// On-disk representation of the verification policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Reject files that have no built-in signature.
    #[serde(default)]
    pub require_signatures: bool,
    /// PEM files containing trusted certificates. Relative paths are relative
    /// to the directory containing the config file.
    #[serde(default)]
    pub trusted_certs: Vec<PathBuf>,
}

/// Process-wide verification policy shared by every file.
#[derive(Clone, Debug, Default)]
pub struct VerityConfig {
    pub require_signatures: bool,
    pub trusted_certs: Vec<Certificate>,
}

impl VerityConfig {
    /// Load the policy from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;
        let raw: RawConfig =
            toml_edit::de::from_str(&contents).map_err(|e| Error::Parse(path.to_owned(), e))?;

        Self::from_raw(&raw, util::parent_path(path))
    }

    /// Resolve a raw config, loading certificate paths relative to `base_dir`.
    pub fn from_raw(raw: &RawConfig, base_dir: &Path) -> Result<Self> {
        let mut config = Self {
            require_signatures: raw.require_signatures,
            trusted_certs: vec![],
        };

        for path in &raw.trusted_certs {
            config.add_cert_file(&base_dir.join(path))?;
        }

        Ok(config)
    }

    /// Add every certificate in a PEM file to the trusted set.
    pub fn add_cert_file(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;
        let certs = load_pem_certs(path, &data)?;

        debug!("Loaded {} trusted certificates from {path:?}", certs.len());
        self.trusted_certs.extend(certs);

        Ok(())
    }
}

/// Parse one or more PEM-encoded certificates.
pub fn load_pem_certs(path: &Path, data: &[u8]) -> Result<Vec<Certificate>> {
    // x509-cert cannot handle input that is empty after trimming whitespace.
    if data.trim_ascii().is_empty() {
        return Err(Error::NoCertificates(path.to_owned()));
    }

    let certs =
        Certificate::load_pem_chain(data).map_err(|e| Error::LoadCert(path.to_owned(), e))?;
    if certs.is_empty() {
        return Err(Error::NoCertificates(path.to_owned()));
    }

    Ok(certs)
}
