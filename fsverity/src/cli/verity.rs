// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use tracing::{info, warn};

use crate::{
    config::VerityConfig,
    format::descriptor,
    host::{CachedFile, VerityHost},
    info::{self, VerityContext, VerityInode},
    measurement,
    stream,
    tree::TreeGeometry,
    util::NumBytes,
    verify::ReadPage,
};

/// Number of data pages read and verified per batch.
const PAGES_PER_BATCH: u64 = 256;

fn file_ino(file: &File) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        file.metadata().map_or(0, |m| m.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        0
    }
}

fn open_input(path: &Path) -> Result<CachedFile<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
    let ino = file_ino(&file);

    Ok(CachedFile::new(file, ino).with_verity(true))
}

fn load_config(cli: &PolicyGroup) -> Result<VerityConfig> {
    let mut config = match &cli.config {
        Some(path) => VerityConfig::load(path)
            .with_context(|| format!("Failed to load config: {path:?}"))?,
        None => VerityConfig::default(),
    };

    if cli.require_signatures {
        config.require_signatures = true;
    }

    for path in &cli.cert {
        config
            .add_cert_file(path)
            .with_context(|| format!("Failed to load certificate: {path:?}"))?;
    }

    Ok(config)
}

fn dump_subcommand(cli: &DumpCli) -> Result<()> {
    let file = open_input(&cli.input)?;
    let metadata_end = file.stream_size()?;

    let buf = info::read_descriptor(&file, metadata_end)
        .with_context(|| format!("Failed to find descriptor: {:?}", cli.input))?;
    let desc = descriptor::parse(&buf, file.page_shift())
        .with_context(|| format!("Failed to parse descriptor: {:?}", cli.input))?;
    let geometry = TreeGeometry::new(desc.data_size, desc.block_bits, desc.log_arity)
        .context("Failed to compute tree geometry")?;
    let digest = measurement::compute_measurement(desc.hash_alg, &buf[..desc.auth_len])?;

    println!("Hash algorithm: {}", desc.hash_alg.name());
    println!("Block size: {}", geometry.block_size());
    println!("Data size: {:?}", NumBytes(desc.data_size));
    println!("Metadata end: {:?}", NumBytes(metadata_end));
    println!("Tree depth: {}", geometry.depth());
    for (level, range) in geometry.level_ranges().iter().enumerate() {
        println!("  Level {level}: blocks {range:?}");
    }
    println!("Root hash: {}", desc.hash_alg.display(&desc.root_hash));
    match &desc.salt {
        Some(salt) => println!("Salt: {}", hex::encode(salt)),
        None => println!("Salt: <none>"),
    }
    match &desc.signature {
        Some(sig) => println!("Signature: {:?}", NumBytes(sig.len())),
        None => println!("Signature: <none>"),
    }
    println!("Measurement: {}", desc.hash_alg.display(&digest));

    Ok(())
}

fn measure_subcommand(cli: &MeasureCli) -> Result<()> {
    let file = open_input(&cli.input)?;
    let metadata_end = file.stream_size()?;

    let buf = info::read_descriptor(&file, metadata_end)
        .with_context(|| format!("Failed to find descriptor: {:?}", cli.input))?;
    let desc = descriptor::parse(&buf, file.page_shift())
        .with_context(|| format!("Failed to parse descriptor: {:?}", cli.input))?;
    let digest = measurement::compute_measurement(desc.hash_alg, &buf[..desc.auth_len])?;

    println!("{}", desc.hash_alg.display(&digest));

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = load_config(&cli.policy)?;
    let ctx = Arc::new(VerityContext::new(config));
    let inode = VerityInode::new(open_input(&cli.input)?, ctx);

    inode
        .file_open(false)
        .with_context(|| format!("Failed to set up verity: {:?}", cli.input))?;

    let Some(info) = inode.info() else {
        bail!("Verity was not set up: {:?}", cli.input);
    };
    let data_size = info.data_size();
    let data_blocks = info.geometry().data_blocks();

    info!(
        "Verifying {:?} in {data_blocks} blocks",
        NumBytes(data_size),
    );

    let mut failed = vec![];
    let mut start = 0;

    while start < data_blocks {
        stream::check_cancel(cancel_signal)?;

        let end = (start + PAGES_PER_BATCH).min(data_blocks);
        let buffers = (start..end)
            .map(|i| inode.host().read_data_page(i, data_size))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read pages {start}..{end}"))?;

        let mut pages = buffers
            .iter()
            .zip(start..end)
            .map(|(data, index)| ReadPage::new(index, data))
            .collect::<Vec<_>>();

        if !inode.verify_pages(&mut pages) {
            failed.extend(pages.iter().filter(|p| p.error).map(|p| p.index));
        }

        start = end;
    }

    if !failed.is_empty() {
        for index in &failed {
            warn!("Page {index} failed verification");
        }
        bail!("{} of {data_blocks} pages failed verification", failed.len());
    }

    println!(
        "{} ({})",
        info.hash_alg().display(info.measurement()),
        if info.have_signed_measurement() {
            "signed"
        } else {
            "unsigned"
        },
    );

    Ok(())
}

pub fn dump_main(cli: &DumpCli) -> Result<()> {
    dump_subcommand(cli)
}

pub fn measure_main(cli: &MeasureCli) -> Result<()> {
    measure_subcommand(cli)
}

pub fn verify_main(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    verify_subcommand(cli, cancel_signal)
}

#[derive(Debug, Args)]
struct PolicyGroup {
    /// Path to TOML config with the verification policy.
    #[arg(short, long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,

    /// Reject files without a built-in signature.
    #[arg(long)]
    require_signatures: bool,

    /// Trust the certificates in a PEM file.
    ///
    /// This can be specified multiple times.
    #[arg(long, value_name = "FILE", value_parser)]
    cert: Vec<PathBuf>,
}

/// Show the verity descriptor and tree layout of a file.
///
/// The signature, if present, is not verified.
#[derive(Debug, Parser)]
pub struct DumpCli {
    /// Path to file with appended verity metadata.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Print the file measurement.
///
/// The signature, if present, is not verified.
#[derive(Debug, Parser)]
pub struct MeasureCli {
    /// Path to file with appended verity metadata.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify every data page of a file against its Merkle tree.
///
/// The file measurement and its signature are checked against the policy
/// first. On success, the measurement is printed.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to file with appended verity metadata.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    #[command(flatten)]
    policy: PolicyGroup,
}
