// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, ops::Range};

use thiserror::Error;

/// Deepest tree that can be verified. Even with a 4-byte digest and tiny
/// blocks this covers any 64-bit file size.
pub const MAX_LEVELS: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash tree for {data_size} bytes with {block_size}-byte blocks needs more than {MAX_LEVELS} levels")]
    TooManyLevels { data_size: u64, block_size: u64 },
    #[error("Hash tree block index overflows")]
    IndexOverflow,
}

type Result<T> = std::result::Result<T, Error>;

/// Shape of a Merkle tree stored after the data in block-sized units. Level 0
/// holds the hashes of the data blocks and the highest level is a single block
/// whose hash is the root hash. Levels are stored highest first, beginning at
/// the block directly following the last data block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TreeGeometry {
    block_bits: u8,
    log_arity: u8,
    depth: u8,
    data_blocks: u64,
    level_start: [u64; MAX_LEVELS],
    level_blocks: [u64; MAX_LEVELS],
}

impl TreeGeometry {
    /// Compute the layout for `data_size` bytes of data. `log_arity` is the
    /// base 2 logarithm of the number of digests per hash block.
    pub fn new(data_size: u64, block_bits: u8, log_arity: u8) -> Result<Self> {
        let block_size = 1u64 << block_bits;
        let arity = 1u64 << log_arity;

        let data_blocks = data_size.div_ceil(block_size);
        let mut level_blocks = [0u64; MAX_LEVELS];
        let mut depth = 0;
        let mut blocks = data_blocks;

        while blocks > 1 {
            if depth >= MAX_LEVELS {
                return Err(Error::TooManyLevels {
                    data_size,
                    block_size,
                });
            }

            blocks = blocks.div_ceil(arity);
            level_blocks[depth] = blocks;
            depth += 1;
        }

        // The root level comes first on disk.
        let mut level_start = [0u64; MAX_LEVELS];
        let mut offset = data_blocks;
        for level in (0..depth).rev() {
            level_start[level] = offset;
            offset = offset
                .checked_add(level_blocks[level])
                .ok_or(Error::IndexOverflow)?;
        }

        Ok(Self {
            block_bits,
            log_arity,
            depth: depth as u8,
            data_blocks,
            level_start,
            level_blocks,
        })
    }

    pub fn block_bits(&self) -> u8 {
        self.block_bits
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_bits
    }

    pub fn log_arity(&self) -> u8 {
        self.log_arity
    }

    /// Number of tree levels. A file with at most one data block has no tree
    /// and its root hash covers the data block directly.
    pub fn depth(&self) -> usize {
        usize::from(self.depth)
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    /// Block index of the first block of `level`.
    pub fn level_start(&self, level: usize) -> u64 {
        self.level_start[level]
    }

    /// Number of blocks in `level`.
    pub fn level_blocks(&self, level: usize) -> u64 {
        self.level_blocks[level]
    }

    /// Block index range of each level, with level 0 first.
    pub fn level_ranges(&self) -> Vec<Range<u64>> {
        (0..self.depth())
            .map(|l| self.level_start[l]..self.level_start[l] + self.level_blocks[l])
            .collect()
    }

    /// Total number of hash blocks across all levels.
    pub fn hash_blocks(&self) -> u64 {
        self.level_blocks[..self.depth()].iter().sum()
    }

    /// Locate the digest that covers data block `index` at `level`. Returns
    /// the hash block index and the byte offset of the digest within that
    /// block.
    pub fn hash_at_level(&self, index: u64, level: usize) -> (u64, usize) {
        let log_arity = u32::from(self.log_arity);
        let arity_mask = (1u64 << log_arity) - 1;

        // Index of the hash within the level.
        let position = index
            .checked_shr(level as u32 * log_arity)
            .unwrap_or(0);

        let block = self.level_start[level] + (position >> log_arity);
        let offset = ((position & arity_mask) as usize)
            << (u32::from(self.block_bits) - log_arity);

        (block, offset)
    }
}

impl fmt::Debug for TreeGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeGeometry")
            .field("block_bits", &self.block_bits)
            .field("log_arity", &self.log_arity)
            .field("depth", &self.depth)
            .field("data_blocks", &self.data_blocks)
            .field("level_ranges", &self.level_ranges())
            .finish()
    }
}
