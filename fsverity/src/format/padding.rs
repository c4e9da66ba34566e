// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a multiple of `alignment`.
pub fn calc<N: PrimInt>(offset: N, alignment: N) -> N {
    let r = offset % alignment;
    if r == N::zero() {
        N::zero()
    } else {
        alignment - r
    }
}

/// Round up to the next multiple of `alignment`. Returns [`None`] on overflow.
pub fn round<N: PrimInt>(offset: N, alignment: N) -> Option<N> {
    let remain = calc(offset, alignment);
    offset.checked_add(&remain)
}

pub trait ZeroPadding {
    /// Trim trailing zeros. Intermediate zeros before the last non-zero byte
    /// are kept.
    fn trim_end_padding(&self) -> &[u8];
}

impl ZeroPadding for [u8] {
    fn trim_end_padding(&self) -> &[u8] {
        let first_ending_zero = self
            .iter()
            .rposition(|b| *b != 0)
            .map(|pos| pos + 1)
            .unwrap_or_default();

        &self[..first_ending_zero]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(calc(0u32, 8), 0);
        assert_eq!(calc(13u32, 8), 3);
        assert_eq!(round(13u64, 8), Some(16));
        assert_eq!(round(4096u64, 4096), Some(4096));
        assert_eq!(round(u64::MAX, 8), None);
    }

    #[test]
    fn trim_trailing_zeros() {
        assert_eq!(b"\x01\x00\x02\x00\x00".trim_end_padding(), b"\x01\x00\x02");
        assert_eq!(b"\x00\x00".trim_end_padding(), b"");
        assert_eq!(b"".trim_end_padding(), b"");
    }
}
