/*
 * SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

use num_traits::PrimInt;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

#[derive(Debug)]
struct RateLimitState {
    window_start: Option<Instant>,
    printed: u32,
    missed: u32,
}

/// A token bucket for noisy diagnostics. At most `burst` events are allowed
/// per `interval`. Events beyond that are counted and the count is handed back
/// to the first caller of the next window so it can be reported.
#[derive(Debug)]
pub struct RateLimit {
    interval: Duration,
    burst: u32,
    state: Mutex<RateLimitState>,
}

impl RateLimit {
    pub const fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            state: Mutex::new(RateLimitState {
                window_start: None,
                printed: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Some(suppressed)` if the event may be emitted, where
    /// `suppressed` is the number of events dropped since the last window.
    /// Returns `None` if the event should be dropped.
    pub fn check(&self) -> Option<u32> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Option<u32> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            // Diagnostics must never take the caller down with them.
            Err(e) => e.into_inner(),
        };

        let expired = state
            .window_start
            .is_none_or(|start| now.saturating_duration_since(start) >= self.interval);

        let mut suppressed = 0;
        if expired {
            state.window_start = Some(now);
            state.printed = 0;
            suppressed = state.missed;
            state.missed = 0;
        }

        if state.printed < self.burst {
            state.printed += 1;
            Some(suppressed)
        } else {
            state.missed += 1;
            None
        }
    }
}
