// SPDX-FileCopyrightText: 2025 The fsverity-rs Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod verity;
