// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multiprocessor bookkeeping: unit membership, boot exclusion and quiescence.

pub mod boot;
pub mod quiesce;
pub mod smp;

pub use boot::{exclude_secondary, BootAdjustError};
pub use quiesce::{quiesce_others, QuiesceError, QuiesceReport};
pub use smp::CpuSet;
