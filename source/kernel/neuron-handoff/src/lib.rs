// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON warm-transition engine: hands the machine to a freshly staged image
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/handoff_flow.rs
//! PUBLIC API: Handoff, ImageDescriptor, RelocationStub, CpuSet, PlatformHooks, HandoffConfig
//! DEPENDS_ON: bitflags, spin, static_assertions
//! INVARIANTS: No allocation; no unwrap; hardware access only on bare-metal ARMv7
//!
//! Flow on the driver unit: validate the descriptor, stage the stub and its
//! parameters on the control page, identity map the control page and the running
//! code, stop every other unit, then run the terminal cache/MMU sequence.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]
#![deny(unsafe_op_in_unsafe_fn)]

#[macro_use]
mod diag;

pub use diag::log;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod error;
pub mod hal;
pub mod handoff;
pub mod image;
pub mod mm;
#[cfg(all(feature = "panic_handler", not(test)))]
mod panic;
pub mod platform;
pub mod stage;
#[cfg(test)]
mod testing;
pub mod transition;
pub mod types;
pub mod uart;

pub use config::{HandoffConfig, TimeoutPolicy};
pub use cpu::{exclude_secondary, CpuSet, QuiesceReport};
pub use error::HandoffError;
pub use handoff::Handoff;
pub use image::{ControlPage, ImageDescriptor, RelocationEntry, RelocationStub};
pub use platform::{Capabilities, PlatformHooks};
pub use types::{CpuId, CpuMask, PhysAddr, VirtAddr};
