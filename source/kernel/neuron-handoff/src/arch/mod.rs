// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture specific support code
//! OWNERS: @kernel-arch-team
//! PUBLIC API: arch backends under `arch::<isa>`, call_with_stack()
//! DEPENDS_ON: per-ISA modules (armv7)
//! INVARIANTS: Keep per-arch code isolated behind module boundaries; host builds get inert stubs

pub mod armv7;

pub use armv7::{call_with_stack, Armv7, GenericTimer};
