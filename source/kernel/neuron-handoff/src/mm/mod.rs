// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity map construction for the handoff
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: mm/tests.rs (scenarios + proptest tiling)
//! PUBLIC API: build_identity_map(), SectionTablePage, IdentityMapping, MappingEntry, MapError
//! DEPENDS_ON: hal::Tlb
//! INVARIANTS: Section granularity only; physical == virtual for every entry written;
//!             translation cache flushed after each section

pub mod section;


pub use section::{
    build_identity_map, section_align_range, IdentityMapping, MapError, MappingEntry,
    SectionFlags, SectionTablePage, SECTION_SIZE,
};
