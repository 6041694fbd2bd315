// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Processing-unit membership (online, present, possible)
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (mask views, updates from other threads)
//! PUBLIC API: CpuSet::{new, online, present, possible, num_online, set_online, ...}
//! DEPENDS_ON: types::{CpuId, CpuMask}
//! INVARIANTS: Lock-free atomic bit updates only; online ⊆ present ⊆ possible after every
//!             exclusion; no software lock around the masks

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::types::{CpuId, CpuMask};

/// Membership views shared between the driver unit and the units being stopped.
pub struct CpuSet {
    online: AtomicUsize,
    present: AtomicUsize,
    possible: AtomicUsize,
    pub(crate) exclusion_applied: AtomicBool,
}

impl CpuSet {
    /// Set where every possible unit is also present and online.
    pub const fn new(possible: CpuMask) -> Self {
        Self::with_masks(possible, possible, possible)
    }

    pub const fn with_masks(online: CpuMask, present: CpuMask, possible: CpuMask) -> Self {
        Self {
            online: AtomicUsize::new(online.bits()),
            present: AtomicUsize::new(present.bits()),
            possible: AtomicUsize::new(possible.bits()),
            exclusion_applied: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn online(&self) -> CpuMask {
        CpuMask::from_bits(self.online.load(Ordering::Acquire))
    }

    #[inline]
    pub fn present(&self) -> CpuMask {
        CpuMask::from_bits(self.present.load(Ordering::Acquire))
    }

    #[inline]
    pub fn possible(&self) -> CpuMask {
        CpuMask::from_bits(self.possible.load(Ordering::Acquire))
    }

    #[inline]
    pub fn num_online(&self) -> usize {
        self.online().count()
    }

    #[inline]
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online().contains(cpu)
    }

    /// Marks `cpu` online or offline. Safe to call from the unit itself while it stops.
    pub fn set_online(&self, cpu: CpuId, online: bool) {
        update(&self.online, cpu, online);
    }

    pub fn set_present(&self, cpu: CpuId, present: bool) {
        update(&self.present, cpu, present);
    }

    pub fn set_possible(&self, cpu: CpuId, possible: bool) {
        update(&self.possible, cpu, possible);
    }

    /// Whether the one-time boot exclusion already ran against this set.
    pub fn exclusion_applied(&self) -> bool {
        self.exclusion_applied.load(Ordering::Acquire)
    }
}

fn update(mask: &AtomicUsize, cpu: CpuId, set: bool) {
    let bit = CpuMask::single(cpu).bits();
    if set {
        mask.fetch_or(bit, Ordering::AcqRel);
    } else {
        mask.fetch_and(!bit, Ordering::AcqRel);
    }
}
