// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! These are the primitives the engine always needs from the executing CPU.
//! Board-specific, optionally absent hooks live in [`crate::platform`].

use crate::types::{CpuId, PhysAddr, VirtAddr};

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);

    /// Makes a freshly written translation-table entry visible to the table walker.
    fn sync_table_entry(&self, entry: *const u32) {
        let _ = entry;
    }
}

/// Busy-wait delay source usable without a scheduler.
pub trait Delay {
    /// Spins for at least `us` microseconds.
    fn udelay(&self, us: u32);
}

/// Local CPU control used by staging and by the terminal transition.
///
/// Implementations must be callable with interrupts masked, on the scratch
/// stack, and without touching per-task state.
pub trait CpuControl: Sync {
    /// Identifier of the executing CPU.
    fn current_cpu(&self) -> CpuId;

    /// Masks both normal and fast interrupts on the executing CPU.
    fn disable_interrupts(&self);

    /// Cleans and invalidates every data cache level, then the instruction cache.
    fn flush_cache_all(&self);

    /// Built-in "stop caching" sequence (caches off, MMU left as is).
    fn exit_cache_mode(&self);

    /// Makes freshly written code in `[start, start + len)` visible to instruction fetch.
    fn flush_icache_range(&self, start: VirtAddr, len: usize);

    /// Branches to the relocation stub at `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must be identity mapped and hold a staged stub. A return from this
    /// call means the stub came back, which the caller treats as fatal.
    unsafe fn enter_stub(&self, entry: PhysAddr);

    /// Stops the executing CPU for good.
    fn halt(&self) -> !;
}
