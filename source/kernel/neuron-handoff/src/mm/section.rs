// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARMv7 short-descriptor first-level table populated with 1 MiB sections.
//!
//! Only section descriptors are ever written; no second-level tables exist on
//! this path, so building a mapping never allocates.

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::hal::Tlb;
use crate::types::PhysAddr;

/// Size of one section mapping in bytes.
pub const SECTION_SIZE: usize = 1 << SECTION_SHIFT;
pub const SECTION_SHIFT: usize = 20;
/// Entries in a first-level table (4 GiB / 1 MiB).
pub const L1_ENTRIES: usize = 4096;
/// Top of the 32-bit address space the table translates.
const ADDRESS_LIMIT: u64 = 1 << 32;
const SECTION_BASE_MASK: u32 = !((SECTION_SIZE as u32) - 1);
const DESCRIPTOR_TYPE_MASK: u32 = 0b11;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Attribute bits of a first-level section descriptor.
    pub struct SectionFlags: u32 {
        const SECTION = 0b10;
        const BUFFERABLE = 1 << 2;
        const CACHEABLE = 1 << 3;
        const EXECUTE_NEVER = 1 << 4;
        const AP_WRITE = 1 << 10;
        const AP_READ = 1 << 11;
        const SHARED = 1 << 16;
        const NOT_GLOBAL = 1 << 17;
    }
}

impl SectionFlags {
    /// Privileged read/write section used for the identity map.
    pub const IDENTITY: Self = Self::SECTION.union(Self::AP_READ).union(Self::AP_WRITE);
}

/// Error returned when building section mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Base or end was not section aligned.
    Unaligned,
    /// `end` does not lie above `base`.
    EmptyRange,
    /// Range extends past the 32-bit address space.
    OutOfRange,
    /// A region that must stay reachable is not covered by the mapping.
    NotCovered,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Unaligned => f.write_str("range not section aligned"),
            MapError::EmptyRange => f.write_str("empty identity range"),
            MapError::OutOfRange => f.write_str("range beyond 4 GiB"),
            MapError::NotCovered => f.write_str("region not covered by identity map"),
        }
    }
}

/// Backing storage of a first-level translation table.
#[repr(C, align(16384))]
pub struct SectionTablePage {
    entries: [u32; L1_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<SectionTablePage>(), 16 * 1024);

impl SectionTablePage {
    /// An all-fault table.
    pub const fn new() -> Self {
        Self { entries: [0; L1_ENTRIES] }
    }

    /// Borrows the live table at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be the kernel mapping of a first-level table that the caller may
    /// rewrite, valid for `'a`.
    pub unsafe fn from_raw<'a>(ptr: *mut SectionTablePage) -> &'a mut SectionTablePage {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *ptr }
    }

    /// Raw descriptor covering `va`.
    pub fn entry(&self, va: usize) -> u32 {
        self.entries[(va >> SECTION_SHIFT) % L1_ENTRIES]
    }

    /// Every section descriptor currently installed, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = MappingEntry> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, raw)| **raw & DESCRIPTOR_TYPE_MASK == SectionFlags::SECTION.bits())
            .map(|(index, raw)| MappingEntry {
                virt: index << SECTION_SHIFT,
                phys: PhysAddr::new((raw & SECTION_BASE_MASK) as usize),
                size: SECTION_SIZE,
                attrs: SectionFlags::from_bits_truncate(raw & !SECTION_BASE_MASK),
            })
    }

    fn write_section(&mut self, tlb: &dyn Tlb, addr: usize, flags: SectionFlags) {
        let index = addr >> SECTION_SHIFT;
        let slot = &mut self.entries[index];
        // SAFETY: `slot` is a live element of this table. The table walker reads it
        // concurrently, hence the volatile store.
        unsafe { core::ptr::write_volatile(slot, addr as u32 | flags.bits()) };
        tlb.sync_table_entry(slot as *const u32);
    }
}

impl Default for SectionTablePage {
    fn default() -> Self {
        Self::new()
    }
}

/// One installed translation, `virt -> phys` over `size` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingEntry {
    pub virt: usize,
    pub phys: PhysAddr,
    pub size: usize,
    pub attrs: SectionFlags,
}

impl MappingEntry {
    pub fn is_identity(&self) -> bool {
        self.phys.raw() == self.virt
    }
}

/// Summary of a built identity range, `[base, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityMapping {
    base: PhysAddr,
    end: PhysAddr,
    attrs: SectionFlags,
}

impl IdentityMapping {
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    pub const fn end(&self) -> PhysAddr {
        self.end
    }

    pub const fn attrs(&self) -> SectionFlags {
        self.attrs
    }

    pub const fn sections(&self) -> usize {
        (self.end.raw() - self.base.raw()) >> SECTION_SHIFT
    }

    /// Whether `[addr, addr + len)` lies inside the mapping.
    pub fn covers(&self, addr: PhysAddr, len: usize) -> bool {
        match addr.raw().checked_add(len) {
            Some(last) => addr.raw() >= self.base.raw() && last <= self.end.raw(),
            None => false,
        }
    }

    /// Entries this mapping consists of, in address order.
    pub fn entries(&self) -> impl Iterator<Item = MappingEntry> {
        let attrs = self.attrs;
        (self.base.raw()..self.end.raw())
            .step_by(SECTION_SIZE)
            .map(move |addr| MappingEntry {
                virt: addr,
                phys: PhysAddr::new(addr),
                size: SECTION_SIZE,
                attrs,
            })
    }
}

/// Widens `[addr, addr + len)` to the enclosing section boundaries.
pub fn section_align_range(addr: PhysAddr, len: usize) -> Option<(PhysAddr, PhysAddr)> {
    let mask = SECTION_SIZE - 1;
    let end = addr.raw().checked_add(len)?.checked_add(mask)? & !mask;
    Some((PhysAddr::new(addr.raw() & !mask), PhysAddr::new(end)))
}

/// Installs read/write identity sections over `[base, end)` in `table`.
///
/// Both bounds must already be section aligned. The TLB is flushed after every
/// section written so no stale translation survives a partial update.
pub fn build_identity_map(
    table: &mut SectionTablePage,
    tlb: &dyn Tlb,
    base: PhysAddr,
    end: PhysAddr,
) -> Result<IdentityMapping, MapError> {
    if !base.is_aligned(SECTION_SIZE) || !end.is_aligned(SECTION_SIZE) {
        return Err(MapError::Unaligned);
    }
    if end.raw() <= base.raw() {
        return Err(MapError::EmptyRange);
    }
    if end.raw() as u64 > ADDRESS_LIMIT {
        return Err(MapError::OutOfRange);
    }

    let attrs = SectionFlags::IDENTITY;
    let mut addr = base.raw();
    while addr < end.raw() {
        table.write_section(tlb, addr, attrs);
        tlb.flush_all();
        #[cfg(feature = "debug_uart")]
        log_debug!(target: "handoff", "idmap section 0x{:08x}", addr);
        addr += SECTION_SIZE;
    }

    let mapping = IdentityMapping { base, end, attrs };
    log_debug!(
        target: "handoff",
        "identity map {}..{} ({} sections)",
        base,
        end,
        mapping.sections()
    );
    Ok(mapping)
}
