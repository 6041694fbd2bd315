// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Staged-image descriptor handed over by the loader, plus the relocation stub blob
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (entry decoding, boot-params derivation, descriptor validation)
//! PUBLIC API: ImageDescriptor, ControlPage, RelocationEntry, EntryFlags, RelocationStub,
//!             DescriptorError
//! DEPENDS_ON: types::{PhysAddr, VirtAddr}, stage::RelocationParameters (cell layout size)
//! INVARIANTS: Read-only to the engine; control page large enough for the stub and its cells

use bitflags::bitflags;
use core::fmt;

use crate::stage::RelocationParameters;
use crate::types::{PhysAddr, VirtAddr};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);
/// Bytes reserved for the relocation stub and its parameter cells.
pub const CONTROL_PAGE_SIZE: usize = PAGE_SIZE;
/// Load offset of a compressed image from the start of RAM.
pub const ZIMAGE_OFFSET: usize = 0x8000;
/// Offset of the boot-parameter block from the start of RAM.
pub const ATAGS_OFFSET: usize = 0x1000;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Kind bits carried in the low bits of a relocation-list word.
    pub struct EntryFlags: usize {
        const DESTINATION = 1 << 0;
        const INDIRECTION = 1 << 1;
        const DONE = 1 << 2;
        const SOURCE = 1 << 3;
    }
}

/// One word of the page-relocation list walked by the stub.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RelocationEntry(usize);

impl RelocationEntry {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !PAGE_MASK)
    }

    /// Page address carried by the entry.
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & PAGE_MASK)
    }

    /// An empty list or one with at least one recognised kind bit.
    pub fn is_well_formed(self) -> bool {
        self.0 == 0 || !self.flags().is_empty()
    }
}

impl fmt::Debug for RelocationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelocationEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Physically backed page that receives the relocation stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlPage {
    phys: PhysAddr,
    virt: VirtAddr,
    len: usize,
}

impl ControlPage {
    /// Describes a control page.
    ///
    /// # Safety
    ///
    /// `virt` must be a writable kernel mapping of `phys` spanning `len` bytes,
    /// exclusively owned by the handoff until the terminal jump.
    pub const unsafe fn new(phys: PhysAddr, virt: VirtAddr, len: usize) -> Self {
        Self { phys, virt, len }
    }

    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub const fn virt(&self) -> VirtAddr {
        self.virt
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Position-independent blob that performs the page copy and enters the new image.
///
/// The stub carries its own parameter cells at `params_offset`; the staging unit
/// fills them after copying the blob.
#[derive(Clone, Copy, Debug)]
pub struct RelocationStub<'a> {
    code: &'a [u8],
    params_offset: usize,
}

impl<'a> RelocationStub<'a> {
    pub const fn new(code: &'a [u8], params_offset: usize) -> Self {
        Self { code, params_offset }
    }

    pub const fn code(&self) -> &'a [u8] {
        self.code
    }

    pub const fn len(&self) -> usize {
        self.code.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub const fn params_offset(&self) -> usize {
        self.params_offset
    }

    /// Bytes the control page must hold: the blob, or the cells if they sit past its end.
    ///
    /// Saturates at `usize::MAX` so an absurd cell offset can never fit a page.
    pub const fn footprint(&self) -> usize {
        let cells_end = match self
            .params_offset
            .checked_add(core::mem::size_of::<RelocationParameters>())
        {
            Some(end) => end,
            None => usize::MAX,
        };
        if cells_end > self.code.len() {
            cells_end
        } else {
            self.code.len()
        }
    }
}

/// Errors reported while validating a descriptor ahead of the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// The new image has no entry point.
    NullEntry,
    /// Stub (plus cells) does not fit the control page.
    StubTooLarge { needed: usize, available: usize },
    /// Parameter cells are not word aligned inside the stub.
    MisalignedCells,
    /// Control page is not page aligned in physical memory.
    UnalignedControlPage,
    /// Relocation-list head carries no recognised kind bits.
    MalformedRelocationHead,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::NullEntry => f.write_str("image entry address is null"),
            DescriptorError::StubTooLarge { needed, available } => {
                write!(f, "stub needs {needed} bytes, control page has {available}")
            }
            DescriptorError::MisalignedCells => f.write_str("stub parameter cells misaligned"),
            DescriptorError::UnalignedControlPage => f.write_str("control page not page aligned"),
            DescriptorError::MalformedRelocationHead => {
                f.write_str("relocation list head has no kind bits")
            }
        }
    }
}

/// Descriptor of the staged replacement image.
#[derive(Clone, Copy, Debug)]
pub struct ImageDescriptor {
    /// Physical entry point of the new image.
    pub entry: PhysAddr,
    /// Head word of the page-relocation list.
    pub head: RelocationEntry,
    pub control_page: ControlPage,
    /// Explicit boot-parameter block; derived from `entry` when absent.
    pub boot_params: Option<PhysAddr>,
}

impl ImageDescriptor {
    /// Page holding the first relocation-list words.
    pub const fn indirection_page(&self) -> PhysAddr {
        self.head.addr()
    }

    /// Boot-parameter block address handed to the new image.
    pub const fn boot_params(&self) -> PhysAddr {
        match self.boot_params {
            Some(addr) => addr,
            None => PhysAddr::new(
                self.entry
                    .raw()
                    .wrapping_sub(ZIMAGE_OFFSET)
                    .wrapping_add(ATAGS_OFFSET),
            ),
        }
    }

    /// Checks everything that can be checked without touching hardware.
    pub fn validate(&self, stub: &RelocationStub<'_>) -> Result<(), DescriptorError> {
        if self.entry.is_null() {
            return Err(DescriptorError::NullEntry);
        }
        if !self.control_page.phys().is_aligned(PAGE_SIZE) {
            return Err(DescriptorError::UnalignedControlPage);
        }
        if stub.params_offset() % core::mem::align_of::<RelocationParameters>() != 0 {
            return Err(DescriptorError::MisalignedCells);
        }
        let available = self.control_page.len().min(CONTROL_PAGE_SIZE);
        if stub.footprint() > available {
            return Err(DescriptorError::StubTooLarge { needed: stub.footprint(), available });
        }
        if !self.head.is_well_formed() {
            return Err(DescriptorError::MalformedRelocationHead);
        }
        Ok(())
    }
}
