// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Parameter staging for the relocation stub
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable (cell layout is a stable ABI with the stub)
//! TEST_COVERAGE: Unit tests + proptest round-trip through host-backed control pages
//! PUBLIC API: RelocationParameters, StagedStub, stage(), read_parameters(), StageError
//! DEPENDS_ON: image::{ImageDescriptor, RelocationStub}, hal::CpuControl (icache maintenance)
//! INVARIANTS: Cells fully written before the terminal jump; stub bytes copied verbatim;
//!             icache flushed over the control page after both writes

use core::fmt;
use core::mem::{align_of, offset_of, size_of};

use static_assertions::const_assert_eq;

use crate::hal::CpuControl;
use crate::image::{ImageDescriptor, RelocationStub, CONTROL_PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};

const WORD: usize = size_of::<usize>();

/// Values the stub reads after the jump, in cell order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocationParameters {
    pub start_address: usize,
    pub indirection_page: usize,
    pub machine_type: usize,
    pub boot_params: usize,
}

const_assert_eq!(size_of::<RelocationParameters>(), 4 * WORD);
const_assert_eq!(align_of::<RelocationParameters>(), WORD);
const_assert_eq!(offset_of!(RelocationParameters, start_address), 0);
const_assert_eq!(offset_of!(RelocationParameters, indirection_page), WORD);
const_assert_eq!(offset_of!(RelocationParameters, machine_type), 2 * WORD);
const_assert_eq!(offset_of!(RelocationParameters, boot_params), 3 * WORD);

impl RelocationParameters {
    pub const fn from_image(image: &ImageDescriptor, machine_id: usize) -> Self {
        Self {
            start_address: image.entry.raw(),
            indirection_page: image.indirection_page().raw(),
            machine_type: machine_id,
            boot_params: image.boot_params().raw(),
        }
    }
}

impl fmt::Display for RelocationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start=0x{:x} indirection=0x{:x} mach=0x{:x} boot_params=0x{:x}",
            self.start_address, self.indirection_page, self.machine_type, self.boot_params
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageError {
    NullEntry,
    /// Stub bytes or cells would run past the control page.
    ControlPageTooSmall { needed: usize, available: usize },
    MisalignedCells,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::NullEntry => f.write_str("refusing to stage a null entry address"),
            StageError::ControlPageTooSmall { needed, available } => {
                write!(f, "control page too small ({needed} > {available} bytes)")
            }
            StageError::MisalignedCells => f.write_str("parameter cells not word aligned"),
        }
    }
}

/// Stub installed on the control page, ready to be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedStub {
    /// Physical address the terminal jump targets.
    pub entry: PhysAddr,
    /// Bytes of the control page in use, from `entry`.
    pub len: usize,
    /// Kernel mapping of the parameter cells.
    pub cells: VirtAddr,
    pub params: RelocationParameters,
}

/// Copies `stub` onto the control page and writes `params` into its cells.
///
/// # Safety
///
/// The control page described by `image` must be a live, writable mapping that
/// nothing else touches until the terminal jump.
pub unsafe fn stage(
    image: &ImageDescriptor,
    stub: &RelocationStub<'_>,
    params: RelocationParameters,
    cpu: &dyn CpuControl,
) -> Result<StagedStub, StageError> {
    if image.entry.is_null() {
        return Err(StageError::NullEntry);
    }
    let page = image.control_page;
    let available = page.len().min(CONTROL_PAGE_SIZE);
    if stub.footprint() > available {
        return Err(StageError::ControlPageTooSmall { needed: stub.footprint(), available });
    }
    let cells = page
        .virt()
        .raw()
        .checked_add(stub.params_offset())
        .map(VirtAddr::new)
        .ok_or(StageError::ControlPageTooSmall { needed: stub.footprint(), available })?;
    if cells.raw() % align_of::<RelocationParameters>() != 0 {
        return Err(StageError::MisalignedCells);
    }

    let base: *mut u8 = page.virt().as_mut_ptr();
    // SAFETY: the footprint check keeps both the copy and the cell writes inside the
    // control page; the caller guarantees exclusive access to it.
    unsafe {
        core::ptr::copy_nonoverlapping(stub.code().as_ptr(), base, stub.len());
        let slot: *mut usize = cells.as_mut_ptr();
        core::ptr::write_volatile(slot, params.start_address);
        core::ptr::write_volatile(slot.add(1), params.indirection_page);
        core::ptr::write_volatile(slot.add(2), params.machine_type);
        core::ptr::write_volatile(slot.add(3), params.boot_params);
    }

    cpu.flush_icache_range(page.virt(), available);

    log_debug!(
        target: "handoff",
        "control page: virt={} phys={} stub={}B",
        page.virt(),
        page.phys(),
        stub.len()
    );
    #[cfg(feature = "debug_uart")]
    log_info!(target: "handoff", "staged {}", params);

    Ok(StagedStub { entry: page.phys(), len: stub.footprint(), cells, params })
}

/// Reads the four cells back from a staged control page.
///
/// # Safety
///
/// `staged` must come from [`stage`] and its control page must still be mapped.
pub unsafe fn read_parameters(staged: &StagedStub) -> RelocationParameters {
    let slot: *const usize = staged.cells.as_mut_ptr::<usize>();
    // SAFETY: `stage` validated alignment and bounds of these four words.
    unsafe {
        RelocationParameters {
            start_address: core::ptr::read_volatile(slot),
            indirection_page: core::ptr::read_volatile(slot.add(1)),
            machine_type: core::ptr::read_volatile(slot.add(2)),
            boot_params: core::ptr::read_volatile(slot.add(3)),
        }
    }
}
