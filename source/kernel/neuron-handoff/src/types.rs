// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the handoff components (addresses, CPU identity, CPU masks)
//! OWNERS: @kernel-team
//! PUBLIC API: PhysAddr, VirtAddr, CpuId, CpuMask
//! DEPENDS_ON: core only
//! INVARIANTS: CpuId indices are bounded by CpuMask::CAPACITY; addresses are plain machine words
//!
//! Physical and virtual addresses are kept distinct so the control page's two
//! views cannot be swapped by accident at a call site.

use core::fmt;

/// Physical address (machine word).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }

    #[inline]
    pub const fn checked_add(self, v: usize) -> Option<Self> {
        match self.0.checked_add(v) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Kernel virtual address (machine word).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Logical processing-unit index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    /// The unit that brought the system up.
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == Self::BOOT.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Plain (non-atomic) snapshot of a set of CPUs.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CpuMask(usize);

impl CpuMask {
    /// Maximum number of units a mask can describe.
    pub const CAPACITY: usize = usize::BITS as usize;

    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn single(cpu: CpuId) -> Self {
        if cpu.as_index() < Self::CAPACITY {
            Self(1usize << cpu.as_index())
        } else {
            Self::EMPTY
        }
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu.as_index() < Self::CAPACITY && self.0 & (1usize << cpu.as_index()) != 0
    }

    #[inline]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | Self::single(cpu).0)
    }

    #[inline]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !Self::single(cpu).0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the members in ascending id order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let idx = rest.trailing_zeros();
            rest &= rest - 1;
            Some(CpuId::from_raw(idx as u16))
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
