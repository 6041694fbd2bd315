// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARMv7-A helpers used by the handoff engine.
//!
//! Cache and TLB maintenance goes through CP15. Host builds compile every
//! instruction away so the decoding logic stays testable with `cargo test`.

#[cfg(all(target_arch = "arm", target_os = "none"))]
use core::arch::asm;

use crate::hal::{CpuControl, Delay, Tlb};
use crate::types::{CpuId, PhysAddr, VirtAddr};

/// SCTLR.I, instruction cache enable.
const SCTLR_I: u32 = 1 << 12;
/// SCTLR.C and SCTLR.A.
const SCTLR_C_A: u32 = 0b110;
const MPIDR_AFF0: u32 = 0xff;
const USEC_PER_SEC: u64 = 1_000_000;

/// Function run by [`call_with_stack`]; receives `arg` in the first argument register.
pub type StackEntry = extern "C-unwind" fn(usize) -> !;

/// Switches to the stack whose top is `stack_top` and calls `entry(arg)` there.
///
/// # Safety
///
/// `stack_top` must be 8-byte aligned and the memory below it must stay mapped
/// for as long as `entry` runs. Nothing on the old stack may be used afterwards.
pub unsafe fn call_with_stack(entry: StackEntry, arg: usize, stack_top: usize) -> ! {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    unsafe {
        asm!(
            "mov sp, {stack}",
            "bx {entry}",
            stack = in(reg) stack_top,
            entry = in(reg) entry as usize,
            in("r0") arg,
            options(noreturn)
        )
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        let _ = stack_top;
        entry(arg)
    }
}

/// Geometry of one cache level, decoded from CCSIDR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    pub line_shift: u32,
    pub ways: u32,
    pub sets: u32,
}

impl CacheGeometry {
    pub const fn from_ccsidr(ccsidr: u32) -> Self {
        Self {
            line_shift: (ccsidr & 0x7) + 4,
            ways: ((ccsidr >> 3) & 0x3ff) + 1,
            sets: ((ccsidr >> 13) & 0x7fff) + 1,
        }
    }

    pub const fn way_shift(&self) -> u32 {
        (self.ways - 1).leading_zeros()
    }

    /// Operand for a set/way maintenance instruction.
    pub fn setway(&self, level: u32, way: u32, set: u32) -> u32 {
        // A direct-mapped cache has no way field; the shift would be 32.
        way.checked_shl(self.way_shift()).unwrap_or(0) | (set << self.line_shift) | (level << 1)
    }
}

/// Cache levels up to the point of coherency that hold data.
pub fn data_cache_levels(clidr: u32) -> impl Iterator<Item = u32> {
    let loc = (clidr >> 24) & 0x7;
    (0..loc).filter(move |level| (clidr >> (level * 3)) & 0x7 >= 2)
}

/// Smallest data cache line in bytes, from CTR.DminLine.
pub const fn dcache_line_size(ctr: u32) -> usize {
    4 << ((ctr >> 16) & 0xf)
}

/// Counter ticks covering at least `us` microseconds.
pub const fn ticks_for_us(freq_hz: u32, us: u32) -> u64 {
    (freq_hz as u64 * us as u64).div_ceil(USEC_PER_SEC)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod cp15 {
    use core::arch::asm;

    macro_rules! mrc {
        ($opc1:literal, $crn:literal, $crm:literal, $opc2:literal) => {{
            let value: u32;
            // SAFETY: reads an identification or control register; no side effects.
            unsafe {
                asm!(
                    concat!("mrc p15, ", $opc1, ", {0}, ", $crn, ", ", $crm, ", ", $opc2),
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                )
            };
            value
        }};
    }

    macro_rules! mcr {
        ($opc1:literal, $crn:literal, $crm:literal, $opc2:literal, $value:expr) => {{
            let value: u32 = $value;
            // SAFETY: privileged maintenance operation; callers sequence the barriers.
            unsafe {
                asm!(
                    concat!("mcr p15, ", $opc1, ", {0}, ", $crn, ", ", $crm, ", ", $opc2),
                    in(reg) value,
                    options(nostack, preserves_flags)
                )
            };
        }};
    }

    #[inline(always)]
    pub fn dsb() {
        // SAFETY: barrier only.
        unsafe { asm!("dsb", options(nostack, preserves_flags)) };
    }

    #[inline(always)]
    pub fn isb() {
        // SAFETY: barrier only.
        unsafe { asm!("isb", options(nostack, preserves_flags)) };
    }

    pub fn clidr() -> u32 {
        mrc!("1", "c0", "c0", "1")
    }

    pub fn ccsidr(level: u32) -> u32 {
        mcr!("2", "c0", "c0", "0", level << 1);
        isb();
        mrc!("1", "c0", "c0", "0")
    }

    pub fn ctr() -> u32 {
        mrc!("0", "c0", "c0", "1")
    }

    pub fn mpidr() -> u32 {
        mrc!("0", "c0", "c0", "5")
    }

    pub fn sctlr() -> u32 {
        mrc!("0", "c1", "c0", "0")
    }

    pub fn set_sctlr(value: u32) {
        mcr!("0", "c1", "c0", "0", value);
    }

    pub fn dccisw(op: u32) {
        mcr!("0", "c7", "c14", "2", op);
    }

    pub fn dccmvau(addr: u32) {
        mcr!("0", "c7", "c11", "1", addr);
    }

    pub fn dccmvac(addr: u32) {
        mcr!("0", "c7", "c10", "1", addr);
    }

    pub fn iciallu() {
        mcr!("0", "c7", "c5", "0", 0);
    }

    pub fn bpiall() {
        mcr!("0", "c7", "c5", "6", 0);
    }

    pub fn tlbiallis() {
        mcr!("0", "c8", "c3", "0", 0);
    }

    pub fn cntfrq() -> u32 {
        mrc!("0", "c14", "c0", "0")
    }

    pub fn cntpct() -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: reads the physical counter.
        unsafe {
            asm!("mrrc p15, 0, {0}, {1}, c14", out(reg) lo, out(reg) hi, options(nomem, nostack, preserves_flags))
        };
        ((hi as u64) << 32) | lo as u64
    }
}

/// The executing ARMv7-A core.
pub struct Armv7;

impl Armv7 {
    /// Cleans and invalidates every data cache level by set/way.
    fn flush_dcache_all(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            cp15::dsb();
            let clidr = cp15::clidr();
            for level in data_cache_levels(clidr) {
                let geometry = CacheGeometry::from_ccsidr(cp15::ccsidr(level));
                for way in 0..geometry.ways {
                    for set in 0..geometry.sets {
                        cp15::dccisw(geometry.setway(level, way, set));
                    }
                }
            }
            cp15::dsb();
            cp15::isb();
        }
    }
}

impl CpuControl for Armv7 {
    fn current_cpu(&self) -> CpuId {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            CpuId::from_raw((cp15::mpidr() & MPIDR_AFF0) as u16)
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = MPIDR_AFF0;
            CpuId::BOOT
        }
    }

    fn disable_interrupts(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        // SAFETY: masks IRQ and FIQ on the executing core only.
        unsafe {
            asm!("cpsid if", options(nomem, nostack, preserves_flags));
        }
    }

    fn flush_cache_all(&self) {
        self.flush_dcache_all();
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            cp15::iciallu();
            cp15::bpiall();
            cp15::dsb();
            cp15::isb();
        }
    }

    fn exit_cache_mode(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            let sctlr = cp15::sctlr() & !(SCTLR_I | SCTLR_C_A);
            cp15::set_sctlr(sctlr);
            cp15::isb();
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = (SCTLR_I, SCTLR_C_A);
        }
    }

    fn flush_icache_range(&self, start: VirtAddr, len: usize) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            let line = dcache_line_size(cp15::ctr());
            let mut addr = start.raw() & !(line - 1);
            let end = start.raw() + len;
            while addr < end {
                cp15::dccmvau(addr as u32);
                addr += line;
            }
            cp15::dsb();
            cp15::iciallu();
            cp15::bpiall();
            cp15::dsb();
            cp15::isb();
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = (start, len);
        }
    }

    unsafe fn enter_stub(&self, entry: PhysAddr) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        // SAFETY: the caller guarantees an identity-mapped stub at `entry`. A
        // return lands back here and is handled by the caller.
        unsafe {
            asm!("blx {0}", in(reg) entry.raw(), clobber_abi("C"));
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = entry;
        }
    }

    fn halt(&self) -> ! {
        loop {
            #[cfg(all(target_arch = "arm", target_os = "none"))]
            // SAFETY: masks interrupts and parks the core.
            unsafe {
                asm!("cpsid if", "wfi", options(nomem, nostack));
            }
            #[cfg(not(all(target_arch = "arm", target_os = "none")))]
            core::hint::spin_loop();
        }
    }
}

impl Tlb for Armv7 {
    fn flush_all(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            cp15::dsb();
            cp15::tlbiallis();
            cp15::bpiall();
            cp15::dsb();
            cp15::isb();
        }
    }

    fn sync_table_entry(&self, entry: *const u32) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            cp15::dccmvac(entry as u32);
            cp15::dsb();
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = entry;
        }
    }
}

/// Busy-wait delay on the ARM generic timer physical counter.
pub struct GenericTimer;

impl Delay for GenericTimer {
    fn udelay(&self, us: u32) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            let ticks = ticks_for_us(cp15::cntfrq(), us);
            let start = cp15::cntpct();
            while cp15::cntpct().wrapping_sub(start) < ticks {
                core::hint::spin_loop();
            }
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            let _ = us;
        }
    }
}
