// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal PL011 UART support for handoff diagnostics.
//!
//! Host builds compile the writers to no-ops so log calls stay harmless in unit tests.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::DEFAULT_UART_BASE;

const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
const FR_TXFF: u32 = 1 << 5;

/// Global UART writer used for logs before the handoff commits.
static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(DEFAULT_UART_BASE));

/// Base read by the lock-free writer.
static RAW_BASE: AtomicUsize = AtomicUsize::new(DEFAULT_UART_BASE);

/// Points both writers at the board's PL011.
///
/// Call once during board bring-up, before the window at `base` is relied on for logs.
pub fn set_base(base: usize) {
    UART0.lock().base = base;
    RAW_BASE.store(base, Ordering::Release);
}

/// Base address the diagnostics currently go to.
pub fn base() -> usize {
    RAW_BASE.load(Ordering::Acquire)
}

/// UART implementation capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Creates a UART abstraction rooted at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the boot UART singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    fn write_raw(&self, value: u8) {
        write_mmio(self.base, value);
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
#[inline]
fn write_mmio(base: usize, value: u8) {
    // SAFETY: `base` is the PL011 MMIO window, identity/device mapped by the running kernel
    // and kept reachable by the handoff identity map.
    unsafe {
        while core::ptr::read_volatile((base + UART_FR) as *const u32) & FR_TXFF != 0 {}
        core::ptr::write_volatile((base + UART_DR) as *mut u32, value as u32);
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
#[inline]
fn write_mmio(base: usize, value: u8) {
    let _ = (base, value, UART_DR, UART_FR, FR_TXFF);
}

// Raw, lock-free UART emission for the committed handoff path where the mutex may be held
// by a unit that has already been stopped.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let base = base();
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                write_mmio(base, b'\r');
            }
            write_mmio(base, byte);
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_raw(b'\r');
            }
            self.write_raw(byte);
        }
        Ok(())
    }
}
