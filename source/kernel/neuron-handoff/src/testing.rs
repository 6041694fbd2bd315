// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Recording mocks for the CPU, TLB and board hooks
//! OWNERS: @kernel-team
//! NOTE: Tests only. Every mock appends to one global trace so ordering across
//!       components can be asserted; tests touching it hold `lock()`.

use std::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::hal::{CpuControl, Tlb};
use crate::platform::{
    ExitCacheMode, LateReinit, NonEssentialCpus, OuterCache, PlatformHooks, ShutdownTimeout,
    ShutdownWait, StopSignal,
};
use crate::types::{CpuId, CpuMask, PhysAddr, VirtAddr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    DisableInterrupts,
    FlushCacheAll,
    ExitCacheMode,
    BoardExitCacheMode,
    OuterFlush,
    OuterDisable,
    FlushIcache { start: usize, len: usize },
    TlbFlush,
    SyncEntry,
    EnterStub(usize),
    Halt,
    LateReinit,
    RaiseStop(usize),
    WaitShutdown(u16),
    DisableNonessential,
}

static TRACE: Mutex<Vec<Event>> = Mutex::new(Vec::new());
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialises tests that share the trace or the scratch stack.
pub fn lock() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock();
    TRACE.lock().clear();
    guard
}

pub fn record(event: Event) {
    TRACE.lock().push(event);
}

/// Drains the trace.
pub fn take() -> Vec<Event> {
    core::mem::take(&mut *TRACE.lock())
}

/// Position of the first `event` in `trace`.
pub fn position(trace: &[Event], event: Event) -> Option<usize> {
    trace.iter().position(|candidate| *candidate == event)
}

pub const STUB_ENTERED: &str = "mock: stub entered";
pub const HALTED: &str = "mock: cpu halted";

/// CPU whose stub jump never comes back; observed through an unwind.
pub struct MockCpu;

/// CPU whose stub jump returns, which must end in `halt`.
pub struct ReturningStubCpu;

fn common_disable() {
    record(Event::DisableInterrupts);
}

impl CpuControl for MockCpu {
    fn current_cpu(&self) -> CpuId {
        CpuId::BOOT
    }

    fn disable_interrupts(&self) {
        common_disable();
    }

    fn flush_cache_all(&self) {
        record(Event::FlushCacheAll);
    }

    fn exit_cache_mode(&self) {
        record(Event::ExitCacheMode);
    }

    fn flush_icache_range(&self, start: VirtAddr, len: usize) {
        record(Event::FlushIcache { start: start.raw(), len });
    }

    unsafe fn enter_stub(&self, entry: PhysAddr) {
        record(Event::EnterStub(entry.raw()));
        panic!("{}", STUB_ENTERED);
    }

    fn halt(&self) -> ! {
        record(Event::Halt);
        panic!("{}", HALTED);
    }
}

impl CpuControl for ReturningStubCpu {
    fn current_cpu(&self) -> CpuId {
        CpuId::BOOT
    }

    fn disable_interrupts(&self) {
        common_disable();
    }

    fn flush_cache_all(&self) {
        record(Event::FlushCacheAll);
    }

    fn exit_cache_mode(&self) {
        record(Event::ExitCacheMode);
    }

    fn flush_icache_range(&self, start: VirtAddr, len: usize) {
        record(Event::FlushIcache { start: start.raw(), len });
    }

    unsafe fn enter_stub(&self, entry: PhysAddr) {
        record(Event::EnterStub(entry.raw()));
    }

    fn halt(&self) -> ! {
        record(Event::Halt);
        panic!("{}", HALTED);
    }
}

pub struct MockTlb;

impl Tlb for MockTlb {
    fn flush_all(&self) {
        record(Event::TlbFlush);
    }

    fn sync_table_entry(&self, _entry: *const u32) {
        record(Event::SyncEntry);
    }
}

pub struct MockStop;

impl StopSignal for MockStop {
    fn raise_stop(&self, targets: CpuMask) {
        record(Event::RaiseStop(targets.bits()));
    }
}

pub struct MockShutdown;

impl ShutdownWait for MockShutdown {
    fn wait_cpu_shutdown(&self, cpu: CpuId) -> Result<(), ShutdownTimeout> {
        record(Event::WaitShutdown(cpu.as_raw()));
        Ok(())
    }
}

pub struct MockOuter;

impl OuterCache for MockOuter {
    fn flush_all(&self) {
        record(Event::OuterFlush);
    }

    fn disable(&self) {
        record(Event::OuterDisable);
    }
}

pub struct MockExit;

impl ExitCacheMode for MockExit {
    fn exit_cache_mode(&self) {
        record(Event::BoardExitCacheMode);
    }
}

pub struct MockReinit;

impl LateReinit for MockReinit {
    fn reinit(&self) {
        record(Event::LateReinit);
    }
}

pub struct MockNonessential;

impl NonEssentialCpus for MockNonessential {
    fn disable_nonessential(&self) {
        record(Event::DisableNonessential);
    }
}

/// Board exposing a configurable subset of the recording hooks.
#[derive(Clone, Copy, Default)]
pub struct Board {
    pub stop: bool,
    pub wait: bool,
    pub outer: bool,
    pub exit: bool,
    pub reinit: bool,
    pub nonessential: bool,
}

impl Board {
    pub const FULL: Self = Self {
        stop: true,
        wait: true,
        outer: true,
        exit: true,
        reinit: true,
        nonessential: true,
    };
}

impl PlatformHooks for Board {
    fn stop_signal(&self) -> Option<&'static dyn StopSignal> {
        self.stop.then_some(&MockStop as &'static dyn StopSignal)
    }

    fn shutdown_wait(&self) -> Option<&'static dyn ShutdownWait> {
        self.wait.then_some(&MockShutdown as &'static dyn ShutdownWait)
    }

    fn outer_cache(&self) -> Option<&'static dyn OuterCache> {
        self.outer.then_some(&MockOuter as &'static dyn OuterCache)
    }

    fn exit_cache_mode(&self) -> Option<&'static dyn ExitCacheMode> {
        self.exit.then_some(&MockExit as &'static dyn ExitCacheMode)
    }

    fn late_reinit(&self) -> Option<&'static dyn LateReinit> {
        self.reinit.then_some(&MockReinit as &'static dyn LateReinit)
    }

    fn nonessential_cpus(&self) -> Option<&'static dyn NonEssentialCpus> {
        self.nonessential.then_some(&MockNonessential as &'static dyn NonEssentialCpus)
    }
}

/// Runs `f`, which must end by unwinding, and returns the panic message.
pub fn expect_unwind<F: FnOnce()>(f: F) -> std::string::String {
    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .expect_err("terminal path returned normally");
    if let Some(msg) = err.downcast_ref::<std::string::String>() {
        msg.clone()
    } else if let Some(msg) = err.downcast_ref::<&str>() {
        std::string::String::from(*msg)
    } else {
        std::string::String::new()
    }
}
