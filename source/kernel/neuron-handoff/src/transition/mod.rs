// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Terminal cache/MMU transition ("soft restart") into the relocation stub
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (state successor table, event ordering via recording mocks,
//!                post-jump halt path)
//! PUBLIC API: soft_restart() (unsafe), scratch_stack(), TerminalFrame, TransitionState, Sequence, fatal()
//! DEPENDS_ON: hal::CpuControl, platform::{OuterCache, ExitCacheMode}, arch::call_with_stack
//! INVARIANTS: Strict state order ENTERED -> ... -> JUMPED; flush before disable before jump;
//!             runs on the static scratch stack; no allocation, no locks, raw logging only;
//!             any return from the stub halts the CPU
//!
//! The caller's stack may not be covered by the identity map, so everything the
//! terminal path needs is copied into a [`TerminalFrame`] at the top of a
//! statically reserved stack before switching to it.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::{align_of, size_of};

use static_assertions::const_assert;

use crate::arch::call_with_stack;
use crate::hal::CpuControl;
use crate::platform::{ExitCacheMode, OuterCache};
use crate::types::{PhysAddr, VirtAddr};

/// States of the terminal sequence, in the only order they may be visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransitionState {
    Entered,
    IdentityMapped,
    CacheFlushed,
    OuterDisabled,
    CacheModeExited,
    FinalFlushed,
    Jumped,
}

impl TransitionState {
    pub const fn successor(self) -> Option<Self> {
        match self {
            TransitionState::Entered => Some(TransitionState::IdentityMapped),
            TransitionState::IdentityMapped => Some(TransitionState::CacheFlushed),
            TransitionState::CacheFlushed => Some(TransitionState::OuterDisabled),
            TransitionState::OuterDisabled => Some(TransitionState::CacheModeExited),
            TransitionState::CacheModeExited => Some(TransitionState::FinalFlushed),
            TransitionState::FinalFlushed => Some(TransitionState::Jumped),
            TransitionState::Jumped => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TransitionState::Entered => "ENTERED",
            TransitionState::IdentityMapped => "IDENTITY_MAPPED",
            TransitionState::CacheFlushed => "CACHE_FLUSHED",
            TransitionState::OuterDisabled => "OUTER_DISABLED",
            TransitionState::CacheModeExited => "CACHE_MODE_EXITED",
            TransitionState::FinalFlushed => "FINAL_FLUSHED",
            TransitionState::Jumped => "JUMPED",
        }
    }
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attempted move that skips or repeats a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceViolation {
    pub from: TransitionState,
    pub to: TransitionState,
}

/// Tracks progress through the terminal sequence.
#[derive(Debug)]
pub struct Sequence {
    state: TransitionState,
}

impl Sequence {
    pub const fn new() -> Self {
        Self { state: TransitionState::Entered }
    }

    pub const fn state(&self) -> TransitionState {
        self.state
    }

    /// Moves to `next` if it is the successor of the current state.
    pub fn advance(&mut self, next: TransitionState) -> Result<(), SequenceViolation> {
        match self.state.successor() {
            Some(expected) if expected == next => {
                self.state = next;
                Ok(())
            }
            _ => Err(SequenceViolation { from: self.state, to: next }),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the terminal path reads after the stack switch.
#[derive(Clone, Copy)]
pub struct TerminalFrame {
    pub cpu: &'static dyn CpuControl,
    pub outer: Option<&'static dyn OuterCache>,
    /// Board override of the built-in exit-cache-mode sequence.
    pub exit: Option<&'static dyn ExitCacheMode>,
    /// Physical entry of the relocation stub.
    pub entry: PhysAddr,
}

const SCRATCH_WORDS: usize = 256;
const SCRATCH_BYTES: usize = SCRATCH_WORDS * size_of::<u64>();
const STACK_ALIGN: usize = 16;

const_assert!(size_of::<TerminalFrame>() <= SCRATCH_BYTES / 4);
const_assert!(align_of::<TerminalFrame>() <= STACK_ALIGN);

#[repr(C, align(16))]
struct ScratchStack(UnsafeCell<[u64; SCRATCH_WORDS]>);

// SAFETY: only the single driver unit touches the scratch stack, after every other
// unit has been quiesced and with interrupts masked.
unsafe impl Sync for ScratchStack {}

static SCRATCH_STACK: ScratchStack = ScratchStack(UnsafeCell::new([0; SCRATCH_WORDS]));

/// Address the frame is stored at; the new stack grows down from here.
fn frame_slot() -> usize {
    let top = SCRATCH_STACK.0.get() as usize + SCRATCH_BYTES;
    (top - size_of::<TerminalFrame>()) & !(STACK_ALIGN - 1)
}

/// Unconditional stop after a broken invariant in the committed path.
pub fn fatal(cpu: &dyn CpuControl, args: fmt::Arguments<'_>) -> ! {
    log_emerg!(target: "handoff", "FATAL: {}", args);
    cpu.halt()
}

/// Kernel virtual range of the static scratch stack the terminal path runs on.
///
/// Its physical counterpart must be part of the identity-mapped code path.
pub fn scratch_stack() -> (VirtAddr, usize) {
    (VirtAddr::new(SCRATCH_STACK.0.get() as usize), SCRATCH_BYTES)
}

/// Runs the terminal sequence and enters the stub described by `frame`.
///
/// Interrupts are masked first, then execution moves to the scratch stack for
/// the cache teardown and the jump.
///
/// # Safety
///
/// - a relocation stub has been staged at `frame.entry`;
/// - the identity map covers the stub, the code of this crate and [`scratch_stack`];
/// - every other unit has been quiesced, so nothing else runs on the scratch stack.
///
/// [`crate::Handoff::execute`] checks all of the above before calling this.
pub unsafe fn soft_restart(frame: TerminalFrame) -> ! {
    frame.cpu.disable_interrupts();
    log_emerg!(target: "handoff", "Bye!");

    let slot = frame_slot();
    // SAFETY: `slot` lies inside the scratch stack, is suitably aligned and is
    // written before anything runs on that stack. The caller guarantees no other
    // unit uses it.
    unsafe { core::ptr::write(slot as *mut TerminalFrame, frame) };
    // SAFETY: the scratch stack is static and identity mapped per the contract
    // above; `slot` is 16-byte aligned with the frame stored above it.
    unsafe { call_with_stack(terminal_entry, slot, slot) }
}

extern "C-unwind" fn terminal_entry(slot: usize) -> ! {
    // SAFETY: `soft_restart` stored a frame at `slot` just before switching stacks.
    let frame = unsafe { core::ptr::read(slot as *const TerminalFrame) };
    run_terminal(&frame)
}

fn step(sequence: &mut Sequence, cpu: &dyn CpuControl, next: TransitionState) {
    if let Err(violation) = sequence.advance(next) {
        fatal(cpu, format_args!("transition {} -> {}", violation.from, violation.to));
    }
    #[cfg(feature = "debug_uart")]
    crate::log::emit_raw(
        crate::log::Level::Debug,
        "handoff",
        format_args!("state {}", next),
    );
}

fn run_terminal(frame: &TerminalFrame) -> ! {
    let cpu = frame.cpu;
    let mut sequence = Sequence::new();

    step(&mut sequence, cpu, TransitionState::IdentityMapped);
    cpu.flush_cache_all();

    step(&mut sequence, cpu, TransitionState::CacheFlushed);
    if let Some(outer) = frame.outer {
        outer.flush_all();
        outer.disable();
    }

    step(&mut sequence, cpu, TransitionState::OuterDisabled);
    match frame.exit {
        Some(board) => board.exit_cache_mode(),
        None => cpu.exit_cache_mode(),
    }

    step(&mut sequence, cpu, TransitionState::CacheModeExited);
    cpu.flush_cache_all();

    step(&mut sequence, cpu, TransitionState::FinalFlushed);
    step(&mut sequence, cpu, TransitionState::Jumped);
    // SAFETY: the stub was staged at `entry` and the identity map covers it.
    unsafe { cpu.enter_stub(frame.entry) };

    fatal(
        cpu,
        format_args!("control returned from stub at {} in state {}", frame.entry, sequence.state()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::capture;
    use crate::testing::{self, Event, MockCpu, MockExit, MockOuter, ReturningStubCpu};

    const STUB: PhysAddr = PhysAddr::new(0x8f00_0000);

    fn frame(cpu: &'static dyn CpuControl) -> TerminalFrame {
        TerminalFrame { cpu, outer: Some(&MockOuter), exit: None, entry: STUB }
    }

    #[test]
    fn successor_table_is_linear() {
        let mut state = TransitionState::Entered;
        let mut visited = 1;
        while let Some(next) = state.successor() {
            state = next;
            visited += 1;
        }
        assert_eq!(state, TransitionState::Jumped);
        assert_eq!(visited, 7);
    }

    #[test]
    fn sequence_rejects_skips_and_repeats() {
        let mut sequence = Sequence::new();
        assert_eq!(
            sequence.advance(TransitionState::CacheFlushed),
            Err(SequenceViolation {
                from: TransitionState::Entered,
                to: TransitionState::CacheFlushed
            })
        );
        assert_eq!(sequence.advance(TransitionState::IdentityMapped), Ok(()));
        assert!(sequence.advance(TransitionState::IdentityMapped).is_err());
        assert_eq!(sequence.state(), TransitionState::IdentityMapped);
    }

    #[test]
    fn flush_precedes_disable_precedes_jump() {
        let _guard = testing::lock();
        // SAFETY: mock CPU; the jump unwinds back into the test.
        let msg = testing::expect_unwind(|| unsafe { soft_restart(frame(&MockCpu)) });
        assert_eq!(msg, testing::STUB_ENTERED);

        assert_eq!(
            testing::take(),
            [
                Event::DisableInterrupts,
                Event::FlushCacheAll,
                Event::OuterFlush,
                Event::OuterDisable,
                Event::ExitCacheMode,
                Event::FlushCacheAll,
                Event::EnterStub(STUB.raw()),
            ]
        );
    }

    #[test]
    fn absent_outer_cache_is_skipped_and_board_exit_is_preferred() {
        let _guard = testing::lock();
        let frame = TerminalFrame { cpu: &MockCpu, outer: None, exit: Some(&MockExit), entry: STUB };
        // SAFETY: mock CPU; the jump unwinds back into the test.
        testing::expect_unwind(|| unsafe { soft_restart(frame) });

        assert_eq!(
            testing::take(),
            [
                Event::DisableInterrupts,
                Event::FlushCacheAll,
                Event::BoardExitCacheMode,
                Event::FlushCacheAll,
                Event::EnterStub(STUB.raw()),
            ]
        );
    }

    #[test]
    fn return_from_stub_halts() {
        let _guard = testing::lock();
        capture::install();
        // SAFETY: mock CPU; the halt unwinds back into the test.
        let msg = testing::expect_unwind(|| unsafe { soft_restart(frame(&ReturningStubCpu)) });
        assert_eq!(msg, testing::HALTED);

        let trace = testing::take();
        assert_eq!(trace.last(), Some(&Event::Halt));
        assert_eq!(
            testing::position(&trace, Event::EnterStub(STUB.raw())),
            Some(trace.len() - 2)
        );
        assert!(capture::contains("control returned from stub at 0x8f000000 in state JUMPED"));
        assert!(capture::contains("Bye!"));
    }

    #[test]
    fn frame_fits_aligned_inside_scratch_stack() {
        let base = SCRATCH_STACK.0.get() as usize;
        let slot = frame_slot();
        assert_eq!(slot % STACK_ALIGN, 0);
        assert!(slot > base);
        assert!(slot + size_of::<TerminalFrame>() <= base + SCRATCH_BYTES);

        let (start, len) = scratch_stack();
        assert_eq!(start.raw(), base);
        assert!(slot >= start.raw() && slot + size_of::<TerminalFrame>() <= start.raw() + len);
    }
}
