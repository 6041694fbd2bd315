// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Handoff context threading one warm transition through every component
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (precondition errors) + tests/handoff_flow.rs (full flow)
//! PUBLIC API: Handoff::{new, prepare, stage, map_identity, shutdown, execute, run}
//! DEPENDS_ON: image, stage, mm, cpu::{quiesce, smp}, platform, transition
//! INVARIANTS: Capabilities resolved once in `new`; nothing global besides the scratch stack
//!             and log sink; every error is reported before the terminal sequence starts
//!
//! Typical use on the driver unit:
//!
//! ```ignore
//! let mut handoff = Handoff::new(&Armv7, &Armv7, &GenericTimer, &CPUS, &board, config);
//! handoff.run(&image, &stub, table, &[kernel_image])?;
//! ```

use core::convert::Infallible;

use crate::config::HandoffConfig;
use crate::cpu::{quiesce_others, CpuSet, QuiesceReport};
use crate::error::HandoffError;
use crate::hal::{CpuControl, Delay, Tlb};
use crate::image::{ImageDescriptor, RelocationStub};
use crate::log::{emit_raw, Level};
use crate::mm::{build_identity_map, section_align_range, IdentityMapping, MapError, SectionTablePage};
use crate::platform::{Capabilities, PlatformHooks};
use crate::stage::{self, RelocationParameters, StagedStub};
use crate::transition::{soft_restart, TerminalFrame};
use crate::types::PhysAddr;

/// Identity ranges a single handoff keeps track of.
pub const MAX_IDENTITY_RANGES: usize = 4;

/// State of one handoff attempt, owned by its caller.
pub struct Handoff<'a> {
    cpu: &'static dyn CpuControl,
    tlb: &'a dyn Tlb,
    delay: &'a dyn Delay,
    cpus: &'a CpuSet,
    caps: Capabilities,
    config: HandoffConfig,
    staged: Option<StagedStub>,
    mapped: [Option<IdentityMapping>; MAX_IDENTITY_RANGES],
    quiesced: Option<QuiesceReport>,
}

impl<'a> Handoff<'a> {
    /// Builds the context and snapshots the board capabilities.
    pub fn new(
        cpu: &'static dyn CpuControl,
        tlb: &'a dyn Tlb,
        delay: &'a dyn Delay,
        cpus: &'a CpuSet,
        hooks: &dyn PlatformHooks,
        config: HandoffConfig,
    ) -> Self {
        Self {
            cpu,
            tlb,
            delay,
            cpus,
            caps: Capabilities::resolve(hooks),
            config,
            staged: None,
            mapped: [None; MAX_IDENTITY_RANGES],
            quiesced: None,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn staged(&self) -> Option<&StagedStub> {
        self.staged.as_ref()
    }

    pub fn quiesce_report(&self) -> Option<&QuiesceReport> {
        self.quiesced.as_ref()
    }

    /// Checks the descriptor without touching hardware.
    pub fn prepare(&self, image: &ImageDescriptor, stub: &RelocationStub<'_>) -> Result<(), HandoffError> {
        image.validate(stub)?;
        Ok(())
    }

    /// Copies the stub onto the control page and fills its parameter cells.
    pub fn stage(
        &mut self,
        image: &ImageDescriptor,
        stub: &RelocationStub<'_>,
    ) -> Result<&StagedStub, HandoffError> {
        let params = RelocationParameters::from_image(image, self.config.machine_id);
        // SAFETY: `ControlPage::new` obliges its creator to hand over an exclusive,
        // writable mapping of the page.
        let staged = unsafe { stage::stage(image, stub, params, self.cpu)? };
        let staged = self.staged.insert(staged);
        Ok(&*staged)
    }

    /// Installs identity sections over `[base, end)` and remembers the range.
    pub fn map_identity(
        &mut self,
        table: &mut SectionTablePage,
        base: PhysAddr,
        end: PhysAddr,
    ) -> Result<IdentityMapping, HandoffError> {
        let slot = self
            .mapped
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(HandoffError::TooManyRanges)?;
        let mapping = build_identity_map(table, self.tlb, base, end)?;
        *slot = Some(mapping);
        Ok(mapping)
    }

    /// Stops every other unit; see [`quiesce_others`].
    pub fn shutdown(&mut self) -> Result<QuiesceReport, HandoffError> {
        let report = quiesce_others(
            self.cpus,
            self.cpu.current_cpu(),
            &self.caps,
            self.delay,
            &self.config,
        )?;
        self.quiesced = Some(report);
        Ok(report)
    }

    fn covered(&self, addr: PhysAddr, len: usize) -> bool {
        self.mapped.iter().flatten().any(|mapping| mapping.covers(addr, len))
    }

    /// Commits to the new image.
    ///
    /// `code_path` lists the physical ranges the driver unit keeps executing from
    /// until the stub takes over: this crate's code and data and the
    /// [`scratch_stack`](crate::transition::scratch_stack). Each must already be
    /// identity mapped, as must the staged stub.
    ///
    /// Only returns if a precondition is missing; once the checks pass the
    /// terminal sequence runs and never comes back.
    pub fn execute(self, code_path: &[(PhysAddr, PhysAddr)]) -> Result<Infallible, HandoffError> {
        let staged = self.staged.ok_or(HandoffError::NotStaged)?;
        if self.quiesced.is_none() {
            return Err(HandoffError::NotQuiesced);
        }
        if !self.covered(staged.entry, staged.len) {
            return Err(MapError::NotCovered.into());
        }
        if code_path.is_empty() {
            log_error!(target: "handoff", "no identity-mapped code path for the terminal sequence");
            return Err(MapError::NotCovered.into());
        }
        for &(base, end) in code_path {
            let len = end.raw().saturating_sub(base.raw());
            if len == 0 || !self.covered(base, len) {
                log_error!(target: "handoff", "code path {}..{} not identity mapped", base, end);
                return Err(MapError::NotCovered.into());
            }
        }
        self.commit(staged)
    }

    /// Runs every step in order: validate, stage, map, quiesce, execute.
    ///
    /// The section range around the control page is mapped in addition to
    /// `code_path`, which must cover the code and data this crate runs from and
    /// the scratch stack.
    pub fn run(
        mut self,
        image: &ImageDescriptor,
        stub: &RelocationStub<'_>,
        table: &mut SectionTablePage,
        code_path: &[(PhysAddr, PhysAddr)],
    ) -> Result<Infallible, HandoffError> {
        self.prepare(image, stub)?;
        if code_path.is_empty() {
            return Err(MapError::NotCovered.into());
        }
        self.stage(image, stub)?;
        let page = image.control_page;
        let (base, end) = section_align_range(page.phys(), page.len()).ok_or(MapError::OutOfRange)?;
        self.map_identity(table, base, end)?;
        for &(base, end) in code_path {
            self.map_identity(table, base, end)?;
        }
        self.shutdown()?;
        self.execute(code_path)
    }

    fn commit(self, staged: StagedStub) -> ! {
        // Other units may have died holding the log locks; raw output only from here.
        emit_raw(
            Level::Info,
            "handoff",
            format_args!("online cpus: {} (self={})", self.cpus.num_online(), self.cpu.current_cpu()),
        );
        emit_raw(Level::Info, "handoff", format_args!("starting new image: {}", staged.params));

        if let Some(hook) = self.caps.late_reinit {
            hook.reinit();
        }

        // SAFETY: `execute` checked that the stub is staged, that it and the code
        // path are identity mapped and that every other unit was quiesced.
        unsafe {
            soft_restart(TerminalFrame {
                cpu: self.cpu,
                outer: self.caps.outer_cache,
                exit: self.caps.exit_cache_mode,
                entry: staged.entry,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use super::*;
    use crate::image::{ControlPage, RelocationEntry, PAGE_SIZE};
    use crate::log::capture;
    use crate::testing::{self, Board, Event, MockCpu, MockTlb};
    use crate::types::{CpuId, CpuMask, VirtAddr};

    struct NoDelay;

    impl Delay for NoDelay {
        fn udelay(&self, _us: u32) {}
    }

    #[repr(C, align(4096))]
    struct HostPage([u8; PAGE_SIZE]);

    const STUB: [u8; 32] = [0x5a; 32];
    const KERNEL: (PhysAddr, PhysAddr) = (PhysAddr::new(0x8000_0000), PhysAddr::new(0x8010_0000));
    const CONTROL_SECTION: (PhysAddr, PhysAddr) =
        (PhysAddr::new(0x8f00_0000), PhysAddr::new(0x8f10_0000));

    fn image_on(page: &mut HostPage) -> ImageDescriptor {
        let virt = VirtAddr::new(page.0.as_mut_ptr() as usize);
        // SAFETY: the page outlives the handoff built in each test.
        let control_page = unsafe { ControlPage::new(PhysAddr::new(0x8f00_0000), virt, PAGE_SIZE) };
        ImageDescriptor {
            entry: PhysAddr::new(0x8000_8000),
            head: RelocationEntry::from_raw(0x8fe0_0000 | 0x2),
            control_page,
            boot_params: None,
        }
    }

    fn handoff<'a>(cpus: &'a CpuSet, board: &Board) -> Handoff<'a> {
        Handoff::new(&MockCpu, &MockTlb, &NoDelay, cpus, board, HandoffConfig::new(0xf00))
    }

    #[test]
    fn execute_requires_a_staged_stub() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut handoff = handoff(&cpus, &Board::FULL);
        handoff.shutdown().expect("single unit");
        assert_eq!(handoff.execute(&[KERNEL]).err(), Some(HandoffError::NotStaged));
    }

    #[test]
    fn execute_requires_quiescence() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let image = image_on(&mut page);
        let mut handoff = handoff(&cpus, &Board::FULL);
        handoff.stage(&image, &RelocationStub::new(&STUB, 32)).expect("stage");
        assert_eq!(handoff.execute(&[KERNEL]).err(), Some(HandoffError::NotQuiesced));
    }

    #[test]
    fn execute_requires_the_stub_to_be_identity_mapped() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let mut table = Box::new(SectionTablePage::new());
        let image = image_on(&mut page);
        let mut handoff = handoff(&cpus, &Board::FULL);
        handoff.stage(&image, &RelocationStub::new(&STUB, 32)).expect("stage");
        handoff
            .map_identity(&mut table, PhysAddr::new(0x8000_0000), PhysAddr::new(0x8010_0000))
            .expect("kernel text");
        handoff.shutdown().expect("single unit");
        assert_eq!(handoff.execute(&[KERNEL]).err(), Some(HandoffError::Map(MapError::NotCovered)));
        assert!(testing::take().iter().all(|event| *event != Event::DisableInterrupts));
    }

    #[test]
    fn execute_requires_the_code_path_to_be_identity_mapped() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let mut table = Box::new(SectionTablePage::new());
        let image = image_on(&mut page);
        let mut handoff = handoff(&cpus, &Board::FULL);
        handoff.stage(&image, &RelocationStub::new(&STUB, 32)).expect("stage");
        handoff
            .map_identity(&mut table, CONTROL_SECTION.0, CONTROL_SECTION.1)
            .expect("control page");
        handoff.shutdown().expect("single unit");
        assert_eq!(handoff.execute(&[KERNEL]).err(), Some(HandoffError::Map(MapError::NotCovered)));
        assert!(testing::take().iter().all(|event| *event != Event::DisableInterrupts));
    }

    #[test]
    fn execute_refuses_an_empty_code_path() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let mut table = Box::new(SectionTablePage::new());
        let image = image_on(&mut page);
        let mut handoff = handoff(&cpus, &Board::FULL);
        handoff.stage(&image, &RelocationStub::new(&STUB, 32)).expect("stage");
        handoff
            .map_identity(&mut table, CONTROL_SECTION.0, CONTROL_SECTION.1)
            .expect("control page");
        handoff.shutdown().expect("single unit");
        assert_eq!(handoff.execute(&[]).err(), Some(HandoffError::Map(MapError::NotCovered)));
        assert!(testing::take().iter().all(|event| *event != Event::DisableInterrupts));
    }

    #[test]
    fn run_without_code_path_never_reaches_the_stub() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let mut table = Box::new(SectionTablePage::new());
        let image = image_on(&mut page);
        let handoff = handoff(&cpus, &Board::FULL);
        let res = handoff.run(&image, &RelocationStub::new(&STUB, 32), &mut table, &[]);
        assert_eq!(res.err(), Some(HandoffError::Map(MapError::NotCovered)));
        assert_eq!(table.mappings().count(), 0);
        let trace = testing::take();
        assert!(!trace.contains(&Event::DisableInterrupts));
        assert!(!trace.contains(&Event::EnterStub(CONTROL_SECTION.0.raw())));
    }

    #[test]
    fn commit_reports_online_units_then_enters_the_stub() {
        let _guard = testing::lock();
        capture::install();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let mut table = Box::new(SectionTablePage::new());
        let image = image_on(&mut page);
        let handoff = handoff(&cpus, &Board::FULL);

        let msg = testing::expect_unwind(|| {
            let _ = handoff.run(&image, &RelocationStub::new(&STUB, 32), &mut table, &[KERNEL]);
        });

        assert_eq!(msg, testing::STUB_ENTERED);
        assert!(capture::contains("online cpus: 1 (self=cpu0)"));
        let trace = testing::take();
        let reinit = testing::position(&trace, Event::LateReinit).expect("late reinit");
        let irq_off = testing::position(&trace, Event::DisableInterrupts).expect("irq off");
        assert!(reinit < irq_off);
        assert_eq!(trace.last(), Some(&Event::EnterStub(CONTROL_SECTION.0.raw())));
    }

    #[test]
    fn missing_shutdown_wait_fails_the_shutdown_step() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::from_bits(0b11));
        let board = Board { wait: false, ..Board::FULL };
        let mut handoff = handoff(&cpus, &board);
        assert!(matches!(handoff.shutdown(), Err(HandoffError::Quiesce(_))));
        assert!(handoff.quiesce_report().is_none());
    }

    #[test]
    fn identity_ranges_are_bounded() {
        let _guard = testing::lock();
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut table = Box::new(SectionTablePage::new());
        let mut handoff = handoff(&cpus, &Board::FULL);
        for i in 0..MAX_IDENTITY_RANGES {
            let base = 0x4000_0000 + i * 0x10_0000;
            handoff
                .map_identity(&mut table, PhysAddr::new(base), PhysAddr::new(base + 0x10_0000))
                .expect("free slot");
        }
        assert_eq!(
            handoff.map_identity(&mut table, PhysAddr::new(0x5000_0000), PhysAddr::new(0x5010_0000)),
            Err(HandoffError::TooManyRanges)
        );
    }

    #[test]
    fn prepare_reports_descriptor_errors() {
        let cpus = CpuSet::new(CpuMask::single(CpuId::BOOT));
        let mut page = Box::new(HostPage([0; PAGE_SIZE]));
        let image = ImageDescriptor { entry: PhysAddr::new(0), ..image_on(&mut page) };
        let handoff = handoff(&cpus, &Board::FULL);
        assert_eq!(
            handoff.prepare(&image, &RelocationStub::new(&STUB, 32)),
            Err(HandoffError::Descriptor(crate::image::DescriptorError::NullEntry))
        );
    }
}
