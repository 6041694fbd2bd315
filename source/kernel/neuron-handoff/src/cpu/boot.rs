// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One-time boot adjustment of the processing-unit set
//! OWNERS: @kernel-boot-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (one-shot, boot unit refusal, hook invocation)
//! PUBLIC API: exclude_secondary(), BootAdjustError
//! DEPENDS_ON: cpu::smp::CpuSet, platform::NonEssentialCpus
//! INVARIANTS: Single-invocation per CpuSet; irreversible; never touches the boot unit

use core::fmt;
use core::sync::atomic::Ordering;

use super::smp::CpuSet;
use crate::platform::NonEssentialCpus;
use crate::types::CpuId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAdjustError {
    /// The boot unit drives every handoff and cannot be excluded.
    BootCpu,
    /// `cpu` is not in the possible set.
    UnknownCpu,
    AlreadyApplied,
}

impl fmt::Display for BootAdjustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootAdjustError::BootCpu => f.write_str("cannot exclude the boot cpu"),
            BootAdjustError::UnknownCpu => f.write_str("cpu not possible on this system"),
            BootAdjustError::AlreadyApplied => f.write_str("boot exclusion already applied"),
        }
    }
}

/// Permanently removes `cpu` from every view of `cpus` and powers down the
/// units the board does not need.
///
/// Runs once during initialisation, before any handoff is attempted.
pub fn exclude_secondary(
    cpus: &CpuSet,
    cpu: CpuId,
    nonessential: Option<&dyn NonEssentialCpus>,
) -> Result<(), BootAdjustError> {
    if cpu.is_boot() {
        return Err(BootAdjustError::BootCpu);
    }
    if !cpus.possible().contains(cpu) {
        return Err(BootAdjustError::UnknownCpu);
    }
    if cpus
        .exclusion_applied
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(BootAdjustError::AlreadyApplied);
    }

    cpus.set_online(cpu, false);
    cpus.set_present(cpu, false);
    cpus.set_possible(cpu, false);
    log_info!(target: "boot", "{} excluded (possible={})", cpu, cpus.possible());

    match nonessential {
        Some(hook) => hook.disable_nonessential(),
        None => log_info!(target: "boot", "capability disable-nonessential-cpus: NOT FOUND"),
    }
    Ok(())
}
