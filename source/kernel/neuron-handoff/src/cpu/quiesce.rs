// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Stops every secondary unit so one driver unit runs the transition
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests with a simulated microsecond clock
//! PUBLIC API: quiesce_others(), QuiesceReport, QuiesceError
//! DEPENDS_ON: cpu::smp::CpuSet, platform::{StopSignal, ShutdownWait}, hal::Delay, config
//! INVARIANTS: Bounded spin (timeout + one poll step); no scheduler use; stop signal is
//!             never retracted; online bits only cleared after a confirmed shutdown

use core::fmt;

use super::smp::CpuSet;
use crate::config::{HandoffConfig, TimeoutPolicy};
use crate::hal::Delay;
use crate::platform::{Capabilities, Capability};
use crate::types::{CpuId, CpuMask};

/// Outcome of a quiescence attempt that allows the handoff to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuiesceReport {
    /// Units the stop signal was sent to.
    pub targeted: CpuMask,
    /// Units whose power-down was confirmed; removed from the online view.
    pub confirmed: CpuMask,
    /// Targeted units were still online when the budget ran out.
    pub timed_out: bool,
    /// Microseconds spent in the busy-poll.
    pub waited_us: u32,
}

impl QuiesceReport {
    /// Targeted units that could not be confirmed.
    pub fn unconfirmed(&self) -> CpuMask {
        CpuMask::from_bits(self.targeted.bits() & !self.confirmed.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceError {
    /// Shutdown confirmation is mandatory; nothing was signalled.
    CapabilityAbsent(Capability),
    /// Units outlived the budget under [`TimeoutPolicy::Abort`].
    Timeout { remaining: CpuMask },
}

impl fmt::Display for QuiesceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuiesceError::CapabilityAbsent(cap) => write!(f, "capability {cap} absent"),
            QuiesceError::Timeout { remaining } => {
                write!(f, "secondary cpus {remaining} did not stop")
            }
        }
    }
}

/// Stops every online unit except `self_id`.
///
/// The wait is a spin on `delay` bounded by `config.quiesce_timeout_us`. With
/// [`TimeoutPolicy::BestEffort`] a timeout is only logged and every targeted
/// unit still goes through the shutdown-wait confirmation.
pub fn quiesce_others(
    cpus: &CpuSet,
    self_id: CpuId,
    caps: &Capabilities,
    delay: &dyn Delay,
    config: &HandoffConfig,
) -> Result<QuiesceReport, QuiesceError> {
    let Some(shutdown_wait) = caps.shutdown_wait else {
        log_error!(target: "smp", "capability {}: NOT FOUND", Capability::ShutdownWait);
        return Err(QuiesceError::CapabilityAbsent(Capability::ShutdownWait));
    };
    let mut report = QuiesceReport::default();
    let Some(stop) = caps.stop_signal else {
        log_warn!(target: "smp", "SMP: failed to stop secondary CPUs (no stop signal)");
        return Ok(report);
    };

    let targets = cpus.online().without(self_id);
    if targets.is_empty() {
        return Ok(report);
    }

    log_info!(target: "smp", "sending STOP to {} (self={})", targets, self_id);
    stop.raise_stop(targets);
    report.targeted = targets;

    let remaining = || CpuMask::from_bits(cpus.online().bits() & targets.bits());
    let mut budget = config.quiesce_timeout_us;
    let step_us = config.poll_interval_us.max(1);
    log_debug!(target: "smp", "waiting for CPUs ...({}us)", budget);
    while !remaining().is_empty() && budget > 0 {
        let step = step_us.min(budget);
        delay.udelay(step);
        budget -= step;
        report.waited_us += step;
    }

    let left = remaining();
    if !left.is_empty() {
        report.timed_out = true;
        log_warn!(
            target: "smp",
            "SMP: failed to stop secondary CPUs {} after {}us",
            left,
            report.waited_us
        );
        if config.timeout_policy == TimeoutPolicy::Abort {
            return Err(QuiesceError::Timeout { remaining: left });
        }
    }

    for cpu in targets.iter() {
        match shutdown_wait.wait_cpu_shutdown(cpu) {
            Ok(()) => {
                cpus.set_online(cpu, false);
                report.confirmed = report.confirmed.with(cpu);
            }
            Err(_) => log_warn!(target: "smp", "{}: shutdown not confirmed", cpu),
        }
    }
    log_info!(
        target: "smp",
        "quiesced: confirmed={} waited={}us",
        report.confirmed,
        report.waited_us
    );
    Ok(report)
}
