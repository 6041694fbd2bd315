// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Board capabilities consumed by the handoff engine
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (resolution + logging of absent hooks)
//! PUBLIC API: PlatformHooks, Capabilities::resolve(), StopSignal, ShutdownWait, OuterCache,
//!             ExitCacheMode, LateReinit, NonEssentialCpus, Capability
//! DEPENDS_ON: types::{CpuId, CpuMask}, log
//! INVARIANTS: Resolved once per Handoff; every capability may be absent; hooks are 'static
//!
//! Board code implements [`PlatformHooks`] and overrides the hooks it actually
//! has. The engine snapshots them into [`Capabilities`] when it is built and
//! never asks again, so a hook cannot appear or vanish mid-handoff.

use core::fmt;

use crate::types::{CpuId, CpuMask};

/// Sends the "stop executing" inter-processor signal.
pub trait StopSignal: Sync {
    fn raise_stop(&self, targets: CpuMask);
}

/// Reported by [`ShutdownWait`] when a unit never reached its powered-down state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeout;

/// Confirms at hardware level that a unit has powered down.
pub trait ShutdownWait: Sync {
    fn wait_cpu_shutdown(&self, cpu: CpuId) -> Result<(), ShutdownTimeout>;
}

/// Cache level shared between units, outside the CPU's own caches.
pub trait OuterCache: Sync {
    fn flush_all(&self);
    fn disable(&self);
}

/// Board override of the built-in exit-cache-mode sequence.
pub trait ExitCacheMode: Sync {
    fn exit_cache_mode(&self);
}

/// Last-chance board reinitialisation run right before the terminal sequence.
pub trait LateReinit: Sync {
    fn reinit(&self);
}

/// Powers down units the board does not need; used by the boot-time adjustment.
pub trait NonEssentialCpus: Sync {
    fn disable_nonessential(&self);
}

/// Name of each capability, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    StopSignal,
    ShutdownWait,
    OuterCache,
    ExitCacheMode,
    LateReinit,
    NonEssentialCpus,
}

impl Capability {
    pub const fn name(self) -> &'static str {
        match self {
            Capability::StopSignal => "raise-stop-signal",
            Capability::ShutdownWait => "wait-cpu-shutdown",
            Capability::OuterCache => "outer-cache",
            Capability::ExitCacheMode => "exit-cache-mode",
            Capability::LateReinit => "late-reinit",
            Capability::NonEssentialCpus => "disable-nonessential-cpus",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Provider implemented by board code. Every hook defaults to absent.
pub trait PlatformHooks {
    fn stop_signal(&self) -> Option<&'static dyn StopSignal> {
        None
    }

    fn shutdown_wait(&self) -> Option<&'static dyn ShutdownWait> {
        None
    }

    fn outer_cache(&self) -> Option<&'static dyn OuterCache> {
        None
    }

    fn exit_cache_mode(&self) -> Option<&'static dyn ExitCacheMode> {
        None
    }

    fn late_reinit(&self) -> Option<&'static dyn LateReinit> {
        None
    }

    fn nonessential_cpus(&self) -> Option<&'static dyn NonEssentialCpus> {
        None
    }
}

/// Board without any optional hooks.
pub struct NoHooks;

impl PlatformHooks for NoHooks {}

/// Snapshot of the hooks a board provided.
#[derive(Clone, Copy, Default)]
pub struct Capabilities {
    pub stop_signal: Option<&'static dyn StopSignal>,
    pub shutdown_wait: Option<&'static dyn ShutdownWait>,
    pub outer_cache: Option<&'static dyn OuterCache>,
    pub exit_cache_mode: Option<&'static dyn ExitCacheMode>,
    pub late_reinit: Option<&'static dyn LateReinit>,
    pub nonessential_cpus: Option<&'static dyn NonEssentialCpus>,
}

impl Capabilities {
    /// Resolves every hook once and logs which ones the board is missing.
    pub fn resolve(hooks: &dyn PlatformHooks) -> Self {
        let caps = Self {
            stop_signal: hooks.stop_signal(),
            shutdown_wait: hooks.shutdown_wait(),
            outer_cache: hooks.outer_cache(),
            exit_cache_mode: hooks.exit_cache_mode(),
            late_reinit: hooks.late_reinit(),
            nonessential_cpus: hooks.nonessential_cpus(),
        };
        for (cap, present) in caps.presence() {
            if present {
                log_debug!(target: "handoff", "capability {}: found", cap);
            } else {
                log_info!(target: "handoff", "capability {}: NOT FOUND", cap);
            }
        }
        caps
    }

    /// Whether `cap` resolved to a usable hook.
    pub fn has(&self, cap: Capability) -> bool {
        self.presence()
            .iter()
            .any(|(candidate, present)| *candidate == cap && *present)
    }

    fn presence(&self) -> [(Capability, bool); 6] {
        [
            (Capability::StopSignal, self.stop_signal.is_some()),
            (Capability::ShutdownWait, self.shutdown_wait.is_some()),
            (Capability::OuterCache, self.outer_cache.is_some()),
            (Capability::ExitCacheMode, self.exit_cache_mode.is_some()),
            (Capability::LateReinit, self.late_reinit.is_some()),
            (Capability::NonEssentialCpus, self.nonessential_cpus.is_some()),
        ]
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (cap, present) in self.presence() {
            if present {
                list.entry(&cap);
            }
        }
        list.finish()
    }
}
