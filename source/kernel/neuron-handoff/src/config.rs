// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime knobs for a handoff attempt
//! OWNERS: @kernel-team
//! PUBLIC API: HandoffConfig, TimeoutPolicy, USEC_PER_SEC, DEFAULT_UART_BASE
//! DEPENDS_ON: cargo feature `strict_quiesce`
//! INVARIANTS: Defaults reproduce the stock best-effort behaviour unless `strict_quiesce` is on

/// Microseconds in one second; the default quiescence budget.
pub const USEC_PER_SEC: u32 = 1_000_000;

/// PL011 used for diagnostics until board code calls [`crate::uart::set_base`].
///
/// This is the first UART of the ARM `virt` machine.
pub const DEFAULT_UART_BASE: usize = 0x0900_0000;

/// What the quiescence coordinator does when secondary units outlive the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Warn, confirm each unit through the shutdown-wait hook, then carry on.
    BestEffort,
    /// Refuse to continue the handoff.
    Abort,
}

impl TimeoutPolicy {
    pub const fn default_for_build() -> Self {
        if cfg!(feature = "strict_quiesce") {
            TimeoutPolicy::Abort
        } else {
            TimeoutPolicy::BestEffort
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::default_for_build()
    }
}

/// Per-attempt configuration owned by the caller of the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Machine/board identifier handed to the new image.
    pub machine_id: usize,
    /// Upper bound on the stop-signal wait, in microseconds.
    pub quiesce_timeout_us: u32,
    /// Granularity of the busy-poll, in microseconds.
    pub poll_interval_us: u32,
    pub timeout_policy: TimeoutPolicy,
}

impl HandoffConfig {
    pub const fn new(machine_id: usize) -> Self {
        Self {
            machine_id,
            quiesce_timeout_us: USEC_PER_SEC,
            poll_interval_us: 1,
            timeout_policy: TimeoutPolicy::default_for_build(),
        }
    }

    pub const fn with_timeout_us(mut self, timeout_us: u32) -> Self {
        self.quiesce_timeout_us = timeout_us;
        self
    }

    pub const fn with_poll_interval_us(mut self, poll_us: u32) -> Self {
        // A zero step would never drain the budget.
        self.poll_interval_us = if poll_us == 0 { 1 } else { poll_us };
        self
    }

    pub const fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_wait_one_second_in_single_microseconds() {
        let config = HandoffConfig::new(0xf00);
        assert_eq!(config.quiesce_timeout_us, 1_000_000);
        assert_eq!(config.poll_interval_us, 1);
        assert_eq!(config.machine_id, 0xf00);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = HandoffConfig::new(0).with_poll_interval_us(0);
        assert_eq!(config.poll_interval_us, 1);
    }

    #[cfg(not(feature = "strict_quiesce"))]
    #[test]
    fn default_policy_is_best_effort() {
        assert_eq!(TimeoutPolicy::default(), TimeoutPolicy::BestEffort);
    }
}
