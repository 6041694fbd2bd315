// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Opt-in panic handler for images embedding the handoff engine
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, feature `panic_handler`)
//! DEPENDS_ON: uart::raw_writer(), arch::armv7::Armv7
//! INVARIANTS: Lock-free output; no allocations; never returns

use core::{fmt::Write, panic::PanicInfo};

use crate::arch::Armv7;
use crate::hal::CpuControl;
use crate::uart;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = writeln!(w, "{}", info.message());
    Armv7.halt()
}
