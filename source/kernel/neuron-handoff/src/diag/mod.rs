// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics shared by every handoff stage.

#[macro_use]
pub mod log;
