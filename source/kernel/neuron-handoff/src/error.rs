// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error type returned by every handoff step before the terminal sequence.

use core::fmt;

use crate::cpu::{BootAdjustError, QuiesceError};
use crate::image::DescriptorError;
use crate::mm::MapError;
use crate::stage::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    Descriptor(DescriptorError),
    Stage(StageError),
    Map(MapError),
    Quiesce(QuiesceError),
    Boot(BootAdjustError),
    /// `execute` ran before the stub was staged.
    NotStaged,
    /// `execute` ran before the other units were stopped.
    NotQuiesced,
    /// More identity ranges than the context can track.
    TooManyRanges,
}

impl From<DescriptorError> for HandoffError {
    fn from(err: DescriptorError) -> Self {
        HandoffError::Descriptor(err)
    }
}

impl From<StageError> for HandoffError {
    fn from(err: StageError) -> Self {
        HandoffError::Stage(err)
    }
}

impl From<MapError> for HandoffError {
    fn from(err: MapError) -> Self {
        HandoffError::Map(err)
    }
}

impl From<QuiesceError> for HandoffError {
    fn from(err: QuiesceError) -> Self {
        HandoffError::Quiesce(err)
    }
}

impl From<BootAdjustError> for HandoffError {
    fn from(err: BootAdjustError) -> Self {
        HandoffError::Boot(err)
    }
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Descriptor(err) => write!(f, "descriptor: {err}"),
            HandoffError::Stage(err) => write!(f, "stage: {err}"),
            HandoffError::Map(err) => write!(f, "identity map: {err}"),
            HandoffError::Quiesce(err) => write!(f, "quiesce: {err}"),
            HandoffError::Boot(err) => write!(f, "boot adjust: {err}"),
            HandoffError::NotStaged => f.write_str("relocation stub not staged"),
            HandoffError::NotQuiesced => f.write_str("secondary cpus not quiesced"),
            HandoffError::TooManyRanges => f.write_str("too many identity ranges"),
        }
    }
}
