// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later
//! Defines the states the drives report in the upper nibble of every feedback frame.
use std::fmt::{Debug, Display, Formatter, Result};

use num_derive::{FromPrimitive, ToPrimitive};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// State of a single drive.
#[derive(Serialize_repr, Deserialize_repr, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
#[derive(FromPrimitive, ToPrimitive)]
pub enum DriveState {
    /// The drive is powered but does not follow commands.
    Disabled = 0x0,
    /// The drive follows commands.
    Enabled = 0x1,
    /// The supply voltage is too high.
    OverVoltage = 0x8,
    /// The supply voltage is too low.
    UnderVoltage = 0x9,
    /// The phase current exceeded its limit.
    OverCurrent = 0xA,
    /// The MOSFETs overheated.
    MosOverTemperature = 0xB,
    /// The motor coil overheated.
    CoilOverTemperature = 0xC,
    /// The drive lost communication with its controller.
    CommunicationLost = 0xD,
    /// The drive was overloaded.
    Overload = 0xE,
}

impl DriveState {
    /// Whether the drive stopped because of a fault.
    pub fn is_fault(&self) -> bool {
        !matches!(self, DriveState::Disabled | DriveState::Enabled)
    }
}

impl Display for DriveState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:?}", self)
    }
}
