// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the GripperState type.

use crate::gripper::types::GripperMode;
use serde::Deserialize;
use serde::Serialize;

/// Describes the gripper state.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct GripperState {
    /// Last measured position, 0 closed and 1 open.
    pub position: f64,

    /// Position currently commanded, `None` before the first command.
    pub commanded: Option<f64>,

    /// Target of the current motion.
    pub target: Option<f64>,

    /// Current mode.
    pub mode: GripperMode,

    /// Temperature of the drive's rotor. Unit: \[°C\].
    pub temperature: u8,
}
