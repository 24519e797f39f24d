// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later
use serde::{Deserialize, Serialize};

use crate::robot::types::P_MAX;

/// What the gripper is currently doing.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum GripperMode {
    /// Holding the last target, no motion in progress.
    Idle,
    /// Moving towards the open end of the travel range.
    Opening,
    /// Moving towards the closed end of the travel range.
    Closing,
    /// Moving towards an intermediate target.
    Moving,
    /// Holding a target written with a raw command.
    Holding,
}

/// Calibration and tuning of the gripper drive.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(default)]
pub struct GripperConfig {
    /// Motor id of the gripper drive. Defaults to the id following the last joint drive.
    pub motor_id: Option<u32>,
    /// Motor angle of the closed gripper in \[rad\].
    pub closed_position: f64,
    /// Motor angle of the open gripper in \[rad\].
    pub open_position: f64,
    /// Interpolation rate of non-raw targets in travel ranges per second.
    pub speed: f64,
    /// Stiffness of the gripper drive.
    pub kp: f64,
    /// Damping of the gripper drive.
    pub kd: f64,
}

impl Default for GripperConfig {
    fn default() -> Self {
        GripperConfig {
            motor_id: None,
            closed_position: 0.,
            open_position: 5.,
            speed: 1.,
            kp: 10.,
            kd: 0.5,
        }
    }
}

impl GripperConfig {
    /// Motor angle of a normalized position, 0 closed and 1 open.
    pub fn to_motor(&self, normalized: f64) -> f64 {
        self.closed_position + normalized * (self.open_position - self.closed_position)
    }

    /// Normalized position of a motor angle.
    pub fn to_normalized(&self, motor: f64) -> f64 {
        (motor - self.closed_position) / (self.open_position - self.closed_position)
    }

    /// Normalized positions reachable by the drive, smallest first.
    pub fn hardware_range(&self) -> (f64, f64) {
        let a = self.to_normalized(-P_MAX);
        let b = self.to_normalized(P_MAX);
        (a.min(b), a.max(b))
    }

    pub(crate) fn is_valid(&self) -> bool {
        let finite = [
            self.closed_position,
            self.open_position,
            self.speed,
            self.kp,
            self.kd,
        ]
        .iter()
        .all(|x| x.is_finite());
        finite
            && self.closed_position != self.open_position
            && self.closed_position.abs() <= P_MAX
            && self.open_position.abs() <= P_MAX
            && self.speed > 0.
            && self.kp >= 0.
            && self.kd >= 0.
    }
}
