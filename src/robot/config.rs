// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the [`ArmConfig`] type.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exception::{ArmException, ArmResult};
use crate::gripper::types::GripperConfig;
use crate::robot::control_types::{ControlMode, GravityCompensationMode, RealtimeConfig};
use crate::robot::identification::IdentificationConfig;
use crate::robot::low_pass_filter::MAX_CUTOFF_FREQUENCY;
use crate::robot::types::{KD_MAX, KP_MAX};

/// Largest standard (11 bit) CAN identifier.
const MAX_STANDARD_ID: u32 = 0x7FF;

/// Plain values describing the bus, the drives and the control loop of an arm.
///
/// All fields have defaults, so a configuration file only has to name what it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ArmConfig {
    /// Name of the CAN interface, e.g. `can0`.
    pub can_interface: String,
    /// Use CAN FD frames with bit-rate switch instead of classic frames.
    pub enable_fd: bool,
    /// Whether a gripper drive is attached.
    pub gripper_exist: bool,
    /// Rate of the control loop in \[Hz\]. Also the sample rate of planned trajectories.
    pub ctrl_hz: f64,
    pub control_mode: ControlMode,
    /// Stiffness sent to the joint drives.
    pub kp: f64,
    /// Damping sent to the joint drives.
    pub kd: f64,
    /// Motor id of the first joint. Joint `i` is driven by `first_motor_id + i`.
    pub first_motor_id: u32,
    /// Feedback frames carry the motor id plus this offset.
    pub feedback_id_offset: u32,
    /// How long a cycle waits for feedback after its deadline passed.
    pub receive_timeout: Duration,
    /// Consecutive cycles with missing feedback tolerated before the loop faults.
    pub max_missed_cycles: u32,
    /// Bound on how long [`cleanup`](`crate::Arm::cleanup`) waits for the loop to stop.
    pub shutdown_timeout: Duration,
    pub realtime_config: RealtimeConfig,
    /// Number of cycles kept for [`ControlException`](`crate::ArmException::ControlException`).
    pub log_size: usize,
    pub gravity_compensation: GravityCompensationMode,
    pub gripper: GripperConfig,
    pub identification: IdentificationConfig,
}

impl Default for ArmConfig {
    fn default() -> Self {
        ArmConfig {
            can_interface: "can0".to_string(),
            enable_fd: false,
            gripper_exist: false,
            ctrl_hz: crate::utils::DEFAULT_CONTROL_RATE,
            control_mode: ControlMode::Impedance,
            kp: 30.,
            kd: 1.,
            first_motor_id: 1,
            feedback_id_offset: 0x10,
            receive_timeout: Duration::from_millis(2),
            max_missed_cycles: 10,
            shutdown_timeout: Duration::from_secs(1),
            realtime_config: RealtimeConfig::Ignore,
            log_size: 50,
            gravity_compensation: GravityCompensationMode::Disabled,
            gripper: GripperConfig::default(),
            identification: IdentificationConfig::default(),
        }
    }
}

impl ArmConfig {
    /// Motor ids of the joint drives for an arm with `dof` joints.
    ///
    /// Ids saturate at `u32::MAX`, [`validate`](`Self::validate`) rejects such configurations.
    pub fn joint_motor_ids(&self, dof: usize) -> Vec<u32> {
        (0..dof as u32)
            .map(|i| self.first_motor_id.saturating_add(i))
            .collect()
    }

    /// Motor id of the gripper drive, `None` without a gripper.
    pub fn gripper_motor_id(&self, dof: usize) -> Option<u32> {
        if !self.gripper_exist {
            return None;
        }
        Some(
            self.gripper
                .motor_id
                .unwrap_or_else(|| self.first_motor_id.saturating_add(dof as u32)),
        )
    }

    /// Checks the values the control loop depends on.
    ///
    /// # Errors
    /// * [`ConfigurationError`](`crate::ArmException::ConfigurationError`) naming the first
    ///   offending field.
    pub fn validate(&self, dof: usize) -> ArmResult<()> {
        let fail = |message: &str| {
            Err(ArmException::ConfigurationError {
                message: message.to_string(),
            })
        };
        if !(self.ctrl_hz.is_finite() && self.ctrl_hz > 0.) {
            return fail("ctrl_hz must be positive and finite");
        }
        if !(self.kp.is_finite() && self.kp >= 0. && self.kp <= KP_MAX) {
            return fail("kp out of the drive's range");
        }
        if !(self.kd.is_finite() && self.kd >= 0. && self.kd <= KD_MAX) {
            return fail("kd out of the drive's range");
        }
        if self.control_mode == ControlMode::Position && self.kp == 0. {
            return fail("position mode needs a positive kp");
        }
        if self.feedback_id_offset == 0 {
            return fail("feedback_id_offset must not be zero");
        }
        if self.receive_timeout.is_zero() {
            return fail("receive_timeout must not be zero");
        }
        let last_joint = (dof as u32)
            .checked_sub(1)
            .and_then(|i| self.first_motor_id.checked_add(i));
        let gripper = match (self.gripper_exist, self.gripper.motor_id) {
            (false, _) => None,
            (true, Some(id)) => Some(Some(id)),
            (true, None) => Some(self.first_motor_id.checked_add(dof as u32)),
        };
        if last_joint.is_none() || gripper == Some(None) {
            return fail("motor ids exceed the standard identifier range");
        }
        let mut ids = self.joint_motor_ids(dof);
        if let Some(gripper) = self.gripper_motor_id(dof) {
            if ids.contains(&gripper) {
                return fail("gripper motor id collides with a joint drive");
            }
            ids.push(gripper);
        }
        let mut feedback_ids = Vec::with_capacity(ids.len());
        for id in &ids {
            match id.checked_add(self.feedback_id_offset) {
                Some(feedback) if feedback <= MAX_STANDARD_ID => feedback_ids.push(feedback),
                _ => return fail("motor ids exceed the standard identifier range"),
            }
        }
        if feedback_ids.iter().any(|id| ids.contains(id)) {
            return fail("feedback ids collide with command ids");
        }
        let identification = &self.identification;
        if !(identification.amplitude.is_finite() && identification.amplitude > 0.) {
            return fail("identification amplitude must be positive");
        }
        if !(identification.segment_duration.is_finite() && identification.segment_duration > 0.) {
            return fail("identification segment_duration must be positive");
        }
        if !(identification.ridge.is_finite() && identification.ridge >= 0.) {
            return fail("identification ridge must not be negative");
        }
        let cutoff = identification.torque_cutoff_frequency;
        if !(cutoff.is_finite() && cutoff > 0. && cutoff <= MAX_CUTOFF_FREQUENCY) {
            return fail("identification torque_cutoff_frequency out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::exception::ArmException;
    use crate::robot::config::ArmConfig;
    use crate::robot::control_types::ControlMode;

    #[test]
    fn default_is_valid() {
        let config = ArmConfig::default();
        config.validate(6).unwrap();
        assert_eq!(config.ctrl_hz, 300.);
        assert_eq!(config.joint_motor_ids(3), vec![1, 2, 3]);
        assert_eq!(config.gripper_motor_id(6), None);
    }

    #[test]
    fn gripper_id_follows_the_joints() {
        let mut config = ArmConfig {
            gripper_exist: true,
            ..ArmConfig::default()
        };
        assert_eq!(config.gripper_motor_id(6), Some(7));
        config.gripper.motor_id = Some(3);
        assert!(matches!(
            config.validate(6),
            Err(ArmException::ConfigurationError { .. })
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let configs = [
            ArmConfig {
                ctrl_hz: 0.,
                ..ArmConfig::default()
            },
            ArmConfig {
                kp: 600.,
                ..ArmConfig::default()
            },
            ArmConfig {
                kd: f64::NAN,
                ..ArmConfig::default()
            },
            ArmConfig {
                kp: 0.,
                control_mode: ControlMode::Position,
                ..ArmConfig::default()
            },
            ArmConfig {
                receive_timeout: Duration::ZERO,
                ..ArmConfig::default()
            },
            ArmConfig {
                feedback_id_offset: 2,
                ..ArmConfig::default()
            },
        ];
        for config in configs.iter() {
            assert!(config.validate(6).is_err(), "{:?}", config);
        }
    }

    #[test]
    fn rejects_overflowing_ids() {
        let configs = [
            ArmConfig {
                first_motor_id: u32::MAX,
                ..ArmConfig::default()
            },
            ArmConfig {
                first_motor_id: u32::MAX - 6,
                gripper_exist: true,
                ..ArmConfig::default()
            },
            ArmConfig {
                feedback_id_offset: u32::MAX,
                ..ArmConfig::default()
            },
            ArmConfig {
                first_motor_id: 0x7F0,
                ..ArmConfig::default()
            },
        ];
        for config in configs.iter() {
            assert!(
                matches!(
                    config.validate(6),
                    Err(ArmException::ConfigurationError { .. })
                ),
                "{:?}",
                config
            );
        }
        let saturated = ArmConfig {
            first_motor_id: u32::MAX - 1,
            ..ArmConfig::default()
        };
        assert_eq!(saturated.joint_motor_ids(3), vec![u32::MAX - 1, u32::MAX, u32::MAX]);
    }
}
