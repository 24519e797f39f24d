// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the gripper state machine.
//!
//! The gripper is a single drive on the arm's bus. Positions are normalized over the calibrated
//! travel range: 0 is closed and 1 is open. The controller itself never touches the bus, the
//! control loop asks it for one command per cycle with [`tick`](`GripperController::tick`) and
//! hands it the drive's feedback.

use crate::exception::{ArmException, ArmResult};
use crate::gripper::gripper_state::GripperState;
use crate::gripper::types::{GripperConfig, GripperMode};
use crate::robot::types::MotorCommand;

pub mod gripper_state;
pub mod types;

/// Interpolates gripper targets and tracks the measured position.
#[derive(Debug, Clone)]
pub struct GripperController {
    config: GripperConfig,
    state: GripperState,
}

impl GripperController {
    /// # Errors
    /// * [`ConfigurationError`](`crate::exception::ArmException::ConfigurationError`) if the
    ///   travel range is empty or lies outside the drive's range, or the gains or the speed are
    ///   invalid.
    pub fn new(config: GripperConfig) -> ArmResult<GripperController> {
        if !config.is_valid() {
            return Err(ArmException::ConfigurationError {
                message: format!("invalid gripper configuration {:?}", config),
            });
        }
        Ok(GripperController {
            config,
            state: GripperState {
                position: 0.,
                commanded: None,
                target: None,
                mode: GripperMode::Idle,
                temperature: 0,
            },
        })
    }

    pub fn config(&self) -> &GripperConfig {
        &self.config
    }

    pub fn state(&self) -> GripperState {
        self.state
    }

    /// Last measured position.
    pub fn position(&self) -> f64 {
        self.state.position
    }

    /// Moves to the open end of the travel range.
    pub fn open(&mut self) {
        self.start_motion(1., GripperMode::Opening);
    }

    /// Moves to the closed end of the travel range.
    pub fn close(&mut self) {
        self.start_motion(0., GripperMode::Closing);
    }

    /// Moves to `target`, clamped to \[0, 1\].
    ///
    /// # Errors
    /// * [`OutOfRange`](`crate::exception::ArmException::OutOfRange`) if `target` is NaN.
    pub fn set_position(&mut self, target: f64) -> ArmResult<()> {
        if target.is_nan() {
            return Err(ArmException::OutOfRange {
                value: target,
                min: 0.,
                max: 1.,
            });
        }
        self.start_motion(target.clamp(0., 1.), GripperMode::Moving);
        Ok(())
    }

    /// Commands `target` directly, without clamping and interpolation.
    ///
    /// # Errors
    /// * [`OutOfRange`](`crate::exception::ArmException::OutOfRange`) if the motor angle of
    ///   `target` lies outside the drive's range.
    pub fn set_position_raw(&mut self, target: f64) -> ArmResult<()> {
        let (min, max) = self.config.hardware_range();
        if !(target.is_finite() && target >= min && target <= max) {
            return Err(ArmException::OutOfRange {
                value: target,
                min,
                max,
            });
        }
        self.state.commanded = Some(target);
        self.state.target = Some(target);
        self.state.mode = GripperMode::Holding;
        Ok(())
    }

    fn start_motion(&mut self, target: f64, mode: GripperMode) {
        if self.state.commanded.is_none() {
            self.state.commanded = Some(self.state.position);
        }
        self.state.target = Some(target);
        self.state.mode = mode;
    }

    /// Drops the current target and holds the measured position.
    pub(crate) fn hold(&mut self) {
        if self.state.commanded.is_some() {
            self.state.commanded = Some(self.state.position);
        }
        self.state.target = None;
        self.state.mode = GripperMode::Idle;
    }

    /// Stores the measured motor angle and temperature.
    pub(crate) fn update_feedback(&mut self, motor_position: f64, temperature: u8) {
        self.state.position = self.config.to_normalized(motor_position);
        self.state.temperature = temperature;
    }

    /// Advances the interpolation by `dt` seconds and returns the command for this cycle.
    ///
    /// Before the first command the drive is only queried, without stiffness.
    pub(crate) fn tick(&mut self, dt: f64) -> MotorCommand {
        let current = match self.state.commanded {
            Some(current) => current,
            None => return MotorCommand::query(self.config.to_motor(self.state.position)),
        };
        let next = match (self.state.mode, self.state.target) {
            (GripperMode::Opening | GripperMode::Closing | GripperMode::Moving, Some(target)) => {
                let step = self.config.speed * dt.max(0.);
                if (target - current).abs() <= step {
                    self.state.mode = GripperMode::Idle;
                    target
                } else {
                    current + step * (target - current).signum()
                }
            }
            _ => current,
        };
        self.state.commanded = Some(next);
        MotorCommand {
            position: self.config.to_motor(next),
            velocity: 0.,
            kp: self.config.kp,
            kd: self.config.kd,
            torque: 0.,
        }
    }
}
