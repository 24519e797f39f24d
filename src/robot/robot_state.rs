// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the state types published by the control loop.
use std::time::Duration;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::exception::{check_dimension, ArmResult};
use crate::robot::control_types::LoopStatus;
use crate::robot::error::DriveState;
use crate::utils::{euler_to_quaternion, euler_to_rotation, rotation_to_euler, JointVector};

/// Positions, velocities and torques of all joints.
///
/// The three vectors always have the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    position: JointVector,
    velocity: JointVector,
    torque: JointVector,
}

impl JointState {
    /// # Errors
    /// * [`DimensionMismatch`](`crate::ArmException::DimensionMismatch`) if the lengths differ.
    pub fn new(
        position: JointVector,
        velocity: JointVector,
        torque: JointVector,
    ) -> ArmResult<JointState> {
        check_dimension(position.len(), velocity.len())?;
        check_dimension(position.len(), torque.len())?;
        Ok(JointState {
            position,
            velocity,
            torque,
        })
    }

    /// A state at rest in the zero configuration.
    pub fn zeros(dof: usize) -> JointState {
        JointState {
            position: JointVector::zeros(dof),
            velocity: JointVector::zeros(dof),
            torque: JointVector::zeros(dof),
        }
    }

    pub fn dof(&self) -> usize {
        self.position.len()
    }

    /// Joint positions in \[rad\].
    pub fn position(&self) -> &JointVector {
        &self.position
    }

    /// Joint velocities in \[rad/s\].
    pub fn velocity(&self) -> &JointVector {
        &self.velocity
    }

    /// Joint torques in \[Nm\].
    pub fn torque(&self) -> &JointVector {
        &self.torque
    }
}

/// End effector pose: position in \[m\] and roll, pitch, yaw in \[rad\] with
/// `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartesianPose {
    pub position: Vector3<f64>,
    pub orientation: Vector3<f64>,
}

impl CartesianPose {
    pub fn new(position: [f64; 3], orientation: [f64; 3]) -> CartesianPose {
        CartesianPose {
            position: Vector3::from(position),
            orientation: Vector3::from(orientation),
        }
    }

    pub fn from_isometry(pose: &Isometry3<f64>) -> CartesianPose {
        CartesianPose {
            position: pose.translation.vector,
            orientation: rotation_to_euler(&pose.rotation),
        }
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        euler_to_rotation(&self.orientation)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.rotation())
    }

    /// Orientation as quaternion ordered `[w, x, y, z]`.
    pub fn quaternion(&self) -> [f64; 4] {
        euler_to_quaternion(&self.orientation)
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().chain(self.orientation.iter()).all(|x| x.is_finite())
    }
}

/// Describes the arm as seen by the control loop at the end of one cycle.
///
/// A snapshot is always published as a whole, so the pose belongs to the measured joint state
/// of the same snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    /// Measured joint state.
    pub joints: JointState,
    /// Last setpoint sent to the drives, in joint space. The torque contains the gravity
    /// feed-forward if applied.
    pub commanded: JointState,
    /// End effector pose computed from [`joints`](`Self::joints`).
    pub pose: CartesianPose,
    /// Last measured gripper position, 0 closed and 1 open. `None` without gripper.
    pub gripper_position: Option<f64>,
    /// Status of the control loop.
    pub status: LoopStatus,
    /// True while the loop is faulted or stopped and the snapshot no longer updates.
    pub stale: bool,
    /// Number of completed control cycles.
    pub cycle: u64,
    /// Time since the control loop started.
    pub time: Duration,
    /// Number of consecutive cycles with incomplete feedback.
    pub missed_cycles: u32,
    /// Number of cycles which started later than one period after their due time.
    pub overruns: u64,
    /// Last reported state of every joint drive in motor order. `None` before the first
    /// feedback or for undocumented codes.
    pub drive_states: Vec<Option<DriveState>>,
}

impl ArmState {
    pub(crate) fn initial(joints: JointState, pose: CartesianPose) -> ArmState {
        let dof = joints.dof();
        ArmState {
            commanded: JointState::new(
                joints.position().clone(),
                JointVector::zeros(dof),
                JointVector::zeros(dof),
            )
            .unwrap_or_else(|_| JointState::zeros(dof)),
            joints,
            pose,
            gripper_position: None,
            status: LoopStatus::Idle,
            stale: false,
            cycle: 0,
            time: Duration::ZERO,
            missed_cycles: 0,
            overruns: 0,
            drive_states: vec![None; dof],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use nalgebra::Vector3;

    use crate::exception::ArmException;
    use crate::robot::robot_state::{CartesianPose, JointState};
    use crate::utils::JointVector;

    #[test]
    fn joint_state_lengths_must_match() {
        assert!(JointState::new(
            JointVector::zeros(3),
            JointVector::zeros(3),
            JointVector::zeros(3)
        )
        .is_ok());
        assert!(matches!(
            JointState::new(
                JointVector::zeros(3),
                JointVector::zeros(2),
                JointVector::zeros(3)
            ),
            Err(ArmException::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn pose_conversions() {
        let pose = CartesianPose::new([0.1, 0.2, 0.3], [0., 0., FRAC_PI_2]);
        let isometry = pose.to_isometry();
        let rotated = isometry * nalgebra::Point3::new(1., 0., 0.);
        assert!((rotated.coords - Vector3::new(0.1, 1.2, 0.3)).norm() < 1e-12);
        let back = CartesianPose::from_isometry(&isometry);
        assert!((back.position - pose.position).norm() < 1e-12);
        assert!((back.orientation - pose.orientation).norm() < 1e-12);
        assert!(pose.is_finite());
        assert!(!CartesianPose::new([f64::NAN, 0., 0.], [0.; 3]).is_finite());
    }
}
