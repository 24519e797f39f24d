// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! # startouch-rs
//! startouch-rs is a real-time motion control library for robotic arms whose joints are driven
//! by motor drives on a CAN bus speaking the MIT impedance protocol.
//!
//! **ALWAYS HAVE THE EMERGENCY STOP AT HAND WHILE CONTROLLING THE ARM!**
//!
//! ## Design
//! The library is divided into four main modules:
//! * [robot](`crate::robot`) - the [`Arm`] handle, the control loop, trajectory planning and
//!   gravity identification.
//! * [model](`crate::model`) - calibration tables, kinematics and the gravity model.
//! * [network](`crate::network`) - the CAN transport abstraction, a SocketCAN implementation
//!   (feature `socketcan`) and a simulated bus.
//! * [gripper](`crate::gripper`) - the gripper state machine.
//!
//! An [`Arm`] owns a dedicated thread which sends one setpoint per drive every control period
//! and publishes the measured state. Motion requests are planned on the calling thread and
//! handed over to the loop; reading the state never touches the bus.
//!
//! # Example:
//!```no_run
//! use std::f64::consts::PI;
//! use startouch::{Arm, ArmConfig, ArmResult, BusMode, CalibrationModel, MotionOutcome, VirtualBus};
//! fn main() -> ArmResult<()> {
//!     let permutation = vec![vec![1., 0.], vec![0., 1.]];
//!     let pi_b = vec![vec![0.3, 0., 0., 0.], vec![0.25, 0., 0., 0.]];
//!     let pi_fr = vec![vec![0.1, 0.05], vec![0.1, 0.05]];
//!     let calibration = CalibrationModel::from_tables(&permutation, &pi_b, &pi_fr)?;
//!     let bus = VirtualBus::new(BusMode::Classic, 1..=2, 0x10);
//!     let arm = Arm::with_transport(calibration, ArmConfig::default(), bus)?;
//!     let motion = arm.set_joint(&[PI / 4., -PI / 8.], 2., 300.)?;
//!     assert_eq!(motion.wait(), MotionOutcome::Completed);
//!     println!("{:?}", arm.end_effector_pose());
//!     arm.cleanup();
//!     Ok(())
//! }
//!   ```
//!
//! Every request returns a [`MotionHandle`]. A newer request supersedes an older one, whose
//! handle then reports [`MotionOutcome::Superseded`]. When the bus goes down or a drive reports
//! a fault, the loop stops sending, the published state is flagged stale and all requests fail
//! with [`ControlException`](`ArmException::ControlException`) until [`Arm::reset`] is called.
//!
//! On hardware, build with the `socketcan` feature and use [`Arm::new`], which opens the
//! interface named in [`ArmConfig::can_interface`].

pub mod exception;
pub mod gripper;
pub mod model;
pub mod network;
pub mod robot;
pub mod utils;

pub use exception::{ArmException, ArmResult};
pub use gripper::gripper_state::GripperState;
pub use gripper::types::{GripperConfig, GripperMode};
pub use model::gravity::GravityModel;
pub use model::{CalibrationModel, IkParameters, KinematicModel};
pub use network::virtual_bus::VirtualBus;
pub use network::{BusError, BusMode, CanFrame, CanTransport};
pub use robot::arm::Arm;
pub use robot::config::ArmConfig;
pub use robot::control_types::*;
pub use robot::identification::IdentificationConfig;
pub use robot::logger::Record;
pub use robot::robot_impl::FaultReport;
pub use robot::robot_state::{ArmState, CartesianPose, JointState};
pub use robot::trajectory::{Trajectory, TrajectoryPlanner, TrajectorySample};
pub use utils::*;
