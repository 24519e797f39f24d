// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the [`Arm`] handle.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use log::{info, warn};

use crate::exception::{check_dimension, invalid_request, ArmException, ArmResult};
use crate::gripper::GripperController;
use crate::model::gravity::GravityModel;
use crate::model::{CalibrationModel, KinematicModel};
use crate::network::{BusMode, CanTransport};
use crate::robot::config::ArmConfig;
use crate::robot::control_loop::ControlLoop;
use crate::robot::control_types::{
    GravityCompensationMode, LoopStatus, MotionHandle, MotionOutcome,
};
use crate::robot::identification::identify;
use crate::robot::robot_impl::{FaultReport, Shared};
use crate::robot::robot_state::{ArmState, CartesianPose};
use crate::robot::trajectory::TrajectoryPlanner;
use crate::utils::{is_valid_quaternion, quaternion_to_euler, JointVector};

struct LoopThread {
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

/// Maintains the connection to the arm's drives and runs the control loop.
///
/// The handle can be shared between threads. Motion requests return immediately with a
/// [`MotionHandle`]; a newer request supersedes an older one. Reading the state never blocks
/// on the bus.
///
/// # Example
/// ```no_run
/// use startouch::{Arm, ArmConfig, ArmResult, CalibrationModel};
/// # fn tables() -> (Vec<Vec<f64>>, Vec<Vec<f64>>, Vec<Vec<f64>>) { unimplemented!() }
/// fn main() -> ArmResult<()> {
///     let (permutation, pi_b, pi_fr) = tables();
///     let calibration = CalibrationModel::from_tables(&permutation, &pi_b, &pi_fr)?;
///     let arm = Arm::new(calibration, ArmConfig::default())?;
///     arm.set_joint(&[0.2, 0.5, -0.4, 0., 0.3, 0.], 2., 300.)?.wait();
///     println!("{:?}", arm.end_effector_pose());
///     arm.cleanup();
///     Ok(())
/// }
/// ```
pub struct Arm {
    model: Arc<KinematicModel>,
    planner: TrajectoryPlanner,
    config: ArmConfig,
    shared: Arc<Shared>,
    thread: Mutex<Option<LoopThread>>,
    identification: Mutex<()>,
}

impl Arm {
    /// Opens the SocketCAN interface named in `config` and brings the arm up.
    ///
    /// # Errors
    /// * [`ConfigurationError`](`ArmException::ConfigurationError`) if `config` is invalid.
    /// * [`BusOpenError`](`ArmException::BusOpenError`) if the interface cannot be opened or
    ///   the drives do not answer.
    /// * [`RealTimeException`](`ArmException::RealTimeException`) if realtime is enforced but
    ///   not available.
    #[cfg(feature = "socketcan")]
    pub fn new(calibration: CalibrationModel, config: ArmConfig) -> ArmResult<Arm> {
        let transport = crate::network::socket_can::SocketCanTransport::open(
            &config.can_interface,
            BusMode::from_fd_flag(config.enable_fd),
        )
        .map_err(|error| ArmException::BusOpenError {
            message: error.to_string(),
        })?;
        Arm::with_transport(calibration, config, transport)
    }

    /// Without the `socketcan` feature there is no hardware bus. Always fails with
    /// [`BusOpenError`](`ArmException::BusOpenError`); use [`with_transport`](`Arm::with_transport`).
    #[cfg(not(feature = "socketcan"))]
    pub fn new(_calibration: CalibrationModel, config: ArmConfig) -> ArmResult<Arm> {
        Err(ArmException::BusOpenError {
            message: format!(
                "cannot open {}: built without the socketcan feature",
                config.can_interface
            ),
        })
    }

    /// Brings the arm up on an already opened bus.
    ///
    /// All drives are enabled and must answer before the control loop starts.
    ///
    /// # Errors
    /// * [`ConfigurationError`](`ArmException::ConfigurationError`) if `config` is invalid.
    /// * [`BusOpenError`](`ArmException::BusOpenError`) if the transport's frame format does not
    ///   match `config.enable_fd` or the drives do not answer.
    /// * [`RealTimeException`](`ArmException::RealTimeException`) if realtime is enforced but
    ///   not available.
    pub fn with_transport<T: CanTransport + 'static>(
        calibration: CalibrationModel,
        config: ArmConfig,
        transport: T,
    ) -> ArmResult<Arm> {
        let model = Arc::new(KinematicModel::new(calibration));
        config.validate(model.dof())?;
        let expected = BusMode::from_fd_flag(config.enable_fd);
        if transport.mode() != expected {
            return Err(ArmException::BusOpenError {
                message: format!(
                    "transport uses {:?} frames but the configuration asks for {:?}",
                    transport.mode(),
                    expected
                ),
            });
        }
        let gripper = if config.gripper_exist {
            Some(GripperController::new(config.gripper)?)
        } else {
            None
        };
        let control_loop =
            ControlLoop::new(Box::new(transport), model.clone(), config.clone(), gripper)?;
        let shared = control_loop.shared();

        let (ready_sender, ready_receiver) = bounded(1);
        let (exit_sender, exit_receiver) = bounded(1);
        let handle = thread::Builder::new()
            .name("arm-control".to_string())
            .spawn(move || {
                if let Err(error) = control_loop.prepare_thread() {
                    control_loop.shut_down();
                    let _ = ready_sender.send(Err(error));
                    return;
                }
                let _ = ready_sender.send(Ok(()));
                control_loop.run();
                let _ = exit_sender.send(());
            })
            .map_err(|error| ArmException::BusOpenError {
                message: format!("cannot spawn control thread: {}", error),
            })?;
        let ready = ready_receiver
            .recv()
            .unwrap_or_else(|_| {
                Err(ArmException::RealTimeException {
                    message: "control thread ended during start".to_string(),
                })
            });
        if let Err(error) = ready {
            let _ = handle.join();
            return Err(error);
        }
        info!("arm with {} joints is up", model.dof());

        Ok(Arm {
            planner: TrajectoryPlanner::new(model.clone()),
            model,
            config,
            shared,
            thread: Mutex::new(Some(LoopThread {
                handle,
                exited: exit_receiver,
            })),
            identification: Mutex::new(()),
        })
    }

    pub fn model(&self) -> &KinematicModel {
        &self.model
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    fn joint_vector(&self, values: &[f64]) -> ArmResult<JointVector> {
        check_dimension(self.model.dof(), values.len())?;
        Ok(JointVector::from_column_slice(values))
    }

    /// Setpoint of the current or last motion. New motions start from here.
    fn commanded_position(&self) -> JointVector {
        self.shared.cache.load().commanded.position().clone()
    }

    /// Moves to the joint positions `q` in `tf` seconds with a quintic profile sampled at
    /// `ctrl_hz`.
    ///
    /// # Errors
    /// * [`DimensionMismatch`](`ArmException::DimensionMismatch`) if `q` does not have one entry
    ///   per joint.
    /// * [`InvalidTrajectoryRequest`](`ArmException::InvalidTrajectoryRequest`) if `tf` or
    ///   `ctrl_hz` are not positive or `q` is not finite.
    /// * [`OutOfRange`](`ArmException::OutOfRange`) if the target or the peak velocity exceeds
    ///   the range the drives can encode. Nothing is installed then.
    /// * [`ControlException`](`ArmException::ControlException`) while the loop is faulted.
    /// * [`Shutdown`](`ArmException::Shutdown`) after [`cleanup`](`Self::cleanup`).
    pub fn set_joint(&self, q: &[f64], tf: f64, ctrl_hz: f64) -> ArmResult<MotionHandle> {
        let goal = self.joint_vector(q)?;
        let trajectory = self
            .planner
            .plan_joint(&self.commanded_position(), &goal, tf, ctrl_hz)?;
        self.shared.install(trajectory)
    }

    /// Sends `q` and `dq` as a single setpoint without smoothing. Meant for callers generating
    /// their own trajectories at the control rate; large jumps are passed to the drives as is.
    pub fn set_joint_raw(&self, q: &[f64], dq: &[f64]) -> ArmResult<MotionHandle> {
        let trajectory = self
            .planner
            .raw_joint(&self.joint_vector(q)?, &self.joint_vector(dq)?)?;
        self.shared.install(trajectory)
    }

    /// Moves to the zero configuration in `tf` seconds.
    pub fn go_home(&self, tf: f64) -> ArmResult<MotionHandle> {
        let home = vec![0.; self.model.dof()];
        self.set_joint(&home, tf, self.config.ctrl_hz)
    }

    /// Moves the end effector on a straight line to `position` with the orientation given as
    /// XYZ Euler angles, in `tf` seconds.
    ///
    /// # Errors
    /// * [`KinematicsUnreachable`](`ArmException::KinematicsUnreachable`) or
    ///   [`KinematicsSingular`](`ArmException::KinematicsSingular`) if any sample cannot be
    ///   solved. Nothing is installed then.
    /// * the errors of [`set_joint`](`Self::set_joint`)
    pub fn set_end_effector_pose(
        &self,
        position: &[f64; 3],
        euler: &[f64; 3],
        tf: f64,
    ) -> ArmResult<MotionHandle> {
        let target = CartesianPose::new(*position, *euler);
        let trajectory = self.planner.plan_cartesian(
            &self.commanded_position(),
            &target,
            tf,
            self.config.ctrl_hz,
        )?;
        self.shared.install(trajectory)
    }

    /// Solves the pose once and sends the result as a single setpoint.
    pub fn set_end_effector_pose_raw(
        &self,
        position: &[f64; 3],
        euler: &[f64; 3],
    ) -> ArmResult<MotionHandle> {
        let target = CartesianPose::new(*position, *euler);
        let trajectory = self
            .planner
            .raw_cartesian(&self.commanded_position(), &target)?;
        self.shared.install(trajectory)
    }

    /// Like [`set_end_effector_pose`](`Self::set_end_effector_pose`) with the orientation as
    /// quaternion `[w, x, y, z]`.
    pub fn set_end_effector_pose_quat(
        &self,
        position: &[f64; 3],
        quaternion: &[f64; 4],
        tf: f64,
    ) -> ArmResult<MotionHandle> {
        let target = pose_from_quaternion(position, quaternion)?;
        let trajectory = self.planner.plan_cartesian(
            &self.commanded_position(),
            &target,
            tf,
            self.config.ctrl_hz,
        )?;
        self.shared.install(trajectory)
    }

    pub fn set_end_effector_pose_quat_raw(
        &self,
        position: &[f64; 3],
        quaternion: &[f64; 4],
    ) -> ArmResult<MotionHandle> {
        let target = pose_from_quaternion(position, quaternion)?;
        let trajectory = self
            .planner
            .raw_cartesian(&self.commanded_position(), &target)?;
        self.shared.install(trajectory)
    }

    /// The latest published state. Flagged stale while the loop is faulted or stopped.
    pub fn state(&self) -> Arc<ArmState> {
        self.shared.cache.load()
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.cache.status()
    }

    pub fn joint_positions(&self) -> Vec<f64> {
        self.state().joints.position().as_slice().to_vec()
    }

    pub fn joint_velocities(&self) -> Vec<f64> {
        self.state().joints.velocity().as_slice().to_vec()
    }

    pub fn joint_torques(&self) -> Vec<f64> {
        self.state().joints.torque().as_slice().to_vec()
    }

    /// Position and XYZ Euler angles of the end effector at the latest measured joint state.
    pub fn end_effector_pose(&self) -> CartesianPose {
        self.state().pose
    }

    /// Position and orientation as `[w, x, y, z]`.
    pub fn end_effector_pose_quat(&self) -> ([f64; 3], [f64; 4]) {
        let pose = self.state().pose;
        (
            [pose.position.x, pose.position.y, pose.position.z],
            pose.quaternion(),
        )
    }

    /// Report of the most recent fault, kept after [`reset`](`Self::reset`).
    pub fn last_fault(&self) -> Option<FaultReport> {
        self.shared.last_fault()
    }

    /// Leaves the faulted state by re-enabling the drives. The arm then holds its measured
    /// position. Does nothing unless the loop is faulted.
    ///
    /// # Errors
    /// * [`ControlException`](`ArmException::ControlException`) if the drives still do not
    ///   answer. The loop stays faulted.
    /// * [`Shutdown`](`ArmException::Shutdown`) after [`cleanup`](`Self::cleanup`).
    pub fn reset(&self) -> ArmResult<()> {
        if self.shared.is_shutdown() {
            return Err(ArmException::Shutdown);
        }
        if self.status() != LoopStatus::Faulted {
            return Ok(());
        }
        let (sender, receiver) = bounded(1);
        self.shared.request_reset(sender);
        let timeout = self.config.shutdown_timeout + self.config.receive_timeout * 20;
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) if self.shared.is_shutdown() => Err(ArmException::Shutdown),
            Err(_) => Err(ArmException::ControlException {
                log: None,
                error: "control loop did not answer the reset request".to_string(),
            }),
        }
    }

    /// Runs the gravity identification and installs the fitted model. Blocks until the
    /// excitation sequence completed, which moves the arm.
    ///
    /// Compensation is applied once enabled with
    /// [`set_gravity_compensation`](`Self::set_gravity_compensation`).
    ///
    /// # Errors
    /// * [`IdentificationIncomplete`](`ArmException::IdentificationIncomplete`) if a segment was
    ///   superseded, the loop faulted or the data did not determine the model. The previous model
    ///   stays installed.
    pub fn gravity_compensation(&self) -> ArmResult<Arc<GravityModel>> {
        let _running = self
            .identification
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        identify(
            &self.shared,
            &self.planner,
            &self.config.identification,
            self.config.ctrl_hz,
        )
    }

    pub fn set_gravity_compensation(&self, mode: GravityCompensationMode) {
        info!("gravity compensation {:?}", mode);
        self.shared
            .set_gravity_enabled(mode == GravityCompensationMode::Enabled);
    }

    pub fn gravity_compensation_mode(&self) -> GravityCompensationMode {
        if self.shared.gravity_enabled() {
            GravityCompensationMode::Enabled
        } else {
            GravityCompensationMode::Disabled
        }
    }

    /// The installed gravity model, `None` before the first identification.
    pub fn gravity_model(&self) -> Option<Arc<GravityModel>> {
        self.shared.gravity_model()
    }

    /// # Errors
    /// * [`NoGripper`](`ArmException::NoGripper`) if the arm has no gripper.
    /// * [`ControlException`](`ArmException::ControlException`) while the loop is faulted.
    ///   After [`reset`](`Self::reset`) the gripper holds its measured position.
    pub fn open_gripper(&self) -> ArmResult<()> {
        self.check_running()?;
        self.shared.with_gripper(|gripper| gripper.open())
    }

    /// # Errors
    /// * [`NoGripper`](`ArmException::NoGripper`) if the arm has no gripper.
    pub fn close_gripper(&self) -> ArmResult<()> {
        self.check_running()?;
        self.shared.with_gripper(|gripper| gripper.close())
    }

    /// Moves the gripper to `target`, clamped to \[0, 1\] with 0 closed and 1 open.
    pub fn set_gripper_position(&self, target: f64) -> ArmResult<()> {
        self.check_running()?;
        self.shared
            .with_gripper(|gripper| gripper.set_position(target))?
    }

    /// Commands `target` directly.
    ///
    /// # Errors
    /// * [`OutOfRange`](`ArmException::OutOfRange`) if the motor angle of `target` lies outside
    ///   the drive's range.
    /// * [`NoGripper`](`ArmException::NoGripper`) if the arm has no gripper.
    pub fn set_gripper_position_raw(&self, target: f64) -> ArmResult<()> {
        self.check_running()?;
        self.shared
            .with_gripper(|gripper| gripper.set_position_raw(target))?
    }

    /// Last measured gripper position, `None` without a gripper.
    pub fn gripper_position(&self) -> Option<f64> {
        self.shared.with_gripper(|gripper| gripper.position()).ok()
    }

    fn check_running(&self) -> ArmResult<()> {
        if self.shared.is_shutdown() {
            return Err(ArmException::Shutdown);
        }
        if self.status() == LoopStatus::Faulted {
            return Err(self.shared.fault_exception());
        }
        Ok(())
    }

    /// Stops the control loop, disables the drives and releases the bus.
    ///
    /// Waits at most [`ArmConfig::shutdown_timeout`] for the loop. Calling it again, also
    /// concurrently, has no further effect. Requests made afterwards fail with
    /// [`Shutdown`](`ArmException::Shutdown`) and pending motions end with
    /// [`MotionOutcome::Shutdown`](`crate::MotionOutcome::Shutdown`).
    pub fn cleanup(&self) {
        self.shared.request_shutdown();
        let mut thread = self.lock_thread();
        if let Some(loop_thread) = thread.take() {
            info!("shutting down");
            match loop_thread.exited.recv_timeout(self.config.shutdown_timeout) {
                Ok(()) => {
                    let _ = loop_thread.handle.join();
                }
                Err(_) => warn!(
                    "control loop did not stop within {:?}, detaching it",
                    self.config.shutdown_timeout
                ),
            }
            self.shared.drain_pending(MotionOutcome::Shutdown);
            if self.status() != LoopStatus::Stopped {
                self.shared.cache.set_status(LoopStatus::Stopped);
            }
        }
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<LoopThread>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Arm {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn pose_from_quaternion(position: &[f64; 3], quaternion: &[f64; 4]) -> ArmResult<CartesianPose> {
    if !is_valid_quaternion(quaternion) {
        return Err(invalid_request("quaternion must be finite and non-zero"));
    }
    let euler = quaternion_to_euler(quaternion);
    Ok(CartesianPose::new(*position, [euler.x, euler.y, euler.z]))
}
