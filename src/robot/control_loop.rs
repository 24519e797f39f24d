// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! The control loop owns the bus and runs on its own thread.
//!
//! Every cycle sends one MIT command per drive, waits for the feedback and publishes the
//! resulting [`ArmState`]. While idle the loop re-sends the hold setpoint, which is how the drives
//! are polled. Motions are handed over through [`Shared::install`] and picked up at the start of
//! the next cycle. Answers that arrive after a cycle's deadline are discarded before the next
//! commands go out, so a late frame is never taken for the answer of a later cycle.
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nalgebra::DVector;

use crate::exception::{ArmException, ArmResult};
use crate::gripper::GripperController;
use crate::model::KinematicModel;
use crate::network::{BusError, BusMode, CanTransport};
use crate::robot::config::ArmConfig;
use crate::robot::control_tools::{
    has_realtime_kernel, period_from_rate, set_current_thread_to_highest_scheduler_priority,
    sleep_until,
};
use crate::robot::control_types::{
    ControlMode, GravityCompensationMode, LoopStatus, MotionOutcome, RealtimeConfig,
};
use crate::robot::error::DriveState;
use crate::robot::logger::{CommandLog, Logger};
use crate::robot::robot_impl::{FaultReport, PendingMotion, Shared};
use crate::robot::robot_state::{ArmState, JointState};
use crate::robot::types::{MotorCommand, MotorFeedback, SpecialCommand};
use crate::utils::JointVector;

/// Number of enable rounds before a drive counts as absent.
pub(crate) const ENABLE_ATTEMPTS: usize = 3;
/// Length of one enable round in multiples of the receive timeout.
const ENABLE_WINDOW: u32 = 5;
/// Upper bound of late frames dropped before one cycle.
const MAX_DISCARDED_FRAMES: usize = 64;

/// Drops every frame that is already queued.
///
/// # Errors
/// * [`BusDown`](`BusError::BusDown`) as soon as the transport reports it.
pub(crate) fn discard_queued(transport: &mut dyn CanTransport) -> Result<usize, BusError> {
    let mut discarded = 0;
    while discarded < MAX_DISCARDED_FRAMES {
        match transport.receive(Duration::ZERO) {
            Ok(_) => discarded += 1,
            Err(BusError::Timeout) => break,
            Err(error @ BusError::BusDown { .. }) => return Err(error),
            Err(error) => {
                debug!("ignoring receive error: {}", error);
                break;
            }
        }
    }
    Ok(discarded)
}

/// Receives feedback frames until every drive in `ids` answered or `deadline` passed.
///
/// Frames from other ids and undecodable payloads are skipped.
/// # Errors
/// * [`BusDown`](`BusError::BusDown`) as soon as the transport reports it.
pub(crate) fn receive_feedback(
    transport: &mut dyn CanTransport,
    ids: &[u32],
    feedback_offset: u32,
    deadline: Instant,
    feedback: &mut HashMap<u32, MotorFeedback>,
) -> Result<(), BusError> {
    while feedback.len() < ids.len() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match transport.receive(deadline - now) {
            Ok(frame) => {
                let id = match frame.id().checked_sub(feedback_offset) {
                    Some(id) if ids.contains(&id) => id,
                    _ => continue,
                };
                match MotorFeedback::decode(frame.data()) {
                    Some(decoded) => {
                        feedback.insert(id, decoded);
                    }
                    None => debug!("undecodable feedback from drive {:#x}", id),
                }
            }
            Err(BusError::Timeout) => {}
            Err(error @ BusError::BusDown { .. }) => return Err(error),
            Err(error) => debug!("ignoring receive error: {}", error),
        }
    }
    Ok(())
}

/// Sends the enable command to every drive in `ids` and collects one feedback frame per drive.
/// Drives that did not answer are asked again, up to [`ENABLE_ATTEMPTS`] times.
pub(crate) fn enable_drives(
    transport: &mut dyn CanTransport,
    ids: &[u32],
    config: &ArmConfig,
) -> Result<HashMap<u32, MotorFeedback>, String> {
    let mode = transport.mode();
    let mut answered = HashMap::with_capacity(ids.len());
    for attempt in 1..=ENABLE_ATTEMPTS {
        for id in ids.iter().filter(|id| !answered.contains_key(*id)) {
            let frame = mode
                .frame(*id, &SpecialCommand::Enable.payload())
                .map_err(|error| error.to_string())?;
            match transport.send(&frame) {
                Ok(()) => {}
                Err(error) if error.is_transient() => {
                    debug!("enable of drive {:#x} not sent: {}", id, error)
                }
                Err(error) => return Err(format!("enabling drive {:#x} failed: {}", id, error)),
            }
        }
        let deadline = Instant::now() + config.receive_timeout * ENABLE_WINDOW;
        receive_feedback(
            transport,
            ids,
            config.feedback_id_offset,
            deadline,
            &mut answered,
        )
        .map_err(|error| format!("waiting for drives failed: {}", error))?;
        if answered.len() == ids.len() {
            return Ok(answered);
        }
        debug!(
            "enable attempt {}: {} of {} drives answered",
            attempt,
            answered.len(),
            ids.len()
        );
    }
    let missing: Vec<String> = ids
        .iter()
        .filter(|id| !answered.contains_key(*id))
        .map(|id| format!("{:#x}", id))
        .collect();
    Err(format!("drives {} did not answer", missing.join(", ")))
}

/// Last known values of the joint drives, in motor space.
struct MotorSnapshot {
    position: DVector<f64>,
    velocity: DVector<f64>,
    torque: DVector<f64>,
    states: Vec<Option<DriveState>>,
}

impl MotorSnapshot {
    fn new(dof: usize) -> Self {
        MotorSnapshot {
            position: DVector::zeros(dof),
            velocity: DVector::zeros(dof),
            torque: DVector::zeros(dof),
            states: vec![None; dof],
        }
    }

    /// Stores the feedback of the joint drives. Returns a description of the first drive fault.
    fn store(&mut self, ids: &[u32], feedback: &HashMap<u32, MotorFeedback>) -> Option<String> {
        let mut fault = None;
        for (i, id) in ids.iter().enumerate() {
            if let Some(answer) = feedback.get(id) {
                self.position[i] = answer.position;
                self.velocity[i] = answer.velocity;
                self.torque[i] = answer.torque;
                self.states[i] = answer.state();
                if fault.is_none() && answer.is_fault() {
                    fault = Some(drive_fault(*id, answer));
                }
            }
        }
        fault
    }
}

fn drive_fault(id: u32, feedback: &MotorFeedback) -> String {
    match feedback.state() {
        Some(state) => format!("drive {:#x} reported {}", id, state),
        None => format!(
            "drive {:#x} reported unknown state code {:#x}",
            id, feedback.state_code
        ),
    }
}

struct ActiveMotion {
    motion: PendingMotion,
    origin: Instant,
    index: usize,
}

pub(crate) struct ControlLoop {
    transport: Box<dyn CanTransport>,
    model: Arc<KinematicModel>,
    shared: Arc<Shared>,
    config: ArmConfig,
    mode: BusMode,
    joint_ids: Vec<u32>,
    gripper_id: Option<u32>,
    all_ids: Vec<u32>,
    period: Duration,
    logger: Logger,
    active: Option<ActiveMotion>,
    hold: JointVector,
    motors: MotorSnapshot,
    started: Instant,
    cycle: u64,
    missed: u32,
    overruns: u64,
}

impl ControlLoop {
    /// Enables all drives and creates the state shared with the handle.
    ///
    /// # Errors
    /// * [`BusOpenError`](`ArmException::BusOpenError`) if a drive does not answer, reports a
    ///   fault or the bus is down.
    pub fn new(
        mut transport: Box<dyn CanTransport>,
        model: Arc<KinematicModel>,
        config: ArmConfig,
        mut gripper: Option<GripperController>,
    ) -> ArmResult<ControlLoop> {
        let dof = model.dof();
        let joint_ids = config.joint_motor_ids(dof);
        let gripper_id = config.gripper_motor_id(dof);
        let mut all_ids = joint_ids.clone();
        all_ids.extend(gripper_id);

        let feedback = enable_drives(transport.as_mut(), &all_ids, &config)
            .map_err(|message| ArmException::BusOpenError { message })?;
        let mut motors = MotorSnapshot::new(dof);
        if let Some(message) = motors.store(&joint_ids, &feedback) {
            return Err(ArmException::BusOpenError { message });
        }
        if let (Some(id), Some(controller)) = (gripper_id, gripper.as_mut()) {
            if let Some(answer) = feedback.get(&id) {
                if answer.is_fault() {
                    return Err(ArmException::BusOpenError {
                        message: drive_fault(id, answer),
                    });
                }
                controller.update_feedback(answer.position, answer.rotor_temperature);
            }
        }

        let joints = JointState::new(
            model.motor_to_joint(&motors.position),
            model.motor_to_joint(&motors.velocity),
            model.motor_to_joint(&motors.torque),
        )?;
        let hold = joints.position().clone();
        let pose = model.forward_kinematics(&hold)?;
        let mut initial = ArmState::initial(joints, pose);
        initial.gripper_position = gripper.as_ref().map(|controller| controller.position());
        initial.drive_states = motors.states.clone();
        info!(
            "{} drives enabled on a {:?} bus",
            all_ids.len(),
            transport.mode()
        );

        let shared = Arc::new(Shared::new(
            initial,
            gripper,
            config.gravity_compensation == GravityCompensationMode::Enabled,
        ));
        Ok(ControlLoop {
            mode: transport.mode(),
            transport,
            model,
            shared,
            period: period_from_rate(config.ctrl_hz),
            logger: Logger::new(config.log_size),
            config,
            joint_ids,
            gripper_id,
            all_ids,
            active: None,
            hold,
            motors,
            started: Instant::now(),
            cycle: 0,
            missed: 0,
            overruns: 0,
        })
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Applies the realtime configuration to the calling thread.
    ///
    /// # Errors
    /// * [`RealTimeException`](`ArmException::RealTimeException`) if realtime is enforced and
    ///   not available.
    pub fn prepare_thread(&self) -> ArmResult<()> {
        if self.config.realtime_config == RealtimeConfig::Enforce {
            if !has_realtime_kernel() {
                return Err(ArmException::RealTimeException {
                    message: "running kernel does not have realtime capabilities".to_string(),
                });
            }
            set_current_thread_to_highest_scheduler_priority()?;
        }
        Ok(())
    }

    /// Runs until shutdown is requested, then disables the drives and releases the bus.
    pub fn run(mut self) {
        info!("control loop running at {} Hz", self.config.ctrl_hz);
        let mut last_due = Instant::now();
        while !self.shared.is_shutdown() {
            if let Some(reply) = self.shared.take_reset_request() {
                let result = self.reset();
                let _ = reply.send(result);
                last_due = Instant::now();
            }
            if self.shared.cache.status() == LoopStatus::Faulted {
                self.shared.drain_pending(MotionOutcome::Faulted);
                thread::sleep(self.period);
                last_due = Instant::now();
                continue;
            }
            if let Some(motion) = self.shared.take_pending() {
                self.start(motion);
            }

            let due = match &self.active {
                Some(active) => {
                    let time = active
                        .motion
                        .trajectory
                        .sample(active.index)
                        .map_or(0., |sample| sample.time);
                    active.origin + Duration::from_secs_f64(time)
                }
                None => last_due + self.period,
            };
            let now = Instant::now();
            last_due = if now > due + self.period {
                self.overruns += 1;
                warn!(
                    "control cycle {} overran by {:?}, rescheduling",
                    self.cycle,
                    now - due
                );
                if let Some(active) = self.active.as_mut() {
                    active.origin += now - due;
                }
                now
            } else {
                sleep_until(due);
                due
            };

            if let Err(reason) = self.step() {
                self.fault(reason);
            }
        }
        self.shut_down();
    }

    fn start(&mut self, motion: PendingMotion) {
        if let Some(previous) = self.active.take() {
            info!("motion {} superseded by {}", previous.motion.id, motion.id);
            previous.motion.notify(MotionOutcome::Superseded);
        }
        info!(
            "motion {} started with {} samples",
            motion.id,
            motion.trajectory.len()
        );
        self.missed = 0;
        self.active = Some(ActiveMotion {
            motion,
            origin: Instant::now(),
            index: 0,
        });
    }

    /// One cycle: send the setpoint, collect the feedback, publish the state.
    fn step(&mut self) -> Result<(), String> {
        let late = discard_queued(self.transport.as_mut())
            .map_err(|error| format!("receiving feedback failed: {}", error))?;
        if late > 0 {
            debug!("cycle {}: discarded {} late frames", self.cycle, late);
        }
        let dof = self.model.dof();
        let sample = self
            .active
            .as_ref()
            .and_then(|active| active.motion.trajectory.sample(active.index));
        let (position, velocity) = match sample {
            Some(sample) => (sample.position, sample.velocity),
            None => (self.hold.clone(), JointVector::zeros(dof)),
        };
        let gravity = self.gravity_torque();
        let (sent_position, feed_forward) = match self.config.control_mode {
            ControlMode::Impedance => (position.clone(), gravity),
            ControlMode::Position => (&position + gravity / self.config.kp, JointVector::zeros(dof)),
        };

        let motor_position = self.model.joint_to_motor(&sent_position);
        let motor_velocity = self.model.joint_to_motor(&velocity);
        let motor_torque = self.model.joint_to_motor(&feed_forward);
        for i in 0..dof {
            let command = MotorCommand {
                position: motor_position[i],
                velocity: motor_velocity[i],
                kp: self.config.kp,
                kd: self.config.kd,
                torque: motor_torque[i],
            };
            self.send(self.joint_ids[i], &command.encode())?;
        }
        let mut gripper_command = None;
        if let Some(id) = self.gripper_id {
            let dt = self.period.as_secs_f64();
            if let Ok((command, commanded)) = self
                .shared
                .with_gripper(|gripper| (gripper.tick(dt), gripper.state().commanded))
            {
                self.send(id, &command.encode())?;
                gripper_command = commanded;
            }
        }

        let mut feedback = HashMap::with_capacity(self.all_ids.len());
        let deadline = Instant::now() + self.config.receive_timeout;
        receive_feedback(
            self.transport.as_mut(),
            &self.all_ids,
            self.config.feedback_id_offset,
            deadline,
            &mut feedback,
        )
        .map_err(|error| format!("receiving feedback failed: {}", error))?;
        let mut fault = self.motors.store(&self.joint_ids, &feedback);
        if let Some(id) = self.gripper_id {
            if let Some(answer) = feedback.get(&id) {
                if answer.is_fault() {
                    fault = fault.or_else(|| Some(drive_fault(id, answer)));
                }
                let _ = self.shared.with_gripper(|gripper| {
                    gripper.update_feedback(answer.position, answer.rotor_temperature)
                });
            }
        }
        if feedback.len() < self.all_ids.len() {
            self.missed += 1;
            debug!(
                "cycle {}: {} of {} drives answered",
                self.cycle,
                feedback.len(),
                self.all_ids.len()
            );
            if self.missed > self.config.max_missed_cycles {
                return Err(format!(
                    "no complete feedback for {} consecutive cycles",
                    self.missed
                ));
            }
        } else {
            self.missed = 0;
        }

        // a faulting cycle is still published, but the motion does not advance
        let finished = match self.active.as_mut() {
            Some(active) if fault.is_none() => {
                active.index += 1;
                active.index >= active.motion.trajectory.len()
            }
            _ => false,
        };
        let status = if self.active.is_some() && !finished {
            LoopStatus::Tracking
        } else {
            LoopStatus::Idle
        };
        let commanded = JointState::new(position.clone(), velocity.clone(), feed_forward.clone())
            .map_err(|error| error.to_string())?;
        let state = self.measured_state(commanded, status)?;
        self.logger.log(
            &state,
            &CommandLog {
                joint_positions: sent_position,
                joint_velocities: velocity,
                torques: feed_forward,
                gripper: gripper_command,
            },
        );
        self.shared.cache.publish(state);
        self.cycle += 1;
        if let Some(message) = fault {
            return Err(message);
        }

        if finished {
            if let Some(active) = self.active.take() {
                info!("motion {} completed", active.motion.id);
                active.motion.notify(MotionOutcome::Completed);
            }
            self.hold = position;
            self.missed = 0;
        }
        Ok(())
    }

    fn measured_state(&self, commanded: JointState, status: LoopStatus) -> Result<ArmState, String> {
        let joints = JointState::new(
            self.model.motor_to_joint(&self.motors.position),
            self.model.motor_to_joint(&self.motors.velocity),
            self.model.motor_to_joint(&self.motors.torque),
        )
        .map_err(|error| error.to_string())?;
        let previous = self.shared.cache.load();
        let pose = self
            .model
            .forward_kinematics(joints.position())
            .unwrap_or(previous.pose);
        Ok(ArmState {
            joints,
            commanded,
            pose,
            gripper_position: self.shared.with_gripper(|gripper| gripper.position()).ok(),
            status,
            stale: false,
            cycle: self.cycle,
            time: self.started.elapsed(),
            missed_cycles: self.missed,
            overruns: self.overruns,
            drive_states: self.motors.states.clone(),
        })
    }

    fn gravity_torque(&self) -> JointVector {
        let dof = self.model.dof();
        if !self.shared.gravity_enabled() {
            return JointVector::zeros(dof);
        }
        let q = self.model.motor_to_joint(&self.motors.position);
        self.shared
            .gravity_model()
            .and_then(|model| model.torque(&q).ok())
            .unwrap_or_else(|| JointVector::zeros(dof))
    }

    fn send(&mut self, id: u32, payload: &[u8]) -> Result<(), String> {
        let frame = self.mode.frame(id, payload).map_err(|error| error.to_string())?;
        match self.transport.send(&frame) {
            Ok(()) => Ok(()),
            Err(error @ BusError::BusDown { .. }) => {
                Err(format!("sending to drive {:#x} failed: {}", id, error))
            }
            Err(error) => {
                debug!("frame to drive {:#x} dropped: {}", id, error);
                Ok(())
            }
        }
    }

    fn fault(&mut self, reason: String) {
        error!("control loop faulted: {}", reason);
        self.shared.set_last_fault(FaultReport {
            reason,
            log: self.logger.flush(),
            time: self.started.elapsed(),
        });
        self.shared.cache.set_status(LoopStatus::Faulted);
        if let Some(active) = self.active.take() {
            active.motion.notify(MotionOutcome::Faulted);
        }
        self.shared.drain_pending(MotionOutcome::Faulted);
        self.missed = 0;
    }

    /// Re-enables the drives and holds the measured position.
    fn reset(&mut self) -> ArmResult<()> {
        if self.shared.cache.status() != LoopStatus::Faulted {
            return Ok(());
        }
        info!("resetting control loop");
        let control_error = |error: String| ArmException::ControlException { log: None, error };
        discard_queued(self.transport.as_mut()).map_err(|error| control_error(error.to_string()))?;
        let feedback = enable_drives(self.transport.as_mut(), &self.all_ids, &self.config)
            .map_err(control_error)?;
        if let Some(message) = self.motors.store(&self.joint_ids, &feedback) {
            return Err(control_error(message));
        }
        if let Some(id) = self.gripper_id {
            if let Some(answer) = feedback.get(&id) {
                if answer.is_fault() {
                    return Err(control_error(drive_fault(id, answer)));
                }
                let _ = self.shared.with_gripper(|gripper| {
                    gripper.update_feedback(answer.position, answer.rotor_temperature)
                });
            }
            let _ = self.shared.with_gripper(|gripper| gripper.hold());
        }
        self.hold = self.model.motor_to_joint(&self.motors.position);
        self.missed = 0;
        let dof = self.model.dof();
        let commanded = JointState::new(
            self.hold.clone(),
            JointVector::zeros(dof),
            JointVector::zeros(dof),
        )?;
        let state = self
            .measured_state(commanded, LoopStatus::Idle)
            .map_err(control_error)?;
        self.shared.cache.publish(state);
        info!("control loop reset, holding the measured position");
        Ok(())
    }

    /// Disables the drives and ends all motions with [`MotionOutcome::Shutdown`].
    pub fn shut_down(mut self) {
        info!("control loop stopping");
        let disable = SpecialCommand::Disable.payload();
        for id in self.all_ids.clone() {
            if let Err(error) = self.send(id, &disable) {
                debug!("{}", error);
            }
        }
        if let Some(active) = self.active.take() {
            active.motion.notify(MotionOutcome::Shutdown);
        }
        self.shared.drain_pending(MotionOutcome::Shutdown);
        self.shared.cache.set_status(LoopStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use mockall::predicate::*;

    use crate::model::tests::test_calibration;
    use crate::model::KinematicModel;
    use crate::network::virtual_bus::VirtualBus;
    use crate::network::{BusError, BusMode, CanFrame, CanTransport, MockCanTransport};
    use crate::robot::config::ArmConfig;
    use crate::robot::control_loop::{
        discard_queued, enable_drives, receive_feedback, ControlLoop, ENABLE_ATTEMPTS,
    };
    use crate::robot::error::DriveState;
    use crate::robot::types::{MotorFeedback, SpecialCommand};

    fn feedback_frame(id: u32, position: f64) -> CanFrame {
        let feedback = MotorFeedback {
            motor_id: id as u8,
            state_code: DriveState::Enabled as u8,
            position,
            velocity: 0.,
            torque: 0.,
            mos_temperature: 30,
            rotor_temperature: 30,
        };
        CanFrame::new(id + 0x10, &feedback.encode()).unwrap()
    }

    /// Delivers the answers of drive 1 after those of the other drives. Once armed, it holds
    /// one answer of drive 1 back until the cycle's deadline passed.
    struct SlowDriveBus {
        bus: VirtualBus,
        queue: VecDeque<CanFrame>,
        hold_next: Arc<AtomicBool>,
        held: Option<CanFrame>,
        unread_at_send: Arc<AtomicUsize>,
    }

    impl CanTransport for SlowDriveBus {
        fn mode(&self) -> BusMode {
            self.bus.mode()
        }

        fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
            if frame.id() == 1 {
                self.unread_at_send
                    .fetch_add(self.queue.len(), Ordering::SeqCst);
            }
            self.bus.send(frame)
        }

        fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError> {
            let mut slow = Vec::new();
            while let Ok(frame) = self.bus.receive(Duration::ZERO) {
                if frame.id() != 0x11 {
                    self.queue.push_back(frame);
                } else if self.hold_next.swap(false, Ordering::SeqCst) {
                    self.held = Some(frame);
                } else {
                    slow.push(frame);
                }
            }
            self.queue.extend(slow);
            match self.queue.pop_front() {
                Some(frame) => Ok(frame),
                None => {
                    thread::sleep(timeout);
                    self.queue.extend(self.held.take());
                    Err(BusError::Timeout)
                }
            }
        }
    }

    #[test]
    fn late_answer_is_not_taken_for_a_later_cycle() {
        let hold_next = Arc::new(AtomicBool::new(false));
        let unread_at_send = Arc::new(AtomicUsize::new(0));
        let transport = SlowDriveBus {
            bus: VirtualBus::new(BusMode::Classic, 1..=6, 0x10),
            queue: VecDeque::new(),
            hold_next: hold_next.clone(),
            held: None,
            unread_at_send: unread_at_send.clone(),
        };
        let mut control_loop = ControlLoop::new(
            Box::new(transport),
            Arc::new(KinematicModel::new(test_calibration())),
            ArmConfig::default(),
            None,
        )
        .unwrap();
        control_loop.step().unwrap();
        assert_eq!(control_loop.missed, 0);

        hold_next.store(true, Ordering::SeqCst);
        control_loop.step().unwrap();
        assert_eq!(control_loop.missed, 1);

        for _ in 0..10 {
            control_loop.step().unwrap();
            assert_eq!(control_loop.missed, 0);
        }
        assert_eq!(unread_at_send.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discard_queued_empties_the_queue() {
        let mut frames = vec![feedback_frame(1, 0.1), feedback_frame(2, 0.2)];
        let mut transport = MockCanTransport::new();
        transport
            .expect_receive()
            .with(eq(Duration::ZERO))
            .times(3)
            .returning(move |_| frames.pop().ok_or(BusError::Timeout));
        assert_eq!(discard_queued(&mut transport).unwrap(), 2);

        let mut transport = MockCanTransport::new();
        transport.expect_receive().times(1).returning(|_| {
            Err(BusError::BusDown {
                message: "gone".to_string(),
            })
        });
        assert!(discard_queued(&mut transport).is_err());
    }

    #[test]
    fn enable_drives_on_virtual_bus() {
        let mut bus = VirtualBus::new(BusMode::Classic, 1..=3, 0x10).with_positions(&[0.1, 0.2, 0.3]);
        let feedback = enable_drives(&mut bus, &[1, 2, 3], &ArmConfig::default()).unwrap();
        assert_eq!(feedback.len(), 3);
        assert!((feedback[&2].position - 0.2).abs() < 1e-3);
        assert_eq!(bus.drive_state(3), Some(DriveState::Enabled));
    }

    #[test]
    fn enable_drives_retries_then_gives_up() {
        let mut transport = MockCanTransport::new();
        transport.expect_mode().return_const(BusMode::Classic);
        transport
            .expect_send()
            .withf(|frame| SpecialCommand::parse(frame.data()) == Some(SpecialCommand::Enable))
            .times(2 * ENABLE_ATTEMPTS)
            .returning(|_| Ok(()));
        transport
            .expect_receive()
            .returning(|_| Err(BusError::Timeout));
        let config = ArmConfig {
            receive_timeout: Duration::from_micros(200),
            ..ArmConfig::default()
        };
        let error = enable_drives(&mut transport, &[1, 2], &config).unwrap_err();
        assert!(error.contains("0x1"));
        assert!(error.contains("0x2"));
    }

    #[test]
    fn enable_drives_reports_bus_down() {
        let mut transport = MockCanTransport::new();
        transport.expect_mode().return_const(BusMode::Classic);
        transport.expect_send().times(1).returning(|_| {
            Err(BusError::BusDown {
                message: "no carrier".to_string(),
            })
        });
        let error = enable_drives(&mut transport, &[1], &ArmConfig::default()).unwrap_err();
        assert!(error.contains("no carrier"));
    }

    #[test]
    fn feedback_from_other_ids_is_skipped() {
        let mut frames = vec![
            feedback_frame(2, 0.5),
            feedback_frame(7, 1.),
            CanFrame::new(0x300, &[1, 2]).unwrap(),
            feedback_frame(1, -0.5),
        ];
        frames.reverse();
        let mut transport = MockCanTransport::new();
        transport
            .expect_receive()
            .times(4)
            .returning(move |_| Ok(frames.pop().unwrap()));
        let mut feedback = HashMap::new();
        receive_feedback(
            &mut transport,
            &[1, 2],
            0x10,
            Instant::now() + Duration::from_secs(1),
            &mut feedback,
        )
        .unwrap();
        assert_eq!(feedback.len(), 2);
        assert!((feedback[&1].position + 0.5).abs() < 1e-3);
    }

    #[test]
    fn receive_stops_at_deadline_and_on_bus_down() {
        let mut transport = MockCanTransport::new();
        transport
            .expect_receive()
            .with(always())
            .returning(|timeout| {
                std::thread::sleep(timeout);
                Err(BusError::Timeout)
            });
        let mut feedback = HashMap::new();
        let start = Instant::now();
        receive_feedback(
            &mut transport,
            &[1],
            0x10,
            start + Duration::from_millis(5),
            &mut feedback,
        )
        .unwrap();
        assert!(feedback.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(5));

        let mut transport = MockCanTransport::new();
        transport.expect_receive().times(1).returning(|_| {
            Err(BusError::BusDown {
                message: "gone".to_string(),
            })
        });
        assert!(matches!(
            receive_feedback(
                &mut transport,
                &[1],
                0x10,
                Instant::now() + Duration::from_secs(1),
                &mut feedback,
            ),
            Err(BusError::BusDown { .. })
        ));
    }
}
