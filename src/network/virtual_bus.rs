// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! A simulated bus with drives speaking the MIT protocol.
//!
//! The simulated drives track their commanded position perfectly. Their reported torque is
//! either the commanded feed-forward torque or the output of a user supplied load model, which
//! makes the bus usable for gravity identification. Clones of a [`VirtualBus`] share the same
//! simulation, so a test can keep a clone to inject faults while the control loop owns the other.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::network::{check_mode, BusError, BusMode, CanFrame, CanTransport};
use crate::robot::error::DriveState;
use crate::robot::types::{MotorCommand, MotorFeedback, SpecialCommand};

/// Maps the positions of all simulated drives (ordered by motor id) onto their torques.
pub type LoadModel = Box<dyn Fn(&[f64]) -> Vec<f64> + Send + Sync>;

const MOS_TEMPERATURE: u8 = 32;
const ROTOR_TEMPERATURE: u8 = 35;

#[derive(Debug, Clone)]
struct SimulatedDrive {
    id: u32,
    state: DriveState,
    position: f64,
    velocity: f64,
    last_command: Option<MotorCommand>,
}

struct Simulation {
    mode: BusMode,
    feedback_offset: u32,
    drives: Vec<SimulatedDrive>,
    pending: VecDeque<CanFrame>,
    load: Option<LoadModel>,
    down: bool,
    silent: bool,
    fail_after: Option<usize>,
    sent: usize,
}

impl Simulation {
    fn drive_index(&self, id: u32) -> Option<usize> {
        self.drives.iter().position(|drive| drive.id == id)
    }

    fn torque(&self, index: usize) -> f64 {
        match &self.load {
            Some(load) => {
                let positions: Vec<f64> = self.drives.iter().map(|drive| drive.position).collect();
                load(&positions).get(index).copied().unwrap_or(0.)
            }
            None => match (&self.drives[index].state, &self.drives[index].last_command) {
                (DriveState::Enabled, Some(command)) => command.torque,
                _ => 0.,
            },
        }
    }

    fn respond(&mut self, index: usize) -> Result<(), BusError> {
        if self.silent {
            return Ok(());
        }
        let drive = &self.drives[index];
        let feedback = MotorFeedback {
            motor_id: (drive.id & 0xF) as u8,
            state_code: drive.state as u8,
            position: drive.position,
            velocity: drive.velocity,
            torque: self.torque(index),
            mos_temperature: MOS_TEMPERATURE,
            rotor_temperature: ROTOR_TEMPERATURE,
        };
        let frame = self
            .mode
            .frame(drive.id + self.feedback_offset, &feedback.encode())?;
        self.pending.push_back(frame);
        Ok(())
    }
}

/// Simulated bus, see the [module documentation](`self`).
#[derive(Clone)]
pub struct VirtualBus {
    simulation: Arc<Mutex<Simulation>>,
}

impl VirtualBus {
    /// Creates a bus with one disabled drive per motor id, all at position zero.
    ///
    /// # Arguments
    /// * `mode` - frame format the bus accepts
    /// * `motor_ids` - ids the simulated drives listen on
    /// * `feedback_offset` - the drives answer on `motor id + feedback_offset`
    pub fn new(mode: BusMode, motor_ids: impl IntoIterator<Item = u32>, feedback_offset: u32) -> Self {
        let mut drives: Vec<SimulatedDrive> = motor_ids
            .into_iter()
            .map(|id| SimulatedDrive {
                id,
                state: DriveState::Disabled,
                position: 0.,
                velocity: 0.,
                last_command: None,
            })
            .collect();
        drives.sort_by_key(|drive| drive.id);
        drives.dedup_by_key(|drive| drive.id);
        VirtualBus {
            simulation: Arc::new(Mutex::new(Simulation {
                mode,
                feedback_offset,
                drives,
                pending: VecDeque::new(),
                load: None,
                down: false,
                silent: false,
                fail_after: None,
                sent: 0,
            })),
        }
    }

    /// Sets the initial drive positions, ordered by motor id.
    pub fn with_positions(self, positions: &[f64]) -> Self {
        {
            let mut simulation = self.lock();
            for (drive, &position) in simulation.drives.iter_mut().zip(positions) {
                drive.position = position;
            }
        }
        self
    }

    /// Replaces the reported torques by the output of a load model.
    pub fn with_load_model<F>(self, load: F) -> Self
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.lock().load = Some(Box::new(load));
        self
    }

    /// Takes the bus down or brings it back up. While down every call fails with BusDown.
    pub fn set_bus_down(&self, down: bool) {
        let mut simulation = self.lock();
        simulation.down = down;
        if !down {
            simulation.fail_after = None;
        }
        simulation.pending.clear();
    }

    /// Suppresses all feedback frames, receives then time out.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Takes the bus down after `frames` further frames have been sent.
    pub fn fail_after(&self, frames: usize) {
        let mut simulation = self.lock();
        simulation.fail_after = Some(simulation.sent + frames);
    }

    /// Forces a drive into a state, e.g. a fault.
    pub fn set_drive_state(&self, id: u32, state: DriveState) {
        let mut simulation = self.lock();
        if let Some(index) = simulation.drive_index(id) {
            simulation.drives[index].state = state;
        }
    }

    /// Moves a drive as if an external force pushed it.
    pub fn set_position(&self, id: u32, position: f64) {
        let mut simulation = self.lock();
        if let Some(index) = simulation.drive_index(id) {
            simulation.drives[index].position = position;
        }
    }

    /// Number of frames sent on the bus so far.
    pub fn sent_frames(&self) -> usize {
        self.lock().sent
    }

    /// Current position of a drive.
    pub fn position(&self, id: u32) -> Option<f64> {
        let simulation = self.lock();
        simulation
            .drive_index(id)
            .map(|index| simulation.drives[index].position)
    }

    /// Last motion command a drive received.
    pub fn last_command(&self, id: u32) -> Option<MotorCommand> {
        let simulation = self.lock();
        simulation
            .drive_index(id)
            .and_then(|index| simulation.drives[index].last_command)
    }

    /// State of a drive.
    pub fn drive_state(&self, id: u32) -> Option<DriveState> {
        let simulation = self.lock();
        simulation
            .drive_index(id)
            .map(|index| simulation.drives[index].state)
    }

    fn lock(&self) -> MutexGuard<'_, Simulation> {
        self.simulation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl CanTransport for VirtualBus {
    fn mode(&self) -> BusMode {
        self.lock().mode
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let mut simulation = self.lock();
        if simulation.down {
            return Err(BusError::BusDown {
                message: "virtual bus is down".to_string(),
            });
        }
        check_mode(frame, simulation.mode)?;
        simulation.sent += 1;
        if let Some(limit) = simulation.fail_after {
            if simulation.sent > limit {
                simulation.down = true;
                simulation.pending.clear();
                return Err(BusError::BusDown {
                    message: "virtual bus went down".to_string(),
                });
            }
        }
        let index = match simulation.drive_index(frame.id()) {
            Some(index) => index,
            None => return Ok(()),
        };
        if let Some(special) = SpecialCommand::parse(frame.data()) {
            let drive = &mut simulation.drives[index];
            match special {
                SpecialCommand::Enable => drive.state = DriveState::Enabled,
                SpecialCommand::Disable => {
                    drive.state = DriveState::Disabled;
                    drive.velocity = 0.;
                }
                SpecialCommand::SetZero => drive.position = 0.,
            }
        } else if let Some(command) = MotorCommand::decode(frame.data()) {
            let drive = &mut simulation.drives[index];
            if drive.state == DriveState::Enabled {
                drive.position = command.position;
                drive.velocity = command.velocity;
                drive.last_command = Some(command);
            }
        } else {
            return Err(BusError::InvalidFrame {
                message: format!("drive {:#x} cannot decode {:?}", frame.id(), frame.data()),
            });
        }
        simulation.respond(index)
    }

    fn receive(&mut self, timeout: Duration) -> Result<CanFrame, BusError> {
        {
            let mut simulation = self.lock();
            if simulation.down {
                return Err(BusError::BusDown {
                    message: "virtual bus is down".to_string(),
                });
            }
            if let Some(frame) = simulation.pending.pop_front() {
                return Ok(frame);
            }
        }
        thread::sleep(timeout);
        Err(BusError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::network::virtual_bus::VirtualBus;
    use crate::network::{BusError, BusMode, CanFrame, CanTransport};
    use crate::robot::error::DriveState;
    use crate::robot::types::{MotorCommand, MotorFeedback, SpecialCommand};

    const TIMEOUT: Duration = Duration::from_millis(1);

    fn enable(bus: &mut VirtualBus, id: u32) -> MotorFeedback {
        bus.send(&CanFrame::new(id, &SpecialCommand::Enable.payload()).unwrap())
            .unwrap();
        let frame = bus.receive(TIMEOUT).unwrap();
        assert_eq!(frame.id(), id + 0x10);
        MotorFeedback::decode(frame.data()).unwrap()
    }

    #[test]
    fn drives_answer_and_track() {
        let mut bus = VirtualBus::new(BusMode::Classic, [2, 1], 0x10).with_positions(&[0.5, -0.5]);
        let feedback = enable(&mut bus, 1);
        assert_eq!(feedback.state(), Some(DriveState::Enabled));
        assert!((feedback.position - 0.5).abs() < 1e-3);
        let command = MotorCommand {
            position: 1.,
            velocity: 0.5,
            kp: 30.,
            kd: 1.,
            torque: 0.7,
        };
        bus.send(&CanFrame::new(1, &command.encode()).unwrap())
            .unwrap();
        let feedback = MotorFeedback::decode(bus.receive(TIMEOUT).unwrap().data()).unwrap();
        assert!((feedback.position - 1.).abs() < 1e-3);
        assert!((feedback.torque - 0.7).abs() < 0.01);
        assert!((bus.position(1).unwrap() - 1.).abs() < 1e-3);

        // a disabled drive reports but does not move
        bus.send(&CanFrame::new(2, &command.encode()).unwrap())
            .unwrap();
        let feedback = MotorFeedback::decode(bus.receive(TIMEOUT).unwrap().data()).unwrap();
        assert_eq!(feedback.state(), Some(DriveState::Disabled));
        assert!((feedback.position + 0.5).abs() < 1e-3);
        assert_eq!(bus.sent_frames(), 3);
    }

    #[test]
    fn load_model_drives_torque() {
        let mut bus = VirtualBus::new(BusMode::Fd, [1, 2], 0x10)
            .with_load_model(|q: &[f64]| q.iter().map(|x| 2. * x).collect());
        bus.send(&CanFrame::new_fd(1, &SpecialCommand::Enable.payload()).unwrap())
            .unwrap();
        bus.receive(TIMEOUT).unwrap();
        bus.send(&CanFrame::new_fd(1, &MotorCommand::query(1.5).encode()).unwrap())
            .unwrap();
        let frame = bus.receive(TIMEOUT).unwrap();
        assert!(frame.is_fd());
        let feedback = MotorFeedback::decode(frame.data()).unwrap();
        assert!((feedback.torque - 3.).abs() < 0.01);
    }

    #[test]
    fn fault_injection() {
        let mut bus = VirtualBus::new(BusMode::Classic, [1], 0x10);
        let handle = bus.clone();
        enable(&mut bus, 1);

        handle.set_silent(true);
        bus.send(&CanFrame::new(1, &MotorCommand::query(0.).encode()).unwrap())
            .unwrap();
        assert_eq!(bus.receive(TIMEOUT), Err(BusError::Timeout));
        handle.set_silent(false);

        handle.set_drive_state(1, DriveState::OverCurrent);
        bus.send(&CanFrame::new(1, &MotorCommand::query(0.).encode()).unwrap())
            .unwrap();
        let feedback = MotorFeedback::decode(bus.receive(TIMEOUT).unwrap().data()).unwrap();
        assert!(feedback.is_fault());

        handle.fail_after(1);
        assert!(bus
            .send(&CanFrame::new(1, &MotorCommand::query(0.).encode()).unwrap())
            .is_ok());
        bus.receive(TIMEOUT).unwrap();
        assert!(matches!(
            bus.send(&CanFrame::new(1, &MotorCommand::query(0.).encode()).unwrap()),
            Err(BusError::BusDown { .. })
        ));
        assert!(matches!(bus.receive(TIMEOUT), Err(BusError::BusDown { .. })));
        handle.set_bus_down(false);
        assert_eq!(bus.receive(TIMEOUT), Err(BusError::Timeout));
    }

    #[test]
    fn wrong_frame_kind_is_rejected() {
        let mut bus = VirtualBus::new(BusMode::Classic, [1], 0x10);
        let frame = CanFrame::new_fd(1, &SpecialCommand::Enable.payload()).unwrap();
        assert!(matches!(
            bus.send(&frame),
            Err(BusError::InvalidFrame { .. })
        ));
        assert_eq!(bus.drive_state(1), Some(DriveState::Disabled));
    }
}
