// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the logging type definitions for [`ControlException`](`crate::exception::ArmException::ControlException`)
use std::collections::VecDeque;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::robot::robot_state::ArmState;
use crate::utils::JointVector;

/// Command sent to the drives, in joint space. Structure used only for logging purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLog {
    /// sent joint positions, including a gravity offset in position mode.
    pub joint_positions: JointVector,

    /// sent joint velocities.
    pub joint_velocities: JointVector,

    /// sent feed-forward torques.
    pub torques: JointVector,

    /// sent gripper position, normalized.
    pub gripper: Option<f64>,
}

/// One row of the log contains a command of cycle n and the arm state measured
/// in response to it.
/// Provided by the [`ControlException`](`crate::exception::ArmException::ControlException`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Arm state of cycle n.
    pub state: ArmState,
    /// Command of cycle n.
    pub command: CommandLog,
}

impl Record {
    /// creates a string representation based on the debug formatter
    pub fn log(&self) -> String {
        format!("{:?}", self)
    }
}

/// Ring buffer of the last `log_size` records.
pub(crate) struct Logger {
    records: VecDeque<Record>,
    log_size: usize,
}

impl Logger {
    pub fn new(log_size: usize) -> Self {
        Logger {
            records: VecDeque::with_capacity(log_size),
            log_size,
        }
    }

    pub fn log(&mut self, state: &ArmState, command: &CommandLog) {
        if self.log_size == 0 {
            return;
        }
        if self.records.len() == self.log_size {
            self.records.pop_front();
        }
        self.records.push_back(Record {
            state: state.clone(),
            command: command.clone(),
        });
    }

    /// Returns the records oldest first and empties the buffer.
    pub fn flush(&mut self) -> Vec<Record> {
        self.records.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::robot::logger::{CommandLog, Logger};
    use crate::robot::robot_state::{ArmState, CartesianPose, JointState};
    use crate::utils::JointVector;

    fn state(cycle: u64) -> ArmState {
        let mut state = ArmState::initial(
            JointState::zeros(2),
            CartesianPose::new([0.; 3], [0.; 3]),
        );
        state.cycle = cycle;
        state
    }

    fn command() -> CommandLog {
        CommandLog {
            joint_positions: JointVector::zeros(2),
            joint_velocities: JointVector::zeros(2),
            torques: JointVector::zeros(2),
            gripper: None,
        }
    }

    #[test]
    fn keeps_the_newest_records() {
        let mut logger = Logger::new(3);
        for cycle in 0..5 {
            logger.log(&state(cycle), &command());
        }
        let records = logger.flush();
        let cycles: Vec<u64> = records.iter().map(|record| record.state.cycle).collect();
        assert_eq!(cycles, vec![2, 3, 4]);
        assert!(logger.flush().is_empty());
        assert!(records[0].log().contains("cycle: 2"));
    }

    #[test]
    fn disabled_logger() {
        let mut logger = Logger::new(0);
        logger.log(&state(0), &command());
        assert!(logger.flush().is_empty());
    }
}
