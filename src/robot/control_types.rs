// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the mode flags of the control loop and the observer returned for motion requests.
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};

/// How setpoints are applied by the drives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Stiffness and damping around the setpoint, gravity compensation as feed-forward torque.
    Impedance,
    /// Stiff position tracking, gravity compensation as position offset `tau_g / kp`.
    Position,
}

/// Used to decide whether to enforce realtime mode for the control loop thread.
/// see [`Arm`](`crate::Arm`)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealtimeConfig {
    Enforce,
    Ignore,
}

/// Whether the identified gravity model is applied to the setpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GravityCompensationMode {
    Disabled,
    Enabled,
}

/// Status of the control loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    /// Holding the last setpoint.
    Idle,
    /// Following a trajectory.
    Tracking,
    /// Stopped after a fatal error until [`reset`](`crate::Arm::reset`) is called.
    Faulted,
    /// The handle was shut down.
    Stopped,
}

/// How a motion request ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionOutcome {
    /// The final sample was sent and acknowledged by the drives.
    Completed,
    /// A newer request replaced this one.
    Superseded,
    /// The loop faulted while the motion was pending or running.
    Faulted,
    /// The handle was shut down.
    Shutdown,
}

/// Observer of a single motion request.
///
/// Dropping the handle does not cancel the motion.
#[derive(Debug)]
pub struct MotionHandle {
    id: u64,
    receiver: Receiver<MotionOutcome>,
    outcome: Mutex<Option<MotionOutcome>>,
}

impl MotionHandle {
    pub(crate) fn new(id: u64, receiver: Receiver<MotionOutcome>) -> MotionHandle {
        MotionHandle {
            id,
            receiver,
            outcome: Mutex::new(None),
        }
    }

    /// Sequence number of the request. Later requests have larger ids.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the motion ended.
    pub fn wait(&self) -> MotionOutcome {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *outcome.get_or_insert_with(|| self.receiver.recv().unwrap_or(MotionOutcome::Shutdown))
    }

    /// Blocks up to `timeout`. Returns `None` if the motion is still pending or running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<MotionOutcome> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_none() {
            *outcome = match self.receiver.recv_timeout(timeout) {
                Ok(received) => Some(received),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(MotionOutcome::Shutdown),
            };
        }
        *outcome
    }

    /// Returns the outcome if the motion already ended.
    pub fn try_outcome(&self) -> Option<MotionOutcome> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if outcome.is_none() {
            *outcome = match self.receiver.try_recv() {
                Ok(received) => Some(received),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(MotionOutcome::Shutdown),
            };
        }
        *outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::bounded;

    use crate::robot::control_types::{MotionHandle, MotionOutcome};

    #[test]
    fn handle_reports_outcome() {
        let (sender, receiver) = bounded(1);
        let handle = MotionHandle::new(7, receiver);
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.try_outcome(), None);
        assert_eq!(handle.wait_timeout(Duration::from_millis(1)), None);
        sender.send(MotionOutcome::Superseded).unwrap();
        drop(sender);
        assert_eq!(handle.wait(), MotionOutcome::Superseded);
        // the outcome is kept after the loop dropped its end
        assert_eq!(handle.wait(), MotionOutcome::Superseded);
        assert_eq!(handle.try_outcome(), Some(MotionOutcome::Superseded));
    }

    #[test]
    fn dropped_sender_means_shutdown() {
        let (sender, receiver) = bounded::<MotionOutcome>(1);
        let handle = MotionHandle::new(0, receiver);
        drop(sender);
        assert_eq!(handle.wait(), MotionOutcome::Shutdown);
        assert_eq!(handle.try_outcome(), Some(MotionOutcome::Shutdown));
    }
}
