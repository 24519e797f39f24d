// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Latest arm state, written by the control loop and read by any number of callers.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;

use crate::robot::control_types::LoopStatus;
use crate::robot::robot_state::{ArmState, JointState};

/// Single writer, many readers. Readers always see a complete snapshot.
pub struct StateCache {
    snapshot: ArcSwap<ArmState>,
    recording: Mutex<Option<Vec<JointState>>>,
}

impl StateCache {
    pub fn new(initial: ArmState) -> StateCache {
        StateCache {
            snapshot: ArcSwap::from_pointee(initial),
            recording: Mutex::new(None),
        }
    }

    /// The latest snapshot.
    pub fn load(&self) -> Arc<ArmState> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> LoopStatus {
        self.snapshot.load().status
    }

    /// Replaces the snapshot and appends the measured joints to an active recording.
    pub(crate) fn publish(&self, state: ArmState) {
        if let Some(samples) = self.lock_recording().as_mut() {
            samples.push(state.joints.clone());
        }
        self.snapshot.store(Arc::new(state));
    }

    /// Republishes the current snapshot with a new status. Faulted and stopped snapshots are
    /// flagged stale.
    pub(crate) fn set_status(&self, status: LoopStatus) {
        let mut state = ArmState::clone(&self.snapshot.load());
        state.status = status;
        state.stale = matches!(status, LoopStatus::Faulted | LoopStatus::Stopped);
        self.snapshot.store(Arc::new(state));
    }

    /// Starts collecting every published joint state, discarding an earlier recording.
    pub(crate) fn start_recording(&self) {
        *self.lock_recording() = Some(Vec::new());
    }

    /// Stops collecting and returns what was recorded.
    pub(crate) fn stop_recording(&self) -> Vec<JointState> {
        self.lock_recording().take().unwrap_or_default()
    }

    fn lock_recording(&self) -> MutexGuard<'_, Option<Vec<JointState>>> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
