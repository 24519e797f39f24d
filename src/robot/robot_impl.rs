// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! State shared between the [`Arm`](`crate::Arm`) handle and the control loop thread.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Sender};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::exception::{ArmException, ArmResult};
use crate::gripper::GripperController;
use crate::model::gravity::GravityModel;
use crate::robot::control_types::{LoopStatus, MotionHandle, MotionOutcome};
use crate::robot::logger::Record;
use crate::robot::robot_state::ArmState;
use crate::robot::state_cache::StateCache;
use crate::robot::trajectory::Trajectory;

/// Describes why the control loop faulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Explanatory string.
    pub reason: String,
    /// States and commands of the cycles before the fault, oldest first.
    pub log: Vec<Record>,
    /// Time since the loop started.
    pub time: Duration,
}

/// A trajectory waiting to be picked up by the loop.
pub(crate) struct PendingMotion {
    pub id: u64,
    pub trajectory: Trajectory,
    pub observer: Sender<MotionOutcome>,
}

impl PendingMotion {
    pub fn notify(&self, outcome: MotionOutcome) {
        debug!("motion {} ended with {:?}", self.id, outcome);
        // the handle may already be dropped
        let _ = self.observer.try_send(outcome);
    }
}

pub(crate) struct Shared {
    pub cache: StateCache,
    pending: Mutex<Option<PendingMotion>>,
    shutdown: AtomicBool,
    reset_request: Mutex<Option<Sender<ArmResult<()>>>>,
    gravity_model: ArcSwapOption<GravityModel>,
    gravity_enabled: AtomicBool,
    gripper: Option<Mutex<GripperController>>,
    last_fault: Mutex<Option<FaultReport>>,
    next_motion_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub fn new(
        initial: ArmState,
        gripper: Option<GripperController>,
        gravity_enabled: bool,
    ) -> Shared {
        Shared {
            cache: StateCache::new(initial),
            pending: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            reset_request: Mutex::new(None),
            gravity_model: ArcSwapOption::empty(),
            gravity_enabled: AtomicBool::new(gravity_enabled),
            gripper: gripper.map(Mutex::new),
            last_fault: Mutex::new(None),
            next_motion_id: AtomicU64::new(1),
        }
    }

    /// Queues `trajectory` for the loop. A motion that was queued but not yet picked up is
    /// superseded.
    ///
    /// # Errors
    /// * [`Shutdown`](`ArmException::Shutdown`) after shutdown was requested.
    /// * [`ControlException`](`ArmException::ControlException`) while the loop is faulted.
    pub fn install(&self, trajectory: Trajectory) -> ArmResult<MotionHandle> {
        let mut pending = lock(&self.pending);
        if self.is_shutdown() {
            return Err(ArmException::Shutdown);
        }
        if self.cache.status() == LoopStatus::Faulted {
            return Err(self.fault_exception());
        }
        let id = self.next_motion_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(1);
        if let Some(replaced) = pending.replace(PendingMotion {
            id,
            trajectory,
            observer: sender,
        }) {
            replaced.notify(MotionOutcome::Superseded);
        }
        debug!("motion {} queued", id);
        Ok(MotionHandle::new(id, receiver))
    }

    pub fn take_pending(&self) -> Option<PendingMotion> {
        lock(&self.pending).take()
    }

    /// Ends a queued motion with `outcome`.
    pub fn drain_pending(&self, outcome: MotionOutcome) {
        if let Some(motion) = self.take_pending() {
            motion.notify(outcome);
        }
    }

    pub fn request_shutdown(&self) {
        // install checks the flag under the same lock
        let _pending = lock(&self.pending);
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Asks the loop to leave the faulted state. The loop answers on `reply`.
    pub fn request_reset(&self, reply: Sender<ArmResult<()>>) {
        *lock(&self.reset_request) = Some(reply);
    }

    pub fn take_reset_request(&self) -> Option<Sender<ArmResult<()>>> {
        lock(&self.reset_request).take()
    }

    pub fn gravity_model(&self) -> Option<Arc<GravityModel>> {
        self.gravity_model.load_full()
    }

    pub fn set_gravity_model(&self, model: Arc<GravityModel>) {
        self.gravity_model.store(Some(model));
    }

    pub fn gravity_enabled(&self) -> bool {
        self.gravity_enabled.load(Ordering::SeqCst)
    }

    pub fn set_gravity_enabled(&self, enabled: bool) {
        self.gravity_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn has_gripper(&self) -> bool {
        self.gripper.is_some()
    }

    /// Runs `f` on the gripper controller.
    ///
    /// # Errors
    /// * [`NoGripper`](`ArmException::NoGripper`) if the arm has no gripper.
    pub fn with_gripper<R>(&self, f: impl FnOnce(&mut GripperController) -> R) -> ArmResult<R> {
        match &self.gripper {
            Some(gripper) => Ok(f(&mut lock(gripper))),
            None => Err(ArmException::NoGripper),
        }
    }

    pub fn last_fault(&self) -> Option<FaultReport> {
        lock(&self.last_fault).clone()
    }

    pub fn set_last_fault(&self, report: FaultReport) {
        *lock(&self.last_fault) = Some(report);
    }

    /// The error returned to callers while the loop is faulted.
    pub fn fault_exception(&self) -> ArmException {
        match self.last_fault() {
            Some(report) => ArmException::ControlException {
                log: Some(report.log),
                error: report.reason,
            },
            None => ArmException::ControlException {
                log: None,
                error: "control loop is faulted".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::exception::ArmException;
    use crate::model::tests::test_calibration;
    use crate::model::KinematicModel;
    use crate::robot::control_types::{LoopStatus, MotionOutcome};
    use crate::robot::robot_impl::{FaultReport, Shared};
    use crate::robot::robot_state::{ArmState, CartesianPose, JointState};
    use crate::robot::trajectory::{Trajectory, TrajectoryPlanner};
    use crate::utils::JointVector;
    use std::sync::Arc;

    fn shared() -> Shared {
        Shared::new(
            ArmState::initial(JointState::zeros(6), CartesianPose::new([0.; 3], [0.; 3])),
            None,
            false,
        )
    }

    fn trajectory() -> Trajectory {
        TrajectoryPlanner::new(Arc::new(KinematicModel::new(test_calibration())))
            .raw_joint(&JointVector::zeros(6), &JointVector::zeros(6))
            .unwrap()
    }

    #[test]
    fn install_supersedes_queued_motion() {
        let shared = shared();
        let first = shared.install(trajectory()).unwrap();
        let second = shared.install(trajectory()).unwrap();
        assert!(second.id() > first.id());
        assert_eq!(first.try_outcome(), Some(MotionOutcome::Superseded));
        assert_eq!(second.try_outcome(), None);
        assert_eq!(shared.take_pending().unwrap().id, second.id());
        assert!(shared.take_pending().is_none());
    }

    #[test]
    fn install_rejected_while_faulted_or_shut_down() {
        let shared = shared();
        shared.set_last_fault(FaultReport {
            reason: "bus down".to_string(),
            log: vec![],
            time: Duration::ZERO,
        });
        shared.cache.set_status(LoopStatus::Faulted);
        match shared.install(trajectory()) {
            Err(ArmException::ControlException { error, log }) => {
                assert_eq!(error, "bus down");
                assert_eq!(log, Some(vec![]));
            }
            other => panic!("expected control exception, got {:?}", other),
        }
        shared.cache.set_status(LoopStatus::Idle);
        let queued = shared.install(trajectory()).unwrap();
        shared.request_shutdown();
        assert!(matches!(
            shared.install(trajectory()),
            Err(ArmException::Shutdown)
        ));
        shared.drain_pending(MotionOutcome::Shutdown);
        assert_eq!(queued.wait(), MotionOutcome::Shutdown);
    }

    #[test]
    fn gripper_missing() {
        assert!(matches!(
            shared().with_gripper(|gripper| gripper.position()),
            Err(ArmException::NoGripper)
        ));
    }
}
