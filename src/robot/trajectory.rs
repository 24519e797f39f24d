// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Time-parameterized reference paths sampled at the control rate.
//!
//! A trajectory of duration `tf` planned at `ctrl_hz` has `ceil(tf * ctrl_hz)` samples. Sample
//! `k` is due `(k + 1) / ctrl_hz` seconds after the motion started and the last sample is the
//! target itself. Joint trajectories are evaluated lazily. Cartesian trajectories are solved
//! with inverse kinematics while planning, so a request either fails as a whole or never fails
//! while the loop executes it.
use std::sync::Arc;

use nalgebra::{Isometry3, Translation3, UnitQuaternion};

use crate::exception::{check_dimension, invalid_request, ArmException, ArmResult};
use crate::model::KinematicModel;
use crate::robot::robot_state::CartesianPose;
use crate::robot::types::{P_MAX, V_MAX};
use crate::utils::{quintic_time_scaling, JointVector};

/// Upper bound on the number of samples of a single request.
pub const MAX_SAMPLES: usize = 1 << 24;

/// Largest `ds/dtau` of the quintic time scaling, reached halfway.
const QUINTIC_PEAK_RATE: f64 = 1.875;

/// One setpoint of a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectorySample {
    /// Due time relative to the start of the motion in \[s\].
    pub time: f64,
    /// Joint positions in \[rad\].
    pub position: JointVector,
    /// Joint velocities in \[rad/s\].
    pub velocity: JointVector,
    /// Cartesian setpoint this sample was solved for.
    pub pose: Option<CartesianPose>,
}

#[derive(Debug, Clone)]
enum Profile {
    Joint {
        start: JointVector,
        goal: JointVector,
        duration: f64,
        len: usize,
    },
    Solved(Vec<TrajectorySample>),
}

/// A finite sequence of setpoints.
#[derive(Debug, Clone)]
pub struct Trajectory {
    profile: Profile,
    period: f64,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        match &self.profile {
            Profile::Joint { len, .. } => *len,
            Profile::Solved(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample period in \[s\].
    pub fn period(&self) -> f64 {
        self.period
    }

    /// Due time of the last sample in \[s\].
    pub fn duration(&self) -> f64 {
        self.len() as f64 * self.period
    }

    /// The sample at `index`, `None` past the end.
    pub fn sample(&self, index: usize) -> Option<TrajectorySample> {
        match &self.profile {
            Profile::Solved(samples) => samples.get(index).cloned(),
            Profile::Joint {
                start,
                goal,
                duration,
                len,
            } => {
                if index >= *len {
                    return None;
                }
                let time = (index + 1) as f64 * self.period;
                if index + 1 == *len {
                    return Some(TrajectorySample {
                        time,
                        position: goal.clone(),
                        velocity: JointVector::zeros(goal.len()),
                        pose: None,
                    });
                }
                let (s, ds) = quintic_time_scaling(time / duration);
                let delta = goal - start;
                Some(TrajectorySample {
                    time,
                    position: start + &delta * s,
                    velocity: delta * (ds / duration),
                    pose: None,
                })
            }
        }
    }

    /// The target of the trajectory.
    pub fn final_sample(&self) -> Option<TrajectorySample> {
        self.len().checked_sub(1).and_then(|last| self.sample(last))
    }

    /// Iterates over all samples. Every call starts from the beginning.
    pub fn iter(&self) -> TrajectoryIter<'_> {
        TrajectoryIter {
            trajectory: self,
            index: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = TrajectorySample;
    type IntoIter = TrajectoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the samples of a [`Trajectory`].
pub struct TrajectoryIter<'a> {
    trajectory: &'a Trajectory,
    index: usize,
}

impl<'a> Iterator for TrajectoryIter<'a> {
    type Item = TrajectorySample;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.trajectory.sample(self.index)?;
        self.index += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.trajectory.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for TrajectoryIter<'a> {}

/// Plans trajectories for one arm.
#[derive(Debug, Clone)]
pub struct TrajectoryPlanner {
    model: Arc<KinematicModel>,
}

impl TrajectoryPlanner {
    pub fn new(model: Arc<KinematicModel>) -> TrajectoryPlanner {
        TrajectoryPlanner { model }
    }

    pub fn model(&self) -> &KinematicModel {
        &self.model
    }

    /// Smooth joint space motion from `start` to `goal`.
    ///
    /// # Errors
    /// * [`InvalidTrajectoryRequest`](`crate::ArmException::InvalidTrajectoryRequest`) if
    ///   `tf` or `ctrl_hz` are not positive and finite, or the goal is not finite.
    /// * [`DimensionMismatch`](`crate::ArmException::DimensionMismatch`) if a vector does not
    ///   have one entry per joint.
    /// * [`OutOfRange`](`crate::ArmException::OutOfRange`) if the goal or the peak velocity
    ///   exceeds what the drives can encode.
    pub fn plan_joint(
        &self,
        start: &JointVector,
        goal: &JointVector,
        tf: f64,
        ctrl_hz: f64,
    ) -> ArmResult<Trajectory> {
        check_dimension(self.model.dof(), start.len())?;
        check_dimension(self.model.dof(), goal.len())?;
        check_finite(goal)?;
        let len = sample_count(tf, ctrl_hz)?;
        // a single sample is sent with zero velocity
        let peak_velocity = if len > 1 {
            (goal - start) * (QUINTIC_PEAK_RATE / tf)
        } else {
            JointVector::zeros(goal.len())
        };
        self.check_drive_range(goal, &peak_velocity)?;
        Ok(Trajectory {
            profile: Profile::Joint {
                start: start.clone(),
                goal: goal.clone(),
                duration: tf,
                len,
            },
            period: 1. / ctrl_hz,
        })
    }

    /// Straight line motion of the end effector from the pose at `start` to `target`.
    ///
    /// The orientation is interpolated along the shortest arc.
    ///
    /// # Errors
    /// Same as [`plan_joint`](`Self::plan_joint`). Additionally every inverse kinematics error of
    /// any sample fails the whole request.
    pub fn plan_cartesian(
        &self,
        start: &JointVector,
        target: &CartesianPose,
        tf: f64,
        ctrl_hz: f64,
    ) -> ArmResult<Trajectory> {
        check_dimension(self.model.dof(), start.len())?;
        check_pose(target)?;
        let len = sample_count(tf, ctrl_hz)?;
        let period = 1. / ctrl_hz;
        let from = self.model.end_effector_isometry(start)?;
        let to = target.to_isometry();
        let goal_rotation = shortest_arc(&from.rotation, to.rotation);
        let mut samples = Vec::with_capacity(len);
        let mut previous = start.clone();
        for k in 0..len {
            let time = (k + 1) as f64 * period;
            let (pose, isometry) = if k + 1 == len {
                (*target, to)
            } else {
                let (s, _) = quintic_time_scaling(time / tf);
                let translation =
                    from.translation.vector + (to.translation.vector - from.translation.vector) * s;
                let rotation = from
                    .rotation
                    .try_slerp(&goal_rotation, s, 1e-9)
                    .unwrap_or(goal_rotation);
                let isometry = Isometry3::from_parts(Translation3::from(translation), rotation);
                (CartesianPose::from_isometry(&isometry), isometry)
            };
            let position = self.model.inverse_kinematics(&isometry, &previous)?;
            let velocity = if k + 1 == len {
                JointVector::zeros(position.len())
            } else {
                (&position - &previous) / period
            };
            self.check_drive_range(&position, &velocity)?;
            previous = position.clone();
            samples.push(TrajectorySample {
                time,
                position,
                velocity,
                pose: Some(pose),
            });
        }
        Ok(Trajectory {
            profile: Profile::Solved(samples),
            period,
        })
    }

    /// A single setpoint without smoothing. Meant for callers which generate their own
    /// trajectories at the control rate.
    pub fn raw_joint(&self, position: &JointVector, velocity: &JointVector) -> ArmResult<Trajectory> {
        check_dimension(self.model.dof(), position.len())?;
        check_dimension(self.model.dof(), velocity.len())?;
        check_finite(position)?;
        check_finite(velocity)?;
        self.check_drive_range(position, velocity)?;
        Ok(Trajectory {
            profile: Profile::Solved(vec![TrajectorySample {
                time: 0.,
                position: position.clone(),
                velocity: velocity.clone(),
                pose: None,
            }]),
            period: 0.,
        })
    }

    /// A single setpoint solved with inverse kinematics seeded at `seed`.
    pub fn raw_cartesian(&self, seed: &JointVector, target: &CartesianPose) -> ArmResult<Trajectory> {
        check_pose(target)?;
        let position = self
            .model
            .inverse_kinematics(&target.to_isometry(), seed)?;
        self.check_drive_range(&position, &JointVector::zeros(position.len()))?;
        Ok(Trajectory {
            profile: Profile::Solved(vec![TrajectorySample {
                time: 0.,
                velocity: JointVector::zeros(position.len()),
                position,
                pose: Some(*target),
            }]),
            period: 0.,
        })
    }
}

impl TrajectoryPlanner {
    /// Fails unless every drive can encode the setpoint without saturating.
    fn check_drive_range(&self, position: &JointVector, velocity: &JointVector) -> ArmResult<()> {
        check_motor_limit(&self.model.joint_to_motor(position), P_MAX)?;
        check_motor_limit(&self.model.joint_to_motor(velocity), V_MAX)
    }
}

fn check_motor_limit(values: &JointVector, limit: f64) -> ArmResult<()> {
    match values.iter().find(|value| value.abs() > limit) {
        Some(value) => Err(ArmException::OutOfRange {
            value: *value,
            min: -limit,
            max: limit,
        }),
        None => Ok(()),
    }
}

fn sample_count(tf: f64, ctrl_hz: f64) -> ArmResult<usize> {
    if !(tf.is_finite() && tf > 0.) {
        return Err(invalid_request("duration must be positive and finite"));
    }
    if !(ctrl_hz.is_finite() && ctrl_hz > 0.) {
        return Err(invalid_request("control rate must be positive and finite"));
    }
    // products like 2.0 * 300.0 must not round up to an extra sample
    let count = (tf * ctrl_hz - 1e-9).ceil().max(1.);
    if count > MAX_SAMPLES as f64 {
        return Err(invalid_request("trajectory has too many samples"));
    }
    Ok(count as usize)
}

fn check_finite(values: &JointVector) -> ArmResult<()> {
    if values.iter().any(|x| !x.is_finite()) {
        return Err(invalid_request("joint values must be finite"));
    }
    Ok(())
}

fn check_pose(pose: &CartesianPose) -> ArmResult<()> {
    if !pose.is_finite() {
        return Err(invalid_request("pose must be finite"));
    }
    Ok(())
}

fn shortest_arc(from: &UnitQuaternion<f64>, to: UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    if from.coords.dot(&to.coords) < 0. {
        UnitQuaternion::new_unchecked(-to.into_inner())
    } else {
        to
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::exception::ArmException;
    use crate::model::tests::{regular_configuration, test_calibration};
    use crate::model::KinematicModel;
    use crate::robot::robot_state::CartesianPose;
    use crate::robot::trajectory::TrajectoryPlanner;
    use crate::utils::JointVector;

    fn planner() -> TrajectoryPlanner {
        TrajectoryPlanner::new(Arc::new(KinematicModel::new(test_calibration())))
    }

    #[test]
    fn six_joint_move_to_zero() {
        let start = JointVector::from_vec(vec![0.5, -0.3, 0.2, 1.0, -0.7, 0.4]);
        let goal = JointVector::zeros(6);
        let trajectory = planner().plan_joint(&start, &goal, 2.0, 300.).unwrap();
        assert_eq!(trajectory.len(), 600);
        let samples: Vec<_> = trajectory.iter().collect();
        assert_eq!(samples.len(), 600);
        for (k, sample) in samples.iter().enumerate() {
            assert!((sample.time - (k + 1) as f64 / 300.).abs() < 1e-12);
        }
        assert!(samples[0].velocity.amax() < 1e-3);
        assert_eq!(samples[599].position, goal);
        assert_eq!(samples[599].velocity, JointVector::zeros(6));
        assert!(samples[598].velocity.amax() < 1e-3);
        // halfway through the quintic is exactly the midpoint
        assert!((&samples[299].position - &start * 0.5).amax() < 1e-12);
    }

    #[test]
    fn sample_count_rounds_up() {
        let planner = planner();
        let start = JointVector::zeros(6);
        let goal = JointVector::from_element(6, 0.1);
        assert_eq!(planner.plan_joint(&start, &goal, 0.01, 300.).unwrap().len(), 3);
        assert_eq!(planner.plan_joint(&start, &goal, 1e-6, 300.).unwrap().len(), 1);
        let trajectory = planner.plan_joint(&start, &goal, 1e-6, 300.).unwrap();
        assert_eq!(trajectory.final_sample().unwrap().position, goal);
    }

    #[test]
    fn iteration_restarts() {
        let trajectory = planner()
            .plan_joint(&JointVector::zeros(6), &JointVector::from_element(6, 1.), 0.1, 100.)
            .unwrap();
        let first: Vec<_> = trajectory.iter().collect();
        let second: Vec<_> = (&trajectory).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(trajectory.iter().len(), 10);
    }

    #[test]
    fn invalid_requests() {
        let planner = planner();
        let q = JointVector::zeros(6);
        for (tf, hz) in [(0., 300.), (-1., 300.), (1., 0.), (f64::NAN, 300.), (1., f64::INFINITY)] {
            assert!(matches!(
                planner.plan_joint(&q, &q, tf, hz),
                Err(ArmException::InvalidTrajectoryRequest { .. })
            ));
        }
        assert!(matches!(
            planner.plan_joint(&q, &JointVector::zeros(5), 1., 300.),
            Err(ArmException::DimensionMismatch { .. })
        ));
        assert!(matches!(
            planner.plan_joint(&q, &JointVector::from_element(6, f64::NAN), 1., 300.),
            Err(ArmException::InvalidTrajectoryRequest { .. })
        ));
        assert!(planner.plan_joint(&q, &q, 1e9, 1e9).is_err());
    }

    #[test]
    fn cartesian_line_reaches_target() {
        let planner = planner();
        let start = regular_configuration();
        let goal_q = start.add_scalar(0.15);
        let target = planner.model().forward_kinematics(&goal_q).unwrap();
        let trajectory = planner.plan_cartesian(&start, &target, 0.5, 100.).unwrap();
        assert_eq!(trajectory.len(), 50);
        let last = trajectory.final_sample().unwrap();
        assert_eq!(last.pose, Some(target));
        let reached = planner.model().forward_kinematics(&last.position).unwrap();
        assert!((reached.position - target.position).norm() < 1e-6);

        // the end effector moves along the straight line
        let from = planner.model().forward_kinematics(&start).unwrap().position;
        let direction = (target.position - from).normalize();
        for sample in trajectory.iter() {
            let p = planner
                .model()
                .forward_kinematics(&sample.position)
                .unwrap()
                .position;
            let offset = p - from;
            assert!((offset - direction * offset.dot(&direction)).norm() < 1e-6);
        }
    }

    #[test]
    fn unreachable_cartesian_target_fails_whole_request() {
        let planner = planner();
        let target = CartesianPose::new([2., 0., 0.5], [0., 0., 0.]);
        // the arm stretches towards the target until a sample leaves the workspace
        assert!(matches!(
            planner.plan_cartesian(&regular_configuration(), &target, 0.5, 100.),
            Err(ArmException::KinematicsUnreachable { .. })
                | Err(ArmException::KinematicsSingular { .. })
        ));
        assert!(matches!(
            planner.raw_cartesian(&regular_configuration(), &target),
            Err(ArmException::KinematicsUnreachable { .. })
        ));
    }

    #[test]
    fn setpoints_beyond_the_drive_range_are_rejected() {
        let planner = planner();
        let q = JointVector::zeros(6);
        let far = JointVector::from_vec(vec![20., 0., 0., 0., 0., 0.]);
        match planner.plan_joint(&q, &far, 2., 300.) {
            Err(ArmException::OutOfRange { value, min, max }) => {
                assert_eq!(value, 20.);
                assert_eq!((min, max), (-12.5, 12.5));
            }
            other => panic!("expected out of range, got {:?}", other),
        }
        // 3 rad in 0.1 s peaks at 56 rad/s
        let fast = JointVector::from_element(6, 3.);
        assert!(matches!(
            planner.plan_joint(&q, &fast, 0.1, 300.),
            Err(ArmException::OutOfRange { max, .. }) if max == 45.
        ));
        assert!(planner.plan_joint(&q, &fast, 0.2, 300.).is_ok());
        assert!(matches!(
            planner.raw_joint(&far, &q),
            Err(ArmException::OutOfRange { .. })
        ));
        assert!(matches!(
            planner.raw_joint(&q, &JointVector::from_element(6, -50.)),
            Err(ArmException::OutOfRange { .. })
        ));
    }

    #[test]
    fn cartesian_samples_beyond_the_drive_range_are_rejected() {
        let planner = planner();
        let start = regular_configuration();
        let goal = start.add_scalar(0.15);
        let target = planner.model().forward_kinematics(&goal).unwrap();
        // the same line in 2 ms needs joint velocities far above the drive range
        assert!(matches!(
            planner.plan_cartesian(&start, &target, 0.002, 1000.),
            Err(ArmException::OutOfRange { .. })
        ));
    }

    #[test]
    fn raw_request_is_single_sample() {
        let planner = planner();
        let q = JointVector::from_element(6, 0.2);
        let dq = JointVector::from_element(6, 0.1);
        let trajectory = planner.raw_joint(&q, &dq).unwrap();
        assert_eq!(trajectory.len(), 1);
        let sample = trajectory.sample(0).unwrap();
        assert_eq!(sample.position, q);
        assert_eq!(sample.velocity, dq);
        assert!(trajectory.sample(1).is_none());
    }
}
