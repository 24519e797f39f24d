// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Online identification of the gravity model.
//!
//! The arm is driven through a fixed excitation sequence by the control loop while every
//! published joint state is recorded. The measured torques are low-pass filtered, the calibrated
//! friction is removed and a [`GravityModel`] is fitted to what remains.
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::exception::{ArmException, ArmResult};
use crate::model::gravity::GravityModel;
use crate::robot::control_types::MotionOutcome;
use crate::robot::low_pass_filter::filter_joint_series;
use crate::robot::robot_impl::Shared;
use crate::robot::robot_state::JointState;
use crate::robot::trajectory::TrajectoryPlanner;
use crate::utils::JointVector;

/// Tuning of the excitation sequence and the fit.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(default)]
pub struct IdentificationConfig {
    /// Excursion of every joint from the home configuration in \[rad\].
    pub amplitude: f64,
    /// Duration of every segment of the sequence in \[s\].
    pub segment_duration: f64,
    /// Ridge regularization of the least-squares fit.
    pub ridge: f64,
    /// Cutoff frequency of the torque filter in \[Hz\].
    pub torque_cutoff_frequency: f64,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        IdentificationConfig {
            amplitude: 0.4,
            segment_duration: 3.,
            ridge: 1e-6,
            torque_cutoff_frequency: 5.,
        }
    }
}

/// Waypoints of the excitation sequence: home, plus and minus `amplitude` on every joint, two
/// configurations moving all joints at once and home again.
pub fn excitation_waypoints(dof: usize, amplitude: f64) -> Vec<JointVector> {
    let home = JointVector::zeros(dof);
    let mut waypoints = vec![home.clone()];
    for joint in 0..dof {
        for sign in [1., -1.] {
            let mut waypoint = home.clone();
            waypoint[joint] = sign * amplitude;
            waypoints.push(waypoint);
        }
    }
    let alternating =
        JointVector::from_fn(dof, |i, _| if i % 2 == 0 { amplitude } else { -amplitude });
    waypoints.push(alternating.clone());
    waypoints.push(-alternating);
    waypoints.push(home);
    waypoints
}

fn incomplete(message: String) -> ArmException {
    ArmException::IdentificationIncomplete { message }
}

/// Runs the excitation sequence, fits the model and installs it.
///
/// The installed model is only replaced when the whole sequence completed and the fit succeeded.
pub(crate) fn identify(
    shared: &Shared,
    planner: &TrajectoryPlanner,
    config: &IdentificationConfig,
    ctrl_hz: f64,
) -> ArmResult<Arc<GravityModel>> {
    let model = planner.model();
    let waypoints = excitation_waypoints(model.dof(), config.amplitude);
    info!(
        "starting gravity identification with {} segments",
        waypoints.len()
    );
    shared.cache.start_recording();
    let executed = execute(shared, planner, &waypoints, config.segment_duration, ctrl_hz);
    let recorded = shared.cache.stop_recording();
    if let Err(error) = executed {
        warn!("gravity identification aborted: {}", error);
        return Err(error);
    }

    let gravity = fit(shared, planner, &recorded, config, ctrl_hz)?;
    let gravity = Arc::new(gravity);
    shared.set_gravity_model(gravity.clone());
    info!(
        "gravity model identified from {} samples",
        recorded.len()
    );
    Ok(gravity)
}

fn execute(
    shared: &Shared,
    planner: &TrajectoryPlanner,
    waypoints: &[JointVector],
    segment_duration: f64,
    ctrl_hz: f64,
) -> ArmResult<()> {
    let mut start = shared.cache.load().commanded.position().clone();
    for (segment, waypoint) in waypoints.iter().enumerate() {
        let trajectory = planner
            .plan_joint(&start, waypoint, segment_duration, ctrl_hz)
            .map_err(|error| incomplete(format!("segment {}: {}", segment, error)))?;
        let handle = shared
            .install(trajectory)
            .map_err(|error| incomplete(format!("segment {}: {}", segment, error)))?;
        match handle.wait() {
            MotionOutcome::Completed => {}
            outcome => {
                return Err(incomplete(format!(
                    "segment {} ended with {:?}",
                    segment, outcome
                )))
            }
        }
        start = waypoint.clone();
    }
    Ok(())
}

fn fit(
    shared: &Shared,
    planner: &TrajectoryPlanner,
    recorded: &[JointState],
    config: &IdentificationConfig,
    ctrl_hz: f64,
) -> ArmResult<GravityModel> {
    let model = planner.model();
    let torques: Vec<JointVector> = recorded.iter().map(|state| state.torque().clone()).collect();
    if torques
        .iter()
        .any(|tau| tau.iter().any(|value| !value.is_finite()))
    {
        return Err(incomplete("recorded torques are not finite".to_string()));
    }
    let filtered = filter_joint_series(1. / ctrl_hz, &torques, config.torque_cutoff_frequency);
    let samples: Vec<(JointVector, JointVector)> = recorded
        .iter()
        .zip(filtered)
        .map(|(state, tau)| {
            (
                state.position().clone(),
                tau - model.friction_torque(state.velocity()),
            )
        })
        .collect();
    if shared.is_shutdown() {
        return Err(incomplete("arm was shut down before the fit".to_string()));
    }
    GravityModel::fit(model.dof(), &samples, config.ridge)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::exception::ArmException;
    use crate::model::tests::test_calibration;
    use crate::model::KinematicModel;
    use crate::robot::identification::{excitation_waypoints, fit, identify, IdentificationConfig};
    use crate::robot::robot_impl::Shared;
    use crate::robot::robot_state::{ArmState, CartesianPose, JointState};
    use crate::robot::trajectory::TrajectoryPlanner;

    fn shut_down_shared() -> Shared {
        let shared = Shared::new(
            ArmState::initial(JointState::zeros(6), CartesianPose::new([0.; 3], [0.; 3])),
            None,
            false,
        );
        shared.request_shutdown();
        shared
    }

    #[test]
    fn shutdown_reports_incomplete_identification() {
        let shared = shut_down_shared();
        let planner = TrajectoryPlanner::new(Arc::new(KinematicModel::new(test_calibration())));
        let config = IdentificationConfig::default();
        assert!(matches!(
            identify(&shared, &planner, &config, 300.),
            Err(ArmException::IdentificationIncomplete { .. })
        ));
        let recorded = vec![JointState::zeros(6); 50];
        assert!(matches!(
            fit(&shared, &planner, &recorded, &config, 300.),
            Err(ArmException::IdentificationIncomplete { .. })
        ));
        assert!(shared.gravity_model().is_none());
    }

    #[test]
    fn waypoints_start_and_end_at_home() {
        let waypoints = excitation_waypoints(3, 0.4);
        assert_eq!(waypoints.len(), 2 * 3 + 4);
        assert_eq!(waypoints[0].norm(), 0.);
        assert_eq!(waypoints[waypoints.len() - 1].norm(), 0.);
        assert_eq!(waypoints[1][0], 0.4);
        assert_eq!(waypoints[2][0], -0.4);
        assert_eq!(waypoints[6][2], -0.4);
        assert_eq!(waypoints[7].as_slice(), &[0.4, -0.4, 0.4]);
        assert_eq!(waypoints[8].as_slice(), &[-0.4, 0.4, -0.4]);
    }
}
