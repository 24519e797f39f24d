// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Shared setup of the demos: a six joint calibration and either a SocketCAN or a simulated bus.
#![allow(dead_code)]

use std::f64::consts::FRAC_PI_2;

use startouch::{Arm, ArmConfig, ArmResult, BusMode, CalibrationModel, VirtualBus};

/// Calibration of a six joint arm with a 5 cm tool.
pub fn demo_calibration() -> ArmResult<CalibrationModel> {
    let permutation: Vec<Vec<f64>> = (0..6)
        .map(|i| (0..6).map(|j| if i == j { 1. } else { 0. }).collect())
        .collect();
    let pi_b = vec![
        vec![0., FRAC_PI_2, 0.12, 0.],
        vec![0.28, 0., 0., 0.],
        vec![0.02, FRAC_PI_2, 0., 0.],
        vec![0., -FRAC_PI_2, 0.25, 0.],
        vec![0., FRAC_PI_2, 0., 0.],
        vec![0., 0., 0.09, 0.],
        vec![0., 0., 0.05, 0.],
    ];
    let pi_fr = vec![vec![0.05, 0.02]; 6];
    CalibrationModel::from_tables(&permutation, &pi_b, &pi_fr)
}

/// Gravity torques of the simulated arm, indexed by motor id order.
pub fn demo_load(q: &[f64]) -> Vec<f64> {
    let mut tau = vec![0.; q.len()];
    if q.len() >= 3 {
        let elbow = 0.9 * (q[1] + q[2]).cos();
        tau[1] = 2.5 * q[1].cos() + elbow;
        tau[2] = elbow;
    }
    tau
}

/// Opens `interface` with SocketCAN, or a simulated bus when no interface is given.
pub fn open_arm(interface: Option<String>, mut config: ArmConfig) -> ArmResult<Arm> {
    let calibration = demo_calibration()?;
    match interface {
        Some(interface) => {
            config.can_interface = interface;
            Arm::new(calibration, config)
        }
        None => {
            let dof = calibration.dof();
            let mut ids = config.joint_motor_ids(dof);
            ids.extend(config.gripper_motor_id(dof));
            let bus = VirtualBus::new(
                BusMode::from_fd_flag(config.enable_fd),
                ids,
                config.feedback_id_offset,
            )
            .with_load_model(demo_load);
            Arm::with_transport(calibration, config, bus)
        }
    }
}

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
