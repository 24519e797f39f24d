// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

use std::thread;
use std::time::Duration;

use clap::Parser;

use startouch::{ArmConfig, ArmResult, ControlMode, GravityCompensationMode, IdentificationConfig};

mod common;

/// An example identifying the gravity model and holding the arm with gravity compensation.
///
/// WARNING: The identification moves every joint of the arm.
#[derive(Parser, Debug)]
#[clap(author, version, name = "identify_gravity")]
struct CommandLineArguments {
    /// CAN interface of the arm. A simulated bus is used if omitted.
    #[clap(short, long)]
    pub interface: Option<String>,
    /// Excursion of every joint in radians
    #[clap(short, long, default_value_t = 0.4)]
    pub amplitude: f64,
    /// Duration of every excitation segment in seconds
    #[clap(short, long, default_value_t = 3.)]
    pub segment_duration: f64,
    /// Apply compensation as position offset instead of feed-forward torque
    #[clap(long, action)]
    pub position_mode: bool,
}

fn main() -> ArmResult<()> {
    common::init_logging();
    let args = CommandLineArguments::parse();
    let config = ArmConfig {
        control_mode: if args.position_mode {
            ControlMode::Position
        } else {
            ControlMode::Impedance
        },
        identification: IdentificationConfig {
            amplitude: args.amplitude,
            segment_duration: args.segment_duration,
            ..IdentificationConfig::default()
        },
        ..ArmConfig::default()
    };
    let arm = common::open_arm(args.interface, config)?;
    println!("WARNING: This example will move the arm! Please make sure to have the emergency stop at hand!");

    let model = arm.gravity_compensation()?;
    println!("identified coefficients: {}", model.coefficients());
    arm.set_gravity_compensation(GravityCompensationMode::Enabled);
    for _ in 0..10 {
        let state = arm.state();
        println!(
            "q = {:?}, measured torque = {:?}, feed-forward = {:?}",
            state.joints.position().as_slice(),
            state.joints.torque().as_slice(),
            state.commanded.torque().as_slice()
        );
        thread::sleep(Duration::from_millis(200));
    }
    arm.cleanup();
    Ok(())
}
