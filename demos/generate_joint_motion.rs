// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

use clap::Parser;

use startouch::{ArmConfig, ArmResult, MotionOutcome, DEFAULT_MOTION_DURATION};

mod common;

/// An example showing how to generate joint and Cartesian motions.
///
/// WARNING: Before executing this example on hardware, make sure there is enough space around
/// the arm.
#[derive(Parser, Debug)]
#[clap(author, version, name = "generate_joint_motion")]
struct CommandLineArguments {
    /// CAN interface of the arm. A simulated bus is used if omitted.
    #[clap(short, long)]
    pub interface: Option<String>,
    /// Duration of every motion in seconds
    #[clap(short, long, default_value_t = DEFAULT_MOTION_DURATION)]
    pub duration: f64,
}

fn main() -> ArmResult<()> {
    common::init_logging();
    let args = CommandLineArguments::parse();
    let config = ArmConfig::default();
    let ctrl_hz = config.ctrl_hz;
    let arm = common::open_arm(args.interface, config)?;
    println!("WARNING: This example will move the arm! Please make sure to have the emergency stop at hand!");

    let q_goal = [0.2, 0.6, -0.7, 0.3, 0.8, -0.2];
    let outcome = arm.set_joint(&q_goal, args.duration, ctrl_hz)?.wait();
    println!("joint motion: {:?}", outcome);
    println!("reached {:?}", arm.joint_positions());

    let pose = arm.end_effector_pose();
    let mut position = [pose.position.x, pose.position.y, pose.position.z];
    position[2] += 0.05;
    let orientation = [pose.orientation.x, pose.orientation.y, pose.orientation.z];
    let outcome = arm
        .set_end_effector_pose(&position, &orientation, args.duration)?
        .wait();
    println!("Cartesian motion: {:?}", outcome);
    println!("end effector at {:?}", arm.end_effector_pose_quat());

    if arm.go_home(args.duration)?.wait() == MotionOutcome::Completed {
        println!("Finished motion, shutting down example");
    }
    arm.cleanup();
    Ok(())
}
