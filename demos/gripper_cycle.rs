// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

use std::thread;
use std::time::Duration;

use clap::Parser;

use startouch::{ArmConfig, ArmResult};

mod common;

/// An example opening and closing the gripper.
#[derive(Parser, Debug)]
#[clap(author, version, name = "gripper_cycle")]
struct CommandLineArguments {
    /// CAN interface of the arm. A simulated bus is used if omitted.
    #[clap(short, long)]
    pub interface: Option<String>,
    /// Number of open and close cycles
    #[clap(short, long, default_value_t = 3)]
    pub cycles: usize,
    /// Stop half way with a raw position command in between
    #[clap(long, action)]
    pub raw: bool,
}

fn main() -> ArmResult<()> {
    common::init_logging();
    let args = CommandLineArguments::parse();
    let config = ArmConfig {
        gripper_exist: true,
        ..ArmConfig::default()
    };
    let arm = common::open_arm(args.interface, config)?;
    let travel_time = Duration::from_secs_f64(1. / arm.config().gripper.speed + 0.2);
    for cycle in 0..args.cycles {
        arm.open_gripper()?;
        thread::sleep(travel_time);
        println!("cycle {}: open at {:?}", cycle, arm.gripper_position());
        if args.raw {
            arm.set_gripper_position_raw(0.5)?;
            thread::sleep(Duration::from_millis(200));
            println!("cycle {}: raw half way at {:?}", cycle, arm.gripper_position());
        }
        arm.close_gripper()?;
        thread::sleep(travel_time);
        println!("cycle {}: closed at {:?}", cycle, arm.gripper_position());
    }
    arm.cleanup();
    Ok(())
}
