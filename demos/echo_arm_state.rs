// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

use std::thread;
use std::time::Duration;

use clap::Parser;

use startouch::{ArmConfig, ArmResult};

mod common;

/// An example showing how to continuously read the arm state.
#[derive(Parser, Debug)]
#[clap(author, version, name = "echo_arm_state")]
struct CommandLineArguments {
    /// CAN interface of the arm. A simulated bus is used if omitted.
    #[clap(short, long)]
    pub interface: Option<String>,
    /// Use CAN FD frames
    #[clap(long, action)]
    pub fd: bool,
    /// Number of states to print
    #[clap(short, long, default_value_t = 100)]
    pub count: usize,
}

fn main() -> ArmResult<()> {
    common::init_logging();
    let args = CommandLineArguments::parse();
    let config = ArmConfig {
        enable_fd: args.fd,
        ..ArmConfig::default()
    };
    let arm = common::open_arm(args.interface, config)?;
    for _ in 0..args.count {
        // Printing to standard output is slow, but it does not delay the control loop.
        println!("{:?}", arm.state());
        thread::sleep(Duration::from_millis(10));
    }
    arm.cleanup();
    Ok(())
}
