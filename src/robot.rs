// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the [`Arm`](`crate::Arm`) handle and the control loop behind it.

pub mod arm;
pub mod config;
mod control_loop;
pub mod control_tools;
pub mod control_types;
pub mod error;
pub mod identification;
pub mod logger;
pub mod low_pass_filter;
pub mod robot_impl;
pub mod robot_state;
mod state_cache;
pub mod trajectory;
pub mod types;
