// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains exception and Result definitions
use crate::network::BusError;
use crate::robot::logger::Record;
use thiserror::Error;

/// Represents all kind of errors which can occur while configuring or controlling the arm.
#[derive(Error, Debug, Clone)]
pub enum ArmException {
    /// The calibration tables are malformed, e.g. wrong dimensions, a permutation matrix which
    /// is not a signed permutation or non-finite entries.
    #[error("calibration error: {message}")]
    CalibrationLoadError { message: String },

    /// The arm or gripper configuration holds values the control loop cannot run with.
    #[error("invalid configuration: {message}")]
    ConfigurationError { message: String },

    /// The bus could not be opened or the drives did not answer while the arm was brought up.
    #[error("could not open bus: {message}")]
    BusOpenError { message: String },

    /// A motion request was malformed, e.g. a non-positive duration or control rate.
    #[error("invalid trajectory request: {message}")]
    InvalidTrajectoryRequest { message: String },

    /// A vector argument does not have one entry per joint.
    #[error("dimension mismatch: expected {expected} values but got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Inverse kinematics did not converge.
    #[error("pose unreachable: residual {residual:e} after {iterations} iterations")]
    KinematicsUnreachable {
        /// Number of iterations spent.
        iterations: usize,
        /// Norm of the remaining pose error.
        residual: f64,
    },

    /// The Jacobian is ill-conditioned at the seed configuration.
    #[error("singular configuration: inverse condition number {condition:e}")]
    KinematicsSingular {
        /// Ratio between the smallest and the largest singular value.
        condition: f64,
    },

    /// The gravity identification was interrupted before all samples were recorded.
    /// The previously installed gravity model is left untouched.
    #[error("gravity identification incomplete: {message}")]
    IdentificationIncomplete { message: String },

    /// A setpoint lies outside of the range a drive can encode, e.g. a joint target beyond the
    /// position range or a gripper target beyond its travel.
    #[error("value {value} out of range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// A gripper command was issued although the arm was configured without a gripper.
    #[error("no gripper configured")]
    NoGripper,

    /// ControlException is returned while the control loop is faulted. It holds the last
    /// commands and states recorded before the fault. The number of recorded states can be
    /// configured with [`ArmConfig::log_size`](`crate::ArmConfig::log_size`).
    #[error("{error}")]
    ControlException {
        /// Vector of states and commands logged just before the fault occurred.
        log: Option<Vec<Record>>,
        /// Explanatory string.
        error: String,
    },

    /// A transport error which was reported directly to the caller.
    #[error("transport error: {0}")]
    Transport(#[from] BusError),

    /// The arm handle was shut down with [`cleanup`](`crate::Arm::cleanup`).
    #[error("arm handle was shut down")]
    Shutdown,

    /// RealTimeException is returned if the real-time priority cannot be set
    #[error("{message:?}")]
    RealTimeException { message: String },
}

/// creates an InvalidTrajectoryRequest from a string slice
pub(crate) fn invalid_request(message: &str) -> ArmException {
    ArmException::InvalidTrajectoryRequest {
        message: message.to_string(),
    }
}

/// creates a CalibrationLoadError from a string slice
pub(crate) fn calibration_error(message: impl Into<String>) -> ArmException {
    ArmException::CalibrationLoadError {
        message: message.into(),
    }
}

/// Fails with DimensionMismatch unless `actual == expected`.
pub(crate) fn check_dimension(expected: usize, actual: usize) -> ArmResult<()> {
    if expected != actual {
        return Err(ArmException::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Result type which can have ArmException as Error
pub type ArmResult<T> = Result<T, ArmException>;
