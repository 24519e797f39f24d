// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains the calibration tables and the kinematic model of the arm.
//!
//! An arm is described by three tables:
//! * a signed permutation matrix `P` mapping motor coordinates onto joint coordinates,
//!   `q_joint = P * q_motor`,
//! * Denavit-Hartenberg parameters `pi_b` with one row `[a, alpha, d, theta_offset]` per joint and
//!   an optional last row describing the tool frame relative to the flange,
//! * friction parameters `pi_fr` with one row `[viscous, coulomb]` per joint.
use nalgebra::{DMatrix, DVector, Isometry3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::exception::{calibration_error, check_dimension, ArmException, ArmResult};
use crate::robot::robot_state::CartesianPose;
use crate::utils::JointVector;

pub mod gravity;

/// Number of DH parameters per row.
const DH_COLUMNS: usize = 4;
/// Number of friction parameters per row.
const FRICTION_COLUMNS: usize = 2;
/// Velocity scale of the smoothed Coulomb friction in \[rad/s\].
const COULOMB_SMOOTHING: f64 = 0.01;

/// Validated calibration tables of one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    permutation: DMatrix<f64>,
    pi_b: DMatrix<f64>,
    pi_fr: DMatrix<f64>,
}

impl CalibrationModel {
    /// Validates and stores the calibration tables.
    ///
    /// # Errors
    /// * [`CalibrationLoadError`](`ArmException::CalibrationLoadError`) if
    ///   - `permutation` is not a square signed permutation matrix,
    ///   - `pi_b` does not have 4 columns and N or N+1 rows,
    ///   - `pi_fr` does not have 2 columns and N rows,
    ///   - any entry is not finite.
    pub fn new(
        permutation: DMatrix<f64>,
        pi_b: DMatrix<f64>,
        pi_fr: DMatrix<f64>,
    ) -> ArmResult<CalibrationModel> {
        let dof = permutation.nrows();
        if dof == 0 || permutation.ncols() != dof {
            return Err(calibration_error(format!(
                "permutation matrix must be square and non-empty, got {}x{}",
                permutation.nrows(),
                permutation.ncols()
            )));
        }
        for (name, table) in [
            ("permutation", &permutation),
            ("pi_b", &pi_b),
            ("pi_fr", &pi_fr),
        ] {
            if table.iter().any(|x| !x.is_finite()) {
                return Err(calibration_error(format!(
                    "{} contains non-finite entries",
                    name
                )));
            }
        }
        check_signed_permutation(&permutation)?;
        if pi_b.ncols() != DH_COLUMNS || (pi_b.nrows() != dof && pi_b.nrows() != dof + 1) {
            return Err(calibration_error(format!(
                "pi_b must be {}x{} or {}x{}, got {}x{}",
                dof,
                DH_COLUMNS,
                dof + 1,
                DH_COLUMNS,
                pi_b.nrows(),
                pi_b.ncols()
            )));
        }
        if pi_fr.ncols() != FRICTION_COLUMNS || pi_fr.nrows() != dof {
            return Err(calibration_error(format!(
                "pi_fr must be {}x{}, got {}x{}",
                dof,
                FRICTION_COLUMNS,
                pi_fr.nrows(),
                pi_fr.ncols()
            )));
        }
        Ok(CalibrationModel {
            permutation,
            pi_b,
            pi_fr,
        })
    }

    /// Builds the model from row-major tables, e.g. parsed from a CSV file.
    ///
    /// # Errors
    /// Same as [`new`](`Self::new`). Additionally fails if the rows of a table differ in length.
    pub fn from_tables(
        permutation: &[Vec<f64>],
        pi_b: &[Vec<f64>],
        pi_fr: &[Vec<f64>],
    ) -> ArmResult<CalibrationModel> {
        CalibrationModel::new(
            table_to_matrix("permutation", permutation)?,
            table_to_matrix("pi_b", pi_b)?,
            table_to_matrix("pi_fr", pi_fr)?,
        )
    }

    /// Number of joints.
    pub fn dof(&self) -> usize {
        self.permutation.nrows()
    }

    pub fn permutation(&self) -> &DMatrix<f64> {
        &self.permutation
    }

    pub fn pi_b(&self) -> &DMatrix<f64> {
        &self.pi_b
    }

    pub fn pi_fr(&self) -> &DMatrix<f64> {
        &self.pi_fr
    }
}

fn table_to_matrix(name: &str, rows: &[Vec<f64>]) -> ArmResult<DMatrix<f64>> {
    let columns = rows.first().map_or(0, |row| row.len());
    if rows.is_empty() || columns == 0 {
        return Err(calibration_error(format!("{} is empty", name)));
    }
    if let Some(row) = rows.iter().position(|row| row.len() != columns) {
        return Err(calibration_error(format!(
            "{}: row {} has {} entries, expected {}",
            name,
            row,
            rows[row].len(),
            columns
        )));
    }
    Ok(DMatrix::from_fn(rows.len(), columns, |i, j| rows[i][j]))
}

fn check_signed_permutation(permutation: &DMatrix<f64>) -> ArmResult<()> {
    const EPS: f64 = 1e-9;
    if permutation
        .iter()
        .any(|x| x.abs() > EPS && (x.abs() - 1.).abs() > EPS)
    {
        return Err(calibration_error(
            "permutation entries must be -1, 0 or 1",
        ));
    }
    let nonzero = |values: Vec<f64>| values.iter().filter(|x| x.abs() > EPS).count();
    for i in 0..permutation.nrows() {
        if nonzero(permutation.row(i).iter().copied().collect()) != 1
            || nonzero(permutation.column(i).iter().copied().collect()) != 1
        {
            return Err(calibration_error(format!(
                "permutation row/column {} must contain exactly one non-zero entry",
                i
            )));
        }
    }
    Ok(())
}

/// One row of Denavit-Hartenberg parameters.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhLink {
    pub a: f64,
    pub alpha: f64,
    pub d: f64,
    pub theta_offset: f64,
}

impl DhLink {
    /// Transformation from the previous frame into this one, `Rz(theta) Tz(d) Tx(a) Rx(alpha)`.
    pub fn transform(&self, q: f64) -> Isometry3<f64> {
        let z = Isometry3::from_parts(
            Translation3::new(0., 0., self.d),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q + self.theta_offset),
        );
        let x = Isometry3::from_parts(
            Translation3::new(self.a, 0., 0.),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), self.alpha),
        );
        z * x
    }
}

/// Tuning of the damped least squares inverse kinematics.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct IkParameters {
    /// Iteration limit before a pose is considered unreachable.
    pub max_iterations: usize,
    /// Norm of the stacked position \[m\] and orientation \[rad\] error accepted as converged.
    pub tolerance: f64,
    /// Damping factor lambda of `J^T (J J^T + lambda^2 I)^-1`.
    pub damping: f64,
    /// Largest joint change per iteration in \[rad\].
    pub max_step: f64,
    /// Smallest accepted ratio between smallest and largest singular value at the seed.
    pub singular_threshold: f64,
}

impl Default for IkParameters {
    fn default() -> Self {
        IkParameters {
            max_iterations: 500,
            tolerance: 1e-9,
            damping: 1e-2,
            max_step: 0.2,
            singular_threshold: 1e-5,
        }
    }
}

/// Forward and inverse kinematics, friction model and motor/joint mapping of one arm.
#[derive(Debug, Clone)]
pub struct KinematicModel {
    calibration: CalibrationModel,
    links: Vec<DhLink>,
    tool: Isometry3<f64>,
    ik: IkParameters,
}

impl KinematicModel {
    pub fn new(calibration: CalibrationModel) -> KinematicModel {
        KinematicModel::with_ik_parameters(calibration, IkParameters::default())
    }

    pub fn with_ik_parameters(calibration: CalibrationModel, ik: IkParameters) -> KinematicModel {
        let dof = calibration.dof();
        let row = |i: usize| DhLink {
            a: calibration.pi_b[(i, 0)],
            alpha: calibration.pi_b[(i, 1)],
            d: calibration.pi_b[(i, 2)],
            theta_offset: calibration.pi_b[(i, 3)],
        };
        let links = (0..dof).map(row).collect();
        let tool = if calibration.pi_b.nrows() > dof {
            row(dof).transform(0.)
        } else {
            Isometry3::identity()
        };
        KinematicModel {
            calibration,
            links,
            tool,
            ik,
        }
    }

    pub fn dof(&self) -> usize {
        self.links.len()
    }

    pub fn calibration(&self) -> &CalibrationModel {
        &self.calibration
    }

    pub fn links(&self) -> &[DhLink] {
        &self.links
    }

    /// Tool frame relative to the flange.
    pub fn tool(&self) -> &Isometry3<f64> {
        &self.tool
    }

    /// Poses of the base frame followed by the frame of every joint, in base coordinates.
    /// The last entry is the flange.
    pub fn joint_frames(&self, q: &JointVector) -> ArmResult<Vec<Isometry3<f64>>> {
        check_dimension(self.dof(), q.len())?;
        Ok(self.frames(q))
    }

    fn frames(&self, q: &JointVector) -> Vec<Isometry3<f64>> {
        let mut frames = Vec::with_capacity(self.dof() + 1);
        let mut transform = Isometry3::identity();
        frames.push(transform);
        for (link, &q_i) in self.links.iter().zip(q.iter()) {
            transform *= link.transform(q_i);
            frames.push(transform);
        }
        frames
    }

    fn end_effector(&self, frames: &[Isometry3<f64>]) -> Isometry3<f64> {
        frames.last().copied().unwrap_or_else(Isometry3::identity) * self.tool
    }

    /// End effector pose in the base frame.
    pub fn end_effector_isometry(&self, q: &JointVector) -> ArmResult<Isometry3<f64>> {
        check_dimension(self.dof(), q.len())?;
        Ok(self.end_effector(&self.frames(q)))
    }

    /// End effector position and roll/pitch/yaw orientation.
    pub fn forward_kinematics(&self, q: &JointVector) -> ArmResult<CartesianPose> {
        Ok(CartesianPose::from_isometry(&self.end_effector_isometry(q)?))
    }

    /// Geometric Jacobian of the end effector, 6xN, linear rows first.
    pub fn jacobian(&self, q: &JointVector) -> ArmResult<DMatrix<f64>> {
        check_dimension(self.dof(), q.len())?;
        Ok(self.jacobian_unchecked(q))
    }

    fn jacobian_unchecked(&self, q: &JointVector) -> DMatrix<f64> {
        let frames = self.frames(q);
        let p_ee = self.end_effector(&frames).translation.vector;
        let mut jacobian = DMatrix::zeros(6, self.dof());
        for (i, frame) in frames.iter().take(self.dof()).enumerate() {
            let z = frame.rotation * Vector3::z();
            let linear = z.cross(&(p_ee - frame.translation.vector));
            jacobian.fixed_view_mut::<3, 1>(0, i).copy_from(&linear);
            jacobian.fixed_view_mut::<3, 1>(3, i).copy_from(&z);
        }
        jacobian
    }

    /// Ratio between the smallest and the largest singular value of the Jacobian.
    pub fn inverse_condition(&self, q: &JointVector) -> ArmResult<f64> {
        let singular_values = self.jacobian(q)?.svd(false, false).singular_values;
        let max = singular_values.max();
        if max <= f64::EPSILON {
            return Ok(0.);
        }
        Ok(singular_values.min() / max)
    }

    /// Solves for the joint positions reaching `target`, starting the iteration at `seed`.
    ///
    /// # Errors
    /// * [`DimensionMismatch`](`ArmException::DimensionMismatch`) if `seed` has the wrong length.
    /// * [`KinematicsSingular`](`ArmException::KinematicsSingular`) if the Jacobian at `seed` is
    ///   ill-conditioned.
    /// * [`KinematicsUnreachable`](`ArmException::KinematicsUnreachable`) if the iteration does
    ///   not converge.
    pub fn inverse_kinematics(
        &self,
        target: &Isometry3<f64>,
        seed: &JointVector,
    ) -> ArmResult<JointVector> {
        let condition = self.inverse_condition(seed)?;
        if condition < self.ik.singular_threshold {
            return Err(ArmException::KinematicsSingular { condition });
        }
        let mut q = seed.clone();
        let mut residual = f64::INFINITY;
        let damping = DMatrix::identity(6, 6) * self.ik.damping.powi(2);
        for _ in 0..self.ik.max_iterations {
            let error = pose_error(target, &self.end_effector(&self.frames(&q)));
            residual = error.norm();
            if residual < self.ik.tolerance {
                return Ok(q);
            }
            let jacobian = self.jacobian_unchecked(&q);
            let cholesky = match (&jacobian * jacobian.transpose() + &damping).cholesky() {
                Some(cholesky) => cholesky,
                None => break,
            };
            let mut step = jacobian.transpose()
                * cholesky.solve(&DVector::from_column_slice(error.as_slice()));
            let largest = step.amax();
            if largest > self.ik.max_step {
                step *= self.ik.max_step / largest;
            }
            q += step;
        }
        Err(ArmException::KinematicsUnreachable {
            iterations: self.ik.max_iterations,
            residual,
        })
    }

    /// Maps motor coordinates onto joint coordinates. Used for positions, velocities and torques.
    pub fn motor_to_joint(&self, motor: &DVector<f64>) -> JointVector {
        &self.calibration.permutation * motor
    }

    /// Inverse of [`motor_to_joint`](`Self::motor_to_joint`).
    pub fn joint_to_motor(&self, joint: &JointVector) -> DVector<f64> {
        self.calibration.permutation.transpose() * joint
    }

    /// Friction torque `fv * dq + fc * tanh(dq / 0.01)` per joint.
    pub fn friction_torque(&self, dq: &JointVector) -> JointVector {
        let pi_fr = &self.calibration.pi_fr;
        JointVector::from_fn(dq.len().min(self.dof()), |i, _| {
            pi_fr[(i, 0)] * dq[i] + pi_fr[(i, 1)] * (dq[i] / COULOMB_SMOOTHING).tanh()
        })
    }
}

/// Stacked position and orientation error from `current` towards `target` in base coordinates.
fn pose_error(target: &Isometry3<f64>, current: &Isometry3<f64>) -> Vector6<f64> {
    let position = target.translation.vector - current.translation.vector;
    let orientation = (target.rotation * current.rotation.inverse()).scaled_axis();
    Vector6::new(
        position.x,
        position.y,
        position.z,
        orientation.x,
        orientation.y,
        orientation.z,
    )
}
