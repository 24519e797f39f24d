// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Data-driven gravity torque model.
//!
//! The torque of every joint is modelled as a linear combination of
//! `[1, sin q_j, cos q_j, sin(q_0 + .. + q_j), cos(q_0 + .. + q_j)]` over all joints `j`. The
//! coefficients are fitted with ridge regularized least squares from recorded joint states.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::exception::{check_dimension, ArmException, ArmResult};
use crate::utils::JointVector;

/// Number of regressors for an arm with `dof` joints.
pub fn basis_len(dof: usize) -> usize {
    1 + 4 * dof
}

/// Evaluates the regressors at `q`.
pub fn basis(q: &JointVector) -> DVector<f64> {
    let dof = q.len();
    let mut phi = DVector::zeros(basis_len(dof));
    phi[0] = 1.;
    for j in 0..dof {
        phi[1 + 2 * j] = q[j].sin();
        phi[2 + 2 * j] = q[j].cos();
    }
    let offset = 1 + 2 * dof;
    let mut sum = 0.;
    for j in 0..dof {
        sum += q[j];
        phi[offset + 2 * j] = sum.sin();
        phi[offset + 2 * j + 1] = sum.cos();
    }
    phi
}

/// Fitted gravity model, one row of coefficients per joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GravityModel {
    coefficients: DMatrix<f64>,
}

impl GravityModel {
    /// Wraps already fitted coefficients.
    ///
    /// # Errors
    /// * [`DimensionMismatch`](`ArmException::DimensionMismatch`) if the matrix is not
    ///   `dof x basis_len(dof)`.
    pub fn from_coefficients(coefficients: DMatrix<f64>) -> ArmResult<GravityModel> {
        check_dimension(basis_len(coefficients.nrows()), coefficients.ncols())?;
        Ok(GravityModel { coefficients })
    }

    /// Fits the model to pairs of joint positions and gravity torques.
    ///
    /// # Errors
    /// * [`IdentificationIncomplete`](`ArmException::IdentificationIncomplete`) if there are
    ///   fewer samples than regressors or the normal equations cannot be solved.
    /// * [`DimensionMismatch`](`ArmException::DimensionMismatch`) if a sample does not have
    ///   `dof` entries.
    pub fn fit(
        dof: usize,
        samples: &[(JointVector, JointVector)],
        ridge: f64,
    ) -> ArmResult<GravityModel> {
        let regressors = basis_len(dof);
        if samples.len() < regressors {
            return Err(ArmException::IdentificationIncomplete {
                message: format!(
                    "{} samples recorded, at least {} required",
                    samples.len(),
                    regressors
                ),
            });
        }
        let mut phi = DMatrix::zeros(samples.len(), regressors);
        let mut tau = DMatrix::zeros(samples.len(), dof);
        for (row, (q, torque)) in samples.iter().enumerate() {
            check_dimension(dof, q.len())?;
            check_dimension(dof, torque.len())?;
            phi.row_mut(row).copy_from(&basis(q).transpose());
            tau.row_mut(row).copy_from(&torque.transpose());
        }
        let normal = phi.transpose() * &phi + DMatrix::identity(regressors, regressors) * ridge;
        let cholesky =
            normal
                .cholesky()
                .ok_or_else(|| ArmException::IdentificationIncomplete {
                    message: "excitation data does not determine the gravity model".to_string(),
                })?;
        let solution = cholesky.solve(&(phi.transpose() * tau));
        Ok(GravityModel {
            coefficients: solution.transpose(),
        })
    }

    pub fn dof(&self) -> usize {
        self.coefficients.nrows()
    }

    pub fn coefficients(&self) -> &DMatrix<f64> {
        &self.coefficients
    }

    /// Gravity torque per joint at `q`.
    pub fn torque(&self, q: &JointVector) -> ArmResult<JointVector> {
        check_dimension(self.dof(), q.len())?;
        Ok(&self.coefficients * basis(q))
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use crate::exception::ArmException;
    use crate::model::gravity::{basis, basis_len, GravityModel};
    use crate::utils::JointVector;

    fn true_gravity(q: &JointVector) -> JointVector {
        JointVector::from_vec(vec![
            0.,
            3. * q[1].cos() + 1.2 * (q[0] + q[1] + q[2]).cos(),
            1.2 * (q[0] + q[1] + q[2]).cos() - 0.3 * q[2].sin(),
        ])
    }

    #[test]
    fn basis_layout() {
        assert_eq!(basis_len(6), 25);
        let phi = basis(&JointVector::from_vec(vec![0.25, 0.5]));
        assert_eq!(phi.len(), 9);
        assert_eq!(phi[0], 1.);
        assert!((phi[1] - 0.25f64.sin()).abs() < 1e-15);
        assert!((phi[4] - 0.5f64.cos()).abs() < 1e-15);
        assert!((phi[5] - 0.25f64.sin()).abs() < 1e-15);
        assert!((phi[7] - 0.75f64.sin()).abs() < 1e-15);
        assert!((phi[8] - 0.75f64.cos()).abs() < 1e-15);
    }

    #[test]
    fn fit_recovers_torques() {
        let mut samples = Vec::new();
        let grid = |i: usize| -0.7 + 0.2 * i as f64;
        for a in 0..8 {
            for b in 0..8 {
                for c in 0..8 {
                    let q = JointVector::from_vec(vec![grid(a), grid(b), grid(c)]);
                    let tau = true_gravity(&q);
                    samples.push((q, tau));
                }
            }
        }
        let model = GravityModel::fit(3, &samples, 1e-6).unwrap();
        assert_eq!(model.coefficients().shape(), (3, 13));
        for q in [
            JointVector::from_vec(vec![0.3, 0.2, -0.1]),
            JointVector::from_vec(vec![0.7, -0.5, 0.4]),
        ] {
            let error = model.torque(&q).unwrap() - true_gravity(&q);
            assert!(error.amax() < 1e-4, "{}", error);
        }
        assert!(matches!(
            model.torque(&JointVector::zeros(2)),
            Err(ArmException::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn too_few_samples() {
        let samples = vec![(JointVector::zeros(3), JointVector::zeros(3)); 5];
        assert!(matches!(
            GravityModel::fit(3, &samples, 1e-6),
            Err(ArmException::IdentificationIncomplete { .. })
        ));
    }

    #[test]
    fn coefficient_shape_is_checked() {
        assert!(GravityModel::from_coefficients(DMatrix::zeros(2, 9)).is_ok());
        assert!(GravityModel::from_coefficients(DMatrix::zeros(2, 7)).is_err());
    }
}
