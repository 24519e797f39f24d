// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! contains useful type definitions and conversion functions.
use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};

/// A joint-space vector with one entry per joint.
pub type JointVector = DVector<f64>;

/// Default duration of a smoothed motion request in \[s\].
pub const DEFAULT_MOTION_DURATION: f64 = 4.0;
/// Default control rate in \[Hz\].
pub const DEFAULT_CONTROL_RATE: f64 = 300.0;

/// Quintic time scaling with zero velocity and acceleration at both ends.
///
/// # Arguments
/// * `tau` - normalized time, clamped to \[0, 1\]
/// # Return
/// `(s, ds/dtau)`
pub fn quintic_time_scaling(tau: f64) -> (f64, f64) {
    let tau = tau.clamp(0., 1.);
    let tau2 = tau * tau;
    let tau3 = tau2 * tau;
    let s = 10. * tau3 - 15. * tau3 * tau + 6. * tau3 * tau2;
    let ds = 30. * tau2 - 60. * tau3 + 30. * tau2 * tau2;
    (s, ds)
}

/// Builds a rotation from roll, pitch and yaw, `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.
pub fn euler_to_rotation(euler: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(euler[0], euler[1], euler[2])
}

/// Inverse of [`euler_to_rotation`].
pub fn rotation_to_euler(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = rotation.euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// Converts roll, pitch and yaw into a quaternion ordered `[w, x, y, z]`.
pub fn euler_to_quaternion(euler: &Vector3<f64>) -> [f64; 4] {
    let q = euler_to_rotation(euler);
    [q.w, q.i, q.j, q.k]
}

/// Converts a quaternion ordered `[w, x, y, z]` into roll, pitch and yaw.
///
/// The quaternion does not have to be normalized. A zero quaternion yields NaN angles,
/// callers validate with [`is_valid_quaternion`] first.
pub fn quaternion_to_euler(quat: &[f64; 4]) -> Vector3<f64> {
    let q = UnitQuaternion::from_quaternion(Quaternion::new(quat[0], quat[1], quat[2], quat[3]));
    rotation_to_euler(&q)
}

/// Whether the quaternion is finite and far enough from zero to be normalized.
pub fn is_valid_quaternion(quat: &[f64; 4]) -> bool {
    quat.iter().all(|x| x.is_finite()) && quat.iter().map(|x| x * x).sum::<f64>() > 1e-12
}

#[cfg(test)]
mod test {
    use crate::utils::{
        euler_to_quaternion, is_valid_quaternion, quaternion_to_euler, quintic_time_scaling,
    };
    use nalgebra::Vector3;
    use std::f64::consts::PI;

    fn slice_compare(a: &[f64], b: &[f64], thresh: f64) {
        assert_eq!(a.len(), b.len());
        for i in 0..a.len() {
            float_compare(a[i], b[i], thresh);
        }
    }

    fn float_compare(a: f64, b: f64, thresh: f64) {
        assert!((a - b).abs() < thresh, "{} != {}", a, b);
    }

    #[test]
    fn quintic_boundaries() {
        let (s0, ds0) = quintic_time_scaling(0.);
        let (s1, ds1) = quintic_time_scaling(1.);
        float_compare(s0, 0., 1e-15);
        float_compare(ds0, 0., 1e-15);
        float_compare(s1, 1., 1e-15);
        float_compare(ds1, 0., 1e-15);
        let (half, _) = quintic_time_scaling(0.5);
        float_compare(half, 0.5, 1e-15);
        // clamped outside of [0, 1]
        assert_eq!(quintic_time_scaling(1.5).0, 1.);
        assert_eq!(quintic_time_scaling(-0.5).0, 0.);
    }

    #[test]
    fn quintic_is_monotonic() {
        let mut last = 0.;
        for i in 1..=100 {
            let (s, ds) = quintic_time_scaling(i as f64 / 100.);
            assert!(s >= last);
            assert!(ds >= 0.);
            last = s;
        }
    }

    #[test]
    fn euler_quaternion_conversion() {
        let euler = Vector3::new(0.3, -0.4, 1.2);
        let quat = euler_to_quaternion(&euler);
        let back = quaternion_to_euler(&quat);
        slice_compare(euler.as_slice(), back.as_slice(), 1e-12);

        // yaw of 90 degrees around z
        let quat = euler_to_quaternion(&Vector3::new(0., 0., PI / 2.));
        slice_compare(
            &quat,
            &[f64::sqrt(0.5), 0., 0., f64::sqrt(0.5)],
            1e-12,
        );
    }

    #[test]
    fn unnormalized_quaternion_is_accepted() {
        let quat = euler_to_quaternion(&Vector3::new(0.1, 0.2, 0.3));
        let scaled = [quat[0] * 3., quat[1] * 3., quat[2] * 3., quat[3] * 3.];
        slice_compare(
            quaternion_to_euler(&scaled).as_slice(),
            &[0.1, 0.2, 0.3],
            1e-12,
        );
        assert!(is_valid_quaternion(&scaled));
        assert!(!is_valid_quaternion(&[0.; 4]));
        assert!(!is_valid_quaternion(&[f64::NAN, 0., 0., 1.]));
    }
}
