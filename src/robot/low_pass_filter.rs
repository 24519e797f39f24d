// Copyright (c) 2021 Marco Boneberger
// Licensed under the EUPL-1.2-or-later

//! Contains functions for filtering signals with a low-pass filter.
use std::f64::consts::PI;

use crate::utils::JointVector;

/// Maximum cutoff frequency: 1000 Hz
pub static MAX_CUTOFF_FREQUENCY: f64 = 1000.0;

/// Applies a first-order low-pass filter
///
/// # Arguments
/// * `sample_time` - Sample time constant
/// * `y` - Current value of the signal to be filtered
/// * `y_last` - Value of the signal to be filtered in the previous time step
/// * `cutoff_frequency` - Cutoff frequency of the low-pass filter
/// # Panics
/// This function panics if:
/// * y is infinite or NaN.
/// * y_last is infinite or NaN.
/// * cutoff_frequency is zero, negative, infinite or NaN.
/// * sample_time is negative, infinite or NaN.
/// # Return
/// Filtered value.
pub fn low_pass_filter(sample_time: f64, y: f64, y_last: f64, cutoff_frequency: f64) -> f64 {
    assert!(sample_time.is_sign_positive() && sample_time.is_finite());
    assert!(cutoff_frequency.is_sign_positive() && cutoff_frequency.is_finite());
    assert!(y.is_finite() && y_last.is_finite());
    let gain = sample_time / (sample_time + (1.0 / (2.0 * PI * cutoff_frequency)));
    gain * y + (1. - gain) * y_last
}

/// Filters a sequence of joint vectors element-wise with [`low_pass_filter`].
///
/// The first vector passes unchanged.
/// # Panics
/// Same as [`low_pass_filter`].
pub fn filter_joint_series(
    sample_time: f64,
    series: &[JointVector],
    cutoff_frequency: f64,
) -> Vec<JointVector> {
    let mut filtered: Vec<JointVector> = Vec::with_capacity(series.len());
    for y in series {
        let next = match filtered.last() {
            Some(y_last) => JointVector::from_fn(y.len(), |i, _| {
                low_pass_filter(sample_time, y[i], y_last[i], cutoff_frequency)
            }),
            None => y.clone(),
        };
        filtered.push(next);
    }
    filtered
}

#[cfg(test)]
mod tests {
    use crate::robot::low_pass_filter::{filter_joint_series, low_pass_filter};
    use crate::utils::JointVector;

    #[test]
    fn low_pass_test() {
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 1.0, 100.0) - 1.) < 0.000001);
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 1.0, 500.0) - 1.) < 0.000001);
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 1.0, 1000.0) - 1.) < 0.000001);
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 0.0, 100.0) - 0.3859) < 0.0001);
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 0.0, 500.0) - 0.7585) < 0.0001);
        assert!(f64::abs(low_pass_filter(0.001, 1.0, 0.0, 900.0) - 0.8497) < 0.0001);
    }

    #[test]
    fn joint_series_test() {
        let series = vec![
            JointVector::from_vec(vec![0., 2.]),
            JointVector::from_vec(vec![1., 2.]),
            JointVector::from_vec(vec![1., 2.]),
        ];
        let filtered = filter_joint_series(0.001, &series, 100.);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0], series[0]);
        assert!((filtered[1][0] - 0.3859).abs() < 0.0001);
        assert!(filtered[2][0] > filtered[1][0] && filtered[2][0] < 1.);
        assert!((filtered[2][1] - 2.).abs() < 1e-12);
    }
}
