use std::fmt::Debug;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Distance metric used to search a descriptor space.
pub trait DescriptorMetric: Clone + Copy + Debug + Send + Sync + 'static {
    /// Distance between two descriptors of the same length.
    fn distance(a: &[f32], b: &[f32]) -> f32;

    /// Contribution of a single coordinate to the distance.
    ///
    /// Used as a lower bound for the distance to any point on the far side of
    /// a kd-tree split. Must be monotonic in `|a - b|` for non-negative inputs.
    fn axis_distance(a: f32, b: f32) -> f32;

    /// Returns the identifier for the metric type.
    fn metric_type() -> MetricType;
}

/// Supported distance metric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum MetricType {
    /// Chi-square histogram distance.
    ChiSquare,
    /// Squared Euclidean distance.
    L2,
}

/// Chi-square distance `Σ (a-b)²/(a+b)` between histograms.
///
/// Bins empty in both histograms are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChiSquare;

impl DescriptorMetric for ChiSquare {
    #[inline(always)]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| Self::axis_distance(x, y))
            .sum()
    }

    #[inline(always)]
    fn axis_distance(a: f32, b: f32) -> f32 {
        let sum = a + b;
        if sum > 0.0 {
            let diff = a - b;
            diff * diff / sum
        } else {
            0.0
        }
    }

    #[inline(always)]
    fn metric_type() -> MetricType {
        MetricType::ChiSquare
    }
}

/// Squared L2 (Euclidean) distance.
#[derive(Clone, Copy, Debug, Default)]
pub struct L2;

impl DescriptorMetric for L2 {
    #[inline(always)]
    fn distance(a: &[f32], b: &[f32]) -> f32 {
        let mut dist_sq = 0.0;
        for (x, y) in a.iter().zip(b.iter()) {
            let diff = x - y;
            dist_sq += diff * diff;
        }
        dist_sq
    }

    #[inline(always)]
    fn axis_distance(a: f32, b: f32) -> f32 {
        let diff = a - b;
        diff * diff
    }

    #[inline(always)]
    fn metric_type() -> MetricType {
        MetricType::L2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chi_square_distance() {
        let a = [1.0, 0.0, 2.0, 0.0];
        let b = [3.0, 0.0, 2.0, 1.0];
        // (1-3)²/4 + 0 (skipped) + 0 + 1/1
        assert_relative_eq!(ChiSquare::distance(&a, &b), 2.0);
        assert_relative_eq!(ChiSquare::distance(&a, &a), 0.0);
    }

    #[test]
    fn test_chi_square_symmetric() {
        let a = [0.3, 0.1, 0.6];
        let b = [0.2, 0.5, 0.3];
        assert_relative_eq!(ChiSquare::distance(&a, &b), ChiSquare::distance(&b, &a));
    }

    #[test]
    fn test_l2_is_squared() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 2.0, 2.0];
        assert_relative_eq!(L2::distance(&a, &b), 9.0);
    }

    #[test]
    fn test_axis_distance_is_lower_bound() {
        let a = [0.5, 0.2, 0.9];
        let b = [0.1, 0.4, 0.3];
        for i in 0..3 {
            assert!(ChiSquare::axis_distance(a[i], b[i]) <= ChiSquare::distance(&a, &b));
            assert!(L2::axis_distance(a[i], b[i]) <= L2::distance(&a, &b));
        }
    }
}
