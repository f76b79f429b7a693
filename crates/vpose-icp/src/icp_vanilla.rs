use crate::ops::{find_correspondences, fit_transformation, update_transformation, TargetTree};
use vpose_3d::{linalg::transform_points, pointcloud::PointCloud};

/// Errors raised by the ICP solver.
#[derive(Debug, thiserror::Error)]
pub enum IcpError {
    /// One of the input clouds has no points.
    #[error("ICP input cloud is empty")]
    EmptyCloud,

    /// Not enough correspondences survived outlier rejection to fit a transform.
    #[error("Only {0} correspondences found, at least 3 are required")]
    NotEnoughCorrespondences(usize),

    /// The estimated transformation contains non finite values.
    #[error("ICP produced a non finite transformation")]
    NonFinite,
}

/// Result of the ICP algorithm.
///
/// The transformation is from the source to the target frame.
#[derive(Debug, Clone)]
pub struct IcpResult {
    /// Estimated rotation matrix.
    pub rotation: [[f64; 3]; 3],
    /// Estimated translation vector.
    pub translation: [f64; 3],
    /// The total number of iterations performed.
    pub num_iterations: usize,
    /// last computed RMSE.
    pub rmse: f64,
    /// Whether the RMSE change dropped below the tolerance before running out of iterations.
    pub converged: bool,
}

/// Structure to define the ICP parameters.
#[derive(Debug, Clone)]
pub struct IcpConvergenceCriteria {
    /// Maximum number of iterations to perform.
    pub max_iterations: usize,
    /// Convergence tolerance as the difference in RMSE between two consecutive iterations.
    pub tolerance: f64,
}

impl Default for IcpConvergenceCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-6,
        }
    }
}

/// Iterative Closest Point (ICP) algorithm using point to point distance.
///
/// # Arguments
///
/// * `source` - Source point cloud.
/// * `target` - Target point cloud.
/// * `initial_rot` - Initial rotation matrix. This is the rotation from the source to the target frame.
/// * `initial_trans` - Initial translation vector. This is the translation from the source to the target frame.
/// * `criteria` - Convergence criteria.
///
/// # Returns
///
/// * `result` - Result of the ICP algorithm containing the rotation, translation, and number of iterations.
pub fn icp_vanilla(
    source: &PointCloud,
    target: &PointCloud,
    initial_rot: [[f64; 3]; 3],
    initial_trans: [f64; 3],
    criteria: &IcpConvergenceCriteria,
) -> Result<IcpResult, IcpError> {
    if source.is_empty() || target.is_empty() {
        return Err(IcpError::EmptyCloud);
    }

    let mut result = IcpResult {
        rotation: initial_rot,
        translation: initial_trans,
        num_iterations: 0,
        rmse: f64::INFINITY,
        converged: false,
    };

    // build kdtree for target points to speed up the nearest neighbor search
    let kdtree: TargetTree = TargetTree::new_from_slice(target.points());

    // bring the source into the target frame with the initial guess
    let mut current_source = vec![[0.0; 3]; source.len()];
    transform_points(
        source.points(),
        &result.rotation,
        &result.translation,
        &mut current_source,
    );
    let mut transformed_points = vec![[0.0; 3]; source.len()];

    for i in 0..criteria.max_iterations {
        log::debug!("Iteration: {}", i);

        let (current_source_match, current_target_match, distances) =
            find_correspondences(&current_source, target.points(), &kdtree);

        if current_source_match.len() < 3 {
            return Err(IcpError::NotEnoughCorrespondences(
                current_source_match.len(),
            ));
        }

        let rmse = (distances.iter().sum::<f64>() / distances.len() as f64).sqrt();
        result.num_iterations += 1;

        if (result.rmse - rmse).abs() < criteria.tolerance {
            log::debug!("ICP converged in {} iterations with error {}", i, rmse);
            result.rmse = rmse;
            result.converged = true;
            break;
        }
        result.rmse = rmse;

        let mut rr_delta = [[0.0; 3]; 3];
        let mut tt_delta = [0.0; 3];
        fit_transformation(
            &current_source_match,
            &current_target_match,
            &mut rr_delta,
            &mut tt_delta,
        );

        transform_points(
            &current_source,
            &rr_delta,
            &tt_delta,
            &mut transformed_points,
        );
        std::mem::swap(&mut current_source, &mut transformed_points);

        update_transformation(
            &mut result.rotation,
            &mut result.translation,
            &rr_delta,
            &tt_delta,
        );
    }

    // the last update moved the source, measure the error of the returned pose
    if !result.converged && result.num_iterations > 0 {
        let (_, _, distances) = find_correspondences(&current_source, target.points(), &kdtree);
        if distances.len() < 3 {
            return Err(IcpError::NotEnoughCorrespondences(distances.len()));
        }
        result.rmse = (distances.iter().sum::<f64>() / distances.len() as f64).sqrt();
    }

    let finite = result.rmse.is_finite()
        && result.translation.iter().all(|v| v.is_finite())
        && result.rotation.iter().flatten().all(|v| v.is_finite());
    if !finite {
        return Err(IcpError::NonFinite);
    }

    Ok(result)
}
