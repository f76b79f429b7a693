use kiddo::immutable::float::kdtree::ImmutableKdTree;
use vpose_3d::linalg::{mat33_mul, transform_point};

/// Kd-tree over the target points used for correspondence search.
pub(crate) type TargetTree = ImmutableKdTree<f64, u32, 3, 32>;

/// Compute the rigid transformation that maps `points_in_src` onto `points_in_dst`
/// in the least squares sense (Kabsch).
///
/// PRECONDITION: both slices have the same length, at least 3.
pub fn fit_transformation(
    points_in_src: &[[f64; 3]],
    points_in_dst: &[[f64; 3]],
    dst_r_src: &mut [[f64; 3]; 3],
    dst_t_src: &mut [f64; 3],
) {
    assert_eq!(points_in_src.len(), points_in_dst.len());
    assert!(
        points_in_src.len() >= 3,
        "Need at least 3 points for transformation estimation"
    );

    let (src_centroid, dst_centroid) = compute_centroids(points_in_src, points_in_dst);

    // compute covariance matrix H = Σ[(src - src_mean) * (dst - dst_mean)^T]
    let mut h = [[0.0f64; 3]; 3];
    for (p_src, p_dst) in points_in_src.iter().zip(points_in_dst.iter()) {
        let s = [
            p_src[0] - src_centroid[0],
            p_src[1] - src_centroid[1],
            p_src[2] - src_centroid[2],
        ];
        let d = [
            p_dst[0] - dst_centroid[0],
            p_dst[1] - dst_centroid[1],
            p_dst[2] - dst_centroid[2],
        ];
        for (i, row) in h.iter_mut().enumerate() {
            for (j, val) in row.iter_mut().enumerate() {
                *val += s[i] * d[j];
            }
        }
    }

    let h_mat = faer::Mat::<f64>::from_fn(3, 3, |i, j| h[i][j]);
    let svd = h_mat.svd();
    let u = svd.u();
    let v = svd.v();

    // R = V * U^T
    let mut r = [[0.0f64; 3]; 3];
    for (i, row) in r.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = (0..3).map(|k| v.read(i, k) * u.read(j, k)).sum();
        }
    }

    // handle the reflection case by flipping the last column of V
    if det33(&r) < 0.0 {
        for (i, row) in r.iter_mut().enumerate() {
            for (j, val) in row.iter_mut().enumerate() {
                *val = (0..3)
                    .map(|k| {
                        let sign = if k == 2 { -1.0 } else { 1.0 };
                        sign * v.read(i, k) * u.read(j, k)
                    })
                    .sum();
            }
        }
    }

    let rotated = transform_point(&src_centroid, &r, &[0.0; 3]);
    *dst_r_src = r;
    *dst_t_src = [
        dst_centroid[0] - rotated[0],
        dst_centroid[1] - rotated[1],
        dst_centroid[2] - rotated[2],
    ];
}

fn det33(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Compute the centroids of two sets of points.
///
/// # Arguments
///
/// * `points1` - A set of points.
/// * `points2` - Another set of points.
///
/// # Returns
///
/// The centroids of the two sets of points.
pub fn compute_centroids(points1: &[[f64; 3]], points2: &[[f64; 3]]) -> ([f64; 3], [f64; 3]) {
    let mean = |points: &[[f64; 3]]| {
        let mut c = [0.0; 3];
        for p in points {
            c[0] += p[0];
            c[1] += p[1];
            c[2] += p[2];
        }
        let n = points.len().max(1) as f64;
        [c[0] / n, c[1] / n, c[2] / n]
    };
    (mean(points1), mean(points2))
}

/// Find the closest target point of each source point, rejecting matches further
/// than `median + 3 * sigma` where sigma is estimated from the median absolute deviation.
///
/// Returns the matched source points, matched target points and squared distances.
pub(crate) fn find_correspondences(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    kdtree: &TargetTree,
) -> (Vec<[f64; 3]>, Vec<[f64; 3]>, Vec<f64>) {
    if source.is_empty() {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    let nn_results = source
        .iter()
        .map(|p| kdtree.nearest_one::<kiddo::SquaredEuclidean>(p))
        .collect::<Vec<_>>();

    // compute median distance
    let mut distances = nn_results.iter().map(|nn| nn.distance).collect::<Vec<_>>();
    distances.sort_by(|a, b| a.total_cmp(b));
    let median_dist = distances[distances.len() / 2];

    // compute median absolute deviation
    let mut dmed = distances
        .iter()
        .map(|d| (d - median_dist).abs())
        .collect::<Vec<_>>();
    dmed.sort_by(|a, b| a.total_cmp(b));
    let sigma_d = 1.4826 * dmed[dmed.len() / 2];

    let mut points_in_src = Vec::with_capacity(source.len());
    let mut points_in_dst = Vec::with_capacity(source.len());
    let mut kept = Vec::with_capacity(source.len());
    for (p, nn) in source.iter().zip(nn_results.iter()) {
        if nn.distance <= median_dist + 3.0 * sigma_d {
            points_in_src.push(*p);
            points_in_dst.push(target[nn.item as usize]);
            kept.push(nn.distance);
        }
    }

    (points_in_src, points_in_dst, kept)
}

/// Left-compose the incremental transform onto the accumulated one:
/// `R = R_delta * R`, `t = R_delta * t + t_delta`.
pub(crate) fn update_transformation(
    rr: &mut [[f64; 3]; 3],
    tt: &mut [f64; 3],
    rr_delta: &[[f64; 3]; 3],
    tt_delta: &[f64; 3],
) {
    *rr = mat33_mul(rr_delta, rr);
    *tt = transform_point(tt, rr_delta, tt_delta);
}
