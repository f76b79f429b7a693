/// Compute the rotation matrix from an axis and angle (Rodrigues' formula).
///
/// # Arguments
///
/// * `axis` - The axis of rotation, normalized internally.
/// * `angle` - The angle of rotation in radians.
///
/// Example:
///
/// ```
/// use vpose_3d::transforms::axis_angle_to_rotation_matrix;
///
/// let rotation = axis_angle_to_rotation_matrix(&[1.0, 0.0, 0.0], std::f64::consts::FRAC_PI_2).unwrap();
/// assert!((rotation[1][2] + 1.0).abs() < 1e-12);
/// ```
pub fn axis_angle_to_rotation_matrix(
    axis: &[f64; 3],
    angle: f64,
) -> Result<[[f64; 3]; 3], &'static str> {
    let magnitude = (axis[0].powi(2) + axis[1].powi(2) + axis[2].powi(2)).sqrt();
    if magnitude < 1e-10 {
        return Err("cannot compute rotation matrix from a zero vector");
    }
    let [x, y, z] = [axis[0] / magnitude, axis[1] / magnitude, axis[2] / magnitude];

    let (s, c) = angle.sin_cos();
    let t = 1.0 - c;

    Ok([
        [c + x * x * t, x * y * t - z * s, x * z * t + y * s],
        [x * y * t + z * s, c + y * y * t, y * z * t - x * s],
        [x * z * t - y * s, y * z * t + x * s, c + z * z * t],
    ])
}

/// Rotation that brings the canonical view axis onto the viewpoint at
/// `latitude`/`longitude` (degrees): `Rz(lon) * Ry(-lat)`.
pub fn viewpoint_rotation(latitude_deg: f64, longitude_deg: f64) -> [[f64; 3]; 3] {
    let (sa, ca) = (-latitude_deg.to_radians()).sin_cos();
    let (so, co) = longitude_deg.to_radians().sin_cos();

    let ry = [[ca, 0.0, sa], [0.0, 1.0, 0.0], [-sa, 0.0, ca]];
    let rz = [[co, -so, 0.0], [so, co, 0.0], [0.0, 0.0, 1.0]];
    crate::linalg::mat33_mul(&rz, &ry)
}

/// Position of a viewpoint on the unit sphere given latitude/longitude in degrees.
pub fn viewpoint_on_sphere(latitude_deg: f64, longitude_deg: f64) -> [f64; 3] {
    let (sl, cl) = latitude_deg.to_radians().sin_cos();
    let (so, co) = longitude_deg.to_radians().sin_cos();
    [cl * co, cl * so, sl]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::transform_point;
    use approx::assert_relative_eq;

    #[test]
    fn test_axis_angle_quarter_turn() -> Result<(), Box<dyn std::error::Error>> {
        let rotation = axis_angle_to_rotation_matrix(&[2.0, 0.0, 0.0], std::f64::consts::FRAC_PI_2)?;
        let expected = [[1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]];
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(rotation[i][j], expected[i][j], epsilon = 1e-12);
            }
        }
        assert!(axis_angle_to_rotation_matrix(&[0.0; 3], 1.0).is_err());
        Ok(())
    }

    #[test]
    fn test_viewpoint_rotation_maps_x_axis() {
        for (lat, lon) in [(0.0, 0.0), (30.0, 60.0), (-45.0, 200.0), (90.0, 10.0)] {
            let r = viewpoint_rotation(lat, lon);
            let v = transform_point(&[1.0, 0.0, 0.0], &r, &[0.0; 3]);
            let expected = viewpoint_on_sphere(lat, lon);
            for i in 0..3 {
                assert_relative_eq!(v[i], expected[i], epsilon = 1e-9);
            }
        }
    }
}
