/// A point cloud with points, colors, normals and the pose of the sensor that captured it.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
    // The colors of the points.
    colors: Option<Vec<[u8; 3]>>,
    // The normals of the points.
    normals: Option<Vec<[f64; 3]>>,
    // The sensor origin, if the cloud was acquired from a known position.
    sensor_origin: Option<[f64; 3]>,
}

impl PointCloud {
    /// Create a new point cloud from points, colors (optional), and normals (optional).
    pub fn new(
        points: Vec<[f64; 3]>,
        colors: Option<Vec<[u8; 3]>>,
        normals: Option<Vec<[f64; 3]>>,
    ) -> Self {
        Self {
            points,
            colors,
            normals,
            sensor_origin: None,
        }
    }

    /// Attach the sensor origin the cloud was acquired from.
    pub fn with_sensor_origin(mut self, origin: [f64; 3]) -> Self {
        self.sensor_origin = Some(origin);
        self
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// Get as reference the normals of the points in the point cloud.
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// Get the sensor origin, if known.
    pub fn sensor_origin(&self) -> Option<[f64; 3]> {
        self.sensor_origin
    }

    /// Compute the centroid of the points, `None` for an empty cloud.
    pub fn centroid(&self) -> Option<[f64; 3]> {
        if self.points.is_empty() {
            return None;
        }
        let mut acc = [0.0; 3];
        for p in &self.points {
            acc[0] += p[0];
            acc[1] += p[1];
            acc[2] += p[2];
        }
        let n = self.points.len() as f64;
        Some([acc[0] / n, acc[1] / n, acc[2] / n])
    }

}
