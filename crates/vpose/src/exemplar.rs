use std::fmt;
use std::str::FromStr;

use vpose_3d::transforms::{viewpoint_on_sphere, viewpoint_rotation};

use crate::error::PoseError;

/// A parsed `<object>_<lat>_<lon>` exemplar label.
///
/// The object part may itself contain underscores, only the last two fields
/// are interpreted as latitude and longitude in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct ExemplarName {
    /// Object identifier.
    pub object: String,
    /// Latitude of the viewpoint in degrees.
    pub latitude: f64,
    /// Longitude of the viewpoint in degrees.
    pub longitude: f64,
}

impl ExemplarName {
    /// Viewpoint position on the unit sphere.
    pub fn viewpoint(&self) -> [f64; 3] {
        viewpoint_on_sphere(self.latitude, self.longitude)
    }

    /// Rotation bringing the canonical view axis onto this viewpoint.
    pub fn rotation(&self) -> [[f64; 3]; 3] {
        viewpoint_rotation(self.latitude, self.longitude)
    }
}

impl FromStr for ExemplarName {
    type Err = PoseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PoseError::InvalidNaming(s.to_string());

        let mut fields = s.rsplitn(3, '_');
        let longitude = fields.next().ok_or_else(invalid)?;
        let latitude = fields.next().ok_or_else(invalid)?;
        let object = fields.next().ok_or_else(invalid)?;
        if object.is_empty() {
            return Err(invalid());
        }

        let parse = |v: &str| {
            v.parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or_else(invalid)
        };

        Ok(Self {
            object: object.to_string(),
            latitude: parse(latitude)?,
            longitude: parse(longitude)?,
        })
    }
}

impl fmt::Display for ExemplarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.object, self.latitude, self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parse_with_underscored_object() -> Result<(), PoseError> {
        let name: ExemplarName = "coffee_mug_-30.5_120".parse()?;
        assert_eq!(name.object, "coffee_mug");
        assert_relative_eq!(name.latitude, -30.5);
        assert_relative_eq!(name.longitude, 120.0);
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_labels() {
        for label in ["mug", "mug_10", "_10_20", "mug_north_20", "mug_10_inf"] {
            assert!(
                matches!(label.parse::<ExemplarName>(), Err(PoseError::InvalidNaming(_))),
                "{label}"
            );
        }
    }

    #[test]
    fn viewpoint_on_equator() -> Result<(), PoseError> {
        let v = "box_0_90".parse::<ExemplarName>()?.viewpoint();
        assert_relative_eq!(v[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(v[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(v[2], 0.0, epsilon = 1e-12);
        Ok(())
    }
}
