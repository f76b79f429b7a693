//! Descriptor types, descriptor vectors and the extraction collaborator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vpose_3d::pointcloud::PointCloud;

use crate::error::{PoseError, PoseResult};

/// Length of a VFH (and CVFH/OURCVFH cluster) histogram.
pub const VFH_DIM: usize = 308;

/// Length of an ESF histogram.
pub const ESF_DIM: usize = 640;

/// Selector for a candidate list: one per descriptor type plus the fused list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListType {
    /// Viewpoint Feature Histogram.
    Vfh,
    /// Ensemble of Shape Functions.
    Esf,
    /// Clustered VFH.
    Cvfh,
    /// Oriented, unique and repeatable CVFH.
    OurCvfh,
    /// Fusion of the enabled descriptor lists.
    Composite,
}

impl ListType {
    /// Every list type, in storage order.
    pub const ALL: [ListType; 5] = [
        ListType::Vfh,
        ListType::Esf,
        ListType::Cvfh,
        ListType::OurCvfh,
        ListType::Composite,
    ];

    /// The descriptor list types, in fusion order.
    pub const DESCRIPTORS: [ListType; 4] = [
        ListType::Vfh,
        ListType::Esf,
        ListType::Cvfh,
        ListType::OurCvfh,
    ];

    /// Position of the list type in [`ListType::ALL`].
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// `true` for every list type but [`ListType::Composite`].
    pub fn is_descriptor(self) -> bool {
        !matches!(self, ListType::Composite)
    }

    /// `true` for the descriptors producing a variable number of clusters per exemplar.
    pub fn is_clustered(self) -> bool {
        matches!(self, ListType::Cvfh | ListType::OurCvfh)
    }

    /// Length of a descriptor vector of this type.
    pub fn dimension(self) -> Option<usize> {
        match self {
            ListType::Vfh | ListType::Cvfh | ListType::OurCvfh => Some(VFH_DIM),
            ListType::Esf => Some(ESF_DIM),
            ListType::Composite => None,
        }
    }

    /// Lowercase name used in file names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ListType::Vfh => "vfh",
            ListType::Esf => "esf",
            ListType::Cvfh => "cvfh",
            ListType::OurCvfh => "ourcvfh",
            ListType::Composite => "composite",
        }
    }
}

impl fmt::Display for ListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListType {
    type Err = PoseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ListType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PoseError::ListTypeUnsupported(s.to_string()))
    }
}

/// Set of descriptor types, used to record which lists contributed to a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorSet(u8);

impl DescriptorSet {
    /// A set with a single member.
    pub fn single(kind: ListType) -> Self {
        let mut set = Self::default();
        set.insert(kind);
        set
    }

    /// Add a list type to the set.
    pub fn insert(&mut self, kind: ListType) {
        self.0 |= 1 << kind.index();
    }

    /// Check membership.
    pub fn contains(&self, kind: ListType) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// `true` if no list type is recorded.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the members in storage order.
    pub fn iter(&self) -> impl Iterator<Item = ListType> + '_ {
        ListType::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

/// Reference frame attached to an OURCVFH cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterFrame {
    /// Axes of the cluster frame, row major.
    pub rotation: [[f32; 3]; 3],
    /// Cluster centroid.
    pub centroid: [f32; 3],
}

/// The descriptors of one cloud, as produced by a [`DescriptorExtractor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptors {
    /// Global VFH histogram.
    pub vfh: Vec<f32>,
    /// Global ESF histogram.
    pub esf: Vec<f32>,
    /// One CVFH histogram per smooth cluster.
    pub cvfh: Vec<Vec<f32>>,
    /// One OURCVFH histogram per cluster.
    pub ourcvfh: Vec<Vec<f32>>,
    /// Reference frames of the OURCVFH clusters, parallel to `ourcvfh`.
    pub ourcvfh_frames: Vec<ClusterFrame>,
}

impl Descriptors {
    /// Check every vector against the expected dimension.
    pub fn validate(&self) -> PoseResult<()> {
        check_vector(ListType::Vfh, &self.vfh)?;
        check_vector(ListType::Esf, &self.esf)?;
        for cluster in &self.cvfh {
            check_vector(ListType::Cvfh, cluster)?;
        }
        for cluster in &self.ourcvfh {
            check_vector(ListType::OurCvfh, cluster)?;
        }
        if self.ourcvfh_frames.len() != self.ourcvfh.len() {
            return Err(PoseError::Extraction(format!(
                "{} OURCVFH clusters but {} cluster frames",
                self.ourcvfh.len(),
                self.ourcvfh_frames.len()
            )));
        }
        Ok(())
    }

    /// The query vectors to search with for the given descriptor type.
    pub fn vectors(&self, kind: ListType) -> PoseResult<Vec<&[f32]>> {
        Ok(match kind {
            ListType::Vfh => vec![self.vfh.as_slice()],
            ListType::Esf => vec![self.esf.as_slice()],
            ListType::Cvfh => self.cvfh.iter().map(Vec::as_slice).collect(),
            ListType::OurCvfh => self.ourcvfh.iter().map(Vec::as_slice).collect(),
            ListType::Composite => {
                return Err(PoseError::ListTypeUnsupported(kind.to_string()))
            }
        })
    }
}

/// Check the length of a descriptor vector and that every bin is a
/// finite non-negative histogram value.
pub(crate) fn check_vector(kind: ListType, vector: &[f32]) -> PoseResult<()> {
    let expected = kind
        .dimension()
        .ok_or_else(|| PoseError::ListTypeUnsupported(kind.to_string()))?;
    if vector.len() != expected {
        return Err(PoseError::DimensionMismatch {
            descriptor: kind,
            expected,
            found: vector.len(),
        });
    }
    if let Some((bin, &value)) = vector
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || **v < 0.0)
    {
        return Err(PoseError::InvalidDescriptor {
            descriptor: kind,
            bin,
            value,
        });
    }
    Ok(())
}

/// Error type returned by descriptor extractors.
pub type ExtractorError = Box<dyn std::error::Error + Send + Sync>;

/// Computes the shape descriptors of a preprocessed cloud.
///
/// Implementations wrap the actual descriptor mathematics, this crate only
/// stores and searches the resulting vectors.
pub trait DescriptorExtractor: Send + Sync {
    /// Compute the descriptors of `cloud` observed from `viewpoint`.
    fn extract(&self, cloud: &PointCloud, viewpoint: [f64; 3]) -> Result<Descriptors, ExtractorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_type_parsing() {
        assert_eq!("VFH".parse::<ListType>().ok(), Some(ListType::Vfh));
        assert_eq!("ourcvfh".parse::<ListType>().ok(), Some(ListType::OurCvfh));
        assert!(matches!(
            "shot".parse::<ListType>(),
            Err(PoseError::ListTypeUnsupported(s)) if s == "shot"
        ));
    }

    #[test]
    fn descriptor_set_membership() {
        let mut set = DescriptorSet::single(ListType::Esf);
        set.insert(ListType::Cvfh);
        set.insert(ListType::Esf);
        assert_eq!(set.len(), 2);
        assert!(set.contains(ListType::Cvfh));
        assert!(!set.contains(ListType::Vfh));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![ListType::Esf, ListType::Cvfh]);
    }

    #[test]
    fn validate_rejects_wrong_dimension() {
        let descriptors = Descriptors {
            vfh: vec![0.0; VFH_DIM],
            esf: vec![0.0; 10],
            ..Default::default()
        };
        assert!(matches!(
            descriptors.validate(),
            Err(PoseError::DimensionMismatch {
                descriptor: ListType::Esf,
                expected: ESF_DIM,
                found: 10
            })
        ));
    }

    #[test]
    fn validate_rejects_invalid_bins() {
        let mut descriptors = Descriptors {
            vfh: vec![0.5; VFH_DIM],
            esf: vec![0.5; ESF_DIM],
            ..Default::default()
        };
        assert!(descriptors.validate().is_ok());

        descriptors.esf[3] = f32::NAN;
        assert!(matches!(
            descriptors.validate(),
            Err(PoseError::InvalidDescriptor {
                descriptor: ListType::Esf,
                bin: 3,
                ..
            })
        ));

        descriptors.esf[3] = 0.5;
        descriptors.cvfh = vec![vec![0.0; VFH_DIM]];
        descriptors.cvfh[0][7] = -1.0;
        assert!(matches!(
            descriptors.validate(),
            Err(PoseError::InvalidDescriptor {
                descriptor: ListType::Cvfh,
                bin: 7,
                value,
            }) if value == -1.0
        ));

        descriptors.cvfh[0][7] = f32::INFINITY;
        assert!(matches!(
            descriptors.validate(),
            Err(PoseError::InvalidDescriptor { bin: 7, .. })
        ));
    }

    #[test]
    fn validate_requires_one_frame_per_ourcvfh_cluster() {
        let descriptors = Descriptors {
            vfh: vec![0.0; VFH_DIM],
            esf: vec![0.0; ESF_DIM],
            ourcvfh: vec![vec![0.0; VFH_DIM]],
            ..Default::default()
        };
        assert!(matches!(descriptors.validate(), Err(PoseError::Extraction(_))));
    }
}
