//! The exemplar database: descriptor spaces, names and exemplar clouds.

mod create;
mod io;

pub use create::{CreateOptions, CreationReport, SkippedFile};

use std::collections::HashSet;
use std::sync::Arc;

use vpose_3d::pointcloud::PointCloud;

use crate::descriptor::{check_vector, ClusterFrame, Descriptors, ListType, VFH_DIM, ESF_DIM};
use crate::error::{PoseError, PoseResult};
use crate::index::{ChiSquare, ClusterSpace, FeatureMatrix, IndexParams, KdForest, Neighbor, L2};

/// One stored pose sample.
#[derive(Debug, Clone)]
pub struct Exemplar {
    /// `<object>_<lat>_<lon>` label.
    pub name: String,
    /// Descriptors computed on the exemplar cloud.
    pub descriptors: Descriptors,
    /// Preprocessed exemplar cloud, used for refinement.
    pub cloud: Option<Arc<PointCloud>>,
}

/// Immutable, indexed collection of exemplars.
///
/// `names`, the VFH and ESF rows and `clouds` are parallel. Cluster rows map
/// back to their exemplar through the owners of each [`ClusterSpace`].
#[derive(Debug)]
pub struct PoseDatabase {
    names: Vec<String>,
    vfh: KdForest<ChiSquare>,
    esf: KdForest<L2>,
    cvfh: ClusterSpace,
    ourcvfh: ClusterSpace,
    ourcvfh_frames: Vec<ClusterFrame>,
    clouds: Vec<Option<Arc<PointCloud>>>,
}

/// Raw tables a database is assembled from.
pub(crate) struct DatabaseParts {
    pub names: Vec<String>,
    pub vfh: FeatureMatrix,
    pub esf: FeatureMatrix,
    pub cvfh: FeatureMatrix,
    pub cvfh_owners: Vec<usize>,
    pub ourcvfh: FeatureMatrix,
    pub ourcvfh_owners: Vec<usize>,
    pub ourcvfh_frames: Vec<ClusterFrame>,
    pub clouds: Vec<Option<Arc<PointCloud>>>,
}

impl PoseDatabase {
    /// Build a database from in-memory exemplars.
    pub fn from_exemplars(exemplars: Vec<Exemplar>, params: IndexParams) -> PoseResult<Self> {
        let mut parts = DatabaseParts {
            names: Vec::with_capacity(exemplars.len()),
            vfh: FeatureMatrix::new(VFH_DIM),
            esf: FeatureMatrix::new(ESF_DIM),
            cvfh: FeatureMatrix::new(VFH_DIM),
            cvfh_owners: Vec::new(),
            ourcvfh: FeatureMatrix::new(VFH_DIM),
            ourcvfh_owners: Vec::new(),
            ourcvfh_frames: Vec::new(),
            clouds: Vec::with_capacity(exemplars.len()),
        };

        for (i, exemplar) in exemplars.into_iter().enumerate() {
            exemplar.descriptors.validate()?;
            let Exemplar {
                name,
                descriptors,
                cloud,
            } = exemplar;

            parts.vfh.push_row(&descriptors.vfh)?;
            parts.esf.push_row(&descriptors.esf)?;
            for cluster in &descriptors.cvfh {
                parts.cvfh.push_row(cluster)?;
                parts.cvfh_owners.push(i);
            }
            for cluster in &descriptors.ourcvfh {
                parts.ourcvfh.push_row(cluster)?;
                parts.ourcvfh_owners.push(i);
            }
            parts.ourcvfh_frames.extend(descriptors.ourcvfh_frames);
            parts.names.push(name);
            parts.clouds.push(cloud);
        }

        Self::from_parts(parts, params)
    }

    pub(crate) fn from_parts(parts: DatabaseParts, params: IndexParams) -> PoseResult<Self> {
        let n = parts.names.len();
        let mismatch = |what: &str, found: usize| {
            PoseError::Inconsistent(format!("{what} has {found} entries, expected {n}"))
        };

        let mut seen = HashSet::with_capacity(n);
        for name in &parts.names {
            if !seen.insert(name.as_str()) {
                return Err(PoseError::DuplicateExemplar(name.clone()));
            }
        }
        if parts.vfh.rows() != n {
            return Err(mismatch("VFH matrix", parts.vfh.rows()));
        }
        if parts.esf.rows() != n {
            return Err(mismatch("ESF matrix", parts.esf.rows()));
        }
        if parts.clouds.len() != n {
            return Err(mismatch("cloud list", parts.clouds.len()));
        }
        if parts.ourcvfh_frames.len() != parts.ourcvfh.rows() {
            return Err(PoseError::Inconsistent(format!(
                "{} OURCVFH rows but {} cluster frames",
                parts.ourcvfh.rows(),
                parts.ourcvfh_frames.len()
            )));
        }
        for (kind, matrix, owners) in [
            (ListType::Cvfh, &parts.cvfh, &parts.cvfh_owners),
            (ListType::OurCvfh, &parts.ourcvfh, &parts.ourcvfh_owners),
        ] {
            if matrix.cols() != VFH_DIM {
                return Err(PoseError::DimensionMismatch {
                    descriptor: kind,
                    expected: VFH_DIM,
                    found: matrix.cols(),
                });
            }
            if let Some(bad) = owners.iter().find(|o| **o >= n) {
                return Err(PoseError::Inconsistent(format!(
                    "{kind} cluster refers to exemplar {bad}, database has {n}"
                )));
            }
        }
        for (kind, matrix) in [(ListType::Vfh, &parts.vfh), (ListType::Esf, &parts.esf)] {
            let expected = kind.dimension().unwrap_or_default();
            if matrix.cols() != expected {
                return Err(PoseError::DimensionMismatch {
                    descriptor: kind,
                    expected,
                    found: matrix.cols(),
                });
            }
        }

        for (kind, matrix) in [
            (ListType::Vfh, &parts.vfh),
            (ListType::Esf, &parts.esf),
            (ListType::Cvfh, &parts.cvfh),
            (ListType::OurCvfh, &parts.ourcvfh),
        ] {
            for row in matrix.iter_rows() {
                check_vector(kind, row)?;
            }
        }

        let cvfh = ClusterSpace::new(parts.cvfh, parts.cvfh_owners).map_err(PoseError::Inconsistent)?;
        let ourcvfh =
            ClusterSpace::new(parts.ourcvfh, parts.ourcvfh_owners).map_err(PoseError::Inconsistent)?;

        Ok(Self {
            names: parts.names,
            vfh: KdForest::build(parts.vfh, params),
            esf: KdForest::build(parts.esf, params),
            cvfh,
            ourcvfh,
            ourcvfh_frames: parts.ourcvfh_frames,
            clouds: parts.clouds,
        })
    }

    /// Number of exemplars.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// `true` if the database holds no exemplar.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exemplar names, in storage order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Name of exemplar `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Storage index of the exemplar called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Shared view of the cloud of exemplar `index`, if stored.
    pub fn cloud(&self, index: usize) -> Option<&Arc<PointCloud>> {
        self.clouds.get(index).and_then(Option::as_ref)
    }

    /// The kd-tree build and search parameters.
    pub fn index_params(&self) -> IndexParams {
        self.vfh.params()
    }

    /// Descriptor rows of the given type.
    pub fn matrix(&self, kind: ListType) -> PoseResult<&FeatureMatrix> {
        match kind {
            ListType::Vfh => Ok(self.vfh.matrix()),
            ListType::Esf => Ok(self.esf.matrix()),
            ListType::Cvfh => Ok(self.cvfh.matrix()),
            ListType::OurCvfh => Ok(self.ourcvfh.matrix()),
            ListType::Composite => Err(PoseError::ListTypeUnsupported(kind.to_string())),
        }
    }

    /// Owning exemplar of every cluster row of a clustered descriptor.
    pub fn cluster_owners(&self, kind: ListType) -> PoseResult<&[usize]> {
        match kind {
            ListType::Cvfh => Ok(self.cvfh.owners()),
            ListType::OurCvfh => Ok(self.ourcvfh.owners()),
            _ => Err(PoseError::ListTypeUnsupported(kind.to_string())),
        }
    }

    /// Reference frames of the OURCVFH cluster rows.
    pub fn ourcvfh_frames(&self) -> &[ClusterFrame] {
        &self.ourcvfh_frames
    }

    /// The `k` exemplars closest to `vector`, ascending by distance, ties by index.
    pub fn query(&self, kind: ListType, vector: &[f32], k: usize) -> PoseResult<Vec<Neighbor>> {
        self.query_clusters(kind, &[vector], k)
    }

    /// Like [`PoseDatabase::query`] with several query vectors.
    ///
    /// For clustered descriptors an exemplar scores the minimum distance over
    /// all query/stored cluster pairs. Global descriptors accept exactly one vector.
    pub fn query_clusters(
        &self,
        kind: ListType,
        vectors: &[&[f32]],
        k: usize,
    ) -> PoseResult<Vec<Neighbor>> {
        if !kind.is_descriptor() {
            return Err(PoseError::ListTypeUnsupported(kind.to_string()));
        }
        for v in vectors {
            check_vector(kind, v)?;
        }

        let hits = match kind {
            ListType::Vfh | ListType::Esf => {
                let [vector] = vectors else {
                    return Err(PoseError::Extraction(format!(
                        "{kind} expects one query vector, got {}",
                        vectors.len()
                    )));
                };
                if kind == ListType::Vfh {
                    self.vfh.knn(vector, k)
                } else {
                    self.esf.knn(vector, k)
                }
            }
            ListType::Cvfh => self.cvfh.search(vectors, self.len(), k),
            _ => self.ourcvfh.search(vectors, self.len(), k),
        };

        log::debug!("{kind} query returned {} of {k} requested neighbours", hits.len());
        Ok(hits)
    }

    /// Query with the vectors of `kind` taken from a descriptor set.
    pub fn query_descriptors(
        &self,
        kind: ListType,
        descriptors: &Descriptors,
        k: usize,
    ) -> PoseResult<Vec<Neighbor>> {
        let vectors = descriptors.vectors(kind)?;
        self.query_clusters(kind, &vectors, k)
    }
}
