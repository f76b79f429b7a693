//! Nearest-neighbour search over descriptor spaces.
//!
//! Global descriptors (one row per exemplar) are searched through a
//! randomized kd-tree forest. Clustered descriptors (several rows per
//! exemplar) are searched exhaustively and reduced to the closest cluster of
//! each exemplar.

mod cluster;
mod kdforest;
mod metric;

pub use cluster::ClusterSpace;
pub use kdforest::KdForest;
pub use metric::{ChiSquare, DescriptorMetric, MetricType, L2};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{PoseError, PoseResult};

/// A nearest-neighbour hit: exemplar index and distance.
pub type Neighbor = (usize, f32);

/// Build and search parameters of the kd-tree forests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    /// Number of randomized trees.
    pub trees: usize,
    /// Maximum number of leaf points examined per query once `k` hits are found.
    pub checks: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            trees: 4,
            checks: 256,
        }
    }
}

/// Dense row-major matrix of descriptor vectors.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct FeatureMatrix {
    cols: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    /// Create an empty matrix with `cols` columns.
    pub fn new(cols: usize) -> Self {
        Self {
            cols,
            data: Vec::new(),
        }
    }

    /// Create a matrix from raw row-major data.
    pub fn from_raw(cols: usize, data: Vec<f32>) -> PoseResult<Self> {
        let matrix = Self { cols, data };
        matrix.check_shape()?;
        Ok(matrix)
    }

    /// Append one row. The row length must equal the column count.
    pub fn push_row(&mut self, row: &[f32]) -> PoseResult<()> {
        if row.len() != self.cols {
            return Err(PoseError::Inconsistent(format!(
                "row has {} values, matrix has {} columns",
                row.len(),
                self.cols
            )));
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    /// Check that the data holds a whole number of rows.
    pub fn check_shape(&self) -> PoseResult<()> {
        if self.cols == 0 || self.data.len() % self.cols != 0 {
            return Err(PoseError::Inconsistent(format!(
                "{} values cannot be split into rows of {}",
                self.data.len(),
                self.cols
            )));
        }
        Ok(())
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    /// `true` if the matrix has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Borrow row `i`.
    ///
    /// PRECONDITION: `i < self.rows()`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Iterate over the rows.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols.max(1))
    }
}

/// Exhaustive k-nearest search, sorted by distance then index.
pub fn brute_force_knn<M: DescriptorMetric>(
    matrix: &FeatureMatrix,
    query: &[f32],
    k: usize,
) -> Vec<Neighbor> {
    let mut hits = matrix
        .iter_rows()
        .enumerate()
        .map(|(i, row)| (i, M::distance(query, row)))
        .collect::<Vec<_>>();
    sort_neighbors(&mut hits);
    hits.truncate(k);
    hits
}

pub(crate) fn sort_neighbors(hits: &mut [Neighbor]) {
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}
